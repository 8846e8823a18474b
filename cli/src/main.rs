mod reader;

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use dialoguer::{Confirm, Password};
use nfctag::auth::Cipher;
use nfctag::clone::{self, TagDump};
use nfctag::tag::desfire::PICC;
use nfctag::{
    Credentials, NdefMessage, NdefRecord, OperationKind, Range, Session, TagFamily, TagInfo,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::reader::{VirtualBench, VirtualKind};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    Tag(#[from] nfctag::Error),

    #[error("Failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid hex string: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("No reader named '{0}' is known")]
    UnknownReader(String),

    #[error("Expected {expected} bytes, got {actual}")]
    Length { expected: usize, actual: usize },

    #[error("Aborted by the user")]
    Aborted,
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Parser)]
#[command(name = "nfctag", about = "Inspect, read, write, lock and clone NFC tags", version)]
struct Cli {
    /// Reader to use, matched against the catalogue by name. Tries every backend when omitted.
    #[arg(short, long, global = true)]
    reader: Option<String>,

    /// JSON file with additional reader descriptors.
    #[arg(long, global = true)]
    readers: Option<PathBuf>,

    /// Timeout of one exchange with the tag.
    #[arg(long, global = true)]
    timeout_ms: Option<u64>,

    /// Seconds to wait for a tag.
    #[arg(long, global = true, default_value_t = 10)]
    wait: u64,

    /// Runs against an in-process reader holding a tag of this kind.
    #[arg(long = "virtual", global = true, value_enum)]
    virtual_tag: Option<VirtualKind>,

    /// Prints results as JSON.
    #[arg(long, global = true)]
    json: bool,

    /// Skips confirmation of irreversible operations.
    #[arg(short, long, global = true)]
    yes: bool,

    /// More logs: -v for info, -vv for debug.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Lists the known readers.
    Readers,

    /// Shows the family, UID and memory of the tag.
    Info,

    /// Dumps bytes of the user area as hex.
    Read {
        #[command(flatten)]
        range: RangeArgs,
    },

    /// Writes hex bytes into the user area.
    Write {
        #[arg(long, default_value_t = 0)]
        offset: usize,

        data: String,

        #[command(flatten)]
        auth: PasswordArgs,
    },

    /// Permanently locks the blocks covering a range.
    Lock {
        #[command(flatten)]
        range: RangeArgs,

        #[command(flatten)]
        auth: PasswordArgs,
    },

    /// Erases the tag and leaves an empty NDEF message.
    Format {
        #[command(flatten)]
        auth: PasswordArgs,
    },

    /// Reads or writes the NDEF message.
    #[command(subcommand)]
    Ndef(NdefCommand),

    /// DESFire applications and files.
    #[command(subcommand)]
    Desfire(DesfireCommand),

    /// Copies the user area of one tag onto another of the same family.
    Clone {
        /// Saves the dump as JSON.
        #[arg(long)]
        save: Option<PathBuf>,

        /// Restores a dump saved earlier instead of reading a source tag.
        #[arg(long)]
        from: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum NdefCommand {
    /// Prints the NDEF message.
    Read,

    /// Writes a Text record.
    WriteText {
        text: String,

        #[arg(long, default_value = "en")]
        lang: String,

        #[command(flatten)]
        auth: PasswordArgs,
    },

    /// Writes a URI record, or a Smart Poster when a title is given.
    WriteUri {
        uri: String,

        #[arg(long)]
        title: Option<String>,

        #[arg(long, default_value = "en")]
        lang: String,

        #[command(flatten)]
        auth: PasswordArgs,
    },
}

#[derive(Subcommand)]
enum DesfireCommand {
    /// Lists the applications.
    Apps,

    /// Lists the files of an application.
    Files {
        #[arg(long, value_parser = parse_aid)]
        aid: u32,

        #[command(flatten)]
        key: KeyArgs,
    },

    /// Reads a data file.
    Read {
        #[arg(long, value_parser = parse_aid)]
        aid: u32,

        #[arg(long)]
        file: u8,

        #[arg(long, default_value_t = 0)]
        offset: usize,

        /// Reads to the end of the file when omitted.
        #[arg(long)]
        len: Option<usize>,

        #[command(flatten)]
        key: KeyArgs,
    },
}

#[derive(Args)]
struct RangeArgs {
    #[arg(long, default_value_t = 0)]
    offset: usize,

    /// Up to the end of the user area when omitted.
    #[arg(long)]
    len: Option<usize>,
}

#[derive(Args)]
struct PasswordArgs {
    /// Prompts for the NTAG password before the operation.
    #[arg(long)]
    password: bool,
}

#[derive(Args)]
struct KeyArgs {
    /// Authenticates with this key number, prompting for the key.
    #[arg(long)]
    key_no: Option<u8>,

    #[arg(long, value_enum, default_value_t = CipherArg::Aes)]
    cipher: CipherArg,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CipherArg {
    Des,
    Tdes2,
    Tdes3,
    Aes,
}

impl From<CipherArg> for Cipher {
    fn from(arg: CipherArg) -> Self {
        match arg {
            CipherArg::Des => Cipher::Des,
            CipherArg::Tdes2 => Cipher::TwoKeyTdes,
            CipherArg::Tdes3 => Cipher::ThreeKeyTdes,
            CipherArg::Aes => Cipher::Aes,
        }
    }
}

fn parse_aid(s: &str) -> std::result::Result<u32, String> {
    let digits = s.trim_start_matches("0x");
    match u32::from_str_radix(digits, 16) {
        Ok(aid) if aid <= 0xFF_FFFF => Ok(aid),
        Ok(_) => Err("an AID has three bytes".to_owned()),
        Err(e) => Err(e.to_string()),
    }
}

fn prompt_hex(prompt: &str, len: usize) -> Result<Vec<u8>> {
    let input = Password::new().with_prompt(prompt).interact()?;
    let bytes = hex::decode(input.trim())?;

    match bytes.len() == len {
        true => Ok(bytes),
        _ => Err(Error::Length {
            expected: len,
            actual: bytes.len(),
        }),
    }
}

fn confirm(cli: &Cli, prompt: &str) -> Result<()> {
    if cli.yes || Confirm::new().with_prompt(prompt).default(false).interact()? {
        return Ok(());
    }

    Err(Error::Aborted)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_info(info: &TagInfo) {
    println!("Family:   {}", info.family);
    println!("Product:  {}", info.product);
    println!("UID:      {}", hex::encode_upper(&info.uid));
    println!("Memory:   {} bytes in blocks of {}", info.memory_size, info.block_size);

    let caps = info.capabilities;
    let supported: Vec<&str> = [
        (caps.read, "read"),
        (caps.write, "write"),
        (caps.lock, "lock"),
        (caps.format, "format"),
        (caps.authenticate, "authenticate"),
    ]
    .into_iter()
    .filter_map(|(on, name)| on.then_some(name))
    .collect();
    println!("Supports: {}", supported.join(", "));

    if !info.locked_blocks.is_empty() {
        println!("Locked:   {:?}", info.locked_blocks);
    }
}

fn print_ndef(message: &NdefMessage) {
    if message.is_empty() {
        println!("(empty)");
        return;
    }

    for (i, record) in message.records().iter().enumerate() {
        if let Some(poster) = record.as_smart_poster() {
            match poster.title {
                Some(title) => println!("#{} Smart Poster {} \"{}\"", i, poster.uri, title.text),
                None => println!("#{} Smart Poster {}", i, poster.uri),
            }
            continue;
        }

        match (record.as_text(), record.as_uri()) {
            (Some(text), _) => println!("#{} Text [{}] {}", i, text.language, text.text),
            (_, Some(uri)) => println!("#{} URI {}", i, uri),
            _ => println!(
                "#{} {:?} {} ({} bytes)",
                i,
                record.tnf,
                String::from_utf8_lossy(&record.record_type),
                record.payload.len()
            ),
        }
    }
}

fn print_hex(offset: usize, data: &[u8]) {
    for (i, line) in data.chunks(16).enumerate() {
        println!("{:04X}  {}", offset + i * 16, hex::encode_upper(line));
    }
}

fn authenticate_ntag(session: &mut Session, auth: &PasswordArgs) -> Result<()> {
    if !auth.password {
        return Ok(());
    }

    let mut password = [0u8; 4];
    password.copy_from_slice(&prompt_hex("NTAG password (hex)", 4)?);
    session.authenticate(&Credentials::NtagPassword {
        password,
        pack: None,
    })?;
    Ok(())
}

fn authenticate_desfire(session: &mut Session, key: &KeyArgs) -> Result<()> {
    let Some(key_no) = key.key_no else {
        return Ok(());
    };

    let cipher = Cipher::from(key.cipher);
    let secret = prompt_hex(&format!("Key {} ({} hex digits)", key_no, cipher.key_len() * 2), cipher.key_len())?;
    session.authenticate(&Credentials::Desfire {
        key_no,
        cipher,
        key: secret,
    })?;
    Ok(())
}

fn user_range(session: &mut Session, args: &RangeArgs) -> Result<Range> {
    match args.len {
        Some(len) => Ok(Range::new(args.offset, len)),
        None => {
            let size = session.get_info()?.memory_size;
            Ok(Range::new(args.offset, size.saturating_sub(args.offset)))
        }
    }
}

fn clone_tag(
    cli: &Cli,
    session: &mut Session,
    bench: Option<&VirtualBench>,
    save: Option<&PathBuf>,
    from: Option<&PathBuf>,
) -> Result<()> {
    let dump: TagDump = match from {
        Some(path) => serde_json::from_reader(BufReader::new(File::open(path)?))?,
        None => {
            let dump = clone::dump(session)?;
            println!(
                "Read {} bytes from {} {}",
                dump.data.len(),
                dump.product,
                hex::encode_upper(&dump.uid)
            );
            dump
        }
    };

    if let Some(path) = save {
        serde_json::to_writer_pretty(BufWriter::new(File::create(path)?), &dump)?;
        info!("Dump saved to {}", path.display());
    }

    if from.is_none() {
        match bench {
            Some(bench) => bench.replace(0x02),
            None => confirm(cli, "Place the target tag on the reader. Continue?")?,
        }
        session.release_tag();
    }

    confirm(cli, "Overwrite the user area of the target tag?")?;
    let family = session.wait_for_tag(Duration::from_secs(cli.wait))?;
    if family != dump.family {
        return Err(nfctag::Error::FamilyMismatch {
            dump: dump.family,
            target: family,
        }
        .into());
    }
    if from.is_none() && session.tag().map(|t| t.uid()) == Some(dump.uid.as_slice()) {
        println!("The source tag is still in the field; copying onto itself");
    }

    let copied = clone::restore(session, &dump)?;
    println!("Copied {} bytes", copied);
    Ok(())
}

fn run(cli: &Cli) -> Result<()> {
    if let Command::Readers = cli.command {
        for reader in reader::known_readers(cli.readers.as_deref())? {
            let backends: Vec<String> = reader.backends.iter().map(ToString::to_string).collect();
            let ids: Vec<String> = reader
                .usb_ids
                .iter()
                .map(|id| format!("{:04X}:{:04X}", id.vid, id.pid))
                .collect();
            println!("{:<16} {:<12} {}", reader.name, backends.join(","), ids.join(" "));
        }
        return Ok(());
    }

    let (mut session, bench) = reader::open(&reader::Options {
        reader: cli.reader.as_deref(),
        readers: cli.readers.as_deref(),
        timeout: cli.timeout_ms.map(Duration::from_millis),
        virtual_tag: cli.virtual_tag,
    })?;
    println!(
        "Reader: {} ({})",
        session.reader_name().unwrap_or_default(),
        session.backend_kind().map(|k| k.to_string()).unwrap_or_default()
    );

    let family = session.wait_for_tag(Duration::from_secs(cli.wait))?;
    info!("{} tag in the field", family);

    match &cli.command {
        Command::Readers => {}
        Command::Info => {
            let info = session.get_info()?;
            match cli.json {
                true => print_json(&info)?,
                _ => print_info(&info),
            }
        }
        Command::Read { range } => {
            let range = user_range(&mut session, range)?;
            let data = session.read(range)?;
            match cli.json {
                true => print_json(&hex::encode(&data))?,
                _ => print_hex(range.offset, &data),
            }
        }
        Command::Write { offset, data, auth } => {
            let data = hex::decode(data)?;
            authenticate_ntag(&mut session, auth)?;
            session.write(Range::new(*offset, data.len()), &data)?;
            println!("Wrote {} bytes at {}", data.len(), offset);
        }
        Command::Lock { range, auth } => {
            let range = user_range(&mut session, range)?;
            let preview = session.preview_lock(range)?;
            println!("Blocks to lock: {:?}", preview.blocks);
            for bits in &preview.bits {
                println!("  block {} byte {} mask {:08b}", bits.block, bits.byte, bits.mask);
            }

            confirm(cli, "Locking cannot be undone. Continue?")?;
            authenticate_ntag(&mut session, auth)?;
            let report = session.lock(range)?;
            println!("Locked blocks {:?}", report.blocks);
        }
        Command::Format { auth } => {
            confirm(cli, "Every byte of the tag will be erased. Continue?")?;
            if family == TagFamily::Type4DESFire {
                authenticate_desfire_master(&mut session)?;
            }
            authenticate_ntag(&mut session, auth)?;
            session.format()?;
            println!("Formatted");
        }
        Command::Ndef(NdefCommand::Read) => {
            let message = session.read_ndef()?;
            match cli.json {
                true => print_json(&message)?,
                _ => print_ndef(&message),
            }
        }
        Command::Ndef(NdefCommand::WriteText { text, lang, auth }) => {
            authenticate_ntag(&mut session, auth)?;
            session.write_ndef(&NdefMessage::new(vec![NdefRecord::text(lang, text)]))?;
            println!("Wrote a Text record");
        }
        Command::Ndef(NdefCommand::WriteUri { uri, title, lang, auth }) => {
            authenticate_ntag(&mut session, auth)?;
            match title {
                Some(title) => {
                    let poster = NdefRecord::smart_poster(uri, Some((lang.as_str(), title.as_str())))?;
                    session.write_ndef(&NdefMessage::new(vec![poster]))?;
                    println!("Wrote a Smart Poster record");
                }
                None => {
                    session.write_ndef(&NdefMessage::new(vec![NdefRecord::uri(uri)]))?;
                    println!("Wrote a URI record");
                }
            }
        }
        Command::Desfire(DesfireCommand::Apps) => {
            let apps = session.desfire(OperationKind::Read, |d, l| d.application_ids(l))?;
            match cli.json {
                true => print_json(&apps)?,
                _ => apps.iter().for_each(|aid| println!("{:06X}", aid)),
            }
        }
        Command::Desfire(DesfireCommand::Files { aid, key }) => {
            session.desfire(OperationKind::Select, |d, l| d.select_application(l, *aid))?;
            authenticate_desfire(&mut session, key)?;

            let files = session.desfire(OperationKind::Read, |d, l| {
                let mut files = Vec::new();
                for id in d.file_ids(l)? {
                    files.push((id, d.file_settings(l, id)?));
                }
                Ok(files)
            })?;

            match cli.json {
                true => print_json(&files)?,
                _ => {
                    for (id, settings) in files {
                        println!(
                            "{:02X}  {:>6} bytes  {:?}  access {:04X}",
                            id,
                            settings.size,
                            settings.comm,
                            settings.access.to_u16()
                        );
                    }
                }
            }
        }
        Command::Desfire(DesfireCommand::Read {
            aid,
            file,
            offset,
            len,
            key,
        }) => {
            session.desfire(OperationKind::Select, |d, l| d.select_application(l, *aid))?;
            authenticate_desfire(&mut session, key)?;

            let data = session.desfire(OperationKind::Read, |d, l| {
                let len = match len {
                    Some(len) => *len,
                    None => d.file_settings(l, *file)?.size.saturating_sub(*offset),
                };
                d.read_file(l, *file, Range::new(*offset, len))
            })?;

            match cli.json {
                true => print_json(&hex::encode(&data))?,
                _ => print_hex(*offset, &data),
            }
        }
        Command::Clone { save, from } => {
            clone_tag(cli, &mut session, bench.as_ref(), save.as_ref(), from.as_ref())?
        }
    }

    Ok(())
}

/// Formatting a DESFire card takes the PICC master key.
fn authenticate_desfire_master(session: &mut Session) -> Result<()> {
    session.desfire(OperationKind::Select, |d, l| d.select_application(l, PICC))?;
    authenticate_desfire(
        session,
        &KeyArgs {
            key_no: Some(0),
            cipher: CipherArg::Des,
        },
    )
}

fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(&cli) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli() {
        Cli::command().debug_assert();

        let cli = Cli::parse_from(["nfctag", "--virtual", "ntag213", "-y", "lock", "--offset", "4", "--len", "4"]);
        assert_eq!(Some(VirtualKind::Ntag213), cli.virtual_tag);
        assert!(cli.yes);
        assert!(matches!(
            cli.command,
            Command::Lock {
                range: RangeArgs { offset: 4, len: Some(4) },
                ..
            }
        ));
    }

    #[test]
    fn test_parse_aid() {
        assert_eq!(Ok(0x000002), parse_aid("2"));
        assert_eq!(Ok(0xF0E1D2), parse_aid("0xF0E1D2"));
        assert!(parse_aid("1000000").is_err());
        assert!(parse_aid("xyz").is_err());
    }
}
