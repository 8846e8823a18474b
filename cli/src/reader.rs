use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::time::Duration;

use clap::ValueEnum;
use nfctag::auth::desfire::CommMode;
use nfctag::auth::Cipher;
use nfctag::emulator::{
    VirtualDesfire, VirtualFeliCa, VirtualField, VirtualOpener, VirtualTag, VirtualTopaz,
    VirtualUltralight, VirtualVicinity,
};
use nfctag::session::descriptor;
use nfctag::tag::desfire::AccessRights;
use nfctag::tag::ultralight::Model;
use nfctag::{ReaderDescriptor, ReaderSelector, Session, SessionOptions};
use tracing::debug;

use crate::{Error, Result};

/// Tags the in-process reader can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum VirtualKind {
    Topaz,
    Ntag213,
    Ntag215,
    Felica,
    Desfire,
    Icode,
}

impl VirtualKind {
    /// A fresh tag. `serial` varies the UID so two tags of one kind can be told apart.
    pub fn make(self, serial: u8) -> Box<dyn VirtualTag> {
        let uid7 = [0x04, 0x5A, 0x3C, 0x12, 0x9B, 0x70, serial];

        match self {
            VirtualKind::Topaz => Box::new(VirtualTopaz::new([0x5A, 0x3C, 0x12, serial])),
            VirtualKind::Ntag213 => Box::new(VirtualUltralight::new(uid7, Model::Ntag213)),
            VirtualKind::Ntag215 => Box::new(VirtualUltralight::new(uid7, Model::Ntag215)),
            VirtualKind::Felica => Box::new(VirtualFeliCa::new(
                [0x01, 0x2E, 0x3C, 0x12, 0x9B, 0x70, 0x11, serial],
                12,
            )),
            VirtualKind::Desfire => Box::new(
                VirtualDesfire::new(uid7)
                    .with_ndef_application(512)
                    .with_application(0x000002, Cipher::Aes, vec![vec![0u8; 16], vec![0u8; 16]])
                    .with_file(
                        0x000002,
                        1,
                        CommMode::Plain,
                        AccessRights::new(0xE, 0x1, 0x1, 0x0),
                        b"nfctag demo file".to_vec(),
                    ),
            ),
            VirtualKind::Icode => Box::new(VirtualVicinity::icode_sli([
                serial, 0x70, 0x9B, 0x12, 0x3C, 0x5A, 0x04, 0xE0,
            ])),
        }
    }
}

/// The field of a virtual reader, with the kind of tag it was started with.
pub struct VirtualBench {
    pub field: VirtualField,
    pub kind: VirtualKind,
}

impl VirtualBench {
    /// Swaps the tag in the field for a fresh one of the same kind.
    pub fn replace(&self, serial: u8) {
        self.field.remove();
        self.field.place(self.kind.make(serial));
    }
}

/// Readers from the catalogue, followed by those of `extra` (a JSON array of descriptors).
pub fn known_readers(extra: Option<&Path>) -> Result<Vec<ReaderDescriptor>> {
    let mut readers = descriptor::catalogue();

    if let Some(path) = extra {
        let file = BufReader::new(File::open(path)?);
        let loaded: Vec<ReaderDescriptor> = serde_json::from_reader(file)?;
        for reader in &loaded {
            reader.validate()?;
        }

        debug!("Loaded {} reader descriptors from {}", loaded.len(), path.display());
        readers.extend(loaded);
    }

    Ok(readers)
}

pub struct Options<'a> {
    pub reader: Option<&'a str>,
    pub readers: Option<&'a Path>,
    pub timeout: Option<Duration>,
    pub virtual_tag: Option<VirtualKind>,
}

/// Opens a session on the chosen reader, or on a virtual reader holding one tag.
pub fn open(options: &Options) -> Result<(Session, Option<VirtualBench>)> {
    let session_options = SessionOptions {
        timeout: options.timeout,
        ..Default::default()
    };

    if let Some(kind) = options.virtual_tag {
        let field = VirtualField::new();
        let bench = VirtualBench { field, kind };
        bench.replace(0x01);

        let opener = VirtualOpener::new(bench.field.clone());
        let mut session = Session::with_opener(ReaderSelector::Auto, session_options, Box::new(opener));
        session.connect()?;
        return Ok((session, Some(bench)));
    }

    let selector = match options.reader {
        None => ReaderSelector::Auto,
        Some(name) => {
            let needle = name.to_lowercase();
            let reader = known_readers(options.readers)?
                .into_iter()
                .find(|d| d.name.to_lowercase().contains(&needle))
                .ok_or_else(|| Error::UnknownReader(name.to_owned()))?;
            ReaderSelector::Descriptor(reader)
        }
    };

    let mut session = Session::new(selector, session_options);
    session.connect()?;
    Ok((session, None))
}
