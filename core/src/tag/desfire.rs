//! Type 4 tags (MIFARE DESFire EV1 and compatible).
//!
//! Native commands are wrapped into ISO 7816-4 frames (`90 cmd 00 00 [Lc data] 00`) and
//! answer with `91 xx`; `91 AF` asks for the next frame of a chained exchange.
//!
//! The card is organized as PICC -> applications (3-byte AID) -> files (1-byte id).
//! Raw reads and writes go to the file picked with [`Desfire::target_file`], or to the
//! NDEF file of the NFC Forum application when none is picked.
//!
//! Once authenticated every command carries a CMAC and every successful answer ends with
//! one, except for enciphered file data. Selecting another application ends the
//! authentication.

use std::collections::HashMap;

use apdu::{command, Command};

use crate::auth::desfire::{self as secure, CommMode};
use crate::auth::{AuthContext, Cipher, Credentials};
use crate::backend::Reply;
use crate::error::{Error, Result, TransportError};
use crate::ndef::NdefMessage;
use crate::tag::{unsupported, Capabilities, Link, OperationKind, Range, TagFamily, TagInfo};
use crate::trace::{debug, info};

pub mod cmd {
    pub const GET_VERSION: u8 = 0x60;
    pub const SELECT_APPLICATION: u8 = 0x5A;
    pub const GET_APPLICATION_IDS: u8 = 0x6A;
    pub const CREATE_APPLICATION: u8 = 0xCA;
    pub const DELETE_APPLICATION: u8 = 0xDA;
    pub const GET_FILE_IDS: u8 = 0x6F;
    pub const GET_FILE_SETTINGS: u8 = 0xF5;
    pub const CREATE_STD_DATA_FILE: u8 = 0xCD;
    pub const DELETE_FILE: u8 = 0xDF;
    pub const READ_DATA: u8 = 0xBD;
    pub const WRITE_DATA: u8 = 0x3D;
    pub const FREE_MEMORY: u8 = 0x6E;
    pub const FORMAT_PICC: u8 = 0xFC;
    pub const ADDITIONAL_FRAME: u8 = 0xAF;
}

pub mod status {
    pub const OK: u16 = 0x9100;
    pub const ADDITIONAL_FRAME: u16 = 0x91AF;
    pub const PERMISSION_DENIED: u16 = 0x919D;
    pub const AUTHENTICATION_ERROR: u16 = 0x91AE;
    pub const APPLICATION_NOT_FOUND: u16 = 0x91A0;
    pub const FILE_NOT_FOUND: u16 = 0x91F0;
    pub const BOUNDARY_ERROR: u16 = 0x91BE;
    pub const DUPLICATE_ERROR: u16 = 0x91DE;
    pub const PARAMETER_ERROR: u16 = 0x919E;
    pub const ISO_OK: u16 = 0x9000;
    pub const ISO_SECURITY: u16 = 0x6982;
    pub const ISO_NOT_FOUND: u16 = 0x6A82;
}

/// AID of the PICC level.
pub const PICC: u32 = 0x000000;

/// DF name of the NFC Forum NDEF application.
pub const NDEF_DF_NAME: [u8; 7] = [0xD2, 0x76, 0x00, 0x00, 0x85, 0x01, 0x01];
pub const CC_FILE: [u8; 2] = [0xE1, 0x03];
pub const CC_LEN: usize = 15;

/// Key slot granting access without authentication.
pub const KEY_FREE: u8 = 0x0E;
/// Key slot denying access.
pub const KEY_DENIED: u8 = 0x0F;

const SELECT_P1_DF: u8 = 0x04;
const SELECT_P1_EF: u8 = 0x00;
const SELECT_P2: u8 = 0x0C;

const CLA_NATIVE: u8 = 0x90;
const UPDATE_BINARY_CLA: u8 = 0x00;
const UPDATE_BINARY_INS: u8 = 0xD6;

const READ_CHUNK: usize = 48;
const WRITE_CHUNK: usize = 32;
const DEFAULT_KEY_SETTINGS: u8 = 0x0F;

/// Wraps a native command: `90 cmd 00 00 [Lc data] 00`.
pub fn wrap(cmd: u8, params: Vec<u8>) -> Command {
    match params.len() {
        0 => Command::new_with_le(CLA_NATIVE, cmd, 0x00, 0x00, 0),
        _ => Command::new_with_payload_le(CLA_NATIVE, cmd, 0x00, 0x00, 0, params),
    }
}

fn update_binary(p1: u8, p2: u8, data: Vec<u8>) -> Command {
    Command::new_with_payload(UPDATE_BINARY_CLA, UPDATE_BINARY_INS, p1, p2, data)
}

/// Access rights of a file: four key slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct AccessRights {
    pub read: u8,
    pub write: u8,
    pub read_write: u8,
    pub change: u8,
}

/// Kind of file access being requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

impl AccessRights {
    pub fn new(read: u8, write: u8, read_write: u8, change: u8) -> Self {
        Self {
            read,
            write,
            read_write,
            change,
        }
    }

    /// Everything free.
    pub fn free() -> Self {
        Self::new(KEY_FREE, KEY_FREE, KEY_FREE, KEY_FREE)
    }

    pub fn from_u16(value: u16) -> Self {
        Self {
            read: (value >> 12) as u8 & 0x0F,
            write: (value >> 8) as u8 & 0x0F,
            read_write: (value >> 4) as u8 & 0x0F,
            change: value as u8 & 0x0F,
        }
    }

    pub fn to_u16(self) -> u16 {
        (self.read as u16) << 12
            | (self.write as u16) << 8
            | (self.read_write as u16) << 4
            | self.change as u16
    }

    /// Communication mode granted for `access` to a session authenticated with `key`,
    /// or `None` when the access is denied. Free access always runs in plain.
    pub fn grant(&self, access: Access, key: Option<u8>, comm: CommMode) -> Option<CommMode> {
        let slots = match access {
            Access::Read => [self.read, self.read_write],
            Access::Write => [self.write, self.read_write],
        };

        match key {
            Some(key) if slots.contains(&key) => Some(comm),
            _ if slots.contains(&KEY_FREE) => Some(CommMode::Plain),
            _ => None,
        }
    }
}

/// Settings of a standard data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct FileSettings {
    pub file_type: u8,
    pub comm: CommMode,
    pub access: AccessRights,
    pub size: usize,
}

impl FileSettings {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        match bytes {
            [file_type, comm, lo, hi, s0, s1, s2, ..] => Ok(Self {
                file_type: *file_type,
                comm: CommMode::from_byte(*comm),
                access: AccessRights::from_u16(u16::from_le_bytes([*lo, *hi])),
                size: u32::from_le_bytes([*s0, *s1, *s2, 0]) as usize,
            }),
            _ => Err(TransportError::Framing("short file settings").into()),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![self.file_type, self.comm.to_byte()];
        bytes.extend_from_slice(&self.access.to_u16().to_le_bytes());
        bytes.extend_from_slice(&le3(self.size as u32));
        bytes
    }
}

/// Answer to `GetVersion`.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Version {
    pub hw_major: u8,
    pub hw_minor: u8,
    pub storage: u8,
    pub sw_major: u8,
    pub sw_minor: u8,
    pub uid: Vec<u8>,
}

impl Version {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 21 {
            return Err(TransportError::Framing("short GetVersion response").into());
        }

        Ok(Self {
            hw_major: bytes[3],
            hw_minor: bytes[4],
            storage: bytes[5],
            sw_major: bytes[10],
            sw_minor: bytes[11],
            uid: bytes[14..21].to_vec(),
        })
    }

    /// Storage size in bytes. Odd storage codes lie between two powers of two; the lower
    /// one is reported.
    pub fn storage_size(&self) -> usize {
        1usize << (self.storage >> 1).min(24)
    }

    pub fn product(&self) -> String {
        let name = match self.hw_major {
            0x00 => "MIFARE DESFire",
            0x01 => "MIFARE DESFire EV1",
            0x12 => "MIFARE DESFire EV2",
            0x33 => "MIFARE DESFire EV3",
            _ => "DESFire compatible",
        };

        format!("{} {}K", name, self.storage_size() / 1024)
    }
}

/// The NDEF file of the NFC Forum application, as described by its capability container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct NdefFile {
    file_id: [u8; 2],
    /// Size of the file, including the two NLEN bytes.
    max_size: usize,
    mle: usize,
    mlc: usize,
    writable: bool,
}

impl NdefFile {
    fn parse(cc: &[u8]) -> Result<Self> {
        match cc {
            [_, _, _, le0, le1, lc0, lc1, 0x04, _, f0, f1, m0, m1, _, write, ..] => Ok(Self {
                file_id: [*f0, *f1],
                max_size: u16::from_be_bytes([*m0, *m1]) as usize,
                mle: (u16::from_be_bytes([*le0, *le1]) as usize).clamp(1, 0xFF),
                mlc: (u16::from_be_bytes([*lc0, *lc1]) as usize).clamp(1, 0xFF),
                writable: *write == 0x00,
            }),
            _ => Err(Error::MalformedNdef("invalid capability container")),
        }
    }
}

pub(crate) fn le3(value: u32) -> [u8; 3] {
    let [a, b, c, _] = value.to_le_bytes();
    [a, b, c]
}

pub(crate) fn from_le3(bytes: &[u8]) -> u32 {
    match bytes {
        [a, b, c, ..] => u32::from_le_bytes([*a, *b, *c, 0]),
        _ => 0,
    }
}

/// Maps a native status word to an error.
pub fn status_error(sw: u16) -> Error {
    match sw {
        status::AUTHENTICATION_ERROR => Error::AuthenticationFailed,
        status::PERMISSION_DENIED | status::ISO_SECURITY => Error::AuthenticationRequired,
        sw => Error::Status(sw),
    }
}

pub struct Desfire {
    uid: Vec<u8>,
    aid: Option<u32>,
    auth: Option<AuthContext>,
    target: Option<(u32, u8)>,
    settings: HashMap<u8, FileSettings>,
    version: Option<Version>,
    ndef: Option<NdefFile>,
}

impl Desfire {
    pub fn new(uid: &[u8]) -> Self {
        Self {
            uid: uid.to_vec(),
            aid: None,
            auth: None,
            target: None,
            settings: HashMap::new(),
            version: None,
            ndef: None,
        }
    }

    /// Application selected through native commands, if known.
    pub fn selected_application(&self) -> Option<u32> {
        self.aid
    }

    pub fn auth_context(&self) -> Option<&AuthContext> {
        self.auth.as_ref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.auth.is_some()
    }

    pub(crate) fn invalidate(&mut self) {
        if self.auth.take().is_some() {
            debug!("DESFire authentication dropped");
        }
    }

    /// Key the session is authenticated with in the selected application.
    fn auth_key(&self) -> Option<u8> {
        self.auth
            .as_ref()
            .filter(|ctx| Some(ctx.aid()) == self.aid)
            .map(AuthContext::key_no)
    }

    fn require_key(&self, aid: u32, key_no: u8) -> Result<()> {
        match self.aid == Some(aid) && self.auth_key() == Some(key_no) {
            true => Ok(()),
            _ => Err(Error::AuthenticationRequired),
        }
    }

    /// Sends one frame and returns the raw answer.
    fn exchange(&mut self, link: &mut Link, cmd: u8, params: Vec<u8>) -> Result<Reply> {
        link.transmit(wrap(cmd, params))
    }

    /// Runs a native command, following `AF` continuations, and returns the whole answer.
    fn chained(&mut self, link: &mut Link, cmd: u8, params: Vec<u8>) -> Result<Vec<u8>> {
        let mut response = self.exchange(link, cmd, params)?;
        let mut data = Vec::new();

        loop {
            data.extend_from_slice(&response.data);
            match response.sw {
                status::OK => return Ok(data),
                status::ADDITIONAL_FRAME => {
                    response = self.exchange(link, cmd::ADDITIONAL_FRAME, Vec::new())?
                }
                sw => return Err(status_error(sw)),
            }
        }
    }

    /// Runs a native command under the current session. `send` protects `data`; `reply`
    /// holds the mode of the answer and its plain length.
    fn transact(
        &mut self,
        link: &mut Link,
        cmd: u8,
        header: &[u8],
        data: &[u8],
        send: CommMode,
        reply: (CommMode, usize),
    ) -> Result<Vec<u8>> {
        let params = match &mut self.auth {
            Some(ctx) => ctx.wrap_command(cmd, header, data, send)?,
            None => [header, data].concat(),
        };

        let result = self
            .chained(link, cmd, params)
            .and_then(|response| match &mut self.auth {
                Some(ctx) => ctx.unwrap_response(&response, reply.0, reply.1),
                None => Ok(response),
            });

        if result.is_err() {
            self.invalidate();
        }

        result
    }

    fn command(&mut self, link: &mut Link, cmd: u8, params: &[u8]) -> Result<Vec<u8>> {
        self.transact(link, cmd, params, &[], CommMode::Plain, (CommMode::Plain, 0))
    }

    pub fn version(&mut self, link: &mut Link) -> Result<Version> {
        if let Some(version) = &self.version {
            return Ok(version.clone());
        }

        let version = Version::parse(&self.command(link, cmd::GET_VERSION, &[])?)?;
        debug!("DESFire version: {:?}", version);

        self.version = Some(version.clone());
        Ok(version)
    }

    /// Selects an application, ending any authentication.
    pub fn select_application(&mut self, link: &mut Link, aid: u32) -> Result<()> {
        self.invalidate();
        self.ndef = None;
        self.settings.clear();

        self.chained(link, cmd::SELECT_APPLICATION, le3(aid).to_vec())?;
        self.aid = Some(aid);
        Ok(())
    }

    fn ensure_application(&mut self, link: &mut Link, aid: u32) -> Result<()> {
        match self.aid == Some(aid) {
            true => Ok(()),
            _ => self.select_application(link, aid),
        }
    }

    pub fn authenticate(&mut self, link: &mut Link, credentials: &Credentials) -> Result<()> {
        let Credentials::Desfire {
            key_no,
            cipher,
            key,
        } = credentials
        else {
            return unsupported(TagFamily::Type4DESFire, OperationKind::Authenticate);
        };

        let aid = match self.aid {
            Some(aid) => aid,
            None => {
                self.select_application(link, PICC)?;
                PICC
            }
        };
        self.invalidate();

        let response = self.exchange(link, secure::auth_command(*cipher), vec![*key_no])?;
        if response.sw != status::ADDITIONAL_FRAME {
            return Err(status_error(response.sw));
        }

        let (token, challenge) = secure::respond_to_challenge(*cipher, key, &response.data)?;
        let response = self.exchange(link, cmd::ADDITIONAL_FRAME, token)?;
        if response.sw != status::OK {
            return Err(status_error(response.sw));
        }

        let ctx = secure::verify_final(challenge, &response.data, *key_no, aid)?;
        info!("Authenticated with key {} of application {:06X}", key_no, aid);

        self.auth = Some(ctx);
        Ok(())
    }

    pub fn application_ids(&mut self, link: &mut Link) -> Result<Vec<u32>> {
        self.ensure_application(link, PICC)?;

        let ids = self.command(link, cmd::GET_APPLICATION_IDS, &[])?;
        Ok(ids.chunks_exact(3).map(from_le3).collect())
    }

    /// Creates an application. Requires the PICC master key.
    pub fn create_application(
        &mut self,
        link: &mut Link,
        aid: u32,
        num_keys: u8,
        cipher: Cipher,
    ) -> Result<()> {
        self.require_key(PICC, 0)?;

        let mut params = le3(aid).to_vec();
        params.push(DEFAULT_KEY_SETTINGS);
        params.push(match cipher {
            Cipher::ThreeKeyTdes => num_keys | 0x40,
            Cipher::Aes => num_keys | 0x80,
            _ => num_keys,
        });

        self.command(link, cmd::CREATE_APPLICATION, &params)?;
        Ok(())
    }

    /// Deletes an application. Requires the PICC master key.
    pub fn delete_application(&mut self, link: &mut Link, aid: u32) -> Result<()> {
        self.require_key(PICC, 0)?;

        self.command(link, cmd::DELETE_APPLICATION, &le3(aid))?;
        if self.target.is_some_and(|(target, _)| target == aid) {
            self.target = None;
        }
        Ok(())
    }

    pub fn file_ids(&mut self, link: &mut Link) -> Result<Vec<u8>> {
        self.command(link, cmd::GET_FILE_IDS, &[])
    }

    pub fn file_settings(&mut self, link: &mut Link, file_id: u8) -> Result<FileSettings> {
        if let Some(settings) = self.settings.get(&file_id) {
            return Ok(*settings);
        }

        let settings = FileSettings::parse(&self.command(link, cmd::GET_FILE_SETTINGS, &[file_id])?)?;
        self.settings.insert(file_id, settings);
        Ok(settings)
    }

    /// Creates a standard data file in the selected application. Requires its master key.
    pub fn create_std_data_file(
        &mut self,
        link: &mut Link,
        file_id: u8,
        comm: CommMode,
        access: AccessRights,
        size: usize,
    ) -> Result<()> {
        let aid = self.aid.filter(|aid| *aid != PICC).ok_or(Error::AuthenticationRequired)?;
        self.require_key(aid, 0)?;

        let settings = FileSettings {
            file_type: 0x00,
            comm,
            access,
            size,
        };
        let mut params = vec![file_id];
        params.extend_from_slice(&settings.to_bytes()[1..]);

        self.command(link, cmd::CREATE_STD_DATA_FILE, &params)?;
        Ok(())
    }

    /// Deletes a file of the selected application. Requires its master key.
    pub fn delete_file(&mut self, link: &mut Link, file_id: u8) -> Result<()> {
        let aid = self.aid.filter(|aid| *aid != PICC).ok_or(Error::AuthenticationRequired)?;
        self.require_key(aid, 0)?;

        self.command(link, cmd::DELETE_FILE, &[file_id])?;
        self.settings.remove(&file_id);
        Ok(())
    }

    pub fn free_memory(&mut self, link: &mut Link) -> Result<usize> {
        self.ensure_application(link, PICC)?;

        let free = self.command(link, cmd::FREE_MEMORY, &[])?;
        Ok(from_le3(&free) as usize)
    }

    /// Reads from a data file of the selected application.
    pub fn read_file(&mut self, link: &mut Link, file_id: u8, range: Range) -> Result<Vec<u8>> {
        let settings = self.file_settings(link, file_id)?;
        range.check(settings.size)?;

        let mode = settings
            .access
            .grant(Access::Read, self.auth_key(), settings.comm)
            .ok_or(Error::AuthenticationRequired)?;

        let mut data = Vec::with_capacity(range.len);
        while data.len() < range.len {
            let len = (range.len - data.len()).min(READ_CHUNK);
            let mut header = vec![file_id];
            header.extend_from_slice(&le3((range.offset + data.len()) as u32));
            header.extend_from_slice(&le3(len as u32));

            let chunk = self.transact(link, cmd::READ_DATA, &header, &[], CommMode::Plain, (mode, len))?;
            if chunk.len() != len {
                return Err(TransportError::Framing("short ReadData response").into());
            }
            data.extend(chunk);
        }

        Ok(data)
    }

    /// Writes to a data file of the selected application.
    pub fn write_file(&mut self, link: &mut Link, file_id: u8, offset: usize, data: &[u8]) -> Result<()> {
        let settings = self.file_settings(link, file_id)?;
        Range::new(offset, data.len()).check(settings.size)?;

        let mode = settings
            .access
            .grant(Access::Write, self.auth_key(), settings.comm)
            .ok_or(Error::AuthenticationRequired)?;

        for (i, chunk) in data.chunks(WRITE_CHUNK).enumerate() {
            let mut header = vec![file_id];
            header.extend_from_slice(&le3((offset + i * WRITE_CHUNK) as u32));
            header.extend_from_slice(&le3(chunk.len() as u32));

            self.transact(link, cmd::WRITE_DATA, &header, chunk, mode, (CommMode::Plain, 0))?;
        }

        Ok(())
    }

    /// Directs raw reads and writes to a data file.
    pub fn target_file(&mut self, aid: u32, file_id: u8) {
        self.target = Some((aid, file_id));
    }

    /// Directs raw reads and writes back to the NDEF file.
    pub fn clear_target(&mut self) {
        self.target = None;
    }

    /// Selects the NFC Forum application and its NDEF file.
    fn ndef_file(&mut self, link: &mut Link) -> Result<NdefFile> {
        if let Some(file) = self.ndef {
            return Ok(file);
        }

        // ISO selection leaves the native application unknown.
        self.invalidate();
        self.aid = None;
        self.settings.clear();

        self.iso(link, command::select_file(SELECT_P1_DF, SELECT_P2, NDEF_DF_NAME.to_vec()))?;
        self.iso(link, command::select_file(SELECT_P1_EF, SELECT_P2, CC_FILE.to_vec()))?;
        let cc = self.read_binary(link, 0, CC_LEN, CC_LEN)?;
        let file = NdefFile::parse(&cc)?;

        self.iso(link, command::select_file(SELECT_P1_EF, SELECT_P2, file.file_id.to_vec()))?;
        debug!("NDEF file {:02x?} holds up to {} bytes", file.file_id, file.max_size);

        self.ndef = Some(file);
        Ok(file)
    }

    fn iso(&mut self, link: &mut Link, command: impl Into<Command>) -> Result<Vec<u8>> {
        let response = link.transmit(command)?;
        match response.sw {
            status::ISO_OK => Ok(response.data),
            sw => Err(status_error(sw)),
        }
    }

    /// Reads `len` bytes of the selected EF at `offset`, `mle` bytes at a time.
    fn read_binary(&mut self, link: &mut Link, offset: usize, len: usize, mle: usize) -> Result<Vec<u8>> {
        let mut buf: Vec<u8> = Vec::with_capacity(len);

        while buf.len() < len {
            let [p1, p2] = ((offset + buf.len()) as u16).to_be_bytes();
            let le = (len - buf.len()).min(mle) as u8;

            let mut fragment = self.iso(link, command::read_binary(p1, p2, le))?;
            if fragment.is_empty() {
                return Err(TransportError::Framing("empty READ BINARY response").into());
            }

            fragment.truncate(len - buf.len());
            buf.append(&mut fragment);
        }

        Ok(buf)
    }

    fn update_binary(&mut self, link: &mut Link, offset: usize, data: &[u8], mlc: usize) -> Result<()> {
        for (i, chunk) in data.chunks(mlc).enumerate() {
            let [p1, p2] = ((offset + i * mlc) as u16).to_be_bytes();
            self.iso(link, update_binary(p1, p2, chunk.to_vec()))?;
        }

        Ok(())
    }

    pub fn get_info(&mut self, link: &mut Link) -> Result<TagInfo> {
        let version = self.version(link)?;

        Ok(TagInfo {
            family: TagFamily::Type4DESFire,
            uid: self.uid.clone(),
            product: version.product(),
            memory_size: version.storage_size(),
            block_size: 1,
            capabilities: Capabilities {
                read: true,
                write: true,
                format: true,
                authenticate: true,
                ..Default::default()
            },
            locked_blocks: Vec::new(),
        })
    }

    /// Size of what raw reads and writes address: the target file, or the NDEF file.
    pub fn data_size(&mut self, link: &mut Link) -> Result<usize> {
        match self.target {
            Some((aid, file_id)) => {
                self.ensure_application(link, aid)?;
                Ok(self.file_settings(link, file_id)?.size)
            }
            None => Ok(self.ndef_file(link)?.max_size),
        }
    }

    pub fn read(&mut self, link: &mut Link, range: Range) -> Result<Vec<u8>> {
        match self.target {
            Some((aid, file_id)) => {
                self.ensure_application(link, aid)?;
                self.read_file(link, file_id, range)
            }
            None => {
                let file = self.ndef_file(link)?;
                range.check(file.max_size)?;
                self.read_binary(link, range.offset, range.len, file.mle)
            }
        }
    }

    pub fn write(&mut self, link: &mut Link, range: Range, data: &[u8]) -> Result<()> {
        match self.target {
            Some((aid, file_id)) => {
                self.ensure_application(link, aid)?;
                self.write_file(link, file_id, range.offset, data)
            }
            None => {
                let file = self.ndef_file(link)?;
                range.check(file.max_size)?;
                if !file.writable {
                    return Err(Error::AuthenticationRequired);
                }

                self.update_binary(link, range.offset, data, file.mlc)
            }
        }
    }

    /// Erases every application. Requires the PICC master key.
    pub fn format(&mut self, link: &mut Link) -> Result<()> {
        self.require_key(PICC, 0)?;

        self.command(link, cmd::FORMAT_PICC, &[])?;
        self.target = None;
        self.ndef = None;
        self.settings.clear();

        info!("DESFire card formatted");
        Ok(())
    }

    pub fn read_ndef(&mut self, link: &mut Link) -> Result<NdefMessage> {
        let file = self.ndef_file(link)?;

        let nlen = self.read_binary(link, 0, 2, file.mle)?;
        let len = u16::from_be_bytes([nlen[0], nlen[1]]) as usize;
        if len + 2 > file.max_size {
            return Err(Error::MalformedNdef("NLEN exceeds the NDEF file"));
        }

        match len {
            0 => Ok(NdefMessage::default()),
            _ => NdefMessage::decode(&self.read_binary(link, 2, len, file.mle)?),
        }
    }

    pub fn write_ndef(&mut self, link: &mut Link, message: &NdefMessage) -> Result<()> {
        let file = self.ndef_file(link)?;
        if !file.writable {
            return Err(Error::AuthenticationRequired);
        }

        let encoded = message.encode()?;
        if encoded.len() + 2 > file.max_size {
            return Err(Error::InsufficientMemory {
                requested: encoded.len() + 2,
                available: file.max_size,
            });
        }

        self.update_binary(link, 0, &[0x00, 0x00], file.mlc)?;
        self.update_binary(link, 2, &encoded, file.mlc)?;
        self.update_binary(link, 0, &(encoded.len() as u16).to_be_bytes(), file.mlc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap() {
        assert_eq!(
            vec![0x90, 0x5A, 0x00, 0x00, 0x03, 0x01, 0x02, 0x03, 0x00],
            Vec::from(wrap(cmd::SELECT_APPLICATION, vec![0x01, 0x02, 0x03])),
        );
        assert_eq!(
            vec![0x90, 0x6A, 0x00, 0x00, 0x00],
            Vec::from(wrap(cmd::GET_APPLICATION_IDS, vec![])),
        );
    }

    #[test]
    fn test_access_rights() {
        let access = AccessRights::from_u16(0xE123);
        assert_eq!(AccessRights::new(0xE, 0x1, 0x2, 0x3), access);
        assert_eq!(0xE123, access.to_u16());

        assert_eq!(Some(CommMode::Plain), access.grant(Access::Read, None, CommMode::Enciphered));
        assert_eq!(None, access.grant(Access::Write, None, CommMode::Enciphered));
        assert_eq!(None, access.grant(Access::Write, Some(0), CommMode::Enciphered));
        assert_eq!(
            Some(CommMode::Enciphered),
            access.grant(Access::Write, Some(2), CommMode::Enciphered)
        );
    }

    #[test]
    fn test_file_settings() {
        let bytes = [0x00, 0x03, 0x10, 0xE1, 0x20, 0x00, 0x00];
        let settings = FileSettings::parse(&bytes).unwrap();

        assert_eq!(CommMode::Enciphered, settings.comm);
        assert_eq!(AccessRights::new(0xE, 0x1, 0x1, 0x0), settings.access);
        assert_eq!(32, settings.size);
        assert_eq!(bytes.to_vec(), settings.to_bytes());
    }

    #[test]
    fn test_version_storage() {
        let mut bytes = vec![0x04, 0x01, 0x01, 0x01, 0x00, 0x1A, 0x05];
        bytes.extend([0x04, 0x01, 0x01, 0x01, 0x04, 0x1A, 0x05]);
        bytes.extend([0x04, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0, 0, 0, 0, 0, 0x00, 0x21]);

        let version = Version::parse(&bytes).unwrap();
        assert_eq!(8192, version.storage_size());
        assert_eq!("MIFARE DESFire EV1 8K", version.product());
        assert_eq!(vec![0x04, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66], version.uid);
    }

    #[test]
    fn test_capability_container() {
        let cc = [
            0x00, 0x0F, 0x20, 0x00, 0x3B, 0x00, 0x34, 0x04, 0x06, 0xE1, 0x04, 0x00, 0x80, 0x00,
            0x00,
        ];
        let file = NdefFile::parse(&cc).unwrap();

        assert_eq!([0xE1, 0x04], file.file_id);
        assert_eq!(128, file.max_size);
        assert_eq!((0x3B, 0x34), (file.mle, file.mlc));
        assert!(file.writable);
    }

    #[test]
    fn test_status_mapping() {
        assert!(matches!(status_error(0x91AE), Error::AuthenticationFailed));
        assert!(matches!(status_error(0x919D), Error::AuthenticationRequired));
        assert!(matches!(status_error(0x91F0), Error::Status(0x91F0)));
    }
}
