use std::collections::{BTreeMap, VecDeque};

use crate::auth::cipher::INTEGRITY_ERROR;
use crate::auth::desfire::{
    answer_challenge, issue_challenge, CardChallenge, CommMode, CMD_AUTHENTICATE_AES,
    CMD_AUTHENTICATE_ISO,
};
use crate::auth::{AuthContext, Cipher};
use crate::backend::Signature;
use crate::emulator::VirtualTag;
use crate::error::{Error, Result, TransportError};
use crate::tag::desfire::{
    cmd, from_le3, le3, status, Access, AccessRights, FileSettings, Version, NDEF_DF_NAME, PICC,
};

/// Application holding the NFC Forum NDEF files.
pub const NDEF_AID: u32 = 0x000001;

const FRAME_LEN: usize = 59;
const STORAGE_8K: u8 = 0x1A;

const NO_SUCH_KEY: u16 = 0x9140;
const ILLEGAL_COMMAND: u16 = 0x911C;
const LENGTH_ERROR: u16 = 0x917E;
const OUT_OF_EEPROM: u16 = 0x910E;
const COMMAND_ABORTED: u16 = 0x91CA;

const ISO_WRONG_OFFSET: u16 = 0x6B00;
const ISO_NO_CURRENT_EF: u16 = 0x6986;
const ISO_INS_NOT_SUPPORTED: u16 = 0x6D00;
const ISO_CLA_NOT_SUPPORTED: u16 = 0x6E00;

const SELECT_BY_NAME: u8 = 0x04;
const SELECT_EF: u8 = 0x00;

const CLA_ISO: u8 = 0x00;
const CLA_NATIVE: u8 = 0x90;

mod ins {
    pub const SELECT_FILE: u8 = 0xA4;
    pub const READ_BINARY: u8 = 0xB0;
    pub const UPDATE_BINARY: u8 = 0xD6;
}

/// A short command APDU as the card receives it.
struct Apdu<'a> {
    cla: u8,
    ins: u8,
    p1: u8,
    p2: u8,
    data: &'a [u8],
    le: Option<u8>,
}

impl<'a> Apdu<'a> {
    fn parse(frame: &'a [u8]) -> Option<Self> {
        if frame.len() < 4 {
            return None;
        }
        let (header, body) = frame.split_at(4);

        let (data, le) = match body {
            [] => (&body[..0], None),
            [le] => (&body[..0], Some(*le)),
            [lc, rest @ ..] => {
                let lc = *lc as usize;
                match rest.len().checked_sub(lc)? {
                    0 => (&rest[..lc], None),
                    1 => (&rest[..lc], Some(rest[lc])),
                    _ => return None,
                }
            }
        };

        Some(Self {
            cla: header[0],
            ins: header[1],
            p1: header[2],
            p2: header[3],
            data,
            le,
        })
    }
}

type CardResult<T> = std::result::Result<T, u16>;

struct File {
    settings: FileSettings,
    iso_id: Option<[u8; 2]>,
    data: Vec<u8>,
}

struct Application {
    cipher: Cipher,
    keys: Vec<Vec<u8>>,
    df_name: Option<Vec<u8>>,
    files: BTreeMap<u8, File>,
}

impl Application {
    fn new(cipher: Cipher, keys: Vec<Vec<u8>>) -> Self {
        Self {
            cipher,
            keys,
            df_name: None,
            files: BTreeMap::new(),
        }
    }
}

/// A DESFire EV1 8K card answering native and ISO 7816-4 commands.
///
/// The card keeps its own session and secure messaging state, derived from the same
/// three-pass authentication as the reader side.
pub struct VirtualDesfire {
    uid: [u8; 7],
    storage: u8,
    apps: BTreeMap<u32, Application>,
    selected: u32,
    selected_ef: Option<u8>,
    auth: Option<AuthContext>,
    challenge: Option<(CardChallenge, u8)>,
    pending: VecDeque<Vec<u8>>,
}

impl VirtualDesfire {
    /// An empty card whose PICC master key is the all-zero DES key.
    pub fn new(uid: [u8; 7]) -> Self {
        let mut apps = BTreeMap::new();
        apps.insert(PICC, Application::new(Cipher::Des, vec![vec![0u8; 8]]));

        Self {
            uid,
            storage: STORAGE_8K,
            apps,
            selected: PICC,
            selected_ef: None,
            auth: None,
            challenge: None,
            pending: VecDeque::new(),
        }
    }

    pub fn with_master_key(mut self, cipher: Cipher, key: &[u8]) -> Self {
        self.apps.insert(PICC, Application::new(cipher, vec![key.to_vec()]));
        self
    }

    /// Adds an application with the given keys; key 0 is its master key.
    pub fn with_application(mut self, aid: u32, cipher: Cipher, keys: Vec<Vec<u8>>) -> Self {
        self.apps.insert(aid, Application::new(cipher, keys));
        self
    }

    /// Adds a standard data file holding `data` to an existing application.
    pub fn with_file(mut self, aid: u32, file_id: u8, comm: CommMode, access: AccessRights, data: Vec<u8>) -> Self {
        if let Some(app) = self.apps.get_mut(&aid) {
            let settings = FileSettings {
                file_type: 0x00,
                comm,
                access,
                size: data.len(),
            };
            app.files.insert(
                file_id,
                File {
                    settings,
                    iso_id: None,
                    data,
                },
            );
        }
        self
    }

    /// Adds the NFC Forum application with an empty NDEF file of `capacity` bytes.
    pub fn with_ndef_application(mut self, capacity: u16) -> Self {
        let [hi, lo] = capacity.to_be_bytes();
        let cc = vec![
            0x00, 0x0F, 0x20, 0x00, 0x3B, 0x00, 0x34, 0x04, 0x06, 0xE1, 0x04, hi, lo, 0x00, 0x00,
        ];

        let mut app = Application::new(Cipher::Des, vec![vec![0u8; 8]]);
        app.df_name = Some(NDEF_DF_NAME.to_vec());
        for (file_id, iso_id, data) in [(1, [0xE1, 0x03], cc), (2, [0xE1, 0x04], vec![0u8; capacity as usize])] {
            let settings = FileSettings {
                file_type: 0x00,
                comm: CommMode::Plain,
                access: AccessRights::new(0xE, 0xE, 0xE, 0x0),
                size: data.len(),
            };
            app.files.insert(
                file_id,
                File {
                    settings,
                    iso_id: Some(iso_id),
                    data,
                },
            );
        }

        self.apps.insert(NDEF_AID, app);
        self
    }

    fn version(&self) -> Vec<u8> {
        let mut version = vec![0x04, 0x01, 0x01, 0x01, 0x00, self.storage, 0x05];
        version.extend([0x04, 0x01, 0x01, 0x01, 0x04, self.storage, 0x05]);
        version.extend_from_slice(&self.uid);
        version.extend([0x00; 5]);
        version.extend([0x00, 0x21]);
        version
    }

    fn capacity(&self) -> usize {
        Version::parse(&self.version())
            .map(|v| v.storage_size())
            .unwrap_or_default()
    }

    fn free_memory(&self) -> usize {
        let used: usize = self
            .apps
            .values()
            .flat_map(|app| app.files.values())
            .map(|file| file.settings.size)
            .sum();

        self.capacity().saturating_sub(used)
    }

    fn app(&self) -> CardResult<&Application> {
        self.apps.get(&self.selected).ok_or(status::APPLICATION_NOT_FOUND)
    }

    fn app_mut(&mut self) -> CardResult<&mut Application> {
        self.apps.get_mut(&self.selected).ok_or(status::APPLICATION_NOT_FOUND)
    }

    fn settings(&self, file_id: u8) -> CardResult<FileSettings> {
        self.app()?
            .files
            .get(&file_id)
            .map(|file| file.settings)
            .ok_or(status::FILE_NOT_FOUND)
    }

    fn auth_key(&self) -> Option<u8> {
        self.auth
            .as_ref()
            .filter(|ctx| ctx.aid() == self.selected)
            .map(AuthContext::key_no)
    }

    fn require_picc_key(&self) -> CardResult<()> {
        match self.selected == PICC && self.auth_key() == Some(0) {
            true => Ok(()),
            _ => Err(status::PERMISSION_DENIED),
        }
    }

    fn require_app_key(&self) -> CardResult<()> {
        match self.selected != PICC && self.auth_key() == Some(0) {
            true => Ok(()),
            _ => Err(status::PERMISSION_DENIED),
        }
    }

    fn open(&mut self, cmd: u8, params: &[u8], header_len: usize, len: usize, mode: CommMode) -> CardResult<Vec<u8>> {
        match &mut self.auth {
            Some(ctx) => ctx
                .open_command(cmd, params, header_len, len, mode)
                .map_err(|_| INTEGRITY_ERROR),
            None => Ok(params.to_vec()),
        }
    }

    fn seal(&mut self, data: &[u8], mode: CommMode) -> CardResult<Vec<u8>> {
        match &mut self.auth {
            Some(ctx) => ctx.seal_response(data, mode).map_err(|_| INTEGRITY_ERROR),
            None => Ok(data.to_vec()),
        }
    }

    /// Queues a sealed answer as `AF` frames and returns the first one.
    fn chain(&mut self, command: u8, data: Vec<u8>) -> (Vec<u8>, u16) {
        let mut frames: VecDeque<Vec<u8>> = match command {
            cmd::GET_VERSION if data.len() > 14 => {
                VecDeque::from([data[..7].to_vec(), data[7..14].to_vec(), data[14..].to_vec()])
            }
            _ => data.chunks(FRAME_LEN).map(<[u8]>::to_vec).collect(),
        };

        let first = frames.pop_front().unwrap_or_default();
        self.pending = frames;
        match self.pending.is_empty() {
            true => (first, status::OK),
            _ => (first, status::ADDITIONAL_FRAME),
        }
    }

    fn native(&mut self, command: u8, params: &[u8]) -> (Vec<u8>, u16) {
        if command == cmd::ADDITIONAL_FRAME {
            return self.continuation(params);
        }

        self.pending.clear();
        self.challenge = None;

        let result = match command {
            CMD_AUTHENTICATE_ISO | CMD_AUTHENTICATE_AES => return self.start_authentication(command, params),
            cmd::SELECT_APPLICATION => return self.select_application(params),
            cmd::WRITE_DATA => self.write_data(params),
            _ => self
                .open(command, params, 0, 0, CommMode::Plain)
                .and_then(|params| self.dispatch(command, &params)),
        };

        match result.and_then(|(data, mode)| self.seal(&data, mode)) {
            Ok(data) => self.chain(command, data),
            Err(sw) => {
                self.auth = None;
                (Vec::new(), sw)
            }
        }
    }

    fn continuation(&mut self, params: &[u8]) -> (Vec<u8>, u16) {
        if let Some(frame) = self.pending.pop_front() {
            return match self.pending.is_empty() {
                true => (frame, status::OK),
                _ => (frame, status::ADDITIONAL_FRAME),
            };
        }

        match self.challenge.take() {
            Some((challenge, key_no)) => match answer_challenge(challenge, params, key_no, self.selected) {
                Ok((proof, ctx)) => {
                    self.auth = Some(ctx);
                    (proof, status::OK)
                }
                Err(_) => (Vec::new(), status::AUTHENTICATION_ERROR),
            },
            None => (Vec::new(), COMMAND_ABORTED),
        }
    }

    fn start_authentication(&mut self, command: u8, params: &[u8]) -> (Vec<u8>, u16) {
        self.auth = None;

        let key = self.app().and_then(|app| {
            let key_no = *params.first().ok_or(LENGTH_ERROR)?;
            if (command == CMD_AUTHENTICATE_AES) != (app.cipher == Cipher::Aes) {
                return Err(status::AUTHENTICATION_ERROR);
            }

            let key = app.keys.get(key_no as usize).ok_or(NO_SUCH_KEY)?;
            Ok((key_no, app.cipher, key.clone()))
        });

        match key.and_then(|(key_no, cipher, key)| {
            issue_challenge(cipher, &key)
                .map(|(encrypted, challenge)| (key_no, encrypted, challenge))
                .map_err(|_| status::AUTHENTICATION_ERROR)
        }) {
            Ok((key_no, encrypted, challenge)) => {
                self.challenge = Some((challenge, key_no));
                (encrypted, status::ADDITIONAL_FRAME)
            }
            Err(sw) => (Vec::new(), sw),
        }
    }

    fn select_application(&mut self, params: &[u8]) -> (Vec<u8>, u16) {
        self.auth = None;
        self.selected_ef = None;

        let aid = from_le3(params);
        match params.len() >= 3 && self.apps.contains_key(&aid) {
            true => {
                self.selected = aid;
                (Vec::new(), status::OK)
            }
            _ => (Vec::new(), status::APPLICATION_NOT_FOUND),
        }
    }

    fn dispatch(&mut self, command: u8, params: &[u8]) -> CardResult<(Vec<u8>, CommMode)> {
        let plain = |data: Vec<u8>| -> CardResult<(Vec<u8>, CommMode)> { Ok((data, CommMode::Plain)) };

        match command {
            cmd::GET_VERSION => plain(self.version()),
            cmd::GET_APPLICATION_IDS => match self.selected {
                PICC => plain(self.apps.keys().filter(|aid| **aid != PICC).flat_map(|aid| le3(*aid)).collect()),
                _ => Err(status::PERMISSION_DENIED),
            },
            cmd::CREATE_APPLICATION => {
                self.require_picc_key()?;
                let [a0, a1, a2, _, keys] = params else {
                    return Err(LENGTH_ERROR);
                };

                let aid = from_le3(&[*a0, *a1, *a2]);
                let count = (keys & 0x0F) as usize;
                if aid == PICC || count == 0 || count > 14 {
                    return Err(status::PARAMETER_ERROR);
                }
                if self.apps.contains_key(&aid) {
                    return Err(status::DUPLICATE_ERROR);
                }

                let cipher = match keys & 0xC0 {
                    0x80 => Cipher::Aes,
                    0x40 => Cipher::ThreeKeyTdes,
                    _ => Cipher::Des,
                };
                self.apps
                    .insert(aid, Application::new(cipher, vec![vec![0u8; cipher.key_len()]; count]));
                plain(Vec::new())
            }
            cmd::DELETE_APPLICATION => {
                self.require_picc_key()?;
                match from_le3(params) {
                    PICC => Err(status::PARAMETER_ERROR),
                    aid => match self.apps.remove(&aid) {
                        Some(_) => plain(Vec::new()),
                        None => Err(status::APPLICATION_NOT_FOUND),
                    },
                }
            }
            cmd::GET_FILE_IDS => plain(self.app()?.files.keys().copied().collect()),
            cmd::GET_FILE_SETTINGS => {
                let file_id = *params.first().ok_or(LENGTH_ERROR)?;
                plain(self.settings(file_id)?.to_bytes())
            }
            cmd::CREATE_STD_DATA_FILE => {
                self.require_app_key()?;
                let [file_id, rest @ ..] = params else {
                    return Err(LENGTH_ERROR);
                };

                let mut bytes = vec![0x00];
                bytes.extend_from_slice(rest);
                let settings = FileSettings::parse(&bytes).map_err(|_| LENGTH_ERROR)?;
                if settings.size > self.free_memory() {
                    return Err(OUT_OF_EEPROM);
                }

                let app = self.app_mut()?;
                if app.files.contains_key(file_id) {
                    return Err(status::DUPLICATE_ERROR);
                }
                app.files.insert(
                    *file_id,
                    File {
                        settings,
                        iso_id: None,
                        data: vec![0u8; settings.size],
                    },
                );
                plain(Vec::new())
            }
            cmd::DELETE_FILE => {
                self.require_app_key()?;
                let file_id = params.first().ok_or(LENGTH_ERROR)?;
                match self.app_mut()?.files.remove(file_id) {
                    Some(_) => plain(Vec::new()),
                    None => Err(status::FILE_NOT_FOUND),
                }
            }
            cmd::READ_DATA => self.read_data(params),
            cmd::FREE_MEMORY => plain(le3(self.free_memory() as u32).to_vec()),
            cmd::FORMAT_PICC => {
                self.require_picc_key()?;
                self.apps.retain(|aid, _| *aid == PICC);
                plain(Vec::new())
            }
            _ => Err(ILLEGAL_COMMAND),
        }
    }

    fn read_data(&mut self, params: &[u8]) -> CardResult<(Vec<u8>, CommMode)> {
        if params.len() < 7 {
            return Err(LENGTH_ERROR);
        }

        let file_id = params[0];
        let settings = self.settings(file_id)?;
        let mode = settings
            .access
            .grant(Access::Read, self.auth_key(), settings.comm)
            .ok_or(status::PERMISSION_DENIED)?;

        let offset = from_le3(&params[1..4]) as usize;
        let len = match from_le3(&params[4..7]) as usize {
            0 => settings.size.saturating_sub(offset),
            len => len,
        };
        if offset + len > settings.size {
            return Err(status::BOUNDARY_ERROR);
        }

        let file = &self.app()?.files[&file_id];
        Ok((file.data[offset..offset + len].to_vec(), mode))
    }

    fn write_data(&mut self, params: &[u8]) -> CardResult<(Vec<u8>, CommMode)> {
        if params.len() < 7 {
            return Err(LENGTH_ERROR);
        }

        let file_id = params[0];
        let settings = self.settings(file_id)?;
        let mode = settings
            .access
            .grant(Access::Write, self.auth_key(), settings.comm)
            .ok_or(status::PERMISSION_DENIED)?;

        let offset = from_le3(&params[1..4]) as usize;
        let len = from_le3(&params[4..7]) as usize;
        let opened = self.open(cmd::WRITE_DATA, params, 7, len, mode)?;

        let data = opened.get(7..).ok_or(LENGTH_ERROR)?;
        if data.len() != len {
            return Err(LENGTH_ERROR);
        }
        if offset + len > settings.size {
            return Err(status::BOUNDARY_ERROR);
        }

        let file = self.app_mut()?.files.get_mut(&file_id).ok_or(status::FILE_NOT_FOUND)?;
        file.data[offset..offset + len].copy_from_slice(data);
        Ok((Vec::new(), CommMode::Plain))
    }

    fn iso(&mut self, command: &Apdu) -> (Vec<u8>, u16) {
        self.auth = None;
        self.pending.clear();
        self.challenge = None;

        let result = match (command.ins, command.p1) {
            (ins::SELECT_FILE, SELECT_BY_NAME) => self.select_df(command.data),
            (ins::SELECT_FILE, SELECT_EF) => self.select_ef(command.data),
            (ins::READ_BINARY, _) => self.read_binary(command),
            (ins::UPDATE_BINARY, _) => self.update_binary(command),
            _ => Err(ISO_INS_NOT_SUPPORTED),
        };

        match result {
            Ok(data) => (data, status::ISO_OK),
            Err(sw) => (Vec::new(), sw),
        }
    }

    fn select_df(&mut self, name: &[u8]) -> CardResult<Vec<u8>> {
        let aid = self
            .apps
            .iter()
            .find(|(_, app)| app.df_name.as_deref() == Some(name))
            .map(|(aid, _)| *aid)
            .ok_or(status::ISO_NOT_FOUND)?;

        self.selected = aid;
        self.selected_ef = None;
        Ok(Vec::new())
    }

    fn select_ef(&mut self, id: &[u8]) -> CardResult<Vec<u8>> {
        let file_id = self
            .app()
            .map_err(|_| status::ISO_NOT_FOUND)?
            .files
            .iter()
            .find(|(_, file)| file.iso_id.is_some_and(|iso| iso == id))
            .map(|(file_id, _)| *file_id)
            .ok_or(status::ISO_NOT_FOUND)?;

        self.selected_ef = Some(file_id);
        Ok(Vec::new())
    }

    fn current_ef(&mut self) -> CardResult<&mut File> {
        let file_id = self.selected_ef.ok_or(ISO_NO_CURRENT_EF)?;
        self.app_mut()
            .map_err(|_| ISO_NO_CURRENT_EF)?
            .files
            .get_mut(&file_id)
            .ok_or(ISO_NO_CURRENT_EF)
    }

    fn read_binary(&mut self, command: &Apdu) -> CardResult<Vec<u8>> {
        let offset = u16::from_be_bytes([command.p1, command.p2]) as usize;
        let le = match command.le.unwrap_or(0) {
            0 => 256,
            le => le as usize,
        };

        let file = self.current_ef()?;
        if file.settings.access.grant(Access::Read, None, file.settings.comm).is_none() {
            return Err(status::ISO_SECURITY);
        }
        if offset > file.data.len() {
            return Err(ISO_WRONG_OFFSET);
        }

        let end = (offset + le).min(file.data.len());
        Ok(file.data[offset..end].to_vec())
    }

    fn update_binary(&mut self, command: &Apdu) -> CardResult<Vec<u8>> {
        let offset = u16::from_be_bytes([command.p1, command.p2]) as usize;
        let data = command.data;

        let file = self.current_ef()?;
        if file.settings.access.grant(Access::Write, None, file.settings.comm).is_none() {
            return Err(status::ISO_SECURITY);
        }
        if offset + data.len() > file.data.len() {
            return Err(ISO_WRONG_OFFSET);
        }

        file.data[offset..offset + data.len()].copy_from_slice(data);
        Ok(Vec::new())
    }
}

impl VirtualTag for VirtualDesfire {
    fn signature(&self) -> Signature {
        Signature::Iso14443A {
            atqa: 0x0344,
            sak: 0x20,
            uid: self.uid.to_vec(),
            ats: Some(vec![0x06, 0x75, 0x77, 0x81, 0x02, 0x80]),
        }
    }

    fn handle(&mut self, frame: &[u8]) -> Result<Vec<u8>> {
        let command = Apdu::parse(frame).ok_or(Error::from(TransportError::Framing("malformed APDU")))?;

        let (mut payload, sw) = match command.cla {
            CLA_NATIVE => self.native(command.ins, command.data),
            CLA_ISO => self.iso(&command),
            _ => (Vec::new(), ISO_CLA_NOT_SUPPORTED),
        };

        payload.extend_from_slice(&sw.to_be_bytes());
        Ok(payload)
    }

    fn reset(&mut self) {
        self.selected = PICC;
        self.selected_ef = None;
        self.auth = None;
        self.challenge = None;
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use apdu::{command, Command};

    use super::*;
    use crate::auth::desfire::{respond_to_challenge, verify_final};
    use crate::backend::Reply;
    use crate::tag::desfire::wrap;

    const UID: [u8; 7] = [0x04, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66];

    fn send(card: &mut VirtualDesfire, command: u8, params: &[u8]) -> Reply {
        let frame = Vec::from(wrap(command, params.to_vec()));
        Reply::from_bytes(card.handle(&frame).unwrap()).unwrap()
    }

    fn authenticate(card: &mut VirtualDesfire, key_no: u8, cipher: Cipher, key: &[u8], aid: u32) -> AuthContext {
        let response = send(card, CMD_AUTHENTICATE_AES, &[key_no]);
        assert_eq!(status::ADDITIONAL_FRAME, response.sw);

        let (token, challenge) = respond_to_challenge(cipher, key, &response.data).unwrap();
        let response = send(card, cmd::ADDITIONAL_FRAME, &token);
        assert_eq!(status::OK, response.sw);

        verify_final(challenge, &response.data, key_no, aid).unwrap()
    }

    #[test]
    fn test_parse_apdu() {
        let frame = [0x00, 0xA4, 0x04, 0x00, 0x02, 0xE1, 0x04, 0x00];
        let apdu = Apdu::parse(&frame).unwrap();

        assert_eq!(ins::SELECT_FILE, apdu.ins);
        assert_eq!(&[0xE1, 0x04], apdu.data);
        assert_eq!(Some(0x00), apdu.le);
        assert!(Apdu::parse(&[0x00, 0xA4, 0x04]).is_none());
        assert!(Apdu::parse(&[0x00, 0xD6, 0x00, 0x00, 0x05, 0x01]).is_none());
    }

    #[test]
    fn test_get_version_is_chained() {
        let mut card = VirtualDesfire::new(UID);

        let first = send(&mut card, cmd::GET_VERSION, &[]);
        assert_eq!(status::ADDITIONAL_FRAME, first.sw);
        assert_eq!(7, first.data.len());

        send(&mut card, cmd::ADDITIONAL_FRAME, &[]);
        let last = send(&mut card, cmd::ADDITIONAL_FRAME, &[]);
        assert_eq!(status::OK, last.sw);
        assert_eq!(&UID, &last.data[..7]);
    }

    #[test]
    fn test_enciphered_file_round_trip() {
        let key = vec![0x42; 16];
        let mut card = VirtualDesfire::new(UID)
            .with_application(2, Cipher::Aes, vec![vec![0u8; 16], key.clone()])
            .with_file(2, 1, CommMode::Enciphered, AccessRights::new(0xE, 0x1, 0x1, 0x0), vec![0u8; 32]);

        assert_eq!(status::OK, send(&mut card, cmd::SELECT_APPLICATION, &le3(2)).sw);

        let header = [0x01, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00];
        let denied = send(&mut card, cmd::WRITE_DATA, &[&header[..], &[1, 2, 3, 4]].concat());
        assert_eq!(status::PERMISSION_DENIED, denied.sw);

        let mut host = authenticate(&mut card, 1, Cipher::Aes, &key, 2);
        let params = host
            .wrap_command(cmd::WRITE_DATA, &header, &[1, 2, 3, 4], CommMode::Enciphered)
            .unwrap();
        let response = send(&mut card, cmd::WRITE_DATA, &params);
        assert_eq!(status::OK, response.sw);
        host.unwrap_response(&response.data, CommMode::Plain, 0).unwrap();

        let read = [0x01, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00];
        let params = host.wrap_command(cmd::READ_DATA, &read, &[], CommMode::Plain).unwrap();
        let response = send(&mut card, cmd::READ_DATA, &params);
        assert_eq!(
            vec![1, 2, 3, 4],
            host.unwrap_response(&response.data, CommMode::Enciphered, 4).unwrap()
        );
    }

    #[test]
    fn test_ndef_application_over_iso() {
        let mut card = VirtualDesfire::new(UID).with_ndef_application(128);
        let iso = |card: &mut VirtualDesfire, command: Command| {
            Reply::from_bytes(card.handle(&Vec::from(command)).unwrap()).unwrap()
        };

        let missing = iso(&mut card, command::select_file(SELECT_EF, 0x0C, vec![0xE1, 0x03]).into());
        assert_eq!(status::ISO_NOT_FOUND, missing.sw);

        let select = iso(&mut card, command::select_file(SELECT_BY_NAME, 0x0C, NDEF_DF_NAME.to_vec()).into());
        assert_eq!(status::ISO_OK, select.sw);
        iso(&mut card, command::select_file(SELECT_EF, 0x0C, vec![0xE1, 0x03]).into());

        let cc = iso(&mut card, command::read_binary(0x00, 0x00, 15).into());
        assert_eq!(15, cc.data.len());
        assert_eq!(&[0x00, 0x80], &cc.data[11..13]);
    }
}
