//! PC/SC support for contactless readers.
//! Can be enabled by turning `pcsc` feature on.
//!
//! ## What is PC/SC?
//! PC/SC (Personal Computer/Smart Card) is an abstraction layer for communicating with Smart Cards
//! from Windows. Using this layer, applications can connect to any devices that supports PC/SC,
//! without depending on their driver implementation. Windows and macOS supports PC/SC by themselves,
//! Linux also supports by installing pcsc-lite shared library.
//!
//! ## Contactless cards on PC/SC
//! The reader builds an ATR for every contactless card. ISO-DEP cards (DESFire) take APDUs
//! directly. Memory cards are described by a PC/SC Part 3 ATR carrying the card standard
//! and name; their native frames are wrapped in the transparent exchange envelope:
//!
//! ```text
//! FF C2 00 01 Lc [5F46 04 timer] [95 len frame] 00
//! ```
//!
//! and the frame the card answered comes back in the `97` data object.

use std::ffi::CString;
use std::time::Duration;

use apdu::Command;
use pcsc::{Attribute, Card, Disposition, Protocols, Scope, ShareMode, MAX_BUFFER_SIZE};

use crate::backend::atr::{standard, StorageAtr};
use crate::backend::{ber, Backend, BackendKind, Reply, Signature};
use crate::error::{Error, Result, TransportError};
use crate::session::{ReaderDescriptor, TransportParams};
use crate::trace::{debug, info, warn};

const CLA_PSEUDO: u8 = 0xFF;
const INS_GET_DATA: u8 = 0xCA;
const INS_LOAD_KEY: u8 = 0x82;
const INS_GENERAL_AUTHENTICATE: u8 = 0x86;
const INS_ENVELOPE: u8 = 0xC2;

const P2_MANAGE_SESSION: u8 = 0x00;
const P2_TRANSPARENT_EXCHANGE: u8 = 0x01;
const P2_SWITCH_PROTOCOL: u8 = 0x02;

const TAG_START_SESSION: u16 = 0x81;
const TAG_END_SESSION: u16 = 0x82;
const TAG_SWITCH_PROTOCOL: u16 = 0x8F;
const TAG_TRANSCEIVE: u16 = 0x95;
const TAG_TIMER: u16 = 0x5F46;
const TAG_STATUS: u16 = 0xC0;
const TAG_RESPONSE: u16 = 0x97;

/// How frames reach the connected card.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Apdu,
    Transparent,
}

/// A contactless reader reached through PC/SC.
pub struct PcscBackend {
    ctx: pcsc::Context,
    reader: CString,
    name: String,
    card: Option<(Card, Mode)>,
}

impl PcscBackend {
    /// Establishes a context and picks the first reader matching the descriptor's name filter.
    pub fn open(descriptor: Option<&ReaderDescriptor>, params: &TransportParams) -> Result<Self> {
        let ctx = pcsc::Context::establish(Scope::User).map_err(TransportError::Pcsc)?;

        let filter = params
            .pcsc_reader
            .clone()
            .or_else(|| descriptor.map(|d| d.name.clone()));

        let reader = ctx
            .list_readers_owned()
            .map_err(|e| match e {
                pcsc::Error::NoReadersAvailable => Error::NoReaderFound,
                e => TransportError::Pcsc(e).into(),
            })?
            .into_iter()
            .find(|r| match &filter {
                Some(f) => r.to_string_lossy().contains(f.as_str()),
                None => true,
            })
            .ok_or(Error::NoReaderFound)?;

        let name = reader.to_string_lossy().into_owned();
        info!("Using PC/SC reader: {}", name);

        Ok(Self {
            ctx,
            reader,
            name,
            card: None,
        })
    }

    fn transmit(card: &Card, tx: &[u8]) -> Result<Vec<u8>> {
        debug!("TX: {}", hex::encode(tx));

        let mut rx = [0u8; MAX_BUFFER_SIZE];
        let rx = card.transmit(tx, &mut rx).map_err(|e| match e {
            pcsc::Error::RemovedCard | pcsc::Error::ResetCard => Error::FieldLost,
            e => TransportError::Pcsc(e).into(),
        })?;

        debug!("RX: {}", hex::encode(rx));

        Ok(Vec::from(rx))
    }

    /// Sends a command to the reader itself and returns its data on `90 00`.
    fn handle(card: &Card, command: impl Into<Command>) -> Result<Vec<u8>> {
        let tx = Vec::from(command.into());
        Reply::from_bytes(Self::transmit(card, &tx)?)?.into_result()
    }

    fn envelope(card: &Card, p2: u8, data: Vec<u8>) -> Result<Vec<u8>> {
        Self::handle(card, Command::new_with_payload_le(CLA_PSEUDO, INS_ENVELOPE, 0x00, p2, 0, data))
    }

    /// Starts a transparent session and switches it to the card's protocol.
    fn start_transparent(card: &Card, atr: StorageAtr) -> Result<()> {
        Self::envelope(card, P2_MANAGE_SESSION, ber::encode(TAG_START_SESSION, &[]))?;

        let protocol: [u8; 2] = match atr.standard {
            standard::FELICA => [0x03, 0x00],
            standard::ISO15693_3 | standard::ISO15693_4 => [0x02, 0x03],
            _ => [0x00, 0x03],
        };
        Self::envelope(card, P2_SWITCH_PROTOCOL, ber::encode(TAG_SWITCH_PROTOCOL, &protocol))?;

        Ok(())
    }

    fn transparent_exchange(card: &Card, frame: &[u8], timeout: Duration) -> Result<Vec<u8>> {
        let micros = u32::try_from(timeout.as_micros()).unwrap_or(u32::MAX);

        let mut data = ber::encode(TAG_TIMER, &micros.to_be_bytes());
        data.extend(ber::encode(TAG_TRANSCEIVE, frame));

        let response = Self::envelope(card, P2_TRANSPARENT_EXCHANGE, data)?;

        match ber::find(&response, TAG_STATUS) {
            Some([_, 0x90, 0x00]) | None => {}
            Some([_, 0x64, 0x01]) => return Err(Error::FieldLost),
            Some([_, sw1, sw2]) => return Err(Error::Status(u16::from_be_bytes([*sw1, *sw2]))),
            Some(_) => return Err(TransportError::Framing("malformed status object").into()),
        }

        Ok(ber::find(&response, TAG_RESPONSE).unwrap_or_default().to_vec())
    }

    /// Loads a MIFARE key into the reader and authenticates the block with it.
    /// `frame` is the native `60|61 block key(6) uid(4)` authentication frame.
    fn mifare_authenticate(card: &Card, frame: &[u8]) -> Result<Vec<u8>> {
        let (key_type, block, key) = match frame {
            [key_type @ (0x60 | 0x61), block, key @ ..] if key.len() >= 6 => (*key_type, *block, &key[..6]),
            _ => return Err(TransportError::Framing("malformed authentication frame").into()),
        };

        let load = Command::new_with_payload(CLA_PSEUDO, INS_LOAD_KEY, 0x00, 0x00, key.to_vec());
        Self::handle(card, load)?;

        let auth = Command::new_with_payload(
            CLA_PSEUDO,
            INS_GENERAL_AUTHENTICATE,
            0x00,
            0x00,
            vec![0x01, 0x00, block, key_type, 0x00],
        );
        Self::handle(card, auth).map_err(|_| Error::AuthenticationFailed)
    }

    fn drop_card(&mut self) {
        if let Some((card, mode)) = self.card.take() {
            if mode == Mode::Transparent {
                let _ = Self::envelope(&card, P2_MANAGE_SESSION, ber::encode(TAG_END_SESSION, &[]));
            }

            if let Err((_, e)) = card.disconnect(Disposition::LeaveCard) {
                warn!("Could not disconnect the card: {}", e);
            }
        }
    }
}

impl Backend for PcscBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Pcsc
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn poll(&mut self, _: Duration) -> Result<Option<Signature>> {
        self.drop_card();

        let card = match self
            .ctx
            .connect(&self.reader, ShareMode::Shared, Protocols::ANY)
        {
            Ok(card) => card,
            Err(pcsc::Error::NoSmartcard) | Err(pcsc::Error::RemovedCard) => return Ok(None),
            Err(e) => return Err(TransportError::Pcsc(e).into()),
        };
        debug!("Connected to the card");

        let atr = card
            .get_attribute_owned(Attribute::AtrString)
            .map_err(TransportError::Pcsc)?;
        let get_uid = Vec::from(Command::new_with_le(CLA_PSEUDO, INS_GET_DATA, 0x00, 0x00, 0));
        let uid = Reply::from_bytes(Self::transmit(&card, &get_uid)?)?
            .into_result()
            .unwrap_or_default();

        let mode = match StorageAtr::parse(&atr) {
            Some(storage) => {
                Self::start_transparent(&card, storage)?;
                Mode::Transparent
            }
            None => Mode::Apdu,
        };

        self.card = Some((card, mode));

        Ok(Some(Signature::Atr { atr, uid }))
    }

    fn transceive(&mut self, frame: &[u8], timeout: Duration) -> Result<Vec<u8>> {
        let (card, mode) = self.card.as_ref().ok_or(Error::NoTag)?;

        match mode {
            Mode::Apdu => Self::transmit(card, frame),
            Mode::Transparent if matches!(frame, [0x60 | 0x61, ..]) && frame.len() == 12 => {
                Self::mifare_authenticate(card, frame)
            }
            Mode::Transparent => Self::transparent_exchange(card, frame, timeout),
        }
    }

    fn release(&mut self) -> Result<()> {
        self.drop_card();
        Ok(())
    }

    fn close(&mut self) {
        self.drop_card();
    }
}
