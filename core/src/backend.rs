//! Transport backends.
//!
//! A backend owns the physical connection to one reader. It activates tags in the field
//! (reporting their technology [`Signature`]) and exchanges tag-level frames with the
//! activated tag. Framing differences between readers stay inside the backend:
//!
//! - USB and UART readers are PN53x-class controllers; their host commands travel in the
//!   PN53x normal information frame, see [`frame`].
//! - PC/SC readers receive APDUs for ISO-DEP tags and the PC/SC Part 3
//!   transparent-exchange envelope for storage tags.
//!
//! Each physical backend is enabled through its own cargo feature (`usb`, `pcsc`, `uart`).

pub mod atr;
pub mod ber;
pub mod frame;
pub mod pn53x;

#[cfg(feature = "pcsc")]
pub mod pcsc;

#[cfg(feature = "uart")]
pub mod uart;

#[cfg(feature = "usb")]
pub mod usb;

use std::fmt::{Display, Formatter};
use std::time::Duration;

use crate::error::{Error, Result, TransportError};
use crate::session::{ReaderDescriptor, TransportParams};

/// Physical transport of a reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum BackendKind {
    Usb,
    Pcsc,
    Uart,
    Virtual,
}

/// Order in which backends are tried when the reader type is `auto`.
pub const AUTO_ORDER: [BackendKind; 3] = [BackendKind::Usb, BackendKind::Pcsc, BackendKind::Uart];

impl Display for BackendKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            BackendKind::Usb => "usb",
            BackendKind::Pcsc => "pcsc",
            BackendKind::Uart => "uart",
            BackendKind::Virtual => "virtual",
        })
    }
}

/// What a tag reported while it was being activated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signature {
    /// ISO 14443-A anticollision result. `atqa` is in the conventional big-endian notation
    /// (`0x0044` for NTAG, `0x0C00` for Topaz).
    Iso14443A {
        atqa: u16,
        sak: u8,
        uid: Vec<u8>,
        ats: Option<Vec<u8>>,
    },

    /// FeliCa polling response.
    FeliCa {
        idm: [u8; 8],
        pmm: [u8; 8],
        system_code: Option<u16>,
    },

    /// ISO 15693 inventory response. The UID is kept in wire order (LSB first).
    Iso15693 { uid: [u8; 8], dsfid: u8 },

    /// Answer-to-reset built by a PC/SC reader, plus the UID from `GET DATA`.
    Atr { atr: Vec<u8>, uid: Vec<u8> },
}

impl Signature {
    /// Identifier of the tag as reported during activation.
    pub fn uid(&self) -> &[u8] {
        match self {
            Signature::Iso14443A { uid, .. } => uid,
            Signature::FeliCa { idm, .. } => idm,
            Signature::Iso15693 { uid, .. } => uid,
            Signature::Atr { uid, .. } => uid,
        }
    }
}

/// Data and status word of an ISO 7816-4 response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub data: Vec<u8>,
    pub sw: u16,
}

impl Reply {
    pub const OK: u16 = 0x9000;

    /// Splits the trailing SW1 SW2 off the received octets.
    pub fn from_bytes(rx: Vec<u8>) -> Result<Self> {
        if rx.len() < 2 {
            return Err(TransportError::Framing("response without a status word").into());
        }

        Ok(apdu::Response::from(rx).into())
    }

    /// The data when the status word is `90 00`.
    pub fn into_result(self) -> Result<Vec<u8>> {
        match self.sw {
            Self::OK => Ok(self.data),
            sw => Err(Error::Status(sw)),
        }
    }
}

impl From<apdu::Response> for Reply {
    fn from(response: apdu::Response) -> Self {
        let (sw1, sw2) = response.trailer;

        Self {
            data: response.payload,
            sw: u16::from_be_bytes([sw1, sw2]),
        }
    }
}

/// A connection to one reader.
///
/// Implementations are not shared between threads; the session owning the backend
/// is the only caller.
pub trait Backend: Send {
    /// Transport this backend talks through.
    fn kind(&self) -> BackendKind;

    /// Human-readable name of the reader.
    fn name(&self) -> &str;

    /// Looks for a tag in the field once, activating it when found.
    fn poll(&mut self, timeout: Duration) -> Result<Option<Signature>>;

    /// Sends a tag-level frame to the activated tag and returns its answer.
    fn transceive(&mut self, frame: &[u8], timeout: Duration) -> Result<Vec<u8>>;

    /// Deselects the activated tag.
    fn release(&mut self) -> Result<()>;

    /// Closes the connection. The backend is unusable afterwards.
    fn close(&mut self);
}

/// Opens backends on behalf of a session.
pub trait Opener: Send {
    fn open(
        &self,
        kind: BackendKind,
        descriptor: Option<&ReaderDescriptor>,
        params: &TransportParams,
    ) -> Result<Box<dyn Backend>>;
}

/// Opens the physical backends compiled into this build.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemOpener;

impl Opener for SystemOpener {
    #[allow(unused_variables)]
    fn open(
        &self,
        kind: BackendKind,
        descriptor: Option<&ReaderDescriptor>,
        params: &TransportParams,
    ) -> Result<Box<dyn Backend>> {
        match kind {
            #[cfg(feature = "usb")]
            BackendKind::Usb => Ok(Box::new(usb::open(descriptor, params)?)),

            #[cfg(feature = "pcsc")]
            BackendKind::Pcsc => Ok(Box::new(pcsc::PcscBackend::open(descriptor, params)?)),

            #[cfg(feature = "uart")]
            BackendKind::Uart => Ok(Box::new(uart::open(descriptor, params)?)),

            _ => Err(TransportError::Unavailable.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply() {
        let ok = Reply::from_bytes(vec![0x01, 0x02, 0x90, 0x00]).unwrap();
        assert_eq!(vec![0x01, 0x02], ok.into_result().unwrap());

        let additional = Reply::from_bytes(vec![0xAA, 0x91, 0xAF]).unwrap();
        assert_eq!(0x91AF, additional.sw);
        assert_eq!(vec![0xAA], additional.data);

        let missing = Reply::from_bytes(vec![0x6A, 0x82]).unwrap();
        assert!(matches!(missing.into_result(), Err(Error::Status(0x6A82))));

        assert!(Reply::from_bytes(vec![0x90]).is_err());
    }
}
