use crate::error::{Error, Result};

/// Type Name Format of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum Tnf {
    Empty,
    WellKnown,
    Media,
    AbsoluteUri,
    External,
    Unknown,
    Unchanged,
}

impl Tnf {
    pub fn to_bits(self) -> u8 {
        match self {
            Tnf::Empty => 0x00,
            Tnf::WellKnown => 0x01,
            Tnf::Media => 0x02,
            Tnf::AbsoluteUri => 0x03,
            Tnf::External => 0x04,
            Tnf::Unknown => 0x05,
            Tnf::Unchanged => 0x06,
        }
    }
}

impl TryFrom<u8> for Tnf {
    type Error = Error;

    fn try_from(bits: u8) -> Result<Self> {
        Ok(match bits {
            0x00 => Tnf::Empty,
            0x01 => Tnf::WellKnown,
            0x02 => Tnf::Media,
            0x03 => Tnf::AbsoluteUri,
            0x04 => Tnf::External,
            0x05 => Tnf::Unknown,
            0x06 => Tnf::Unchanged,
            _ => return Err(Error::MalformedNdef("reserved type name format")),
        })
    }
}

/// One NDEF record. Chunked records are always presented reassembled.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct NdefRecord {
    pub tnf: Tnf,
    pub record_type: Vec<u8>,
    pub id: Vec<u8>,
    pub payload: Vec<u8>,
}

impl NdefRecord {
    pub fn new(tnf: Tnf, record_type: impl Into<Vec<u8>>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            tnf,
            record_type: record_type.into(),
            id: Vec::new(),
            payload: payload.into(),
        }
    }

    pub fn with_id(mut self, id: impl Into<Vec<u8>>) -> Self {
        self.id = id.into();
        self
    }

    /// The empty record, as found in an empty NDEF message.
    pub fn empty() -> Self {
        Self::new(Tnf::Empty, Vec::new(), Vec::new())
    }

    /// A MIME media record.
    pub fn mime(media_type: &str, payload: impl Into<Vec<u8>>) -> Self {
        Self::new(Tnf::Media, media_type.as_bytes(), payload)
    }

    /// An NFC Forum external type record (`domain:type`).
    pub fn external(domain_type: &str, payload: impl Into<Vec<u8>>) -> Self {
        Self::new(Tnf::External, domain_type.as_bytes(), payload)
    }

    /// Checks the combination of TNF and fields a writer may put on the wire.
    pub(crate) fn validate(&self) -> Result<()> {
        match self.tnf {
            Tnf::Empty if !self.record_type.is_empty() || !self.id.is_empty() || !self.payload.is_empty() => {
                Err(Error::MalformedNdef("empty record with content"))
            }
            Tnf::Unknown if !self.record_type.is_empty() => {
                Err(Error::MalformedNdef("unknown record with a type"))
            }
            Tnf::Unchanged => Err(Error::MalformedNdef("unchanged type outside a chunked record")),
            Tnf::WellKnown | Tnf::Media | Tnf::AbsoluteUri | Tnf::External if self.record_type.is_empty() => {
                Err(Error::MalformedNdef("record type missing"))
            }
            _ if self.record_type.len() > 0xFF || self.id.len() > 0xFF => {
                Err(Error::MalformedNdef("type or id longer than 255 bytes"))
            }
            _ => Ok(()),
        }
    }
}
