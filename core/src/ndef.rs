//! NDEF message codec.
//!
//! ```text
//!  7    6    5    4    3    2..0
//! [MB] [ME] [CF] [SR] [IL] [TNF]   TYPE_LENGTH  PAYLOAD_LENGTH(1|4)  [ID_LENGTH]
//! TYPE  [ID]  PAYLOAD
//! ```
//!
//! Messages are encoded without chunking, with short records whenever the payload fits.
//! Decoding accepts chunked records and hands them back reassembled.

pub mod record;
pub mod rtd;
pub mod tlv;

pub use record::{NdefRecord, Tnf};

use crate::error::{Error, Result};

const MB: u8 = 0x80;
const ME: u8 = 0x40;
const CF: u8 = 0x20;
const SR: u8 = 0x10;
const IL: u8 = 0x08;
const TNF_MASK: u8 = 0x07;

/// An ordered list of NDEF records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct NdefMessage {
    records: Vec<NdefRecord>,
}

impl NdefMessage {
    pub fn new(records: Vec<NdefRecord>) -> Self {
        Self { records }
    }

    pub fn records(&self) -> &[NdefRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<NdefRecord> {
        self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Encodes the message. A message without records encodes to no bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        encode(self)
    }

    /// Decodes a message. No bytes decode to a message without records.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        decode(bytes)
    }
}

impl From<NdefRecord> for NdefMessage {
    fn from(record: NdefRecord) -> Self {
        Self::new(vec![record])
    }
}

/// Encodes a message.
pub fn encode(message: &NdefMessage) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let last = message.records.len().saturating_sub(1);

    for (i, record) in message.records.iter().enumerate() {
        record.validate()?;

        let short = record.payload.len() <= 0xFF;
        let mut header = record.tnf.to_bits();
        if i == 0 {
            header |= MB;
        }
        if i == last {
            header |= ME;
        }
        if short {
            header |= SR;
        }
        if !record.id.is_empty() {
            header |= IL;
        }

        out.push(header);
        out.push(record.record_type.len() as u8);
        match short {
            true => out.push(record.payload.len() as u8),
            _ => {
                let len = u32::try_from(record.payload.len())
                    .map_err(|_| Error::MalformedNdef("payload longer than 4 GiB"))?;
                out.extend_from_slice(&len.to_be_bytes());
            }
        }
        if !record.id.is_empty() {
            out.push(record.id.len() as u8);
        }

        out.extend_from_slice(&record.record_type);
        out.extend_from_slice(&record.id);
        out.extend_from_slice(&record.payload);
    }

    Ok(out)
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or(Error::MalformedNdef("truncated record"))?;
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn byte(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }
}

/// Decodes a message, reassembling chunked records.
pub fn decode(bytes: &[u8]) -> Result<NdefMessage> {
    let mut cursor = Cursor { buf: bytes, pos: 0 };
    let mut records = Vec::new();
    let mut chunked: Option<NdefRecord> = None;
    let mut first = true;
    let mut ended = false;

    while cursor.pos < bytes.len() {
        if ended {
            return Err(Error::MalformedNdef("trailing bytes after the last record"));
        }

        let header = cursor.byte()?;
        match (first, header & MB != 0) {
            (true, false) => return Err(Error::MalformedNdef("first record lacks MB")),
            (false, true) => return Err(Error::MalformedNdef("MB set on a later record")),
            _ => {}
        }
        first = false;

        let tnf = Tnf::try_from(header & TNF_MASK)?;
        let type_len = cursor.byte()? as usize;
        let payload_len = match header & SR != 0 {
            true => cursor.byte()? as usize,
            _ => {
                let raw = cursor.take(4)?;
                u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize
            }
        };
        let id_len = match header & IL != 0 {
            true => cursor.byte()? as usize,
            _ => 0,
        };

        let record_type = cursor.take(type_len)?.to_vec();
        let id = cursor.take(id_len)?.to_vec();
        let payload = cursor.take(payload_len)?;

        let more = header & CF != 0;
        ended = header & ME != 0;

        match chunked.as_mut() {
            Some(head) => {
                if tnf != Tnf::Unchanged || type_len != 0 || id_len != 0 {
                    return Err(Error::MalformedNdef("invalid middle or terminating chunk"));
                }
                head.payload.extend_from_slice(payload);

                if !more {
                    records.extend(chunked.take());
                }
            }
            None => {
                let record = NdefRecord {
                    tnf,
                    record_type,
                    id,
                    payload: payload.to_vec(),
                };
                if tnf == Tnf::Unchanged {
                    return Err(Error::MalformedNdef("unchanged type outside a chunked record"));
                }
                if tnf == Tnf::Empty
                    && (!record.record_type.is_empty() || !record.id.is_empty() || !record.payload.is_empty())
                {
                    return Err(Error::MalformedNdef("empty record with content"));
                }

                match more {
                    true => chunked = Some(record),
                    _ => records.push(record),
                }
            }
        }

        if ended && more {
            return Err(Error::MalformedNdef("message ends inside a chunked record"));
        }
    }

    if !bytes.is_empty() && !ended {
        return Err(Error::MalformedNdef("last record lacks ME"));
    }

    Ok(NdefMessage { records })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_single_uri() {
        let message = NdefMessage::from(NdefRecord::uri("https://example.com"));
        let bytes = message.encode().unwrap();

        assert_eq!(
            &[0xD1, 0x01, 0x0C, b'U', 0x04][..],
            &bytes[..5],
        );
        assert_eq!(message, NdefMessage::decode(&bytes).unwrap());
    }

    #[test]
    fn test_roundtrip_mixed_records() {
        let message = NdefMessage::new(vec![
            NdefRecord::text("en", "hello"),
            NdefRecord::mime("application/octet-stream", vec![0xAB; 300]).with_id("blob"),
            NdefRecord::external("example.com:t", b"x".to_vec()),
            NdefRecord::new(Tnf::Unknown, Vec::new(), vec![1, 2, 3]),
            NdefRecord::uri("tel:+123"),
        ]);

        let bytes = message.encode().unwrap();
        assert_eq!(0x80, bytes[0] & MB);

        assert_eq!(message, NdefMessage::decode(&bytes).unwrap());
    }

    #[test]
    fn test_chunked_record_reassembled() {
        let bytes = [
            0xB2, 0x0A, 0x03, b't', b'e', b'x', b't', b'/', b'p', b'l', b'a', b'i', b'n', b'a', b'b',
            b'c', // MB CF SR Media
            0x36, 0x00, 0x02, b'd', b'e', // Unchanged chunk
            0x56, 0x00, 0x01, b'f', // ME Unchanged, last chunk
        ];

        let message = decode(&bytes).unwrap();
        assert_eq!(1, message.records().len());
        assert_eq!(b"abcdef".to_vec(), message.records()[0].payload);
        assert_eq!(Tnf::Media, message.records()[0].tnf);
    }

    /// Wire form of `records`, each payload split into chunks of the paired size.
    fn chunked_wire(records: &[(NdefRecord, Option<usize>)]) -> Vec<u8> {
        let mut out = Vec::new();
        let last = records.len() - 1;

        for (i, (record, size)) in records.iter().enumerate() {
            let start = out.len();
            let mut tail = start;
            match size {
                None => {
                    let mut bytes = NdefMessage::from(record.clone()).encode().unwrap();
                    bytes[0] &= !(MB | ME);
                    out.extend(bytes);
                }
                Some(size) => {
                    let pieces: Vec<&[u8]> = record.payload.chunks(*size).collect();
                    for (j, piece) in pieces.iter().enumerate() {
                        tail = out.len();
                        let (tnf, record_type) = match j {
                            0 => (record.tnf, &record.record_type[..]),
                            _ => (Tnf::Unchanged, &[][..]),
                        };
                        let more = if j + 1 < pieces.len() { CF } else { 0 };

                        out.push(tnf.to_bits() | SR | more);
                        out.push(record_type.len() as u8);
                        out.push(piece.len() as u8);
                        out.extend_from_slice(record_type);
                        out.extend_from_slice(piece);
                    }
                }
            }

            if i == 0 {
                out[start] |= MB;
            }
            if i == last {
                out[tail] |= ME;
            }
        }

        out
    }

    #[test]
    fn test_roundtrip_chunked_and_long_records() {
        let pool = [
            (NdefRecord::mime("application/octet-stream", vec![0x5A; 600]), Some(200)),
            (NdefRecord::text("en", "short"), None),
            (NdefRecord::external("example.com:blob", vec![0xC3; 300]), None),
            (NdefRecord::mime("text/plain", b"chunked text".to_vec()), Some(5)),
            (NdefRecord::uri("https://example.com/a"), None),
        ];

        for n in 1..=pool.len() {
            let expected = NdefMessage::new(pool[..n].iter().map(|(r, _)| r.clone()).collect());

            let decoded = decode(&chunked_wire(&pool[..n])).unwrap();
            assert_eq!(expected, decoded, "{} records", n);

            let bytes = decoded.encode().unwrap();
            assert_eq!(expected, decode(&bytes).unwrap(), "{} records re-encoded", n);
        }
    }

    #[test]
    fn test_rejects_malformed_framing() {
        // First record without MB
        assert!(matches!(decode(&[0x51, 0x01, 0x00, b'T']), Err(Error::MalformedNdef(_))));
        // Last record without ME
        assert!(matches!(decode(&[0x91, 0x01, 0x00, b'T']), Err(Error::MalformedNdef(_))));
        // Trailing bytes after ME
        assert!(matches!(
            decode(&[0xD1, 0x01, 0x00, b'T', 0x00]),
            Err(Error::MalformedNdef(_))
        ));
        // Reserved TNF
        assert!(matches!(decode(&[0xD7, 0x00, 0x00]), Err(Error::MalformedNdef(_))));
        // Truncated payload
        assert!(matches!(decode(&[0xD1, 0x01, 0x05, b'T', 0x00]), Err(Error::MalformedNdef(_))));
        // Empty record carrying a payload
        assert!(matches!(decode(&[0xD0, 0x00, 0x01, 0x00]), Err(Error::MalformedNdef(_))));
    }

    #[test]
    fn test_empty_message() {
        assert_eq!(NdefMessage::default(), decode(&[]).unwrap());
        assert!(NdefMessage::default().encode().unwrap().is_empty());

        let empty_record = NdefMessage::from(NdefRecord::empty());
        assert_eq!(vec![0xD0, 0x00, 0x00], empty_record.encode().unwrap());
    }

    #[test]
    fn test_encode_rejects_invalid_records() {
        let message = NdefMessage::from(NdefRecord::new(Tnf::Unchanged, Vec::new(), vec![1]));
        assert!(message.encode().is_err());

        let message = NdefMessage::from(NdefRecord::new(Tnf::WellKnown, Vec::new(), vec![1]));
        assert!(message.encode().is_err());
    }
}
