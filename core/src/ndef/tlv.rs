//! TLV blocks wrapping NDEF messages on Type 1, 2 and 5 tags.
//!
//! Lengths take one byte, or `FF` followed by two big-endian bytes from 255 up.
//! `NULL` blocks carry no length; the terminator ends the area.

use crate::error::{Error, Result};

pub const NULL: u8 = 0x00;
pub const LOCK_CONTROL: u8 = 0x01;
pub const MEMORY_CONTROL: u8 = 0x02;
pub const NDEF: u8 = 0x03;
pub const PROPRIETARY: u8 = 0xFD;
pub const TERMINATOR: u8 = 0xFE;

/// An empty NDEF TLV followed by the terminator, as written by `format`.
pub const EMPTY_NDEF: [u8; 3] = [NDEF, 0x00, TERMINATOR];

/// One TLV block inside a data area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tlv<'a> {
    pub tag: u8,
    pub offset: usize,
    pub value: &'a [u8],
}

/// Parses the TLV blocks of a data area up to the terminator or the end of the area.
pub fn parse(area: &[u8]) -> Result<Vec<Tlv<'_>>> {
    let mut blocks = Vec::new();
    let mut pos = 0;

    while let Some(&tag) = area.get(pos) {
        match tag {
            NULL => {
                pos += 1;
                continue;
            }
            TERMINATOR => break,
            _ => {}
        }

        let offset = pos;
        let (len, header) = match area.get(pos + 1..) {
            Some([0xFF, hi, lo, ..]) => (u16::from_be_bytes([*hi, *lo]) as usize, 4),
            Some([len, ..]) => (*len as usize, 2),
            _ => return Err(Error::MalformedNdef("truncated TLV length")),
        };

        let value = area
            .get(pos + header..pos + header + len)
            .ok_or(Error::MalformedNdef("TLV runs past the data area"))?;
        blocks.push(Tlv { tag, offset, value });

        pos += header + len;
    }

    Ok(blocks)
}

/// Returns the contents of the first NDEF TLV. An area without one holds no message.
pub fn find_ndef(area: &[u8]) -> Result<Option<&[u8]>> {
    Ok(parse(area)?
        .into_iter()
        .find(|tlv| tlv.tag == NDEF)
        .map(|tlv| tlv.value))
}

/// Encodes one TLV block.
pub fn encode(tag: u8, value: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(value.len() + 4);
    out.push(tag);

    match value.len() {
        len if len < 0xFF => out.push(len as u8),
        len if len <= 0xFFFE => {
            out.push(0xFF);
            out.extend_from_slice(&(len as u16).to_be_bytes());
        }
        _ => return Err(Error::MalformedNdef("TLV value too long")),
    }

    out.extend_from_slice(value);
    Ok(out)
}

/// Wraps an encoded message into an NDEF TLV that fits an area of `capacity` bytes.
/// The terminator is appended when there is room left for it.
pub fn wrap_ndef(message: &[u8], capacity: usize) -> Result<Vec<u8>> {
    let mut out = encode(NDEF, message)?;
    if out.len() > capacity {
        return Err(Error::InsufficientMemory {
            requested: out.len(),
            available: capacity,
        });
    }

    if out.len() < capacity {
        out.push(TERMINATOR);
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_ndef_after_control_tlvs() {
        let area = [
            0x01, 0x03, 0xA0, 0x10, 0x44, // lock control
            0x00, // null
            0x03, 0x03, 0xD0, 0x00, 0x00, // ndef
            0xFE, 0x00, 0x00,
        ];

        assert_eq!(Some(&[0xD0, 0x00, 0x00][..]), find_ndef(&area).unwrap());
        assert_eq!(2, parse(&area).unwrap().len());
    }

    #[test]
    fn test_long_length() {
        let message = vec![0x55; 300];
        let wrapped = wrap_ndef(&message, 400).unwrap();

        assert_eq!(&[0x03, 0xFF, 0x01, 0x2C], &wrapped[..4]);
        assert_eq!(Some(message.as_slice()), find_ndef(&wrapped).unwrap());
        assert_eq!(Some(&TERMINATOR), wrapped.last());
    }

    #[test]
    fn test_capacity() {
        assert_eq!(vec![0x03, 0x02, 0xAA, 0xBB], wrap_ndef(&[0xAA, 0xBB], 4).unwrap());
        assert!(matches!(
            wrap_ndef(&[0xAA; 10], 8),
            Err(Error::InsufficientMemory {
                requested: 12,
                available: 8
            })
        ));
    }

    #[test]
    fn test_empty_area() {
        assert_eq!(Some(&[][..]), find_ndef(&EMPTY_NDEF).unwrap());
        assert_eq!(None, find_ndef(&[0x00, 0x00, 0xFE]).unwrap());
        assert!(find_ndef(&[0x03, 0x10, 0x00]).is_err());
    }
}
