//! PN53x normal information frames.
//!
//! ```text
//! 00 00 FF LEN LCS TFI PD0 .. PDn DCS 00
//! ```
//!
//! `LEN` counts `TFI` and the data bytes, `LCS` makes `LEN + LCS` zero, `DCS` makes the
//! sum of `TFI`, data and `DCS` zero. The controller acknowledges every command with an
//! ACK frame before it sends the response frame.

use crate::error::{Result, TransportError};

pub const PREAMBLE: [u8; 3] = [0x00, 0x00, 0xFF];
pub const ACK: [u8; 6] = [0x00, 0x00, 0xFF, 0x00, 0xFF, 0x00];
pub const NACK: [u8; 6] = [0x00, 0x00, 0xFF, 0xFF, 0x00, 0x00];

/// Frame identifier of host-to-controller frames.
pub const TFI_HOST: u8 = 0xD4;

/// Frame identifier of controller-to-host frames.
pub const TFI_CONTROLLER: u8 = 0xD5;

const MAX_PAYLOAD: usize = 0xFE;

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Ack,
    Nack,
    /// Application-level error frame sent by the controller (`LEN = 01`, payload `7F`).
    Error,
    /// Information frame payload, starting with the TFI.
    Info(Vec<u8>),
}

fn checksum(bytes: &[u8]) -> u8 {
    bytes
        .iter()
        .fold(0u8, |acc, &b| acc.wrapping_add(b))
        .wrapping_neg()
}

/// Wraps `payload` (TFI included) into an information frame.
pub fn encode(payload: &[u8]) -> Result<Vec<u8>> {
    if payload.is_empty() || payload.len() > MAX_PAYLOAD {
        return Err(TransportError::Framing("payload does not fit a normal frame").into());
    }

    let len = payload.len() as u8;
    let mut frame = Vec::with_capacity(payload.len() + 7);
    frame.extend_from_slice(&PREAMBLE);
    frame.push(len);
    frame.push(len.wrapping_neg());
    frame.extend_from_slice(payload);
    frame.push(checksum(payload));
    frame.push(0x00);

    Ok(frame)
}

/// Total length of the frame at the start of `buf`, once enough bytes are present to know it.
/// Leading garbage before the preamble is counted as part of the frame.
pub fn expected_len(buf: &[u8]) -> Option<usize> {
    let start = buf.windows(2).position(|w| w == [0x00, 0xFF])?;
    let len = *buf.get(start + 2)?;
    let lcs = *buf.get(start + 3)?;

    Some(match (len, lcs) {
        (0x00, 0xFF) | (0xFF, 0x00) => start + 5,
        _ => start + 4 + len as usize + 2,
    })
}

/// Decodes the first frame found in `buf`.
pub fn decode(buf: &[u8]) -> Result<Frame> {
    let start = buf
        .windows(2)
        .position(|w| w == [0x00, 0xFF])
        .ok_or(TransportError::Framing("missing start code"))?;
    let body = &buf[start + 2..];

    match body {
        [0x00, 0xFF, ..] => return Ok(Frame::Ack),
        [0xFF, 0x00, ..] => return Ok(Frame::Nack),
        _ => {}
    }

    let (len, lcs) = match body {
        [len, lcs, ..] => (*len, *lcs),
        _ => return Err(TransportError::Framing("truncated header").into()),
    };
    if len.wrapping_add(lcs) != 0 {
        return Err(TransportError::Framing("length checksum mismatch").into());
    }

    let payload = body
        .get(2..2 + len as usize)
        .ok_or(TransportError::Framing("truncated payload"))?;
    let dcs = *body
        .get(2 + len as usize)
        .ok_or(TransportError::Framing("missing data checksum"))?;
    if checksum(payload) != dcs {
        return Err(TransportError::Framing("data checksum mismatch").into());
    }

    match payload {
        [0x7F] => Ok(Frame::Error),
        _ => Ok(Frame::Info(payload.to_vec())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_get_firmware_version() {
        assert_eq!(
            vec![0x00, 0x00, 0xFF, 0x02, 0xFE, 0xD4, 0x02, 0x2A, 0x00],
            encode(&[0xD4, 0x02]).unwrap(),
        );
    }

    #[test]
    fn test_decode_response() {
        let raw = [
            0x00, 0x00, 0xFF, 0x06, 0xFA, 0xD5, 0x03, 0x32, 0x01, 0x06, 0x07, 0xE8, 0x00,
        ];

        assert_eq!(Some(raw.len()), expected_len(&raw));
        assert_eq!(
            Frame::Info(vec![0xD5, 0x03, 0x32, 0x01, 0x06, 0x07]),
            decode(&raw).unwrap(),
        );
    }

    #[test]
    fn test_decode_ack_and_error() {
        assert_eq!(Some(6), expected_len(&ACK));
        assert_eq!(Frame::Ack, decode(&ACK).unwrap());
        assert_eq!(Frame::Nack, decode(&NACK).unwrap());
        assert_eq!(
            Frame::Error,
            decode(&[0x00, 0x00, 0xFF, 0x01, 0xFF, 0x7F, 0x81, 0x00]).unwrap(),
        );
    }

    #[test]
    fn test_decode_rejects_bad_checksum() {
        let raw = [0x00, 0x00, 0xFF, 0x02, 0xFE, 0xD5, 0x03, 0x00, 0x00];
        assert!(decode(&raw).is_err());
        assert!(decode(&[0x00, 0x00, 0xFF, 0x02, 0xFD]).is_err());
        assert!(encode(&[]).is_err());
    }
}
