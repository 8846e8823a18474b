//! MIFARE Key A/B and NTAG password authentication frames.
//!
//! The Crypto1 cipher itself runs in the reader: the frame built here is what the reader
//! takes to authenticate a block, not what goes over the air.

use crate::auth::KeyType;
use crate::error::{Error, Result};

pub const CMD_AUTH_KEY_A: u8 = 0x60;
pub const CMD_AUTH_KEY_B: u8 = 0x61;
pub const CMD_PWD_AUTH: u8 = 0x1B;

/// Builds `60|61 block key(6) uid(4)`. The last four UID bytes are used for 7-byte UIDs.
pub fn key_frame(key_type: KeyType, block: u8, key: &[u8; 6], uid: &[u8]) -> Result<Vec<u8>> {
    let uid = match uid.len() {
        4 => uid,
        7 | 10 => &uid[uid.len() - 4..],
        _ => return Err(Error::AuthenticationFailed),
    };

    let mut frame = Vec::with_capacity(12);
    frame.push(match key_type {
        KeyType::A => CMD_AUTH_KEY_A,
        KeyType::B => CMD_AUTH_KEY_B,
    });
    frame.push(block);
    frame.extend_from_slice(key);
    frame.extend_from_slice(uid);

    Ok(frame)
}

/// Builds `1B pwd(4)`.
pub fn password_frame(password: &[u8; 4]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(5);
    frame.push(CMD_PWD_AUTH);
    frame.extend_from_slice(password);
    frame
}

/// Checks the PACK returned for `PWD_AUTH`. A one-byte answer is a NAK.
pub fn check_pack(response: &[u8], expected: Option<&[u8; 2]>) -> Result<()> {
    match (response, expected) {
        ([a, b], Some(pack)) if [*a, *b] == *pack => Ok(()),
        ([_, _], None) => Ok(()),
        _ => Err(Error::AuthenticationFailed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_frame_uses_uid_tail() {
        let uid = [0x04, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66];
        let frame = key_frame(KeyType::B, 4, &[0xFF; 6], &uid).unwrap();

        assert_eq!(0x61, frame[0]);
        assert_eq!(4, frame[1]);
        assert_eq!(&[0x33, 0x44, 0x55, 0x66], &frame[8..]);
    }

    #[test]
    fn test_check_pack() {
        assert!(check_pack(&[0x80, 0x80], Some(&[0x80, 0x80])).is_ok());
        assert!(check_pack(&[0x80, 0x80], None).is_ok());
        assert!(check_pack(&[0x12, 0x34], Some(&[0x80, 0x80])).is_err());
        assert!(check_pack(&[0x00], None).is_err());
    }
}
