//! Block cipher primitives shared by the DESFire secure messaging: CBC with a chained IV,
//! CMAC and the DESFire flavour of CRC32.

use aes::Aes128;
use des::cipher::{generic_array::GenericArray, BlockDecrypt, BlockEncrypt, KeyInit};
use des::{Des, TdesEde2, TdesEde3};

use crate::auth::Cipher;
use crate::error::{Error, Result};

/// DESFire status reported for cryptograms that do not check out.
pub const INTEGRITY_ERROR: u16 = 0x911E;

/// A keyed block cipher.
pub enum Engine {
    Des(Des),
    TdesEde2(TdesEde2),
    TdesEde3(TdesEde3),
    Aes(Aes128),
}

impl Engine {
    pub fn new(cipher: Cipher, key: &[u8]) -> Result<Self> {
        if key.len() != cipher.key_len() {
            return Err(Error::AuthenticationFailed);
        }

        let invalid = |_| Error::AuthenticationFailed;
        Ok(match cipher {
            Cipher::Des => Engine::Des(Des::new_from_slice(key).map_err(invalid)?),
            Cipher::TwoKeyTdes => Engine::TdesEde2(TdesEde2::new_from_slice(key).map_err(invalid)?),
            Cipher::ThreeKeyTdes => Engine::TdesEde3(TdesEde3::new_from_slice(key).map_err(invalid)?),
            Cipher::Aes => Engine::Aes(Aes128::new_from_slice(key).map_err(invalid)?),
        })
    }

    pub fn block_size(&self) -> usize {
        match self {
            Engine::Aes(_) => 16,
            _ => 8,
        }
    }

    fn encrypt_block(&self, block: &mut [u8]) {
        match self {
            Engine::Des(c) => c.encrypt_block(GenericArray::from_mut_slice(block)),
            Engine::TdesEde2(c) => c.encrypt_block(GenericArray::from_mut_slice(block)),
            Engine::TdesEde3(c) => c.encrypt_block(GenericArray::from_mut_slice(block)),
            Engine::Aes(c) => c.encrypt_block(GenericArray::from_mut_slice(block)),
        }
    }

    fn decrypt_block(&self, block: &mut [u8]) {
        match self {
            Engine::Des(c) => c.decrypt_block(GenericArray::from_mut_slice(block)),
            Engine::TdesEde2(c) => c.decrypt_block(GenericArray::from_mut_slice(block)),
            Engine::TdesEde3(c) => c.decrypt_block(GenericArray::from_mut_slice(block)),
            Engine::Aes(c) => c.decrypt_block(GenericArray::from_mut_slice(block)),
        }
    }

    /// Encrypts `data` in place in CBC mode. `iv` is replaced by the last ciphertext block.
    pub fn cbc_encrypt(&self, iv: &mut [u8], data: &mut [u8]) -> Result<()> {
        let bs = self.block_size();
        if data.len() % bs != 0 || iv.len() != bs {
            return Err(Error::Status(INTEGRITY_ERROR));
        }

        for block in data.chunks_mut(bs) {
            block.iter_mut().zip(iv.iter()).for_each(|(b, v)| *b ^= v);
            self.encrypt_block(block);
            iv.copy_from_slice(block);
        }

        Ok(())
    }

    /// Decrypts `data` in place in CBC mode. `iv` is replaced by the last ciphertext block.
    pub fn cbc_decrypt(&self, iv: &mut [u8], data: &mut [u8]) -> Result<()> {
        let bs = self.block_size();
        if data.len() % bs != 0 || iv.len() != bs {
            return Err(Error::Status(INTEGRITY_ERROR));
        }

        let mut next = vec![0u8; bs];
        for block in data.chunks_mut(bs) {
            next.copy_from_slice(block);
            self.decrypt_block(block);
            block.iter_mut().zip(iv.iter()).for_each(|(b, v)| *b ^= v);
            iv.copy_from_slice(&next);
        }

        Ok(())
    }

    fn subkeys(&self) -> (Vec<u8>, Vec<u8>) {
        let bs = self.block_size();
        let r = if bs == 16 { 0x87 } else { 0x1B };

        let mut l = vec![0u8; bs];
        self.encrypt_block(&mut l);

        let k1 = shift_left(&l, r);
        let k2 = shift_left(&k1, r);
        (k1, k2)
    }

    /// Computes the CMAC of `data`, chaining from `iv`. `iv` is replaced by the full MAC.
    pub fn cmac(&self, iv: &mut [u8], data: &[u8]) -> Result<Vec<u8>> {
        let bs = self.block_size();
        let (k1, k2) = self.subkeys();

        let mut buf = data.to_vec();
        let complete = !buf.is_empty() && buf.len() % bs == 0;
        if !complete {
            buf.push(0x80);
            buf.resize(buf.len().div_ceil(bs) * bs, 0x00);
        }

        let last = buf.len() - bs;
        let subkey = if complete { &k1 } else { &k2 };
        buf[last..]
            .iter_mut()
            .zip(subkey.iter())
            .for_each(|(b, k)| *b ^= k);

        self.cbc_encrypt(iv, &mut buf)?;

        Ok(buf[last..].to_vec())
    }
}

fn shift_left(block: &[u8], r: u8) -> Vec<u8> {
    let mut out = vec![0u8; block.len()];
    let mut carry = 0u8;
    for i in (0..block.len()).rev() {
        out[i] = (block[i] << 1) | carry;
        carry = block[i] >> 7;
    }

    if block[0] & 0x80 != 0 {
        let last = out.len() - 1;
        out[last] ^= r;
    }

    out
}

/// CRC32 as DESFire appends it: reflected polynomial `0xEDB88320`, preset `0xFFFFFFFF`,
/// no final inversion, little-endian on the wire.
pub fn crc32(data: &[u8]) -> [u8; 4] {
    let mut crc = 0xFFFF_FFFFu32;
    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            crc = match crc & 1 {
                1 => (crc >> 1) ^ 0xEDB8_8320,
                _ => crc >> 1,
            };
        }
    }

    crc.to_le_bytes()
}

/// Zero-pads `data` up to a multiple of `block_size`.
pub fn pad(mut data: Vec<u8>, block_size: usize) -> Vec<u8> {
    let len = data.len().div_ceil(block_size) * block_size;
    data.resize(len.max(block_size), 0x00);
    data
}

/// Rotates `data` left by one byte.
pub fn rotate_left(data: &[u8]) -> Vec<u8> {
    let mut out = data.to_vec();
    if !out.is_empty() {
        out.rotate_left(1);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unhex(s: &str) -> Vec<u8> {
        hex::decode(s).unwrap()
    }

    #[test]
    fn test_aes_cmac_nist_vectors() {
        // NIST SP 800-38B, AES-128 examples 1 and 2.
        let engine = Engine::new(Cipher::Aes, &unhex("2b7e151628aed2a6abf7158809cf4f3c")).unwrap();

        let mut iv = vec![0u8; 16];
        assert_eq!(
            unhex("bb1d6929e95937287fa37d129b756746"),
            engine.cmac(&mut iv, &[]).unwrap(),
        );

        let mut iv = vec![0u8; 16];
        let mac = engine
            .cmac(&mut iv, &unhex("6bc1bee22e409f96e93d7e117393172a"))
            .unwrap();
        assert_eq!(unhex("070a16b46b4d4144f79bdd9dd04a287c"), mac);
        assert_eq!(mac, iv);
    }

    #[test]
    fn test_cbc_chains_iv() {
        let engine = Engine::new(Cipher::TwoKeyTdes, &[0x01; 16]).unwrap();
        let plain = b"0123456789abcdef".to_vec();

        let mut iv = vec![0u8; 8];
        let mut data = plain.clone();
        engine.cbc_encrypt(&mut iv, &mut data).unwrap();
        assert_eq!(&data[8..], &iv[..]);

        let mut iv = vec![0u8; 8];
        engine.cbc_decrypt(&mut iv, &mut data).unwrap();
        assert_eq!(plain, data);
    }

    #[test]
    fn test_crc32() {
        // Without the final inversion the standard check value 0xCBF43926 comes out inverted.
        assert_eq!((!0xCBF4_3926u32).to_le_bytes(), crc32(b"123456789"));
    }

    #[test]
    fn test_rejects_wrong_key_length() {
        assert!(Engine::new(Cipher::Aes, &[0u8; 8]).is_err());
    }
}
