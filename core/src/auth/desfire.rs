//! DESFire EV1 three-pass authentication and secure messaging.
//!
//! Both sides of the exchange live here: the host side used by the driver, and the card
//! side used by the emulator, so the two can never drift apart.
//!
//! ```text
//! PCD                                   PICC
//!  -- 1A|AA keyNo ------------------------>
//!  <------------------------- E(K, RndB) --
//!  -- E(K, RndA || RndB<<8) -------------->
//!  <------------------------ E(K, RndA<<8) --
//! ```
//!
//! Encryption is CBC with the IV chained through the whole exchange. Once authenticated,
//! every command and response advances the IV through CMAC or encryption.

use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::auth::cipher::{self, Engine, INTEGRITY_ERROR};
use crate::auth::{AuthContext, Cipher};
use crate::error::{Error, Result};

pub const CMD_AUTHENTICATE_ISO: u8 = 0x1A;
pub const CMD_AUTHENTICATE_AES: u8 = 0xAA;

/// Length of the truncated MAC carried on the wire.
pub const MAC_LEN: usize = 8;

/// Communication settings of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum CommMode {
    Plain,
    Maced,
    Enciphered,
}

impl CommMode {
    pub fn from_byte(byte: u8) -> Self {
        match byte & 0x03 {
            0x01 => CommMode::Maced,
            0x03 => CommMode::Enciphered,
            _ => CommMode::Plain,
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            CommMode::Plain => 0x00,
            CommMode::Maced => 0x01,
            CommMode::Enciphered => 0x03,
        }
    }
}

/// Authentication command for keys of the given cipher.
pub fn auth_command(cipher: Cipher) -> u8 {
    match cipher {
        Cipher::Aes => CMD_AUTHENTICATE_AES,
        _ => CMD_AUTHENTICATE_ISO,
    }
}

fn random(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    OsRng.fill_bytes(&mut buf);
    buf
}

/// Host side of an authentication in progress.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Challenge {
    #[zeroize(skip)]
    cipher: Cipher,
    key: Vec<u8>,
    rnd_a: Vec<u8>,
    rnd_b: Vec<u8>,
    iv: Vec<u8>,
}

/// Decrypts the card's challenge and builds the token answering it.
pub fn respond_to_challenge(
    cipher: Cipher,
    key: &[u8],
    encrypted_rnd_b: &[u8],
) -> Result<(Vec<u8>, Challenge)> {
    if encrypted_rnd_b.len() != cipher.challenge_len() {
        return Err(Error::AuthenticationFailed);
    }

    let engine = Engine::new(cipher, key)?;
    let mut iv = vec![0u8; cipher.block_size()];

    let mut rnd_b = encrypted_rnd_b.to_vec();
    engine.cbc_decrypt(&mut iv, &mut rnd_b)?;

    let rnd_a = random(cipher.challenge_len());
    let mut token = rnd_a.clone();
    token.extend(cipher::rotate_left(&rnd_b));
    engine.cbc_encrypt(&mut iv, &mut token)?;

    Ok((
        token,
        Challenge {
            cipher,
            key: key.to_vec(),
            rnd_a,
            rnd_b,
            iv,
        },
    ))
}

/// Checks the card's proof and derives the session.
pub fn verify_final(
    mut challenge: Challenge,
    encrypted_rnd_a: &[u8],
    key_no: u8,
    aid: u32,
) -> Result<AuthContext> {
    if encrypted_rnd_a.len() != challenge.cipher.challenge_len() {
        return Err(Error::AuthenticationFailed);
    }

    let engine = Engine::new(challenge.cipher, &challenge.key)?;
    let mut rotated = encrypted_rnd_a.to_vec();
    engine.cbc_decrypt(&mut challenge.iv, &mut rotated)?;

    if rotated != cipher::rotate_left(&challenge.rnd_a) {
        rotated.zeroize();
        return Err(Error::AuthenticationFailed);
    }

    let key = session_key(challenge.cipher, &challenge.rnd_a, &challenge.rnd_b);
    Ok(AuthContext::new(challenge.cipher, key_no, aid, key))
}

/// Card side of an authentication in progress.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct CardChallenge {
    #[zeroize(skip)]
    cipher: Cipher,
    key: Vec<u8>,
    rnd_b: Vec<u8>,
    iv: Vec<u8>,
}

/// Draws RndB and encrypts it for the reader.
pub fn issue_challenge(cipher: Cipher, key: &[u8]) -> Result<(Vec<u8>, CardChallenge)> {
    let engine = Engine::new(cipher, key)?;
    let mut iv = vec![0u8; cipher.block_size()];

    let rnd_b = random(cipher.challenge_len());
    let mut encrypted = rnd_b.clone();
    engine.cbc_encrypt(&mut iv, &mut encrypted)?;

    Ok((
        encrypted,
        CardChallenge {
            cipher,
            key: key.to_vec(),
            rnd_b,
            iv,
        },
    ))
}

/// Checks the reader's token; on success returns the card's proof and the session.
pub fn answer_challenge(
    mut challenge: CardChallenge,
    token: &[u8],
    key_no: u8,
    aid: u32,
) -> Result<(Vec<u8>, AuthContext)> {
    let len = challenge.cipher.challenge_len();
    if token.len() != len * 2 {
        return Err(Error::AuthenticationFailed);
    }

    let engine = Engine::new(challenge.cipher, &challenge.key)?;
    let mut plain = token.to_vec();
    engine.cbc_decrypt(&mut challenge.iv, &mut plain)?;

    let (rnd_a, rotated_b) = plain.split_at(len);
    if rotated_b != cipher::rotate_left(&challenge.rnd_b).as_slice() {
        plain.zeroize();
        return Err(Error::AuthenticationFailed);
    }

    let mut proof = cipher::rotate_left(rnd_a);
    engine.cbc_encrypt(&mut challenge.iv, &mut proof)?;

    let key = session_key(challenge.cipher, rnd_a, &challenge.rnd_b);
    plain.zeroize();

    Ok((proof, AuthContext::new(challenge.cipher, key_no, aid, key)))
}

/// Derives the session key from both challenges.
pub fn session_key(cipher: Cipher, a: &[u8], b: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(cipher.key_len());
    match cipher {
        Cipher::Des => {
            key.extend_from_slice(&a[0..4]);
            key.extend_from_slice(&b[0..4]);
        }
        Cipher::TwoKeyTdes => {
            key.extend_from_slice(&a[0..4]);
            key.extend_from_slice(&b[0..4]);
            key.extend_from_slice(&a[4..8]);
            key.extend_from_slice(&b[4..8]);
        }
        Cipher::ThreeKeyTdes => {
            key.extend_from_slice(&a[0..4]);
            key.extend_from_slice(&b[0..4]);
            key.extend_from_slice(&a[6..10]);
            key.extend_from_slice(&b[6..10]);
            key.extend_from_slice(&a[12..16]);
            key.extend_from_slice(&b[12..16]);
        }
        Cipher::Aes => {
            key.extend_from_slice(&a[0..4]);
            key.extend_from_slice(&b[0..4]);
            key.extend_from_slice(&a[12..16]);
            key.extend_from_slice(&b[12..16]);
        }
    }

    key
}

impl AuthContext {
    fn engine(&self) -> Result<Engine> {
        Engine::new(self.cipher(), self.session_key())
    }

    /// Truncated CMAC of `data`, advancing the IV.
    pub fn cmac(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let engine = self.engine()?;
        let mut mac = engine.cmac(self.iv_mut(), data)?;
        mac.truncate(MAC_LEN);
        Ok(mac)
    }

    /// Zero-pads and encrypts `data`, advancing the IV.
    pub fn encrypt(&mut self, data: Vec<u8>) -> Result<Vec<u8>> {
        let engine = self.engine()?;
        let mut data = cipher::pad(data, engine.block_size());
        engine.cbc_encrypt(self.iv_mut(), &mut data)?;
        Ok(data)
    }

    /// Decrypts `data`, advancing the IV.
    pub fn decrypt(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let engine = self.engine()?;
        let mut data = data.to_vec();
        engine.cbc_decrypt(self.iv_mut(), &mut data)?;
        Ok(data)
    }

    /// Host side: protects the parameters of an outgoing command.
    /// `header` stays in clear; `data` is MACed or enciphered per `mode`.
    pub fn wrap_command(&mut self, cmd: u8, header: &[u8], data: &[u8], mode: CommMode) -> Result<Vec<u8>> {
        let mut covered = vec![cmd];
        covered.extend_from_slice(header);
        covered.extend_from_slice(data);

        let mut params = header.to_vec();
        match mode {
            CommMode::Plain => {
                self.cmac(&covered)?;
                params.extend_from_slice(data);
            }
            CommMode::Maced => {
                let mac = self.cmac(&covered)?;
                params.extend_from_slice(data);
                params.extend(mac);
            }
            CommMode::Enciphered => {
                let mut plain = data.to_vec();
                plain.extend(cipher::crc32(&covered));
                params.extend(self.encrypt(plain)?);
            }
        }

        Ok(params)
    }

    /// Host side: checks a successful response. For enciphered responses `len` is the
    /// number of plain data bytes expected.
    pub fn unwrap_response(&mut self, response: &[u8], mode: CommMode, len: usize) -> Result<Vec<u8>> {
        match mode {
            CommMode::Enciphered => {
                let plain = self.decrypt(response)?;
                let (data, rest) = plain
                    .split_at_checked(len)
                    .ok_or(Error::Status(INTEGRITY_ERROR))?;

                let mut covered = data.to_vec();
                covered.push(0x00);
                match rest.get(..4) {
                    Some(crc) if crc == cipher::crc32(&covered) => Ok(data.to_vec()),
                    _ => Err(Error::Status(INTEGRITY_ERROR)),
                }
            }
            _ => {
                let split = response
                    .len()
                    .checked_sub(MAC_LEN)
                    .ok_or(Error::Status(INTEGRITY_ERROR))?;
                let (data, mac) = response.split_at(split);

                let mut covered = data.to_vec();
                covered.push(0x00);
                match self.cmac(&covered)? == mac {
                    true => Ok(data.to_vec()),
                    _ => Err(Error::Status(INTEGRITY_ERROR)),
                }
            }
        }
    }

    /// Card side: checks and strips the protection of an incoming command.
    /// `header_len` bytes of `params` are in clear, `len` is the plain data length.
    pub fn open_command(
        &mut self,
        cmd: u8,
        params: &[u8],
        header_len: usize,
        len: usize,
        mode: CommMode,
    ) -> Result<Vec<u8>> {
        let mut covered = vec![cmd];
        match mode {
            CommMode::Plain => {
                covered.extend_from_slice(params);
                self.cmac(&covered)?;
                Ok(params.to_vec())
            }
            CommMode::Maced => {
                let split = params
                    .len()
                    .checked_sub(MAC_LEN)
                    .ok_or(Error::Status(INTEGRITY_ERROR))?;
                let (body, mac) = params.split_at(split);
                covered.extend_from_slice(body);

                match self.cmac(&covered)? == mac {
                    true => Ok(body.to_vec()),
                    _ => Err(Error::Status(INTEGRITY_ERROR)),
                }
            }
            CommMode::Enciphered => {
                let (header, encrypted) = params
                    .split_at_checked(header_len)
                    .ok_or(Error::Status(INTEGRITY_ERROR))?;
                let plain = self.decrypt(encrypted)?;
                let (data, rest) = plain
                    .split_at_checked(len)
                    .ok_or(Error::Status(INTEGRITY_ERROR))?;

                covered.extend_from_slice(header);
                covered.extend_from_slice(data);
                match rest.get(..4) {
                    Some(crc) if crc == cipher::crc32(&covered) => {
                        let mut opened = header.to_vec();
                        opened.extend_from_slice(data);
                        Ok(opened)
                    }
                    _ => Err(Error::Status(INTEGRITY_ERROR)),
                }
            }
        }
    }

    /// Card side: protects the data of a successful response.
    pub fn seal_response(&mut self, data: &[u8], mode: CommMode) -> Result<Vec<u8>> {
        let mut covered = data.to_vec();
        covered.push(0x00);

        match mode {
            CommMode::Enciphered => {
                let mut plain = data.to_vec();
                plain.extend(cipher::crc32(&covered));
                self.encrypt(plain)
            }
            _ => {
                let mut sealed = data.to_vec();
                sealed.extend(self.cmac(&covered)?);
                Ok(sealed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handshake(cipher: Cipher, host_key: &[u8], card_key: &[u8]) -> Result<(AuthContext, AuthContext)> {
        let (encrypted_rnd_b, card) = issue_challenge(cipher, card_key)?;
        let (token, host) = respond_to_challenge(cipher, host_key, &encrypted_rnd_b)?;
        let (proof, card_ctx) = answer_challenge(card, &token, 0, 1)?;
        let host_ctx = verify_final(host, &proof, 0, 1)?;

        Ok((host_ctx, card_ctx))
    }

    #[test]
    fn test_handshake_all_ciphers() {
        for cipher in [Cipher::Des, Cipher::TwoKeyTdes, Cipher::ThreeKeyTdes, Cipher::Aes] {
            let key = vec![0x5A; cipher.key_len()];
            let (host, card) = handshake(cipher, &key, &key).unwrap();

            assert_eq!(host.session_key(), card.session_key());
            assert_eq!(cipher.key_len(), host.session_key().len());
        }
    }

    #[test]
    fn test_wrong_key_fails() {
        let result = handshake(Cipher::Aes, &[0x01; 16], &[0x02; 16]);
        assert!(matches!(result, Err(Error::AuthenticationFailed)));
    }

    #[test]
    fn test_secure_messaging_roundtrip() {
        let (mut host, mut card) = handshake(Cipher::Aes, &[0x00; 16], &[0x00; 16]).unwrap();
        let header = [0x01, 0x00, 0x00, 0x00, 0x05, 0x00, 0x00];

        for mode in [CommMode::Plain, CommMode::Maced, CommMode::Enciphered] {
            let params = host.wrap_command(0x3D, &header, b"hello", mode).unwrap();
            let opened = card.open_command(0x3D, &params, header.len(), 5, mode).unwrap();
            assert_eq!(&opened[header.len()..], b"hello");

            let sealed = card.seal_response(b"data", mode).unwrap();
            assert_eq!(b"data".to_vec(), host.unwrap_response(&sealed, mode, 4).unwrap());
        }
    }

    #[test]
    fn test_tampered_mac_rejected() {
        let (mut host, mut card) = handshake(Cipher::TwoKeyTdes, &[0x00; 16], &[0x00; 16]).unwrap();

        let mut sealed = card.seal_response(b"data", CommMode::Maced).unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;

        assert!(matches!(
            host.unwrap_response(&sealed, CommMode::Maced, 4),
            Err(Error::Status(INTEGRITY_ERROR))
        ));
    }
}
