//! Authentication against tags.
//!
//! Key material is never stored: [`Credentials`] are handed in per call and wiped when
//! dropped, and the session key negotiated with a DESFire card lives in an [`AuthContext`]
//! owned by the driver until the tag handle goes away.

pub mod cipher;
pub mod desfire;
pub mod mifare;

use std::fmt::{Debug, Formatter};

use zeroize::{Zeroize, ZeroizeOnDrop};

/// Block ciphers DESFire keys can be of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Cipher {
    /// Single DES, 8-byte key.
    Des,
    /// Two-key triple DES, 16-byte key.
    TwoKeyTdes,
    /// Three-key triple DES, 24-byte key.
    ThreeKeyTdes,
    /// AES-128, 16-byte key.
    Aes,
}

impl Cipher {
    pub fn key_len(self) -> usize {
        match self {
            Cipher::Des => 8,
            Cipher::TwoKeyTdes | Cipher::Aes => 16,
            Cipher::ThreeKeyTdes => 24,
        }
    }

    pub fn block_size(self) -> usize {
        match self {
            Cipher::Aes => 16,
            _ => 8,
        }
    }

    /// Length of the random challenges exchanged during three-pass authentication.
    pub fn challenge_len(self) -> usize {
        match self {
            Cipher::Des | Cipher::TwoKeyTdes => 8,
            Cipher::ThreeKeyTdes | Cipher::Aes => 16,
        }
    }
}

/// MIFARE key slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    A,
    B,
}

/// Secrets presented to a tag. Wiped on drop.
pub enum Credentials {
    /// MIFARE Key A/B; the reader runs the cipher.
    MifareKey {
        key_type: KeyType,
        block: u8,
        key: [u8; 6],
    },

    /// NTAG `PWD_AUTH` password, with the PACK the tag is expected to answer.
    NtagPassword {
        password: [u8; 4],
        pack: Option<[u8; 2]>,
    },

    /// DESFire key of the currently selected application.
    Desfire {
        key_no: u8,
        cipher: Cipher,
        key: Vec<u8>,
    },
}

impl Zeroize for Credentials {
    fn zeroize(&mut self) {
        match self {
            Credentials::MifareKey { key, .. } => key.zeroize(),
            Credentials::NtagPassword { password, pack } => {
                password.zeroize();
                pack.zeroize();
            }
            Credentials::Desfire { key, .. } => key.zeroize(),
        }
    }
}

impl Drop for Credentials {
    fn drop(&mut self) {
        self.zeroize();
    }
}

impl ZeroizeOnDrop for Credentials {}

impl Debug for Credentials {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::MifareKey {
                key_type, block, ..
            } => f
                .debug_struct("MifareKey")
                .field("key_type", key_type)
                .field("block", block)
                .finish_non_exhaustive(),
            Credentials::NtagPassword { .. } => f.debug_struct("NtagPassword").finish_non_exhaustive(),
            Credentials::Desfire { key_no, cipher, .. } => f
                .debug_struct("Desfire")
                .field("key_no", key_no)
                .field("cipher", cipher)
                .finish_non_exhaustive(),
        }
    }
}

/// Session state negotiated with a DESFire card.
///
/// The context is only valid for the application it was negotiated in and is wiped on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct AuthContext {
    #[zeroize(skip)]
    cipher: Cipher,
    key_no: u8,
    aid: u32,
    session_key: Vec<u8>,
    iv: Vec<u8>,
}

impl AuthContext {
    pub fn new(cipher: Cipher, key_no: u8, aid: u32, session_key: Vec<u8>) -> Self {
        Self {
            cipher,
            key_no,
            aid,
            session_key,
            iv: vec![0u8; cipher.block_size()],
        }
    }

    pub fn cipher(&self) -> Cipher {
        self.cipher
    }

    pub fn key_no(&self) -> u8 {
        self.key_no
    }

    /// Application the context was negotiated in.
    pub fn aid(&self) -> u32 {
        self.aid
    }

    pub(crate) fn session_key(&self) -> &[u8] {
        &self.session_key
    }

    pub(crate) fn iv_mut(&mut self) -> &mut Vec<u8> {
        &mut self.iv
    }
}

impl Debug for AuthContext {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthContext")
            .field("cipher", &self.cipher)
            .field("key_no", &self.key_no)
            .field("aid", &format_args!("{:06X}", self.aid))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_zeroize() {
        let mut credentials = Credentials::Desfire {
            key_no: 1,
            cipher: Cipher::Aes,
            key: vec![0x42; 16],
        };
        credentials.zeroize();

        match &credentials {
            Credentials::Desfire { key, .. } => assert!(key.is_empty()),
            _ => unreachable!(),
        }
        assert!(!format!("{:?}", credentials).contains("42"));
    }

    #[test]
    fn test_context_zeroize() {
        let mut context = AuthContext::new(Cipher::Des, 0, 0, vec![0x11; 8]);
        context.zeroize();

        assert!(context.session_key().is_empty());
        assert_eq!(0, context.aid());
    }
}
