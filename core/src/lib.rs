//! A crate to read, write, lock and authenticate NFC Forum tags through USB, PC/SC and
//! UART readers.
//!
//! A [`Session`] connects to one reader, activates the tag in the field and hands every
//! operation to the driver of the tag family: Topaz (Type 1), MIFARE Ultralight/NTAG
//! (Type 2), FeliCa (Type 3), DESFire (Type 4) and ISO 15693 (Type 5).

mod trace;

pub mod auth;
pub mod backend;
pub mod classify;
pub mod clone;
pub mod emulator;
pub mod error;
pub mod ndef;
pub mod session;
pub mod tag;

pub use auth::Credentials;
pub use backend::{BackendKind, Signature};
pub use error::{Error, Result, TransportError};
pub use ndef::{NdefMessage, NdefRecord};
pub use session::{ReaderDescriptor, ReaderSelector, Session, SessionEvent, SessionOptions, SessionState};
pub use tag::{Operation, OperationKind, Payload, Range, TagFamily, TagInfo};
