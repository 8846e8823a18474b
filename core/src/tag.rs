//! Tag families and their protocol drivers.
//!
//! A [`Driver`] is picked once per activated tag from its [`TagFamily`] and keeps the
//! family-specific context of that activation (selected application, selected service,
//! lock state, authentication). Every driver offers the same operations; those a family
//! cannot perform fail with [`Error::UnsupportedOperation`].

pub mod desfire;
pub mod felica;
pub mod topaz;
pub mod ultralight;
pub mod vicinity;

use std::fmt::{Display, Formatter};
use std::time::Duration;

use apdu::Command;

use crate::auth::Credentials;
use crate::backend::{Backend, Reply, Signature};
use crate::error::{Error, Result};
use crate::ndef::{tlv, NdefMessage};

pub use desfire::Desfire;
pub use felica::FeliCa;
pub use topaz::Topaz;
pub use ultralight::Ultralight;
pub use vicinity::Vicinity;

/// NFC Forum tag families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum TagFamily {
    /// Type 1
    Topaz,
    /// Type 2
    Type2Ultralight,
    /// Type 3
    Type3FeliCa,
    /// Type 4
    Type4DESFire,
    /// Type 5
    Type5ISO15693,
}

impl Display for TagFamily {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            TagFamily::Topaz => "Type 1 (Topaz)",
            TagFamily::Type2Ultralight => "Type 2 (MIFARE Ultralight/NTAG)",
            TagFamily::Type3FeliCa => "Type 3 (FeliCa)",
            TagFamily::Type4DESFire => "Type 4 (DESFire)",
            TagFamily::Type5ISO15693 => "Type 5 (ISO 15693)",
        })
    }
}

/// Operations a driver can be asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum OperationKind {
    GetInfo,
    Read,
    Write,
    Lock,
    Format,
    Authenticate,
    ReadNdef,
    WriteNdef,
    /// Selecting an application or service.
    Select,
    /// Creating or deleting applications and files.
    Manage,
}

impl OperationKind {
    /// Whether the operation leaves the tag unchanged and may be repeated after a timeout.
    pub fn is_read(self) -> bool {
        matches!(self, OperationKind::GetInfo | OperationKind::Read | OperationKind::ReadNdef)
    }
}

impl Display for OperationKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            OperationKind::GetInfo => "get-info",
            OperationKind::Read => "read",
            OperationKind::Write => "write",
            OperationKind::Lock => "lock",
            OperationKind::Format => "format",
            OperationKind::Authenticate => "authenticate",
            OperationKind::ReadNdef => "read-ndef",
            OperationKind::WriteNdef => "write-ndef",
            OperationKind::Select => "select",
            OperationKind::Manage => "manage",
        })
    }
}

pub(crate) fn unsupported<T>(family: TagFamily, operation: OperationKind) -> Result<T> {
    Err(Error::UnsupportedOperation { family, operation })
}

/// A byte range within the user area of a tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct Range {
    pub offset: usize,
    pub len: usize,
}

impl Range {
    pub fn new(offset: usize, len: usize) -> Self {
        Self { offset, len }
    }

    /// `count` blocks of `block_size` bytes starting at block `first`.
    pub fn blocks(first: usize, count: usize, block_size: usize) -> Self {
        Self::new(first * block_size, count * block_size)
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn end(&self) -> usize {
        self.offset + self.len
    }

    /// Fails with `InvalidRange` unless the range lies within `capacity` bytes.
    pub fn check(&self, capacity: usize) -> Result<()> {
        match self.offset.checked_add(self.len) {
            Some(end) if end <= capacity => Ok(()),
            _ => Err(Error::InvalidRange {
                offset: self.offset,
                len: self.len,
            }),
        }
    }

    /// Indices of the blocks the range touches.
    pub fn block_indices(&self, block_size: usize) -> std::ops::Range<usize> {
        match self.len {
            0 => self.offset / block_size..self.offset / block_size,
            _ => self.offset / block_size..(self.end() - 1) / block_size + 1,
        }
    }

    /// The smallest block-aligned range covering this one.
    pub fn widen(&self, block_size: usize) -> Self {
        let blocks = self.block_indices(block_size);
        Self::blocks(blocks.start, blocks.len(), block_size)
    }
}

/// Places `data` at `range` inside `base`, which holds the bytes of `wide`.
pub(crate) fn splice(wide: Range, range: Range, mut base: Vec<u8>, data: &[u8]) -> Vec<u8> {
    let start = range.offset - wide.offset;
    base[start..start + data.len()].copy_from_slice(data);
    base
}

/// Operations a tag supports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Capabilities {
    pub read: bool,
    pub write: bool,
    pub lock: bool,
    pub format: bool,
    pub authenticate: bool,
}

/// What `get_info` reports about a tag.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct TagInfo {
    pub family: TagFamily,
    pub uid: Vec<u8>,
    pub product: String,
    /// User memory in bytes, never zero.
    pub memory_size: usize,
    pub block_size: usize,
    pub capabilities: Capabilities,
    /// Blocks known to be locked.
    pub locked_blocks: Vec<usize>,
}

/// Lock bits set in one byte of the tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct LockBits {
    /// Page or block holding the lock byte.
    pub block: usize,
    /// Byte within that block.
    pub byte: usize,
    pub mask: u8,
}

/// Result of a lock, or of a lock preview.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct LockReport {
    /// Blocks frozen by the lock.
    pub blocks: Vec<usize>,
    /// Bits set (or to be set) on the tag. Empty when the family locks blocks by command.
    pub bits: Vec<LockBits>,
}

/// Successful outcome of an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Bytes(Vec<u8>),
    Ndef(NdefMessage),
    Info(TagInfo),
    Locked(LockReport),
    Done,
}

/// Outcome of an operation.
pub type OperationResult = Result<Payload>;

/// A request to the tag in the field.
#[derive(Debug)]
pub enum Operation {
    GetInfo,
    Read(Range),
    Write(Range, Vec<u8>),
    Lock(Range),
    PreviewLock(Range),
    Format,
    Authenticate(Credentials),
    ReadNdef,
    WriteNdef(NdefMessage),
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::GetInfo => OperationKind::GetInfo,
            Operation::Read(_) => OperationKind::Read,
            Operation::Write(..) => OperationKind::Write,
            Operation::Lock(_) | Operation::PreviewLock(_) => OperationKind::Lock,
            Operation::Format => OperationKind::Format,
            Operation::Authenticate(_) => OperationKind::Authenticate,
            Operation::ReadNdef => OperationKind::ReadNdef,
            Operation::WriteNdef(_) => OperationKind::WriteNdef,
        }
    }
}

/// The backend of the session, bound to the operation timeout.
pub struct Link<'a> {
    backend: &'a mut dyn Backend,
    timeout: Duration,
}

impl<'a> Link<'a> {
    pub fn new(backend: &'a mut dyn Backend, timeout: Duration) -> Self {
        Self { backend, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Exchanges one tag-level frame.
    pub fn transceive(&mut self, frame: &[u8]) -> Result<Vec<u8>> {
        self.backend.transceive(frame, self.timeout)
    }

    /// Exchanges one APDU.
    pub fn transmit(&mut self, command: impl Into<Command>) -> Result<Reply> {
        let tx = Vec::from(command.into());
        Reply::from_bytes(self.transceive(&tx)?)
    }
}

/// Family-specific driver of one activated tag.
pub enum Driver {
    Topaz(Topaz),
    Ultralight(Ultralight),
    FeliCa(FeliCa),
    Desfire(Desfire),
    Vicinity(Vicinity),
}

macro_rules! dispatch {
    ($self: ident, $driver: ident => $body: expr) => {
        match $self {
            Driver::Topaz($driver) => $body,
            Driver::Ultralight($driver) => $body,
            Driver::FeliCa($driver) => $body,
            Driver::Desfire($driver) => $body,
            Driver::Vicinity($driver) => $body,
        }
    };
}

impl Driver {
    /// Creates the driver for a freshly activated tag.
    pub fn new(family: TagFamily, signature: &Signature) -> Self {
        match family {
            TagFamily::Topaz => Driver::Topaz(Topaz::new(signature.uid())),
            TagFamily::Type2Ultralight => Driver::Ultralight(Ultralight::new(signature.uid())),
            TagFamily::Type3FeliCa => Driver::FeliCa(FeliCa::new(signature)),
            TagFamily::Type4DESFire => Driver::Desfire(Desfire::new(signature.uid())),
            TagFamily::Type5ISO15693 => Driver::Vicinity(Vicinity::new(signature)),
        }
    }

    pub fn family(&self) -> TagFamily {
        match self {
            Driver::Topaz(_) => TagFamily::Topaz,
            Driver::Ultralight(_) => TagFamily::Type2Ultralight,
            Driver::FeliCa(_) => TagFamily::Type3FeliCa,
            Driver::Desfire(_) => TagFamily::Type4DESFire,
            Driver::Vicinity(_) => TagFamily::Type5ISO15693,
        }
    }

    pub fn get_info(&mut self, link: &mut Link) -> Result<TagInfo> {
        dispatch!(self, d => d.get_info(link))
    }

    pub fn read(&mut self, link: &mut Link, range: Range) -> Result<Vec<u8>> {
        if range.is_empty() {
            return Ok(Vec::new());
        }

        dispatch!(self, d => d.read(link, range))
    }

    pub fn write(&mut self, link: &mut Link, range: Range, data: &[u8]) -> Result<()> {
        if data.len() != range.len {
            return Err(Error::InvalidRange {
                offset: range.offset,
                len: data.len(),
            });
        }
        if range.is_empty() {
            return Ok(());
        }

        dispatch!(self, d => d.write(link, range, data))
    }

    pub fn lock(&mut self, link: &mut Link, range: Range) -> Result<LockReport> {
        match self {
            Driver::Ultralight(d) => d.lock(link, range),
            Driver::Vicinity(d) => d.lock(link, range),
            _ => unsupported(self.family(), OperationKind::Lock),
        }
    }

    /// Reports what `lock` would freeze without touching the tag's lock bits.
    pub fn preview_lock(&mut self, link: &mut Link, range: Range) -> Result<LockReport> {
        match self {
            Driver::Ultralight(d) => d.preview_lock(link, range),
            Driver::Vicinity(d) => d.preview_lock(link, range),
            _ => unsupported(self.family(), OperationKind::Lock),
        }
    }

    pub fn format(&mut self, link: &mut Link) -> Result<()> {
        match self {
            Driver::Topaz(_) => unsupported(TagFamily::Topaz, OperationKind::Format),
            Driver::Ultralight(d) => d.format(link),
            Driver::FeliCa(d) => d.format(link),
            Driver::Desfire(d) => d.format(link),
            Driver::Vicinity(d) => d.format(link),
        }
    }

    pub fn authenticate(&mut self, link: &mut Link, credentials: &Credentials) -> Result<()> {
        match self {
            Driver::Ultralight(d) => d.authenticate(link, credentials),
            Driver::Desfire(d) => d.authenticate(link, credentials),
            _ => unsupported(self.family(), OperationKind::Authenticate),
        }
    }

    pub fn read_ndef(&mut self, link: &mut Link) -> Result<NdefMessage> {
        match self {
            Driver::FeliCa(d) => d.read_ndef(link),
            Driver::Desfire(d) => d.read_ndef(link),
            _ => {
                let offset = self.ndef_offset(link)?;
                let capacity = self.get_info(link)?.memory_size;
                let area = self.read(link, Range::new(offset, capacity.saturating_sub(offset)))?;

                match tlv::find_ndef(&area)? {
                    Some(message) => NdefMessage::decode(message),
                    None => Ok(NdefMessage::default()),
                }
            }
        }
    }

    pub fn write_ndef(&mut self, link: &mut Link, message: &NdefMessage) -> Result<()> {
        match self {
            Driver::FeliCa(d) => d.write_ndef(link, message),
            Driver::Desfire(d) => d.write_ndef(link, message),
            _ => {
                let offset = self.ndef_offset(link)?;
                let capacity = self.get_info(link)?.memory_size;
                let area = tlv::wrap_ndef(&message.encode()?, capacity.saturating_sub(offset))?;

                self.write(link, Range::new(offset, area.len()), &area)
            }
        }
    }

    /// Start of the TLV area within the user area of Type 1, 2 and 5 tags.
    fn ndef_offset(&mut self, link: &mut Link) -> Result<usize> {
        match self {
            Driver::Topaz(_) => Ok(topaz::CC_LEN),
            Driver::Ultralight(_) => Ok(0),
            Driver::Vicinity(d) => d.cc_len(link),
            _ => unsupported(self.family(), OperationKind::ReadNdef),
        }
    }

    /// Runs one operation.
    pub fn execute(&mut self, link: &mut Link, operation: &Operation) -> OperationResult {
        Ok(match operation {
            Operation::GetInfo => Payload::Info(self.get_info(link)?),
            Operation::Read(range) => Payload::Bytes(self.read(link, *range)?),
            Operation::Write(range, data) => {
                self.write(link, *range, data)?;
                Payload::Done
            }
            Operation::Lock(range) => Payload::Locked(self.lock(link, *range)?),
            Operation::PreviewLock(range) => Payload::Locked(self.preview_lock(link, *range)?),
            Operation::Format => {
                self.format(link)?;
                Payload::Done
            }
            Operation::Authenticate(credentials) => {
                self.authenticate(link, credentials)?;
                Payload::Done
            }
            Operation::ReadNdef => Payload::Ndef(self.read_ndef(link)?),
            Operation::WriteNdef(message) => {
                self.write_ndef(link, message)?;
                Payload::Done
            }
        })
    }

    /// The DESFire driver, for application and file management.
    pub fn desfire(&mut self) -> Result<&mut Desfire> {
        match self {
            Driver::Desfire(d) => Ok(d),
            _ => unsupported(self.family(), OperationKind::Manage),
        }
    }

    /// The FeliCa driver, for service selection.
    pub fn felica(&mut self) -> Result<&mut FeliCa> {
        match self {
            Driver::FeliCa(d) => Ok(d),
            _ => unsupported(self.family(), OperationKind::Select),
        }
    }

    /// Drops any authentication state; key material is wiped.
    pub fn invalidate(&mut self) {
        match self {
            Driver::Desfire(d) => d.invalidate(),
            Driver::Ultralight(d) => d.invalidate(),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_blocks() {
        let range = Range::new(5, 6);

        assert_eq!(1..3, range.block_indices(4));
        assert_eq!(Range::new(4, 8), range.widen(4));
        assert_eq!(Range::new(8, 4), Range::blocks(2, 1, 4));
        assert_eq!(Range::new(8, 4), Range::blocks(2, 1, 4).widen(4));
    }

    #[test]
    fn test_range_check() {
        assert!(Range::new(0, 144).check(144).is_ok());
        assert!(matches!(
            Range::new(140, 8).check(144),
            Err(Error::InvalidRange { offset: 140, len: 8 })
        ));
        assert!(Range::new(usize::MAX, 2).check(144).is_err());
    }

    #[test]
    fn test_splice() {
        let wide = Range::new(4, 8);
        let merged = splice(wide, Range::new(5, 2), vec![0; 8], &[1, 2]);
        assert_eq!(vec![0, 1, 2, 0, 0, 0, 0, 0], merged);
    }

    #[test]
    fn test_operation_kind() {
        assert!(Operation::Read(Range::new(0, 4)).kind().is_read());
        assert!(!Operation::Write(Range::new(0, 1), vec![0]).kind().is_read());
        assert_eq!("write-ndef", OperationKind::WriteNdef.to_string());
    }
}
