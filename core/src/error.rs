use crate::tag::{OperationKind, TagFamily};

/// Every failure the engine reports to its callers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("No reader could be opened on any backend")]
    NoReaderFound,

    #[error("The reader did not answer in time")]
    Timeout,

    #[error("The tag left the field during the operation")]
    FieldLost,

    #[error("The tag in the field is not a supported NFC Forum tag")]
    UnsupportedTag,

    #[error("{family} tags do not support {operation}")]
    UnsupportedOperation {
        family: TagFamily,
        operation: OperationKind,
    },

    #[error("The operation requires authentication first")]
    AuthenticationRequired,

    #[error("Authentication with the tag failed")]
    AuthenticationFailed,

    #[error("Block {0} is locked")]
    BlockLocked(usize),

    #[error("Not enough memory on the tag: {requested} bytes requested, {available} available")]
    InsufficientMemory { requested: usize, available: usize },

    #[error("Malformed NDEF message: {0}")]
    MalformedNdef(&'static str),

    #[error("Error occurred while communicating with the reader: {0}")]
    Transport(#[from] TransportError),

    #[error("No tag is present in the field")]
    NoTag,

    #[error("The session is not connected to a reader")]
    NotConnected,

    #[error("The range {offset}+{len} is outside the tag memory")]
    InvalidRange { offset: usize, len: usize },

    #[error("The tag returned an error status ({0:#06X})")]
    Status(u16),

    #[error("A {dump} dump cannot be restored onto a {target} tag")]
    FamilyMismatch { dump: TagFamily, target: TagFamily },

    #[error("Invalid reader configuration: {0}")]
    Config(String),
}

/// Backend-level I/O faults.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[cfg(feature = "pcsc")]
    #[error("Error occurred while communicating with PC/SC: {0}")]
    Pcsc(#[from] pcsc::Error),

    #[cfg(feature = "uart")]
    #[error("Error occurred while opening the serial port: {0}")]
    Serial(#[from] serialport::Error),

    #[cfg(feature = "usb")]
    #[error("USB transfer failed: {0}")]
    Usb(#[from] nusb::transfer::TransferError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed frame from the reader: {0}")]
    Framing(&'static str),

    #[error("The reader rejected the command (status {0:#04X})")]
    Reader(u8),

    #[error("The backend is not available in this build")]
    Unavailable,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the error means the physical connection can no longer be trusted.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Transport(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::TimedOut => Error::Timeout,
            _ => Error::Transport(TransportError::Io(e)),
        }
    }
}
