//! Reader descriptors: which backends a reader model speaks and how to find it.
//!
//! The built-in catalogue covers the common PN53x-class and PC/SC readers. Applications
//! may describe other readers, typically loaded from JSON with the `serde` feature:
//!
//! ```json
//! {
//!   "name": "My PN532 board",
//!   "backends": ["uart"],
//!   "usb_ids": [{ "vid": 6790, "pid": 29987 }],
//!   "params": { "timeout_ms": 500, "baud_rate": 115200, "serial_port": "/dev/ttyUSB0" }
//! }
//! ```

use std::time::Duration;

use crate::backend::BackendKind;
use crate::error::{Error, Result};

const DEFAULT_TIMEOUT_MS: u64 = 1000;

/// A USB vendor/product pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct UsbId {
    pub vid: u16,
    pub pid: u16,
}

impl UsbId {
    pub const fn new(vid: u16, pid: u16) -> Self {
        Self { vid, pid }
    }
}

/// Tunables of the physical connection.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct TransportParams {
    /// Timeout of one exchange with the tag.
    pub timeout_ms: u64,
    /// Baud rate of UART readers.
    pub baud_rate: Option<u32>,
    /// Serial port of UART readers, found by USB bridge id when unset.
    pub serial_port: Option<String>,
    /// Substring of the PC/SC reader name.
    pub pcsc_reader: Option<String>,
}

impl Default for TransportParams {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            baud_rate: None,
            serial_port: None,
            pcsc_reader: None,
        }
    }
}

impl TransportParams {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// A reader model.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct ReaderDescriptor {
    pub name: String,
    /// Backends to try, in order.
    pub backends: Vec<BackendKind>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub usb_ids: Vec<UsbId>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub params: TransportParams,
}

impl ReaderDescriptor {
    pub fn new(name: impl Into<String>, backends: Vec<BackendKind>, usb_ids: Vec<UsbId>) -> Self {
        Self {
            name: name.into(),
            backends,
            usb_ids,
            params: TransportParams::default(),
        }
    }

    /// Rejects descriptors a session could not connect with.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Config("reader name is empty".to_owned()));
        }
        if self.backends.is_empty() {
            return Err(Error::Config(format!("reader '{}' names no backend", self.name)));
        }
        if self.params.timeout_ms == 0 {
            return Err(Error::Config(format!("reader '{}' has a zero timeout", self.name)));
        }
        if self.params.baud_rate == Some(0) {
            return Err(Error::Config(format!("reader '{}' has a zero baud rate", self.name)));
        }

        Ok(())
    }

    pub fn supports(&self, kind: BackendKind) -> bool {
        self.backends.contains(&kind)
    }
}

/// Readers known out of the box.
pub fn catalogue() -> Vec<ReaderDescriptor> {
    vec![
        // Its CCID firmware hides the PN532, so it is only reachable through PC/SC.
        ReaderDescriptor::new("ACS ACR122U", vec![BackendKind::Pcsc], vec![UsbId::new(0x072F, 0x2200)]),
        ReaderDescriptor::new("ACS ACR1222L", vec![BackendKind::Pcsc], vec![UsbId::new(0x072F, 0x90CC)]),
        ReaderDescriptor::new("SCM SCL3711", vec![BackendKind::Usb], vec![UsbId::new(0x04E6, 0x5591)]),
        ReaderDescriptor::new("NXP PN533", vec![BackendKind::Usb], vec![UsbId::new(0x04CC, 0x2533)]),
        ReaderDescriptor::new(
            "PN532 (UART)",
            vec![BackendKind::Uart],
            vec![
                UsbId::new(0x1A86, 0x7523),
                UsbId::new(0x10C4, 0xEA60),
                UsbId::new(0x0403, 0x6001),
                UsbId::new(0x067B, 0x2303),
            ],
        ),
    ]
}

/// Looks a reader up in the catalogue, ignoring case.
pub fn find(name: &str) -> Option<ReaderDescriptor> {
    catalogue()
        .into_iter()
        .find(|d| d.name.eq_ignore_ascii_case(name) || d.name.to_lowercase().contains(&name.to_lowercase()))
}

/// USB ids of every catalogued reader reachable through `kind`.
pub fn candidate_ids(kind: BackendKind) -> Vec<UsbId> {
    catalogue()
        .into_iter()
        .filter(|d| d.supports(kind))
        .flat_map(|d| d.usb_ids)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalogue() {
        let acr122 = find("acr122u").unwrap();
        assert_eq!(vec![BackendKind::Pcsc], acr122.backends);
        assert!(!acr122.supports(BackendKind::Usb));

        assert_eq!(4, candidate_ids(BackendKind::Uart).len());
        assert!(candidate_ids(BackendKind::Usb).contains(&UsbId::new(0x04E6, 0x5591)));
        assert!(find("unknown reader").is_none());

        catalogue().iter().for_each(|d| d.validate().unwrap());
    }

    #[test]
    fn test_validate() {
        let mut descriptor = ReaderDescriptor::new("Board", vec![], vec![]);
        assert!(matches!(descriptor.validate(), Err(Error::Config(_))));

        descriptor.backends.push(BackendKind::Uart);
        descriptor.params.timeout_ms = 0;
        assert!(matches!(descriptor.validate(), Err(Error::Config(_))));

        descriptor.params.timeout_ms = 250;
        assert!(descriptor.validate().is_ok());
        assert_eq!(Duration::from_millis(250), descriptor.params.timeout());
    }
}
