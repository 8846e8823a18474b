//! Direct USB support for PN533-class readers.
//! Can be enabled by turning `usb` feature on.
//!
//! The controller frames travel over a pair of bulk endpoints. Transfers are driven on a
//! private current-thread runtime so every exchange can be bounded by the session timeout.

use std::time::Duration;

use nusb::transfer::RequestBuffer;
use nusb::Interface;
use tokio::runtime::Runtime;
use tokio::time::timeout;

use crate::backend::pn53x::{Pn53x, Port};
use crate::backend::BackendKind;
use crate::error::{Error, Result, TransportError};
use crate::session::descriptor::candidate_ids;
use crate::session::{ReaderDescriptor, TransportParams};
use crate::trace::{debug, info};

const ENDPOINT_OUT: u8 = 0x04;
const ENDPOINT_IN: u8 = 0x84;
const MAX_FRAME: usize = 265;

/// Bulk endpoint pair of a claimed PN533 interface.
pub struct UsbPort {
    interface: Interface,
    runtime: Runtime,
}

impl Port for UsbPort {
    fn write(&mut self, frame: &[u8], limit: Duration) -> Result<()> {
        let transfer = self.interface.bulk_out(ENDPOINT_OUT, frame.to_vec());
        let completion = self
            .runtime
            .block_on(async { timeout(limit, transfer).await })
            .map_err(|_| Error::Timeout)?;

        completion.into_result().map_err(TransportError::Usb)?;
        Ok(())
    }

    fn read(&mut self, limit: Duration) -> Result<Vec<u8>> {
        let transfer = self
            .interface
            .bulk_in(ENDPOINT_IN, RequestBuffer::new(MAX_FRAME));
        let completion = self
            .runtime
            .block_on(async { timeout(limit, transfer).await })
            .map_err(|_| Error::Timeout)?;

        Ok(completion.into_result().map_err(TransportError::Usb)?)
    }
}

/// USB reader backend.
pub type UsbBackend = Pn53x<UsbPort>;

/// Finds the first matching device, claims its interface and initializes the controller.
pub fn open(descriptor: Option<&ReaderDescriptor>, params: &TransportParams) -> Result<UsbBackend> {
    let ids: Vec<(u16, u16)> = match descriptor {
        Some(d) if !d.usb_ids.is_empty() => d.usb_ids.iter().map(|id| (id.vid, id.pid)).collect(),
        _ => candidate_ids(BackendKind::Usb)
            .into_iter()
            .map(|id| (id.vid, id.pid))
            .collect(),
    };

    let device_info = nusb::list_devices()
        .map_err(TransportError::Io)?
        .find(|d| ids.contains(&(d.vendor_id(), d.product_id())))
        .ok_or(Error::NoReaderFound)?;
    debug!(
        "Found USB reader {:04x}:{:04x}",
        device_info.vendor_id(),
        device_info.product_id()
    );

    let device = device_info.open().map_err(TransportError::Io)?;
    let interface = device
        .detach_and_claim_interface(0)
        .map_err(TransportError::Io)?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .map_err(TransportError::Io)?;

    let name = descriptor
        .map(|d| d.name.clone())
        .or_else(|| device_info.product_string().map(str::to_owned))
        .unwrap_or_else(|| "USB reader".to_owned());

    let mut backend = Pn53x::new(UsbPort { interface, runtime }, BackendKind::Usb, name);
    backend.initialize(params.timeout())?;
    info!("Opened USB reader");

    Ok(backend)
}
