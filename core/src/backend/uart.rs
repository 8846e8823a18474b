//! Serial (HSU) support for PN532 readers.
//! Can be enabled by turning `uart` feature on.
//!
//! PN532 breakouts are usually wired to a USB-serial bridge, so the port is located by the
//! bridge's USB identifiers unless the descriptor names the port explicitly.

use std::io::{Read, Write};
use std::time::{Duration, Instant};

use serialport::{SerialPort, SerialPortType};

use crate::backend::frame;
use crate::backend::pn53x::{Pn53x, Port};
use crate::backend::BackendKind;
use crate::error::{Error, Result, TransportError};
use crate::session::descriptor::candidate_ids;
use crate::session::{ReaderDescriptor, TransportParams};
use crate::trace::{debug, info};

const DEFAULT_BAUD_RATE: u32 = 115_200;

/// A serial line to a PN532 in HSU mode.
pub struct UartPort {
    port: Box<dyn SerialPort>,
    awake: bool,
}

impl UartPort {
    fn fill(&mut self, buf: &mut Vec<u8>, deadline: Instant) -> Result<()> {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .filter(|d| !d.is_zero())
            .ok_or(Error::Timeout)?;
        self.port
            .set_timeout(remaining)
            .map_err(TransportError::Serial)?;

        let mut chunk = [0u8; 64];
        let n = self.port.read(&mut chunk)?;
        buf.extend_from_slice(&chunk[..n]);

        Ok(())
    }
}

impl Port for UartPort {
    fn wake_up(&mut self, _: Duration) -> Result<()> {
        if !self.awake {
            // Long preamble pulls the PN532 out of power-down on HSU.
            let mut preamble = vec![0x55, 0x55];
            preamble.extend_from_slice(&[0x00; 14]);
            self.port.write_all(&preamble)?;
            self.awake = true;
        }

        Ok(())
    }

    fn write(&mut self, frame: &[u8], _: Duration) -> Result<()> {
        self.port.write_all(frame)?;
        self.port.flush()?;
        Ok(())
    }

    fn read(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut buf = Vec::new();

        loop {
            if let Some(len) = frame::expected_len(&buf) {
                if buf.len() >= len {
                    buf.truncate(len);
                    return Ok(buf);
                }
            }

            self.fill(&mut buf, deadline)?;
        }
    }
}

/// UART reader backend.
pub type UartBackend = Pn53x<UartPort>;

fn find_port(ids: &[(u16, u16)]) -> Result<String> {
    let ports = serialport::available_ports().map_err(TransportError::Serial)?;

    ports
        .into_iter()
        .find(|p| match &p.port_type {
            SerialPortType::UsbPort(usb) => ids.contains(&(usb.vid, usb.pid)),
            _ => false,
        })
        .map(|p| p.port_name)
        .ok_or(Error::NoReaderFound)
}

/// Opens the serial port and initializes the controller.
pub fn open(descriptor: Option<&ReaderDescriptor>, params: &TransportParams) -> Result<UartBackend> {
    let path = match &params.serial_port {
        Some(path) => path.clone(),
        None => {
            let ids: Vec<(u16, u16)> = match descriptor {
                Some(d) if !d.usb_ids.is_empty() => {
                    d.usb_ids.iter().map(|id| (id.vid, id.pid)).collect()
                }
                _ => candidate_ids(BackendKind::Uart)
                    .into_iter()
                    .map(|id| (id.vid, id.pid))
                    .collect(),
            };
            find_port(&ids)?
        }
    };
    debug!("Using serial port: {}", path);

    let port = serialport::new(&path, params.baud_rate.unwrap_or(DEFAULT_BAUD_RATE))
        .timeout(params.timeout())
        .open()
        .map_err(TransportError::Serial)?;

    let name = descriptor
        .map(|d| d.name.clone())
        .unwrap_or_else(|| format!("PN532 on {}", path));

    let mut backend = Pn53x::new(UartPort { port, awake: false }, BackendKind::Uart, name);
    backend.initialize(params.timeout())?;
    info!("Opened UART reader on {}", path);

    Ok(backend)
}
