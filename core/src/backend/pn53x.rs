//! PN53x host controller shared by the USB (PN533) and UART (PN532) backends.
//!
//! The controller activates tags with `InListPassiveTarget` and relays tag frames with
//! `InDataExchange` (ISO 14443-A and Jewel targets, CRC and MIFARE crypto handled by the
//! chip) or `InCommunicateThru` (FeliCa, raw frames including the length byte).

use std::time::Duration;

use crate::backend::frame::{self, Frame, TFI_CONTROLLER, TFI_HOST};
use crate::backend::{Backend, BackendKind, Signature};
use crate::error::{Error, Result, TransportError};
use crate::trace::{debug, info};

const CMD_GET_FIRMWARE_VERSION: u8 = 0x02;
const CMD_SAM_CONFIGURATION: u8 = 0x14;
const CMD_RF_CONFIGURATION: u8 = 0x32;
const CMD_IN_DATA_EXCHANGE: u8 = 0x40;
const CMD_IN_COMMUNICATE_THRU: u8 = 0x42;
const CMD_IN_LIST_PASSIVE_TARGET: u8 = 0x4A;
const CMD_IN_RELEASE: u8 = 0x52;

const BRTY_106A: u8 = 0x00;
const BRTY_212F: u8 = 0x01;
const BRTY_JEWEL: u8 = 0x04;

/// FeliCa polling for any system code, requesting the system code in the answer.
const FELICA_POLLING: [u8; 5] = [0x00, 0xFF, 0xFF, 0x01, 0x00];

const STATUS_TIMEOUT: u8 = 0x01;
const STATUS_MIFARE_AUTH: u8 = 0x14;

/// A framed byte pipe to a PN53x controller.
pub trait Port: Send {
    /// Writes one complete frame.
    fn write(&mut self, frame: &[u8], timeout: Duration) -> Result<()>;

    /// Reads one complete frame.
    fn read(&mut self, timeout: Duration) -> Result<Vec<u8>>;

    /// Sends the bytes needed to wake the controller up before the first command.
    fn wake_up(&mut self, _timeout: Duration) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Iso14443A,
    Jewel,
    FeliCa,
}

/// Firmware information reported by `GetFirmwareVersion`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Firmware {
    pub ic: u8,
    pub version: u8,
    pub revision: u8,
}

/// A PN53x controller reachable through a [`Port`].
pub struct Pn53x<P: Port> {
    port: P,
    kind: BackendKind,
    name: String,
    target: Option<Target>,
}

impl<P: Port> Pn53x<P> {
    pub fn new(port: P, kind: BackendKind, name: impl Into<String>) -> Self {
        Self {
            port,
            kind,
            name: name.into(),
            target: None,
        }
    }

    /// Wakes the controller up and prepares it for passive polling.
    pub fn initialize(&mut self, timeout: Duration) -> Result<Firmware> {
        self.port.wake_up(timeout)?;

        let firmware = match self.command(CMD_GET_FIRMWARE_VERSION, &[], timeout)?[..] {
            [ic, version, revision, ..] => Firmware {
                ic,
                version,
                revision,
            },
            _ => return Err(TransportError::Framing("short firmware version").into()),
        };
        info!(
            "PN5{:02X} firmware {}.{} on {}",
            firmware.ic, firmware.version, firmware.revision, self.name
        );

        // Only the PN532 has a SAM companion; normal mode without timeout.
        if firmware.ic == 0x32 {
            self.command(CMD_SAM_CONFIGURATION, &[0x01, 0x14, 0x01], timeout)?;
        }

        // MxRtyATR, MxRtyPSL, MxRtyPassiveActivation: give up on an empty field quickly.
        self.command(CMD_RF_CONFIGURATION, &[0x05, 0xFF, 0x01, 0x02], timeout)?;

        Ok(firmware)
    }

    /// Sends one host command and returns the response data following `D5 <cmd + 1>`.
    pub fn command(&mut self, cmd: u8, params: &[u8], timeout: Duration) -> Result<Vec<u8>> {
        let mut payload = Vec::with_capacity(params.len() + 2);
        payload.push(TFI_HOST);
        payload.push(cmd);
        payload.extend_from_slice(params);

        self.port.write(&frame::encode(&payload)?, timeout)?;

        match frame::decode(&self.port.read(timeout)?)? {
            Frame::Ack => {}
            _ => return Err(TransportError::Framing("controller did not acknowledge").into()),
        }

        match frame::decode(&self.port.read(timeout)?)? {
            Frame::Info(data) => match data.as_slice() {
                [TFI_CONTROLLER, code, rest @ ..] if *code == cmd.wrapping_add(1) => {
                    Ok(rest.to_vec())
                }
                _ => Err(TransportError::Framing("unexpected response code").into()),
            },
            Frame::Error => Err(TransportError::Reader(0x7F).into()),
            _ => Err(TransportError::Framing("expected an information frame").into()),
        }
    }

    fn list_passive_target(&mut self, brty: u8, initiator: &[u8], timeout: Duration) -> Result<Option<Vec<u8>>> {
        let mut params = vec![0x01, brty];
        params.extend_from_slice(initiator);

        let data = self.command(CMD_IN_LIST_PASSIVE_TARGET, &params, timeout)?;
        match data.as_slice() {
            [0x00, ..] | [] => Ok(None),
            // NbTg, Tg, target data
            [_, _, rest @ ..] => Ok(Some(rest.to_vec())),
            _ => Err(TransportError::Framing("truncated target list").into()),
        }
    }

    fn check_status(status: u8) -> Result<()> {
        match status & 0x3F {
            0x00 => Ok(()),
            STATUS_TIMEOUT => Err(Error::FieldLost),
            STATUS_MIFARE_AUTH => Err(Error::AuthenticationFailed),
            other => Err(TransportError::Reader(other).into()),
        }
    }
}

/// Parses the target data of a 106 kbps type A listing.
pub fn parse_target_106a(data: &[u8]) -> Result<Signature> {
    let truncated = || TransportError::Framing("truncated type A target");

    let (sens_res, rest) = (data.get(..2).ok_or_else(truncated)?, &data[2..]);
    let (&sak, rest) = rest.split_first().ok_or_else(truncated)?;
    let (&uid_len, rest) = rest.split_first().ok_or_else(truncated)?;
    let uid = rest.get(..uid_len as usize).ok_or_else(truncated)?.to_vec();
    let rest = &rest[uid_len as usize..];

    let ats = match rest.split_first() {
        Some((&len, ats)) if len > 1 => Some(ats.get(..len as usize - 1).ok_or_else(truncated)?.to_vec()),
        _ => None,
    };

    Ok(Signature::Iso14443A {
        atqa: u16::from_be_bytes([sens_res[0], sens_res[1]]),
        sak,
        uid,
        ats,
    })
}

/// Parses the target data of a Jewel listing: `SENS_RES(2) JEWELID(4)`.
pub fn parse_target_jewel(data: &[u8]) -> Result<Signature> {
    match data {
        [a, b, uid @ ..] if uid.len() >= 4 => Ok(Signature::Iso14443A {
            atqa: u16::from_be_bytes([*a, *b]),
            sak: 0x00,
            uid: uid[..4].to_vec(),
            ats: None,
        }),
        _ => Err(TransportError::Framing("truncated jewel target").into()),
    }
}

/// Parses the target data of a 212 kbps FeliCa listing:
/// `POL_RES length, 01, IDm(8), PMm(8), [system code(2)]`.
pub fn parse_target_felica(data: &[u8]) -> Result<Signature> {
    match data {
        [_len, 0x01, rest @ ..] if rest.len() >= 16 => {
            let mut idm = [0u8; 8];
            let mut pmm = [0u8; 8];
            idm.copy_from_slice(&rest[..8]);
            pmm.copy_from_slice(&rest[8..16]);

            Ok(Signature::FeliCa {
                idm,
                pmm,
                system_code: rest.get(16..18).map(|sc| u16::from_be_bytes([sc[0], sc[1]])),
            })
        }
        _ => Err(TransportError::Framing("truncated felica target").into()),
    }
}

impl<P: Port> Backend for Pn53x<P> {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn poll(&mut self, timeout: Duration) -> Result<Option<Signature>> {
        if let Some(data) = self.list_passive_target(BRTY_106A, &[], timeout)? {
            self.target = Some(Target::Iso14443A);
            return parse_target_106a(&data).map(Some);
        }

        if let Some(data) = self.list_passive_target(BRTY_JEWEL, &[], timeout)? {
            self.target = Some(Target::Jewel);
            return parse_target_jewel(&data).map(Some);
        }

        if let Some(data) = self.list_passive_target(BRTY_212F, &FELICA_POLLING, timeout)? {
            self.target = Some(Target::FeliCa);
            return parse_target_felica(&data).map(Some);
        }

        self.target = None;
        Ok(None)
    }

    fn transceive(&mut self, tx: &[u8], timeout: Duration) -> Result<Vec<u8>> {
        debug!("TX: {}", hex::encode(tx));

        let data = match self.target {
            Some(Target::Iso14443A) | Some(Target::Jewel) => {
                let mut params = vec![0x01];
                params.extend_from_slice(tx);
                self.command(CMD_IN_DATA_EXCHANGE, &params, timeout)?
            }
            Some(Target::FeliCa) => self.command(CMD_IN_COMMUNICATE_THRU, tx, timeout)?,
            None => return Err(Error::NoTag),
        };

        let (&status, rx) = data
            .split_first()
            .ok_or(TransportError::Framing("missing status byte"))?;
        Self::check_status(status)?;

        debug!("RX: {}", hex::encode(rx));

        Ok(rx.to_vec())
    }

    fn release(&mut self) -> Result<()> {
        if self.target.take().is_some() {
            self.command(CMD_IN_RELEASE, &[0x00], Duration::from_millis(500))?;
        }

        Ok(())
    }

    fn close(&mut self) {
        let _ = self.release();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;

    /// Replays canned controller frames and records what the host wrote.
    struct ScriptedPort {
        written: Vec<Vec<u8>>,
        replies: VecDeque<Vec<u8>>,
    }

    impl ScriptedPort {
        fn new(responses: &[&[u8]]) -> Self {
            let mut replies = VecDeque::new();
            for payload in responses {
                replies.push_back(frame::ACK.to_vec());
                replies.push_back(frame::encode(payload).unwrap());
            }

            Self {
                written: Vec::new(),
                replies,
            }
        }
    }

    impl Port for ScriptedPort {
        fn write(&mut self, frame: &[u8], _: Duration) -> Result<()> {
            self.written.push(frame.to_vec());
            Ok(())
        }

        fn read(&mut self, _: Duration) -> Result<Vec<u8>> {
            self.replies.pop_front().ok_or(Error::Timeout)
        }
    }

    const TIMEOUT: Duration = Duration::from_millis(100);

    #[test]
    fn test_poll_ntag() {
        let port = ScriptedPort::new(&[&[
            0xD5, 0x4B, 0x01, 0x01, 0x00, 0x44, 0x00, 0x07, 0x04, 0x11, 0x22, 0x33, 0x44, 0x55,
            0x66,
        ]]);
        let mut controller = Pn53x::new(port, BackendKind::Uart, "test");

        let signature = controller.poll(TIMEOUT).unwrap().unwrap();
        assert_eq!(
            Signature::Iso14443A {
                atqa: 0x0044,
                sak: 0x00,
                uid: vec![0x04, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66],
                ats: None,
            },
            signature,
        );
        assert_eq!(
            frame::encode(&[0xD4, 0x4A, 0x01, 0x00]).unwrap(),
            controller.port.written[0],
        );
    }

    #[test]
    fn test_poll_falls_through_to_felica() {
        let mut felica = vec![0xD5, 0x4B, 0x01, 0x01, 0x14, 0x01];
        felica.extend_from_slice(&[0x01; 8]);
        felica.extend_from_slice(&[0x02; 8]);
        felica.extend_from_slice(&[0x12, 0xFC]);

        let port = ScriptedPort::new(&[&[0xD5, 0x4B, 0x00], &[0xD5, 0x4B, 0x00], &felica]);
        let mut controller = Pn53x::new(port, BackendKind::Usb, "test");

        match controller.poll(TIMEOUT).unwrap() {
            Some(Signature::FeliCa { idm, system_code, .. }) => {
                assert_eq!([0x01; 8], idm);
                assert_eq!(Some(0x12FC), system_code);
            }
            other => panic!("unexpected signature: {:?}", other),
        }
    }

    #[test]
    fn test_transceive_maps_status() {
        let port = ScriptedPort::new(&[
            &[0xD5, 0x4B, 0x01, 0x01, 0x03, 0x44, 0x20, 0x07, 1, 2, 3, 4, 5, 6, 7, 0x06, 0x75, 0x77, 0x81, 0x02, 0x80],
            &[0xD5, 0x41, 0x00, 0x91, 0x00],
            &[0xD5, 0x41, 0x01],
        ]);
        let mut controller = Pn53x::new(port, BackendKind::Usb, "test");

        match controller.poll(TIMEOUT).unwrap() {
            Some(Signature::Iso14443A { sak, ats, .. }) => {
                assert_eq!(0x20, sak);
                assert_eq!(Some(vec![0x75, 0x77, 0x81, 0x02, 0x80]), ats);
            }
            other => panic!("unexpected signature: {:?}", other),
        }

        assert_eq!(vec![0x91, 0x00], controller.transceive(&[0x90, 0x60, 0, 0, 0], TIMEOUT).unwrap());
        assert!(matches!(
            controller.transceive(&[0x90, 0x60, 0, 0, 0], TIMEOUT),
            Err(Error::FieldLost)
        ));
    }
}
