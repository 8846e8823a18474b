use std::collections::BTreeMap;

use crate::backend::Signature;
use crate::emulator::VirtualTag;
use crate::error::{Error, Result};
use crate::tag::felica::{
    Attribute, BLOCK_SIZE, CMD_READ_WITHOUT_ENCRYPTION, CMD_REQUEST_SERVICE,
    CMD_WRITE_WITHOUT_ENCRYPTION, SERVICE_NDEF_READ,
};

const SYSTEM_NDEF: u16 = 0x12FC;
const ATTRIBUTE_MASK: u16 = 0x003F;
const ATTRIBUTE_READ_WRITE: u16 = 0x0009;

const STATUS_ILLEGAL_SERVICE: [u8; 2] = [0x01, 0xA6];
const STATUS_ILLEGAL_BLOCK: [u8; 2] = [0x01, 0xA8];
const STATUS_ACCESS_DENIED: [u8; 2] = [0x01, 0xC0];

/// A FeliCa Lite-S style tag with the NDEF system.
///
/// Services sharing a service number address the same blocks; `xxx9` services are
/// writable, `xxxB` services are read-only.
pub struct VirtualFeliCa {
    idm: [u8; 8],
    pmm: [u8; 8],
    areas: BTreeMap<u16, Vec<[u8; BLOCK_SIZE]>>,
}

impl VirtualFeliCa {
    /// A tag with `data_blocks` NDEF blocks after a formatted attribute block.
    pub fn new(idm: [u8; 8], data_blocks: u16) -> Self {
        let mut ndef = vec![[0u8; BLOCK_SIZE]; data_blocks as usize + 1];
        ndef[0] = Attribute::new(data_blocks).to_bytes();

        let mut areas = BTreeMap::new();
        areas.insert(number(SERVICE_NDEF_READ), ndef);

        Self {
            idm,
            pmm: [0x00, 0xF1, 0x00, 0x00, 0x00, 0x01, 0x43, 0x00],
            areas,
        }
    }

    /// Adds a service with its own blocks.
    pub fn with_service(mut self, code: u16, blocks: usize) -> Self {
        self.areas.insert(number(code), vec![[0u8; BLOCK_SIZE]; blocks]);
        self
    }

    fn answer(&self, cmd: u8, body: &[u8]) -> Vec<u8> {
        let mut rx = Vec::with_capacity(10 + body.len());
        rx.push((10 + body.len()) as u8);
        rx.push(cmd + 1);
        rx.extend_from_slice(&self.idm);
        rx.extend_from_slice(body);
        rx
    }

    fn request_service(&self, params: &[u8]) -> Vec<u8> {
        let count = params.first().copied().unwrap_or(0) as usize;
        let mut body = vec![count as u8];

        for code in params.get(1..).unwrap_or_default().chunks(2).take(count) {
            let code = match code {
                [lo, hi] => u16::from_le_bytes([*lo, *hi]),
                _ => 0xFFFF,
            };
            match self.areas.contains_key(&number(code)) {
                true => body.extend_from_slice(&[0x00, 0x00]),
                _ => body.extend_from_slice(&[0xFF, 0xFF]),
            }
        }

        body
    }

    /// Splits `n_svc svc n_blk elements... rest` into the service, blocks and the rest.
    fn blocks(params: &[u8]) -> Option<(u16, Vec<usize>, &[u8])> {
        let (service, rest) = match params {
            [0x01, lo, hi, rest @ ..] => (u16::from_le_bytes([*lo, *hi]), rest),
            _ => return None,
        };
        let (&count, mut rest) = rest.split_first()?;

        let mut blocks = Vec::with_capacity(count as usize);
        for _ in 0..count {
            rest = match rest {
                [head, block, tail @ ..] if head & 0x80 != 0 => {
                    blocks.push(*block as usize);
                    tail
                }
                [_, lo, hi, tail @ ..] => {
                    blocks.push(u16::from_le_bytes([*lo, *hi]) as usize);
                    tail
                }
                _ => return None,
            };
        }

        Some((service, blocks, rest))
    }

    fn read(&self, params: &[u8]) -> Vec<u8> {
        let Some((service, blocks, _)) = Self::blocks(params) else {
            return STATUS_ILLEGAL_BLOCK.to_vec();
        };
        let Some(area) = self.areas.get(&number(service)) else {
            return STATUS_ILLEGAL_SERVICE.to_vec();
        };

        let mut body = vec![0x00, 0x00, blocks.len() as u8];
        for block in blocks {
            match area.get(block) {
                Some(data) => body.extend_from_slice(data),
                None => return STATUS_ILLEGAL_BLOCK.to_vec(),
            }
        }

        body
    }

    fn write(&mut self, params: &[u8]) -> Vec<u8> {
        let Some((service, blocks, data)) = Self::blocks(params) else {
            return STATUS_ILLEGAL_BLOCK.to_vec();
        };
        if service & ATTRIBUTE_MASK != ATTRIBUTE_READ_WRITE {
            return STATUS_ACCESS_DENIED.to_vec();
        }
        let Some(area) = self.areas.get_mut(&number(service)) else {
            return STATUS_ILLEGAL_SERVICE.to_vec();
        };
        if data.len() != blocks.len() * BLOCK_SIZE || blocks.iter().any(|b| *b >= area.len()) {
            return STATUS_ILLEGAL_BLOCK.to_vec();
        }

        for (block, chunk) in blocks.into_iter().zip(data.chunks(BLOCK_SIZE)) {
            area[block].copy_from_slice(chunk);
        }

        vec![0x00, 0x00]
    }
}

fn number(code: u16) -> u16 {
    code >> 6
}

impl VirtualTag for VirtualFeliCa {
    fn signature(&self) -> Signature {
        Signature::FeliCa {
            idm: self.idm,
            pmm: self.pmm,
            system_code: Some(SYSTEM_NDEF),
        }
    }

    fn handle(&mut self, frame: &[u8]) -> Result<Vec<u8>> {
        let (cmd, params) = match frame {
            [_, cmd, rest @ ..] if rest.len() >= 8 && rest[..8] == self.idm => (*cmd, &rest[8..]),
            // Tags ignore frames addressed to another IDm.
            _ => return Err(Error::Timeout),
        };

        let body = match cmd {
            CMD_REQUEST_SERVICE => self.request_service(params),
            CMD_READ_WITHOUT_ENCRYPTION => self.read(params),
            CMD_WRITE_WITHOUT_ENCRYPTION => self.write(params),
            _ => return Err(Error::Timeout),
        };

        Ok(self.answer(cmd, &body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tag::felica::SERVICE_NDEF_WRITE;

    const IDM: [u8; 8] = [0x01, 0x2E, 0x3C, 0x4D, 0x5E, 0x6F, 0x70, 0x81];

    fn frame(cmd: u8, params: &[u8]) -> Vec<u8> {
        let mut frame = vec![(10 + params.len()) as u8, cmd];
        frame.extend_from_slice(&IDM);
        frame.extend_from_slice(params);
        frame
    }

    #[test]
    fn test_request_service() {
        let mut tag = VirtualFeliCa::new(IDM, 4);
        let rx = tag
            .handle(&frame(CMD_REQUEST_SERVICE, &[0x02, 0x0B, 0x00, 0x09, 0x10]))
            .unwrap();

        assert_eq!(0x03, rx[1]);
        assert_eq!(&[0x02, 0x00, 0x00, 0xFF, 0xFF], &rx[10..]);
    }

    #[test]
    fn test_read_only_service_refuses_writes() {
        let mut tag = VirtualFeliCa::new(IDM, 4);
        let mut params = vec![0x01, 0x0B, 0x00, 0x01, 0x80, 0x01];
        params.extend_from_slice(&[0xAA; BLOCK_SIZE]);
        let rx = tag.handle(&frame(CMD_WRITE_WITHOUT_ENCRYPTION, &params)).unwrap();
        assert_eq!(&STATUS_ACCESS_DENIED, &rx[10..]);

        params[1..3].copy_from_slice(&SERVICE_NDEF_WRITE.to_le_bytes());
        let rx = tag.handle(&frame(CMD_WRITE_WITHOUT_ENCRYPTION, &params)).unwrap();
        assert_eq!(&[0x00, 0x00], &rx[10..]);

        let rx = tag
            .handle(&frame(CMD_READ_WITHOUT_ENCRYPTION, &[0x01, 0x0B, 0x00, 0x01, 0x80, 0x01]))
            .unwrap();
        assert_eq!(&[0xAA; BLOCK_SIZE], &rx[13..]);
    }

    #[test]
    fn test_other_idm_is_ignored() {
        let mut tag = VirtualFeliCa::new(IDM, 4);
        let mut frame = frame(CMD_REQUEST_SERVICE, &[0x01, 0x0B, 0x00]);
        frame[2] ^= 0xFF;

        assert!(matches!(tag.handle(&frame), Err(Error::Timeout)));
    }
}
