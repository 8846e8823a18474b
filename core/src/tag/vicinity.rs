//! Type 5 tags (ISO 15693 vicinity cards: ICODE, Tag-it, ST25DV...).
//!
//! Requests are `flags cmd [uid] params`; answers start with a flags byte whose bit 0
//! marks an error followed by its code. The UID travels LSB first.

use crate::backend::Signature;
use crate::error::{Error, Result, TransportError};
use crate::ndef::tlv;
use crate::tag::{splice, Capabilities, Link, LockReport, Range, TagFamily, TagInfo};
use crate::trace::{debug, info};

pub const CMD_READ_SINGLE_BLOCK: u8 = 0x20;
pub const CMD_WRITE_SINGLE_BLOCK: u8 = 0x21;
pub const CMD_LOCK_BLOCK: u8 = 0x22;
pub const CMD_GET_SYSTEM_INFO: u8 = 0x2B;
pub const CMD_GET_MULTIPLE_BLOCK_SECURITY_STATUS: u8 = 0x2C;

const FLAG_HIGH_DATA_RATE: u8 = 0x02;
const FLAG_ADDRESSED: u8 = 0x20;
const FLAG_ERROR: u8 = 0x01;

const ERROR_BLOCK_LOCKED: u8 = 0x12;
const ERROR_ALREADY_LOCKED: u8 = 0x11;

const INFO_DSFID: u8 = 0x01;
const INFO_AFI: u8 = 0x02;
const INFO_MEMORY: u8 = 0x04;
const INFO_IC: u8 = 0x08;

/// Geometry assumed when the tag does not report its memory (ICODE SLI).
const FALLBACK_BLOCKS: usize = 28;
const FALLBACK_BLOCK_SIZE: usize = 4;

/// Blocks queried per `Get Multiple Block Security Status`.
const STATUS_CHUNK: usize = 32;

const CC_MAGIC: u8 = 0xE1;
const CC_VERSION: u8 = 0x40;
const CC_FEATURES: u8 = 0x01;

/// Memory layout reported by `Get System Info`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemInfo {
    pub dsfid: Option<u8>,
    pub afi: Option<u8>,
    pub blocks: usize,
    pub block_size: usize,
    pub ic_reference: Option<u8>,
}

impl SystemInfo {
    pub fn parse(body: &[u8]) -> Result<Self> {
        let (&flags, rest) = body
            .split_first()
            .ok_or(TransportError::Framing("empty system information"))?;
        let mut fields = rest.get(8..).unwrap_or_default().iter().copied();

        let dsfid = (flags & INFO_DSFID != 0).then(|| fields.next()).flatten();
        let afi = (flags & INFO_AFI != 0).then(|| fields.next()).flatten();
        let (blocks, block_size) = match flags & INFO_MEMORY != 0 {
            true => match (fields.next(), fields.next()) {
                (Some(n), Some(s)) => (n as usize + 1, (s & 0x1F) as usize + 1),
                _ => return Err(TransportError::Framing("truncated memory size").into()),
            },
            _ => (FALLBACK_BLOCKS, FALLBACK_BLOCK_SIZE),
        };
        let ic_reference = (flags & INFO_IC != 0).then(|| fields.next()).flatten();

        Ok(Self {
            dsfid,
            afi,
            blocks,
            block_size,
            ic_reference,
        })
    }

    pub fn memory_size(&self) -> usize {
        self.blocks * self.block_size
    }
}

pub struct Vicinity {
    uid: Option<[u8; 8]>,
    system: Option<SystemInfo>,
    locked: Option<Vec<bool>>,
}

impl Vicinity {
    pub fn new(signature: &Signature) -> Self {
        let uid = match signature {
            Signature::Iso15693 { uid, .. } => Some(*uid),
            other => <[u8; 8]>::try_from(other.uid()).ok(),
        };

        Self {
            uid,
            system: None,
            locked: None,
        }
    }

    fn frame(&self, cmd: u8, params: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(10 + params.len());
        match &self.uid {
            Some(uid) => {
                frame.push(FLAG_HIGH_DATA_RATE | FLAG_ADDRESSED);
                frame.push(cmd);
                frame.extend_from_slice(uid);
            }
            None => {
                frame.push(FLAG_HIGH_DATA_RATE);
                frame.push(cmd);
            }
        }

        frame.extend_from_slice(params);
        frame
    }

    /// Sends a request and returns the answer after the flags byte.
    /// `block` names the block an error code refers to.
    fn request(&mut self, link: &mut Link, cmd: u8, params: &[u8], block: usize) -> Result<Vec<u8>> {
        let rx = link.transceive(&self.frame(cmd, params))?;

        match rx.split_first() {
            Some((flags, [code, ..])) if flags & FLAG_ERROR != 0 => {
                debug!("ISO 15693 error {:02x} on command {:02x}", code, cmd);
                match *code {
                    ERROR_BLOCK_LOCKED => Err(Error::BlockLocked(block)),
                    code => Err(Error::Status(code as u16)),
                }
            }
            Some((flags, _)) if flags & FLAG_ERROR != 0 => Err(Error::Status(0x00)),
            Some((_, body)) => Ok(body.to_vec()),
            None => Err(TransportError::Framing("empty ISO 15693 response").into()),
        }
    }

    pub fn system_info(&mut self, link: &mut Link) -> Result<SystemInfo> {
        if let Some(system) = self.system {
            return Ok(system);
        }

        let system = match self.request(link, CMD_GET_SYSTEM_INFO, &[], 0) {
            Ok(body) => SystemInfo::parse(&body)?,
            Err(Error::Status(_)) => SystemInfo {
                dsfid: None,
                afi: None,
                blocks: FALLBACK_BLOCKS,
                block_size: FALLBACK_BLOCK_SIZE,
                ic_reference: None,
            },
            Err(e) => return Err(e),
        };
        debug!("ISO 15693 memory: {} blocks of {} bytes", system.blocks, system.block_size);

        self.system = Some(system);
        Ok(system)
    }

    /// Lock state of every block, from `Get Multiple Block Security Status`.
    fn locked(&mut self, link: &mut Link) -> Result<Vec<bool>> {
        if let Some(locked) = &self.locked {
            return Ok(locked.clone());
        }

        let system = self.system_info(link)?;
        let mut locked = Vec::with_capacity(system.blocks);
        while locked.len() < system.blocks {
            let first = locked.len();
            let count = (system.blocks - first).min(STATUS_CHUNK);

            let body = self.request(
                link,
                CMD_GET_MULTIPLE_BLOCK_SECURITY_STATUS,
                &[first as u8, (count - 1) as u8],
                first,
            )?;
            if body.len() < count {
                return Err(TransportError::Framing("short block security status").into());
            }

            locked.extend(body[..count].iter().map(|status| status & 0x01 != 0));
        }

        self.locked = Some(locked.clone());
        Ok(locked)
    }

    fn read_block(&mut self, link: &mut Link, block: usize, block_size: usize) -> Result<Vec<u8>> {
        let body = self.request(link, CMD_READ_SINGLE_BLOCK, &[block as u8], block)?;
        body.get(..block_size)
            .map(<[u8]>::to_vec)
            .ok_or(TransportError::Framing("short Read Single Block response").into())
    }

    /// Length of the capability container at the start of memory.
    pub fn cc_len(&mut self, link: &mut Link) -> Result<usize> {
        Ok(match self.system_info(link)?.memory_size() / 8 > 0xFF {
            true => 8,
            _ => 4,
        })
    }

    fn capability_container(memory_size: usize) -> Vec<u8> {
        match memory_size / 8 {
            size if size > 0xFF => {
                let [hi, lo] = (size.min(0xFFFF) as u16).to_be_bytes();
                vec![CC_MAGIC + 1, CC_VERSION, 0x00, CC_FEATURES, 0x00, 0x00, hi, lo]
            }
            size => vec![CC_MAGIC, CC_VERSION, size as u8, CC_FEATURES],
        }
    }

    pub fn get_info(&mut self, link: &mut Link) -> Result<TagInfo> {
        let system = self.system_info(link)?;
        let locked = self.locked(link)?;

        let product = match self.uid.map(|uid| uid[6]) {
            Some(0x04) => "NXP ICODE",
            Some(0x07) => "TI Tag-it",
            Some(0x02) => "ST25 / LRI",
            Some(0x16) => "EM Microelectronic",
            _ => "ISO 15693",
        };

        Ok(TagInfo {
            family: TagFamily::Type5ISO15693,
            uid: self.uid.map(|uid| uid.to_vec()).unwrap_or_default(),
            product: product.to_owned(),
            memory_size: system.memory_size(),
            block_size: system.block_size,
            capabilities: Capabilities {
                read: true,
                write: true,
                lock: true,
                format: true,
                authenticate: false,
            },
            locked_blocks: locked
                .iter()
                .enumerate()
                .filter(|(_, locked)| **locked)
                .map(|(block, _)| block)
                .collect(),
        })
    }

    pub fn read(&mut self, link: &mut Link, range: Range) -> Result<Vec<u8>> {
        let system = self.system_info(link)?;
        range.check(system.memory_size())?;

        let blocks = range.block_indices(system.block_size);
        let mut data = Vec::with_capacity(blocks.len() * system.block_size);
        for block in blocks.clone() {
            data.extend(self.read_block(link, block, system.block_size)?);
        }

        let start = range.offset - blocks.start * system.block_size;
        Ok(data[start..start + range.len].to_vec())
    }

    pub fn write(&mut self, link: &mut Link, range: Range, data: &[u8]) -> Result<()> {
        let system = self.system_info(link)?;
        range.check(system.memory_size())?;

        let blocks = range.block_indices(system.block_size);
        let locked = self.locked(link)?;
        if let Some(block) = blocks.clone().find(|b| locked[*b]) {
            return Err(Error::BlockLocked(block));
        }

        let wide = range.widen(system.block_size);
        let image = match wide == range {
            true => data.to_vec(),
            _ => splice(wide, range, self.read(link, wide)?, data),
        };

        for (block, chunk) in blocks.zip(image.chunks(system.block_size)) {
            let mut params = vec![block as u8];
            params.extend_from_slice(chunk);
            self.request(link, CMD_WRITE_SINGLE_BLOCK, &params, block)?;
        }

        Ok(())
    }

    /// Reports the blocks `lock(range)` would freeze.
    pub fn preview_lock(&mut self, link: &mut Link, range: Range) -> Result<LockReport> {
        let system = self.system_info(link)?;
        range.check(system.memory_size())?;

        Ok(LockReport {
            blocks: range.block_indices(system.block_size).collect(),
            bits: Vec::new(),
        })
    }

    /// Permanently locks every block `range` touches.
    pub fn lock(&mut self, link: &mut Link, range: Range) -> Result<LockReport> {
        let report = self.preview_lock(link, range)?;
        let mut locked = self.locked(link)?;

        for &block in &report.blocks {
            if locked[block] {
                continue;
            }

            match self.request(link, CMD_LOCK_BLOCK, &[block as u8], block) {
                Ok(_) => locked[block] = true,
                Err(Error::Status(code)) if code == ERROR_ALREADY_LOCKED as u16 => {
                    locked[block] = true
                }
                Err(e) => {
                    self.locked = Some(locked);
                    return Err(e);
                }
            }
        }

        self.locked = Some(locked);
        info!("Locked blocks {:?}", report.blocks);
        Ok(report)
    }

    /// Writes a capability container followed by an empty NDEF TLV.
    pub fn format(&mut self, link: &mut Link) -> Result<()> {
        let system = self.system_info(link)?;

        let mut area = Self::capability_container(system.memory_size());
        area.extend_from_slice(&tlv::EMPTY_NDEF);
        area.resize(area.len().div_ceil(system.block_size) * system.block_size, 0x00);

        self.write(link, Range::new(0, area.len()), &area)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_info() {
        let mut body = vec![0x0F];
        body.extend([0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x04, 0xE0]);
        body.extend([0x00, 0x00, 0x1B, 0x03, 0x01]);

        let info = SystemInfo::parse(&body).unwrap();
        assert_eq!(Some(0x00), info.dsfid);
        assert_eq!((28, 4), (info.blocks, info.block_size));
        assert_eq!(Some(0x01), info.ic_reference);
        assert_eq!(112, info.memory_size());
    }

    #[test]
    fn test_system_info_without_memory() {
        let mut body = vec![0x00];
        body.extend([0u8; 8]);

        let info = SystemInfo::parse(&body).unwrap();
        assert_eq!(FALLBACK_BLOCKS * FALLBACK_BLOCK_SIZE, info.memory_size());
    }

    #[test]
    fn test_addressed_frame() {
        let uid = [0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x04, 0xE0];
        let vicinity = Vicinity::new(&Signature::Iso15693 { uid, dsfid: 0 });

        let frame = vicinity.frame(CMD_READ_SINGLE_BLOCK, &[0x05]);
        assert_eq!(&[0x22, 0x20], &frame[..2]);
        assert_eq!(&uid, &frame[2..10]);
        assert_eq!(0x05, frame[10]);
    }

    #[test]
    fn test_capability_container() {
        assert_eq!(vec![0xE1, 0x40, 0x0E, 0x01], Vicinity::capability_container(112));
        assert_eq!(8, Vicinity::capability_container(8192).len());
    }
}
