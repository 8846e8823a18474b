//! Type 3 tags (FeliCa Lite/Standard).
//!
//! Blocks are 16 bytes and addressed per service. The NDEF data lives behind service
//! `0x000B` (read) and `0x0009` (write); block 0 of that service is the attribute
//! information block describing the stored message.

use crate::backend::Signature;
use crate::error::{Error, Result, TransportError};
use crate::ndef::NdefMessage;
use crate::tag::{splice, Capabilities, Link, Range, TagFamily, TagInfo};
use crate::trace::debug;

pub const CMD_REQUEST_SERVICE: u8 = 0x02;
pub const CMD_READ_WITHOUT_ENCRYPTION: u8 = 0x06;
pub const CMD_WRITE_WITHOUT_ENCRYPTION: u8 = 0x08;

pub const SERVICE_NDEF_READ: u16 = 0x000B;
pub const SERVICE_NDEF_WRITE: u16 = 0x0009;

pub const BLOCK_SIZE: usize = 16;

/// Blocks assumed when the attribute information block is unreadable.
pub const FALLBACK_BLOCKS: usize = 14;

/// Status reported by `Request Service` for a missing service.
pub const STATUS_NO_SERVICE: u16 = 0x01A6;

/// Status flag 2 for a block number past the end of a service.
pub const SF2_ILLEGAL_BLOCK: u8 = 0xA8;

const ATTRIBUTE_VERSION: u8 = 0x10;
const DEFAULT_NBR: u8 = 4;
const DEFAULT_NBW: u8 = 1;
const WRITE_IN_PROGRESS: u8 = 0x0F;
const ACCESS_READ_WRITE: u8 = 0x01;

/// The NDEF attribute information block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attribute {
    pub version: u8,
    /// Blocks readable with one command.
    pub nbr: u8,
    /// Blocks writable with one command.
    pub nbw: u8,
    /// NDEF data blocks available.
    pub nmaxb: u16,
    pub write_flag: u8,
    pub rw_flag: u8,
    /// Length of the stored message.
    pub ln: u32,
}

impl Attribute {
    pub fn new(nmaxb: u16) -> Self {
        Self {
            version: ATTRIBUTE_VERSION,
            nbr: DEFAULT_NBR,
            nbw: DEFAULT_NBW,
            nmaxb,
            write_flag: 0x00,
            rw_flag: ACCESS_READ_WRITE,
            ln: 0,
        }
    }

    /// Parses the block, rejecting it when the checksum does not match.
    pub fn parse(block: &[u8]) -> Option<Self> {
        if block.len() < BLOCK_SIZE || checksum(&block[..14]) != [block[14], block[15]] {
            return None;
        }

        Some(Self {
            version: block[0],
            nbr: block[1],
            nbw: block[2],
            nmaxb: u16::from_be_bytes([block[3], block[4]]),
            write_flag: block[9],
            rw_flag: block[10],
            ln: u32::from_be_bytes([0, block[11], block[12], block[13]]),
        })
    }

    pub fn to_bytes(&self) -> [u8; BLOCK_SIZE] {
        let mut block = [0u8; BLOCK_SIZE];
        block[0] = self.version;
        block[1] = self.nbr;
        block[2] = self.nbw;
        block[3..5].copy_from_slice(&self.nmaxb.to_be_bytes());
        block[9] = self.write_flag;
        block[10] = self.rw_flag;
        block[11..14].copy_from_slice(&self.ln.to_be_bytes()[1..]);

        let sum = checksum(&block[..14]);
        block[14..].copy_from_slice(&sum);
        block
    }
}

/// Maps the card's illegal block status onto the requested range.
fn out_of_range(e: Error, range: Range) -> Error {
    match e {
        Error::Status(sw) if sw as u8 == SF2_ILLEGAL_BLOCK => Error::InvalidRange {
            offset: range.offset,
            len: range.len,
        },
        e => e,
    }
}

fn checksum(bytes: &[u8]) -> [u8; 2] {
    let sum = bytes.iter().fold(0u16, |acc, b| acc.wrapping_add(*b as u16));
    sum.to_be_bytes()
}

/// Encodes a block list element for the first service of the command.
pub fn block_element(block: u16) -> Vec<u8> {
    match block {
        b if b < 0x100 => vec![0x80, b as u8],
        b => {
            let [lo, hi] = b.to_le_bytes();
            vec![0x00, lo, hi]
        }
    }
}

pub struct FeliCa {
    idm: [u8; 8],
    pmm: Option<[u8; 8]>,
    system_code: Option<u16>,
    read_service: u16,
    write_service: u16,
    verified: Vec<u16>,
    attribute: Option<Attribute>,
}

impl FeliCa {
    pub fn new(signature: &Signature) -> Self {
        let (idm, pmm, system_code) = match signature {
            Signature::FeliCa {
                idm,
                pmm,
                system_code,
            } => (*idm, Some(*pmm), *system_code),
            other => {
                let mut idm = [0u8; 8];
                other
                    .uid()
                    .iter()
                    .take(8)
                    .enumerate()
                    .for_each(|(i, b)| idm[i] = *b);
                (idm, None, None)
            }
        };

        Self {
            idm,
            pmm,
            system_code,
            read_service: SERVICE_NDEF_READ,
            write_service: SERVICE_NDEF_WRITE,
            verified: Vec::new(),
            attribute: None,
        }
    }

    pub fn read_service(&self) -> u16 {
        self.read_service
    }

    pub fn write_service(&self) -> u16 {
        self.write_service
    }

    /// Builds `len cmd IDm params`.
    fn frame(&self, cmd: u8, params: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(10 + params.len());
        frame.push((10 + params.len()) as u8);
        frame.push(cmd);
        frame.extend_from_slice(&self.idm);
        frame.extend_from_slice(params);
        frame
    }

    /// Sends a command and returns what follows the IDm in the answer.
    fn command(&mut self, link: &mut Link, cmd: u8, params: &[u8]) -> Result<Vec<u8>> {
        let rx = link.transceive(&self.frame(cmd, params))?;

        match rx.as_slice() {
            [_, code, rest @ ..] if rest.len() >= 8 && *code == cmd + 1 => {
                if rest[..8] != self.idm {
                    return Err(TransportError::Framing("response from another IDm").into());
                }
                Ok(rx[10..].to_vec())
            }
            _ => Err(TransportError::Framing("unexpected FeliCa response").into()),
        }
    }

    fn check_status(body: &[u8]) -> Result<()> {
        match body {
            [0x00, 0x00, ..] => Ok(()),
            [sf1, sf2, ..] => Err(Error::Status(u16::from_be_bytes([*sf1, *sf2]))),
            _ => Err(TransportError::Framing("missing FeliCa status flags").into()),
        }
    }

    /// Checks the service exists with `Request Service`.
    fn request_service(&mut self, link: &mut Link, code: u16) -> Result<()> {
        if self.verified.contains(&code) {
            return Ok(());
        }

        let mut params = vec![0x01];
        params.extend_from_slice(&code.to_le_bytes());

        let body = self.command(link, CMD_REQUEST_SERVICE, &params)?;
        match body.as_slice() {
            [_, 0xFF, 0xFF, ..] => Err(Error::Status(STATUS_NO_SERVICE)),
            [_, _, _, ..] => {
                debug!("FeliCa service {:04x} is present", code);
                self.verified.push(code);
                Ok(())
            }
            _ => Err(TransportError::Framing("short Request Service response").into()),
        }
    }

    /// Makes `code` the service used for both reads and writes.
    pub fn select_service(&mut self, link: &mut Link, code: u16) -> Result<()> {
        self.request_service(link, code)?;

        self.read_service = code;
        self.write_service = code;
        self.attribute = None;
        Ok(())
    }

    /// Restores the NDEF services.
    pub fn select_ndef_service(&mut self) {
        if self.on_ndef_service() {
            return;
        }

        self.read_service = SERVICE_NDEF_READ;
        self.write_service = SERVICE_NDEF_WRITE;
        self.attribute = None;
    }

    /// Reads up to `Nbr` consecutive blocks of the read service.
    fn read_blocks(&mut self, link: &mut Link, first: u16, count: usize) -> Result<Vec<u8>> {
        let service = self.read_service;
        self.request_service(link, service)?;

        let mut params = vec![0x01];
        params.extend_from_slice(&service.to_le_bytes());
        params.push(count as u8);
        for block in first..first + count as u16 {
            params.extend(block_element(block));
        }

        let body = self.command(link, CMD_READ_WITHOUT_ENCRYPTION, &params)?;
        Self::check_status(&body)?;

        body.get(3..3 + count * BLOCK_SIZE)
            .map(<[u8]>::to_vec)
            .ok_or(TransportError::Framing("short Read Without Encryption response").into())
    }

    fn write_blocks(&mut self, link: &mut Link, first: u16, data: &[u8]) -> Result<()> {
        let service = self.write_service;
        self.request_service(link, service)?;

        let count = data.len() / BLOCK_SIZE;
        let mut params = vec![0x01];
        params.extend_from_slice(&service.to_le_bytes());
        params.push(count as u8);
        for block in first..first + count as u16 {
            params.extend(block_element(block));
        }
        params.extend_from_slice(data);

        let body = self.command(link, CMD_WRITE_WITHOUT_ENCRYPTION, &params)?;
        Self::check_status(&body)
    }

    /// The attribute block, when the NDEF service holds a valid one.
    pub fn attribute(&mut self, link: &mut Link) -> Result<Option<Attribute>> {
        if self.attribute.is_none() {
            let service = self.read_service;
            self.read_service = SERVICE_NDEF_READ;
            let block = self.read_blocks(link, 0, 1);
            self.read_service = service;

            self.attribute = match block {
                Ok(block) => Attribute::parse(&block),
                Err(Error::Status(_)) => None,
                Err(e) => return Err(e),
            };
        }

        Ok(self.attribute)
    }

    fn on_ndef_service(&self) -> bool {
        (self.read_service, self.write_service) == (SERVICE_NDEF_READ, SERVICE_NDEF_WRITE)
    }

    /// Bounds `range` by the NDEF area. Other services are bounded by the card.
    fn check_range(&mut self, link: &mut Link, range: Range) -> Result<()> {
        match self.on_ndef_service() {
            true => range.check(self.user_blocks(link)? * BLOCK_SIZE),
            _ => Ok(()),
        }
    }

    fn user_blocks(&mut self, link: &mut Link) -> Result<usize> {
        Ok(match self.attribute(link)? {
            Some(attribute) if attribute.nmaxb > 0 => attribute.nmaxb as usize + 1,
            _ => FALLBACK_BLOCKS,
        })
    }

    fn limits(&self) -> (usize, usize) {
        match self.attribute {
            Some(a) => (a.nbr.max(1) as usize, a.nbw.max(1) as usize),
            None => (DEFAULT_NBR as usize, DEFAULT_NBW as usize),
        }
    }

    pub fn get_info(&mut self, link: &mut Link) -> Result<TagInfo> {
        let blocks = self.user_blocks(link)?;

        Ok(TagInfo {
            family: TagFamily::Type3FeliCa,
            uid: self.idm.to_vec(),
            product: match (self.system_code, self.pmm) {
                (Some(code), _) => format!("FeliCa (system {:04X})", code),
                (None, Some(pmm)) => format!("FeliCa (IC {:02X})", pmm[1]),
                _ => "FeliCa".to_owned(),
            },
            memory_size: blocks * BLOCK_SIZE,
            block_size: BLOCK_SIZE,
            capabilities: Capabilities {
                read: true,
                write: true,
                format: true,
                ..Default::default()
            },
            locked_blocks: match self.attribute {
                Some(a) if a.rw_flag != ACCESS_READ_WRITE => (0..blocks).collect(),
                _ => Vec::new(),
            },
        })
    }

    pub fn read(&mut self, link: &mut Link, range: Range) -> Result<Vec<u8>> {
        self.check_range(link, range)?;
        self.fetch(link, range).map_err(|e| out_of_range(e, range))
    }

    pub fn write(&mut self, link: &mut Link, range: Range, data: &[u8]) -> Result<()> {
        self.check_range(link, range)?;
        self.store(link, range, data).map_err(|e| out_of_range(e, range))?;

        if range.offset < BLOCK_SIZE && self.on_ndef_service() {
            self.attribute = None;
        }

        Ok(())
    }

    fn fetch(&mut self, link: &mut Link, range: Range) -> Result<Vec<u8>> {
        let (nbr, _) = self.limits();

        let blocks = range.block_indices(BLOCK_SIZE);
        let mut data = Vec::with_capacity(blocks.len() * BLOCK_SIZE);
        let mut block = blocks.start;
        while block < blocks.end {
            let count = nbr.min(blocks.end - block);
            data.extend(self.read_blocks(link, block as u16, count)?);
            block += count;
        }

        let start = range.offset - blocks.start * BLOCK_SIZE;
        data.get(start..start + range.len)
            .map(<[u8]>::to_vec)
            .ok_or(TransportError::Framing("short Read Without Encryption response").into())
    }

    fn store(&mut self, link: &mut Link, range: Range, data: &[u8]) -> Result<()> {
        let (_, nbw) = self.limits();

        let wide = range.widen(BLOCK_SIZE);
        let image = match wide == range {
            true => data.to_vec(),
            _ => splice(wide, range, self.fetch(link, wide)?, data),
        };

        let first = wide.offset / BLOCK_SIZE;
        for (i, chunk) in image.chunks(nbw * BLOCK_SIZE).enumerate() {
            self.write_blocks(link, (first + i * nbw) as u16, chunk)?;
        }

        Ok(())
    }

    /// Writes a fresh attribute block describing an empty message.
    pub fn format(&mut self, link: &mut Link) -> Result<()> {
        let nmaxb = match self.attribute(link)? {
            Some(a) if a.nmaxb > 0 => a.nmaxb,
            _ => (FALLBACK_BLOCKS - 1) as u16,
        };

        self.select_ndef_service();
        self.write_blocks(link, 0, &Attribute::new(nmaxb).to_bytes())?;
        self.attribute = None;
        Ok(())
    }

    pub fn read_ndef(&mut self, link: &mut Link) -> Result<NdefMessage> {
        self.select_ndef_service();
        let attribute = self
            .attribute(link)?
            .ok_or(Error::MalformedNdef("invalid attribute information block"))?;

        if attribute.write_flag != 0x00 {
            return Err(Error::MalformedNdef("NDEF write left incomplete"));
        }

        let len = attribute.ln as usize;
        if len == 0 {
            return Ok(NdefMessage::default());
        }
        if len > attribute.nmaxb as usize * BLOCK_SIZE {
            return Err(Error::MalformedNdef("NDEF length exceeds the data area"));
        }

        let data = self.read(link, Range::new(BLOCK_SIZE, len))?;
        NdefMessage::decode(&data)
    }

    pub fn write_ndef(&mut self, link: &mut Link, message: &NdefMessage) -> Result<()> {
        self.select_ndef_service();
        let mut attribute = self
            .attribute(link)?
            .ok_or(Error::MalformedNdef("invalid attribute information block"))?;

        let encoded = message.encode()?;
        let available = attribute.nmaxb as usize * BLOCK_SIZE;
        if encoded.len() > available {
            return Err(Error::InsufficientMemory {
                requested: encoded.len(),
                available,
            });
        }

        attribute.write_flag = WRITE_IN_PROGRESS;
        self.write_blocks(link, 0, &attribute.to_bytes())?;

        let mut padded = encoded.clone();
        padded.resize(encoded.len().div_ceil(BLOCK_SIZE) * BLOCK_SIZE, 0x00);
        let nbw = attribute.nbw.max(1) as usize;
        for (i, chunk) in padded.chunks(nbw * BLOCK_SIZE).enumerate() {
            self.write_blocks(link, (1 + i * nbw) as u16, chunk)?;
        }

        attribute.write_flag = 0x00;
        attribute.ln = encoded.len() as u32;
        self.write_blocks(link, 0, &attribute.to_bytes())?;
        self.attribute = Some(attribute);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attribute_block() {
        let mut attribute = Attribute::new(13);
        attribute.ln = 0x0123;

        let block = attribute.to_bytes();
        assert_eq!(
            [0x10, 0x04, 0x01, 0x00, 0x0D, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x01, 0x23],
            block[..14]
        );
        assert_eq!([0x00, 0x47], block[14..]);
        assert_eq!(Some(attribute), Attribute::parse(&block));

        let mut corrupted = block;
        corrupted[12] ^= 0xFF;
        assert_eq!(None, Attribute::parse(&corrupted));
    }

    #[test]
    fn test_block_element() {
        assert_eq!(vec![0x80, 0x05], block_element(5));
        assert_eq!(vec![0x00, 0x2C, 0x01], block_element(300));
    }

    #[test]
    fn test_frame_carries_length_and_idm() {
        let felica = FeliCa::new(&Signature::FeliCa {
            idm: [1, 2, 3, 4, 5, 6, 7, 8],
            pmm: [0; 8],
            system_code: Some(0x12FC),
        });

        let frame = felica.frame(CMD_REQUEST_SERVICE, &[0x01, 0x0B, 0x00]);
        assert_eq!(13, frame[0] as usize);
        assert_eq!(frame.len(), frame[0] as usize);
        assert_eq!(&[1, 2, 3, 4, 5, 6, 7, 8], &frame[2..10]);
    }
}
