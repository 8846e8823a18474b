//! Type 1 tags (Innovision/Broadcom Topaz).
//!
//! Memory is organized in 8-byte blocks. Blocks `01`..`0C` form the static user area;
//! Topaz-512 adds the dynamic area from block `10`, reachable only through the 8-byte
//! `READ8`/`WRITE-E8` commands. Blocks `0D`..`0F` hold reserved and lock bytes and are
//! skipped by the logical user area.

use crate::error::{Error, Result, TransportError};
use crate::tag::{splice, Capabilities, Link, Range, TagFamily, TagInfo};
use crate::trace::debug;

pub const CMD_RALL: u8 = 0x00;
pub const CMD_READ: u8 = 0x01;
pub const CMD_READ8: u8 = 0x02;
pub const CMD_WRITE_E: u8 = 0x53;
pub const CMD_WRITE_E8: u8 = 0x54;

pub const HR0_TOPAZ_96: u8 = 0x11;
pub const HR0_TOPAZ_512: u8 = 0x12;

/// Length of the capability container at the start of the user area.
pub const CC_LEN: usize = 4;

pub const BLOCK_SIZE: usize = 8;
const STATIC_BLOCKS: usize = 12;
const DYNAMIC_FIRST: usize = 0x10;
const DYNAMIC_BLOCKS: usize = 0x30;
const LOCK_BLOCK: usize = 0x0E;

/// Physical block holding the `index`-th block of the user area.
pub fn physical_block(index: usize) -> usize {
    match index < STATIC_BLOCKS {
        true => 1 + index,
        _ => DYNAMIC_FIRST + index - STATIC_BLOCKS,
    }
}

pub struct Topaz {
    uid: [u8; 4],
    hr0: Option<u8>,
}

impl Topaz {
    pub fn new(uid: &[u8]) -> Self {
        let mut uid4 = [0u8; 4];
        uid.iter().take(4).enumerate().for_each(|(i, b)| uid4[i] = *b);

        Self { uid: uid4, hr0: None }
    }

    fn frame(&self, cmd: u8, addr: u8, data: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(6 + data.len());
        frame.push(cmd);
        frame.push(addr);
        frame.extend_from_slice(data);
        frame.extend_from_slice(&self.uid);
        frame
    }

    /// Reads the header ROM and the static memory (blocks `00`..`0E`).
    fn read_all(&mut self, link: &mut Link) -> Result<Vec<u8>> {
        let rx = link.transceive(&self.frame(CMD_RALL, 0x00, &[0x00]))?;
        if rx.len() < 2 + 15 * BLOCK_SIZE {
            return Err(TransportError::Framing("short RALL response").into());
        }

        self.hr0 = Some(rx[0]);
        Ok(rx[2..].to_vec())
    }

    fn hr0(&mut self, link: &mut Link) -> Result<u8> {
        if self.hr0.is_none() {
            self.read_all(link)?;
        }

        Ok(self.hr0.unwrap_or(HR0_TOPAZ_96))
    }

    fn user_blocks(&mut self, link: &mut Link) -> Result<usize> {
        Ok(match self.hr0(link)? {
            HR0_TOPAZ_512 => STATIC_BLOCKS + DYNAMIC_BLOCKS,
            _ => STATIC_BLOCKS,
        })
    }

    fn read8(&mut self, link: &mut Link, block: usize) -> Result<Vec<u8>> {
        let rx = link.transceive(&self.frame(CMD_READ8, block as u8, &[0x00; BLOCK_SIZE]))?;
        match rx.len() {
            n if n >= BLOCK_SIZE => Ok(rx[n - BLOCK_SIZE..].to_vec()),
            _ => Err(TransportError::Framing("short READ8 response").into()),
        }
    }

    pub fn get_info(&mut self, link: &mut Link) -> Result<TagInfo> {
        let memory = self.read_all(link)?;
        let blocks = self.user_blocks(link)?;

        let lock = &memory[LOCK_BLOCK * BLOCK_SIZE..LOCK_BLOCK * BLOCK_SIZE + 2];
        let bits = u16::from_le_bytes([lock[0], lock[1]]);
        let locked_blocks = (0..=LOCK_BLOCK)
            .filter(|b| bits & (1u16 << *b) != 0)
            .collect();

        Ok(TagInfo {
            family: TagFamily::Topaz,
            uid: self.uid.to_vec(),
            product: match blocks {
                STATIC_BLOCKS => "Topaz-96".to_owned(),
                _ => "Topaz-512".to_owned(),
            },
            memory_size: blocks * BLOCK_SIZE,
            block_size: BLOCK_SIZE,
            capabilities: Capabilities {
                read: true,
                write: true,
                ..Default::default()
            },
            locked_blocks,
        })
    }

    pub fn read(&mut self, link: &mut Link, range: Range) -> Result<Vec<u8>> {
        range.check(self.user_blocks(link)? * BLOCK_SIZE)?;

        let indices = range.block_indices(BLOCK_SIZE);
        let first = indices.start;
        let memory = match indices.start < STATIC_BLOCKS {
            true => Some(self.read_all(link)?),
            _ => None,
        };

        let mut data = Vec::with_capacity(indices.len() * BLOCK_SIZE);
        for index in indices {
            let block = physical_block(index);
            match &memory {
                Some(memory) if index < STATIC_BLOCKS => {
                    data.extend_from_slice(&memory[block * BLOCK_SIZE..(block + 1) * BLOCK_SIZE])
                }
                _ => data.extend(self.read8(link, block)?),
            }
        }

        let start = range.offset - first * BLOCK_SIZE;
        Ok(data[start..start + range.len].to_vec())
    }

    pub fn write(&mut self, link: &mut Link, range: Range, data: &[u8]) -> Result<()> {
        range.check(self.user_blocks(link)? * BLOCK_SIZE)?;

        // Static blocks are written byte by byte, with erase.
        let split = (STATIC_BLOCKS * BLOCK_SIZE).clamp(range.offset, range.end());
        for offset in range.offset..split {
            let block = physical_block(offset / BLOCK_SIZE);
            let addr = ((block << 3) | (offset % BLOCK_SIZE)) as u8;
            let value = data[offset - range.offset];

            let rx = link.transceive(&self.frame(CMD_WRITE_E, addr, &[value]))?;
            if rx.last() != Some(&value) {
                debug!("WRITE-E of {:02x} did not stick", addr);
                return Err(Error::BlockLocked(block));
            }
        }

        if split == range.end() {
            return Ok(());
        }

        // Dynamic blocks go eight bytes at a time.
        let rest = Range::new(split, range.end() - split);
        let wide = rest.widen(BLOCK_SIZE);
        let image = match wide == rest {
            true => data[split - range.offset..].to_vec(),
            _ => splice(wide, rest, self.read(link, wide)?, &data[split - range.offset..]),
        };

        for (i, chunk) in image.chunks(BLOCK_SIZE).enumerate() {
            let block = physical_block(wide.offset / BLOCK_SIZE + i);
            let rx = link.transceive(&self.frame(CMD_WRITE_E8, block as u8, chunk))?;
            if !rx.ends_with(chunk) {
                return Err(Error::BlockLocked(block));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_physical_block_skips_reserved_area() {
        assert_eq!(1, physical_block(0));
        assert_eq!(0x0C, physical_block(11));
        assert_eq!(0x10, physical_block(12));
        assert_eq!(0x3F, physical_block(12 + 0x2F));
    }

    #[test]
    fn test_write_e_address() {
        let topaz = Topaz::new(&[0x11, 0x22, 0x33, 0x44]);
        let frame = topaz.frame(CMD_WRITE_E, (2 << 3) | 5, &[0xAB]);

        assert_eq!(vec![0x53, 0x15, 0xAB, 0x11, 0x22, 0x33, 0x44], frame);
    }
}
