use crate::backend::Signature;
use crate::classify::ATQA_TOPAZ;
use crate::emulator::VirtualTag;
use crate::error::{Error, Result};
use crate::ndef::tlv::EMPTY_NDEF;
use crate::tag::topaz::{
    BLOCK_SIZE, CMD_RALL, CMD_READ, CMD_READ8, CMD_WRITE_E, CMD_WRITE_E8, HR0_TOPAZ_512,
    HR0_TOPAZ_96,
};

const STATIC_BLOCKS: usize = 0x0F;
const LOCK_BLOCK: usize = 0x0E;
const TOTAL_BLOCKS: usize = 0x40;

/// A Topaz-96 or Topaz-512 tag.
pub struct VirtualTopaz {
    uid: [u8; 4],
    hr0: u8,
    memory: Vec<u8>,
}

impl VirtualTopaz {
    /// A Topaz-96 holding an empty NDEF message.
    pub fn new(uid: [u8; 4]) -> Self {
        Self::with_hr0(uid, HR0_TOPAZ_96)
    }

    /// A Topaz-512 holding an empty NDEF message.
    pub fn topaz_512(uid: [u8; 4]) -> Self {
        Self::with_hr0(uid, HR0_TOPAZ_512)
    }

    fn with_hr0(uid: [u8; 4], hr0: u8) -> Self {
        let blocks = match hr0 {
            HR0_TOPAZ_512 => TOTAL_BLOCKS,
            _ => STATIC_BLOCKS + 1,
        };
        let mut memory = vec![0u8; blocks * BLOCK_SIZE];
        memory[..4].copy_from_slice(&uid);

        let size = match hr0 {
            HR0_TOPAZ_512 => 0x3F,
            _ => 0x0E,
        };
        memory[BLOCK_SIZE..BLOCK_SIZE + 4].copy_from_slice(&[0xE1, 0x10, size, 0x00]);
        memory[BLOCK_SIZE + 4..BLOCK_SIZE + 4 + EMPTY_NDEF.len()].copy_from_slice(&EMPTY_NDEF);

        Self { uid, hr0, memory }
    }

    /// Sets the lock bit of a static block.
    pub fn lock_block(mut self, block: usize) -> Self {
        let byte = LOCK_BLOCK * BLOCK_SIZE + block / 8;
        self.memory[byte] |= 1 << (block % 8);
        self
    }

    fn writable(&self, block: usize) -> bool {
        let lock = &self.memory[LOCK_BLOCK * BLOCK_SIZE..];
        let bits = u16::from_le_bytes([lock[0], lock[1]]);

        match block {
            0 | 0x0D..=0x0F => false,
            b if b < STATIC_BLOCKS => bits & (1 << b) == 0,
            b => b * BLOCK_SIZE < self.memory.len(),
        }
    }

    fn check_uid(&self, frame: &[u8]) -> Result<()> {
        match frame.ends_with(&self.uid) {
            true => Ok(()),
            _ => Err(Error::Timeout),
        }
    }
}

impl VirtualTag for VirtualTopaz {
    fn signature(&self) -> Signature {
        Signature::Iso14443A {
            atqa: ATQA_TOPAZ,
            sak: 0x00,
            uid: self.uid.to_vec(),
            ats: None,
        }
    }

    fn handle(&mut self, frame: &[u8]) -> Result<Vec<u8>> {
        self.check_uid(frame)?;

        match frame {
            [CMD_RALL, ..] => {
                let mut rx = vec![self.hr0, 0x00];
                rx.extend_from_slice(&self.memory[..STATIC_BLOCKS * BLOCK_SIZE]);
                Ok(rx)
            }
            [CMD_READ, addr, ..] => match self.memory.get(*addr as usize) {
                Some(value) => Ok(vec![*addr, *value]),
                None => Err(Error::Status(0x0000)),
            },
            [CMD_WRITE_E, addr, value, ..] => {
                let offset = *addr as usize;
                if offset >= self.memory.len() {
                    return Err(Error::Status(0x0000));
                }
                if self.writable(offset / BLOCK_SIZE) {
                    self.memory[offset] = *value;
                }
                Ok(vec![*addr, self.memory[offset]])
            }
            [CMD_READ8, block, ..] if self.hr0 == HR0_TOPAZ_512 => {
                let start = *block as usize * BLOCK_SIZE;
                let mut rx = vec![*block];
                match self.memory.get(start..start + BLOCK_SIZE) {
                    Some(data) => rx.extend_from_slice(data),
                    None => return Err(Error::Status(0x0000)),
                }
                Ok(rx)
            }
            [CMD_WRITE_E8, block, data @ ..] if self.hr0 == HR0_TOPAZ_512 => {
                let index = *block as usize;
                let start = index * BLOCK_SIZE;
                if start + BLOCK_SIZE > self.memory.len() {
                    return Err(Error::Status(0x0000));
                }
                if self.writable(index) && data.len() >= BLOCK_SIZE {
                    self.memory[start..start + BLOCK_SIZE].copy_from_slice(&data[..BLOCK_SIZE]);
                }

                let mut rx = vec![*block];
                rx.extend_from_slice(&self.memory[start..start + BLOCK_SIZE]);
                Ok(rx)
            }
            _ => Err(Error::Status(0x0000)),
        }
    }
}
