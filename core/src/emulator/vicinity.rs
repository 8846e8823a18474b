use crate::backend::Signature;
use crate::emulator::VirtualTag;
use crate::error::{Error, Result};
use crate::ndef::tlv::EMPTY_NDEF;
use crate::tag::vicinity::{
    CMD_GET_MULTIPLE_BLOCK_SECURITY_STATUS, CMD_GET_SYSTEM_INFO, CMD_LOCK_BLOCK,
    CMD_READ_SINGLE_BLOCK, CMD_WRITE_SINGLE_BLOCK,
};

const FLAG_ADDRESSED: u8 = 0x20;
const INFO_ALL: u8 = 0x0F;

const ERROR_NOT_SUPPORTED: u8 = 0x01;
const ERROR_FORMAT: u8 = 0x02;
const ERROR_BLOCK_UNAVAILABLE: u8 = 0x10;
const ERROR_ALREADY_LOCKED: u8 = 0x11;
const ERROR_BLOCK_LOCKED: u8 = 0x12;

/// An ISO 15693 tag with one-byte block addresses.
pub struct VirtualVicinity {
    uid: [u8; 8],
    block_size: usize,
    memory: Vec<u8>,
    locked: Vec<bool>,
    report_memory: bool,
}

impl VirtualVicinity {
    /// A tag of `blocks` blocks holding a capability container and an empty NDEF message.
    /// `uid` is in wire order, LSB first.
    pub fn new(uid: [u8; 8], blocks: usize, block_size: usize) -> Self {
        let mut memory = vec![0u8; blocks * block_size];
        let size = (blocks * block_size / 8).min(0xFF) as u8;
        memory[..4].copy_from_slice(&[0xE1, 0x40, size, 0x01]);
        memory[4..4 + EMPTY_NDEF.len()].copy_from_slice(&EMPTY_NDEF);

        Self {
            uid,
            block_size,
            memory,
            locked: vec![false; blocks],
            report_memory: true,
        }
    }

    /// An ICODE SLI, which leaves its memory size out of `Get System Info`.
    pub fn icode_sli(uid: [u8; 8]) -> Self {
        Self {
            report_memory: false,
            ..Self::new(uid, 28, 4)
        }
    }

    fn blocks(&self) -> usize {
        self.locked.len()
    }

    fn block(&self, block: usize) -> &[u8] {
        &self.memory[block * self.block_size..(block + 1) * self.block_size]
    }

    fn system_info(&self) -> Vec<u8> {
        let mut body = vec![0x00];
        match self.report_memory {
            true => {
                body.push(INFO_ALL);
                body.extend_from_slice(&self.uid);
                body.extend_from_slice(&[0x00, 0x00]);
                body.push((self.blocks() - 1) as u8);
                body.push((self.block_size - 1) as u8);
                body.push(0x01);
            }
            _ => {
                body.push(0x03);
                body.extend_from_slice(&self.uid);
                body.extend_from_slice(&[0x00, 0x00]);
            }
        }
        body
    }

    fn answer(&mut self, cmd: u8, params: &[u8]) -> std::result::Result<Vec<u8>, u8> {
        let block = params.first().map(|b| *b as usize);
        let blocks = self.blocks();
        let check = move |block: Option<usize>| match block {
            Some(b) if b < blocks => Ok(b),
            Some(_) => Err(ERROR_BLOCK_UNAVAILABLE),
            None => Err(ERROR_FORMAT),
        };

        match cmd {
            CMD_GET_SYSTEM_INFO => Ok(self.system_info()),
            CMD_READ_SINGLE_BLOCK => {
                let block = check(block)?;
                Ok([&[0x00u8][..], self.block(block)].concat())
            }
            CMD_WRITE_SINGLE_BLOCK => {
                let block = check(block)?;
                let data = params.get(1..1 + self.block_size).ok_or(ERROR_FORMAT)?;
                if self.locked[block] {
                    return Err(ERROR_BLOCK_LOCKED);
                }

                let start = block * self.block_size;
                self.memory[start..start + self.block_size].copy_from_slice(data);
                Ok(vec![0x00])
            }
            CMD_LOCK_BLOCK => {
                let block = check(block)?;
                if self.locked[block] {
                    return Err(ERROR_ALREADY_LOCKED);
                }

                self.locked[block] = true;
                Ok(vec![0x00])
            }
            CMD_GET_MULTIPLE_BLOCK_SECURITY_STATUS => {
                let first = check(block)?;
                let count = *params.get(1).ok_or(ERROR_FORMAT)? as usize + 1;
                let status = self.locked.get(first..first + count).ok_or(ERROR_BLOCK_UNAVAILABLE)?;

                let mut body = vec![0x00];
                body.extend(status.iter().map(|locked| *locked as u8));
                Ok(body)
            }
            _ => Err(ERROR_NOT_SUPPORTED),
        }
    }
}

impl VirtualTag for VirtualVicinity {
    fn signature(&self) -> Signature {
        Signature::Iso15693 {
            uid: self.uid,
            dsfid: 0x00,
        }
    }

    fn handle(&mut self, frame: &[u8]) -> Result<Vec<u8>> {
        let (cmd, params) = match frame {
            [flags, cmd, rest @ ..] if flags & FLAG_ADDRESSED != 0 => match rest.split_at_checked(8) {
                Some((uid, params)) if uid == self.uid => (*cmd, params),
                // Addressed to another tag.
                _ => return Err(Error::Timeout),
            },
            [_, cmd, params @ ..] => (*cmd, params),
            _ => return Err(Error::Timeout),
        };

        Ok(match self.answer(cmd, params) {
            Ok(body) => body,
            Err(code) => vec![0x01, code],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tag::vicinity::SystemInfo;

    const UID: [u8; 8] = [0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x04, 0xE0];

    fn request(cmd: u8, params: &[u8]) -> Vec<u8> {
        let mut frame = vec![0x22, cmd];
        frame.extend_from_slice(&UID);
        frame.extend_from_slice(params);
        frame
    }

    #[test]
    fn test_system_info_parses() {
        let mut tag = VirtualVicinity::new(UID, 64, 4);
        let rx = tag.handle(&request(CMD_GET_SYSTEM_INFO, &[])).unwrap();

        let system = SystemInfo::parse(&rx[1..]).unwrap();
        assert_eq!((64, 4), (system.blocks, system.block_size));

        let mut sli = VirtualVicinity::icode_sli(UID);
        let rx = sli.handle(&request(CMD_GET_SYSTEM_INFO, &[])).unwrap();
        assert_eq!(112, SystemInfo::parse(&rx[1..]).unwrap().memory_size());
    }

    #[test]
    fn test_locked_block_refuses_writes() {
        let mut tag = VirtualVicinity::new(UID, 8, 4);

        assert_eq!(vec![0x00], tag.handle(&request(CMD_LOCK_BLOCK, &[2])).unwrap());
        assert_eq!(
            vec![0x01, ERROR_ALREADY_LOCKED],
            tag.handle(&request(CMD_LOCK_BLOCK, &[2])).unwrap()
        );
        assert_eq!(
            vec![0x01, ERROR_BLOCK_LOCKED],
            tag.handle(&request(CMD_WRITE_SINGLE_BLOCK, &[2, 1, 2, 3, 4])).unwrap()
        );
        assert_eq!(
            vec![0x00, 0, 0, 1, 0],
            tag.handle(&request(CMD_GET_MULTIPLE_BLOCK_SECURITY_STATUS, &[0, 3])).unwrap()
        );
    }
}
