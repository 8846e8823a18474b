use crate::auth::mifare::{CMD_AUTH_KEY_A, CMD_AUTH_KEY_B, CMD_PWD_AUTH};
use crate::backend::Signature;
use crate::emulator::VirtualTag;
use crate::error::{Error, Result};
use crate::ndef::tlv::EMPTY_NDEF;
use crate::tag::ultralight::{
    Model, Ultralight, ACK, CC_PAGE, CMD_GET_VERSION, CMD_READ, CMD_WRITE, LOCK_PAGE, PAGE_SIZE,
    USER_FIRST_PAGE,
};

const NAK: u8 = 0x00;

/// Pages including the configuration area.
fn total_pages(model: Model) -> usize {
    match model {
        Model::Ultralight => 16,
        Model::UltralightEv1Mf0ul11 => 20,
        Model::UltralightEv1Mf0ul21 => 41,
        Model::Ntag213 => 45,
        Model::Ntag215 => 135,
        Model::Ntag216 => 231,
    }
}

fn version(model: Model) -> Option<[u8; 8]> {
    match model {
        Model::Ultralight => None,
        Model::UltralightEv1Mf0ul11 => Some([0x00, 0x04, 0x03, 0x01, 0x01, 0x00, 0x0B, 0x03]),
        Model::UltralightEv1Mf0ul21 => Some([0x00, 0x04, 0x03, 0x01, 0x01, 0x00, 0x0E, 0x03]),
        Model::Ntag213 => Some([0x00, 0x04, 0x04, 0x02, 0x01, 0x00, 0x0F, 0x03]),
        Model::Ntag215 => Some([0x00, 0x04, 0x04, 0x02, 0x01, 0x00, 0x11, 0x03]),
        Model::Ntag216 => Some([0x00, 0x04, 0x04, 0x02, 0x01, 0x00, 0x13, 0x03]),
    }
}

/// A MIFARE Ultralight or NTAG21x tag.
pub struct VirtualUltralight {
    uid: [u8; 7],
    model: Model,
    memory: Vec<u8>,
    password: [u8; 4],
    pack: [u8; 2],
}

impl VirtualUltralight {
    /// A freshly formatted tag holding an empty NDEF message.
    pub fn new(uid: [u8; 7], model: Model) -> Self {
        let mut memory = vec![0u8; total_pages(model) * PAGE_SIZE];

        memory[..3].copy_from_slice(&uid[..3]);
        memory[3] = 0x88 ^ uid[0] ^ uid[1] ^ uid[2];
        memory[4..8].copy_from_slice(&uid[3..]);
        memory[8] = uid[3] ^ uid[4] ^ uid[5] ^ uid[6];
        memory[9] = 0x48;

        let cc = CC_PAGE * PAGE_SIZE;
        memory[cc..cc + PAGE_SIZE].copy_from_slice(&model.capability_container());
        let user = USER_FIRST_PAGE * PAGE_SIZE;
        memory[user..user + EMPTY_NDEF.len()].copy_from_slice(&EMPTY_NDEF);

        Self {
            uid,
            model,
            memory,
            password: [0xFF; 4],
            pack: [0x00; 2],
        }
    }

    /// Sets the password answered by `PWD_AUTH`.
    pub fn with_password(mut self, password: [u8; 4], pack: [u8; 2]) -> Self {
        self.password = password;
        self.pack = pack;
        self
    }

    fn page_count(&self) -> usize {
        self.memory.len() / PAGE_SIZE
    }

    fn page_mut(&mut self, page: usize) -> &mut [u8] {
        &mut self.memory[page * PAGE_SIZE..(page + 1) * PAGE_SIZE]
    }

    fn is_locked(&self, page: usize) -> bool {
        match Ultralight::lock_position(self.model, page) {
            Some((pos, _)) => self.memory[pos.page * PAGE_SIZE + pos.byte] & (1 << pos.bit) != 0,
            None => false,
        }
    }

    fn read(&self, page: usize) -> Vec<u8> {
        let pages = self.page_count();
        (0..4)
            .flat_map(|i| {
                let start = ((page + i) % pages) * PAGE_SIZE;
                self.memory[start..start + PAGE_SIZE].to_vec()
            })
            .collect()
    }

    /// Applies a `WRITE`; returns whether the tag acknowledged it.
    fn write(&mut self, page: usize, data: &[u8]) -> bool {
        let dynamic = self.model.dynamic_lock_page();

        match page {
            p if p < LOCK_PAGE || p >= self.page_count() => false,
            LOCK_PAGE => {
                let bytes = self.page_mut(LOCK_PAGE);
                bytes[2] |= data[2];
                bytes[3] |= data[3];
                true
            }
            CC_PAGE if self.is_locked(CC_PAGE) => false,
            CC_PAGE => {
                self.page_mut(CC_PAGE)
                    .iter_mut()
                    .zip(data)
                    .for_each(|(b, d)| *b |= d);
                true
            }
            p if Some(p) == dynamic => {
                self.page_mut(p)
                    .iter_mut()
                    .zip(&data[..3])
                    .for_each(|(b, d)| *b |= d);
                true
            }
            p if self.is_locked(p) => false,
            p => {
                self.page_mut(p).copy_from_slice(data);
                true
            }
        }
    }
}

impl VirtualTag for VirtualUltralight {
    fn signature(&self) -> Signature {
        Signature::Iso14443A {
            atqa: 0x0044,
            sak: 0x00,
            uid: self.uid.to_vec(),
            ats: None,
        }
    }

    fn handle(&mut self, frame: &[u8]) -> Result<Vec<u8>> {
        match frame {
            [CMD_GET_VERSION] => match version(self.model) {
                Some(version) => Ok(version.to_vec()),
                None => Err(Error::Status(NAK as u16)),
            },
            [CMD_READ, page] if (*page as usize) < self.page_count() => Ok(self.read(*page as usize)),
            [CMD_WRITE, page, data @ ..] if data.len() == PAGE_SIZE => {
                match self.write(*page as usize, data) {
                    true => Ok(vec![ACK]),
                    _ => Ok(vec![NAK]),
                }
            }
            [CMD_PWD_AUTH, password @ ..] if self.model != Model::Ultralight => {
                match password == self.password {
                    true => Ok(self.pack.to_vec()),
                    _ => Ok(vec![NAK]),
                }
            }
            [CMD_AUTH_KEY_A | CMD_AUTH_KEY_B, ..] => Err(Error::AuthenticationFailed),
            _ => Ok(vec![NAK]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_bytes_only_accumulate() {
        let mut tag = VirtualUltralight::new([0x04, 1, 2, 3, 4, 5, 6], Model::Ultralight);

        assert_eq!(vec![ACK], tag.handle(&[CMD_WRITE, 5, 1, 2, 3, 4]).unwrap());
        assert_eq!(vec![ACK], tag.handle(&[CMD_WRITE, 2, 0, 0, 0x20, 0x00]).unwrap());
        assert_eq!(vec![ACK], tag.handle(&[CMD_WRITE, 2, 0, 0, 0x00, 0x00]).unwrap());

        assert_eq!(vec![NAK], tag.handle(&[CMD_WRITE, 5, 9, 9, 9, 9]).unwrap());
        assert_eq!(&[1, 2, 3, 4], &tag.handle(&[CMD_READ, 5]).unwrap()[..4]);
    }

    #[test]
    fn test_read_wraps_around() {
        let mut tag = VirtualUltralight::new([0x04, 1, 2, 3, 4, 5, 6], Model::Ultralight);
        let rx = tag.handle(&[CMD_READ, 15]).unwrap();

        assert_eq!(16, rx.len());
        assert_eq!(&[0x04, 1, 2], &rx[4..7]);
    }

    #[test]
    fn test_password() {
        let mut tag = VirtualUltralight::new([0x04, 1, 2, 3, 4, 5, 6], Model::Ntag213)
            .with_password([1, 2, 3, 4], [0x80, 0x80]);

        assert_eq!(vec![0x80, 0x80], tag.handle(&[CMD_PWD_AUTH, 1, 2, 3, 4]).unwrap());
        assert_eq!(vec![NAK], tag.handle(&[CMD_PWD_AUTH, 0, 0, 0, 0]).unwrap());
    }
}
