//! Type 2 tags (MIFARE Ultralight, Ultralight EV1, NTAG21x).
//!
//! Memory is a sequence of 4-byte pages. Pages 0-2 hold the UID and the static lock bytes,
//! page 3 the capability container, and the user area starts at page 4. Larger models
//! freeze their upper pages through dynamic lock bytes placed right after the user area.

use std::collections::BTreeMap;

use crate::auth::{mifare, Credentials};
use crate::error::{Error, Result, TransportError};
use crate::ndef::tlv;
use crate::tag::{
    splice, unsupported, Capabilities, Link, LockBits, LockReport, OperationKind, Range,
    TagFamily, TagInfo,
};
use crate::trace::{debug, info};

pub const CMD_GET_VERSION: u8 = 0x60;
pub const CMD_READ: u8 = 0x30;
pub const CMD_WRITE: u8 = 0xA2;
pub const ACK: u8 = 0x0A;

pub const PAGE_SIZE: usize = 4;
pub const LOCK_PAGE: usize = 2;
pub const CC_PAGE: usize = 3;
pub const USER_FIRST_PAGE: usize = 4;

const CC_MAGIC: u8 = 0xE1;
const CC_VERSION: u8 = 0x10;

/// Type 2 product variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Model {
    Ultralight,
    UltralightEv1Mf0ul11,
    UltralightEv1Mf0ul21,
    Ntag213,
    Ntag215,
    Ntag216,
}

impl Model {
    /// Identifies the model from a `GET_VERSION` answer.
    pub fn from_version(version: &[u8]) -> Option<Self> {
        match version {
            [_, 0x04, 0x04, _, _, _, 0x0F, _] => Some(Model::Ntag213),
            [_, 0x04, 0x04, _, _, _, 0x11, _] => Some(Model::Ntag215),
            [_, 0x04, 0x04, _, _, _, 0x13, _] => Some(Model::Ntag216),
            [_, 0x04, 0x03, _, _, _, 0x0B, _] => Some(Model::UltralightEv1Mf0ul11),
            [_, 0x04, 0x03, _, _, _, 0x0E, _] => Some(Model::UltralightEv1Mf0ul21),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Model::Ultralight => "MIFARE Ultralight",
            Model::UltralightEv1Mf0ul11 => "MIFARE Ultralight EV1 (MF0UL11)",
            Model::UltralightEv1Mf0ul21 => "MIFARE Ultralight EV1 (MF0UL21)",
            Model::Ntag213 => "NTAG213",
            Model::Ntag215 => "NTAG215",
            Model::Ntag216 => "NTAG216",
        }
    }

    pub fn user_pages(self) -> usize {
        match self {
            Model::Ultralight | Model::UltralightEv1Mf0ul11 => 12,
            Model::UltralightEv1Mf0ul21 => 32,
            Model::Ntag213 => 36,
            Model::Ntag215 => 124,
            Model::Ntag216 => 218,
        }
    }

    pub fn user_bytes(self) -> usize {
        self.user_pages() * PAGE_SIZE
    }

    /// Page holding the dynamic lock bytes.
    pub fn dynamic_lock_page(self) -> Option<usize> {
        match self {
            Model::Ultralight | Model::UltralightEv1Mf0ul11 => None,
            Model::UltralightEv1Mf0ul21 => Some(36),
            Model::Ntag213 => Some(40),
            Model::Ntag215 => Some(130),
            Model::Ntag216 => Some(226),
        }
    }

    /// Pages frozen by one dynamic lock bit.
    pub fn pages_per_lock_bit(self) -> usize {
        match self {
            Model::Ntag215 | Model::Ntag216 => 16,
            Model::UltralightEv1Mf0ul21 => 4,
            _ => 2,
        }
    }

    /// Capability container written by `format`.
    pub fn capability_container(self) -> [u8; 4] {
        [CC_MAGIC, CC_VERSION, (self.user_bytes() / 8) as u8, 0x00]
    }
}

/// Where the lock bit of a page lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LockPosition {
    pub page: usize,
    pub byte: usize,
    pub bit: u8,
}

/// Lock bytes read from the tag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct LockState {
    page2: [u8; 4],
    dynamic: [u8; 4],
}

impl LockState {
    fn byte(&self, page: usize, byte: usize) -> u8 {
        match page {
            LOCK_PAGE => self.page2[byte],
            _ => self.dynamic[byte],
        }
    }
}

pub struct Ultralight {
    uid: Vec<u8>,
    model: Option<Model>,
    locks: Option<LockState>,
    authenticated: bool,
}

impl Ultralight {
    pub fn new(uid: &[u8]) -> Self {
        Self {
            uid: uid.to_vec(),
            model: None,
            locks: None,
            authenticated: false,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub(crate) fn invalidate(&mut self) {
        self.authenticated = false;
    }

    /// Identifies the model, falling back to the plain Ultralight when `GET_VERSION` is refused.
    pub fn model(&mut self, link: &mut Link) -> Result<Model> {
        if let Some(model) = self.model {
            return Ok(model);
        }

        let model = match link.transceive(&[CMD_GET_VERSION]) {
            Ok(version) => Model::from_version(&version).unwrap_or(Model::Ultralight),
            Err(Error::Status(_)) | Err(Error::Transport(TransportError::Reader(_))) => {
                Model::Ultralight
            }
            Err(e) => return Err(e),
        };
        debug!("Type 2 model: {}", model.name());

        self.model = Some(model);
        Ok(model)
    }

    fn read_pages(&mut self, link: &mut Link, first: usize, count: usize) -> Result<Vec<u8>> {
        let mut data = Vec::with_capacity(count * PAGE_SIZE + 12);
        let mut page = first;
        while page < first + count {
            let rx = link.transceive(&[CMD_READ, page as u8])?;
            if rx.len() < 16 {
                return Err(TransportError::Framing("short READ response").into());
            }

            data.extend_from_slice(&rx[..16]);
            page += 4;
        }

        data.truncate(count * PAGE_SIZE);
        Ok(data)
    }

    fn write_page(&mut self, link: &mut Link, page: usize, data: &[u8]) -> Result<()> {
        let mut frame = vec![CMD_WRITE, page as u8];
        frame.extend_from_slice(data);

        match link.transceive(&frame)?.as_slice() {
            [] => Ok(()),
            [ack] if ack & 0x0F == ACK => Ok(()),
            [nak, ..] => Err(Error::Status(*nak as u16)),
        }
    }

    fn lock_state(&mut self, link: &mut Link) -> Result<LockState> {
        if let Some(state) = self.locks {
            return Ok(state);
        }

        let mut state = LockState::default();
        state
            .page2
            .copy_from_slice(&self.read_pages(link, LOCK_PAGE, 1)?);
        if let Some(page) = self.model(link)?.dynamic_lock_page() {
            state.dynamic.copy_from_slice(&self.read_pages(link, page, 1)?);
        }

        self.locks = Some(state);
        Ok(state)
    }

    /// Lock bit freezing `page`, and every page the same bit freezes.
    pub(crate) fn lock_position(model: Model, page: usize) -> Option<(LockPosition, Vec<usize>)> {
        match page {
            CC_PAGE => Some((
                LockPosition {
                    page: LOCK_PAGE,
                    byte: 2,
                    bit: 3,
                },
                vec![page],
            )),
            4..=7 => Some((
                LockPosition {
                    page: LOCK_PAGE,
                    byte: 2,
                    bit: page as u8,
                },
                vec![page],
            )),
            8..=15 => Some((
                LockPosition {
                    page: LOCK_PAGE,
                    byte: 3,
                    bit: (page - 8) as u8,
                },
                vec![page],
            )),
            _ => {
                let lock_page = model.dynamic_lock_page()?;
                let per_bit = model.pages_per_lock_bit();
                let last = USER_FIRST_PAGE + model.user_pages();
                if page >= last {
                    return None;
                }

                let group = (page - 16) / per_bit;
                let first = 16 + group * per_bit;
                Some((
                    LockPosition {
                        page: lock_page,
                        byte: group / 8,
                        bit: (group % 8) as u8,
                    },
                    (first..(first + per_bit).min(last)).collect(),
                ))
            }
        }
    }

    fn is_locked(model: Model, state: &LockState, page: usize) -> bool {
        match Self::lock_position(model, page) {
            Some((pos, _)) => state.byte(pos.page, pos.byte) & (1 << pos.bit) != 0,
            None => false,
        }
    }

    fn check_writable(&mut self, link: &mut Link, pages: std::ops::Range<usize>) -> Result<()> {
        let model = self.model(link)?;
        let state = self.lock_state(link)?;

        match pages.into_iter().find(|p| Self::is_locked(model, &state, *p)) {
            Some(page) => Err(Error::BlockLocked(page)),
            None => Ok(()),
        }
    }

    pub fn get_info(&mut self, link: &mut Link) -> Result<TagInfo> {
        let model = self.model(link)?;
        let state = self.lock_state(link)?;

        let locked_blocks = (CC_PAGE..USER_FIRST_PAGE + model.user_pages())
            .filter(|p| Self::is_locked(model, &state, *p))
            .collect();

        Ok(TagInfo {
            family: TagFamily::Type2Ultralight,
            uid: self.uid.clone(),
            product: model.name().to_owned(),
            memory_size: model.user_bytes(),
            block_size: PAGE_SIZE,
            capabilities: Capabilities {
                read: true,
                write: true,
                lock: true,
                format: true,
                authenticate: true,
            },
            locked_blocks,
        })
    }

    pub fn read(&mut self, link: &mut Link, range: Range) -> Result<Vec<u8>> {
        range.check(self.model(link)?.user_bytes())?;

        let pages = range.block_indices(PAGE_SIZE);
        let data = self.read_pages(link, USER_FIRST_PAGE + pages.start, pages.len())?;

        let start = range.offset - pages.start * PAGE_SIZE;
        Ok(data[start..start + range.len].to_vec())
    }

    pub fn write(&mut self, link: &mut Link, range: Range, data: &[u8]) -> Result<()> {
        range.check(self.model(link)?.user_bytes())?;

        let pages = range.block_indices(PAGE_SIZE);
        self.check_writable(
            link,
            USER_FIRST_PAGE + pages.start..USER_FIRST_PAGE + pages.end,
        )?;

        let wide = range.widen(PAGE_SIZE);
        let image = match wide == range {
            true => data.to_vec(),
            _ => splice(wide, range, self.read(link, wide)?, data),
        };

        for (i, chunk) in image.chunks(PAGE_SIZE).enumerate() {
            self.write_page(link, USER_FIRST_PAGE + pages.start + i, chunk)?;
        }

        Ok(())
    }

    /// Computes the bits `lock(range)` would set, without writing them.
    pub fn preview_lock(&mut self, link: &mut Link, range: Range) -> Result<LockReport> {
        let model = self.model(link)?;
        range.check(model.user_bytes())?;
        let state = self.lock_state(link)?;

        let mut masks: BTreeMap<(usize, usize), u8> = BTreeMap::new();
        let mut blocks = Vec::new();
        for index in range.block_indices(PAGE_SIZE) {
            let page = USER_FIRST_PAGE + index;
            let (pos, frozen) = Self::lock_position(model, page)
                .ok_or(Error::UnsupportedOperation {
                    family: TagFamily::Type2Ultralight,
                    operation: OperationKind::Lock,
                })?;

            let bit = 1u8 << pos.bit;
            if state.byte(pos.page, pos.byte) & bit == 0 {
                *masks.entry((pos.page, pos.byte)).or_default() |= bit;
            }
            blocks.extend(frozen);
        }

        blocks.sort_unstable();
        blocks.dedup();

        Ok(LockReport {
            blocks,
            bits: masks
                .into_iter()
                .map(|((block, byte), mask)| LockBits { block, byte, mask })
                .collect(),
        })
    }

    /// Sets the lock bits covering `range`. Bits already set stay set; none is ever cleared.
    pub fn lock(&mut self, link: &mut Link, range: Range) -> Result<LockReport> {
        let report = self.preview_lock(link, range)?;
        let mut state = self.lock_state(link)?;

        for bits in &report.bits {
            match bits.block {
                LOCK_PAGE => state.page2[bits.byte] |= bits.mask,
                _ => state.dynamic[bits.byte] |= bits.mask,
            }
        }

        if report.bits.iter().any(|b| b.block == LOCK_PAGE) {
            self.write_page(link, LOCK_PAGE, &state.page2)?;
        }
        if let Some(bits) = report.bits.iter().find(|b| b.block != LOCK_PAGE) {
            let mut dynamic = state.dynamic;
            dynamic[3] = 0x00;
            self.write_page(link, bits.block, &dynamic)?;
        }

        self.locks = Some(state);
        info!("Locked pages {:?}", report.blocks);
        Ok(report)
    }

    /// Rewrites the capability container and leaves an empty NDEF message.
    pub fn format(&mut self, link: &mut Link) -> Result<()> {
        let model = self.model(link)?;
        self.check_writable(link, CC_PAGE..USER_FIRST_PAGE + model.user_pages())?;

        self.write_page(link, CC_PAGE, &model.capability_container())?;

        let mut first = [0u8; PAGE_SIZE];
        first[..tlv::EMPTY_NDEF.len()].copy_from_slice(&tlv::EMPTY_NDEF);
        self.write_page(link, USER_FIRST_PAGE, &first)?;

        for page in USER_FIRST_PAGE + 1..USER_FIRST_PAGE + model.user_pages() {
            self.write_page(link, page, &[0u8; PAGE_SIZE])?;
        }

        Ok(())
    }

    pub fn authenticate(&mut self, link: &mut Link, credentials: &Credentials) -> Result<()> {
        self.authenticated = false;

        match credentials {
            Credentials::MifareKey {
                key_type,
                block,
                key,
            } => {
                let frame = mifare::key_frame(*key_type, *block, key, &self.uid)?;
                link.transceive(&frame)?;
            }
            Credentials::NtagPassword { password, pack } => {
                let rx = link.transceive(&mifare::password_frame(password))?;
                mifare::check_pack(&rx, pack.as_ref())?;
            }
            Credentials::Desfire { .. } => {
                return unsupported(TagFamily::Type2Ultralight, OperationKind::Authenticate)
            }
        }

        self.authenticated = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_from_version() {
        let ntag215 = [0x00, 0x04, 0x04, 0x02, 0x01, 0x00, 0x11, 0x03];
        assert_eq!(Some(Model::Ntag215), Model::from_version(&ntag215));
        assert_eq!(None, Model::from_version(&[0x00]));

        assert_eq!([0xE1, 0x10, 0x12, 0x00], Model::Ntag213.capability_container());
        assert_eq!(872, Model::Ntag216.user_bytes());
    }

    #[test]
    fn test_static_lock_positions() {
        let (pos, pages) = Ultralight::lock_position(Model::Ultralight, 9).unwrap();
        assert_eq!(
            LockPosition {
                page: 2,
                byte: 3,
                bit: 1
            },
            pos
        );
        assert_eq!(vec![9], pages);

        assert!(Ultralight::lock_position(Model::Ultralight, 16).is_none());
    }

    #[test]
    fn test_dynamic_lock_groups() {
        let (pos, pages) = Ultralight::lock_position(Model::Ntag213, 17).unwrap();
        assert_eq!(40, pos.page);
        assert_eq!((0, 0), (pos.byte, pos.bit));
        assert_eq!(vec![16, 17], pages);

        let (pos, pages) = Ultralight::lock_position(Model::Ntag216, 220).unwrap();
        assert_eq!(226, pos.page);
        assert_eq!((1, 4), (pos.byte, pos.bit));
        assert_eq!((208..222).collect::<Vec<_>>(), pages);
    }
}
