//! Copying the user area of one tag onto another tag of the same family.

use crate::error::{Error, Result};
use crate::session::Session;
use crate::tag::{OperationKind, Range, TagFamily, TagInfo};
use crate::trace::{debug, info};

/// Bytes moved per command on tags without a block structure.
const BYTE_CHUNK: usize = 48;

/// The user area of a tag.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct TagDump {
    pub family: TagFamily,
    pub uid: Vec<u8>,
    pub product: String,
    pub block_size: usize,
    pub data: Vec<u8>,
}

/// Size of the area raw reads and writes address.
fn user_area(session: &mut Session, info: &TagInfo) -> Result<usize> {
    match info.family {
        TagFamily::Type4DESFire => session.desfire(OperationKind::Read, |d, l| d.data_size(l)),
        _ => Ok(info.memory_size),
    }
}

fn step(block_size: usize) -> usize {
    match block_size {
        0 | 1 => BYTE_CHUNK,
        n => n,
    }
}

/// Reads the whole user area of the tag in the field.
pub fn dump(session: &mut Session) -> Result<TagDump> {
    let info = session.get_info()?;
    let size = user_area(session, &info)?;
    let step = step(info.block_size);

    let mut data = Vec::with_capacity(size);
    while data.len() < size {
        let len = step.min(size - data.len());
        data.extend(session.read(Range::new(data.len(), len))?);
    }

    info!("Dumped {} bytes of {} {}", data.len(), info.product, hex::encode(&info.uid));
    Ok(TagDump {
        family: info.family,
        uid: info.uid,
        product: info.product,
        block_size: info.block_size,
        data,
    })
}

/// Writes `dump` onto the tag in the field and returns the number of bytes copied.
///
/// The target must belong to the family of the dump and offer at least as much memory.
/// The UID is not copied.
pub fn restore(session: &mut Session, dump: &TagDump) -> Result<usize> {
    let info = session.get_info()?;
    if info.family != dump.family {
        return Err(Error::FamilyMismatch {
            dump: dump.family,
            target: info.family,
        });
    }

    let available = user_area(session, &info)?;
    if dump.data.len() > available {
        return Err(Error::InsufficientMemory {
            requested: dump.data.len(),
            available,
        });
    }

    let step = step(info.block_size);
    let mut copied = 0;
    for chunk in dump.data.chunks(step) {
        session.write(Range::new(copied, chunk.len()), chunk)?;
        copied += chunk.len();
        debug!("Restored {}/{} bytes", copied, dump.data.len());
    }

    info!("Restored {} bytes onto {} {}", copied, info.product, hex::encode(&info.uid));
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emulator::{VirtualField, VirtualOpener, VirtualTopaz, VirtualUltralight};
    use crate::session::{ReaderSelector, SessionOptions};
    use crate::tag::ultralight::Model;

    const SOURCE: [u8; 7] = [0x04, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66];
    const TARGET: [u8; 7] = [0x04, 0x77, 0x88, 0x99, 0xAA, 0xBB, 0xCC];

    fn session(field: &VirtualField) -> Session {
        let mut session = Session::with_opener(
            ReaderSelector::Auto,
            SessionOptions::default(),
            Box::new(VirtualOpener::new(field.clone())),
        );
        session.connect().unwrap();
        session
    }

    fn swap(session: &mut Session, field: &VirtualField, tag: impl crate::emulator::VirtualTag + 'static) {
        session.release_tag();
        field.remove();
        field.place(tag);
    }

    #[test]
    fn test_clone_onto_larger_tag() {
        let field = VirtualField::with_tag(VirtualUltralight::new(SOURCE, Model::Ntag213));
        let mut session = session(&field);
        session.write(Range::new(16, 4), &[0xDE, 0xAD, 0xBE, 0xEF]).unwrap();

        let dump = dump(&mut session).unwrap();
        assert_eq!(144, dump.data.len());
        assert_eq!(SOURCE.to_vec(), dump.uid);

        swap(&mut session, &field, VirtualUltralight::new(TARGET, Model::Ntag215));
        assert_eq!(144, restore(&mut session, &dump).unwrap());
        assert_eq!(vec![0xDE, 0xAD, 0xBE, 0xEF], session.read(Range::new(16, 4)).unwrap());
    }

    #[test]
    fn test_restore_checks_capacity() {
        let field = VirtualField::with_tag(VirtualUltralight::new(SOURCE, Model::Ntag215));
        let mut session = session(&field);
        let dump = dump(&mut session).unwrap();

        swap(&mut session, &field, VirtualUltralight::new(TARGET, Model::Ntag213));
        assert!(matches!(
            restore(&mut session, &dump),
            Err(Error::InsufficientMemory {
                requested: 504,
                available: 144,
            })
        ));
    }

    #[test]
    fn test_restore_checks_family() {
        let field = VirtualField::with_tag(VirtualUltralight::new(SOURCE, Model::Ntag213));
        let mut session = session(&field);
        let dump = dump(&mut session).unwrap();

        swap(&mut session, &field, VirtualTopaz::new([0x01, 0x02, 0x03, 0x04]));
        assert!(matches!(
            restore(&mut session, &dump),
            Err(Error::FamilyMismatch {
                dump: TagFamily::Type2Ultralight,
                target: TagFamily::Topaz,
            })
        ));
    }
}
