//! Maps the activation signature of a tag to its NFC Forum family.

use crate::backend::atr::{card_name, iso_dep_historical, standard, StorageAtr};
use crate::backend::Signature;
use crate::error::{Error, Result};
use crate::tag::TagFamily;

/// ATQA of Jewel/Topaz tags, which skip the SAK anticollision.
pub const ATQA_TOPAZ: u16 = 0x0C00;

const SAK_TYPE2: u8 = 0x00;
const SAK_ISO_DEP: u8 = 0x20;

/// SAK values of MIFARE Classic and its relatives.
const SAK_CLASSIC: [u8; 6] = [0x08, 0x18, 0x09, 0x88, 0x28, 0x38];

/// Historical bytes announced by MIFARE DESFire: a lone category indicator.
const DESFIRE_HISTORICAL: [u8; 1] = [0x80];

/// Historical bytes of an ATS, after TL, T0 and the interface bytes T0 announces.
fn ats_historical(ats: &[u8]) -> Option<&[u8]> {
    let (&tl, body) = ats.split_first()?;
    let body = body.get(..(tl as usize).checked_sub(1)?)?;
    let (&t0, rest) = body.split_first()?;
    rest.get((t0 & 0x70).count_ones() as usize..)
}

fn is_desfire(historical: Option<&[u8]>) -> bool {
    historical == Some(&DESFIRE_HISTORICAL[..])
}

/// Classifies a tag. The first matching rule wins.
pub fn classify(signature: &Signature) -> Result<TagFamily> {
    match signature {
        Signature::Iso14443A { atqa, sak, ats, .. } => match (*atqa, *sak) {
            (ATQA_TOPAZ, _) => Ok(TagFamily::Topaz),
            (_, SAK_TYPE2) => Ok(TagFamily::Type2Ultralight),
            (_, sak) if SAK_CLASSIC.contains(&sak) => Err(Error::UnsupportedTag),
            (_, sak) if sak & SAK_ISO_DEP != 0 && is_desfire(ats.as_deref().and_then(ats_historical)) => {
                Ok(TagFamily::Type4DESFire)
            }
            _ => Err(Error::UnsupportedTag),
        },
        Signature::FeliCa { .. } => Ok(TagFamily::Type3FeliCa),
        Signature::Iso15693 { .. } => Ok(TagFamily::Type5ISO15693),
        Signature::Atr { atr, .. } => match StorageAtr::parse(atr) {
            Some(StorageAtr {
                standard: standard::ISO14443A_3,
                card_name: card_name::MIFARE_ULTRALIGHT,
            }) => Ok(TagFamily::Type2Ultralight),
            Some(StorageAtr {
                standard: standard::ISO14443A_3,
                card_name: card_name::TOPAZ,
            }) => Ok(TagFamily::Topaz),
            Some(StorageAtr {
                standard: standard::FELICA,
                ..
            }) => Ok(TagFamily::Type3FeliCa),
            Some(StorageAtr {
                standard: standard::ISO15693_3 | standard::ISO15693_4,
                ..
            }) => Ok(TagFamily::Type5ISO15693),
            Some(_) => Err(Error::UnsupportedTag),
            None if is_desfire(iso_dep_historical(atr)) => Ok(TagFamily::Type4DESFire),
            None => Err(Error::UnsupportedTag),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iso14443a(atqa: u16, sak: u8, ats: Option<Vec<u8>>) -> Signature {
        Signature::Iso14443A {
            atqa,
            sak,
            uid: vec![0x04, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06],
            ats,
        }
    }

    #[test]
    fn test_classify_iso14443a() {
        assert_eq!(TagFamily::Topaz, classify(&iso14443a(0x0C00, 0x00, None)).unwrap());
        assert_eq!(TagFamily::Type2Ultralight, classify(&iso14443a(0x0044, 0x00, None)).unwrap());
        assert_eq!(
            TagFamily::Type4DESFire,
            classify(&iso14443a(0x0344, 0x20, Some(vec![0x06, 0x75, 0x77, 0x81, 0x02, 0x80]))).unwrap()
        );

        assert!(matches!(classify(&iso14443a(0x0004, 0x08, None)), Err(Error::UnsupportedTag)));
        assert!(matches!(classify(&iso14443a(0x0044, 0x20, None)), Err(Error::UnsupportedTag)));
        assert!(matches!(classify(&iso14443a(0x0044, 0x01, None)), Err(Error::UnsupportedTag)));
    }

    #[test]
    fn test_classify_other_iso_dep_cards() {
        let jcop = vec![0x09, 0x78, 0x77, 0x81, 0x02, 0x4A, 0x43, 0x4F, 0x50];
        assert!(matches!(classify(&iso14443a(0x0344, 0x20, Some(jcop))), Err(Error::UnsupportedTag)));

        let bare = vec![0x05, 0x78, 0x80, 0x70, 0x02];
        assert!(matches!(classify(&iso14443a(0x0344, 0x20, Some(bare))), Err(Error::UnsupportedTag)));

        // TL shorter than the bytes received
        let clipped = vec![0x03, 0x75, 0x77, 0x81, 0x02, 0x80];
        assert!(matches!(classify(&iso14443a(0x0344, 0x20, Some(clipped))), Err(Error::UnsupportedTag)));

        let jcop = Signature::Atr {
            atr: vec![0x3B, 0x84, 0x80, 0x01, 0x4A, 0x43, 0x4F, 0x50, 0x00],
            uid: vec![0x04; 7],
        };
        assert!(matches!(classify(&jcop), Err(Error::UnsupportedTag)));
    }

    #[test]
    fn test_classify_other_technologies() {
        let felica = Signature::FeliCa {
            idm: [0x01; 8],
            pmm: [0x00; 8],
            system_code: None,
        };
        assert_eq!(TagFamily::Type3FeliCa, classify(&felica).unwrap());

        let vicinity = Signature::Iso15693 {
            uid: [0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x04, 0xE0],
            dsfid: 0,
        };
        assert_eq!(TagFamily::Type5ISO15693, classify(&vicinity).unwrap());
    }

    #[test]
    fn test_classify_atr() {
        let storage = |ss: u8, name: u16| {
            let [n0, n1] = name.to_be_bytes();
            Signature::Atr {
                atr: vec![
                    0x3B, 0x8F, 0x80, 0x01, 0x80, 0x4F, 0x0C, 0xA0, 0x00, 0x00, 0x03, 0x06, ss,
                    n0, n1, 0x00, 0x00, 0x00, 0x00, 0x00,
                ],
                uid: vec![0x04, 0x01, 0x02, 0x03],
            }
        };

        assert_eq!(TagFamily::Type2Ultralight, classify(&storage(0x03, 0x0003)).unwrap());
        assert_eq!(TagFamily::Topaz, classify(&storage(0x03, 0x0030)).unwrap());
        assert_eq!(TagFamily::Type3FeliCa, classify(&storage(0x11, 0x003B)).unwrap());
        assert_eq!(TagFamily::Type5ISO15693, classify(&storage(0x0B, 0x0000)).unwrap());
        assert!(matches!(classify(&storage(0x03, 0x0001)), Err(Error::UnsupportedTag)));

        let desfire = Signature::Atr {
            atr: vec![0x3B, 0x81, 0x80, 0x01, 0x80, 0x80],
            uid: vec![0x04; 7],
        };
        assert_eq!(TagFamily::Type4DESFire, classify(&desfire).unwrap());
    }
}
