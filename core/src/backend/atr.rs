//! Answer-to-reset bytes PC/SC readers build for contactless cards.
//!
//! Storage cards get a PC/SC Part 3 ATR naming the card standard and the card;
//! ISO-DEP cards get an ATR whose historical bytes come from the ATS.

/// Card standards encoded in a PC/SC Part 3 ATR.
pub mod standard {
    pub const ISO14443A_3: u8 = 0x03;
    pub const ISO15693_3: u8 = 0x0B;
    pub const ISO15693_4: u8 = 0x0C;
    pub const FELICA: u8 = 0x11;
}

/// Card names encoded in a PC/SC Part 3 ATR.
pub mod card_name {
    pub const MIFARE_ULTRALIGHT: u16 = 0x0003;
    pub const TOPAZ: u16 = 0x0030;
}

/// Contents of a PC/SC Part 3 storage card ATR:
/// `3B 8F 80 01 80 4F 0C A0 00 00 03 06 SS NN NN 00 00 00 00 TCK`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageAtr {
    pub standard: u8,
    pub card_name: u16,
}

impl StorageAtr {
    pub fn parse(atr: &[u8]) -> Option<Self> {
        match atr {
            [0x3B, _, _, _, 0x80, 0x4F, _, 0xA0, 0x00, 0x00, 0x03, 0x06, ss, n0, n1, ..] => {
                Some(Self {
                    standard: *ss,
                    card_name: u16::from_be_bytes([*n0, *n1]),
                })
            }
            _ => None,
        }
    }
}

/// Historical bytes of an ATR built for an ISO-DEP (ISO 14443-4) card.
pub fn iso_dep_historical(atr: &[u8]) -> Option<&[u8]> {
    match atr {
        [0x3B, t0, 0x80, 0x01, rest @ ..] if t0 & 0xF0 == 0x80 && StorageAtr::parse(atr).is_none() => {
            rest.get(..(t0 & 0x0F) as usize)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_storage_atr() {
        let ultralight = [
            0x3B, 0x8F, 0x80, 0x01, 0x80, 0x4F, 0x0C, 0xA0, 0x00, 0x00, 0x03, 0x06, 0x03, 0x00,
            0x03, 0x00, 0x00, 0x00, 0x00, 0x68,
        ];

        assert_eq!(
            Some(StorageAtr {
                standard: standard::ISO14443A_3,
                card_name: card_name::MIFARE_ULTRALIGHT,
            }),
            StorageAtr::parse(&ultralight),
        );
        assert_eq!(None, iso_dep_historical(&ultralight));
    }

    #[test]
    fn test_iso_dep_atr() {
        let desfire = [0x3B, 0x81, 0x80, 0x01, 0x80, 0x80];

        assert_eq!(Some(&[0x80][..]), iso_dep_historical(&desfire));
        assert_eq!(None, StorageAtr::parse(&desfire));

        let jcop = [0x3B, 0x84, 0x80, 0x01, 0x4A, 0x43, 0x4F, 0x50, 0x00];
        assert_eq!(Some(&b"JCOP"[..]), iso_dep_historical(&jcop));
    }
}
