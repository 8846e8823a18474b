//! NFC Forum well-known record types: Text (`T`), URI (`U`) and Smart Poster (`Sp`).

use crate::error::Result;
use crate::ndef::{NdefMessage, NdefRecord, Tnf};

pub const TYPE_TEXT: &[u8] = b"T";
pub const TYPE_URI: &[u8] = b"U";
pub const TYPE_SMART_POSTER: &[u8] = b"Sp";

const STATUS_UTF16: u8 = 0x80;
const STATUS_LANG_MASK: u8 = 0x3F;

/// URI identifier codes, indexed by the first payload byte.
const URI_PREFIXES: [&str; 36] = [
    "",
    "http://www.",
    "https://www.",
    "http://",
    "https://",
    "tel:",
    "mailto:",
    "ftp://anonymous:anonymous@",
    "ftp://ftp.",
    "ftps://",
    "sftp://",
    "smb://",
    "nfs://",
    "ftp://",
    "dav://",
    "news:",
    "telnet://",
    "imap:",
    "rtsp://",
    "urn:",
    "pop:",
    "sip:",
    "sips:",
    "tftp:",
    "btspp://",
    "btl2cap://",
    "btgoep://",
    "tcpobex://",
    "irdaobex://",
    "file://",
    "urn:epc:id:",
    "urn:epc:tag:",
    "urn:epc:pat:",
    "urn:epc:raw:",
    "urn:epc:",
    "urn:nfc:",
];

/// Decoded content of a Text record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Text {
    pub language: String,
    pub text: String,
}

/// Decoded content of a Smart Poster record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmartPoster {
    pub uri: String,
    pub title: Option<Text>,
}

impl NdefRecord {
    /// A UTF-8 Text record.
    pub fn text(language: &str, text: &str) -> Self {
        let language = &language.as_bytes()[..language.len().min(STATUS_LANG_MASK as usize)];

        let mut payload = Vec::with_capacity(1 + language.len() + text.len());
        payload.push(language.len() as u8);
        payload.extend_from_slice(language);
        payload.extend_from_slice(text.as_bytes());

        Self::new(Tnf::WellKnown, TYPE_TEXT, payload)
    }

    /// A URI record, abbreviated with the longest matching identifier code.
    pub fn uri(uri: &str) -> Self {
        let (code, prefix) = URI_PREFIXES
            .iter()
            .enumerate()
            .skip(1)
            .filter(|(_, prefix)| uri.starts_with(*prefix))
            .max_by_key(|(_, prefix)| prefix.len())
            .unwrap_or((0, &""));

        let mut payload = Vec::with_capacity(1 + uri.len() - prefix.len());
        payload.push(code as u8);
        payload.extend_from_slice(&uri.as_bytes()[prefix.len()..]);

        Self::new(Tnf::WellKnown, TYPE_URI, payload)
    }

    /// A Smart Poster: a nested message holding a URI record and an optional
    /// `(language, text)` title.
    pub fn smart_poster(uri: &str, title: Option<(&str, &str)>) -> Result<Self> {
        let mut records = vec![Self::uri(uri)];
        records.extend(title.map(|(language, text)| Self::text(language, text)));

        let payload = NdefMessage::new(records).encode()?;
        Ok(Self::new(Tnf::WellKnown, TYPE_SMART_POSTER, payload))
    }

    fn is_well_known(&self, record_type: &[u8]) -> bool {
        self.tnf == Tnf::WellKnown && self.record_type == record_type
    }

    /// Decodes a Text record, UTF-8 or UTF-16.
    pub fn as_text(&self) -> Option<Text> {
        if !self.is_well_known(TYPE_TEXT) {
            return None;
        }

        let (&status, rest) = self.payload.split_first()?;
        let lang_len = (status & STATUS_LANG_MASK) as usize;
        let language = String::from_utf8(rest.get(..lang_len)?.to_vec()).ok()?;
        let body = &rest[lang_len..];

        let text = match status & STATUS_UTF16 != 0 {
            true => decode_utf16(body)?,
            _ => String::from_utf8(body.to_vec()).ok()?,
        };

        Some(Text { language, text })
    }

    /// Decodes a URI record, expanding the identifier code.
    pub fn as_uri(&self) -> Option<String> {
        if !self.is_well_known(TYPE_URI) {
            return None;
        }

        let (&code, rest) = self.payload.split_first()?;
        let prefix = URI_PREFIXES.get(code as usize).copied().unwrap_or_default();
        let rest = std::str::from_utf8(rest).ok()?;

        Some(format!("{}{}", prefix, rest))
    }

    /// Decodes a Smart Poster. The first URI and Text records of the nested message win.
    pub fn as_smart_poster(&self) -> Option<SmartPoster> {
        if !self.is_well_known(TYPE_SMART_POSTER) {
            return None;
        }

        let message = NdefMessage::decode(&self.payload).ok()?;
        let uri = message.records().iter().find_map(NdefRecord::as_uri)?;
        let title = message.records().iter().find_map(NdefRecord::as_text);

        Some(SmartPoster { uri, title })
    }
}

/// UTF-16 with an optional byte order mark; big-endian without one.
fn decode_utf16(bytes: &[u8]) -> Option<String> {
    if bytes.len() % 2 != 0 {
        return None;
    }

    let (little, body) = match bytes {
        [0xFF, 0xFE, rest @ ..] => (true, rest),
        [0xFE, 0xFF, rest @ ..] => (false, rest),
        _ => (false, bytes),
    };

    let units: Vec<u16> = body
        .chunks_exact(2)
        .map(|c| match little {
            true => u16::from_le_bytes([c[0], c[1]]),
            _ => u16::from_be_bytes([c[0], c[1]]),
        })
        .collect();

    String::from_utf16(&units).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_record() {
        let record = NdefRecord::text("en", "Hello");
        assert_eq!(vec![0x02, b'e', b'n', b'H', b'e', b'l', b'l', b'o'], record.payload);

        let text = record.as_text().unwrap();
        assert_eq!("en", text.language);
        assert_eq!("Hello", text.text);
        assert_eq!(None, record.as_uri());
    }

    #[test]
    fn test_utf16_text() {
        let record = NdefRecord::new(
            Tnf::WellKnown,
            TYPE_TEXT,
            vec![0x82, b'j', b'a', 0xFE, 0xFF, 0x30, 0x42],
        );

        assert_eq!("\u{3042}", record.as_text().unwrap().text);
    }

    #[test]
    fn test_uri_abbreviation() {
        let record = NdefRecord::uri("https://www.example.com/");
        assert_eq!(0x02, record.payload[0]);
        assert_eq!(b"example.com/", &record.payload[1..]);
        assert_eq!(Some("https://www.example.com/".to_owned()), record.as_uri());

        let record = NdefRecord::uri("geo:1,2");
        assert_eq!(0x00, record.payload[0]);
        assert_eq!(Some("geo:1,2".to_owned()), record.as_uri());
    }

    #[test]
    fn test_smart_poster() {
        let record = NdefRecord::smart_poster("https://example.com", Some(("en", "Example"))).unwrap();
        assert_eq!(b"Sp".to_vec(), record.record_type);
        assert_eq!(&[0x91, 0x01, 0x0C, b'U', 0x04][..], &record.payload[..5]);

        let poster = record.as_smart_poster().unwrap();
        assert_eq!("https://example.com", poster.uri);
        assert_eq!(
            Some(Text {
                language: "en".to_owned(),
                text: "Example".to_owned(),
            }),
            poster.title
        );
        assert_eq!(None, record.as_uri());

        let bare = NdefRecord::smart_poster("tel:+123", None).unwrap();
        let poster = bare.as_smart_poster().unwrap();
        assert_eq!("tel:+123", poster.uri);
        assert_eq!(None, poster.title);

        let message = NdefMessage::from(record.clone());
        let decoded = NdefMessage::decode(&message.encode().unwrap()).unwrap();
        assert_eq!(record, decoded.records()[0]);

        // A poster without a URI record is not a poster.
        let text_only = NdefMessage::from(NdefRecord::text("en", "x")).encode().unwrap();
        let record = NdefRecord::new(Tnf::WellKnown, TYPE_SMART_POSTER, text_only);
        assert_eq!(None, record.as_smart_poster());
    }
}
