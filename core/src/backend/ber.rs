//! BER-TLV support for the data objects PC/SC readers return.

/// Stateful, simple BER-TLV reader.
pub struct Reader<'a> {
    buffer: &'a [u8],
    cursor: usize,
}

impl<'a> Reader<'a> {
    /// Creates a new reader from the buffer.
    pub fn new(buffer: &'a [u8]) -> Self {
        Self { buffer, cursor: 0 }
    }

    /// Whether the whole buffer has been consumed.
    pub fn is_empty(&self) -> bool {
        self.cursor >= self.buffer.len()
    }

    /// Reads data of specified size without seeking the cursor.
    pub fn peek(&self, length: usize) -> Option<&'a [u8]> {
        self.buffer.get(self.cursor..self.cursor.checked_add(length)?)
    }

    /// Seeks the cursor without reading data
    pub fn seek(&mut self, length: usize) {
        self.cursor += length;
    }

    /// Reads a next octet and seeks the cursor.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<u8> {
        let byte = *self.buffer.get(self.cursor)?;
        self.seek(1);
        Some(byte)
    }

    /// Reads data of specified size and seeks the cursor.
    /// Short version of `self.peek` + `self.seek`
    pub fn read(&mut self, length: usize) -> Option<&'a [u8]> {
        let bytes = self.peek(length)?;
        self.seek(length);
        Some(bytes)
    }

    /// Reads a tag of one or two octets, seeking the cursor.
    pub fn read_tag(&mut self) -> Option<u16> {
        let first = self.next()?;
        if first & 0x1f == 0x1f {
            Some(u16::from_be_bytes([first, self.next()?]))
        } else {
            Some(first as u16)
        }
    }

    /// Reads the length of data at the current position, seeking the cursor.
    pub fn read_length(&mut self) -> Option<usize> {
        let head = self.next()? as usize;
        if head & 0x80 == 0 {
            Some(head)
        } else {
            let mut size = 0usize;
            for _ in 0..(head & 0x7f) {
                size <<= 8;
                size |= self.next()? as usize
            }

            Some(size)
        }
    }

    /// Reads a whole data object at the current position, seeking the cursor.
    pub fn read_tlv(&mut self) -> Option<(u16, &'a [u8])> {
        let tag = self.read_tag()?;
        let length = self.read_length()?;

        Some((tag, self.read(length)?))
    }
}

/// Finds the value of the first data object tagged `tag` on the top level of `buf`.
pub fn find(buf: &[u8], tag: u16) -> Option<&[u8]> {
    let mut reader = Reader::new(buf);
    while !reader.is_empty() {
        let (t, value) = reader.read_tlv()?;
        if t == tag {
            return Some(value);
        }
    }

    None
}

/// Encodes one data object.
pub fn encode(tag: u16, value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(value.len() + 5);
    match tag > 0xFF {
        true => out.extend_from_slice(&tag.to_be_bytes()),
        _ => out.push(tag as u8),
    }

    match value.len() {
        l if l < 0x80 => out.push(l as u8),
        l if l <= 0xFF => out.extend_from_slice(&[0x81, l as u8]),
        l => {
            out.push(0x82);
            out.extend_from_slice(&(l as u16).to_be_bytes());
        }
    }

    out.extend_from_slice(value);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_in_transparent_exchange_response() {
        let response = [
            0xC0, 0x03, 0x00, 0x90, 0x00, 0x5F, 0x46, 0x01, 0x10, 0x97, 0x02, 0xAB, 0xCD,
        ];

        assert_eq!(Some(&[0x00, 0x90, 0x00][..]), find(&response, 0xC0));
        assert_eq!(Some(&[0x10][..]), find(&response, 0x5F46));
        assert_eq!(Some(&[0xAB, 0xCD][..]), find(&response, 0x97));
        assert_eq!(None, find(&response, 0x96));
    }

    #[test]
    fn test_long_form_length() {
        let value = vec![0x5A; 200];
        let encoded = encode(0x95, &value);

        assert_eq!(&[0x95, 0x81, 200], &encoded[..3]);
        assert_eq!(Some(value.as_slice()), find(&encoded, 0x95));
        assert_eq!(None, find(&encoded[..10], 0x95));
    }
}
