/// A `length@offset` byte range of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ByteRange {
    pub offset: u64,
    pub length: u64,
}

impl ByteRange {
    pub fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    /// Offset of the first byte after the range, `None` if it does not fit in `u64`.
    pub fn end(&self) -> Option<u64> {
        self.offset.checked_add(self.length)
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// `Range` header value. Empty and overflowing ranges have no valid header.
    pub fn to_http_range(&self) -> Option<String> {
        if self.is_empty() {
            return None;
        }
        let last = self.end()? - 1;
        Some(format!("bytes={}-{last}", self.offset))
    }
}
