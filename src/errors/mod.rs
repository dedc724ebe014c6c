/// Storage errors. Every variant maps to a stable negative integer through
/// [`Error::code`] so external harnesses can match on numbers instead of
/// strings; `0` is reserved for "no error".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    BadParameter(&'static str),
    /// Every frame in the pool is pinned; the clock made two full passes.
    NoUnfixedBuffer,
    BadBufferIndex(i32),
    /// The page is not resident (or not pinned) in the buffer pool.
    FrameNotFound,
    /// Bulk flushing is a configuration the buffer manager refuses to run with.
    UnsupportedBufferMode,
    /// Object payloads above the large object threshold are not stored here.
    UnsupportedObjectSize(usize),
    /// Key descriptors may only carry integer and varstring parts.
    UnsupportedKeyType,
    BadCatalogObject,
    BadObjectId,
    BadCursor,
    DuplicateKey,
    BadBtreePage(u16),
    BadCompOp(i32),
}

impl Error {
    pub fn code(&self) -> i32 {
        match self {
            Error::BadParameter(_) => -1,
            Error::NoUnfixedBuffer => -2,
            Error::BadBufferIndex(_) => -3,
            Error::FrameNotFound => -4,
            Error::UnsupportedBufferMode => -5,
            Error::UnsupportedObjectSize(_) => -6,
            Error::UnsupportedKeyType => -7,
            Error::BadCatalogObject => -8,
            Error::BadObjectId => -9,
            Error::BadCursor => -10,
            Error::DuplicateKey => -11,
            Error::BadBtreePage(_) => -12,
            Error::BadCompOp(_) => -13,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::BadParameter(context) => write!(f, "Bad parameter: {context}."),
            Error::NoUnfixedBuffer => write!(f, "No unfixed buffer left in the pool."),
            Error::BadBufferIndex(idx) => write!(f, "Bad buffer table index {idx}."),
            Error::FrameNotFound => write!(f, "Page is not resident in the buffer pool."),
            Error::UnsupportedBufferMode => write!(f, "Bulk flush mode is not supported."),
            Error::UnsupportedObjectSize(len) => {
                write!(f, "Object of {len} bytes exceeds the large object threshold.")
            }
            Error::UnsupportedKeyType => write!(f, "Unsupported key part type."),
            Error::BadCatalogObject => write!(f, "Not a valid catalog object."),
            Error::BadObjectId => write!(f, "Object id does not name a live object."),
            Error::BadCursor => write!(f, "Cursor was not produced by a fetch."),
            Error::BadBtreePage(tag) => write!(f, "Corrupt b-tree page type tag {tag:#x}."),
            Error::DuplicateKey => write!(f, "Key already exists in the index."),
            Error::BadCompOp(op) => write!(f, "Unknown comparison operator {op}."),
        }
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_negative_and_distinct() {
        let all = [
            Error::BadParameter("x"),
            Error::NoUnfixedBuffer,
            Error::BadBufferIndex(3),
            Error::FrameNotFound,
            Error::UnsupportedBufferMode,
            Error::UnsupportedObjectSize(1),
            Error::UnsupportedKeyType,
            Error::BadCatalogObject,
            Error::BadObjectId,
            Error::BadCursor,
            Error::DuplicateKey,
            Error::BadBtreePage(0),
            Error::BadCompOp(7),
        ];

        let codes: Vec<i32> = all.iter().map(Error::code).collect();
        assert!(codes.iter().all(|&code| code < 0));
        let mut deduped = codes.clone();
        deduped.sort_unstable();
        deduped.dedup();
        assert_eq!(deduped.len(), codes.len());
    }
}
