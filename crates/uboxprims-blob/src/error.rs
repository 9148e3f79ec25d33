use crate::kind::AttrKind;

/// Errors that can occur while building or decoding attribute buffers.
#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    /// Growing the buffer would exceed its configured maximum size.
    #[error("buffer full ({size} bytes requested, max {max})")]
    BufferFull { size: usize, max: usize },

    /// An attribute name does not fit the 16-bit name header.
    #[error("attribute name too long ({len} bytes, max {max})")]
    NameTooLong { len: usize, max: usize },

    /// The kind id does not fit the header's id field.
    #[error("invalid attribute kind id {0}")]
    InvalidKind(u8),

    /// A nested span was closed while a more recently opened span is still open.
    #[error("nested span {found} closed out of order (innermost open span is {expected})")]
    CookieOrder { expected: u64, found: u64 },

    /// A nested span was closed twice, or belongs to another buffer.
    #[error("nested span {0} is not open")]
    CookieNotOpen(u64),

    /// The marshaler met a value it cannot represent.
    #[error("unsupported value type: {0}")]
    Unsupported(&'static str),

    /// The marshaler exceeded its recursion bound.
    #[error("value too deeply nested (max depth {max})")]
    TooDeep { max: usize },

    /// Fewer bytes are available than the header announces.
    #[error("truncated attribute ({needed} bytes needed, {available} available)")]
    Truncated { needed: usize, available: usize },

    /// The extended flag is set but the header is not a valid extended header.
    #[error("malformed extended length header")]
    MalformedExtended,

    /// The kind id is not one of the known attribute kinds.
    #[error("unknown attribute kind id {0}")]
    UnknownKind(u8),

    /// A typed accessor was used on an attribute of another kind.
    #[error("attribute kind mismatch (expected {expected}, found id {found})")]
    TypeMismatch { expected: AttrKind, found: u8 },

    /// The payload width does not match the scalar width of the kind.
    #[error("{kind} payload has {actual} bytes, expected {expected}")]
    LengthMismatch {
        kind: AttrKind,
        expected: usize,
        actual: usize,
    },

    /// A string or name payload is not valid UTF-8.
    #[error("attribute text is not valid UTF-8")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    /// A string or name payload lacks its NUL terminator.
    #[error("attribute text is missing its NUL terminator")]
    MissingTerminator,

    /// Children were requested from a scalar attribute.
    #[error("{0} attribute is not a container")]
    NotAContainer(AttrKind),

    /// JSON text could not be parsed or produced.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Only JSON objects can be added to a buffer.
    #[error("json input must be an object")]
    JsonNotObject,
}

pub type Result<T> = std::result::Result<T, BlobError>;
