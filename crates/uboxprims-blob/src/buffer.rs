use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::attr::{
    align4, encode_header, header_len_for, name_header_len, put_name, put_padding, Attr,
    EXTENDED_HEADER_SIZE, HEADER_SIZE, MAX_COMPACT_LEN, MAX_EXTENDED_LEN, MAX_NAME_LEN,
};
use crate::error::{BlobError, Result};
use crate::kind::AttrKind;

/// Default maximum buffer size: 64 MiB.
pub const DEFAULT_MAX_BUFFER: usize = 64 * 1024 * 1024;

const INITIAL_BUFFER_CAPACITY: usize = 4 * 1024;

/// Bytes reserved in front of the content for the head header, which is
/// written right-aligned so the compact and extended forms both end here.
const HEAD_RESERVED: usize = EXTENDED_HEADER_SIZE;

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

/// Configuration for attribute buffers.
#[derive(Debug, Clone)]
pub struct BufferConfig {
    /// Maximum size of the head payload in bytes. Default: 64 MiB.
    pub max_len: usize,
    /// Bytes preallocated on creation.
    pub initial_capacity: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_len: DEFAULT_MAX_BUFFER,
            initial_capacity: INITIAL_BUFFER_CAPACITY,
        }
    }
}

/// Marker for an open table or array, returned by [`Buffer::open_nested`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cookie {
    serial: u64,
    is_array: bool,
}

impl Cookie {
    /// Whether the nested span is an array.
    pub fn is_array(&self) -> bool {
        self.is_array
    }
}

#[derive(Debug, Clone, Copy)]
struct OpenSpan {
    serial: u64,
    offset: usize,
    kind: AttrKind,
    named: bool,
}

/// Buffer state captured before a multi-step write, for rollback on failure.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Checkpoint {
    len: usize,
    depth: usize,
}

/// Growable buffer of attributes under a single head attribute.
///
/// Attributes are appended in order. Tables and arrays are written by
/// opening a nested span, appending its members and closing it again; the
/// span's length is patched into its header on close. Spans nest strictly
/// last-in-first-out.
pub struct Buffer {
    buf: BytesMut,
    open: Vec<OpenSpan>,
    head_start: usize,
    config: BufferConfig,
}

impl Buffer {
    /// Create an empty buffer with default configuration.
    pub fn new() -> Self {
        Self::with_config(BufferConfig::default())
    }

    /// Create an empty buffer with explicit configuration.
    pub fn with_config(config: BufferConfig) -> Self {
        let mut buffer = Self {
            buf: BytesMut::with_capacity(HEAD_RESERVED + config.initial_capacity),
            open: Vec::new(),
            head_start: 0,
            config,
        };
        buffer.reset();
        buffer
    }

    /// Discard all content and open spans, keeping the allocation.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.buf.put_bytes(0, HEAD_RESERVED);
        self.open.clear();
        self.patch_head();
    }

    /// The head attribute spanning every attribute written so far.
    ///
    /// Spans that are still open read as containers holding only the
    /// members written before the last close.
    pub fn head(&self) -> Attr<'_> {
        Attr::from_head(&self.buf[self.head_start..], HEAD_RESERVED - self.head_start)
    }

    /// Encoded bytes of the head attribute.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[self.head_start..]
    }

    /// Copy of the encoded head attribute.
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(self.as_bytes())
    }

    /// Consume the buffer and return the encoded head attribute.
    pub fn into_bytes(self) -> Bytes {
        let mut buf = self.buf;
        buf.advance(self.head_start);
        buf.freeze()
    }

    /// Encoded size in bytes, head header included.
    pub fn len(&self) -> usize {
        self.buf.len() - self.head_start
    }

    /// Returns true if no attribute has been written.
    pub fn is_empty(&self) -> bool {
        self.content_len() == 0
    }

    /// Number of nested spans currently open.
    pub fn depth(&self) -> usize {
        self.open.len()
    }

    /// Current buffer configuration.
    pub fn config(&self) -> &BufferConfig {
        &self.config
    }

    /// Append an attribute of `kind` whose value bytes are `data`.
    ///
    /// Scalar kinds must be given exactly their fixed width.
    pub fn add_field(&mut self, name: &str, kind: AttrKind, data: &[u8]) -> Result<()> {
        if let Some(width) = kind.scalar_width() {
            if data.len() != width {
                return Err(BlobError::LengthMismatch {
                    kind,
                    expected: width,
                    actual: data.len(),
                });
            }
        }
        self.put_field(name, kind, &[data])
    }

    pub fn add_u8(&mut self, name: &str, value: u8) -> Result<()> {
        self.add_field(name, AttrKind::U8, &[value])
    }

    /// Booleans are stored as `u8` 0 or 1.
    pub fn add_bool(&mut self, name: &str, value: bool) -> Result<()> {
        self.add_u8(name, u8::from(value))
    }

    pub fn add_u16(&mut self, name: &str, value: u16) -> Result<()> {
        self.add_field(name, AttrKind::U16, &value.to_be_bytes())
    }

    pub fn add_u32(&mut self, name: &str, value: u32) -> Result<()> {
        self.add_field(name, AttrKind::U32, &value.to_be_bytes())
    }

    pub fn add_u64(&mut self, name: &str, value: u64) -> Result<()> {
        self.add_field(name, AttrKind::U64, &value.to_be_bytes())
    }

    pub fn add_double(&mut self, name: &str, value: f64) -> Result<()> {
        self.add_field(name, AttrKind::Double, &value.to_bits().to_be_bytes())
    }

    /// Append a NUL-terminated string attribute.
    pub fn add_string(&mut self, name: &str, value: &str) -> Result<()> {
        self.put_field(name, AttrKind::String, &[value.as_bytes(), &[0]])
    }

    /// Append a string attribute rendered from format arguments.
    pub fn add_fmt(&mut self, name: &str, args: fmt::Arguments<'_>) -> Result<()> {
        match args.as_str() {
            Some(text) => self.add_string(name, text),
            None => self.add_string(name, &args.to_string()),
        }
    }

    /// Open a table (`is_array == false`) or array span.
    ///
    /// Members written until the matching [`close_nested`](Self::close_nested)
    /// belong to the span. Array members should be unnamed.
    pub fn open_nested(&mut self, name: &str, is_array: bool) -> Result<Cookie> {
        check_name(name)?;
        let kind = if is_array {
            AttrKind::Array
        } else {
            AttrKind::Table
        };
        let named = !name.is_empty();
        let name_len = name_header_len(name);
        self.ensure_room(HEADER_SIZE + name_len)?;

        let offset = self.buf.len();
        // Placeholder covers just the name until the span is closed.
        let (header, _) = encode_header(kind.id(), named, name_len);
        self.buf.put_slice(&header[..HEADER_SIZE]);
        put_name(&mut self.buf, name);

        let serial = NEXT_SERIAL.fetch_add(1, Ordering::Relaxed);
        self.open.push(OpenSpan {
            serial,
            offset,
            kind,
            named,
        });
        self.patch_head();

        trace!(serial, offset, %kind, depth = self.open.len(), "opened nested span");
        Ok(Cookie { serial, is_array })
    }

    /// Close the innermost open span and patch its length.
    ///
    /// Fails with [`BlobError::CookieOrder`] if a more recently opened span is
    /// still open, and with [`BlobError::CookieNotOpen`] if the cookie was
    /// already closed or was issued by another buffer.
    pub fn close_nested(&mut self, cookie: Cookie) -> Result<()> {
        let span = match self.open.last() {
            Some(top) if top.serial == cookie.serial => *top,
            Some(top) if self.open.iter().any(|s| s.serial == cookie.serial) => {
                return Err(BlobError::CookieOrder {
                    expected: top.serial,
                    found: cookie.serial,
                });
            }
            _ => return Err(BlobError::CookieNotOpen(cookie.serial)),
        };

        let len = self.buf.len() - span.offset - HEADER_SIZE;
        if len > MAX_COMPACT_LEN {
            // Widen the placeholder to the extended form; everything after it
            // belongs to closed spans, so shifting it is safe.
            self.ensure_room(EXTENDED_HEADER_SIZE - HEADER_SIZE)?;
            let tail = self.buf.split_off(span.offset + HEADER_SIZE);
            self.buf.put_u32(0);
            self.buf.unsplit(tail);
        }

        let (header, header_len) = encode_header(span.kind.id(), span.named, len);
        self.buf[span.offset..span.offset + header_len].copy_from_slice(&header[..header_len]);
        self.open.pop();
        self.patch_head();

        trace!(serial = span.serial, len, depth = self.open.len(), "closed nested span");
        Ok(())
    }

    pub(crate) fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            len: self.buf.len(),
            depth: self.open.len(),
        }
    }

    /// Drop everything written after `checkpoint`.
    pub(crate) fn rollback(&mut self, checkpoint: Checkpoint) {
        self.buf.truncate(checkpoint.len);
        self.open.truncate(checkpoint.depth);
        self.patch_head();
    }

    fn put_field(&mut self, name: &str, kind: AttrKind, parts: &[&[u8]]) -> Result<()> {
        check_name(name)?;
        let data_len: usize = parts.iter().map(|part| part.len()).sum();
        let len = name_header_len(name) + data_len;
        let header_len = header_len_for(len);
        self.ensure_room(align4(header_len + len))?;

        let (header, header_len) = encode_header(kind.id(), !name.is_empty(), len);
        self.buf.put_slice(&header[..header_len]);
        put_name(&mut self.buf, name);
        for part in parts {
            self.buf.put_slice(part);
        }
        put_padding(&mut self.buf, header_len + len);
        self.patch_head();
        Ok(())
    }

    fn content_len(&self) -> usize {
        self.buf.len() - HEAD_RESERVED
    }

    fn ensure_room(&self, extra: usize) -> Result<()> {
        let max = self.config.max_len.min(MAX_EXTENDED_LEN);
        let size = self.content_len().saturating_add(extra);
        if size > max {
            return Err(BlobError::BufferFull { size, max });
        }
        Ok(())
    }

    fn patch_head(&mut self) {
        let len = self.content_len();
        let (header, header_len) = encode_header(AttrKind::Unspec.id(), false, len);
        let start = HEAD_RESERVED - header_len;
        self.buf[start..HEAD_RESERVED].copy_from_slice(&header[..header_len]);
        self.head_start = start;
    }
}

fn check_name(name: &str) -> Result<()> {
    if name.len() > MAX_NAME_LEN {
        return Err(BlobError::NameTooLong {
            len: name.len(),
            max: MAX_NAME_LEN,
        });
    }
    Ok(())
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("len", &self.len())
            .field("depth", &self.open.len())
            .field("max_len", &self.config.max_len)
            .finish()
    }
}
