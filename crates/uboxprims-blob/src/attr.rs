use std::fmt;

use bytes::{BufMut, BytesMut};

use crate::error::{BlobError, Result};
use crate::kind::{AttrKind, MAX_KIND_ID};

/// Compact header: one 32-bit word.
pub const HEADER_SIZE: usize = 4;

/// Extended header: header word plus a 32-bit payload length.
pub const EXTENDED_HEADER_SIZE: usize = 8;

/// Every attribute occupies a multiple of this many bytes.
pub const ALIGN: usize = 4;

/// Largest payload length representable in the compact header.
pub const MAX_COMPACT_LEN: usize = 0x00ff_ffff;

/// Largest payload length representable in the extended header.
pub const MAX_EXTENDED_LEN: usize = u32::MAX as usize;

/// Largest attribute name, bounded by the 16-bit name length field.
pub const MAX_NAME_LEN: usize = u16::MAX as usize;

const EXTENDED_FLAG: u32 = 1 << 31;
const NAMED_FLAG: u32 = 1 << 30;
const ID_SHIFT: u32 = 24;
const ID_MASK: u32 = (MAX_KIND_ID as u32) << ID_SHIFT;
const LEN_MASK: u32 = MAX_COMPACT_LEN as u32;

/// Round `len` up to the attribute alignment.
pub fn align4(len: usize) -> usize {
    (len + ALIGN - 1) & !(ALIGN - 1)
}

/// Header size needed for a payload of `len` bytes.
pub fn header_len_for(len: usize) -> usize {
    if len > MAX_COMPACT_LEN {
        EXTENDED_HEADER_SIZE
    } else {
        HEADER_SIZE
    }
}

/// Size of the name header preceding the value of a named attribute.
///
/// Unnamed attributes (empty name) carry no name header.
pub fn name_header_len(name: &str) -> usize {
    if name.is_empty() {
        0
    } else {
        align4(2 + name.len() + 1)
    }
}

/// Encode an attribute header.
///
/// Wire format (big-endian):
/// ```text
/// ┌───┬───┬────────┬──────────────────────┬────────────────────────┐
/// │ X │ N │ id (6) │ length (24)          │ [length (32) if X set] │
/// └───┴───┴────────┴──────────────────────┴────────────────────────┘
///  X = extended length, N = named (payload starts with a name header)
/// ```
///
/// Returns the header bytes and how many of them are used.
pub(crate) fn encode_header(id: u8, named: bool, len: usize) -> ([u8; EXTENDED_HEADER_SIZE], usize) {
    let mut word = (u32::from(id) << ID_SHIFT) & ID_MASK;
    if named {
        word |= NAMED_FLAG;
    }

    let mut out = [0u8; EXTENDED_HEADER_SIZE];
    if len > MAX_COMPACT_LEN {
        word |= EXTENDED_FLAG;
        out[..4].copy_from_slice(&word.to_be_bytes());
        out[4..].copy_from_slice(&(len as u32).to_be_bytes());
        (out, EXTENDED_HEADER_SIZE)
    } else {
        word |= len as u32;
        out[..4].copy_from_slice(&word.to_be_bytes());
        (out, HEADER_SIZE)
    }
}

/// Append a name header.
pub(crate) fn put_name(dst: &mut BytesMut, name: &str) {
    if name.is_empty() {
        return;
    }
    let start = dst.len();
    dst.put_u16(name.len() as u16);
    dst.put_slice(name.as_bytes());
    dst.put_u8(0);
    put_padding(dst, dst.len() - start);
}

/// Zero-fill up to the next alignment boundary after `written` bytes.
pub(crate) fn put_padding(dst: &mut BytesMut, written: usize) {
    dst.put_bytes(0, align4(written) - written);
}

/// A read-only view of one attribute inside a byte region.
///
/// Produced by [`Attr::parse`] or by iterating a container's
/// [`children`](Attr::children). Never copies.
#[derive(Clone, Copy)]
pub struct Attr<'a> {
    /// Header and payload, without trailing padding.
    bytes: &'a [u8],
    id: u8,
    extended: bool,
    header_len: usize,
    name: &'a str,
    name_len: usize,
}

impl<'a> Attr<'a> {
    /// Decode the attribute starting at `src[0]`.
    ///
    /// `src` may extend past the attribute; trailing bytes are ignored.
    pub fn parse(src: &'a [u8]) -> Result<Self> {
        if src.len() < HEADER_SIZE {
            return Err(BlobError::Truncated {
                needed: HEADER_SIZE,
                available: src.len(),
            });
        }

        let word = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
        let extended = word & EXTENDED_FLAG != 0;
        let named = word & NAMED_FLAG != 0;
        let id = ((word & ID_MASK) >> ID_SHIFT) as u8;

        let (header_len, len) = if extended {
            if word & LEN_MASK != 0 {
                return Err(BlobError::MalformedExtended);
            }
            if src.len() < EXTENDED_HEADER_SIZE {
                return Err(BlobError::Truncated {
                    needed: EXTENDED_HEADER_SIZE,
                    available: src.len(),
                });
            }
            let len = u32::from_be_bytes([src[4], src[5], src[6], src[7]]) as usize;
            // Extended form is only valid for lengths the compact form cannot carry.
            if len <= MAX_COMPACT_LEN {
                return Err(BlobError::MalformedExtended);
            }
            (EXTENDED_HEADER_SIZE, len)
        } else {
            (HEADER_SIZE, (word & LEN_MASK) as usize)
        };

        let raw_len = header_len + len;
        if src.len() < raw_len {
            return Err(BlobError::Truncated {
                needed: raw_len,
                available: src.len(),
            });
        }

        let bytes = &src[..raw_len];
        let (name, name_len) = if named {
            parse_name(&bytes[header_len..])?
        } else {
            ("", 0)
        };

        Ok(Self {
            bytes,
            id,
            extended,
            header_len,
            name,
            name_len,
        })
    }

    /// View of a buffer head whose header was written by the buffer itself.
    pub(crate) fn from_head(bytes: &'a [u8], header_len: usize) -> Self {
        Self {
            bytes,
            id: AttrKind::Unspec.id(),
            extended: header_len == EXTENDED_HEADER_SIZE,
            header_len,
            name: "",
            name_len: 0,
        }
    }

    /// Raw kind id from the header.
    pub fn id(&self) -> u8 {
        self.id
    }

    /// The decoded kind, failing on reserved ids.
    pub fn kind(&self) -> Result<AttrKind> {
        AttrKind::from_id(self.id)
    }

    /// Whether the header uses the extended length form.
    pub fn is_extended(&self) -> bool {
        self.extended
    }

    /// Whether the payload starts with a name header.
    pub fn is_named(&self) -> bool {
        self.name_len > 0
    }

    /// The attribute name, empty for unnamed attributes.
    pub fn name(&self) -> &'a str {
        self.name
    }

    /// Payload length in bytes, excluding the header.
    pub fn len(&self) -> usize {
        self.bytes.len() - self.header_len
    }

    /// Returns true if the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Header length in bytes (4 or 8).
    pub fn header_len(&self) -> usize {
        self.header_len
    }

    /// Header plus payload, before padding.
    pub fn raw_len(&self) -> usize {
        self.bytes.len()
    }

    /// Total space the attribute occupies, padding included.
    pub fn padded_len(&self) -> usize {
        align4(self.raw_len())
    }

    /// Number of zero padding bytes after the payload.
    pub fn pad_len(&self) -> usize {
        self.padded_len() - self.raw_len()
    }

    /// The full payload, name header included.
    pub fn payload(&self) -> &'a [u8] {
        &self.bytes[self.header_len..]
    }

    /// The value bytes following the name header.
    pub fn data(&self) -> &'a [u8] {
        &self.bytes[self.header_len + self.name_len..]
    }

    /// Header and payload bytes, without padding.
    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    fn scalar<const N: usize>(&self, kind: AttrKind) -> Result<[u8; N]> {
        self.expect_kind(kind)?;
        let data = self.data();
        data.try_into().map_err(|_| BlobError::LengthMismatch {
            kind,
            expected: N,
            actual: data.len(),
        })
    }

    fn expect_kind(&self, kind: AttrKind) -> Result<()> {
        if self.id != kind.id() {
            return Err(BlobError::TypeMismatch {
                expected: kind,
                found: self.id,
            });
        }
        Ok(())
    }

    pub fn as_u8(&self) -> Result<u8> {
        Ok(self.scalar::<1>(AttrKind::U8)?[0])
    }

    /// A `u8` attribute read as a boolean (non-zero is true).
    pub fn as_bool(&self) -> Result<bool> {
        Ok(self.as_u8()? != 0)
    }

    pub fn as_u16(&self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.scalar(AttrKind::U16)?))
    }

    pub fn as_u32(&self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.scalar(AttrKind::U32)?))
    }

    /// A `u32` attribute reinterpreted as signed.
    pub fn as_i32(&self) -> Result<i32> {
        Ok(i32::from_be_bytes(self.scalar(AttrKind::U32)?))
    }

    pub fn as_u64(&self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.scalar(AttrKind::U64)?))
    }

    /// A `u64` attribute reinterpreted as signed.
    pub fn as_i64(&self) -> Result<i64> {
        Ok(i64::from_be_bytes(self.scalar(AttrKind::U64)?))
    }

    pub fn as_f64(&self) -> Result<f64> {
        Ok(f64::from_bits(u64::from_be_bytes(
            self.scalar(AttrKind::Double)?,
        )))
    }

    /// String payload without its NUL terminator.
    pub fn as_str(&self) -> Result<&'a str> {
        self.expect_kind(AttrKind::String)?;
        match self.data().split_last() {
            Some((0, text)) => Ok(std::str::from_utf8(text)?),
            _ => Err(BlobError::MissingTerminator),
        }
    }

    /// Iterate the attributes nested in a container.
    pub fn children(&self) -> Result<AttrIter<'a>> {
        let kind = self.kind()?;
        if !kind.is_container() {
            return Err(BlobError::NotAContainer(kind));
        }
        Ok(AttrIter::new(self.data()))
    }
}

fn parse_name(payload: &[u8]) -> Result<(&str, usize)> {
    if payload.len() < 2 {
        return Err(BlobError::Truncated {
            needed: 2,
            available: payload.len(),
        });
    }
    let name_len = u16::from_be_bytes([payload[0], payload[1]]) as usize;
    let header_len = align4(2 + name_len + 1);
    if payload.len() < header_len {
        return Err(BlobError::Truncated {
            needed: header_len,
            available: payload.len(),
        });
    }
    if payload[2 + name_len] != 0 {
        return Err(BlobError::MissingTerminator);
    }
    let name = std::str::from_utf8(&payload[2..2 + name_len])?;
    Ok((name, header_len))
}

impl fmt::Debug for Attr<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attr")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("len", &self.len())
            .field("extended", &self.extended)
            .finish()
    }
}

/// Iterator over consecutive attributes in a byte region.
///
/// Stops after the first decode error.
#[derive(Debug, Clone)]
pub struct AttrIter<'a> {
    rest: &'a [u8],
}

impl<'a> AttrIter<'a> {
    /// Iterate the attributes laid out back to back in `src`.
    pub fn new(src: &'a [u8]) -> Self {
        Self { rest: src }
    }
}

impl<'a> Iterator for AttrIter<'a> {
    type Item = Result<Attr<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.is_empty() {
            return None;
        }
        match Attr::parse(self.rest) {
            Ok(attr) => {
                let step = attr.padded_len().min(self.rest.len());
                self.rest = &self.rest[step..];
                Some(Ok(attr))
            }
            Err(err) => {
                self.rest = &[];
                Some(Err(err))
            }
        }
    }
}
