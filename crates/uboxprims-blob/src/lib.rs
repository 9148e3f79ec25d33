//! Self-describing typed attribute buffers.
//!
//! Every attribute is framed with:
//! - A 4-byte big-endian header word: extended flag, named flag, 6-bit kind id
//!   and 24-bit payload length
//! - An optional second length word when the payload outgrows 24 bits
//! - An optional name header (u16 length, bytes, NUL)
//! - The value bytes, zero-padded to a 4-byte boundary
//!
//! Tables and arrays nest attributes; a [`Buffer`] writes them with an
//! open/close span protocol and exposes the whole message as one head
//! attribute. Arbitrary values are written through [`Marshal`], and the
//! [`json`] module bridges to and from JSON text.

pub mod attr;
pub mod buffer;
pub mod error;
pub mod json;
pub mod kind;
pub mod marshal;

pub use attr::{
    align4, Attr, AttrIter, ALIGN, EXTENDED_HEADER_SIZE, HEADER_SIZE, MAX_COMPACT_LEN,
    MAX_EXTENDED_LEN, MAX_NAME_LEN,
};
pub use buffer::{Buffer, BufferConfig, Cookie, DEFAULT_MAX_BUFFER};
pub use error::{BlobError, Result};
pub use json::from_json_text;
pub use kind::AttrKind;
pub use marshal::{encode, Field, Marshal, Marshaler, Shape, DEFAULT_MAX_DEPTH};
