//! Attribute kind ids.
//!
//! The id occupies six bits of the header word, so ids 0-63 are encodable.
//! Ids 9-63 are reserved and rejected by the decoder; larger ids cannot be
//! represented at all.

use std::fmt;

use crate::error::{BlobError, Result};

/// Largest id the header can carry.
pub const MAX_KIND_ID: u8 = 0x3f;

/// Semantic type of an attribute payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AttrKind {
    /// Untyped container (the buffer head) or JSON `null` when empty.
    Unspec = 0,
    /// Ordered container of unnamed attributes.
    Array = 1,
    /// Container of named attributes.
    Table = 2,
    /// NUL-terminated UTF-8 text.
    String = 3,
    U64 = 4,
    U32 = 5,
    U16 = 6,
    /// Also used for booleans.
    U8 = 7,
    /// IEEE 754 binary64.
    Double = 8,
}

impl AttrKind {
    /// Resolve a header id to a known kind.
    ///
    /// Fails with [`BlobError::InvalidKind`] for ids that do not fit the
    /// header, and [`BlobError::UnknownKind`] for reserved ones.
    pub fn from_id(id: u8) -> Result<Self> {
        match id {
            0 => Ok(Self::Unspec),
            1 => Ok(Self::Array),
            2 => Ok(Self::Table),
            3 => Ok(Self::String),
            4 => Ok(Self::U64),
            5 => Ok(Self::U32),
            6 => Ok(Self::U16),
            7 => Ok(Self::U8),
            8 => Ok(Self::Double),
            other if other > MAX_KIND_ID => Err(BlobError::InvalidKind(other)),
            other => Err(BlobError::UnknownKind(other)),
        }
    }

    /// The header id of this kind.
    pub fn id(self) -> u8 {
        self as u8
    }

    /// Fixed payload width for scalar kinds, `None` for variable-length kinds.
    pub fn scalar_width(self) -> Option<usize> {
        match self {
            Self::U8 => Some(1),
            Self::U16 => Some(2),
            Self::U32 => Some(4),
            Self::U64 | Self::Double => Some(8),
            _ => None,
        }
    }

    /// Returns true if attributes of this kind hold child attributes.
    pub fn is_container(self) -> bool {
        matches!(self, Self::Unspec | Self::Array | Self::Table)
    }

    /// Human-readable kind name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Unspec => "unspec",
            Self::Array => "array",
            Self::Table => "table",
            Self::String => "string",
            Self::U64 => "u64",
            Self::U32 => "u32",
            Self::U16 => "u16",
            Self::U8 => "u8",
            Self::Double => "double",
        }
    }
}

impl TryFrom<u8> for AttrKind {
    type Error = BlobError;

    fn try_from(id: u8) -> Result<Self> {
        Self::from_id(id)
    }
}

impl fmt::Display for AttrKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
