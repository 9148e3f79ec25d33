//! Encoding of arbitrary values into attribute buffers.
//!
//! A value takes part by implementing [`Marshal`], which classifies it into
//! one [`Shape`]. The [`Marshaler`] walks shapes recursively:
//!
//! | Shape | Written as |
//! |-------|------------|
//! | `Bool` | `u8` 0/1 |
//! | `Signed` / `Unsigned` | `u64` (signed values two's complement) |
//! | `Float` | `double` |
//! | `Text` | `string` |
//! | `Sequence` | array of unnamed members |
//! | `Mapping` | table keyed by the stringified keys |
//! | `Record` | table of fields in declaration order |
//! | `Absent` | nothing |
//!
//! Integers are widened on the wire; decoders read 64 bits and narrow.

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt::Display;
use std::rc::Rc;
use std::sync::Arc;

use tracing::debug;

use crate::buffer::Buffer;
use crate::error::{BlobError, Result};

/// Default recursion bound of the marshaler.
pub const DEFAULT_MAX_DEPTH: usize = 64;

/// Classification of a value for encoding.
pub enum Shape<'a> {
    /// Nothing is written; the key is left out of its table.
    Absent,
    Bool(bool),
    Signed(i64),
    Unsigned(u64),
    Float(f64),
    Text(Cow<'a, str>),
    /// Ordered members, written unnamed.
    Sequence(Box<dyn Iterator<Item = &'a dyn Marshal> + 'a>),
    /// Key/value entries, written under their keys.
    Mapping(Box<dyn Iterator<Item = (Cow<'a, str>, &'a dyn Marshal)> + 'a>),
    /// Declared fields with their external names.
    Record(Vec<Field<'a>>),
    /// A value with no wire representation; encoding fails.
    Unsupported(&'static str),
}

/// A value that can be written into a [`Buffer`].
pub trait Marshal {
    fn shape(&self) -> Shape<'_>;
}

/// One field of a [`Shape::Record`].
pub struct Field<'a> {
    name: &'a str,
    value: &'a dyn Marshal,
    omit: bool,
}

impl<'a> Field<'a> {
    /// A field written under `name`.
    pub fn new(name: &'a str, value: &'a dyn Marshal) -> Self {
        Self {
            name,
            value,
            omit: false,
        }
    }

    /// Write the field under an external name instead of its declared one.
    pub fn rename(mut self, name: &'a str) -> Self {
        self.name = name;
        self
    }

    /// Never write this field.
    pub fn omit(mut self) -> Self {
        self.omit = true;
        self
    }

    /// The name the field is written under.
    pub fn name(&self) -> &'a str {
        self.name
    }

    pub fn is_omitted(&self) -> bool {
        self.omit
    }
}

/// Recursive encoder from [`Marshal`] values into buffers.
#[derive(Debug, Clone, Copy)]
pub struct Marshaler {
    max_depth: usize,
}

impl Marshaler {
    /// A marshaler with the default recursion bound.
    pub fn new() -> Self {
        Self::with_max_depth(DEFAULT_MAX_DEPTH)
    }

    /// A marshaler that fails with [`BlobError::TooDeep`] past `max_depth`
    /// levels of nesting.
    pub fn with_max_depth(max_depth: usize) -> Self {
        Self { max_depth }
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Encode `value` as the attribute `name`.
    ///
    /// An empty name writes an unnamed attribute, except that mappings and
    /// records given an empty name have their entries spread into the
    /// currently open container (the head when nothing is open).
    ///
    /// On error the buffer is restored to its state before the call.
    pub fn encode(&self, buf: &mut Buffer, name: &str, value: &dyn Marshal) -> Result<()> {
        let checkpoint = buf.checkpoint();
        let result = match value.shape() {
            Shape::Mapping(entries) if name.is_empty() => self.encode_entries(buf, entries, 1),
            Shape::Record(fields) if name.is_empty() => self.encode_fields(buf, fields, 1),
            shape => self.encode_shape(buf, name, shape, 0),
        };
        if let Err(err) = &result {
            debug!(name, %err, "marshal failed; buffer rolled back");
            buf.rollback(checkpoint);
        }
        result
    }

    fn encode_value(
        &self,
        buf: &mut Buffer,
        name: &str,
        value: &dyn Marshal,
        depth: usize,
    ) -> Result<()> {
        if depth > self.max_depth {
            return Err(BlobError::TooDeep {
                max: self.max_depth,
            });
        }
        self.encode_shape(buf, name, value.shape(), depth)
    }

    fn encode_shape(&self, buf: &mut Buffer, name: &str, shape: Shape<'_>, depth: usize) -> Result<()> {
        match shape {
            Shape::Absent => Ok(()),
            Shape::Bool(value) => buf.add_bool(name, value),
            Shape::Signed(value) => buf.add_u64(name, value as u64),
            Shape::Unsigned(value) => buf.add_u64(name, value),
            Shape::Float(value) => buf.add_double(name, value),
            Shape::Text(value) => buf.add_string(name, &value),
            Shape::Sequence(items) => {
                let cookie = buf.open_nested(name, true)?;
                for item in items {
                    self.encode_value(buf, "", item, depth + 1)?;
                }
                buf.close_nested(cookie)
            }
            Shape::Mapping(entries) => {
                let cookie = buf.open_nested(name, false)?;
                self.encode_entries(buf, entries, depth + 1)?;
                buf.close_nested(cookie)
            }
            Shape::Record(fields) => {
                let cookie = buf.open_nested(name, false)?;
                self.encode_fields(buf, fields, depth + 1)?;
                buf.close_nested(cookie)
            }
            Shape::Unsupported(type_name) => Err(BlobError::Unsupported(type_name)),
        }
    }

    fn encode_entries<'a>(
        &self,
        buf: &mut Buffer,
        entries: impl Iterator<Item = (Cow<'a, str>, &'a dyn Marshal)>,
        depth: usize,
    ) -> Result<()> {
        for (key, value) in entries {
            self.encode_value(buf, &key, value, depth)?;
        }
        Ok(())
    }

    fn encode_fields(&self, buf: &mut Buffer, fields: Vec<Field<'_>>, depth: usize) -> Result<()> {
        for field in fields.into_iter().filter(|field| !field.is_omitted()) {
            self.encode_value(buf, field.name, field.value, depth)?;
        }
        Ok(())
    }
}

impl Default for Marshaler {
    fn default() -> Self {
        Self::new()
    }
}

/// Encode `value` as attribute `name` with the default [`Marshaler`].
pub fn encode(buf: &mut Buffer, name: &str, value: &dyn Marshal) -> Result<()> {
    Marshaler::new().encode(buf, name, value)
}

impl Buffer {
    /// Encode any [`Marshal`] value as attribute `name`.
    pub fn add_object(&mut self, name: &str, value: &dyn Marshal) -> Result<()> {
        encode(self, name, value)
    }
}

impl Marshal for bool {
    fn shape(&self) -> Shape<'_> {
        Shape::Bool(*self)
    }
}

macro_rules! marshal_signed {
    ($($ty:ty),*) => {
        $(impl Marshal for $ty {
            fn shape(&self) -> Shape<'_> {
                Shape::Signed(i64::from(*self))
            }
        })*
    };
}

macro_rules! marshal_unsigned {
    ($($ty:ty),*) => {
        $(impl Marshal for $ty {
            fn shape(&self) -> Shape<'_> {
                Shape::Unsigned(u64::from(*self))
            }
        })*
    };
}

marshal_signed!(i8, i16, i32, i64);
marshal_unsigned!(u8, u16, u32, u64);

impl Marshal for isize {
    fn shape(&self) -> Shape<'_> {
        Shape::Signed(*self as i64)
    }
}

impl Marshal for usize {
    fn shape(&self) -> Shape<'_> {
        Shape::Unsigned(*self as u64)
    }
}

impl Marshal for f32 {
    fn shape(&self) -> Shape<'_> {
        Shape::Float(f64::from(*self))
    }
}

impl Marshal for f64 {
    fn shape(&self) -> Shape<'_> {
        Shape::Float(*self)
    }
}

impl Marshal for str {
    fn shape(&self) -> Shape<'_> {
        Shape::Text(Cow::Borrowed(self))
    }
}

impl Marshal for String {
    fn shape(&self) -> Shape<'_> {
        Shape::Text(Cow::Borrowed(self.as_str()))
    }
}

impl Marshal for char {
    fn shape(&self) -> Shape<'_> {
        Shape::Text(Cow::Owned(self.to_string()))
    }
}

impl<T: Marshal + ?Sized> Marshal for &T {
    fn shape(&self) -> Shape<'_> {
        (**self).shape()
    }
}

impl<T: Marshal + ?Sized> Marshal for Box<T> {
    fn shape(&self) -> Shape<'_> {
        (**self).shape()
    }
}

impl<T: Marshal + ?Sized> Marshal for Rc<T> {
    fn shape(&self) -> Shape<'_> {
        (**self).shape()
    }
}

impl<T: Marshal + ?Sized> Marshal for Arc<T> {
    fn shape(&self) -> Shape<'_> {
        (**self).shape()
    }
}

impl<T: Marshal> Marshal for Option<T> {
    fn shape(&self) -> Shape<'_> {
        match self {
            Some(value) => value.shape(),
            None => Shape::Absent,
        }
    }
}

impl<T: Marshal> Marshal for [T] {
    fn shape(&self) -> Shape<'_> {
        Shape::Sequence(Box::new(self.iter().map(|item| item as &dyn Marshal)))
    }
}

impl<T: Marshal, const N: usize> Marshal for [T; N] {
    fn shape(&self) -> Shape<'_> {
        self.as_slice().shape()
    }
}

impl<T: Marshal> Marshal for Vec<T> {
    fn shape(&self) -> Shape<'_> {
        self.as_slice().shape()
    }
}

impl<T: Marshal> Marshal for VecDeque<T> {
    fn shape(&self) -> Shape<'_> {
        Shape::Sequence(Box::new(self.iter().map(|item| item as &dyn Marshal)))
    }
}

impl<K: Display, V: Marshal, S> Marshal for HashMap<K, V, S> {
    fn shape(&self) -> Shape<'_> {
        Shape::Mapping(Box::new(
            self.iter()
                .map(|(key, value)| (Cow::Owned(key.to_string()), value as &dyn Marshal)),
        ))
    }
}

impl<K: Display, V: Marshal> Marshal for BTreeMap<K, V> {
    fn shape(&self) -> Shape<'_> {
        Shape::Mapping(Box::new(
            self.iter()
                .map(|(key, value)| (Cow::Owned(key.to_string()), value as &dyn Marshal)),
        ))
    }
}

impl Marshal for serde_json::Value {
    fn shape(&self) -> Shape<'_> {
        use serde_json::Value;

        match self {
            Value::Null => Shape::Absent,
            Value::Bool(value) => Shape::Bool(*value),
            Value::Number(number) => {
                if let Some(value) = number.as_i64() {
                    Shape::Signed(value)
                } else if let Some(value) = number.as_u64() {
                    Shape::Unsigned(value)
                } else {
                    Shape::Float(number.as_f64().unwrap_or(f64::NAN))
                }
            }
            Value::String(text) => Shape::Text(Cow::Borrowed(text.as_str())),
            Value::Array(items) => {
                Shape::Sequence(Box::new(items.iter().map(|item| item as &dyn Marshal)))
            }
            Value::Object(map) => Shape::Mapping(Box::new(
                map.iter()
                    .map(|(key, value)| (Cow::Borrowed(key.as_str()), value as &dyn Marshal)),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attr::Attr;
    use crate::kind::AttrKind;

    struct Account {
        user_name: String,
        age: u32,
        admin: bool,
        password: String,
        nickname: Option<String>,
        scores: Vec<i64>,
    }

    impl Marshal for Account {
        fn shape(&self) -> Shape<'_> {
            Shape::Record(vec![
                Field::new("user_name", &self.user_name).rename("name"),
                Field::new("age", &self.age),
                Field::new("admin", &self.admin),
                Field::new("password", &self.password).omit(),
                Field::new("nickname", &self.nickname),
                Field::new("scores", &self.scores),
            ])
        }
    }

    fn account() -> Account {
        Account {
            user_name: "abc".to_string(),
            age: 33,
            admin: true,
            password: "hunter2".to_string(),
            nickname: None,
            scores: vec![-1, 2],
        }
    }

    fn members(buf: &Buffer) -> Vec<Attr<'_>> {
        buf.head()
            .children()
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap()
    }

    #[test]
    fn scalars_are_classified() {
        let mut buf = Buffer::new();
        encode(&mut buf, "flag", &false).unwrap();
        encode(&mut buf, "small", &7u8).unwrap();
        encode(&mut buf, "neg", &-5i32).unwrap();
        encode(&mut buf, "ratio", &0.5f32).unwrap();
        encode(&mut buf, "text", &"hi").unwrap();
        encode(&mut buf, "letter", &'z').unwrap();

        let attrs = members(&buf);
        assert_eq!(attrs[0].kind().unwrap(), AttrKind::U8);
        assert!(!attrs[0].as_bool().unwrap());
        assert_eq!(attrs[1].kind().unwrap(), AttrKind::U64);
        assert_eq!(attrs[1].as_u64().unwrap(), 7);
        assert_eq!(attrs[2].as_i64().unwrap(), -5);
        assert_eq!(attrs[3].as_f64().unwrap(), 0.5);
        assert_eq!(attrs[4].as_str().unwrap(), "hi");
        assert_eq!(attrs[5].as_str().unwrap(), "z");
    }

    #[test]
    fn record_fields_follow_declaration_order() {
        let mut buf = Buffer::new();
        encode(&mut buf, "account", &account()).unwrap();

        let attrs = members(&buf);
        assert_eq!(attrs.len(), 1);
        assert_eq!(attrs[0].kind().unwrap(), AttrKind::Table);

        let fields: Vec<_> = attrs[0].children().unwrap().collect::<Result<_>>().unwrap();
        let names: Vec<_> = fields.iter().map(|f| f.name()).collect();
        // renamed, password omitted, absent nickname skipped
        assert_eq!(names, vec!["name", "age", "admin", "scores"]);
        assert_eq!(fields[0].as_str().unwrap(), "abc");
        assert_eq!(fields[1].as_u64().unwrap(), 33);
        assert!(fields[2].as_bool().unwrap());

        let scores: Vec<i64> = fields[3]
            .children()
            .unwrap()
            .map(|attr| attr.unwrap().as_i64().unwrap())
            .collect();
        assert_eq!(scores, vec![-1, 2]);
    }

    #[test]
    fn field_builder_tracks_name_and_omission() {
        let secret = "hunter2".to_string();
        let field = Field::new("password", &secret);
        assert_eq!(field.name(), "password");
        assert!(!field.is_omitted());

        let field = field.rename("pw").omit();
        assert_eq!(field.name(), "pw");
        assert!(field.is_omitted());
    }

    #[test]
    fn unnamed_record_spreads_into_head() {
        let mut buf = Buffer::new();
        buf.add_object("", &account()).unwrap();

        let names: Vec<_> = members(&buf).iter().map(|a| a.name()).collect();
        assert_eq!(names, vec!["name", "age", "admin", "scores"]);
    }

    #[test]
    fn records_inside_sequences_are_unnamed_tables() {
        let people = vec![account(), account()];
        let mut buf = Buffer::new();
        encode(&mut buf, "people", &people).unwrap();

        let list = members(&buf)[0];
        assert_eq!(list.kind().unwrap(), AttrKind::Array);
        for entry in list.children().unwrap() {
            let entry = entry.unwrap();
            assert_eq!(entry.kind().unwrap(), AttrKind::Table);
            assert!(!entry.is_named());
            assert_eq!(entry.children().unwrap().count(), 4);
        }
    }

    #[test]
    fn unnamed_sequence_keeps_order() {
        let mut buf = Buffer::new();
        encode(&mut buf, "", &[1u64, 2, 3]).unwrap();

        let array = members(&buf)[0];
        assert_eq!(array.kind().unwrap(), AttrKind::Array);
        assert!(!array.is_named());
        let values: Vec<u64> = array
            .children()
            .unwrap()
            .map(|attr| attr.unwrap().as_u64().unwrap())
            .collect();
        assert_eq!(values, vec![1, 2, 3]);
    }

    #[test]
    fn mapping_keys_are_stringified() {
        let mut map = BTreeMap::new();
        map.insert(10u32, "ten");
        map.insert(2u32, "two");

        let mut buf = Buffer::new();
        encode(&mut buf, "numbers", &map).unwrap();

        let table = members(&buf)[0];
        let entries: Vec<_> = table.children().unwrap().collect::<Result<_>>().unwrap();
        assert_eq!(entries[0].name(), "2");
        assert_eq!(entries[0].as_str().unwrap(), "two");
        assert_eq!(entries[1].name(), "10");
    }

    #[test]
    fn encoding_is_idempotent() {
        let value = account();
        let mut first = Buffer::new();
        let mut second = Buffer::new();
        encode(&mut first, "account", &value).unwrap();
        encode(&mut second, "account", &value).unwrap();
        assert_eq!(first.as_bytes(), second.as_bytes());

        let mut map = HashMap::new();
        map.insert("a", 1u8);
        map.insert("b", 2u8);
        map.insert("c", 3u8);
        let mut first = Buffer::new();
        let mut second = Buffer::new();
        encode(&mut first, "", &map).unwrap();
        encode(&mut second, "", &map).unwrap();
        assert_eq!(first.as_bytes(), second.as_bytes());
    }

    struct Opaque;

    impl Marshal for Opaque {
        fn shape(&self) -> Shape<'_> {
            Shape::Unsupported("Opaque")
        }
    }

    #[test]
    fn unsupported_value_fails_and_rolls_back() {
        let mut buf = Buffer::new();
        buf.add_string("keep", "me").unwrap();
        let before = buf.to_bytes();

        let values: Vec<Box<dyn Marshal>> = vec![Box::new(1u8), Box::new(Opaque)];
        let err = encode(&mut buf, "list", &values).unwrap_err();

        assert!(matches!(err, BlobError::Unsupported("Opaque")));
        assert_eq!(buf.to_bytes(), before);
        assert_eq!(buf.depth(), 0);
    }

    struct Endless;

    impl Marshal for Endless {
        fn shape(&self) -> Shape<'_> {
            Shape::Sequence(Box::new(std::iter::once(self as &dyn Marshal)))
        }
    }

    #[test]
    fn self_reference_hits_depth_bound() {
        let mut buf = Buffer::new();
        let err = Marshaler::with_max_depth(8)
            .encode(&mut buf, "loop", &Endless)
            .unwrap_err();

        assert!(matches!(err, BlobError::TooDeep { max: 8 }));
        assert!(buf.is_empty());
        assert_eq!(buf.depth(), 0);
    }

    #[test]
    fn depth_bound_allows_exact_depth() {
        // "a" -> [ [ [ 1 ] ] ]: members sit at depth 3
        let nested = vec![vec![vec![1u8]]];
        let mut buf = Buffer::new();
        Marshaler::with_max_depth(3)
            .encode(&mut buf, "a", &nested)
            .unwrap();
        assert!(Marshaler::with_max_depth(2)
            .encode(&mut buf, "b", &nested)
            .is_err());
    }

    #[test]
    fn json_values_marshal() {
        let value = serde_json::json!({
            "name": "abc",
            "big": 5_000_000_000u64,
            "ratio": 1.5,
            "tags": ["x", "y"],
            "gone": null
        });

        let mut buf = Buffer::new();
        encode(&mut buf, "", &value).unwrap();

        let attrs = members(&buf);
        let names: Vec<_> = attrs.iter().map(|a| a.name()).collect();
        assert_eq!(names, vec!["name", "big", "ratio", "tags"]);
        assert_eq!(attrs[1].as_u64().unwrap(), 5_000_000_000);
        assert_eq!(attrs[2].as_f64().unwrap(), 1.5);
        assert_eq!(attrs[3].children().unwrap().count(), 2);
    }
}
