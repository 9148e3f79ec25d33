//! JSON bridge.
//!
//! Rendering maps kinds onto JSON as follows: `u8` becomes a boolean, `u16`
//! a number, `u32` and `u64` signed numbers, `double` a number (`null` when
//! not finite), `string` a string, tables objects, arrays arrays, and an
//! empty `unspec` attribute `null`.
//!
//! Parsing goes the other way with one lossy step: JSON integers are stored
//! as 32-bit attributes saturated to the `i32` range.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Number, Value};

use crate::attr::Attr;
use crate::buffer::Buffer;
use crate::error::{BlobError, Result};
use crate::kind::AttrKind;

/// Nesting bound for containers, both rendering and parsing.
const MAX_JSON_DEPTH: usize = 128;

impl<'a> Attr<'a> {
    /// Render as JSON text.
    ///
    /// With `as_list` the attribute must be a container and its members are
    /// rendered as an object (an array for `Array`). Without it the attribute
    /// is rendered as a single element: `"name":value` when named, the bare
    /// value otherwise.
    pub fn to_json_text(&self, as_list: bool) -> Result<String> {
        if as_list {
            let kind = self.kind()?;
            if !kind.is_container() {
                return Err(BlobError::NotAContainer(kind));
            }
            return Ok(serde_json::to_string(&container_value(self, kind, 0)?)?);
        }

        let value = serde_json::to_string(&self.to_json_value()?)?;
        if self.is_named() {
            Ok(format!("{}:{}", serde_json::to_string(self.name())?, value))
        } else {
            Ok(value)
        }
    }

    /// Render the value alone, without its name.
    pub fn to_json_value_text(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.to_json_value()?)?)
    }

    /// The attribute value as a JSON tree.
    pub fn to_json_value(&self) -> Result<Value> {
        json_value(self, 0)
    }

    /// Decode the attribute into `T` through its JSON form.
    ///
    /// Tables deserialize into structs and maps, arrays into sequences.
    pub fn unmarshal<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.to_json_value()?)?)
    }
}

fn json_value(attr: &Attr<'_>, depth: usize) -> Result<Value> {
    let kind = attr.kind()?;
    let value = match kind {
        AttrKind::Unspec if attr.data().is_empty() => Value::Null,
        AttrKind::Unspec | AttrKind::Table | AttrKind::Array => {
            container_value(attr, kind, depth)?
        }
        AttrKind::String => Value::String(attr.as_str()?.to_owned()),
        AttrKind::U8 => Value::Bool(attr.as_bool()?),
        AttrKind::U16 => Value::from(attr.as_u16()?),
        AttrKind::U32 => Value::from(attr.as_i32()?),
        AttrKind::U64 => Value::from(attr.as_i64()?),
        AttrKind::Double => Number::from_f64(attr.as_f64()?)
            .map(Value::Number)
            .unwrap_or(Value::Null),
    };
    Ok(value)
}

fn container_value(attr: &Attr<'_>, kind: AttrKind, depth: usize) -> Result<Value> {
    if depth >= MAX_JSON_DEPTH {
        return Err(BlobError::TooDeep {
            max: MAX_JSON_DEPTH,
        });
    }

    if kind == AttrKind::Array {
        let items = attr
            .children()?
            .map(|child| json_value(&child?, depth + 1))
            .collect::<Result<Vec<_>>>()?;
        return Ok(Value::Array(items));
    }

    let mut map = Map::new();
    for child in attr.children()? {
        let child = child?;
        map.insert(child.name().to_owned(), json_value(&child, depth + 1)?);
    }
    Ok(Value::Object(map))
}

/// Build a buffer from the members of a JSON object.
pub fn from_json_text(text: &str) -> Result<Buffer> {
    let mut buf = Buffer::new();
    buf.add_json_str(text)?;
    Ok(buf)
}

impl Buffer {
    /// Parse `text` as a JSON object and append its members.
    ///
    /// On error nothing is appended.
    pub fn add_json_str(&mut self, text: &str) -> Result<()> {
        let value: Value = serde_json::from_str(text)?;
        self.add_json_value(&value)
    }

    /// Serialize `value` to JSON and append the members of the result.
    pub fn add_json_from<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.add_json_value(&value)
    }

    /// Append the members of a JSON object.
    ///
    /// Containers nested deeper than 128 levels fail with
    /// [`BlobError::TooDeep`]; on error nothing is appended.
    pub fn add_json_value(&mut self, value: &Value) -> Result<()> {
        let Value::Object(members) = value else {
            return Err(BlobError::JsonNotObject);
        };

        // members sit one level below the innermost open container
        let depth = self.depth() + 1;
        let checkpoint = self.checkpoint();
        let result = members
            .iter()
            .try_for_each(|(name, value)| self.put_json(name, value, depth));
        if result.is_err() {
            self.rollback(checkpoint);
        }
        result
    }

    fn put_json(&mut self, name: &str, value: &Value, depth: usize) -> Result<()> {
        if matches!(value, Value::Array(_) | Value::Object(_)) && depth >= MAX_JSON_DEPTH {
            return Err(BlobError::TooDeep {
                max: MAX_JSON_DEPTH,
            });
        }
        match value {
            Value::Null => self.add_field(name, AttrKind::Unspec, &[]),
            Value::Bool(flag) => self.add_bool(name, *flag),
            Value::Number(number) => {
                if let Some(int) = number.as_i64() {
                    self.add_u32(name, saturate_i32(int) as u32)
                } else if number.is_u64() {
                    self.add_u32(name, i32::MAX as u32)
                } else {
                    self.add_double(name, number.as_f64().unwrap_or_default())
                }
            }
            Value::String(text) => self.add_string(name, text),
            Value::Array(items) => {
                let cookie = self.open_nested(name, true)?;
                for item in items {
                    self.put_json("", item, depth + 1)?;
                }
                self.close_nested(cookie)
            }
            Value::Object(members) => {
                let cookie = self.open_nested(name, false)?;
                for (key, member) in members {
                    self.put_json(key, member, depth + 1)?;
                }
                self.close_nested(cookie)
            }
        }
    }
}

fn saturate_i32(value: i64) -> i32 {
    value.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32
}
