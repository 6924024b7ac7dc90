// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Parser for the serialized property lists that coprocessors attach to
//! service announcements.
//!
//! A list starts with a [`PROPS_HEADER`] word followed by one item. Each item
//! is a 4-byte aligned [`ItemTag`] followed by its value.

use bitfield_struct::bitfield;
use thiserror::Error;

/// The first word of every property list.
pub const PROPS_HEADER: u32 = 0xd3;

/// The nesting limit for dictionaries and arrays.
pub const MAX_DEPTH: usize = 16;

#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct ItemTag {
    /// The value length in bytes, the entry count of a dictionary or array,
    /// or the value of a bool.
    #[bits(24)]
    pub size: u32,
    #[bits(5)]
    pub item_type: u8,
    #[bits(2)]
    _padding: u8,
    /// Set on the last entry of the enclosing container.
    pub last: bool,
}

wire_enum! {
    pub struct ItemType(u8) {
        DICTIONARY = 1,
        ARRAY = 2,
        INT64 = 4,
        STRING = 9,
        BLOB = 10,
        BOOL = 11,
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("invalid property list header {0:#x}")]
    InvalidHeader(u32),
    #[error("property list truncated at {offset:#x}, {len:#x} bytes needed")]
    Truncated { offset: usize, len: usize },
    #[error("unknown property type {0:?}")]
    UnknownType(ItemType),
    #[error("dictionary key has type {0:?}")]
    InvalidKey(ItemType),
    #[error("string at {0:#x} is not valid utf-8")]
    InvalidString(usize),
    #[error("property list nested too deeply")]
    TooDeep,
    #[error("property list is not a dictionary")]
    NotADictionary,
    #[error("missing property {0}")]
    MissingKey(&'static str),
    #[error("property {0} has the wrong type")]
    WrongType(&'static str),
}

/// A decoded property value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    Dictionary(Vec<(String, Value)>),
    Array(Vec<Value>),
    Int64(i64),
    String(String),
    Blob(Vec<u8>),
    Bool(bool),
}

impl Value {
    /// Looks up `key` if this is a dictionary. The first match wins.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Dictionary(entries) => entries.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::Int64(v) => Some(v),
            _ => None,
        }
    }
}

/// Parses a property list.
pub fn parse(data: &[u8]) -> Result<Value, Error> {
    let mut parser = Parser { data, pos: 0 };
    let header = parser.u32()?;
    if header != PROPS_HEADER {
        return Err(Error::InvalidHeader(header));
    }
    parser.item(0)
}

struct Parser<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], Error> {
        let offset = self.pos;
        let data = offset
            .checked_add(len)
            .and_then(|end| self.data.get(offset..end))
            .ok_or(Error::Truncated { offset, len })?;
        self.pos += len;
        Ok(data)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], Error> {
        let mut v = [0; N];
        v.copy_from_slice(self.take(N)?);
        Ok(v)
    }

    fn u32(&mut self) -> Result<u32, Error> {
        self.pos = self.pos.next_multiple_of(4);
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn string(&mut self, len: usize) -> Result<String, Error> {
        let offset = self.pos;
        let bytes = self.take(len)?;
        let bytes = match bytes.iter().position(|&b| b == 0) {
            Some(nul) => &bytes[..nul],
            None => bytes,
        };
        String::from_utf8(bytes.to_vec()).map_err(|_| Error::InvalidString(offset))
    }

    fn item(&mut self, depth: usize) -> Result<Value, Error> {
        if depth > MAX_DEPTH {
            return Err(Error::TooDeep);
        }
        let tag = ItemTag::from(self.u32()?);
        let size = tag.size() as usize;
        let value = match ItemType(tag.item_type()) {
            ItemType::DICTIONARY => {
                let mut entries = Vec::new();
                for _ in 0..size {
                    let key_tag = ItemTag::from(self.u32()?);
                    let key_type = ItemType(key_tag.item_type());
                    if key_type != ItemType::STRING {
                        return Err(Error::InvalidKey(key_type));
                    }
                    let key = self.string(key_tag.size() as usize)?;
                    let value = self.item(depth + 1)?;
                    entries.push((key, value));
                }
                Value::Dictionary(entries)
            }
            ItemType::ARRAY => {
                let mut items = Vec::new();
                for _ in 0..size {
                    items.push(self.item(depth + 1)?);
                }
                Value::Array(items)
            }
            ItemType::INT64 => {
                self.pos = self.pos.next_multiple_of(4);
                Value::Int64(i64::from_le_bytes(self.array()?))
            }
            ItemType::STRING => Value::String(self.string(size)?),
            ItemType::BLOB => Value::Blob(self.take(size)?.to_vec()),
            ItemType::BOOL => Value::Bool(size != 0),
            ty => return Err(Error::UnknownType(ty)),
        };
        Ok(value)
    }
}

/// The identity a coprocessor gives a service in its announcement.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServiceInit {
    /// `EPICName`.
    pub name: Option<String>,
    /// `EPICProviderClass`, used to match the service.
    pub class: String,
    /// `EPICUnit`.
    pub unit: Option<i64>,
}

/// Extracts the service identity from an announcement's property list.
pub fn parse_service_init(value: &Value) -> Result<ServiceInit, Error> {
    if !matches!(value, Value::Dictionary(_)) {
        return Err(Error::NotADictionary);
    }
    let class = value
        .get("EPICProviderClass")
        .ok_or(Error::MissingKey("EPICProviderClass"))?
        .as_str()
        .ok_or(Error::WrongType("EPICProviderClass"))?
        .to_owned();
    let name = match value.get("EPICName") {
        Some(v) => Some(v.as_str().ok_or(Error::WrongType("EPICName"))?.to_owned()),
        None => None,
    };
    let unit = match value.get("EPICUnit") {
        Some(v) => Some(v.as_i64().ok_or(Error::WrongType("EPICUnit"))?),
        None => None,
    };
    Ok(ServiceInit { name, class, unit })
}

/// Serializes property lists. Coprocessors never receive these, so this only
/// exists to build announcements in tests.
#[cfg(any(test, feature = "test_util"))]
pub mod builder {
    use super::ItemTag;
    use super::ItemType;
    use super::Value;
    use super::PROPS_HEADER;

    pub fn build(value: &Value) -> Vec<u8> {
        let mut out = PROPS_HEADER.to_le_bytes().to_vec();
        item(&mut out, value, true);
        out
    }

    fn pad(out: &mut Vec<u8>) {
        out.resize(out.len().next_multiple_of(4), 0);
    }

    fn tag(out: &mut Vec<u8>, ty: ItemType, size: usize, last: bool) {
        pad(out);
        let tag = ItemTag::new()
            .with_size(size as u32)
            .with_item_type(ty.0)
            .with_last(last);
        out.extend_from_slice(&u32::from(tag).to_le_bytes());
    }

    fn item(out: &mut Vec<u8>, value: &Value, last: bool) {
        match value {
            Value::Dictionary(entries) => {
                tag(out, ItemType::DICTIONARY, entries.len(), last);
                for (i, (key, value)) in entries.iter().enumerate() {
                    let last = i + 1 == entries.len();
                    tag(out, ItemType::STRING, key.len() + 1, false);
                    out.extend_from_slice(key.as_bytes());
                    out.push(0);
                    item(out, value, last);
                }
            }
            Value::Array(items) => {
                tag(out, ItemType::ARRAY, items.len(), last);
                for (i, value) in items.iter().enumerate() {
                    item(out, value, i + 1 == items.len());
                }
            }
            Value::Int64(v) => {
                tag(out, ItemType::INT64, 8, last);
                out.extend_from_slice(&v.to_le_bytes());
            }
            Value::String(s) => {
                tag(out, ItemType::STRING, s.len() + 1, last);
                out.extend_from_slice(s.as_bytes());
                out.push(0);
            }
            Value::Blob(b) => {
                tag(out, ItemType::BLOB, b.len(), last);
                out.extend_from_slice(b);
            }
            Value::Bool(b) => tag(out, ItemType::BOOL, (*b).into(), last),
        }
    }
}
