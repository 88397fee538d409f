//! # Wire codec
//!
//! Byte level encoding of the values exchanged over a message channel. The
//! layout follows the standard message codec used by the controller runtime:
//! a one byte type tag followed by the payload, little-endian numbers, and a
//! variable length size prefix for strings and containers.
//!
//! Tags 0..=13 are the primitive/container kinds handled here. Tags from 128
//! upwards belong to the structured types in [`custom`].

pub mod custom;

pub use custom::{CustomTag, CustomValue};

use thiserror::Error;

const NULL: u8 = 0;
const TRUE: u8 = 1;
const FALSE: u8 = 2;
const INT32: u8 = 3;
const INT64: u8 = 4;
const FLOAT64: u8 = 6;
const STRING: u8 = 7;
const UINT8_LIST: u8 = 8;
const LIST: u8 = 12;
const MAP: u8 = 13;

/// One byte sizes stop here, 254 and 255 announce u16 and u32 sizes.
const SIZE_U16: u8 = 254;
const SIZE_U32: u8 = 255;

/// Deepest nesting of containers and structured values a message may use.
pub const MAX_DEPTH: usize = 64;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodecError {
    #[error("Unexpected end of message at offset {0}")]
    UnexpectedEof(usize),

    #[error("Unknown type tag {0}")]
    UnknownTag(u8),

    #[error("String is not valid utf-8")]
    InvalidUtf8,

    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),

    #[error("Expected {expected}, found {found}")]
    TypeMismatch { expected: &'static str, found: &'static str },

    #[error("Missing required field '{field}' in {type_name}")]
    MissingField { type_name: &'static str, field: &'static str },

    #[error("Invalid {type_name} raw value {raw}")]
    InvalidEnum { type_name: &'static str, raw: i64 },

    #[error("Missing argument at position {0}")]
    MissingArgument(usize),

    #[error("Message nests deeper than {0} levels")]
    TooDeep(usize),
}

/// A decoded message value.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Float64(f64),
    String(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(Vec<(Value, Value)>),
    Custom(CustomValue),
}

impl Value {
    /// Kind name used in decode errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int32(_) => "int32",
            Value::Int64(_) => "int64",
            Value::Float64(_) => "float64",
            Value::String(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Custom(custom) => custom.tag().type_name(),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn mismatch(&self, expected: &'static str) -> CodecError {
        CodecError::TypeMismatch { expected, found: self.kind() }
    }

    /// Integer value accepting either wire width.
    pub fn as_i64(&self) -> Result<i64, CodecError> {
        match self {
            Value::Int32(v) => Ok(i64::from(*v)),
            Value::Int64(v) => Ok(*v),
            other => Err(other.mismatch("integer")),
        }
    }
}

/// Encodes a single value into a standalone message.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut writer = Writer::default();
    writer.write_value(value);
    writer.buf
}

/// Decodes a standalone message. The whole buffer must be consumed.
pub fn decode(data: &[u8]) -> Result<Value, CodecError> {
    let mut reader = Reader { data, pos: 0, depth: 0 };
    let value = reader.read_value()?;

    let remaining = data.len() - reader.pos;
    if remaining > 0 {
        return Err(CodecError::TrailingBytes(remaining));
    }

    Ok(value)
}

#[derive(Default)]
struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn write_size(&mut self, size: usize) {
        if size < SIZE_U16 as usize {
            self.buf.push(size as u8);
        } else if size <= u16::MAX as usize {
            self.buf.push(SIZE_U16);
            self.buf.extend_from_slice(&(size as u16).to_le_bytes());
        } else {
            self.buf.push(SIZE_U32);
            self.buf.extend_from_slice(&(size as u32).to_le_bytes());
        }
    }

    fn align_to(&mut self, alignment: usize) {
        let rem = self.buf.len() % alignment;
        if rem != 0 {
            self.buf.resize(self.buf.len() + alignment - rem, 0);
        }
    }

    fn write_value(&mut self, value: &Value) {
        match value {
            Value::Null => self.buf.push(NULL),
            Value::Bool(true) => self.buf.push(TRUE),
            Value::Bool(false) => self.buf.push(FALSE),
            Value::Int32(v) => {
                self.buf.push(INT32);
                self.buf.extend_from_slice(&v.to_le_bytes());
            }
            Value::Int64(v) => {
                self.buf.push(INT64);
                self.buf.extend_from_slice(&v.to_le_bytes());
            }
            Value::Float64(v) => {
                self.buf.push(FLOAT64);
                self.align_to(8);
                self.buf.extend_from_slice(&v.to_le_bytes());
            }
            Value::String(s) => {
                self.buf.push(STRING);
                self.write_size(s.len());
                self.buf.extend_from_slice(s.as_bytes());
            }
            Value::Bytes(bytes) => {
                self.buf.push(UINT8_LIST);
                self.write_size(bytes.len());
                self.buf.extend_from_slice(bytes);
            }
            Value::List(items) => {
                self.buf.push(LIST);
                self.write_size(items.len());
                for item in items {
                    self.write_value(item);
                }
            }
            Value::Map(entries) => {
                self.buf.push(MAP);
                self.write_size(entries.len());
                for (key, value) in entries {
                    self.write_value(key);
                    self.write_value(value);
                }
            }
            Value::Custom(custom) => {
                self.buf.push(custom.tag().as_u8());
                self.write_value(&Value::List(custom.to_list()));
            }
        }
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    /// Values currently being read, outermost included.
    depth: usize,
}

impl<'a> Reader<'a> {
    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or(CodecError::UnexpectedEof(self.pos))?;

        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut array = [0; N];
        array.copy_from_slice(self.read_bytes(N)?);
        Ok(array)
    }

    fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.read_array::<1>()?[0])
    }

    fn read_size(&mut self) -> Result<usize, CodecError> {
        match self.read_u8()? {
            SIZE_U16 => Ok(u16::from_le_bytes(self.read_array()?) as usize),
            SIZE_U32 => Ok(u32::from_le_bytes(self.read_array()?) as usize),
            size => Ok(size as usize),
        }
    }

    fn align_to(&mut self, alignment: usize) -> Result<(), CodecError> {
        let rem = self.pos % alignment;
        if rem != 0 {
            self.read_bytes(alignment - rem)?;
        }
        Ok(())
    }

    fn read_value(&mut self) -> Result<Value, CodecError> {
        if self.depth >= MAX_DEPTH {
            return Err(CodecError::TooDeep(MAX_DEPTH));
        }

        self.depth += 1;
        let value = self.read_tagged_value();
        self.depth -= 1;

        value
    }

    fn read_tagged_value(&mut self) -> Result<Value, CodecError> {
        let tag = self.read_u8()?;

        match CustomTag::from_u8(tag) {
            Some(custom_tag) => {
                let fields = match self.read_value()? {
                    Value::List(fields) => fields,
                    other => return Err(other.mismatch("list")),
                };
                Ok(Value::Custom(CustomValue::from_list(custom_tag, fields)?))
            }
            None => self.read_base_value(tag),
        }
    }

    fn read_base_value(&mut self, tag: u8) -> Result<Value, CodecError> {
        let value = match tag {
            NULL => Value::Null,
            TRUE => Value::Bool(true),
            FALSE => Value::Bool(false),
            INT32 => Value::Int32(i32::from_le_bytes(self.read_array()?)),
            INT64 => Value::Int64(i64::from_le_bytes(self.read_array()?)),
            FLOAT64 => {
                self.align_to(8)?;
                Value::Float64(f64::from_le_bytes(self.read_array()?))
            }
            STRING => {
                let len = self.read_size()?;
                let bytes = self.read_bytes(len)?;
                let s = std::str::from_utf8(bytes)
                    .map_err(|_| CodecError::InvalidUtf8)?;
                Value::String(s.to_owned())
            }
            UINT8_LIST => {
                let len = self.read_size()?;
                Value::Bytes(self.read_bytes(len)?.to_vec())
            }
            LIST => {
                let len = self.read_size()?;
                // each element takes at least one byte
                let mut items = Vec::with_capacity(len.min(self.data.len()));
                for _ in 0..len {
                    items.push(self.read_value()?);
                }
                Value::List(items)
            }
            MAP => {
                let len = self.read_size()?;
                let mut entries = Vec::with_capacity(len.min(self.data.len()));
                for _ in 0..len {
                    let key = self.read_value()?;
                    let value = self.read_value()?;
                    entries.push((key, value));
                }
                Value::Map(entries)
            }
            other => return Err(CodecError::UnknownTag(other)),
        };

        Ok(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_owned())
    }
}

impl TryFrom<Value> for bool {
    type Error = CodecError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Bool(v) => Ok(v),
            other => Err(other.mismatch("bool")),
        }
    }
}

impl TryFrom<Value> for String {
    type Error = CodecError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::String(v) => Ok(v),
            other => Err(other.mismatch("string")),
        }
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}
