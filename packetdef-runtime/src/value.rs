// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use bytes::Bytes;
use std::collections::BTreeMap;
use std::fmt;

/// Typed value of a packet field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// Scalar, size, count, or checksum value.
    Integer(u64),
    /// Enum value, designated by its tag identifier.
    Tag(String),
    /// Length-prefixed string.
    Text(String),
    /// Opaque bytes: payload, body, or custom field contents.
    Bytes(Bytes),
    Array(Vec<Value>),
    /// Struct value, indexed by field identifier.
    Struct(BTreeMap<String, Value>),
}

impl Value {
    pub fn tag(id: &str) -> Value {
        Value::Tag(id.to_owned())
    }

    pub fn text(text: &str) -> Value {
        Value::Text(text.to_owned())
    }

    /// Build a struct value from a list of field assignments.
    pub fn record<K: Into<String>, V: Into<Value>>(
        fields: impl IntoIterator<Item = (K, V)>,
    ) -> Value {
        Value::Struct(fields.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }

    pub fn as_integer(&self) -> Option<u64> {
        match self {
            Value::Integer(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(values) => Some(values),
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Struct(fields) => Some(fields),
            _ => None,
        }
    }

    /// Short name of the value kind, reported by `EncodeError::InvalidFieldValue`.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Integer(_) => "integer",
            Value::Tag(_) => "tag",
            Value::Text(_) => "text",
            Value::Bytes(_) => "bytes",
            Value::Array(_) => "array",
            Value::Struct(_) => "struct",
        }
    }
}

macro_rules! impl_from_unsigned {
    ($($ty:ty),*) => {
        $(impl From<$ty> for Value {
            fn from(value: $ty) -> Self {
                Value::Integer(value as u64)
            }
        })*
    };
}

impl_from_unsigned!(u8, u16, u32, u64, usize);

impl From<Bytes> for Value {
    fn from(value: Bytes) -> Self {
        Value::Bytes(value)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(values: Vec<T>) -> Self {
        Value::Array(values.into_iter().map(Into::into).collect())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Integer(value) => write!(f, "{value:#x}"),
            Value::Tag(tag) => write!(f, "{tag}"),
            Value::Text(text) => write!(f, "{text:?}"),
            Value::Bytes(bytes) => {
                write!(f, "[")?;
                for (index, byte) in bytes.iter().enumerate() {
                    if index > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{byte:02x}")?;
                }
                write!(f, "]")
            }
            Value::Array(values) => {
                write!(f, "[")?;
                for (index, value) in values.iter().enumerate() {
                    if index > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{value}")?;
                }
                write!(f, "]")
            }
            Value::Struct(fields) => {
                write!(f, "{{")?;
                for (index, (id, value)) in fields.iter().enumerate() {
                    if index > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{id}: {value}")?;
                }
                write!(f, "}}")
            }
        }
    }
}
