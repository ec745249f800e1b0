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

//! Codecs for custom field declarations.

use crate::Value;
use bytes::{BufMut, Bytes, BytesMut};

/// Codec for values of a custom field type.
///
/// Custom fields declared with a width are handed exactly that many
/// bytes; custom fields without width are self-delimiting and are
/// handed the remaining bytes of the enclosing span.
pub trait CustomField: Send + Sync {
    /// Decode one value from the start of `buf`.
    /// Returns the value and the number of bytes consumed, or `None` when
    /// `buf` does not hold a complete value.
    fn decode(&self, buf: &Bytes) -> Option<(Value, usize)>;

    /// Encode a value, or return `None` if the value cannot be
    /// represented.
    fn encode(&self, value: &Value) -> Option<Bytes>;
}

/// UTF-8 string prefixed with its length in bytes, on one octet.
#[derive(Debug, Default, Clone, Copy)]
pub struct LengthPrefixedString;

impl CustomField for LengthPrefixedString {
    fn decode(&self, buf: &Bytes) -> Option<(Value, usize)> {
        let len = *buf.first()? as usize;
        if buf.len() < len + 1 {
            return None;
        }
        let text = std::str::from_utf8(&buf[1..len + 1]).ok()?;
        Some((Value::text(text), len + 1))
    }

    fn encode(&self, value: &Value) -> Option<Bytes> {
        let Value::Text(text) = value else {
            return None;
        };
        let len = u8::try_from(text.len()).ok()?;
        let mut buf = BytesMut::with_capacity(text.len() + 1);
        buf.put_u8(len);
        buf.put_slice(text.as_bytes());
        Some(buf.freeze())
    }
}

/// Opaque bytes, taking the whole input.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawBytes;

impl CustomField for RawBytes {
    fn decode(&self, buf: &Bytes) -> Option<(Value, usize)> {
        Some((Value::Bytes(buf.clone()), buf.len()))
    }

    fn encode(&self, value: &Value) -> Option<Bytes> {
        match value {
            Value::Bytes(bytes) => Some(bytes.clone()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_prefixed_string() {
        let buf = Bytes::from_static(b"\x03one\x03two");
        assert_eq!(LengthPrefixedString.decode(&buf), Some((Value::text("one"), 4)));
        assert_eq!(
            LengthPrefixedString.encode(&Value::text("three")).as_deref(),
            Some(&b"\x05three"[..])
        );
    }

    #[test]
    fn length_prefixed_string_truncated() {
        assert_eq!(LengthPrefixedString.decode(&Bytes::from_static(b"\x05thr")), None);
        assert_eq!(LengthPrefixedString.decode(&Bytes::new()), None);
    }

    #[test]
    fn length_prefixed_string_too_long() {
        let text = "x".repeat(256);
        assert_eq!(LengthPrefixedString.encode(&Value::Text(text)), None);
        assert_eq!(LengthPrefixedString.encode(&Value::Integer(1)), None);
    }

    #[test]
    fn raw_bytes() {
        let buf = Bytes::from_static(&[0xa1, 0xa2, 0xa3]);
        assert_eq!(RawBytes.decode(&buf), Some((Value::Bytes(buf.clone()), 3)));
        assert_eq!(RawBytes.encode(&Value::Bytes(buf.clone())), Some(buf));
    }
}
