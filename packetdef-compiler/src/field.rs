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

//! Decoding and encoding of array elements and typed field values.

use bytes::{BufMut, Bytes, BytesMut};
use packetdef_runtime::bits::{self, ByteOrder};
use packetdef_runtime::{DecodeError, EncodeError, Value};
use std::collections::BTreeMap;

use crate::analyzer::Size;
use crate::builder;
use crate::codec::Codec;
use crate::layout::Element;
use crate::view;

/// Decode one element from the start of `data`.
/// Returns `None` when `data` does not hold a complete element.
pub(crate) fn decode_element(
    codec: &Codec,
    order: ByteOrder,
    element: &Element,
    data: &Bytes,
) -> Result<Option<(Value, usize)>, DecodeError> {
    Ok(match element {
        Element::Scalar { width } | Element::Enum { width, .. } => {
            let len = width / 8;
            if data.len() < len {
                return Ok(None);
            }
            let value = bits::get_uint(order, &data[..len]);
            match element {
                Element::Enum { enum_id, .. } => Some((codec.enum_tag(enum_id, value), len)),
                _ => Some((Value::Integer(value), len)),
            }
        }
        Element::Struct { struct_id, size } => {
            let layout = codec.expect_layout(struct_id);
            let data = match size {
                Size::Static(bits) if data.len() < bits / 8 => return Ok(None),
                Size::Static(bits) => data.slice(..bits / 8),
                _ => data.clone(),
            };
            match view::decode_struct(codec, layout, &data) {
                Ok(decoded) => Some(decoded),
                Err(DecodeError::InvalidLengthError { .. }) => None,
                Err(err) => return Err(err),
            }
        }
        Element::Custom { custom_id, width: Some(width) } => {
            let len = width / 8;
            if data.len() < len {
                return Ok(None);
            }
            match codec.custom_field(custom_id).decode(&data.slice(..len)) {
                Some((value, _)) => Some((value, len)),
                None => {
                    return Err(DecodeError::InvalidCustomField {
                        packet: custom_id.clone(),
                        field: "_element_".to_owned(),
                    })
                }
            }
        }
        Element::Custom { custom_id, width: None } => {
            codec.custom_field(custom_id).decode(data)
        }
    })
}

/// Decode array elements from the start of `data`, up to `count`
/// elements if set. Decoding stops at the first element that does
/// not fit. Returns the elements and the number of bytes consumed.
pub(crate) fn decode_elements(
    codec: &Codec,
    order: ByteOrder,
    element: &Element,
    data: &Bytes,
    count: Option<usize>,
) -> Result<(Vec<Value>, usize), DecodeError> {
    let mut values = vec![];
    let mut offset = 0;
    while count.map_or(true, |count| values.len() < count) && offset < data.len() {
        match decode_element(codec, order, element, &data.slice(offset..))? {
            Some((value, len)) if len > 0 => {
                values.push(value);
                offset += len;
            }
            _ => break,
        }
    }
    Ok((values, offset))
}

pub(crate) fn integer(packet: &str, field: &str, value: &Value) -> Result<u64, EncodeError> {
    value.as_integer().ok_or_else(|| EncodeError::InvalidFieldValue {
        packet: packet.to_owned(),
        field: field.to_owned(),
        expected: "integer",
        actual: value.kind(),
    })
}

/// Return the value of a scalar field, checked against the field width.
pub(crate) fn scalar(packet: &str, field: &str, width: usize, value: &Value) -> Result<u64, EncodeError> {
    let value = integer(packet, field, value)?;
    if value > bits::mask(width) {
        return Err(EncodeError::InvalidScalarValue {
            packet: packet.to_owned(),
            field: field.to_owned(),
            value,
            maximum_value: bits::mask(width),
        });
    }
    Ok(value)
}

/// Return the value of an enum field, given as tag or integer.
pub(crate) fn enum_value(
    codec: &Codec,
    packet: &str,
    field: &str,
    enum_id: &str,
    width: usize,
    value: &Value,
) -> Result<u64, EncodeError> {
    match (codec.enum_value(enum_id, value), value) {
        (Some(value), _) => Ok(value),
        (None, Value::Tag(tag)) => Err(EncodeError::InvalidEnumTag {
            packet: packet.to_owned(),
            field: field.to_owned(),
            tag: tag.clone(),
        }),
        (None, Value::Integer(_)) => scalar(packet, field, width, value),
        (None, _) => Err(EncodeError::InvalidFieldValue {
            packet: packet.to_owned(),
            field: field.to_owned(),
            expected: "enum tag",
            actual: value.kind(),
        }),
    }
}

pub(crate) fn struct_fields<'v>(
    packet: &str,
    field: &str,
    value: &'v Value,
) -> Result<&'v BTreeMap<String, Value>, EncodeError> {
    value.as_struct().ok_or_else(|| EncodeError::InvalidFieldValue {
        packet: packet.to_owned(),
        field: field.to_owned(),
        expected: "struct",
        actual: value.kind(),
    })
}

/// Encode the value of a custom field.
pub(crate) fn encode_custom(
    codec: &Codec,
    packet: &str,
    field: &str,
    custom_id: &str,
    width: Option<usize>,
    value: &Value,
) -> Result<Bytes, EncodeError> {
    match codec.custom_field(custom_id).encode(value) {
        Some(bytes) if width.map_or(true, |width| bytes.len() == width / 8) => Ok(bytes),
        _ => Err(EncodeError::InvalidFieldValue {
            packet: packet.to_owned(),
            field: field.to_owned(),
            expected: "custom field",
            actual: value.kind(),
        }),
    }
}

/// Encode one array element.
pub(crate) fn encode_element(
    codec: &Codec,
    order: ByteOrder,
    packet: &str,
    field: &str,
    element: &Element,
    value: &Value,
    buf: &mut BytesMut,
) -> Result<(), EncodeError> {
    match element {
        Element::Scalar { width } => {
            let value = scalar(packet, field, *width, value)?;
            bits::put_uint(order, value, width / 8, buf);
        }
        Element::Enum { enum_id, width } => {
            let value = enum_value(codec, packet, field, enum_id, *width, value)?;
            bits::put_uint(order, value, width / 8, buf);
        }
        Element::Struct { struct_id, .. } => {
            let fields = struct_fields(packet, field, value)?;
            builder::encode_fields(codec, codec.expect_layout(struct_id), fields, None, buf)?;
        }
        Element::Custom { custom_id, width } => {
            buf.put_slice(&encode_custom(codec, packet, field, custom_id, *width, value)?);
        }
    }
    Ok(())
}

/// Return the encoded length in bytes of one array element.
pub(crate) fn element_len(
    codec: &Codec,
    packet: &str,
    field: &str,
    element: &Element,
    value: &Value,
) -> Result<usize, EncodeError> {
    match (element, element.size()) {
        (_, Size::Static(bits)) => Ok(bits / 8),
        (Element::Struct { struct_id, .. }, _) => {
            let fields = struct_fields(packet, field, value)?;
            builder::encoded_len(codec, codec.expect_layout(struct_id), fields, 0)
        }
        (Element::Custom { custom_id, width }, _) => {
            Ok(encode_custom(codec, packet, field, custom_id, *width, value)?.len())
        }
        _ => Ok(0),
    }
}
