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

//! Read-only views of packets over immutable byte buffers.
//!
//! A view resolves the bounds of every field of its declaration the
//! first time it is validated, and keeps them for the accessors.
//! Field contents are never copied: arrays, structs, and payloads
//! share the buffer of the view.

use bytes::Bytes;
use packetdef_runtime::bits;
use packetdef_runtime::{DecodeError, Value};
use std::fmt;
use std::ops::Range;
use std::sync::{Arc, OnceLock};

use crate::analyzer::Size;
use crate::codec::Codec;
use crate::field;
use crate::layout::{FieldKind, Layout, Offset};

/// Resolved bounds and values of the fields of a span.
#[derive(Debug, Clone)]
pub(crate) struct Frame {
    /// Byte range of each field. Bit-fields share the range of their chunk.
    ranges: Vec<Range<usize>>,
    chunks: Vec<u64>,
    /// Decoded values of array, struct, and custom fields.
    values: Vec<Option<Value>>,
}

impl Frame {
    fn offset(&self, offset: &Offset) -> usize {
        offset.bits / 8 + offset.dynamic.iter().map(|index| self.ranges[*index].len()).sum::<usize>()
    }

    fn bitfield(&self, layout: &Layout, index: usize) -> u64 {
        let field = &layout.fields[index];
        match (field.bits, field.kind.bit_width()) {
            (Some(position), Some(width)) => {
                bits::extract(self.chunks[position.chunk], position.shift, width)
            }
            _ => panic!("field #{index} of {} is not a bit-field", layout.id),
        }
    }

    /// Number of bytes covered by the fields.
    fn len(&self) -> usize {
        self.ranges.iter().map(|range| range.end).max().unwrap_or(0)
    }
}

fn invalid_length(layout: &Layout, index: usize, wanted: usize, got: usize) -> DecodeError {
    let field = &layout.fields[index];
    DecodeError::InvalidLengthError {
        obj: format!("{}::{}", layout.id, field.kind.id().unwrap_or(field.kind.name())),
        wanted,
        got,
    }
}

/// Return the size in bytes of a field of dynamic size starting at
/// `start`. Values decoded along the way are stored in the frame.
fn dynamic_size(
    codec: &Codec,
    layout: &Layout,
    frame: &mut Frame,
    data: &Bytes,
    index: usize,
    start: usize,
) -> Result<usize, DecodeError> {
    let field = &layout.fields[index];
    let packet = &layout.id;
    let sized = |frame: &Frame, length: usize, size_modifier: usize| {
        let size = usize::try_from(frame.bitfield(layout, length)).unwrap_or(usize::MAX);
        size.checked_sub(size_modifier).ok_or_else(|| DecodeError::InvalidSizeModifier {
            packet: packet.clone(),
            field: field.kind.id().unwrap_or("_payload_").to_owned(),
            size,
            modifier: size_modifier,
        })
    };
    let rest = data.slice(start.min(data.len())..);

    match &field.kind {
        FieldKind::Payload { length: Some(length), size_modifier } => {
            sized(frame, *length, *size_modifier)
        }
        FieldKind::Array { element, length: Some(length), size_modifier, .. } => {
            if let FieldKind::Size { .. } = layout.fields[*length].kind {
                return sized(frame, *length, *size_modifier);
            }
            let count = usize::try_from(frame.bitfield(layout, *length)).unwrap_or(usize::MAX);
            match element.size() {
                Size::Static(bits) => count
                    .checked_mul(bits / 8)
                    .ok_or_else(|| invalid_length(layout, index, usize::MAX, rest.len())),
                _ => {
                    let (values, len) = field::decode_elements(
                        codec,
                        layout.byte_order,
                        element,
                        &rest,
                        Some(count),
                    )?;
                    frame.values[index] = Some(Value::Array(values));
                    Ok(len)
                }
            }
        }
        FieldKind::Array { element, count: Some(count), .. } => {
            let (values, len) =
                field::decode_elements(codec, layout.byte_order, element, &rest, Some(*count))?;
            frame.values[index] = Some(Value::Array(values));
            Ok(len)
        }
        FieldKind::Struct { struct_id, .. } => {
            let (value, len) = decode_struct(codec, codec.expect_layout(struct_id), &rest)?;
            frame.values[index] = Some(value);
            Ok(len)
        }
        FieldKind::Custom { id, custom_id, width: None } => {
            match codec.custom_field(custom_id).decode(&rest) {
                Some((value, len)) => {
                    frame.values[index] = Some(value);
                    Ok(len)
                }
                None => Err(DecodeError::InvalidCustomField {
                    packet: packet.clone(),
                    field: id.clone(),
                }),
            }
        }
        kind => unreachable!("{} field of {packet} has no dynamic size", kind.name()),
    }
}

/// Run the validator of a field whose bounds are resolved.
fn validate_field(
    codec: &Codec,
    layout: &Layout,
    frame: &mut Frame,
    data: &Bytes,
    index: usize,
) -> Result<(), DecodeError> {
    let range = frame.ranges[index].clone();
    let packet = &layout.id;
    match &layout.fields[index].kind {
        FieldKind::Fixed { width, value } => {
            let actual = frame.bitfield(layout, index);
            if actual != *value {
                return Err(DecodeError::InvalidFixedValue {
                    packet: packet.clone(),
                    field: format!("_fixed_{width}_"),
                    expected: *value,
                    actual,
                });
            }
        }
        FieldKind::Checksum { id, checksum_id, width, start } => {
            let start = frame.ranges[*start].start;
            let computed =
                codec.checksum(checksum_id).compute(&data[start..range.start]) & bits::mask(*width);
            let actual = bits::get_uint(layout.byte_order, &data[range]);
            if computed != actual {
                return Err(DecodeError::ChecksumMismatch {
                    packet: packet.clone(),
                    field: id.clone(),
                    computed,
                    actual,
                });
            }
        }
        FieldKind::Struct { struct_id, .. } if frame.values[index].is_none() => {
            let (value, _) =
                decode_struct(codec, codec.expect_layout(struct_id), &data.slice(range))?;
            frame.values[index] = Some(value);
        }
        FieldKind::Custom { id, custom_id, .. } if frame.values[index].is_none() => {
            match codec.custom_field(custom_id).decode(&data.slice(range)) {
                Some((value, _)) => frame.values[index] = Some(value),
                None => {
                    return Err(DecodeError::InvalidCustomField {
                        packet: packet.clone(),
                        field: id.clone(),
                    })
                }
            }
        }
        FieldKind::Array { element, count, length, .. } if frame.values[index].is_none() => {
            let count = match length {
                Some(length) if matches!(layout.fields[*length].kind, FieldKind::Count { .. }) => {
                    Some(frame.bitfield(layout, *length) as usize)
                }
                _ => *count,
            };
            let (values, _) = field::decode_elements(
                codec,
                layout.byte_order,
                element,
                &data.slice(range),
                count,
            )?;
            frame.values[index] = Some(Value::Array(values));
        }
        _ => (),
    }
    Ok(())
}

/// Resolve the bounds of the fields of a packet or struct over the
/// selected span, and run the field validators in declaration order.
pub(crate) fn decode_frame(
    codec: &Codec,
    layout: &Layout,
    data: &Bytes,
) -> Result<Frame, DecodeError> {
    let len = data.len();
    if len < layout.min_len() {
        return Err(DecodeError::InvalidLengthError {
            obj: layout.id.clone(),
            wanted: layout.min_len(),
            got: len,
        });
    }

    let mut frame = Frame {
        ranges: Vec::with_capacity(layout.fields.len()),
        chunks: vec![0; layout.chunks.len()],
        values: vec![None; layout.fields.len()],
    };
    let mut chunk_ranges: Vec<Range<usize>> = Vec::with_capacity(layout.chunks.len());

    for (index, field) in layout.fields.iter().enumerate() {
        let range = match field.bits {
            Some(position) if position.shift == 0 => {
                let chunk = &layout.chunks[position.chunk];
                let start = match (&chunk.start, chunk.end) {
                    (Some(start), _) => frame.offset(start),
                    (None, Some(end)) => len
                        .checked_sub(end / 8 + chunk.width / 8)
                        .ok_or_else(|| invalid_length(layout, index, end / 8 + chunk.width / 8, len))?,
                    (None, None) => unreachable!("unresolved chunk offset in {}", layout.id),
                };
                let end = start
                    .checked_add(chunk.width / 8)
                    .filter(|end| *end <= len)
                    .ok_or_else(|| {
                        invalid_length(layout, index, start.saturating_add(chunk.width / 8), len)
                    })?;
                frame.chunks[position.chunk] = bits::get_uint(layout.byte_order, &data[start..end]);
                chunk_ranges.push(start..end);
                start..end
            }
            Some(position) => chunk_ranges[position.chunk].clone(),
            None => {
                let start = match (&field.start, field.end, field.size) {
                    (Some(start), _, _) => frame.offset(start),
                    (None, Some(end), Size::Static(bits)) => len
                        .checked_sub(end / 8 + bits / 8)
                        .ok_or_else(|| invalid_length(layout, index, end / 8 + bits / 8, len))?,
                    _ => unreachable!("unresolved field offset in {}", layout.id),
                };
                if start > len {
                    return Err(invalid_length(layout, index, start, len));
                }
                // Sizes read off the wire may overflow the span end.
                let end = match field.size {
                    Size::Static(bits) => start.checked_add(bits / 8),
                    Size::Dynamic => {
                        let size = dynamic_size(codec, layout, &mut frame, data, index, start)?;
                        start.checked_add(size)
                    }
                    Size::Unknown => {
                        let end = field.end.unwrap_or_else(|| {
                            unreachable!("unresolved field end in {}", layout.id)
                        });
                        match len.checked_sub(end / 8) {
                            Some(end) if end >= start => Some(end),
                            _ => return Err(invalid_length(layout, index, start + end / 8, len)),
                        }
                    }
                };
                let end = match end {
                    Some(end) if end <= len => end,
                    end => {
                        return Err(invalid_length(layout, index, end.unwrap_or(usize::MAX), len))
                    }
                };
                start..end
            }
        };
        tracing::trace!(packet = %layout.id, field = index, ?range, "resolved field bounds");
        frame.ranges.push(range);
        validate_field(codec, layout, &mut frame, data, index)?;
    }

    Ok(frame)
}

/// Return the value of a named field from a resolved frame.
fn field_value(
    codec: &Codec,
    layout: &Layout,
    frame: &Frame,
    data: &Bytes,
    index: usize,
) -> Option<Value> {
    match &layout.fields[index].kind {
        FieldKind::Scalar { .. } => Some(Value::Integer(frame.bitfield(layout, index))),
        FieldKind::Enum { enum_id, .. } => {
            Some(codec.enum_tag(enum_id, frame.bitfield(layout, index)))
        }
        FieldKind::Checksum { .. } => Some(Value::Integer(bits::get_uint(
            layout.byte_order,
            &data[frame.ranges[index].clone()],
        ))),
        FieldKind::Struct { .. } | FieldKind::Custom { .. } | FieldKind::Array { .. } => {
            frame.values[index].clone()
        }
        _ => None,
    }
}

/// Decode a struct from the start of `data`.
/// Returns the struct value and the number of bytes it covers.
pub(crate) fn decode_struct(
    codec: &Codec,
    layout: &Layout,
    data: &Bytes,
) -> Result<(Value, usize), DecodeError> {
    let frame = decode_frame(codec, layout, data)?;
    let fields = layout
        .fields
        .iter()
        .enumerate()
        .filter_map(|(index, field)| {
            Some((field.kind.id()?.to_owned(), field_value(codec, layout, &frame, data, index)?))
        })
        .collect();
    Ok((Value::Struct(fields), frame.len()))
}

/// View of a packet or struct over a byte span.
///
/// The span is validated on first use; accessors panic if the
/// span is not valid. Views of child declarations are created with
/// [`View::specialize`] and cover the payload of their parent.
#[derive(Clone)]
pub struct View {
    codec: Arc<Codec>,
    layout: Arc<Layout>,
    data: Bytes,
    parent: Option<Arc<View>>,
    frame: OnceLock<Option<Frame>>,
}

impl fmt::Debug for View {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("View")
            .field("id", &self.layout.id)
            .field("data", &self.data)
            .field("parent", &self.parent)
            .finish_non_exhaustive()
    }
}

impl View {
    pub(crate) fn new(
        codec: Arc<Codec>,
        layout: Arc<Layout>,
        data: Bytes,
        parent: Option<Arc<View>>,
    ) -> View {
        View { codec, layout, data, parent, frame: OnceLock::new() }
    }

    /// Identifier of the viewed declaration.
    pub fn id(&self) -> &str {
        &self.layout.id
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Bytes covered by the view.
    pub fn bytes(&self) -> &Bytes {
        &self.data
    }

    pub fn parent(&self) -> Option<&View> {
        self.parent.as_deref()
    }

    fn validate(&self) -> Result<Frame, DecodeError> {
        if let Some(parent) = &self.parent {
            if !parent.is_valid() {
                return Err(DecodeError::InvalidParent { packet: self.layout.id.clone() });
            }
            for (id, expected) in &self.layout.constraints {
                let actual = parent.raw_integer(id);
                if actual != Some(*expected) {
                    return Err(DecodeError::InvalidFieldValue {
                        packet: self.layout.id.clone(),
                        field: id.clone(),
                        expected: *expected,
                        actual: actual.unwrap_or_default(),
                    });
                }
            }
        }
        decode_frame(&self.codec, &self.layout, &self.data)
    }

    fn frame(&self) -> Option<&Frame> {
        self.frame
            .get_or_init(|| match self.validate() {
                Ok(frame) => Some(frame),
                Err(err) => {
                    tracing::debug!(packet = %self.layout.id, "invalid span: {err}");
                    None
                }
            })
            .as_ref()
    }

    fn validated_frame(&self) -> &Frame {
        match self.frame() {
            Some(frame) => frame,
            None => panic!("{} was accessed but was not validated successfully", self.layout.id),
        }
    }

    /// Validate the span against the declaration, its parents, and the
    /// constraints set by the declaration on its parents.
    /// The result is computed once.
    pub fn is_valid(&self) -> bool {
        self.frame().is_some()
    }

    /// Raw integer value of a scalar or enum field of the view or its
    /// parents, if the view is valid.
    fn raw_integer(&self, id: &str) -> Option<u64> {
        let frame = self.frame()?;
        match self.layout.field_index(id) {
            Some(index)
                if matches!(
                    self.layout.fields[index].kind,
                    FieldKind::Scalar { .. } | FieldKind::Enum { .. }
                ) =>
            {
                Some(frame.bitfield(&self.layout, index))
            }
            Some(_) => None,
            None => self.parent.as_ref()?.raw_integer(id),
        }
    }

    /// Return the value of the named field of the declaration or of
    /// one of its parents.
    ///
    /// # Panics
    ///
    /// Panics if the view is not valid, or if no field has this name.
    pub fn get(&self, id: &str) -> Value {
        let frame = self.validated_frame();
        match self.layout.field_index(id) {
            Some(index) => field_value(&self.codec, &self.layout, frame, &self.data, index)
                .unwrap_or_else(|| panic!("{}::{id} has no value", self.layout.id)),
            None => match &self.parent {
                Some(parent) => parent.get(id),
                None => panic!("{id} is not a field of {}", self.layout.id),
            },
        }
    }

    /// Return the bytes of the payload or body field.
    ///
    /// # Panics
    ///
    /// Panics if the view is not valid, or if the declaration has
    /// no payload.
    pub fn payload(&self) -> Bytes {
        let frame = self.validated_frame();
        match self.layout.payload_index() {
            Some(index) => self.data.slice(frame.ranges[index].clone()),
            None => panic!("{} has no payload", self.layout.id),
        }
    }

    /// Return the values of the named fields of the view and its
    /// parents, root fields first.
    ///
    /// # Panics
    ///
    /// Panics if the view is not valid.
    pub fn fields(&self) -> Vec<(String, Value)> {
        let frame = self.validated_frame();
        let mut fields = self.parent.as_ref().map(|parent| parent.fields()).unwrap_or_default();
        fields.extend(self.layout.fields.iter().enumerate().filter_map(|(index, field)| {
            Some((
                field.kind.id()?.to_owned(),
                field_value(&self.codec, &self.layout, frame, &self.data, index)?,
            ))
        }));
        fields
    }

    /// Create a view of a child declaration over the payload of this
    /// view. The child view is invalid if this view is invalid.
    ///
    /// # Panics
    ///
    /// Panics if `child_id` does not name a direct child of the
    /// viewed declaration.
    pub fn specialize(self, child_id: &str) -> View {
        let codec = self.codec.clone();
        let layout = codec.expect_layout(child_id).clone();
        if layout.parent_id.as_deref() != Some(self.layout.id.as_str()) {
            panic!("{child_id} does not extend {}", self.layout.id);
        }
        let data = match (self.frame(), self.layout.payload_index()) {
            (Some(frame), Some(index)) => self.data.slice(frame.ranges[index].clone()),
            _ => Bytes::new(),
        };
        View::new(codec, layout, data, Some(Arc::new(self)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast;
    use crate::codec::Functions;
    use crate::parser::parse_inline;
    use googletest::prelude::{assert_that, eq};
    use serde_json::json;

    fn codec(declarations: serde_json::Value) -> Arc<Codec> {
        let mut db = ast::SourceDatabase::new();
        let schema = json!({ "endianness": "little_endian", "declarations": declarations });
        let file = parse_inline(&mut db, "stdin", schema.to_string()).expect("parsing failure");
        Codec::new(&file, &Functions::default()).expect("analyzer failure")
    }

    fn bitfields() -> Arc<Codec> {
        codec(json!([{
            "kind": "packet_declaration",
            "id": "Bits",
            "fields": [
                { "kind": "scalar_field", "id": "seven_bits", "width": 7 },
                { "kind": "scalar_field", "id": "straddle", "width": 4 },
                { "kind": "scalar_field", "id": "five_bits", "width": 5 }
            ]
        }]))
    }

    #[test]
    fn straddling_bitfields() {
        let codec = bitfields();
        let view = codec.view("Bits", Bytes::from_static(&[0xf7, 0xaa]));
        assert!(view.is_valid());
        assert_eq!(view.get("seven_bits"), Value::Integer(0x77));
        assert_eq!(view.get("straddle"), Value::Integer(0x5));
        assert_eq!(view.get("five_bits"), Value::Integer(0x15));
    }

    #[test]
    fn truncated_span() {
        let codec = bitfields();
        let view = codec.view("Bits", Bytes::from_static(&[0xf7]));
        assert!(!view.is_valid());
    }

    #[test]
    #[should_panic(expected = "validated")]
    fn accessor_panics_on_invalid_span() {
        let codec = bitfields();
        codec.view("Bits", Bytes::new()).get("straddle");
    }

    #[test]
    fn sized_array_and_trailer() {
        let codec = codec(json!([{
            "kind": "packet_declaration",
            "id": "P",
            "fields": [
                { "kind": "size_field", "field_id": "data", "width": 8 },
                { "kind": "array_field", "id": "data", "width": 16 },
                { "kind": "payload_field" },
                { "kind": "scalar_field", "id": "tail", "width": 8 }
            ]
        }]));
        let view = codec.view("P", Bytes::from_static(&[0x04, 0x01, 0x00, 0x02, 0x00, 0xaa, 0xbb, 0xcc]));
        assert!(view.is_valid());
        assert_eq!(view.get("data"), Value::from(vec![1u16, 2]));
        assert_eq!(view.payload(), Bytes::from_static(&[0xaa, 0xbb]));
        assert_eq!(view.get("tail"), Value::Integer(0xcc));
        assert_that!(view.fields().len(), eq(2));

        let view = codec.view("P", Bytes::from_static(&[0x08, 0x01, 0x00, 0x02]));
        assert!(!view.is_valid());
    }

    #[test]
    fn child_constraints() {
        let codec = codec(json!([
            {
                "kind": "packet_declaration",
                "id": "Parent",
                "fields": [
                    { "kind": "scalar_field", "id": "opcode", "width": 8 },
                    { "kind": "payload_field" }
                ]
            },
            {
                "kind": "packet_declaration",
                "id": "Child",
                "parent_id": "Parent",
                "constraints": [{ "id": "opcode", "value": 1 }],
                "fields": [{ "kind": "scalar_field", "id": "value", "width": 8 }]
            }
        ]));
        let child = codec.view("Parent", Bytes::from_static(&[0x01, 0x42])).specialize("Child");
        assert!(child.is_valid());
        assert_eq!(child.get("value"), Value::Integer(0x42));
        assert_eq!(child.get("opcode"), Value::Integer(1));
        assert_eq!(child.parent().map(View::id), Some("Parent"));
        assert_eq!(
            child.fields(),
            vec![("opcode".to_owned(), Value::Integer(1)), ("value".to_owned(), Value::Integer(0x42))]
        );

        let child = codec.view("Parent", Bytes::from_static(&[0x02, 0x42])).specialize("Child");
        assert!(!child.is_valid());
        let child = codec.view("Parent", Bytes::new()).specialize("Child");
        assert!(!child.is_valid());
    }

    #[test]
    fn fixed_value_mismatch() {
        let codec = codec(json!([{
            "kind": "struct_declaration",
            "id": "S",
            "fields": [
                { "kind": "fixed_scalar_field", "width": 8, "value": 0x2a },
                { "kind": "scalar_field", "id": "a", "width": 8 }
            ]
        }]));
        assert!(codec.view("S", Bytes::from_static(&[0x2a, 0x01])).is_valid());
        assert!(!codec.view("S", Bytes::from_static(&[0x2b, 0x01])).is_valid());
    }

    #[test]
    fn checksum_mismatch() {
        let codec = codec(json!([
            { "kind": "checksum_declaration", "id": "Sum", "function": "sum", "width": 8 },
            {
                "kind": "packet_declaration",
                "id": "P",
                "fields": [
                    { "kind": "checksum_field", "field_id": "crc" },
                    { "kind": "scalar_field", "id": "a", "width": 8 },
                    { "kind": "scalar_field", "id": "b", "width": 8 },
                    { "kind": "typedef_field", "id": "crc", "type_id": "Sum" }
                ]
            }
        ]));
        let view = codec.view("P", Bytes::from_static(&[0x10, 0x20, 0x30]));
        assert!(view.is_valid());
        assert_eq!(view.get("crc"), Value::Integer(0x30));
        assert!(!codec.view("P", Bytes::from_static(&[0x10, 0x20, 0x31])).is_valid());
    }

    #[test]
    fn view_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<View>();
    }
}
