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

//! Builders composing packets from field values.

use bytes::{BufMut, Bytes, BytesMut};
use packetdef_runtime::bits::{self, BitPacker};
use packetdef_runtime::{EncodeError, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use crate::codec::Codec;
use crate::field;
use crate::layout::{FieldKind, Layout};

/// Encode the fields of a packet or struct.
///
/// Field values are looked up by identifier in `values`. Size, count,
/// and checksum fields are computed from the encoded contents of the
/// fields they cover. `payload` fills the payload or body field, if any.
pub(crate) fn encode_fields(
    codec: &Codec,
    layout: &Layout,
    values: &BTreeMap<String, Value>,
    payload: Option<&Bytes>,
    buf: &mut BytesMut,
) -> Result<(), EncodeError> {
    let packet = layout.id.as_str();
    let get = |id: &str| {
        values.get(id).ok_or_else(|| EncodeError::MissingField {
            packet: packet.to_owned(),
            field: id.to_owned(),
        })
    };

    // Encode the contents of the fields with a variable size first,
    // size and count fields may precede their target.
    let mut contents: Vec<Option<Bytes>> = vec![None; layout.fields.len()];
    let mut counts: Vec<Option<usize>> = vec![None; layout.fields.len()];
    for (index, field) in layout.fields.iter().enumerate() {
        contents[index] = match &field.kind {
            FieldKind::Array { id, element, count, .. } => {
                let value = get(id)?;
                let elements = value.as_array().ok_or_else(|| EncodeError::InvalidFieldValue {
                    packet: packet.to_owned(),
                    field: id.clone(),
                    expected: "array",
                    actual: value.kind(),
                })?;
                if let Some(count) = count {
                    if elements.len() != *count {
                        return Err(EncodeError::InvalidArrayLength {
                            packet: packet.to_owned(),
                            field: id.clone(),
                            expected: *count,
                            actual: elements.len(),
                        });
                    }
                }
                let mut bytes = BytesMut::new();
                for element_value in elements {
                    field::encode_element(
                        codec,
                        layout.byte_order,
                        packet,
                        id,
                        element,
                        element_value,
                        &mut bytes,
                    )?;
                }
                counts[index] = Some(elements.len());
                Some(bytes.freeze())
            }
            FieldKind::Struct { id, struct_id } => {
                let fields = field::struct_fields(packet, id, get(id)?)?;
                let mut bytes = BytesMut::new();
                encode_fields(codec, codec.expect_layout(struct_id), fields, None, &mut bytes)?;
                Some(bytes.freeze())
            }
            FieldKind::Custom { id, custom_id, width } => {
                Some(field::encode_custom(codec, packet, id, custom_id, *width, get(id)?)?)
            }
            FieldKind::Payload { .. } => Some(payload.cloned().unwrap_or_default()),
            _ => None,
        };
    }

    let content_len = |index: usize| contents[index].as_ref().map_or(0, Bytes::len);
    let size_modifier = |index: usize| match &layout.fields[index].kind {
        FieldKind::Array { size_modifier, .. } | FieldKind::Payload { size_modifier, .. } => {
            *size_modifier
        }
        _ => 0,
    };

    let mut packer = BitPacker::new();
    let mut marks: Vec<Option<usize>> = vec![None; layout.fields.len()];
    for (index, field) in layout.fields.iter().enumerate() {
        match &field.kind {
            FieldKind::Scalar { id, width } => {
                packer.push(field::scalar(packet, id, *width, get(id)?)?, *width)
            }
            FieldKind::Enum { id, enum_id, width } => {
                packer.push(field::enum_value(codec, packet, id, enum_id, *width, get(id)?)?, *width)
            }
            FieldKind::Fixed { width, value } => packer.push(*value, *width),
            FieldKind::Reserved { width } => packer.push(0, *width),
            FieldKind::Size { target, width } => {
                let size = content_len(*target) + size_modifier(*target);
                let maximum_size = bits::mask(*width) as usize;
                if size > maximum_size {
                    return Err(EncodeError::SizeOverflow {
                        packet: packet.to_owned(),
                        field: layout.fields[*target].kind.id().unwrap_or("_payload_").to_owned(),
                        size,
                        maximum_size,
                    });
                }
                packer.push(size as u64, *width)
            }
            FieldKind::Count { target, width } => {
                let count = counts[*target].unwrap_or(0);
                let maximum_count = bits::mask(*width) as usize;
                if count > maximum_count {
                    return Err(EncodeError::CountOverflow {
                        packet: packet.to_owned(),
                        field: layout.fields[*target].kind.id().unwrap_or_default().to_owned(),
                        count,
                        maximum_count,
                    });
                }
                packer.push(count as u64, *width)
            }
            FieldKind::ChecksumStart { .. } => marks[index] = Some(buf.len()),
            FieldKind::Checksum { checksum_id, width, start, .. } => {
                let mark = marks[*start].unwrap_or(buf.len());
                let value =
                    codec.checksum(checksum_id).compute(&buf[mark..]) & bits::mask(*width);
                bits::put_uint(layout.byte_order, value, width / 8, buf);
            }
            FieldKind::Struct { .. }
            | FieldKind::Custom { .. }
            | FieldKind::Array { .. }
            | FieldKind::Payload { .. } => {
                if let Some(bytes) = &contents[index] {
                    buf.put_slice(bytes);
                }
            }
        }
        if field.kind.bit_width().is_some() && packer.is_aligned() {
            packer.flush(layout.byte_order, buf);
        }
    }

    Ok(())
}

/// Return the number of bytes written by [`encode_fields`] for the
/// same values and a payload of `payload_len` bytes.
pub(crate) fn encoded_len(
    codec: &Codec,
    layout: &Layout,
    values: &BTreeMap<String, Value>,
    payload_len: usize,
) -> Result<usize, EncodeError> {
    let packet = layout.id.as_str();
    let get = |id: &str| {
        values.get(id).ok_or_else(|| EncodeError::MissingField {
            packet: packet.to_owned(),
            field: id.to_owned(),
        })
    };

    let mut bits = 0;
    for field in &layout.fields {
        bits += match &field.kind {
            FieldKind::Array { id, element, .. } => {
                let value = get(id)?;
                let elements = value.as_array().ok_or_else(|| EncodeError::InvalidFieldValue {
                    packet: packet.to_owned(),
                    field: id.clone(),
                    expected: "array",
                    actual: value.kind(),
                })?;
                let mut len = 0;
                for element_value in elements {
                    len += field::element_len(codec, packet, id, element, element_value)?;
                }
                8 * len
            }
            FieldKind::Struct { id, struct_id } => {
                let fields = field::struct_fields(packet, id, get(id)?)?;
                8 * encoded_len(codec, codec.expect_layout(struct_id), fields, 0)?
            }
            FieldKind::Custom { id, custom_id, width: None } => {
                8 * field::encode_custom(codec, packet, id, custom_id, None, get(id)?)?.len()
            }
            FieldKind::Payload { .. } => 8 * payload_len,
            _ => field.size.static_().unwrap_or(0),
        };
    }
    Ok(bits / 8)
}

enum Payload {
    Bytes(Bytes),
    Builder(Box<Builder>),
}

/// Builder for a packet or struct declaration.
///
/// Field values of the declaration and of its parents are set with
/// [`Builder::with`]. Fields constrained by the declaration are
/// preset. The builder is consumed by serialization.
pub struct Builder {
    codec: Arc<Codec>,
    /// Layouts from the root ancestor down to the built declaration.
    chain: Vec<Arc<Layout>>,
    values: BTreeMap<String, Value>,
    constraints: HashMap<String, u64>,
    payload: Option<Payload>,
}

impl fmt::Debug for Builder {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Builder")
            .field("id", &self.id())
            .field("values", &self.values)
            .finish_non_exhaustive()
    }
}

impl Builder {
    pub(crate) fn new(codec: Arc<Codec>, chain: Vec<Arc<Layout>>) -> Builder {
        let constraints: HashMap<String, u64> =
            chain.last().map(|layout| layout.constraints.iter().cloned().collect()).unwrap_or_default();
        let values =
            constraints.iter().map(|(id, value)| (id.clone(), Value::Integer(*value))).collect();
        Builder { codec, chain, values, constraints, payload: None }
    }

    fn leaf(&self) -> &Layout {
        match self.chain.last() {
            Some(layout) => layout,
            None => panic!("builder has no declaration"),
        }
    }

    /// Identifier of the built declaration.
    pub fn id(&self) -> &str {
        &self.leaf().id
    }

    /// Set the value of a field of the declaration or of its parents.
    ///
    /// # Panics
    ///
    /// Panics if `id` does not name a field, names a computed
    /// checksum field, or names a constrained field and the value
    /// differs from the constraint.
    pub fn with(mut self, id: &str, value: impl Into<Value>) -> Builder {
        let value = value.into();
        let field = self
            .chain
            .iter()
            .find_map(|layout| layout.field_index(id).map(|index| &layout.fields[index]));
        let Some(field) = field else {
            panic!("{id} is not a field of {}", self.id());
        };
        if let FieldKind::Checksum { .. } = field.kind {
            panic!("{id} is computed and cannot be set");
        }
        if let Some(expected) = self.constraints.get(id) {
            let actual = match &field.kind {
                FieldKind::Enum { enum_id, .. } => self.codec.enum_value(enum_id, &value),
                _ => value.as_integer(),
            };
            assert_eq!(
                actual,
                Some(*expected),
                "{id} is constrained to {expected:#x} by {}",
                self.id()
            );
        }
        self.values.insert(id.to_owned(), value);
        self
    }

    /// Set the bytes of the payload or body field.
    ///
    /// # Panics
    ///
    /// Panics if the declaration has no payload.
    pub fn payload(mut self, payload: impl Into<Bytes>) -> Builder {
        assert!(self.leaf().payload_index().is_some(), "{} has no payload", self.id());
        self.payload = Some(Payload::Bytes(payload.into()));
        self
    }

    /// Set the payload or body field to the serialization of another
    /// builder.
    ///
    /// # Panics
    ///
    /// Panics if the declaration has no payload.
    pub fn payload_builder(mut self, builder: Builder) -> Builder {
        assert!(self.leaf().payload_index().is_some(), "{} has no payload", self.id());
        self.payload = Some(Payload::Builder(Box::new(builder)));
        self
    }

    fn payload_bytes(&self) -> Result<Option<Bytes>, EncodeError> {
        Ok(match &self.payload {
            Some(Payload::Bytes(bytes)) => Some(bytes.clone()),
            Some(Payload::Builder(builder)) => Some(builder.encode()?),
            None => None,
        })
    }

    fn payload_len(&self) -> Result<usize, EncodeError> {
        Ok(match &self.payload {
            Some(Payload::Bytes(bytes)) => bytes.len(),
            Some(Payload::Builder(builder)) => builder.size()?,
            None => 0,
        })
    }

    fn encode_level(&self, level: usize, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let payload = if level + 1 < self.chain.len() {
            let mut inner = BytesMut::new();
            self.encode_level(level + 1, &mut inner)?;
            Some(inner.freeze())
        } else {
            self.payload_bytes()?
        };
        encode_fields(&self.codec, &self.chain[level], &self.values, payload.as_ref(), buf)
    }

    fn encode(&self) -> Result<Bytes, EncodeError> {
        let mut buf = BytesMut::new();
        self.encode_level(0, &mut buf)?;
        tracing::trace!(packet = %self.id(), len = buf.len(), "serialized");
        Ok(buf.freeze())
    }

    /// Return the number of bytes written by [`Builder::serialize`].
    pub fn size(&self) -> Result<usize, EncodeError> {
        let mut len = self.payload_len()?;
        for layout in self.chain.iter().rev() {
            len = encoded_len(&self.codec, layout, &self.values, len)?;
        }
        Ok(len)
    }

    /// Write the packet to the output buffer.
    pub fn serialize(self, buf: &mut impl BufMut) -> Result<(), EncodeError> {
        buf.put(self.encode()?);
        Ok(())
    }

    pub fn to_bytes(self) -> Result<Bytes, EncodeError> {
        self.encode()
    }

    pub fn to_vec(self) -> Result<Vec<u8>, EncodeError> {
        Ok(self.encode()?.to_vec())
    }
}
