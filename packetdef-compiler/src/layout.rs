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

//! Field layouts of packet and struct declarations.
//!
//! Layouts are computed once from the analyzed AST. They record
//! for every field its kind, its size, and how its bounds are
//! derived: from the start of the span, from its end, or from the
//! sizes of preceding dynamic fields. Bit-fields are grouped into
//! chunks of at most 64 bits, read and written as one integer.

use packetdef_runtime::ByteOrder;
use std::collections::HashMap;
use std::fmt;

use crate::analyzer::{Scope, Schema, Size};
use crate::ast;

/// Kind of a packet or struct declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclKind {
    Packet,
    Struct,
}

/// Type of array elements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Element {
    Scalar { width: usize },
    Enum { enum_id: String, width: usize },
    Struct { struct_id: String, size: Size },
    Custom { custom_id: String, width: Option<usize> },
}

/// Field kinds, with the attributes used when decoding and
/// encoding field values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldKind {
    Scalar { id: String, width: usize },
    Enum { id: String, enum_id: String, width: usize },
    /// Fixed value, enum fixed values are resolved to their tag value.
    Fixed { width: usize, value: u64 },
    Reserved { width: usize },
    /// Size in octets of the target field, plus its size modifier.
    Size { target: usize, width: usize },
    /// Number of elements of the target array.
    Count { target: usize, width: usize },
    ChecksumStart { checksum: usize },
    Checksum { id: String, checksum_id: String, width: usize, start: usize },
    Struct { id: String, struct_id: String },
    Custom { id: String, custom_id: String, width: Option<usize> },
    Array {
        id: String,
        element: Element,
        /// Constant number of elements.
        count: Option<usize>,
        /// Index of the size or count field.
        length: Option<usize>,
        size_modifier: usize,
    },
    /// Payload or body field.
    Payload { length: Option<usize>, size_modifier: usize },
}

/// Position of a bit-field within its chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitPosition {
    pub chunk: usize,
    pub shift: usize,
}

/// Offset of a field from the start of the span: a static number of
/// bits plus the sizes of dynamic fields, given by index.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Offset {
    pub bits: usize,
    pub dynamic: Vec<usize>,
}

#[derive(Debug, Clone)]
pub struct FieldLayout {
    pub kind: FieldKind,
    pub size: Size,
    /// Offset from the start of the span, when it can be computed.
    pub start: Option<Offset>,
    /// Static distance in bits between the end of the field and the
    /// end of the span, when it can be computed.
    pub end: Option<usize>,
    /// Chunk position for bit-fields.
    pub bits: Option<BitPosition>,
}

/// Group of bit-fields read and written as a single integer.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub start: Option<Offset>,
    pub end: Option<usize>,
    /// Width in bits, at most 64 and a multiple of 8.
    pub width: usize,
    pub fields: Vec<usize>,
}

#[derive(Debug, Clone)]
pub struct Layout {
    pub id: String,
    pub kind: DeclKind,
    pub parent_id: Option<String>,
    /// Values of the constrained fields of the ancestors.
    /// Enum tags are resolved to their values.
    pub constraints: Vec<(String, u64)>,
    pub fields: Vec<FieldLayout>,
    pub chunks: Vec<Chunk>,
    pub size: Size,
    /// Sum of the sizes of static fields, in bits.
    pub static_size: usize,
    pub byte_order: ByteOrder,
}

impl Element {
    pub fn size(&self) -> Size {
        match self {
            Element::Scalar { width } | Element::Enum { width, .. } => Size::Static(*width),
            Element::Struct { size, .. } => *size,
            Element::Custom { width: Some(width), .. } => Size::Static(*width),
            Element::Custom { width: None, .. } => Size::Dynamic,
        }
    }
}

impl FieldKind {
    /// Identifier of named fields.
    pub fn id(&self) -> Option<&str> {
        match self {
            FieldKind::Scalar { id, .. }
            | FieldKind::Enum { id, .. }
            | FieldKind::Checksum { id, .. }
            | FieldKind::Struct { id, .. }
            | FieldKind::Custom { id, .. }
            | FieldKind::Array { id, .. } => Some(id),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FieldKind::Scalar { .. } => "scalar",
            FieldKind::Enum { .. } => "enum",
            FieldKind::Fixed { .. } => "fixed",
            FieldKind::Reserved { .. } => "reserved",
            FieldKind::Size { .. } => "size",
            FieldKind::Count { .. } => "count",
            FieldKind::ChecksumStart { .. } => "checksum start",
            FieldKind::Checksum { .. } => "checksum",
            FieldKind::Struct { .. } => "struct",
            FieldKind::Custom { .. } => "custom",
            FieldKind::Array { .. } => "array",
            FieldKind::Payload { .. } => "payload",
        }
    }

    /// Width of bit-fields.
    pub fn bit_width(&self) -> Option<usize> {
        match self {
            FieldKind::Scalar { width, .. }
            | FieldKind::Enum { width, .. }
            | FieldKind::Fixed { width, .. }
            | FieldKind::Reserved { width }
            | FieldKind::Size { width, .. }
            | FieldKind::Count { width, .. } => Some(*width),
            _ => None,
        }
    }
}

impl Layout {
    /// Index of the field with the selected identifier.
    pub fn field_index(&self, id: &str) -> Option<usize> {
        self.fields.iter().position(|field| field.kind.id() == Some(id))
    }

    /// Index of the payload or body field.
    pub fn payload_index(&self) -> Option<usize> {
        self.fields.iter().position(|field| matches!(field.kind, FieldKind::Payload { .. }))
    }

    /// Minimum number of bytes of a valid span.
    pub fn min_len(&self) -> usize {
        self.static_size / 8
    }
}

impl Offset {
    fn advance(&self, index: usize, size: Size) -> Option<Offset> {
        match size {
            Size::Static(bits) => Some(Offset { bits: self.bits + bits, dynamic: self.dynamic.clone() }),
            Size::Dynamic => {
                let mut dynamic = self.dynamic.clone();
                dynamic.push(index);
                Some(Offset { bits: self.bits, dynamic })
            }
            Size::Unknown => None,
        }
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.bits / 8)?;
        if self.bits % 8 != 0 {
            write!(f, ".{}", self.bits % 8)?;
        }
        for index in &self.dynamic {
            write!(f, " + size(#{index})")?;
        }
        Ok(())
    }
}

fn field_kind(
    decl: &ast::Decl,
    field: &ast::Field,
    scope: &Scope,
    schema: &Schema,
    enums: &HashMap<&str, HashMap<&str, u64>>,
) -> FieldKind {
    let position = |id: &str| {
        decl.fields().position(|field| match &field.desc {
            ast::FieldDesc::Payload { .. } => id == "_payload_",
            ast::FieldDesc::Body => id == "_body_",
            _ => field.id() == Some(id),
        })
    };
    let length = |id: &str| {
        decl.fields().position(|field| match &field.desc {
            ast::FieldDesc::Size { field_id, .. } | ast::FieldDesc::Count { field_id, .. } => {
                field_id == id
            }
            _ => false,
        })
    };

    match &field.desc {
        ast::FieldDesc::Scalar { id, width } => FieldKind::Scalar { id: id.clone(), width: *width },
        ast::FieldDesc::FixedScalar { width, value } => {
            FieldKind::Fixed { width: *width, value: *value as u64 }
        }
        ast::FieldDesc::FixedEnum { enum_id, tag_id } => {
            let width = schema.field_size(field.key).static_().unwrap_or(0);
            let value = enums.get(enum_id.as_str()).and_then(|tags| tags.get(tag_id.as_str()));
            FieldKind::Fixed { width, value: value.copied().unwrap_or(0) }
        }
        ast::FieldDesc::Reserved { width } => FieldKind::Reserved { width: *width },
        ast::FieldDesc::Size { field_id, width } => {
            FieldKind::Size { target: position(field_id).unwrap_or(0), width: *width }
        }
        ast::FieldDesc::Count { field_id, width } => {
            FieldKind::Count { target: position(field_id).unwrap_or(0), width: *width }
        }
        ast::FieldDesc::Checksum { field_id } => {
            FieldKind::ChecksumStart { checksum: position(field_id).unwrap_or(0) }
        }
        ast::FieldDesc::Payload { size_modifier } => FieldKind::Payload {
            length: length("_payload_"),
            size_modifier: size_modifier.unwrap_or(0),
        },
        ast::FieldDesc::Body => FieldKind::Payload { length: length("_body_"), size_modifier: 0 },
        ast::FieldDesc::Typedef { id, type_id } => match scope.get_type_declaration(field) {
            Some(ast::Decl { desc: ast::DeclDesc::Enum { width, .. }, .. }) => {
                FieldKind::Enum { id: id.clone(), enum_id: type_id.clone(), width: *width }
            }
            Some(ast::Decl { desc: ast::DeclDesc::Checksum { width, .. }, .. }) => {
                let start = decl
                    .fields()
                    .position(|field| {
                        matches!(&field.desc, ast::FieldDesc::Checksum { field_id } if field_id == id)
                    })
                    .unwrap_or(0);
                FieldKind::Checksum {
                    id: id.clone(),
                    checksum_id: type_id.clone(),
                    width: *width,
                    start,
                }
            }
            Some(ast::Decl { desc: ast::DeclDesc::CustomField { width, .. }, .. }) => {
                FieldKind::Custom { id: id.clone(), custom_id: type_id.clone(), width: *width }
            }
            _ => FieldKind::Struct { id: id.clone(), struct_id: type_id.clone() },
        },
        ast::FieldDesc::Array { id, width, type_id, size_modifier, size } => {
            let element = match (width, scope.get_type_declaration(field)) {
                (Some(width), _) => Element::Scalar { width: *width },
                (None, Some(element @ ast::Decl { desc: ast::DeclDesc::Enum { width, .. }, .. })) => {
                    Element::Enum { enum_id: element.id().to_owned(), width: *width }
                }
                (None, Some(element @ ast::Decl { desc: ast::DeclDesc::CustomField { width, .. }, .. })) => {
                    Element::Custom { custom_id: element.id().to_owned(), width: *width }
                }
                (None, element) => Element::Struct {
                    struct_id: type_id.clone().unwrap_or_default(),
                    size: element.map(|decl| schema.total_size(decl.key)).unwrap_or_default(),
                },
            };
            FieldKind::Array {
                id: id.clone(),
                element,
                count: *size,
                length: length(id),
                size_modifier: size_modifier.unwrap_or(0),
            }
        }
        // Groups are inlined by the analyzer.
        ast::FieldDesc::Group { .. } => unreachable!(),
    }
}

/// Compute the layout of a packet or struct declaration.
fn compute(
    file: &ast::File,
    decl: &ast::Decl,
    scope: &Scope,
    schema: &Schema,
    enums: &HashMap<&str, HashMap<&str, u64>>,
) -> Layout {
    let kind = match &decl.desc {
        ast::DeclDesc::Packet { .. } => DeclKind::Packet,
        _ => DeclKind::Struct,
    };

    let mut fields: Vec<FieldLayout> = decl
        .fields()
        .map(|field| FieldLayout {
            kind: field_kind(decl, field, scope, schema, enums),
            size: schema.field_size(field.key),
            start: None,
            end: None,
            bits: None,
        })
        .collect();

    // Offsets from the start of the span.
    let mut offset = Some(Offset::default());
    for (index, field) in fields.iter_mut().enumerate() {
        field.start = offset.clone();
        offset = offset.and_then(|offset| offset.advance(index, field.size));
    }

    // Offsets from the end of the span.
    let mut end = Some(0);
    for field in fields.iter_mut().rev() {
        field.end = end;
        end = end.zip(field.size.static_()).map(|(end, size)| end + size);
    }

    // Group bit-fields into chunks.
    let mut chunks: Vec<Chunk> = vec![];
    let mut open = false;
    for index in 0..fields.len() {
        let Some(width) = fields[index].kind.bit_width() else {
            open = false;
            continue;
        };
        if !open {
            chunks.push(Chunk {
                start: fields[index].start.clone(),
                end: None,
                width: 0,
                fields: vec![],
            });
            open = true;
        }
        let chunk_index = chunks.len() - 1;
        let chunk = &mut chunks[chunk_index];
        fields[index].bits = Some(BitPosition { chunk: chunk_index, shift: chunk.width });
        chunk.width += width;
        chunk.fields.push(index);
        chunk.end = fields[index].end;
        if chunk.width % 8 == 0 {
            open = false;
        }
    }

    let constraints = scope
        .iter_constraints(decl)
        .map(|constraint| {
            let value = match (&constraint.value, &constraint.tag_id) {
                (Some(value), _) => *value as u64,
                (None, Some(tag_id)) => scope
                    .iter_parents(decl)
                    .flat_map(ast::Decl::fields)
                    .find(|field| field.id() == Some(&constraint.id))
                    .and_then(|field| match &field.desc {
                        ast::FieldDesc::Typedef { type_id, .. } => enums.get(type_id.as_str()),
                        _ => None,
                    })
                    .and_then(|tags| tags.get(tag_id.as_str()))
                    .copied()
                    .unwrap_or(0),
                (None, None) => 0,
            };
            (constraint.id.clone(), value)
        })
        .collect();

    Layout {
        id: decl.id().to_owned(),
        kind,
        parent_id: decl.parent_id().map(str::to_owned),
        constraints,
        size: schema.total_size(decl.key),
        static_size: fields.iter().filter_map(|field| field.size.static_()).sum(),
        fields,
        chunks,
        byte_order: match file.endianness {
            ast::EndiannessValue::LittleEndian => ByteOrder::LittleEndian,
            ast::EndiannessValue::BigEndian => ByteOrder::BigEndian,
        },
    }
}

/// Compute the layouts of all packet and struct declarations of an
/// analyzed file.
pub fn compute_layouts(file: &ast::File, scope: &Scope) -> HashMap<String, Layout> {
    let schema = Schema::new(file);
    let enums: HashMap<&str, HashMap<&str, u64>> = file
        .declarations
        .iter()
        .filter_map(|decl| match &decl.desc {
            ast::DeclDesc::Enum { id, tags, .. } => Some((
                id.as_str(),
                tags.iter().map(|tag| (tag.id.as_str(), tag.value as u64)).collect(),
            )),
            _ => None,
        })
        .collect();

    file.declarations
        .iter()
        .filter(|decl| matches!(&decl.desc, ast::DeclDesc::Packet { .. } | ast::DeclDesc::Struct { .. }))
        .map(|decl| (decl.id().to_owned(), compute(file, decl, scope, &schema, &enums)))
        .collect()
}
