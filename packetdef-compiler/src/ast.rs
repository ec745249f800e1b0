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

//! Syntax tree of packet definition schemas.
//!
//! Nodes deserialize from the JSON schema format: declarations and
//! fields are objects discriminated by their `kind` property.

use codespan_reporting::diagnostic::{Label, LabelStyle};
use codespan_reporting::files;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Index of a source file in the [`SourceDatabase`].
pub type FileId = usize;

/// Schema sources, kept for diagnostic rendering.
pub type SourceDatabase = files::SimpleFiles<String, String>;

/// Byte range of a node in its source file.
///
/// Positions are optional in schema files; nodes without one point
/// at the start of the file.
#[derive(Default, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRange {
    #[serde(skip)]
    pub file: FileId,
    #[serde(default)]
    pub start: usize,
    #[serde(default)]
    pub end: usize,
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndiannessValue {
    #[default]
    LittleEndian,
    BigEndian,
}

/// Named value of an enum declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tag {
    pub id: String,
    pub value: usize,
    #[serde(default)]
    pub loc: SourceRange,
}

/// Fixes the value of a parent field, or of a group field on inlining.
/// Exactly one of `value` and `tag_id` is expected, depending on
/// whether the constrained field is a scalar or an enum.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Constraint {
    pub id: String,
    pub value: Option<usize>,
    pub tag_id: Option<String>,
    #[serde(default)]
    pub loc: SourceRange,
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FieldKey(pub usize);

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeclKey(pub usize);

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "kind")]
pub enum FieldDesc {
    #[serde(rename = "scalar_field")]
    Scalar { id: String, width: usize },
    /// Field whose type is an enum, struct, custom field, or checksum
    /// declaration.
    #[serde(rename = "typedef_field")]
    Typedef { id: String, type_id: String },
    /// Elements are either scalars of `width` bits or values of the
    /// type `type_id`. The element count is either constant (`size`),
    /// carried by a size or count field, or implied by the span.
    #[serde(rename = "array_field")]
    Array {
        id: String,
        width: Option<usize>,
        type_id: Option<String>,
        /// Octets added to the array size by its size field.
        size_modifier: Option<usize>,
        size: Option<usize>,
    },
    /// Octet size of the array `field_id`, or of the payload when
    /// `field_id` is `_payload_` or `_body_`.
    #[serde(rename = "size_field")]
    Size { field_id: String, width: usize },
    /// Element count of the array `field_id`.
    #[serde(rename = "count_field")]
    Count { field_id: String, width: usize },
    #[serde(rename = "fixed_scalar_field")]
    FixedScalar { width: usize, value: usize },
    #[serde(rename = "fixed_enum_field")]
    FixedEnum { enum_id: String, tag_id: String },
    #[serde(rename = "reserved_field")]
    Reserved { width: usize },
    /// Marks where the span covered by the checksum field `field_id`
    /// begins. Occupies no bits.
    #[serde(rename = "checksum_field")]
    Checksum { field_id: String },
    #[serde(rename = "payload_field")]
    Payload { size_modifier: Option<usize> },
    #[serde(rename = "body_field")]
    Body,
    /// Replaced by the fields of `group_id` during analysis.
    #[serde(rename = "group_field")]
    Group {
        group_id: String,
        #[serde(default)]
        constraints: Vec<Constraint>,
    },
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Field {
    #[serde(flatten)]
    pub desc: FieldDesc,
    #[serde(default)]
    pub loc: SourceRange,
    /// Assigned by the parser, unique within the file.
    #[serde(skip)]
    pub key: FieldKey,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "kind")]
pub enum DeclDesc {
    #[serde(rename = "packet_declaration")]
    Packet {
        id: String,
        parent_id: Option<String>,
        #[serde(default)]
        constraints: Vec<Constraint>,
        #[serde(default)]
        fields: Vec<Field>,
    },
    #[serde(rename = "struct_declaration")]
    Struct {
        id: String,
        parent_id: Option<String>,
        #[serde(default)]
        constraints: Vec<Constraint>,
        #[serde(default)]
        fields: Vec<Field>,
    },
    #[serde(rename = "group_declaration")]
    Group { id: String, fields: Vec<Field> },
    #[serde(rename = "enum_declaration")]
    Enum { id: String, width: usize, tags: Vec<Tag> },
    /// `function` names an entry of the checksum registry.
    #[serde(rename = "checksum_declaration")]
    Checksum { id: String, width: usize, function: String },
    /// `function` names an entry of the custom field registry. Custom
    /// fields without a width delimit themselves.
    #[serde(rename = "custom_field_declaration")]
    CustomField { id: String, width: Option<usize>, function: String },
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Decl {
    #[serde(flatten)]
    pub desc: DeclDesc,
    #[serde(default)]
    pub loc: SourceRange,
    /// Assigned by the parser, unique within the file.
    #[serde(skip)]
    pub key: DeclKey,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct File {
    #[serde(default)]
    pub endianness: EndiannessValue,
    pub declarations: Vec<Decl>,
    #[serde(skip)]
    pub file: FileId,
}

/// Implement equality over the listed members only, so that nodes
/// compare equal regardless of their source ranges and keys.
macro_rules! structural_eq {
    ($($node:ty => $($member:ident),+;)*) => {
        $(
            impl PartialEq for $node {
                fn eq(&self, other: &Self) -> bool {
                    $(self.$member == other.$member)&&+
                }
            }

            impl Eq for $node {}
        )*
    };
}

structural_eq! {
    Tag => id, value;
    Constraint => id, value, tag_id;
    Field => desc;
    Decl => desc;
    File => endianness, declarations;
}

impl SourceRange {
    fn label(&self, style: LabelStyle) -> Label<FileId> {
        Label::new(style, self.file, self.start..self.end)
    }

    pub fn primary(&self) -> Label<FileId> {
        self.label(LabelStyle::Primary)
    }

    pub fn secondary(&self) -> Label<FileId> {
        self.label(LabelStyle::Secondary)
    }
}

impl fmt::Debug for SourceRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}..{}", self.file, self.start, self.end)
    }
}

impl File {
    /// Iterate over the declarations that name `decl` as parent.
    pub fn iter_children<'d>(&'d self, decl: &'d Decl) -> impl Iterator<Item = &'d Decl> {
        let id = decl.id();
        self.declarations.iter().filter(move |child| child.parent_id() == Some(id))
    }
}

impl Decl {
    pub fn id(&self) -> &str {
        let (DeclDesc::Packet { id, .. }
        | DeclDesc::Struct { id, .. }
        | DeclDesc::Group { id, .. }
        | DeclDesc::Enum { id, .. }
        | DeclDesc::Checksum { id, .. }
        | DeclDesc::CustomField { id, .. }) = &self.desc;
        id
    }

    pub fn parent_id(&self) -> Option<&str> {
        match &self.desc {
            DeclDesc::Packet { parent_id: Some(id), .. }
            | DeclDesc::Struct { parent_id: Some(id), .. } => Some(id),
            _ => None,
        }
    }

    pub fn constraints(&self) -> std::slice::Iter<'_, Constraint> {
        let constraints: &[Constraint] = match &self.desc {
            DeclDesc::Packet { constraints, .. } | DeclDesc::Struct { constraints, .. } => {
                constraints
            }
            _ => &[],
        };
        constraints.iter()
    }

    pub fn fields(&self) -> std::slice::Iter<'_, Field> {
        let fields: &[Field] = match &self.desc {
            DeclDesc::Packet { fields, .. }
            | DeclDesc::Struct { fields, .. }
            | DeclDesc::Group { fields, .. } => fields,
            _ => &[],
        };
        fields.iter()
    }

    /// Return the payload or body field, if declared.
    pub fn payload(&self) -> Option<&Field> {
        self.fields().find(|field| field.is_payload())
    }

    /// Return the size field of the payload or body, if declared.
    pub fn payload_size(&self) -> Option<&Field> {
        self.fields().find(|field| {
            matches!(&field.desc, FieldDesc::Size { field_id, .. }
                if field_id == "_payload_" || field_id == "_body_")
        })
    }

    /// Return the size or count field of the array `id`, if declared.
    pub fn array_size(&self, id: &str) -> Option<&Field> {
        self.fields().find(|field| field.sized_id() == Some(id))
    }

    pub fn kind(&self) -> &'static str {
        use DeclDesc::*;
        match &self.desc {
            Packet { .. } => "packet",
            Struct { .. } => "struct",
            Group { .. } => "group",
            Enum { .. } => "enum",
            Checksum { .. } => "checksum",
            CustomField { .. } => "custom field",
        }
    }
}

impl Field {
    /// Return the field identifier. Only scalar, typedef, and array
    /// fields are named.
    pub fn id(&self) -> Option<&str> {
        match &self.desc {
            FieldDesc::Scalar { id, .. }
            | FieldDesc::Typedef { id, .. }
            | FieldDesc::Array { id, .. } => Some(id),
            _ => None,
        }
    }

    /// Return the identifier of the field sized or counted by this
    /// size or count field.
    pub fn sized_id(&self) -> Option<&str> {
        match &self.desc {
            FieldDesc::Size { field_id, .. } | FieldDesc::Count { field_id, .. } => {
                Some(field_id)
            }
            _ => None,
        }
    }

    pub fn is_payload(&self) -> bool {
        matches!(&self.desc, FieldDesc::Payload { .. } | FieldDesc::Body)
    }

    pub fn kind(&self) -> &'static str {
        use FieldDesc::*;
        match &self.desc {
            Scalar { .. } => "scalar",
            Typedef { .. } => "typedef",
            Array { .. } => "array",
            Size { .. } => "size",
            Count { .. } => "count",
            FixedScalar { .. } | FixedEnum { .. } => "fixed",
            Reserved { .. } => "reserved",
            Checksum { .. } => "checksum start",
            Payload { .. } => "payload",
            Body => "body",
            Group { .. } => "group",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_range_labels() {
        let loc = SourceRange { file: 2, start: 10, end: 14 };
        let label = loc.primary();
        assert_eq!(label.style, LabelStyle::Primary);
        assert_eq!(label.file_id, 2);
        assert_eq!(label.range, 10..14);
        assert_eq!(loc.secondary().style, LabelStyle::Secondary);
    }

    #[test]
    fn field_desc_from_json() {
        let field: Field =
            serde_json::from_str(r#"{ "kind": "scalar_field", "id": "a", "width": 7 }"#).unwrap();
        assert_eq!(field.desc, FieldDesc::Scalar { id: "a".to_owned(), width: 7 });
        assert_eq!(field.id(), Some("a"));

        let field: Field = serde_json::from_str(
            r#"{ "kind": "payload_field", "loc": { "start": 4, "end": 9 } }"#,
        )
        .unwrap();
        assert_eq!(field.desc, FieldDesc::Payload { size_modifier: None });
        assert_eq!((field.loc.start, field.loc.end), (4, 9));
        assert!(field.is_payload());
        assert_eq!(field.id(), None);

        let field: Field =
            serde_json::from_str(r#"{ "kind": "count_field", "field_id": "a", "width": 8 }"#)
                .unwrap();
        assert_eq!(field.sized_id(), Some("a"));
    }

    #[test]
    fn decl_desc_from_json() {
        let decl: Decl = serde_json::from_str(
            r#"{
                "kind": "packet_declaration",
                "id": "Child",
                "parent_id": "Parent",
                "constraints": [{ "id": "opcode", "tag_id": "ONE" }],
                "fields": [
                    { "kind": "size_field", "field_id": "_body_", "width": 8 },
                    { "kind": "body_field" }
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(decl.id(), "Child");
        assert_eq!(decl.parent_id(), Some("Parent"));
        assert_eq!(decl.constraints().count(), 1);
        assert!(decl.payload().is_some());
        assert!(decl.payload_size().is_some());
        assert_eq!(decl.kind(), "packet");
    }

    #[test]
    fn equality_ignores_source_ranges() {
        let tag = |start| Tag {
            id: "A".to_owned(),
            value: 1,
            loc: SourceRange { file: 0, start, end: start + 1 },
        };
        assert_eq!(tag(0), tag(12));
        assert_ne!(tag(0), Tag { value: 2, ..tag(0) });
    }
}
