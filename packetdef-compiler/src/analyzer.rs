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

//! Semantic checks of schema files.
//!
//! [`analyze`] validates a parsed schema in stages, stopping at the
//! first stage that raises diagnostics, and returns the schema with
//! group fields inlined. The [`Scope`] and [`Schema`] tables it builds
//! are reused by the layout computation.

use codespan_reporting::diagnostic::Diagnostic;
use codespan_reporting::files;
use codespan_reporting::term;
use codespan_reporting::term::termcolor;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hash;

use crate::ast::*;

/// Size of a field or declaration.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Size {
    /// Known when the schema is compiled, in bits.
    Static(usize),
    /// Known when the packet is decoded, from a size or count field
    /// or from the content of the field.
    Dynamic,
    /// Only known from the span: the field takes whatever the static
    /// fields after it leave.
    #[default]
    Unknown,
}

impl std::ops::Add for Size {
    type Output = Size;
    fn add(self, rhs: Size) -> Size {
        match (self, rhs) {
            (Size::Static(lhs), Size::Static(rhs)) => Size::Static(lhs + rhs),
            (Size::Unknown, _) | (_, Size::Unknown) => Size::Unknown,
            _ => Size::Dynamic,
        }
    }
}

impl std::ops::Mul<usize> for Size {
    type Output = Size;
    fn mul(self, count: usize) -> Size {
        match self {
            Size::Static(bits) => Size::Static(bits * count),
            size => size,
        }
    }
}

impl Size {
    /// Return the size in bits if it is static.
    pub fn static_(&self) -> Option<usize> {
        match *self {
            Size::Static(bits) => Some(bits),
            _ => None,
        }
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Size::Static(bits) => write!(f, "{bits} bits"),
            Size::Dynamic => f.write_str("dynamic"),
            Size::Unknown => f.write_str("unknown"),
        }
    }
}

/// Codes of the diagnostics raised by the analyzer.
#[repr(u16)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorCode {
    DuplicateDeclIdentifier = 1,
    RecursiveDecl = 2,
    UndeclaredGroupIdentifier = 3,
    InvalidGroupIdentifier = 4,
    UndeclaredTypeIdentifier = 5,
    InvalidTypeIdentifier = 6,
    UndeclaredParentIdentifier = 7,
    InvalidParentIdentifier = 8,
    DuplicateFieldIdentifier = 11,
    DuplicateTagIdentifier = 12,
    DuplicateTagValue = 13,
    InvalidTagValue = 14,
    UndeclaredConstraintIdentifier = 15,
    InvalidConstraintIdentifier = 16,
    InvalidConstraintScalarValue = 17,
    ConstraintValueOutOfRange = 18,
    InvalidConstraintEnumValue = 19,
    UndeclaredConstraintTag = 20,
    InvalidConstraintTypedef = 21,
    DuplicateConstraintIdentifier = 22,
    DuplicateSizeField = 23,
    UndeclaredSizeIdentifier = 24,
    InvalidSizeIdentifier = 25,
    DuplicateCountField = 26,
    UndeclaredCountIdentifier = 27,
    InvalidCountIdentifier = 28,
    FixedValueOutOfRange = 32,
    UndeclaredFixedEnumIdentifier = 33,
    UndeclaredFixedTagIdentifier = 34,
    InvalidFixedEnumIdentifier = 35,
    DuplicatePayloadField = 36,
    MissingPayloadField = 37,
    RedundantArraySize = 38,
    InvalidFieldOffset = 51,
    InvalidFieldSize = 52,
    InvalidPacketSize = 53,
    UnresolvedFieldOffset = 54,
    InvalidStructField = 55,
    UndeclaredChecksumIdentifier = 56,
    InvalidChecksumIdentifier = 57,
    ChecksumBeforeStart = 58,
    SizeFieldAfterTarget = 59,
    InvalidSizeModifier = 60,
    InvalidArrayElement = 61,
    UndeclaredFunction = 62,
    InvalidScalarWidth = 63,
    MissingChecksumStart = 64,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "E{}", *self as u16)
    }
}

impl From<ErrorCode> for String {
    fn from(code: ErrorCode) -> Self {
        code.to_string()
    }
}

/// Diagnostics raised by one analysis stage.
#[derive(Debug, Default)]
pub struct Diagnostics {
    pub diagnostics: Vec<Diagnostic<FileId>>,
}

impl Diagnostics {
    pub fn is_empty(&self) -> bool {
        self.diagnostics.is_empty()
    }

    pub fn push(&mut self, diagnostic: Diagnostic<FileId>) {
        self.diagnostics.push(diagnostic)
    }

    /// Return `value` if no diagnostic was raised.
    pub fn err_or<T>(self, value: T) -> Result<T, Diagnostics> {
        if self.is_empty() {
            Ok(value)
        } else {
            Err(self)
        }
    }

    /// Render the diagnostics against their sources.
    pub fn emit(
        &self,
        sources: &SourceDatabase,
        writer: &mut dyn termcolor::WriteColor,
    ) -> Result<(), files::Error> {
        let config = term::Config::default();
        self.diagnostics
            .iter()
            .try_for_each(|diagnostic| term::emit(writer, &config, sources, diagnostic))
    }
}

/// Start an error diagnostic pointing at `loc`.
fn error(code: ErrorCode, loc: &SourceRange, message: impl Into<String>) -> Diagnostic<FileId> {
    Diagnostic::error().with_code(code).with_message(message).with_labels(vec![loc.primary()])
}

/// Shorthands for the secondary labels and notes of analyzer
/// diagnostics.
trait Annotate {
    fn related(self, loc: &SourceRange) -> Self;
    fn related_with(self, loc: &SourceRange, message: impl Into<String>) -> Self;
    fn hint(self, text: &str) -> Self;
}

impl Annotate for Diagnostic<FileId> {
    fn related(self, loc: &SourceRange) -> Self {
        self.with_labels(vec![loc.secondary()])
    }

    fn related_with(self, loc: &SourceRange, message: impl Into<String>) -> Self {
        self.with_labels(vec![loc.secondary().with_message(message)])
    }

    fn hint(self, text: &str) -> Self {
        self.with_notes(vec![format!("hint: {text}")])
    }
}

/// Record `value` under `key` unless the key is taken, in which case
/// the value recorded first is returned.
fn first_occurrence<K: Hash + Eq, V: Copy>(
    seen: &mut HashMap<K, V>,
    key: K,
    value: V,
) -> Option<V> {
    match seen.entry(key) {
        Entry::Occupied(entry) => Some(*entry.get()),
        Entry::Vacant(entry) => {
            entry.insert(value);
            None
        }
    }
}

/// Test whether `value` can be represented with `width` bits.
fn fits(value: usize, width: usize) -> bool {
    width >= usize::BITS as usize || value >> width == 0
}

/// Declarations of a schema, by identifier.
#[derive(Debug)]
pub struct Scope<'d> {
    pub file: &'d File,
    /// Every declaration, whatever its kind.
    pub typedef: HashMap<String, &'d Decl>,
}

impl<'d> Scope<'d> {
    /// Index the declarations of `file`. Fails if two declarations
    /// share an identifier.
    pub fn new(file: &'d File) -> Result<Scope<'d>, Diagnostics> {
        let mut typedef = HashMap::new();
        let mut diagnostics = Diagnostics::default();
        for decl in &file.declarations {
            if let Some(first) = first_occurrence(&mut typedef, decl.id().to_owned(), decl) {
                diagnostics.push(
                    error(
                        ErrorCode::DuplicateDeclIdentifier,
                        &decl.loc,
                        format!("redeclaration of {} identifier `{}`", decl.kind(), decl.id()),
                    )
                    .related_with(&first.loc, format!("`{}` is first declared here", decl.id())),
                )
            }
        }
        diagnostics.err_or(Scope { file, typedef })
    }

    pub fn iter_children<'s>(&'s self, decl: &'d Decl) -> impl Iterator<Item = &'d Decl> + 's {
        self.file.iter_children(decl)
    }

    pub fn get_parent(&self, decl: &Decl) -> Option<&'d Decl> {
        self.typedef.get(decl.parent_id()?).copied()
    }

    /// Iterate over the ancestors of `decl`, closest first.
    pub fn iter_parents<'s>(&'s self, decl: &'d Decl) -> impl Iterator<Item = &'d Decl> + 's {
        self.iter_parents_and_self(decl).skip(1)
    }

    /// Iterate over `decl` then its ancestors.
    pub fn iter_parents_and_self<'s>(
        &'s self,
        decl: &'d Decl,
    ) -> impl Iterator<Item = &'d Decl> + 's {
        std::iter::successors(Some(decl), |decl| self.get_parent(decl))
    }

    /// Iterate over the fields of `decl` then of its ancestors.
    pub fn iter_fields<'s>(&'s self, decl: &'d Decl) -> impl Iterator<Item = &'d Field> + 's {
        self.iter_parents_and_self(decl).flat_map(Decl::fields)
    }

    /// Iterate over the fields of the ancestors of `decl`.
    pub fn iter_parent_fields<'s>(
        &'s self,
        decl: &'d Decl,
    ) -> impl Iterator<Item = &'d Field> + 's {
        self.iter_parents(decl).flat_map(Decl::fields)
    }

    /// Iterate over the constraints of `decl` then of its ancestors.
    pub fn iter_constraints<'s>(
        &'s self,
        decl: &'d Decl,
    ) -> impl Iterator<Item = &'d Constraint> + 's {
        self.iter_parents_and_self(decl).flat_map(Decl::constraints)
    }

    /// Return the declaration of the field type, for typedef, typed
    /// array, and fixed enum fields.
    pub fn get_type_declaration(&self, field: &Field) -> Option<&'d Decl> {
        let type_id = match &field.desc {
            FieldDesc::Typedef { type_id, .. }
            | FieldDesc::Array { type_id: Some(type_id), .. }
            | FieldDesc::FixedEnum { enum_id: type_id, .. } => type_id,
            _ => return None,
        };
        self.typedef.get(type_id).copied()
    }

    /// Test whether the field is packed with its neighbours into
    /// bit-field chunks.
    pub fn is_bitfield(&self, field: &Field) -> bool {
        match &field.desc {
            FieldDesc::Scalar { .. }
            | FieldDesc::Size { .. }
            | FieldDesc::Count { .. }
            | FieldDesc::FixedScalar { .. }
            | FieldDesc::FixedEnum { .. }
            | FieldDesc::Reserved { .. } => true,
            FieldDesc::Typedef { .. } => matches!(
                self.get_type_declaration(field),
                Some(Decl { desc: DeclDesc::Enum { .. }, .. })
            ),
            _ => false,
        }
    }
}

/// Sizes of the fields and declarations of a schema.
#[derive(Debug)]
pub struct Schema {
    decl_size: HashMap<DeclKey, Size>,
    field_size: HashMap<FieldKey, Size>,
    payload_size: HashMap<DeclKey, Size>,
}

/// Walks declarations depth first so that types are sized before
/// the fields that use them.
struct Sizer<'d> {
    schema: Schema,
    typedef: HashMap<&'d str, &'d Decl>,
    visiting: HashSet<DeclKey>,
}

impl<'d> Sizer<'d> {
    /// Size `decl` and return its total size, payload included.
    fn decl(&mut self, decl: &'d Decl) -> Size {
        if self.schema.decl_size.contains_key(&decl.key) {
            return self.schema.total_size(decl.key);
        }
        // A declaration reached again while it is being sized is an
        // element of one of its own arrays, which are dynamically sized.
        if !self.visiting.insert(decl.key) {
            return Size::Dynamic;
        }

        let (size, payload) = match &decl.desc {
            DeclDesc::Enum { width, .. }
            | DeclDesc::Checksum { width, .. }
            | DeclDesc::CustomField { width: Some(width), .. } => {
                (Size::Static(*width), Size::Static(0))
            }
            DeclDesc::CustomField { width: None, .. } => (Size::Dynamic, Size::Static(0)),
            DeclDesc::Packet { .. } | DeclDesc::Struct { .. } | DeclDesc::Group { .. } => {
                let mut size = Size::Static(0);
                let mut payload = Size::Static(0);
                for field in decl.fields() {
                    let field_size = self.field(decl, field);
                    if field.is_payload() {
                        payload = field_size;
                    } else {
                        size = size + field_size;
                    }
                }
                (size, payload)
            }
        };

        self.visiting.remove(&decl.key);
        self.schema.decl_size.insert(decl.key, size);
        self.schema.payload_size.insert(decl.key, payload);
        size + payload
    }

    fn type_id(&mut self, type_id: &str) -> Size {
        match self.typedef.get(type_id).copied() {
            Some(decl) => self.decl(decl),
            None => Size::Unknown,
        }
    }

    fn field(&mut self, decl: &'d Decl, field: &'d Field) -> Size {
        let delimited = |size_field: Option<&Field>| match size_field {
            Some(_) => Size::Dynamic,
            None => Size::Unknown,
        };
        let size = match &field.desc {
            FieldDesc::Scalar { width, .. }
            | FieldDesc::Size { width, .. }
            | FieldDesc::Count { width, .. }
            | FieldDesc::FixedScalar { width, .. }
            | FieldDesc::Reserved { width } => Size::Static(*width),
            FieldDesc::Checksum { .. } => Size::Static(0),
            FieldDesc::Payload { .. } | FieldDesc::Body => delimited(decl.payload_size()),
            FieldDesc::Typedef { type_id, .. }
            | FieldDesc::FixedEnum { enum_id: type_id, .. }
            | FieldDesc::Group { group_id: type_id, .. } => self.type_id(type_id),
            FieldDesc::Array { size: Some(count), width: Some(width), .. } => {
                Size::Static(count * width)
            }
            FieldDesc::Array { size: Some(count), width: None, type_id: Some(type_id), .. } => {
                self.type_id(type_id) * *count
            }
            FieldDesc::Array { size: None, id, .. } => delimited(decl.array_size(id)),
            FieldDesc::Array { .. } => Size::Unknown,
        };
        self.schema.field_size.insert(field.key, size);
        size
    }
}

impl Schema {
    /// Size every field and declaration of `file`. Declarations are
    /// sized on first use, so declaration order does not matter.
    pub fn new(file: &File) -> Schema {
        let mut sizer = Sizer {
            schema: Schema {
                decl_size: HashMap::new(),
                field_size: HashMap::new(),
                payload_size: HashMap::new(),
            },
            typedef: file.declarations.iter().map(|decl| (decl.id(), decl)).collect(),
            visiting: HashSet::new(),
        };
        for decl in &file.declarations {
            sizer.decl(decl);
        }
        sizer.schema
    }

    pub fn field_size(&self, key: FieldKey) -> Size {
        self.field_size.get(&key).copied().unwrap_or_default()
    }

    /// Size of the declaration, excluding the payload.
    pub fn decl_size(&self, key: DeclKey) -> Size {
        self.decl_size.get(&key).copied().unwrap_or_default()
    }

    pub fn payload_size(&self, key: DeclKey) -> Size {
        self.payload_size.get(&key).copied().unwrap_or(Size::Static(0))
    }

    pub fn total_size(&self, key: DeclKey) -> Size {
        self.decl_size(key) + self.payload_size(key)
    }
}

/// Visit state of a declaration in the dependency walk.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Visit {
    InProgress,
    Done,
}

/// Runs the checks of one analysis stage.
struct Checker<'a, 'd> {
    scope: &'a Scope<'d>,
    diagnostics: Diagnostics,
}

impl<'a, 'd> Checker<'a, 'd> {
    fn new(scope: &'a Scope<'d>) -> Self {
        Checker { scope, diagnostics: Diagnostics::default() }
    }

    /// Run one check, failing with the diagnostics it raised.
    fn run(&mut self, check: impl FnOnce(&mut Self)) -> Result<(), Diagnostics> {
        check(self);
        std::mem::take(&mut self.diagnostics).err_or(())
    }

    fn decls(&self) -> std::slice::Iter<'d, Decl> {
        self.scope.file.declarations.iter()
    }

    fn report(&mut self, diagnostic: Diagnostic<FileId>) {
        self.diagnostics.push(diagnostic)
    }

    /// Resolve the parent, group, and type identifiers, and reject
    /// declarations that contain or extend themselves.
    fn decl_identifiers(&mut self) {
        let mut visits = HashMap::new();
        for decl in self.decls() {
            if matches!(
                decl.desc,
                DeclDesc::Packet { .. } | DeclDesc::Struct { .. } | DeclDesc::Group { .. }
            ) {
                self.visit(decl, &mut visits);
            }
        }
    }

    fn visit(&mut self, decl: &'d Decl, visits: &mut HashMap<&'d str, Visit>) {
        match visits.get(decl.id()) {
            Some(Visit::Done) => return,
            Some(Visit::InProgress) => {
                self.report(error(
                    ErrorCode::RecursiveDecl,
                    &decl.loc,
                    format!("recursive declaration of {} `{}`", decl.kind(), decl.id()),
                ));
                return;
            }
            None => (),
        }

        visits.insert(decl.id(), Visit::InProgress);
        for field in decl.fields() {
            if let Some(dependency) = self.field_dependency(field) {
                self.visit(dependency, visits);
            }
        }
        if let Some(parent) = self.parent_dependency(decl) {
            self.visit(parent, visits);
        }
        visits.insert(decl.id(), Visit::Done);
    }

    /// Resolve the group or type referenced by `field`. Returns the
    /// declaration if it is embedded in the field.
    fn field_dependency(&mut self, field: &Field) -> Option<&'d Decl> {
        let scope = self.scope;
        match &field.desc {
            FieldDesc::Group { group_id, .. } => match scope.typedef.get(group_id).copied() {
                Some(group @ Decl { desc: DeclDesc::Group { .. }, .. }) => Some(group),
                other => {
                    let (code, adjective) = match other {
                        None => (ErrorCode::UndeclaredGroupIdentifier, "undeclared"),
                        Some(_) => (ErrorCode::InvalidGroupIdentifier, "invalid"),
                    };
                    let message = format!("{adjective} group identifier `{group_id}`");
                    self.report(error(code, &field.loc, message).hint("expected group identifier"));
                    None
                }
            },
            FieldDesc::Typedef { type_id, .. }
            | FieldDesc::Array { type_id: Some(type_id), .. } => {
                let hint = "expected enum, struct, custom_field, or checksum identifier";
                match scope.typedef.get(type_id).copied() {
                    None => {
                        self.report(
                            error(
                                ErrorCode::UndeclaredTypeIdentifier,
                                &field.loc,
                                format!("undeclared {} identifier `{type_id}`", field.kind()),
                            )
                            .hint(hint),
                        );
                        None
                    }
                    Some(Decl { desc: DeclDesc::Packet { .. } | DeclDesc::Group { .. }, .. }) => {
                        self.report(
                            error(
                                ErrorCode::InvalidTypeIdentifier,
                                &field.loc,
                                format!("invalid {} identifier `{type_id}`", field.kind()),
                            )
                            .hint(hint),
                        );
                        None
                    }
                    // Arrays without a constant size may contain their
                    // own element type, as nested TLVs do.
                    Some(decl) => match &field.desc {
                        FieldDesc::Array { size: None, .. } => None,
                        _ => Some(decl),
                    },
                }
            }
            _ => None,
        }
    }

    /// Resolve the parent of `decl`, which must be of the same kind.
    fn parent_dependency(&mut self, decl: &Decl) -> Option<&'d Decl> {
        let parent_id = decl.parent_id()?;
        let parent = self.scope.typedef.get(parent_id).copied();
        let (code, adjective) = match parent {
            Some(parent) if parent.kind() == decl.kind() => return Some(parent),
            Some(_) => (ErrorCode::InvalidParentIdentifier, "invalid"),
            None => (ErrorCode::UndeclaredParentIdentifier, "undeclared"),
        };
        self.report(
            error(code, &decl.loc, format!("{adjective} parent identifier `{parent_id}`"))
                .hint(&format!("expected {} identifier", decl.kind())),
        );
        None
    }

    /// Reject field identifiers declared twice in a declaration, or
    /// shadowing a field of an ancestor.
    fn field_identifiers(&mut self) {
        let scope = self.scope;
        for decl in self.decls() {
            let mut declared: HashMap<&str, &Field> = scope
                .iter_parent_fields(decl)
                .filter_map(|field| Some((field.id()?, field)))
                .collect();
            for field in decl.fields() {
                let Some(id) = field.id() else { continue };
                if let Some(first) = first_occurrence(&mut declared, id, field) {
                    self.report(
                        error(
                            ErrorCode::DuplicateFieldIdentifier,
                            &field.loc,
                            format!("redeclaration of {} field identifier `{id}`", field.kind()),
                        )
                        .related_with(&first.loc, format!("`{id}` is first declared here")),
                    )
                }
            }
        }
    }

    /// Reject duplicate tag identifiers and values, and tag values
    /// that do not fit the enum width.
    fn enum_declarations(&mut self) {
        for decl in self.decls() {
            let DeclDesc::Enum { tags, width, .. } = &decl.desc else { continue };
            let mut ids = HashMap::new();
            let mut values = HashMap::new();
            for tag in tags {
                if let Some(first) = first_occurrence(&mut ids, tag.id.as_str(), &tag.loc) {
                    self.report(
                        error(
                            ErrorCode::DuplicateTagIdentifier,
                            &tag.loc,
                            format!("duplicate tag identifier `{}`", tag.id),
                        )
                        .related_with(first, format!("`{}` is first declared here", tag.id)),
                    )
                }
                if let Some(first) = first_occurrence(&mut values, tag.value, &tag.loc) {
                    self.report(
                        error(
                            ErrorCode::DuplicateTagValue,
                            &tag.loc,
                            format!("duplicate tag value `{}`", tag.value),
                        )
                        .related_with(first, format!("`{}` is first declared here", tag.value)),
                    )
                }
                if !fits(tag.value, *width) {
                    self.report(error(
                        ErrorCode::InvalidTagValue,
                        &tag.loc,
                        format!("tag value `{}` does not fit in {width} bits", tag.value),
                    ))
                }
            }
        }
    }

    /// Scalars span 1 to 64 bits; checksums, custom fields, and array
    /// elements span whole octets.
    fn widths(&mut self) {
        let scalar = |width: usize| (1..=64).contains(&width);
        let octets = |width: usize| width > 0 && width % 8 == 0;

        for decl in self.decls() {
            match &decl.desc {
                DeclDesc::Enum { width, .. } if !scalar(*width) => self.report(
                    error(
                        ErrorCode::InvalidScalarWidth,
                        &decl.loc,
                        format!("invalid enum width `{width}`"),
                    )
                    .hint("expected a width between 1 and 64"),
                ),
                DeclDesc::Checksum { width, .. } if !(scalar(*width) && octets(*width)) => self
                    .report(
                        error(
                            ErrorCode::InvalidFieldSize,
                            &decl.loc,
                            format!("invalid checksum width `{width}`"),
                        )
                        .hint("expected an integral number of octets, at most 64 bits"),
                    ),
                DeclDesc::CustomField { width: Some(width), .. } if !octets(*width) => self
                    .report(
                        error(
                            ErrorCode::InvalidFieldSize,
                            &decl.loc,
                            format!("invalid custom field width `{width}`"),
                        )
                        .hint("expected an integral number of octets"),
                    ),
                _ => (),
            }

            for field in decl.fields() {
                match &field.desc {
                    FieldDesc::Scalar { width, .. }
                    | FieldDesc::Size { width, .. }
                    | FieldDesc::Count { width, .. }
                    | FieldDesc::FixedScalar { width, .. }
                    | FieldDesc::Reserved { width }
                        if !scalar(*width) =>
                    {
                        self.report(
                            error(
                                ErrorCode::InvalidScalarWidth,
                                &field.loc,
                                format!("invalid {} field width `{width}`", field.kind()),
                            )
                            .hint("expected a width between 1 and 64"),
                        )
                    }
                    FieldDesc::Array { width: Some(width), .. }
                        if !(scalar(*width) && octets(*width)) =>
                    {
                        self.report(error(
                            ErrorCode::InvalidFieldSize,
                            &field.loc,
                            "array element size is not an integral number of octets",
                        ))
                    }
                    _ => (),
                }
            }
        }
    }

    /// Check one constraint against the fields of `decl` and its
    /// ancestors.
    fn constraint(&mut self, constraint: &Constraint, decl: &'d Decl) {
        let scope = self.scope;
        let id = &constraint.id;
        let Some(field) = scope.iter_fields(decl).find(|field| field.id() == Some(id)) else {
            self.report(
                error(
                    ErrorCode::UndeclaredConstraintIdentifier,
                    &constraint.loc,
                    format!("undeclared constraint identifier `{id}`"),
                )
                .hint("expected scalar or typedef identifier"),
            );
            return;
        };
        let declared_as = |what: &str| format!("`{id}` is declared here as {what}");

        match &field.desc {
            FieldDesc::Scalar { width, .. } => match constraint.value {
                Some(value) if !fits(value, *width) => self.report(
                    error(
                        ErrorCode::ConstraintValueOutOfRange,
                        &constraint.loc,
                        format!("constraint value `{value}` is larger than maximum value"),
                    )
                    .related(&field.loc),
                ),
                Some(_) => (),
                None => self.report(
                    error(
                        ErrorCode::InvalidConstraintScalarValue,
                        &constraint.loc,
                        format!(
                            "invalid constraint value `{}`",
                            constraint.tag_id.as_deref().unwrap_or_default()
                        ),
                    )
                    .related_with(&field.loc, declared_as("scalar field"))
                    .hint("expected scalar value"),
                ),
            },
            FieldDesc::Typedef { type_id, .. } => match scope.typedef.get(type_id).copied() {
                Some(Decl { desc: DeclDesc::Enum { tags, .. }, .. }) => match &constraint.tag_id {
                    Some(tag_id) if tags.iter().any(|tag| &tag.id == tag_id) => (),
                    Some(tag_id) => self.report(
                        error(
                            ErrorCode::UndeclaredConstraintTag,
                            &constraint.loc,
                            format!("undeclared enum tag `{tag_id}`"),
                        )
                        .related_with(&field.loc, format!("`{id}` is declared here")),
                    ),
                    None => self.report(
                        error(
                            ErrorCode::InvalidConstraintEnumValue,
                            &constraint.loc,
                            format!(
                                "invalid constraint value `{}`",
                                constraint.value.unwrap_or_default()
                            ),
                        )
                        .related_with(&field.loc, declared_as("typedef field"))
                        .hint("expected enum value"),
                    ),
                },
                Some(type_decl) => self.report(
                    error(
                        ErrorCode::InvalidConstraintTypedef,
                        &constraint.loc,
                        format!("invalid constraint identifier `{id}`"),
                    )
                    .related_with(
                        &field.loc,
                        declared_as(&format!("{} typedef field", type_decl.kind())),
                    )
                    .hint("expected enum value"),
                ),
                None => (),
            },
            _ => self.report(
                error(
                    ErrorCode::InvalidConstraintIdentifier,
                    &constraint.loc,
                    format!("invalid constraint identifier `{id}`"),
                )
                .related_with(&field.loc, declared_as(&format!("{} field", field.kind())))
                .hint("expected scalar or typedef identifier"),
            ),
        }
    }

    /// Check a list of constraints on the fields of `decl`. `applied`
    /// holds the constraints already applied by ancestors.
    fn constraint_list<'c>(
        &mut self,
        constraints: &'c [Constraint],
        decl: &'d Decl,
        mut applied: HashMap<&'c str, &'c SourceRange>,
    ) {
        for constraint in constraints {
            self.constraint(constraint, decl);
            if let Some(first) =
                first_occurrence(&mut applied, constraint.id.as_str(), &constraint.loc)
            {
                self.report(
                    error(
                        ErrorCode::DuplicateConstraintIdentifier,
                        &constraint.loc,
                        format!("duplicate constraint identifier `{}`", constraint.id),
                    )
                    .related_with(first, format!("`{}` is first constrained here", constraint.id)),
                )
            }
        }
    }

    /// Check the constraints child declarations apply to their parent.
    fn decl_constraints(&mut self) {
        let scope = self.scope;
        for decl in self.decls() {
            let Some(parent) = scope.get_parent(decl) else { continue };
            let applied = scope
                .iter_parents(decl)
                .flat_map(Decl::constraints)
                .map(|constraint| (constraint.id.as_str(), &constraint.loc))
                .collect();
            self.constraint_list(decl.constraints().as_slice(), parent, applied);
        }
    }

    /// Check the constraints group fields apply to the group.
    fn group_constraints(&mut self) {
        let scope = self.scope;
        for decl in self.decls() {
            for field in decl.fields() {
                let FieldDesc::Group { group_id, constraints } = &field.desc else { continue };
                if let Some(group) = scope.typedef.get(group_id).copied() {
                    self.constraint_list(constraints, group, HashMap::new());
                }
            }
        }
    }

    /// Resolve the targets of size and count fields, which must come
    /// before the field they apply to. Size modifiers need a size
    /// field and cannot apply to counted arrays.
    fn size_fields(&mut self) {
        for decl in self.decls() {
            let mut sized = HashMap::new();
            for (index, field) in decl.fields().enumerate() {
                let Some(target_id) = field.sized_id() else { continue };
                let counted = matches!(&field.desc, FieldDesc::Count { .. });

                if let Some(first) = first_occurrence(&mut sized, target_id, field) {
                    let code = match counted {
                        true => ErrorCode::DuplicateCountField,
                        false => ErrorCode::DuplicateSizeField,
                    };
                    self.report(
                        error(code, &field.loc, format!("duplicate {} field", field.kind()))
                            .related_with(
                                &first.loc,
                                format!("{} is first declared here", first.kind()),
                            ),
                    )
                }

                let target = decl.fields().enumerate().find(|(_, target)| match &target.desc {
                    FieldDesc::Payload { .. } => target_id == "_payload_",
                    FieldDesc::Body => target_id == "_body_",
                    _ => target.id() == Some(target_id),
                });
                let (undeclared, invalid, hint) = match counted {
                    true => (
                        ErrorCode::UndeclaredCountIdentifier,
                        ErrorCode::InvalidCountIdentifier,
                        "expected array identifier",
                    ),
                    false => (
                        ErrorCode::UndeclaredSizeIdentifier,
                        ErrorCode::InvalidSizeIdentifier,
                        "expected payload, body, or array identifier",
                    ),
                };

                let Some((target_index, target)) = target else {
                    self.report(
                        error(
                            undeclared,
                            &field.loc,
                            format!("undeclared {} identifier `{target_id}`", field.kind()),
                        )
                        .hint(hint),
                    );
                    continue;
                };
                match (&target.desc, counted) {
                    (FieldDesc::Array { size_modifier, .. }, true) => {
                        if size_modifier.is_some() {
                            self.report(
                                error(
                                    ErrorCode::InvalidSizeModifier,
                                    &target.loc,
                                    format!(
                                        "array `{target_id}` with count field has a size modifier"
                                    ),
                                )
                                .related(&field.loc),
                            )
                        }
                    }
                    (FieldDesc::Array { .. }, false) => (),
                    (FieldDesc::Payload { .. } | FieldDesc::Body, false) => (),
                    _ => {
                        self.report(
                            error(
                                invalid,
                                &field.loc,
                                format!("invalid {} identifier `{target_id}`", field.kind()),
                            )
                            .related(&target.loc)
                            .hint(hint),
                        );
                        continue;
                    }
                }

                if target_index < index {
                    self.report(
                        error(
                            ErrorCode::SizeFieldAfterTarget,
                            &field.loc,
                            format!(
                                "{} field is declared after the {} field it applies to",
                                field.kind(),
                                target.kind()
                            ),
                        )
                        .related_with(
                            &target.loc,
                            format!("{} field is declared here", target.kind()),
                        ),
                    )
                }
            }

            for field in decl.fields() {
                let has_size_field = match &field.desc {
                    FieldDesc::Payload { size_modifier: Some(_) } => decl.payload_size().is_some(),
                    FieldDesc::Array { id, size_modifier: Some(_), .. } => {
                        decl.array_size(id).is_some()
                    }
                    _ => true,
                };
                if !has_size_field {
                    self.report(
                        error(
                            ErrorCode::InvalidSizeModifier,
                            &field.loc,
                            format!("{} field has a size modifier", field.kind()),
                        )
                        .hint("size modifiers require a size field"),
                    )
                }
            }
        }
    }

    /// Fixed values must fit their width, and fixed tags must name a
    /// tag of an enum declaration.
    fn fixed_fields(&mut self) {
        let scope = self.scope;
        for decl in self.decls() {
            for field in decl.fields() {
                match &field.desc {
                    FieldDesc::FixedScalar { value, width } if !fits(*value, *width) => self
                        .report(error(
                            ErrorCode::FixedValueOutOfRange,
                            &field.loc,
                            format!("fixed value `{value}` is larger than maximum value"),
                        )),
                    FieldDesc::FixedEnum { enum_id, tag_id } => {
                        match scope.typedef.get(enum_id).copied() {
                            Some(enum_decl @ Decl { desc: DeclDesc::Enum { tags, .. }, .. }) => {
                                if !tags.iter().any(|tag| &tag.id == tag_id) {
                                    self.report(
                                        error(
                                            ErrorCode::UndeclaredFixedTagIdentifier,
                                            &field.loc,
                                            format!("undeclared tag identifier `{tag_id}`"),
                                        )
                                        .related(&enum_decl.loc),
                                    )
                                }
                            }
                            Some(other) => self.report(
                                error(
                                    ErrorCode::InvalidFixedEnumIdentifier,
                                    &field.loc,
                                    format!("invalid type identifier `{enum_id}`"),
                                )
                                .related_with(&other.loc, format!("`{enum_id}` is declared here"))
                                .hint("expected enum identifier"),
                            ),
                            None => self.report(
                                error(
                                    ErrorCode::UndeclaredFixedEnumIdentifier,
                                    &field.loc,
                                    format!("undeclared type identifier `{enum_id}`"),
                                )
                                .hint("expected enum identifier"),
                            ),
                        }
                    }
                    _ => (),
                }
            }
        }
    }

    /// At most one payload or body field per declaration, and one is
    /// required when a child declaration adds fields.
    fn payload_fields(&mut self) {
        let scope = self.scope;
        for decl in self.decls() {
            let mut payloads = decl.fields().filter(|field| field.is_payload());
            match payloads.next() {
                Some(first) => {
                    for field in payloads {
                        self.report(
                            error(
                                ErrorCode::DuplicatePayloadField,
                                &field.loc,
                                format!("duplicate {} field", field.kind()),
                            )
                            .related_with(
                                &first.loc,
                                format!("{} is first declared here", first.kind()),
                            ),
                        )
                    }
                }
                None => {
                    let extended =
                        scope.iter_children(decl).any(|child| child.fields().next().is_some());
                    if extended {
                        let hint = format!("one child packet is extending `{}`", decl.id());
                        let code = ErrorCode::MissingPayloadField;
                        self.report(error(code, &decl.loc, "missing payload field").hint(&hint))
                    }
                }
            }
        }
    }

    /// Report a struct that cannot be embedded in a field because it
    /// has a payload or a parent.
    fn embedded_struct(&mut self, field: &Field, element: &Decl, usage: &str, hint: &str) {
        if element.payload().is_some() || element.parent_id().is_some() {
            self.report(
                error(
                    ErrorCode::InvalidStructField,
                    &field.loc,
                    format!("struct `{}` cannot be used as {usage}", element.id()),
                )
                .related(&element.loc)
                .hint(hint),
            )
        }
    }

    /// Array fields declare exactly one of an element width and an
    /// element type, and the type must be encodable as an element.
    fn array_fields(&mut self) {
        let scope = self.scope;
        for decl in self.decls() {
            for field in decl.fields() {
                let FieldDesc::Array { id, width, type_id, size, .. } = &field.desc else {
                    continue;
                };

                if let (Some(count), Some(size_field)) = (size, decl.array_size(id)) {
                    self.report(
                        error(
                            ErrorCode::RedundantArraySize,
                            &size_field.loc,
                            format!("redundant array {} field", size_field.kind()),
                        )
                        .related_with(&field.loc, format!("`{id}` has constant size {count}")),
                    )
                }

                let element = scope.get_type_declaration(field);
                match (width, type_id, element) {
                    (Some(_), None, _) | (None, Some(_), None) => (),
                    (None, Some(_), Some(element)) => match &element.desc {
                        DeclDesc::Enum { width, .. } if width % 8 != 0 => self.report(error(
                            ErrorCode::InvalidFieldSize,
                            &field.loc,
                            "array element size is not an integral number of octets",
                        )),
                        DeclDesc::Struct { .. } => {
                            self.embedded_struct(
                                field,
                                element,
                                "array element",
                                "struct elements cannot declare a payload or a parent",
                            )
                        }
                        DeclDesc::Checksum { .. } => self.report(error(
                            ErrorCode::InvalidArrayElement,
                            &field.loc,
                            format!("checksum `{}` cannot be used as array element", element.id()),
                        )),
                        _ => (),
                    },
                    _ => self.report(
                        error(
                            ErrorCode::InvalidArrayElement,
                            &field.loc,
                            format!("array `{id}` has an invalid element type"),
                        )
                        .hint("expected exactly one of element width or element type"),
                    ),
                }
            }
        }
    }

    /// Typedef fields cannot embed structs with a payload or a parent.
    fn typedef_fields(&mut self) {
        let scope = self.scope;
        for decl in self.decls() {
            for field in decl.fields() {
                if !matches!(&field.desc, FieldDesc::Typedef { .. }) {
                    continue;
                }
                if let Some(element @ Decl { desc: DeclDesc::Struct { .. }, .. }) =
                    scope.get_type_declaration(field)
                {
                    self.embedded_struct(
                        field,
                        element,
                        "field type",
                        "embedded structs cannot declare a payload or a parent",
                    );
                }
            }
        }
    }

    /// Checksum starts reference a later checksum field, and every
    /// checksum field has a start.
    fn checksum_fields(&mut self) {
        let scope = self.scope;
        let is_checksum = |field: &Field| {
            matches!(&field.desc, FieldDesc::Typedef { .. })
                && matches!(
                    scope.get_type_declaration(field),
                    Some(Decl { desc: DeclDesc::Checksum { .. }, .. })
                )
        };

        for decl in self.decls() {
            let mut started = HashSet::new();
            for (index, field) in decl.fields().enumerate() {
                let FieldDesc::Checksum { field_id } = &field.desc else { continue };
                started.insert(field_id.as_str());
                let hint = "expected checksum field identifier";
                match decl.fields().enumerate().find(|(_, other)| other.id() == Some(field_id)) {
                    None => self.report(
                        error(
                            ErrorCode::UndeclaredChecksumIdentifier,
                            &field.loc,
                            format!("undeclared checksum identifier `{field_id}`"),
                        )
                        .hint(hint),
                    ),
                    Some((_, checksum)) if !is_checksum(checksum) => self.report(
                        error(
                            ErrorCode::InvalidChecksumIdentifier,
                            &field.loc,
                            format!("invalid checksum identifier `{field_id}`"),
                        )
                        .related_with(
                            &checksum.loc,
                            format!("`{field_id}` is declared here as {} field", checksum.kind()),
                        )
                        .hint(hint),
                    ),
                    Some((checksum_index, checksum)) if checksum_index < index => self.report(
                        error(
                            ErrorCode::ChecksumBeforeStart,
                            &field.loc,
                            format!("checksum field `{field_id}` is declared before its start"),
                        )
                        .related(&checksum.loc),
                    ),
                    Some(_) => (),
                }
            }

            for field in decl.fields().filter(|field| is_checksum(field)) {
                match field.id() {
                    Some(id) if !started.contains(id) => self.report(error(
                        ErrorCode::MissingChecksumStart,
                        &field.loc,
                        format!("checksum field `{id}` has no start"),
                    )),
                    _ => (),
                }
            }
        }
    }

    /// Struct array elements need a static or self-delimited size.
    fn array_elements(&mut self, schema: &Schema) {
        let scope = self.scope;
        for decl in self.decls() {
            for field in decl.fields() {
                if !matches!(&field.desc, FieldDesc::Array { .. }) {
                    continue;
                }
                let Some(element @ Decl { desc: DeclDesc::Struct { .. }, .. }) =
                    scope.get_type_declaration(field)
                else {
                    continue;
                };
                if matches!(schema.total_size(element.key), Size::Static(0) | Size::Unknown) {
                    self.report(
                        error(
                            ErrorCode::InvalidArrayElement,
                            &field.loc,
                            format!("struct `{}` cannot be used as array element", element.id()),
                        )
                        .related(&element.loc)
                        .hint("array elements must have a static or self-delimited size"),
                    )
                }
            }
        }
    }

    /// Fields other than bit-fields start on an octet boundary, and
    /// bit-field chunks span at most 64 bits.
    fn field_offsets(&mut self, schema: &Schema) {
        let scope = self.scope;
        for decl in self.decls() {
            // Bits since the last known octet boundary, and bits in the
            // current bit-field chunk.
            let mut offset = 0;
            let mut chunk = 0;
            for field in decl.fields() {
                let size = schema.field_size(field.key);
                if !scope.is_bitfield(field) {
                    if offset % 8 != 0 {
                        self.report(error(
                            ErrorCode::InvalidFieldOffset,
                            &field.loc,
                            format!("{} field is not aligned to an octet boundary", field.kind()),
                        ))
                    }
                    chunk = 0;
                    offset = size.static_().map_or(0, |bits| offset + bits);
                    continue;
                }

                let bits = size.static_().unwrap_or(0);
                offset += bits;
                chunk += bits;
                if chunk > 64 {
                    self.report(error(
                        ErrorCode::InvalidFieldSize,
                        &field.loc,
                        "bit-field group is larger than 64 bits",
                    ));
                    chunk = 0;
                }
                if offset % 8 == 0 {
                    chunk = 0;
                }
            }
        }
    }

    /// Every field is located either from the start of its span or
    /// from its end.
    fn field_bounds(&mut self, schema: &Schema) {
        for decl in self.decls() {
            let sizes: Vec<Size> =
                decl.fields().map(|field| schema.field_size(field.key)).collect();
            // Start offsets are known up to the first field of unknown
            // size, end offsets from the last field of non-static size.
            let first_unknown = sizes.iter().position(|size| *size == Size::Unknown);
            let last_non_static = sizes.iter().rposition(|size| size.static_().is_none());

            let unresolved = decl.fields().zip(&sizes).enumerate().find(|(index, (_, size))| {
                let from_start = first_unknown.map_or(true, |unknown| *index <= unknown);
                let from_end = last_non_static.map_or(true, |non_static| *index >= non_static);
                match size {
                    Size::Static(_) => !(from_start || from_end),
                    Size::Dynamic => !from_start,
                    Size::Unknown => !(from_start && from_end),
                }
            });
            // Only the first unresolved field is reported, the ones after
            // it are unresolved for the same reason.
            if let Some((_, (field, _))) = unresolved {
                self.report(
                    error(
                        ErrorCode::UnresolvedFieldOffset,
                        &field.loc,
                        format!("cannot compute the bounds of the {} field", field.kind()),
                    )
                    .hint("only fields of static size can follow a field of unknown size"),
                )
            }
        }
    }

    /// Packets and structs span whole octets.
    fn decl_sizes(&mut self, schema: &Schema) {
        for decl in self.decls() {
            if !matches!(&decl.desc, DeclDesc::Packet { .. } | DeclDesc::Struct { .. }) {
                continue;
            }
            let static_bits: usize =
                decl.fields().filter_map(|field| schema.field_size(field.key).static_()).sum();
            if static_bits % 8 != 0 {
                self.report(error(
                    ErrorCode::InvalidPacketSize,
                    &decl.loc,
                    format!("{} size is not an integral number of octets", decl.kind()),
                ))
            }
        }
    }
}

/// Append the fields to `inlined`, replacing group fields by the
/// fields of their group. Fields constrained by an enclosing group
/// field become fixed fields.
fn inline_fields<'f>(
    fields: std::slice::Iter<'f, Field>,
    groups: &HashMap<&'f str, &'f Decl>,
    fixed: &HashMap<&'f str, &'f Constraint>,
    inlined: &mut Vec<Field>,
) {
    for field in fields {
        if let FieldDesc::Group { group_id, constraints } = &field.desc {
            let mut fixed = fixed.clone();
            fixed.extend(constraints.iter().map(|constraint| (constraint.id.as_str(), constraint)));
            if let Some(group) = groups.get(group_id.as_str()) {
                inline_fields(group.fields(), groups, &fixed, inlined);
            }
            continue;
        }

        let desc = match (&field.desc, field.id().and_then(|id| fixed.get(id))) {
            (FieldDesc::Scalar { width, .. }, Some(constraint)) => FieldDesc::FixedScalar {
                width: *width,
                value: constraint.value.unwrap_or_default(),
            },
            (FieldDesc::Typedef { type_id, .. }, Some(constraint)) => FieldDesc::FixedEnum {
                enum_id: type_id.clone(),
                tag_id: constraint.tag_id.clone().unwrap_or_default(),
            },
            (desc, _) => desc.clone(),
        };
        // Fields inlined from the same group share their keys.
        inlined.push(Field { desc, loc: field.loc, key: field.key });
    }
}

/// Inline group fields and drop group declarations.
fn inline_groups(file: &File) -> File {
    let groups: HashMap<&str, &Decl> = file
        .declarations
        .iter()
        .filter(|decl| matches!(&decl.desc, DeclDesc::Group { .. }))
        .map(|decl| (decl.id(), decl))
        .collect();
    let inlined = |decl: &Decl| {
        let mut fields = vec![];
        inline_fields(decl.fields(), &groups, &HashMap::new(), &mut fields);
        fields
    };

    let declarations = file
        .declarations
        .iter()
        .filter_map(|decl| {
            let desc = match &decl.desc {
                DeclDesc::Group { .. } => return None,
                DeclDesc::Packet { id, parent_id, constraints, .. } => DeclDesc::Packet {
                    id: id.clone(),
                    parent_id: parent_id.clone(),
                    constraints: constraints.clone(),
                    fields: inlined(decl),
                },
                DeclDesc::Struct { id, parent_id, constraints, .. } => DeclDesc::Struct {
                    id: id.clone(),
                    parent_id: parent_id.clone(),
                    constraints: constraints.clone(),
                    fields: inlined(decl),
                },
                desc => desc.clone(),
            };
            Some(Decl { desc, loc: decl.loc, key: decl.key })
        })
        .collect();

    File { endianness: file.endianness, declarations, file: file.file }
}

/// Validate `file` and return it with group fields inlined.
pub fn analyze(file: &File) -> Result<File, Diagnostics> {
    let scope = Scope::new(file)?;
    let mut checker = Checker::new(&scope);
    checker.run(Checker::decl_identifiers)?;
    checker.run(Checker::enum_declarations)?;
    checker.run(Checker::widths)?;
    checker.run(Checker::group_constraints)?;

    let file = inline_groups(file);
    let scope = Scope::new(&file)?;
    let schema = Schema::new(&file);
    let mut checker = Checker::new(&scope);
    checker.run(Checker::field_identifiers)?;
    checker.run(Checker::size_fields)?;
    checker.run(Checker::fixed_fields)?;
    checker.run(Checker::payload_fields)?;
    checker.run(Checker::array_fields)?;
    checker.run(Checker::typedef_fields)?;
    checker.run(Checker::checksum_fields)?;
    checker.run(Checker::decl_constraints)?;
    checker.run(|checker| checker.array_elements(&schema))?;
    checker.run(|checker| checker.field_offsets(&schema))?;
    checker.run(|checker| checker.field_bounds(&schema))?;
    checker.run(|checker| checker.decl_sizes(&schema))?;
    Ok(file)
}

#[cfg(test)]
mod test {
    use crate::analyzer;
    use crate::analyzer::Size::*;
    use crate::ast;
    use crate::parser::parse_inline;
    use codespan_reporting::term::termcolor;
    use serde_json::{json, Value};

    use googletest::prelude::{assert_that, eq};

    macro_rules! raises {
        ($code:ident, $schema:expr) => {{
            let mut db = ast::SourceDatabase::new();
            let file = parse_inline(&mut db, "stdin", $schema.to_string()).expect("parsing failure");
            let result = analyzer::analyze(&file);
            assert!(matches!(result, Err(_)));
            let diagnostics = result.err().unwrap();
            let mut buffer = termcolor::Buffer::no_color();
            let _ = diagnostics.emit(&db, &mut buffer);
            println!("{}", std::str::from_utf8(buffer.as_slice()).unwrap());
            assert_eq!(diagnostics.diagnostics.len(), 1);
            assert_eq!(diagnostics.diagnostics[0].code, Some(analyzer::ErrorCode::$code.into()));
        }};
    }

    macro_rules! valid {
        ($schema:expr) => {{
            let mut db = ast::SourceDatabase::new();
            let file = parse_inline(&mut db, "stdin", $schema.to_string()).expect("parsing failure");
            assert!(analyzer::analyze(&file).is_ok());
        }};
    }

    fn schema(declarations: Value) -> Value {
        json!({ "endianness": "little_endian", "declarations": declarations })
    }

    fn packet(id: &str, fields: Value) -> Value {
        json!({ "kind": "packet_declaration", "id": id, "fields": fields })
    }

    fn child(id: &str, parent_id: &str, constraints: Value, fields: Value) -> Value {
        json!({
            "kind": "packet_declaration",
            "id": id,
            "parent_id": parent_id,
            "constraints": constraints,
            "fields": fields
        })
    }

    fn strukt(id: &str, fields: Value) -> Value {
        json!({ "kind": "struct_declaration", "id": id, "fields": fields })
    }

    fn enum_(id: &str, width: usize, tags: &[(&str, usize)]) -> Value {
        let tags: Vec<_> =
            tags.iter().map(|(id, value)| json!({ "id": id, "value": value })).collect();
        json!({ "kind": "enum_declaration", "id": id, "width": width, "tags": tags })
    }

    fn scalar(id: &str, width: usize) -> Value {
        json!({ "kind": "scalar_field", "id": id, "width": width })
    }

    fn typedef(id: &str, type_id: &str) -> Value {
        json!({ "kind": "typedef_field", "id": id, "type_id": type_id })
    }

    fn array(id: &str, width: usize) -> Value {
        json!({ "kind": "array_field", "id": id, "width": width })
    }

    fn size(field_id: &str, width: usize) -> Value {
        json!({ "kind": "size_field", "field_id": field_id, "width": width })
    }

    fn count(field_id: &str, width: usize) -> Value {
        json!({ "kind": "count_field", "field_id": field_id, "width": width })
    }

    fn payload() -> Value {
        json!({ "kind": "payload_field" })
    }

    #[test]
    fn test_e1() {
        raises!(
            DuplicateDeclIdentifier,
            schema(json!([strukt("A", json!([])), packet("A", json!([]))]))
        );

        raises!(
            DuplicateDeclIdentifier,
            schema(json!([strukt("A", json!([])), enum_("A", 8, &[("X", 0), ("Y", 1)])]))
        );
    }

    #[test]
    fn test_e2() {
        raises!(RecursiveDecl, schema(json!([child("A", "A", json!([]), json!([]))])));

        raises!(
            RecursiveDecl,
            schema(json!([
                child("A", "B", json!([]), json!([])),
                child("B", "A", json!([]), json!([]))
            ]))
        );

        raises!(RecursiveDecl, schema(json!([strukt("B", json!([typedef("x", "B")]))])));

        raises!(
            RecursiveDecl,
            schema(json!([
                strukt("B", json!([{ "kind": "array_field", "id": "x", "type_id": "B", "size": 2 }]))
            ]))
        );

        raises!(
            RecursiveDecl,
            schema(json!([{
                "kind": "group_declaration",
                "id": "C",
                "fields": [{ "kind": "group_field", "group_id": "C" }]
            }]))
        );

        // Recursion is allowed through arrays of dynamic size.
        valid!(schema(json!([strukt(
            "B",
            json!([
                count("x", 8),
                { "kind": "array_field", "id": "x", "type_id": "B" }
            ])
        )])));
    }

    #[test]
    fn test_e3() {
        raises!(
            UndeclaredGroupIdentifier,
            schema(json!([packet("A", json!([{ "kind": "group_field", "group_id": "B" }]))]))
        );
    }

    #[test]
    fn test_e4() {
        raises!(
            InvalidGroupIdentifier,
            schema(json!([
                strukt("B", json!([])),
                packet("A", json!([{ "kind": "group_field", "group_id": "B" }]))
            ]))
        );
    }

    #[test]
    fn test_e5() {
        raises!(UndeclaredTypeIdentifier, schema(json!([packet("A", json!([typedef("x", "B")]))])));

        raises!(
            UndeclaredTypeIdentifier,
            schema(json!([packet(
                "A",
                json!([{ "kind": "array_field", "id": "x", "type_id": "B" }])
            )]))
        );
    }

    #[test]
    fn test_e6() {
        raises!(
            InvalidTypeIdentifier,
            schema(json!([
                packet("A", json!([scalar("x", 8)])),
                packet("B", json!([typedef("x", "A")]))
            ]))
        );

        raises!(
            InvalidTypeIdentifier,
            schema(json!([
                packet("A", json!([scalar("x", 8)])),
                packet("B", json!([{ "kind": "array_field", "id": "x", "type_id": "A" }]))
            ]))
        );
    }

    #[test]
    fn test_e7() {
        raises!(UndeclaredParentIdentifier, schema(json!([child("A", "B", json!([]), json!([]))])));
    }

    #[test]
    fn test_e8() {
        raises!(
            InvalidParentIdentifier,
            schema(json!([strukt("A", json!([])), child("B", "A", json!([]), json!([]))]))
        );
    }

    #[test]
    fn test_e11() {
        raises!(
            DuplicateFieldIdentifier,
            schema(json!([packet("A", json!([scalar("x", 8), scalar("x", 8)]))]))
        );

        // Inherited field identifiers cannot be reused.
        raises!(
            DuplicateFieldIdentifier,
            schema(json!([
                packet("A", json!([scalar("x", 8), payload()])),
                child("B", "A", json!([]), json!([scalar("x", 8)]))
            ]))
        );
    }

    #[test]
    fn test_e12_e13_e14() {
        raises!(DuplicateTagIdentifier, schema(json!([enum_("A", 8, &[("X", 0), ("X", 1)])])));
        raises!(DuplicateTagValue, schema(json!([enum_("A", 8, &[("X", 0), ("Y", 0)])])));
        raises!(InvalidTagValue, schema(json!([enum_("A", 2, &[("X", 0), ("Y", 4)])])));
    }

    #[test]
    fn test_constraints() {
        let parent = packet("A", json!([scalar("a", 8), typedef("b", "E"), payload()]));
        let e = enum_("E", 8, &[("X", 0), ("Y", 1)]);

        raises!(
            UndeclaredConstraintIdentifier,
            schema(json!([e, parent, child("B", "A", json!([{ "id": "c", "value": 1 }]), json!([]))]))
        );
        raises!(
            InvalidConstraintScalarValue,
            schema(json!([e, parent, child("B", "A", json!([{ "id": "a", "tag_id": "X" }]), json!([]))]))
        );
        raises!(
            ConstraintValueOutOfRange,
            schema(json!([e, parent, child("B", "A", json!([{ "id": "a", "value": 256 }]), json!([]))]))
        );
        raises!(
            InvalidConstraintEnumValue,
            schema(json!([e, parent, child("B", "A", json!([{ "id": "b", "value": 1 }]), json!([]))]))
        );
        raises!(
            UndeclaredConstraintTag,
            schema(json!([e, parent, child("B", "A", json!([{ "id": "b", "tag_id": "Z" }]), json!([]))]))
        );
        raises!(
            DuplicateConstraintIdentifier,
            schema(json!([
                e,
                parent,
                child("B", "A", json!([{ "id": "a", "value": 1 }, { "id": "a", "value": 2 }]), json!([]))
            ]))
        );
        valid!(schema(json!([
            e,
            parent,
            child("B", "A", json!([{ "id": "a", "value": 1 }, { "id": "b", "tag_id": "Y" }]), json!([]))
        ])));
    }

    #[test]
    fn test_size_fields() {
        raises!(DuplicateSizeField, schema(json!([packet(
            "A",
            json!([size("x", 8), size("x", 8), array("x", 8)])
        )])));
        raises!(UndeclaredSizeIdentifier, schema(json!([packet("A", json!([size("x", 8)]))])));
        raises!(
            InvalidSizeIdentifier,
            schema(json!([packet("A", json!([size("x", 8), scalar("x", 8)]))]))
        );
        raises!(
            DuplicateCountField,
            schema(json!([packet("A", json!([size("x", 8), count("x", 8), array("x", 8)]))]))
        );
        raises!(UndeclaredCountIdentifier, schema(json!([packet("A", json!([count("x", 8)]))])));
        raises!(
            InvalidCountIdentifier,
            schema(json!([packet("A", json!([count("x", 8), scalar("x", 8)]))]))
        );
    }

    #[test]
    fn test_size_field_after_target() {
        raises!(
            SizeFieldAfterTarget,
            schema(json!([packet("A", json!([array("x", 8), size("x", 8)]))]))
        );
        raises!(
            SizeFieldAfterTarget,
            schema(json!([packet("A", json!([payload(), size("_payload_", 8)]))]))
        );
    }

    #[test]
    fn test_size_modifier() {
        raises!(
            InvalidSizeModifier,
            schema(json!([packet(
                "A",
                json!([
                    count("x", 8),
                    { "kind": "array_field", "id": "x", "width": 8, "size_modifier": 2 }
                ])
            )]))
        );
        raises!(
            InvalidSizeModifier,
            schema(json!([packet("A", json!([{ "kind": "payload_field", "size_modifier": 2 }]))]))
        );
        valid!(schema(json!([packet(
            "A",
            json!([
                size("_payload_", 8),
                { "kind": "payload_field", "size_modifier": 2 },
                scalar("b", 16)
            ])
        )])));
    }

    #[test]
    fn test_fixed_fields() {
        raises!(
            FixedValueOutOfRange,
            schema(json!([packet(
                "A",
                json!([{ "kind": "fixed_scalar_field", "width": 4, "value": 16 }])
            )]))
        );
        raises!(
            UndeclaredFixedEnumIdentifier,
            schema(json!([packet(
                "A",
                json!([{ "kind": "fixed_enum_field", "enum_id": "E", "tag_id": "X" }])
            )]))
        );
        raises!(
            UndeclaredFixedTagIdentifier,
            schema(json!([
                enum_("E", 8, &[("X", 0)]),
                packet("A", json!([{ "kind": "fixed_enum_field", "enum_id": "E", "tag_id": "Y" }]))
            ]))
        );
    }

    #[test]
    fn test_payload_fields() {
        raises!(DuplicatePayloadField, schema(json!([packet("A", json!([payload(), payload()]))])));
        raises!(
            MissingPayloadField,
            schema(json!([
                packet("A", json!([scalar("a", 8)])),
                child("B", "A", json!([]), json!([scalar("b", 8)]))
            ]))
        );
    }

    #[test]
    fn test_array_fields() {
        raises!(
            RedundantArraySize,
            schema(json!([packet(
                "A",
                json!([count("x", 8), { "kind": "array_field", "id": "x", "width": 8, "size": 4 }])
            )]))
        );
        raises!(InvalidFieldSize, schema(json!([packet("A", json!([array("x", 12)]))])));
        raises!(
            InvalidArrayElement,
            schema(json!([packet("A", json!([{ "kind": "array_field", "id": "x" }]))]))
        );
        raises!(
            InvalidArrayElement,
            schema(json!([
                { "kind": "checksum_declaration", "id": "C", "function": "sum", "width": 8 },
                packet("A", json!([{ "kind": "array_field", "id": "x", "type_id": "C" }]))
            ]))
        );
        // Struct elements must be self-delimited.
        raises!(
            InvalidArrayElement,
            schema(json!([
                strukt("S", json!([array("y", 8)])),
                packet("A", json!([count("x", 8), { "kind": "array_field", "id": "x", "type_id": "S" }]))
            ]))
        );
    }

    #[test]
    fn test_struct_fields() {
        raises!(
            InvalidStructField,
            schema(json!([
                strukt("S", json!([scalar("a", 8), payload()])),
                packet("A", json!([typedef("s", "S")]))
            ]))
        );
        raises!(
            InvalidStructField,
            schema(json!([
                strukt("S", json!([scalar("a", 8), payload()])),
                packet("A", json!([count("x", 8), { "kind": "array_field", "id": "x", "type_id": "S" }]))
            ]))
        );
    }

    #[test]
    fn test_checksum_fields() {
        let checksum = json!({
            "kind": "checksum_declaration", "id": "Sum", "function": "sum", "width": 16
        });
        raises!(
            UndeclaredChecksumIdentifier,
            schema(json!([
                checksum,
                packet("A", json!([{ "kind": "checksum_field", "field_id": "crc" }, scalar("a", 16)]))
            ]))
        );
        raises!(
            InvalidChecksumIdentifier,
            schema(json!([
                checksum,
                packet("A", json!([{ "kind": "checksum_field", "field_id": "a" }, scalar("a", 16)]))
            ]))
        );
        raises!(
            ChecksumBeforeStart,
            schema(json!([
                checksum,
                packet("A", json!([
                    typedef("crc", "Sum"),
                    { "kind": "checksum_field", "field_id": "crc" },
                    scalar("a", 16)
                ]))
            ]))
        );
        raises!(
            MissingChecksumStart,
            schema(json!([checksum, packet("A", json!([scalar("a", 16), typedef("crc", "Sum")]))]))
        );
        valid!(schema(json!([
            checksum,
            packet("A", json!([
                { "kind": "checksum_field", "field_id": "crc" },
                scalar("a", 16),
                typedef("crc", "Sum")
            ]))
        ])));
    }

    #[test]
    fn test_widths() {
        raises!(InvalidScalarWidth, schema(json!([packet("A", json!([scalar("a", 0)]))])));
        raises!(InvalidScalarWidth, schema(json!([packet("A", json!([scalar("a", 72)]))])));
        raises!(
            InvalidFieldSize,
            schema(json!([{ "kind": "checksum_declaration", "id": "C", "function": "sum", "width": 12 }]))
        );
    }

    #[test]
    fn test_field_offsets() {
        raises!(
            InvalidFieldOffset,
            schema(json!([packet("A", json!([scalar("a", 4), array("b", 8), scalar("c", 4)]))]))
        );
        raises!(
            InvalidFieldSize,
            schema(json!([packet("A", json!([scalar("a", 60), scalar("b", 12)]))]))
        );
        raises!(InvalidPacketSize, schema(json!([packet("A", json!([scalar("a", 7)]))])));
        valid!(schema(json!([packet(
            "A",
            json!([scalar("a", 7), scalar("b", 4), scalar("c", 5)])
        )])));
    }

    #[test]
    fn test_field_bounds() {
        // Two fields of unknown size.
        raises!(UnresolvedFieldOffset, schema(json!([packet("A", json!([array("a", 8), payload()]))])));
        // Dynamic field after a field of unknown size.
        raises!(
            UnresolvedFieldOffset,
            schema(json!([packet("A", json!([array("a", 8), count("b", 8), array("b", 8)]))]))
        );
        // Static fields after a field of unknown size.
        valid!(schema(json!([packet("A", json!([payload(), scalar("a", 7), scalar("b", 9)]))])));
    }

    #[derive(Debug, PartialEq, Eq)]
    struct Annotations {
        size: analyzer::Size,
        payload_size: analyzer::Size,
        fields: Vec<analyzer::Size>,
    }

    fn annotations(schema: Value) -> Vec<Annotations> {
        let mut db = ast::SourceDatabase::new();
        let file = parse_inline(&mut db, "stdin", schema.to_string()).expect("parsing failure");
        let file = analyzer::analyze(&file).expect("analyzer failure");
        let schema = analyzer::Schema::new(&file);
        file.declarations
            .iter()
            .map(|decl| Annotations {
                size: schema.decl_size(decl.key),
                payload_size: schema.payload_size(decl.key),
                fields: decl.fields().map(|field| schema.field_size(field.key)).collect(),
            })
            .collect()
    }

    #[test]
    fn test_bitfield_annotations() {
        assert_that!(
            annotations(schema(json!([
                enum_("E", 6, &[("X", 0), ("Y", 1)]),
                packet(
                    "A",
                    json!([
                        scalar("a", 14),
                        typedef("b", "E"),
                        { "kind": "reserved_field", "width": 3 },
                        { "kind": "fixed_scalar_field", "width": 4, "value": 3 },
                        { "kind": "fixed_enum_field", "enum_id": "E", "tag_id": "X" },
                        size("_payload_", 7),
                        payload()
                    ])
                )
            ]))),
            eq(vec![
                Annotations { size: Static(6), payload_size: Static(0), fields: vec![] },
                Annotations {
                    size: Static(40),
                    payload_size: Dynamic,
                    fields: vec![
                        Static(14),
                        Static(6),
                        Static(3),
                        Static(4),
                        Static(6),
                        Static(7),
                        Dynamic
                    ]
                },
            ])
        )
    }

    #[test]
    fn test_typedef_annotations() {
        // Struct declared after its use.
        assert_that!(
            annotations(schema(json!([
                packet("A", json!([scalar("a", 16), typedef("s", "S")])),
                strukt("S", json!([{ "kind": "array_field", "id": "a", "width": 8, "size": 4 }]))
            ]))),
            eq(vec![
                Annotations {
                    size: Static(48),
                    payload_size: Static(0),
                    fields: vec![Static(16), Static(32)]
                },
                Annotations { size: Static(32), payload_size: Static(0), fields: vec![Static(32)] },
            ])
        );

        // Struct with dynamic size.
        assert_that!(
            annotations(schema(json!([
                strukt("S", json!([count("a", 8), array("a", 8)])),
                packet("A", json!([typedef("s", "S"), { "kind": "body_field" }]))
            ]))),
            eq(vec![
                Annotations {
                    size: Dynamic,
                    payload_size: Static(0),
                    fields: vec![Static(8), Dynamic]
                },
                Annotations { size: Dynamic, payload_size: Unknown, fields: vec![Dynamic, Unknown] },
            ])
        );
    }

    #[test]
    fn test_group_inlining() {
        let mut db = ast::SourceDatabase::new();
        let file = parse_inline(
            &mut db,
            "stdin",
            schema(json!([
                enum_("E", 8, &[("X", 0), ("Y", 1)]),
                { "kind": "group_declaration", "id": "G", "fields": [scalar("a", 8), typedef("b", "E")] },
                packet("A", json!([{
                    "kind": "group_field",
                    "group_id": "G",
                    "constraints": [{ "id": "a", "value": 2 }, { "id": "b", "tag_id": "Y" }]
                }]))
            ]))
            .to_string(),
        )
        .expect("parsing failure");
        let file = analyzer::analyze(&file).expect("analyzer failure");
        assert_eq!(file.declarations.len(), 2);
        let fields: Vec<_> = file.declarations[1].fields().map(|field| field.desc.clone()).collect();
        assert_eq!(
            fields,
            vec![
                ast::FieldDesc::FixedScalar { width: 8, value: 2 },
                ast::FieldDesc::FixedEnum { enum_id: "E".to_owned(), tag_id: "Y".to_owned() },
            ]
        );
    }
}
