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

//! Compiled schema: layouts of every packet and struct, and the
//! functions implementing checksum and custom field declarations.

use bytes::Bytes;
use codespan_reporting::diagnostic::Diagnostic;
use packetdef_runtime::bits;
use packetdef_runtime::checksum::{ByteSum, Xor};
use packetdef_runtime::custom::{LengthPrefixedString, RawBytes};
use packetdef_runtime::{Checksum, CustomField, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::analyzer::{self, Diagnostics, ErrorCode, Scope};
use crate::ast;
use crate::builder::Builder;
use crate::layout::{self, Layout};
use crate::view::View;

/// Registry of the functions referenced by checksum and custom field
/// declarations, by name.
#[derive(Clone)]
pub struct Functions {
    checksums: HashMap<String, Arc<dyn Checksum>>,
    custom_fields: HashMap<String, Arc<dyn CustomField>>,
}

impl Functions {
    /// Create an empty registry.
    pub fn new() -> Functions {
        Functions { checksums: HashMap::new(), custom_fields: HashMap::new() }
    }

    pub fn with_checksum(mut self, name: &str, checksum: impl Checksum + 'static) -> Functions {
        self.checksums.insert(name.to_owned(), Arc::new(checksum));
        self
    }

    pub fn with_custom_field(
        mut self,
        name: &str,
        custom_field: impl CustomField + 'static,
    ) -> Functions {
        self.custom_fields.insert(name.to_owned(), Arc::new(custom_field));
        self
    }
}

/// Registry with the built-in functions: checksums `sum` and `xor`,
/// custom fields `length_prefixed_string` and `bytes`.
impl Default for Functions {
    fn default() -> Functions {
        Functions::new()
            .with_checksum("sum", ByteSum)
            .with_checksum("xor", Xor)
            .with_custom_field("length_prefixed_string", LengthPrefixedString)
            .with_custom_field("bytes", RawBytes)
    }
}

#[derive(Debug)]
struct EnumType {
    width: usize,
    tags: HashMap<u64, String>,
    values: HashMap<String, u64>,
}

/// Codec for the packets and structs of an analyzed file.
/// Shared between views and builders.
pub struct Codec {
    layouts: HashMap<String, Arc<Layout>>,
    enums: HashMap<String, EnumType>,
    checksums: HashMap<String, Arc<dyn Checksum>>,
    custom_fields: HashMap<String, Arc<dyn CustomField>>,
}

impl fmt::Debug for Codec {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Codec")
            .field("layouts", &self.layouts.keys().collect::<Vec<_>>())
            .field("enums", &self.enums)
            .finish_non_exhaustive()
    }
}

impl Codec {
    /// Analyze the file and compute the layouts of its declarations.
    /// Checksum and custom field declarations are bound to the
    /// functions of the registry.
    pub fn new(file: &ast::File, functions: &Functions) -> Result<Arc<Codec>, Diagnostics> {
        let file = analyzer::analyze(file)?;
        let scope = Scope::new(&file)?;

        let mut diagnostics = Diagnostics::default();
        let mut checksums = HashMap::new();
        let mut custom_fields = HashMap::new();
        let mut enums = HashMap::new();
        for decl in &file.declarations {
            match &decl.desc {
                ast::DeclDesc::Checksum { id, function, .. } => {
                    match functions.checksums.get(function) {
                        Some(checksum) => {
                            checksums.insert(id.clone(), checksum.clone());
                        }
                        None => diagnostics.push(undeclared_function(decl, "checksum", function)),
                    }
                }
                ast::DeclDesc::CustomField { id, function, .. } => {
                    match functions.custom_fields.get(function) {
                        Some(custom_field) => {
                            custom_fields.insert(id.clone(), custom_field.clone());
                        }
                        None => {
                            diagnostics.push(undeclared_function(decl, "custom field", function))
                        }
                    }
                }
                ast::DeclDesc::Enum { id, tags, width } => {
                    enums.insert(
                        id.clone(),
                        EnumType {
                            width: *width,
                            tags: tags.iter().map(|tag| (tag.value as u64, tag.id.clone())).collect(),
                            values: tags
                                .iter()
                                .map(|tag| (tag.id.clone(), tag.value as u64))
                                .collect(),
                        },
                    );
                }
                _ => (),
            }
        }
        diagnostics.err_or(())?;

        let layouts: HashMap<_, _> = layout::compute_layouts(&file, &scope)
            .into_iter()
            .map(|(id, layout)| (id, Arc::new(layout)))
            .collect();
        tracing::debug!(layouts = layouts.len(), "compiled {} declarations", file.declarations.len());

        Ok(Arc::new(Codec { layouts, enums, checksums, custom_fields }))
    }

    /// Return the layout of the selected packet or struct.
    pub fn layout(&self, id: &str) -> Option<&Arc<Layout>> {
        self.layouts.get(id)
    }

    /// Iterate over the identifiers of the packets and structs.
    pub fn declarations(&self) -> impl Iterator<Item = &str> {
        self.layouts.keys().map(String::as_str)
    }

    /// Iterate over the direct children of the selected declaration.
    pub fn children<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a str> {
        self.layouts
            .values()
            .filter(move |layout| layout.parent_id.as_deref() == Some(id))
            .map(|layout| layout.id.as_str())
    }

    /// Return the chain of layouts from the root ancestor of the
    /// selected declaration down to the declaration itself.
    pub(crate) fn chain(&self, id: &str) -> Vec<Arc<Layout>> {
        let mut chain: Vec<_> =
            std::iter::successors(self.layouts.get(id), |layout| {
                layout.parent_id.as_deref().and_then(|parent_id| self.layouts.get(parent_id))
            })
            .cloned()
            .collect();
        chain.reverse();
        chain
    }

    pub(crate) fn expect_layout(&self, id: &str) -> &Arc<Layout> {
        match self.layouts.get(id) {
            Some(layout) => layout,
            None => panic!("`{id}` is not a packet or struct declaration"),
        }
    }

    /// Create a view of a root packet or struct over the bytes.
    ///
    /// # Panics
    ///
    /// Panics if `id` does not name a root declaration. Views of
    /// child declarations are obtained with [`View::specialize`].
    pub fn view(self: &Arc<Self>, id: &str, data: impl Into<Bytes>) -> View {
        let layout = self.expect_layout(id).clone();
        if let Some(parent_id) = &layout.parent_id {
            panic!("`{id}` extends `{parent_id}`, use View::specialize instead");
        }
        View::new(self.clone(), layout, data.into(), None)
    }

    /// Create a builder for the selected packet or struct.
    ///
    /// # Panics
    ///
    /// Panics if `id` does not name a packet or struct declaration.
    pub fn builder(self: &Arc<Self>, id: &str) -> Builder {
        self.expect_layout(id);
        Builder::new(self.clone(), self.chain(id))
    }

    /// Return the value of an enum field: the tag when the value is
    /// declared, the integer value otherwise.
    pub(crate) fn enum_tag(&self, enum_id: &str, value: u64) -> Value {
        match self.enums.get(enum_id).and_then(|enum_type| enum_type.tags.get(&value)) {
            Some(tag) => Value::Tag(tag.clone()),
            None => Value::Integer(value),
        }
    }

    /// Return the integer value of an enum tag or integer.
    pub(crate) fn enum_value(&self, enum_id: &str, value: &Value) -> Option<u64> {
        let enum_type = self.enums.get(enum_id)?;
        match value {
            Value::Tag(tag) => enum_type.values.get(tag).copied(),
            Value::Integer(value) if *value <= bits::mask(enum_type.width) => Some(*value),
            _ => None,
        }
    }

    pub(crate) fn checksum(&self, checksum_id: &str) -> &dyn Checksum {
        match self.checksums.get(checksum_id) {
            Some(checksum) => checksum.as_ref(),
            None => panic!("`{checksum_id}` is not a checksum declaration"),
        }
    }

    pub(crate) fn custom_field(&self, custom_id: &str) -> &dyn CustomField {
        match self.custom_fields.get(custom_id) {
            Some(custom_field) => custom_field.as_ref(),
            None => panic!("`{custom_id}` is not a custom field declaration"),
        }
    }
}

fn undeclared_function(decl: &ast::Decl, kind: &str, function: &str) -> Diagnostic<ast::FileId> {
    Diagnostic::error()
        .with_code(ErrorCode::UndeclaredFunction)
        .with_message(format!("undeclared {kind} function `{function}`"))
        .with_labels(vec![decl.loc.primary()])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_inline;
    use serde_json::json;

    fn file(declarations: serde_json::Value) -> ast::File {
        let mut db = ast::SourceDatabase::new();
        parse_inline(&mut db, "stdin", json!({ "declarations": declarations }).to_string())
            .expect("parsing failure")
    }

    #[test]
    fn unknown_function() {
        let file = file(json!([
            { "kind": "checksum_declaration", "id": "Crc", "function": "crc32", "width": 32 }
        ]));
        let diagnostics = Codec::new(&file, &Functions::default()).unwrap_err();
        assert_eq!(diagnostics.diagnostics.len(), 1);
        assert_eq!(diagnostics.diagnostics[0].code, Some(ErrorCode::UndeclaredFunction.into()));

        let functions = Functions::default().with_checksum("crc32", |_: &[u8]| 0u64);
        assert!(Codec::new(&file, &functions).is_ok());
    }

    #[test]
    fn enum_values() {
        let file = file(json!([{
            "kind": "enum_declaration",
            "id": "E",
            "width": 4,
            "tags": [{ "id": "A", "value": 1 }, { "id": "B", "value": 2 }]
        }]));
        let codec = Codec::new(&file, &Functions::default()).unwrap();
        assert_eq!(codec.enum_tag("E", 2), Value::tag("B"));
        assert_eq!(codec.enum_tag("E", 3), Value::Integer(3));
        assert_eq!(codec.enum_value("E", &Value::tag("A")), Some(1));
        assert_eq!(codec.enum_value("E", &Value::Integer(15)), Some(15));
        assert_eq!(codec.enum_value("E", &Value::Integer(16)), None);
        assert_eq!(codec.enum_value("E", &Value::tag("C")), None);
    }

    #[test]
    fn chain() {
        let file = file(json!([
            { "kind": "packet_declaration", "id": "A", "fields": [{ "kind": "payload_field" }] },
            {
                "kind": "packet_declaration",
                "id": "B",
                "parent_id": "A",
                "fields": [{ "kind": "payload_field" }]
            },
            { "kind": "packet_declaration", "id": "C", "parent_id": "B" }
        ]));
        let codec = Codec::new(&file, &Functions::default()).unwrap();
        let chain: Vec<_> = codec.chain("C").iter().map(|layout| layout.id.clone()).collect();
        assert_eq!(chain, vec!["A", "B", "C"]);
        assert_eq!(codec.children("A").collect::<Vec<_>>(), vec!["B"]);
    }
}
