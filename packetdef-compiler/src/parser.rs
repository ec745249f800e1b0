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

//! Loader for schema files.
//!
//! Schemas are the JSON rendition of the AST: declarations and fields
//! are objects tagged with a `kind` property. Source ranges may be
//! omitted, in which case diagnostics point at the start of the file.

use codespan_reporting::diagnostic::{Diagnostic, Label};
use codespan_reporting::files;

use crate::ast;

/// Hands out node keys in declaration order.
#[derive(Default)]
struct Keys(usize);

impl Keys {
    fn next(&mut self) -> usize {
        self.0 += 1;
        self.0 - 1
    }
}

/// Bind every source range to `file_id` and key the declarations
/// and fields.
fn annotate(file: &mut ast::File, file_id: ast::FileId) {
    let mut keys = Keys::default();
    file.file = file_id;

    for decl in &mut file.declarations {
        decl.loc.file = file_id;
        decl.key = ast::DeclKey(keys.next());
        match &mut decl.desc {
            ast::DeclDesc::Packet { fields, constraints, .. }
            | ast::DeclDesc::Struct { fields, constraints, .. } => {
                constraints.iter_mut().for_each(|constraint| constraint.loc.file = file_id);
                for field in fields {
                    annotate_field(field, file_id, &mut keys);
                }
            }
            ast::DeclDesc::Group { fields, .. } => {
                for field in fields {
                    annotate_field(field, file_id, &mut keys);
                }
            }
            ast::DeclDesc::Enum { tags, .. } => {
                tags.iter_mut().for_each(|tag| tag.loc.file = file_id);
            }
            ast::DeclDesc::Checksum { .. } | ast::DeclDesc::CustomField { .. } => (),
        }
    }
}

fn annotate_field(field: &mut ast::Field, file_id: ast::FileId, keys: &mut Keys) {
    field.loc.file = file_id;
    field.key = ast::FieldKey(keys.next());
    if let ast::FieldDesc::Group { constraints, .. } = &mut field.desc {
        constraints.iter_mut().for_each(|constraint| constraint.loc.file = file_id);
    }
}

/// Byte offset of the 1-based `line` and `column` reported by
/// `serde_json`, clamped to the source.
fn error_offset(source: &str, line: usize, column: usize) -> usize {
    files::line_starts(source)
        .nth(line.saturating_sub(1))
        .map_or(0, |start| start + column.saturating_sub(1))
        .min(source.len())
}

/// Parse a schema held in memory.
///
/// The source is registered in `sources` under `name` so that
/// diagnostics can quote it. Syntax errors are reported as a single
/// diagnostic pointing at the offending location.
pub fn parse_inline(
    sources: &mut ast::SourceDatabase,
    name: &str,
    source: String,
) -> Result<ast::File, Diagnostic<ast::FileId>> {
    let parsed = serde_json::from_str::<ast::File>(&source);
    let offset = parsed.as_ref().err().map(|err| error_offset(&source, err.line(), err.column()));
    let file_id = sources.add(name.to_owned(), source);

    match (parsed, offset) {
        (Ok(mut file), _) => {
            annotate(&mut file, file_id);
            Ok(file)
        }
        (Err(err), offset) => {
            let offset = offset.unwrap_or(0);
            Err(Diagnostic::error()
                .with_message(format!("failed to parse input file '{name}': {err}"))
                .with_labels(vec![Label::primary(file_id, offset..offset)]))
        }
    }
}

/// Read and parse the schema file `name`.
pub fn parse_file(
    sources: &mut ast::SourceDatabase,
    name: &str,
) -> Result<ast::File, Diagnostic<ast::FileId>> {
    match std::fs::read_to_string(name) {
        Ok(source) => parse_inline(sources, name, source),
        Err(err) => Err(Diagnostic::error()
            .with_message(format!("failed to read input file '{name}': {err}"))),
    }
}
