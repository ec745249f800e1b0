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

//! Packet definition analyzer and decoder.

use argh::FromArgs;
use codespan_reporting::diagnostic::Diagnostic;
use codespan_reporting::term::{self, termcolor};
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use packetdef_compiler::analyzer::Diagnostics;
use packetdef_compiler::layout::DeclKind;
use packetdef_compiler::{ast, parser, Codec, Functions, Value};

/// What to print once the schema is analyzed.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Report {
    /// The schema, as parsed.
    Json,
    /// The computed field layouts.
    Layout,
}

impl std::str::FromStr for Report {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, String> {
        match input.to_ascii_lowercase().as_str() {
            "json" => Ok(Report::Json),
            "layout" => Ok(Report::Layout),
            _ => Err(format!("unknown output format {input:?}, expected 'json' or 'layout'")),
        }
    }
}

#[derive(FromArgs, Debug)]
/// Packet definition analyzer and decoder.
struct Opt {
    #[argh(switch)]
    /// print tool version and exit.
    version: bool,

    #[argh(option, default = "Report::Json")]
    /// print the analyzed schema in this format ("json", "layout")
    /// on stdout.
    output_format: Report,

    #[argh(positional)]
    /// input schema file.
    input_file: Option<String>,

    #[argh(option)]
    /// drop this declaration from the schema before analysis.
    /// Can be repeated.
    exclude_declaration: Vec<String>,

    #[argh(option)]
    /// decode the bytes provided with --hex as this root declaration.
    decode: Option<String>,

    #[argh(option)]
    /// bytes to decode, as a hexadecimal string.
    hex: Option<String>,

    #[argh(option)]
    /// specialize the decoded view to this child declaration.
    /// Can be repeated to descend several levels.
    child: Vec<String>,
}

/// Render diagnostics on stderr.
fn emit(sources: &ast::SourceDatabase, diagnostics: &Diagnostics) -> Result<(), String> {
    let writer = termcolor::StandardStream::stderr(termcolor::ColorChoice::Auto);
    let mut lock = writer.lock();
    diagnostics
        .emit(sources, &mut lock)
        .map_err(|err| format!("could not print diagnostics: {err}"))
}

fn emit_one(
    sources: &ast::SourceDatabase,
    diagnostic: &Diagnostic<ast::FileId>,
) -> Result<(), String> {
    let writer = termcolor::StandardStream::stderr(termcolor::ColorChoice::Auto);
    let mut lock = writer.lock();
    term::emit(&mut lock, &term::Config::default(), sources, diagnostic)
        .map_err(|err| format!("could not print diagnostics: {err}"))
}

fn parse_hex(input: &str) -> Result<Vec<u8>, String> {
    let digits: String = input
        .chars()
        .filter(|c| !c.is_ascii_whitespace() && !matches!(c, ':' | '_'))
        .collect();
    hex::decode(&digits).map_err(|err| format!("invalid hexadecimal input {input:?}: {err}"))
}

fn print_layouts(codec: &Codec) {
    let mut ids: Vec<_> = codec.declarations().collect();
    ids.sort_unstable();
    for layout in ids.into_iter().filter_map(|id| codec.layout(id)) {
        let kind = match layout.kind {
            DeclKind::Packet => "packet",
            DeclKind::Struct => "struct",
        };
        let parent = layout.parent_id.as_deref().map(|id| format!(" : {id}")).unwrap_or_default();
        println!("{kind} {}{parent} ({})", layout.id, layout.size);
        for field in &layout.fields {
            let start = field.start.as_ref().map_or("?".to_owned(), |start| start.to_string());
            let end = field.end.map_or("?".to_owned(), |end| (end / 8).to_string());
            println!(
                "  {:<14} {:<16} start={start:<12} end={end:<4} size={}",
                field.kind.name(),
                field.kind.id().unwrap_or("-"),
                field.size,
            );
        }
    }
}

/// Decode the `--hex` bytes as the declaration `id`, then specialize
/// through the `--child` declarations, and print the decoded fields.
fn decode(opt: &Opt, codec: &Arc<Codec>, id: &str) -> Result<(), String> {
    let data = parse_hex(opt.hex.as_deref().ok_or("'--hex' is required with '--decode'")?)?;
    let layout =
        codec.layout(id).ok_or_else(|| format!("{id} is not a packet or struct declaration"))?;
    if layout.parent_id.is_some() {
        return Err(format!("{id} is not a root declaration, use '--child'"));
    }

    let mut view = codec.view(id, data);
    for child_id in &opt.child {
        if !codec.children(view.id()).any(|id| id == child_id.as_str()) {
            return Err(format!("{child_id} does not extend {}", view.id()));
        }
        view = view.specialize(child_id);
    }

    if !view.is_valid() {
        println!("{}: invalid", view.id());
        return Ok(());
    }
    println!("{}: valid", view.id());
    for (id, value) in view.fields() {
        println!("  {id} = {value}");
    }
    if view.layout().payload_index().is_some() {
        println!("  _payload_ = {}", Value::Bytes(view.payload()));
    }
    Ok(())
}

fn run(opt: &Opt, input_file: &str) -> Result<(), String> {
    let mut sources = ast::SourceDatabase::new();
    let mut file = match parser::parse_file(&mut sources, input_file) {
        Ok(file) => file,
        Err(diagnostic) => {
            emit_one(&sources, &diagnostic)?;
            return Err("could not parse the input file".to_owned());
        }
    };
    file.declarations.retain(|decl| !opt.exclude_declaration.iter().any(|id| id == decl.id()));

    let codec = match Codec::new(&file, &Functions::default()) {
        Ok(codec) => codec,
        Err(diagnostics) => {
            emit(&sources, &diagnostics)?;
            return Err("analysis failed".to_owned());
        }
    };

    match (opt.decode.as_deref(), opt.output_format) {
        (Some(id), _) => decode(opt, &codec, id),
        (None, Report::Json) => {
            let json = serde_json::to_string_pretty(&file).map_err(|err| err.to_string())?;
            println!("{json}");
            Ok(())
        }
        (None, Report::Layout) => {
            print_layouts(&codec);
            Ok(())
        }
    }
}

fn main() -> Result<(), String> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    let opt: Opt = argh::from_env();
    if opt.version {
        println!("packetdefc {}\nCopyright (C) 2023 Google LLC", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    match opt.input_file.as_deref() {
        Some(input_file) => run(&opt, input_file),
        None => Err("no input file is specified".to_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_input() {
        assert_eq!(parse_hex("0102 ff"), Ok(vec![0x01, 0x02, 0xff]));
        assert_eq!(parse_hex("01:02_03"), Ok(vec![0x01, 0x02, 0x03]));
        assert_eq!(parse_hex("AbCd"), Ok(vec![0xab, 0xcd]));
        assert!(parse_hex("012").is_err());
        assert!(parse_hex("zz").is_err());
    }

    #[test]
    fn output_format() {
        assert_eq!("JSON".parse::<Report>(), Ok(Report::Json));
        assert_eq!("layout".parse::<Report>(), Ok(Report::Layout));
        assert!("rust".parse::<Report>().is_err());
    }
}
