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

//! Shared schema of the wire conformance tests.

use packetdef_compiler::{ast, parser, Builder, Codec, Functions};
use std::sync::{Arc, OnceLock};

const TEST_PACKETS: &str = include_str!("../test_packets.json");
const BIG_ENDIAN_PACKETS: &str = include_str!("../big_endian_packets.json");

fn compile(name: &str, source: &str) -> Arc<Codec> {
    let mut sources = ast::SourceDatabase::new();
    let file = parser::parse_inline(&mut sources, name, source.to_owned())
        .unwrap_or_else(|err| panic!("{name} is not valid: {}", err.message));
    Codec::new(&file, &Functions::default())
        .unwrap_or_else(|err| panic!("{name} failed analysis: {err:?}"))
}

/// Return the codec compiled from `test_packets.json`.
pub fn test_packets() -> Arc<Codec> {
    static CODEC: OnceLock<Arc<Codec>> = OnceLock::new();
    CODEC.get_or_init(|| compile("test_packets.json", TEST_PACKETS)).clone()
}

/// Return the codec compiled from `big_endian_packets.json`.
pub fn big_endian_packets() -> Arc<Codec> {
    static CODEC: OnceLock<Arc<Codec>> = OnceLock::new();
    CODEC.get_or_init(|| compile("big_endian_packets.json", BIG_ENDIAN_PACKETS)).clone()
}

/// Check that the builder reports the size of the serialized packet,
/// and serializes to the expected bytes.
pub fn check_serialize(builder: Builder, expected: &[u8]) {
    assert_eq!(builder.size(), Ok(expected.len()), "size of {}", builder.id());
    assert_eq!(builder.to_vec().as_deref(), Ok(expected));
}
