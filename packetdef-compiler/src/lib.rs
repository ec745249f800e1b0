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

//! Packet definition compiler.
//!
//! Schemas are analyzed and compiled into field layouts; [`View`]
//! and [`Builder`] interpret the layouts to decode and encode packets.

pub mod analyzer;
pub mod ast;
pub mod builder;
pub mod codec;
mod field;
pub mod layout;
pub mod parser;
pub mod view;

pub use builder::Builder;
pub use codec::{Codec, Functions};
pub use packetdef_runtime::{DecodeError, EncodeError, Value};
pub use view::View;
