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

//! Helper definitions shared by packet views and builders.

pub mod bits;
pub mod checksum;
pub mod custom;
mod value;

pub use bits::ByteOrder;
pub use checksum::Checksum;
pub use custom::CustomField;
pub use value::Value;

/// Reasons for which a byte span does not match a definition.
///
/// Views report validation failures as a boolean; these errors
/// describe the failure in logs.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("when parsing {obj} needed length of {wanted} but got {got}")]
    InvalidLengthError { obj: String, wanted: usize, got: usize },
    #[error("{packet}::{field} was {actual:x}, expected {expected:x}")]
    InvalidFixedValue { packet: String, field: String, expected: u64, actual: u64 },
    #[error("invalid field {packet}::{field} value, {expected} != {actual}")]
    InvalidFieldValue { packet: String, field: String, expected: u64, actual: u64 },
    #[error("checksum {packet}::{field} mismatch, computed {computed:x} but read {actual:x}")]
    ChecksumMismatch { packet: String, field: String, computed: u64, actual: u64 },
    #[error("the size of {packet}::{field} ({size}) is smaller than its modifier ({modifier})")]
    InvalidSizeModifier { packet: String, field: String, size: usize, modifier: usize },
    #[error("custom field {packet}::{field} could not be decoded")]
    InvalidCustomField { packet: String, field: String },
    #[error("parent of {packet} is not valid")]
    InvalidParent { packet: String },
}

/// Type of serialization errors.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EncodeError {
    #[error("the size of {packet}::{field} ({size}) is outside the range of valid values 0..{maximum_size}")]
    SizeOverflow { packet: String, field: String, size: usize, maximum_size: usize },
    #[error(
        "the count of {packet}::{field} ({count}) is outside the range of valid values 0..{maximum_count}"
    )]
    CountOverflow { packet: String, field: String, count: usize, maximum_count: usize },
    #[error(
        "the value of {packet}::{field} ({value}) is outside the range of valid values 0..{maximum_value}"
    )]
    InvalidScalarValue { packet: String, field: String, value: u64, maximum_value: u64 },
    #[error("no value was provided for {packet}::{field}")]
    MissingField { packet: String, field: String },
    #[error("`{tag}` is not a tag of the enum type of {packet}::{field}")]
    InvalidEnumTag { packet: String, field: String, tag: String },
    #[error("{packet}::{field} expects {expected} value, got {actual}")]
    InvalidFieldValue {
        packet: String,
        field: String,
        expected: &'static str,
        actual: &'static str,
    },
    #[error("{packet}::{field} has {actual} elements, but {expected} were expected")]
    InvalidArrayLength { packet: String, field: String, expected: usize, actual: usize },
}
