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

//! Checksum functions referenced by checksum declarations.

/// Integrity function computed over the bytes between a checksum
/// start marker and the checksum field.
///
/// The result is truncated to the width of the checksum declaration.
pub trait Checksum: Send + Sync {
    fn compute(&self, data: &[u8]) -> u64;
}

impl<F> Checksum for F
where
    F: Fn(&[u8]) -> u64 + Send + Sync,
{
    fn compute(&self, data: &[u8]) -> u64 {
        self(data)
    }
}

/// Arithmetic sum of the bytes.
#[derive(Debug, Default, Clone, Copy)]
pub struct ByteSum;

impl Checksum for ByteSum {
    fn compute(&self, data: &[u8]) -> u64 {
        data.iter().fold(0u64, |sum, byte| sum.wrapping_add(*byte as u64))
    }
}

/// Exclusive or of the bytes.
#[derive(Debug, Default, Clone, Copy)]
pub struct Xor;

impl Checksum for Xor {
    fn compute(&self, data: &[u8]) -> u64 {
        data.iter().fold(0u64, |acc, byte| acc ^ *byte as u64)
    }
}
