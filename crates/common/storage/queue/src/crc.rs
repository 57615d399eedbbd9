// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! CRC32 checksum utilities for journal entries and the control file.
//!
//! Uses CRC-32 (IEEE polynomial) via crc32fast. A journal entry checksum
//! covers both the length field and the body so that a torn length prefix
//! is detected as well as a damaged body.

use crc32fast::Hasher;

/// Calculates the CRC32 checksum for a length-prefixed journal entry.
///
/// # Arguments
/// * `length` - The body length (included in the checksum)
/// * `body` - The encoded entry body
#[inline]
pub(crate) fn calculate_entry_crc(length: u32, body: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(&length.to_le_bytes());
    hasher.update(body);
    hasher.finalize()
}

/// Verifies a journal entry checksum.
#[inline]
pub(crate) fn verify_entry_crc(length: u32, body: &[u8], expected: u32) -> bool {
    calculate_entry_crc(length, body) == expected
}

/// Plain CRC32 over a byte slice.
#[inline]
pub(crate) fn checksum(data: &[u8]) -> u32 { crc32fast::hash(data) }
