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

use bytes::BufMut;

use super::{TransactionId, take_array};

/// Identifier of a local (single-resource) transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, derive_more::Display)]
#[display("local-tx-{_0}")]
pub struct LocalTxId(pub u64);

impl TransactionId for LocalTxId {
    fn encode_into(&self, buf: &mut Vec<u8>) { buf.put_u64_le(self.0) }

    fn decode_from(buf: &mut &[u8]) -> Option<Self> { Some(Self(u64::from_le_bytes(take_array(buf)?))) }
}
