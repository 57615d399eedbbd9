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

//! Item serialization.
//!
//! Persistent stores and journals only ever see encoded bytes. The host
//! supplies a [`Codec`]; [`BincodeCodec`] covers any serde type.

use std::{fmt, sync::Arc};

use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};

use crate::{Result, error::CodecSnafu};

/// Bounds required of anything stored in a queue.
pub trait QueueItem: Clone + PartialEq + Send + Sync + fmt::Debug + 'static {}

impl<T> QueueItem for T where T: Clone + PartialEq + Send + Sync + fmt::Debug + 'static {}

/// Converts queue items to and from bytes.
///
/// Encoding must be deterministic: recovery matches items by comparing
/// decoded values and cancels a transaction's own add/remove pairs by
/// comparing encoded bytes.
pub trait Codec<T>: Send + Sync {
    fn encode(&self, item: &T) -> Result<Bytes>;

    fn decode(&self, bytes: &[u8]) -> Result<T>;
}

pub type SharedCodec<T> = Arc<dyn Codec<T>>;

/// Serde codec using bincode's standard configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeCodec;

impl<T> Codec<T> for BincodeCodec
where
    T: Serialize + DeserializeOwned,
{
    fn encode(&self, item: &T) -> Result<Bytes> {
        bincode::serde::encode_to_vec(item, bincode::config::standard())
            .map(Bytes::from)
            .map_err(|e| {
                CodecSnafu {
                    message: e.to_string(),
                }
                .build()
            })
    }

    fn decode(&self, bytes: &[u8]) -> Result<T> {
        let (item, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| {
                CodecSnafu {
                    message: e.to_string(),
                }
                .build()
            })?;
        Ok(item)
    }
}
