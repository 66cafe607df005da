// Copyright (c) 2026 Openmesh Network
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Deterministic core types and canonical encoding helpers.

use bincode::Options;
use cid::Cid;
use multihash::Multihash;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

/// Canonical serialization error.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("serialization")]
    Serialize,
    #[error("deserialization")]
    Deserialize,
    #[error("size limit exceeded")]
    TooLarge,
}

/// Canonical bincode options (deterministic).
fn bincode_opts() -> impl Options {
    // Fixint encoding provides a stable integer representation.
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .reject_trailing_bytes()
}

/// Encode with deterministic rules. Requires deterministic container ordering.
pub fn encode_canonical<T: Serialize>(v: &T) -> Result<Vec<u8>, CodecError> {
    bincode_opts()
        .serialize(v)
        .map_err(|_| CodecError::Serialize)
}

/// Decode with a hard size cap.
pub fn decode_canonical_limited<T: DeserializeOwned>(
    bytes: &[u8],
    max: usize,
) -> Result<T, CodecError> {
    if bytes.len() > max {
        return Err(CodecError::TooLarge);
    }
    // Cap inside the deserializer as well, large container lengths must not
    // allocate past `max`.
    bincode_opts()
        .with_limit(max as u64)
        .deserialize(bytes)
        .map_err(|_| CodecError::Deserialize)
}

/// Multicodec code for the dag-pb codec.
const CODEC_DAG_PB: u64 = 0x70;
/// Multihash code for sha2-256.
const MULTIHASH_SHA2_256: u64 = 0x12;

/// Content-id over a byte range: CIDv1, dag-pb, sha2-256.
///
/// Every fingerprint a collector emits is produced here, so the codec and
/// hash function are consensus-visible constants.
pub fn content_id(bytes: &[u8]) -> Cid {
    let digest = ring::digest::digest(&ring::digest::SHA256, bytes);
    // A 32-byte sha2-256 digest always fits the 64-byte multihash allocation.
    let mh = Multihash::<64>::wrap(MULTIHASH_SHA2_256, digest.as_ref()).expect("digest fits");
    Cid::new_v1(CODEC_DAG_PB, mh)
}

/// Validator address: first 20 bytes of SHA-256 over the Ed25519 public key.
pub fn validator_address(public_key: &[u8; 32]) -> [u8; 20] {
    let digest = ring::digest::digest(&ring::digest::SHA256, public_key);
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest.as_ref()[..20]);
    out
}

/// A `(source, topic)` pair assigned to one validator for one block.
///
/// Both fields index the global source table; this canonical integer form
/// is what hashing and equality operate on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Request {
    /// Index into the source table.
    pub source: u32,
    /// Index into that source's topic list.
    pub topic: u32,
}

impl Request {
    /// Construct from table indices.
    pub fn new(source: u32, topic: u32) -> Self {
        Self { source, topic }
    }
}

/// Ordered content-ids a validator collected for one request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Summary {
    /// The request this summary belongs to. Immutable after worker start.
    pub request: Request,
    /// Content-ids in flush order.
    pub data_hashes: Vec<Cid>,
}

impl Summary {
    /// Fresh summary for a newly bound request.
    pub fn new(request: Request) -> Self {
        Self {
            request,
            data_hashes: Vec::new(),
        }
    }
}

/// Transaction envelope carried in finalized blocks.
///
/// Wire format: canonical bincode, a fixint u32 variant tag followed by the
/// length-prefixed payload. Unknown tags fail to decode and are rejected.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Transaction {
    /// Plain data-bearing transaction.
    Normal {
        /// Opaque payload.
        payload: Vec<u8>,
    },
    /// Collection-audit transaction.
    Verification {
        /// Opaque payload.
        payload: Vec<u8>,
    },
    /// Resource-accounting transaction.
    Resource {
        /// Opaque payload.
        payload: Vec<u8>,
    },
}
