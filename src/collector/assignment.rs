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
#![deny(missing_docs)]

//! Deterministic source-to-validator assignment.
//!
//! Every node runs this on the previous block hash at each finalized block.
//! Identical inputs must yield byte-identical priority tables, so all
//! randomness comes from a ChaCha8 stream seeded by the folded hash and the
//! iteration order is fixed by the source table.

use crate::collector::sources::Source;
use crate::core::types::Request;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

/// Assignment rounds per block. Each validator receives at most this many
/// requests per block.
pub const ROUNDS: usize = 5;

/// Fold a block hash into a signed 64-bit seed: `seed = (seed XOR byte) << 8`
/// over the hash bytes in order, with wrapping shifts.
pub fn seed_from_hash(hash: &[u8]) -> i64 {
    let mut seed: i64 = 0;
    for &byte in hash {
        seed = (seed ^ i64::from(byte)).wrapping_shl(8);
    }
    seed
}

/// One validator slot: its priority list plus the per-round free marker.
/// Keeping both in one element makes the joint shuffle trivially correct.
#[derive(Clone, Debug, Default)]
struct Slot {
    free: bool,
    requests: Vec<Request>,
}

/// Build per-validator priority lists for one block.
///
/// The result is indexed by voter-set position. Within a slot no
/// `(source, topic)` pair repeats; a slot holds at most `rounds` entries.
/// When `validator_count * rounds` is smaller than the total topic count,
/// the surplus tuples go unassigned this block.
pub fn assign_requests(
    hash_prev: &[u8],
    validator_count: usize,
    sources: &[Source],
    rounds: usize,
) -> Vec<Vec<Request>> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed_from_hash(hash_prev) as u64);
    let mut slots: Vec<Slot> = vec![Slot::default(); validator_count];

    for _ in 0..rounds {
        for slot in slots.iter_mut() {
            slot.free = true;
        }
        slots.shuffle(&mut rng);

        for (source_index, source) in sources.iter().enumerate() {
            for topic_index in 0..source.topics.len() {
                let request = Request::new(source_index as u32, topic_index as u32);
                if let Some(slot) = slots
                    .iter_mut()
                    .find(|s| s.free && !s.requests.contains(&request))
                {
                    slot.free = false;
                    slot.requests.push(request);
                }
            }
        }
    }

    slots.into_iter().map(|s| s.requests).collect()
}

/// Look up our own slot in the freshly built table, if this node is a voter.
pub fn self_assignment<'a>(
    tables: &'a [Vec<Request>],
    voters: &[[u8; 20]],
    our_address: &[u8; 20],
) -> Option<&'a [Request]> {
    voters
        .iter()
        .position(|addr| addr == our_address)
        .and_then(|i| tables.get(i))
        .map(|slot| slot.as_slice())
}
