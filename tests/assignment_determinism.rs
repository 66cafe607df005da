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

use openmesh_core::collector::assignment::{assign_requests, seed_from_hash, ROUNDS};
use openmesh_core::collector::sources::{Source, SourceKind};
use proptest::prelude::*;

static TABLE: &[Source] = &[
    Source {
        name: "a",
        kind: SourceKind::CexWebsocket,
        endpoint: "wss://a.invalid",
        topics: &["t0"],
        request_template: "{{topic}}",
    },
    Source {
        name: "b",
        kind: SourceKind::CexWebsocket,
        endpoint: "wss://b.invalid",
        topics: &["t0", "t1", "t2"],
        request_template: "{{topic}}",
    },
    Source {
        name: "c",
        kind: SourceKind::RpcPoll,
        endpoint: "https://c.invalid",
        topics: &[""],
        request_template: "",
    },
];

fn topic_total() -> usize {
    TABLE.iter().map(|s| s.topics.len()).sum()
}

proptest! {
    #[test]
    fn identical_inputs_give_identical_tables(
        hash in prop::collection::vec(any::<u8>(), 0..64),
        validators in 0usize..8,
        rounds in 0usize..=ROUNDS,
    ) {
        let first = assign_requests(&hash, validators, TABLE, rounds);
        let second = assign_requests(&hash, validators, TABLE, rounds);
        prop_assert_eq!(first, second);
    }

    #[test]
    fn slots_respect_round_and_uniqueness_bounds(
        hash in prop::collection::vec(any::<u8>(), 0..64),
        validators in 0usize..8,
        rounds in 0usize..=ROUNDS,
    ) {
        let tables = assign_requests(&hash, validators, TABLE, rounds);
        prop_assert_eq!(tables.len(), validators);

        let mut per_round_cap = 0usize;
        for slot in &tables {
            prop_assert!(slot.len() <= rounds);
            per_round_cap += slot.len();
            for (i, request) in slot.iter().enumerate() {
                // No duplicate (source, topic) pair within a slot.
                prop_assert!(!slot[i + 1..].contains(request));
                // Every request points into the table.
                let source = &TABLE[request.source as usize];
                prop_assert!((request.topic as usize) < source.topics.len());
            }
        }
        // A round can hand out at most one request per validator and at most
        // one per (source, topic) tuple.
        prop_assert!(per_round_cap <= rounds * validators.min(topic_total()));
    }

    #[test]
    fn seed_fold_is_a_pure_function(hash in prop::collection::vec(any::<u8>(), 0..64)) {
        prop_assert_eq!(seed_from_hash(&hash), seed_from_hash(&hash));
    }
}
