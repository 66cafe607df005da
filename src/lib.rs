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

//! Openmesh Core - decentralized data-oracle node.
//!
//! This repository provides:
//! - Deterministic source-to-validator assignment driven by finalized blocks
//! - A collector that subscribes to external data streams and folds the raw
//!   bytes into content-addressed fingerprints (CIDv1, dag-pb, sha2-256)
//! - A threshold-signed auto-update engine listening on a gossip topic
//! - An application-side BFT callback surface backed by a sled KV store
//! - Encrypted P2P overlay (libp2p Noise + Yamux) with gossipsub and a
//!   content-addressed fetch protocol
//! - Monitoring via Prometheus metrics and structured logging

/// BFT application callback surface and the KV-store application.
pub mod bft;
/// Data collection: source adapters, worker pool, assignment engine.
pub mod collector;
/// Configuration loading (YAML + CLI flag).
pub mod config;
/// Core protocol primitives (types, canonical codec, storage, keys).
pub mod core;
/// Observability (metrics container and HTTP endpoint).
pub mod monitoring;
/// P2P overlay (libp2p transport, gossip, content fetch).
pub mod networking;
/// Signed auto-update engine.
pub mod updater;
