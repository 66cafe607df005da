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

//! Application-side surface of the external BFT engine.
//!
//! Consensus itself (proposal, voting, gossip, view-change) lives in the
//! engine process; this crate only implements the callbacks it drives per
//! block. `finalize_block` carries the previous block hash and the voter
//! addresses that decided the last commit, which is everything the
//! assignment engine needs.

pub mod app;

use crate::collector::CollectorError;
use crate::core::state::StateError;
use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

/// Application errors surfaced to the engine driver.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("state")]
    State(#[from] StateError),
    #[error("collector")]
    Collector(#[from] CollectorError),
    #[error("commit without an open block")]
    NoOpenBlock,
}

/// Engine handshake response.
#[derive(Clone, Debug, Default)]
pub struct InfoResponse {
    /// Application identifier.
    pub data: String,
    /// Application version.
    pub app_version: u64,
}

/// Read-only query response.
#[derive(Clone, Debug)]
pub struct QueryResponse {
    /// Echoed key.
    pub key: Vec<u8>,
    /// Stored value, if any.
    pub value: Option<Vec<u8>>,
    /// Human-readable outcome.
    pub log: &'static str,
}

/// Per-transaction execution result; zero means success.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExecTxResult {
    /// Non-zero rejects the transaction.
    pub code: u32,
}

/// One finalized block as delivered by the engine.
#[derive(Clone, Debug, Default)]
pub struct FinalizeBlockRequest {
    /// Block height.
    pub height: u64,
    /// Hash of the previous block; the assignment seed.
    pub hash_prev: Vec<u8>,
    /// Raw transaction records.
    pub txs: Vec<Vec<u8>>,
    /// Addresses of the validators whose votes decided the last commit,
    /// in voter-set order.
    pub voters: Vec<[u8; 20]>,
}

/// The callback surface the external engine drives.
#[async_trait]
pub trait Application: Send {
    /// Engine handshake.
    fn info(&self) -> InfoResponse {
        InfoResponse::default()
    }

    /// Chain bootstrap.
    fn init_chain(&mut self) {}

    /// Read-only state query.
    fn query(&self, data: &[u8]) -> QueryResponse;

    /// Mempool admission; zero accepts.
    fn check_tx(&self, tx: &[u8]) -> u32;

    /// Pass proposed transactions through unchanged.
    fn prepare_proposal(&self, txs: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
        txs
    }

    /// Accept every proposal.
    fn process_proposal(&self, _txs: &[Vec<u8>]) -> bool {
        true
    }

    /// Execute a finalized block: stage KV writes, run the assignment
    /// engine and, when self-assigned, swap the collector's requests.
    async fn finalize_block(
        &mut self,
        req: FinalizeBlockRequest,
    ) -> Result<Vec<ExecTxResult>, AppError>;

    /// Persist the staged block. A failure here is fatal to the process.
    fn commit(&mut self) -> Result<(), AppError>;

    // Snapshot and vote-extension endpoints are stubs.

    /// State-sync snapshot listing (stub).
    fn list_snapshots(&self) {}
    /// State-sync snapshot offer (stub).
    fn offer_snapshot(&self) {}
    /// State-sync chunk load (stub).
    fn load_snapshot_chunk(&self) {}
    /// State-sync chunk apply (stub).
    fn apply_snapshot_chunk(&self) {}
    /// Vote extension (stub).
    fn extend_vote(&self) {}
    /// Vote extension verification (stub).
    fn verify_vote_extension(&self) {}
}

/// Mount point for the external engine.
///
/// The engine runs out of process against `home_dir` (its own config,
/// genesis and validator keys live there) and drives the [`Application`]
/// callbacks held here.
pub struct Instance<A: Application> {
    app: A,
    home_dir: String,
}

impl<A: Application> Instance<A> {
    /// Wrap an application for the engine at `home_dir`.
    pub fn new(app: A, home_dir: String) -> Self {
        Self { app, home_dir }
    }

    /// Announce readiness to serve engine callbacks.
    pub fn start(&self) {
        info!(home = %self.home_dir, "bft application surface ready");
    }

    /// The application, for the engine driver.
    pub fn app_mut(&mut self) -> &mut A {
        &mut self.app
    }
}
