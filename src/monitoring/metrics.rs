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

use prometheus::{IntCounter, IntGauge, Registry};
use thiserror::Error;

/// Metrics errors.
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("prometheus")]
    Prom,
}

/// Metrics container.
#[derive(Clone)]
pub struct Metrics {
    /// Registry.
    pub registry: Registry,

    /// Connected peers gauge.
    pub p2p_peers: IntGauge,
    /// Latest finalized block height.
    pub block_height: IntGauge,
    /// Total transactions processed.
    pub transactions_total: IntCounter,

    /// Blocks in which this node received an assignment.
    pub assignments_total: IntCounter,
    /// Summaries sealed by assignment swaps.
    pub summaries_sealed_total: IntCounter,
    /// Content-ids flushed across all summaries.
    pub data_hashes_total: IntCounter,

    /// Verified update requests.
    pub update_requests_verified_total: IntCounter,
    /// Rejected update requests (unknown key, bad signature, replay, codec).
    pub update_requests_rejected_total: IntCounter,
}

impl Metrics {
    /// Create and register metrics.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let p2p_peers = IntGauge::new("openmesh_p2p_peers", "Connected peers")
            .map_err(|_| MetricsError::Prom)?;
        let block_height = IntGauge::new("openmesh_block_height", "Latest finalized block height")
            .map_err(|_| MetricsError::Prom)?;
        let transactions_total =
            IntCounter::new("openmesh_transactions_total", "Total tx processed")
                .map_err(|_| MetricsError::Prom)?;

        let assignments_total = IntCounter::new(
            "openmesh_assignments_total",
            "Blocks with a local collection assignment",
        )
        .map_err(|_| MetricsError::Prom)?;
        let summaries_sealed_total = IntCounter::new(
            "openmesh_summaries_sealed_total",
            "Summaries sealed by assignment swaps",
        )
        .map_err(|_| MetricsError::Prom)?;
        let data_hashes_total = IntCounter::new(
            "openmesh_data_hashes_total",
            "Content-ids flushed across all summaries",
        )
        .map_err(|_| MetricsError::Prom)?;

        let update_requests_verified_total = IntCounter::new(
            "openmesh_update_requests_verified_total",
            "Verified update requests",
        )
        .map_err(|_| MetricsError::Prom)?;
        let update_requests_rejected_total = IntCounter::new(
            "openmesh_update_requests_rejected_total",
            "Rejected update requests",
        )
        .map_err(|_| MetricsError::Prom)?;

        registry
            .register(Box::new(p2p_peers.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(block_height.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(transactions_total.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(assignments_total.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(summaries_sealed_total.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(data_hashes_total.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(update_requests_verified_total.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(update_requests_rejected_total.clone()))
            .map_err(|_| MetricsError::Prom)?;

        Ok(Self {
            registry,
            p2p_peers,
            block_height,
            transactions_total,
            assignments_total,
            summaries_sealed_total,
            data_hashes_total,
            update_requests_verified_total,
            update_requests_rejected_total,
        })
    }
}
