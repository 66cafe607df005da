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

//! The KV-store application behind the BFT callback surface.

use crate::bft::{
    AppError, Application, ExecTxResult, FinalizeBlockRequest, InfoResponse, QueryResponse,
};
use crate::collector::sources::{Joiner, Source};
use crate::collector::{assignment, CollectorInstance};
use crate::core::state::BlockStore;
use crate::core::types::{decode_canonical_limited, Transaction};
use crate::monitoring::metrics::Metrics;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

/// Hard cap on an encoded transaction record.
const TX_MAX_BYTES: usize = 1 << 20;

/// Application state: the block store, the staged block and the collector.
pub struct CoreApp<J: Joiner> {
    store: BlockStore,
    ongoing_block: Option<sled::Batch>,
    collector: CollectorInstance<J>,
    our_address: [u8; 20],
    sources: &'static [Source],
    metrics: Arc<Metrics>,
}

impl<J: Joiner> CoreApp<J> {
    /// Assemble the application.
    pub fn new(
        store: BlockStore,
        collector: CollectorInstance<J>,
        our_address: [u8; 20],
        sources: &'static [Source],
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            ongoing_block: None,
            collector,
            our_address,
            sources,
            metrics,
        }
    }

    /// Check the envelope format without running handlers.
    fn validate_transaction(&self, tx: &[u8]) -> u32 {
        match decode_canonical_limited::<Transaction>(tx, TX_MAX_BYTES) {
            Ok(_) => 0,
            Err(_) => 1,
        }
    }

    /// Decode the envelope and dispatch on the transaction type.
    fn execute_transaction(&self, tx: &[u8]) -> u32 {
        let transaction = match decode_canonical_limited::<Transaction>(tx, TX_MAX_BYTES) {
            Ok(t) => t,
            Err(_) => {
                debug!("undecodable transaction envelope");
                return 1;
            }
        };
        match transaction {
            Transaction::Normal { payload } => self.handle_normal_transaction(&payload),
            Transaction::Verification { payload } => self.handle_verification_transaction(&payload),
            Transaction::Resource { payload } => self.handle_resource_transaction(&payload),
        }
    }

    // TODO: validate the announced CIDs against the collector's summaries
    // once the verification payload format is settled.
    fn handle_normal_transaction(&self, _payload: &[u8]) -> u32 {
        0
    }

    fn handle_verification_transaction(&self, _payload: &[u8]) -> u32 {
        0
    }

    fn handle_resource_transaction(&self, _payload: &[u8]) -> u32 {
        0
    }
}

/// Split a record on the first `=` byte into key and value.
fn split_key_value(tx: &[u8]) -> Option<(&[u8], &[u8])> {
    let idx = tx.iter().position(|&b| b == b'=')?;
    Some((&tx[..idx], &tx[idx + 1..]))
}

#[async_trait]
impl<J: Joiner> Application for CoreApp<J> {
    fn info(&self) -> InfoResponse {
        InfoResponse {
            data: "openmesh-core".to_string(),
            app_version: 1,
        }
    }

    fn query(&self, data: &[u8]) -> QueryResponse {
        match self.store.get(data) {
            Ok(Some(value)) => QueryResponse {
                key: data.to_vec(),
                value: Some(value),
                log: "exists",
            },
            Ok(None) => QueryResponse {
                key: data.to_vec(),
                value: None,
                log: "key does not exist",
            },
            Err(_) => QueryResponse {
                key: data.to_vec(),
                value: None,
                log: "query failed",
            },
        }
    }

    fn check_tx(&self, tx: &[u8]) -> u32 {
        self.validate_transaction(tx)
    }

    async fn finalize_block(
        &mut self,
        req: FinalizeBlockRequest,
    ) -> Result<Vec<ExecTxResult>, AppError> {
        let mut batch = sled::Batch::default();
        let mut results = Vec::with_capacity(req.txs.len());

        for (index, tx) in req.txs.iter().enumerate() {
            let code = self.execute_transaction(tx);
            if code != 0 {
                warn!(index, "invalid transaction");
                results.push(ExecTxResult { code });
                continue;
            }
            let Some((key, value)) = split_key_value(tx) else {
                warn!(index, "transaction record has no key=value form");
                results.push(ExecTxResult { code: 1 });
                continue;
            };
            batch.insert(key.to_vec(), value.to_vec());
            results.push(ExecTxResult::default());
        }

        self.ongoing_block = Some(batch);
        self.metrics.block_height.set(req.height as i64);
        self.metrics.transactions_total.inc_by(req.txs.len() as u64);

        // Every node derives the same tables from the same block hash; only
        // the slot matching our own address is acted on.
        let tables = assignment::assign_requests(
            &req.hash_prev,
            req.voters.len(),
            self.sources,
            assignment::ROUNDS,
        );
        if let Some(slot) = assignment::self_assignment(&tables, &req.voters, &self.our_address) {
            let slot = slot.to_vec();
            debug!(height = req.height, requests = slot.len(), "self-assigned");
            let summaries = self.collector.submit_requests(&slot).await?;
            self.metrics.assignments_total.inc();
            self.metrics
                .summaries_sealed_total
                .inc_by(summaries.len() as u64);
            for summary in &summaries {
                self.metrics
                    .data_hashes_total
                    .inc_by(summary.data_hashes.len() as u64);
                debug!(
                    request = ?summary.request,
                    hashes = summary.data_hashes.len(),
                    "sealed summary"
                );
            }
        }

        Ok(results)
    }

    fn commit(&mut self) -> Result<(), AppError> {
        let batch = self.ongoing_block.take().ok_or(AppError::NoOpenBlock)?;
        self.store.commit_block(batch)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::sources::{SourceError, Subscription, SOURCES};
    use crate::core::types::{encode_canonical, validator_address};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    /// Joiner that records joins and hands out idle channels.
    #[derive(Default)]
    struct RecordingJoiner {
        joins: Arc<Mutex<Vec<(String, String)>>>,
    }

    #[async_trait]
    impl Joiner for RecordingJoiner {
        async fn join(
            &self,
            _cancel: CancellationToken,
            source: &Source,
            topic: &str,
        ) -> Result<Subscription, SourceError> {
            self.joins
                .lock()
                .unwrap()
                .push((source.name.to_string(), topic.to_string()));
            let (_msg_tx, messages) = mpsc::channel(1);
            let (_err_tx, errors) = mpsc::channel(1);
            Ok(Subscription { messages, errors })
        }
    }

    fn new_app(joins: Arc<Mutex<Vec<(String, String)>>>) -> (CoreApp<RecordingJoiner>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = BlockStore::open(dir.path().to_str().unwrap()).unwrap();
        let mut collector =
            CollectorInstance::new(SOURCES, RecordingJoiner { joins }, CancellationToken::new());
        collector.start().unwrap();
        let metrics = Arc::new(Metrics::new().unwrap());
        let app = CoreApp::new(store, collector, validator_address(&[1u8; 32]), SOURCES, metrics);
        (app, dir)
    }

    fn kv_tx(record: &[u8]) -> Vec<u8> {
        encode_canonical(&Transaction::Normal {
            payload: record.to_vec(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn finalize_then_commit_persists_writes() {
        let (mut app, _dir) = new_app(Arc::default());
        let tx = kv_tx(b"sensor=42");
        let (key, value) = split_key_value(&tx).unwrap();
        let (key, value) = (key.to_vec(), value.to_vec());

        let results = app
            .finalize_block(FinalizeBlockRequest {
                height: 1,
                hash_prev: vec![0u8; 32],
                txs: vec![tx],
                voters: vec![],
            })
            .await
            .unwrap();
        assert_eq!(results, vec![ExecTxResult { code: 0 }]);

        // Staged but not yet visible.
        assert_eq!(app.query(&key).value, None);
        app.commit().unwrap();
        assert_eq!(app.query(&key).value, Some(value));
        assert_eq!(app.query(&key).log, "exists");
    }

    #[tokio::test]
    async fn invalid_envelope_is_rejected_without_writes() {
        let (mut app, _dir) = new_app(Arc::default());
        let results = app
            .finalize_block(FinalizeBlockRequest {
                height: 1,
                hash_prev: vec![0u8; 32],
                txs: vec![b"garbage=bytes".to_vec()],
                voters: vec![],
            })
            .await
            .unwrap();
        assert_eq!(results[0].code, 1);

        app.commit().unwrap();
        assert_eq!(app.query(b"garbage").value, None);
    }

    #[tokio::test]
    async fn check_tx_validates_the_envelope_only() {
        let (app, _dir) = new_app(Arc::default());
        assert_eq!(app.check_tx(&kv_tx(b"a=b")), 0);
        assert_eq!(app.check_tx(b"not an envelope"), 1);
    }

    #[tokio::test]
    async fn commit_without_finalize_is_an_error() {
        let (mut app, _dir) = new_app(Arc::default());
        assert!(matches!(app.commit(), Err(AppError::NoOpenBlock)));
    }

    #[tokio::test]
    async fn self_assignment_opens_subscriptions() {
        let joins: Arc<Mutex<Vec<(String, String)>>> = Arc::default();
        let (mut app, _dir) = new_app(joins.clone());
        let ours = validator_address(&[1u8; 32]);

        app.finalize_block(FinalizeBlockRequest {
            height: 2,
            hash_prev: vec![7u8; 32],
            txs: vec![],
            voters: vec![ours],
        })
        .await
        .unwrap();

        // A single validator drains the table round by round: one request per
        // round, de-duplicated within the slot.
        let joins = joins.lock().unwrap();
        assert_eq!(joins.len(), assignment::ROUNDS);
        assert_eq!(joins[0], ("coinbase".to_string(), "BTC-USD".to_string()));
        for (i, a) in joins.iter().enumerate() {
            assert!(!joins[i + 1..].contains(a));
        }
    }

    #[tokio::test]
    async fn other_voters_do_not_trigger_collection() {
        let joins: Arc<Mutex<Vec<(String, String)>>> = Arc::default();
        let (mut app, _dir) = new_app(joins.clone());

        app.finalize_block(FinalizeBlockRequest {
            height: 3,
            hash_prev: vec![7u8; 32],
            txs: vec![],
            voters: vec![validator_address(&[9u8; 32])],
        })
        .await
        .unwrap();

        assert!(joins.lock().unwrap().is_empty());
    }
}
