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

use async_trait::async_trait;
use openmesh_core::collector::sources::{Joiner, Source, SourceError, SourceKind, Subscription};
use openmesh_core::collector::CollectorInstance;
use openmesh_core::core::types::{content_id, Request};
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

static TEST_SOURCES: &[Source] = &[Source {
    name: "loopback",
    kind: SourceKind::CexWebsocket,
    endpoint: "wss://loopback.invalid",
    topics: &["t0", "t1"],
    request_template: "{{topic}}",
}];

/// Hands out pre-built subscriptions in submission order.
struct QueueJoiner {
    queue: Mutex<VecDeque<Result<Subscription, SourceError>>>,
}

impl QueueJoiner {
    fn new(subscriptions: Vec<Result<Subscription, SourceError>>) -> Self {
        Self {
            queue: Mutex::new(subscriptions.into()),
        }
    }
}

#[async_trait]
impl Joiner for QueueJoiner {
    async fn join(
        &self,
        _cancel: CancellationToken,
        _source: &Source,
        _topic: &str,
    ) -> Result<Subscription, SourceError> {
        self.queue
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(SourceError::Connect))
    }
}

fn feed() -> (mpsc::Sender<Vec<u8>>, Subscription) {
    let (msg_tx, messages) = mpsc::channel(16);
    // A closed error channel reads as a terminated stream, which workers
    // tolerate, so the error sender can be dropped right away.
    let (_err_tx, errors) = mpsc::channel(1);
    (msg_tx, Subscription { messages, errors })
}

#[tokio::test]
async fn reassignment_seals_buffered_bytes_into_one_content_id() {
    let (msg_tx, sub1) = feed();
    let (_tx2, sub2) = feed();
    let mut collector = CollectorInstance::new(
        TEST_SOURCES,
        QueueJoiner::new(vec![Ok(sub1), Ok(sub2)]),
        CancellationToken::new(),
    );
    collector.start().unwrap();

    // First submission: nothing was live, so no summaries come back.
    let sealed = collector
        .submit_requests(&[Request::new(0, 0)])
        .await
        .unwrap();
    assert!(sealed.is_empty());

    // Push 3 KiB into the live worker as three messages.
    let payload: Vec<u8> = (0..3072u32).map(|i| (i % 251) as u8).collect();
    for chunk in payload.chunks(1024) {
        msg_tx.send(chunk.to_vec()).await.unwrap();
    }

    // The swap must flush exactly one content-id covering those 3 KiB.
    let sealed = collector
        .submit_requests(&[Request::new(0, 1)])
        .await
        .unwrap();
    assert_eq!(sealed.len(), 1);
    assert_eq!(sealed[0].request, Request::new(0, 0));
    assert_eq!(sealed[0].data_hashes, vec![content_id(&payload)]);
}

#[tokio::test]
async fn resubmitting_the_same_requests_reaches_the_same_shape() {
    let (_tx1, sub1) = feed();
    let (_tx2, sub2) = feed();
    let mut collector = CollectorInstance::new(
        TEST_SOURCES,
        QueueJoiner::new(vec![Ok(sub1), Ok(sub2)]),
        CancellationToken::new(),
    );
    collector.start().unwrap();

    let requests = [Request::new(0, 0)];
    let first = collector.submit_requests(&requests).await.unwrap();
    assert!(first.is_empty());

    // Same submission again: the prior slot seals (empty, nothing arrived)
    // and the worker ends up bound to the same request.
    let second = collector.submit_requests(&requests).await.unwrap();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].request, Request::new(0, 0));
    assert!(second[0].data_hashes.is_empty());
}

#[tokio::test]
async fn failed_join_leaves_the_slot_bound_and_silent() {
    let (_tx2, sub2) = feed();
    let mut collector = CollectorInstance::new(
        TEST_SOURCES,
        QueueJoiner::new(vec![Err(SourceError::Connect), Ok(sub2)]),
        CancellationToken::new(),
    );
    collector.start().unwrap();

    // Join fails; the submission itself must still succeed.
    let sealed = collector
        .submit_requests(&[Request::new(0, 0)])
        .await
        .unwrap();
    assert!(sealed.is_empty());

    // The silent slot seals an empty summary carrying its request.
    let sealed = collector
        .submit_requests(&[Request::new(0, 1)])
        .await
        .unwrap();
    assert_eq!(sealed.len(), 1);
    assert_eq!(sealed[0].request, Request::new(0, 0));
    assert!(sealed[0].data_hashes.is_empty());
}

#[tokio::test]
async fn oversized_messages_split_into_buffer_sized_content_ids() {
    let (msg_tx, sub1) = feed();
    let (_tx2, sub2) = feed();
    let mut collector = CollectorInstance::new(
        TEST_SOURCES,
        QueueJoiner::new(vec![Ok(sub1), Ok(sub2)]),
        CancellationToken::new(),
    );
    collector.start().unwrap();

    collector
        .submit_requests(&[Request::new(0, 0)])
        .await
        .unwrap();

    // 4 KiB + 100 bytes in one message: one full-buffer flush plus a tail.
    let payload: Vec<u8> = (0..4196u32).map(|i| (i % 193) as u8).collect();
    msg_tx.send(payload.clone()).await.unwrap();

    let sealed = collector
        .submit_requests(&[Request::new(0, 1)])
        .await
        .unwrap();
    assert_eq!(sealed.len(), 1);
    assert_eq!(
        sealed[0].data_hashes,
        vec![content_id(&payload[..4096]), content_id(&payload[4096..])]
    );
}
