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

//! Source adapter registry.
//!
//! All supported upstream sources are laid out in the [`SOURCES`] table. The
//! table order is consensus-visible: the assignment engine iterates it, so
//! reordering entries changes every node's priority tables.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Source adapter errors. At most one terminal error per subscription.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("connect")]
    Connect,
    #[error("transport")]
    Transport,
    #[error("bad request")]
    BadRequest,
}

/// How to open a stream for this source.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceKind {
    /// Exchange websocket: dial, send the subscription request, forward frames.
    CexWebsocket,
    /// Blockchain RPC: poll at 1 Hz, emit only when the chain head changes.
    RpcPoll,
}

/// A named upstream producer of a raw byte stream.
#[derive(Clone, Copy, Debug)]
pub struct Source {
    /// Unique name.
    pub name: &'static str,
    /// Adapter selection.
    pub kind: SourceKind,
    /// Endpoint URL.
    pub endpoint: &'static str,
    /// Ordered topic strings (ordering is consensus-visible).
    pub topics: &'static [&'static str],
    /// Subscription request with a `{{topic}}` placeholder.
    pub request_template: &'static str,
}

/// The master table with all our sources.
pub static SOURCES: &[Source] = &[
    // Centralised exchanges. Topic lists are incomplete, they are undecided.
    Source {
        name: "coinbase",
        kind: SourceKind::CexWebsocket,
        endpoint: "wss://ws-feed.pro.coinbase.com",
        topics: &["BTC-USD", "ETH-USD", "BTC-ETH"],
        request_template: r#"{"type": "subscribe", "product_ids": [ "{{topic}}" ], "channels": [ "ticker" ]}"#,
    },
    Source {
        name: "dydx",
        kind: SourceKind::CexWebsocket,
        endpoint: "wss://api.dydx.exchange/v3/ws",
        topics: &["MATIC-USD", "LINK-USD", "SOL-USD", "ETH-USD", "BTC-USD"],
        request_template: r#"{"type": "subscribe", "id": "{{topic}}", "channel": "v3_trades"}"#,
    },
    // Blockchain RPCs.
    Source {
        name: "ethereum-ankr-rpc",
        kind: SourceKind::RpcPoll,
        endpoint: "https://rpc.ankr.com/eth",
        topics: &[""],
        request_template: "",
    },
];

/// Channel capacity for adapter message streams.
const MESSAGE_CHANNEL_CAPACITY: usize = 256;

/// An open stream: whole application-level messages plus a terminal error slot.
pub struct Subscription {
    /// Whole messages as byte slices; the adapter handles framing.
    pub messages: mpsc::Receiver<Vec<u8>>,
    /// Buffered with capacity 1; receives at most one terminal error.
    pub errors: mpsc::Receiver<SourceError>,
}

/// Opens subscriptions for the collector. The live implementation dispatches
/// on [`SourceKind`]; tests substitute their own streams here.
#[async_trait]
pub trait Joiner: Send + Sync + 'static {
    /// Connect to `source` for `topic`. Cancelling `cancel` must close the
    /// transport and both channels within a bounded time.
    async fn join(
        &self,
        cancel: CancellationToken,
        source: &Source,
        topic: &str,
    ) -> Result<Subscription, SourceError>;
}

/// Production joiner backed by real transports.
#[derive(Clone, Copy, Debug, Default)]
pub struct LiveJoiner;

#[async_trait]
impl Joiner for LiveJoiner {
    async fn join(
        &self,
        cancel: CancellationToken,
        source: &Source,
        topic: &str,
    ) -> Result<Subscription, SourceError> {
        match source.kind {
            SourceKind::CexWebsocket => join_cex_websocket(cancel, source, topic).await,
            SourceKind::RpcPoll => join_rpc_poll(cancel, source).await,
        }
    }
}

/// Default adapter for CEXs since the majority of them use this flow.
/// The topic is assumed to already be in the source's own format.
async fn join_cex_websocket(
    cancel: CancellationToken,
    source: &Source,
    topic: &str,
) -> Result<Subscription, SourceError> {
    let (ws, _response) = connect_async(source.endpoint).await.map_err(|e| {
        warn!(source = source.name, err = %e, "websocket dial failed");
        SourceError::Connect
    })?;
    let (mut sink, mut stream) = ws.split();

    let request = source.request_template.replacen("{{topic}}", topic, 1);
    sink.send(Message::Text(request)).await.map_err(|e| {
        warn!(source = source.name, err = %e, "subscription request failed");
        SourceError::Connect
    })?;

    let (msg_tx, msg_rx) = mpsc::channel(MESSAGE_CHANNEL_CAPACITY);
    let (err_tx, err_rx) = mpsc::channel(1);

    let name = source.name;
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return;
                }
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        if msg_tx.send(text.into_bytes()).await.is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        if msg_tx.send(data).await.is_err() {
                            return;
                        }
                    }
                    // Ping/pong frames are answered by the transport layer.
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(source = name, "websocket closed by remote");
                        let _ = err_tx.try_send(SourceError::Transport);
                        return;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(source = name, err = %e, "websocket read failed");
                        let _ = err_tx.try_send(SourceError::Transport);
                        return;
                    }
                }
            }
        }
    });

    Ok(Subscription {
        messages: msg_rx,
        errors: err_rx,
    })
}

/// Per-tick deadline for RPC polls, independent of the parent context so a
/// hung request cannot stall the loop silently.
const RPC_TICK_TIMEOUT: Duration = Duration::from_secs(2);

/// Poll a blockchain RPC for its latest block and emit the raw response
/// whenever the block hash changes. One block per second plus request delay
/// is roughly alright since new blocks take ~11 seconds.
async fn join_rpc_poll(
    cancel: CancellationToken,
    source: &Source,
) -> Result<Subscription, SourceError> {
    let client = reqwest::Client::new();
    let endpoint = source.endpoint;
    let name = source.name;

    let (msg_tx, msg_rx) = mpsc::channel(MESSAGE_CHANNEL_CAPACITY);
    let (err_tx, err_rx) = mpsc::channel(1);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut header_previous: Option<String> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    let sent = client
                        .post(endpoint)
                        .timeout(RPC_TICK_TIMEOUT)
                        .json(&serde_json::json!({
                            "jsonrpc": "2.0",
                            "method": "eth_getBlockByNumber",
                            "params": ["latest", false],
                            "id": 1,
                        }))
                        .send()
                        .await;

                    let body = match sent {
                        Ok(resp) => match resp.bytes().await {
                            Ok(body) => body,
                            Err(e) => {
                                warn!(source = name, err = %e, "rpc body read failed");
                                let _ = err_tx.try_send(SourceError::Transport);
                                return;
                            }
                        },
                        Err(e) => {
                            warn!(source = name, err = %e, "rpc request failed");
                            let _ = err_tx.try_send(SourceError::Transport);
                            return;
                        }
                    };

                    let Some(header) = block_hash_of(&body) else {
                        warn!(source = name, "rpc reply missing block hash");
                        let _ = err_tx.try_send(SourceError::BadRequest);
                        return;
                    };

                    if header_previous.as_deref() != Some(header.as_str()) {
                        header_previous = Some(header);
                        if msg_tx.send(body.to_vec()).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    });

    Ok(Subscription {
        messages: msg_rx,
        errors: err_rx,
    })
}

fn block_hash_of(body: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    value
        .get("result")?
        .get("hash")?
        .as_str()
        .map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_names_are_unique_and_topics_nonempty() {
        for (i, a) in SOURCES.iter().enumerate() {
            assert!(!a.topics.is_empty(), "{} has no topics", a.name);
            for b in &SOURCES[i + 1..] {
                assert_ne!(a.name, b.name);
            }
        }
    }

    #[test]
    fn websocket_sources_carry_topic_placeholder() {
        for s in SOURCES.iter().filter(|s| s.kind == SourceKind::CexWebsocket) {
            assert!(
                s.request_template.contains("{{topic}}"),
                "{} template lacks placeholder",
                s.name
            );
        }
    }

    #[test]
    fn template_substitution_targets_first_placeholder() {
        let request = SOURCES[0].request_template.replacen("{{topic}}", "BTC-USD", 1);
        assert!(request.contains(r#""product_ids": [ "BTC-USD" ]"#));
        assert!(!request.contains("{{topic}}"));
    }

    #[test]
    fn block_hash_extraction() {
        let body = br#"{"jsonrpc":"2.0","id":1,"result":{"hash":"0xabc","number":"0x10"}}"#;
        assert_eq!(block_hash_of(body).as_deref(), Some("0xabc"));
        assert_eq!(block_hash_of(br#"{"result":null}"#), None);
        assert_eq!(block_hash_of(b"not json"), None);
    }
}
