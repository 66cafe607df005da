// Copyright (c) 2026 Openmesh Network
// Licensed under the Apache License, Version 2.0

// P2P overlay (libp2p): persistent identity, gossipsub topics, content fetch.
//
// The swarm lives on one task; the rest of the node talks to it through a
// command channel exposed as `P2pHandle`:
// - join_topic/publish/subscribe: gossipsub, own messages filtered out
// - fetch: request-response protocol for content-addressed blobs, the reply
//   is verified against the CID digest before it reaches the caller
// - mDNS discovery, bounded by the configured peer limit

use crate::config::P2pConfig;
use crate::monitoring::metrics::Metrics;
use cid::Cid;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use libp2p::{
    core::upgrade,
    gossipsub::{self, IdentTopic, MessageAuthenticity, TopicHash},
    identify, mdns,
    multiaddr::Protocol,
    noise, ping,
    request_response::{self, OutboundRequestId, ProtocolSupport},
    swarm::{Config as SwarmConfig, NetworkBehaviour, Swarm, SwarmEvent},
    tcp, yamux, Multiaddr, PeerId, StreamProtocol, Transport,
};

use libp2p::futures::StreamExt;

/// Protocol name of the content fetch exchange.
const FETCH_PROTOCOL: &str = "/openmesh/fetch/1.0.0";
/// Publish deadline.
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);
/// Per-subscriber delivery queue.
const SUBSCRIBER_CAPACITY: usize = 128;

/// Overlay errors.
#[derive(Debug, Error)]
pub enum P2pError {
    #[error("io")]
    Io,
    #[error("config")]
    Config,
    #[error(r#"topic "{0}" already exists on this instance"#)]
    AlreadyJoined(String),
    #[error(r#"topic "{0}" does not exist on this instance"#)]
    NotJoined(String),
    #[error("publish")]
    Publish,
    #[error("publish timed out")]
    Timeout,
    #[error("no peer to fetch from")]
    NoPeers,
    #[error("bad seeder address")]
    BadAddress,
    #[error("fetch failed")]
    Fetch,
    #[error("fetched bytes do not match cid")]
    DigestMismatch,
    #[error("overlay task gone")]
    Closed,
}

/// A gossip message as delivered to subscribers.
#[derive(Clone, Debug)]
pub struct TopicMessage {
    /// Raw payload.
    pub data: Vec<u8>,
    /// Peer that delivered the message. Never our own id.
    pub received_from: PeerId,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct FetchRequest {
    cid: Vec<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct FetchResponse {
    /// The blob, or `None` when the peer does not hold it.
    data: Option<Vec<u8>>,
}

enum Command {
    JoinTopic {
        name: String,
        reply: oneshot::Sender<Result<(), P2pError>>,
    },
    Publish {
        name: String,
        data: Vec<u8>,
        reply: oneshot::Sender<Result<(), P2pError>>,
    },
    Subscribe {
        name: String,
        reply: oneshot::Sender<Result<mpsc::Receiver<TopicMessage>, P2pError>>,
    },
    Fetch {
        cid: Cid,
        hint: Option<Multiaddr>,
        reply: oneshot::Sender<Result<Vec<u8>, P2pError>>,
    },
}

/// Handle to the overlay task. Cheap to clone.
#[derive(Clone)]
pub struct P2pHandle {
    commands: mpsc::Sender<Command>,
    local_peer_id: PeerId,
}

impl P2pHandle {
    /// Our own overlay identity.
    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    async fn round_trip<T>(
        &self,
        command: Command,
        reply: oneshot::Receiver<Result<T, P2pError>>,
    ) -> Result<T, P2pError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| P2pError::Closed)?;
        reply.await.map_err(|_| P2pError::Closed)?
    }

    /// Join a gossip topic. A second join of the same topic fails.
    pub async fn join_topic(&self, name: &str) -> Result<(), P2pError> {
        let (tx, rx) = oneshot::channel();
        self.round_trip(
            Command::JoinTopic {
                name: name.to_string(),
                reply: tx,
            },
            rx,
        )
        .await
    }

    /// Publish to a joined topic, bounded by a 5 s deadline.
    pub async fn publish(&self, name: &str, data: Vec<u8>) -> Result<(), P2pError> {
        let (tx, rx) = oneshot::channel();
        let fut = self.round_trip(
            Command::Publish {
                name: name.to_string(),
                data,
                reply: tx,
            },
            rx,
        );
        tokio::time::timeout(PUBLISH_TIMEOUT, fut)
            .await
            .map_err(|_| P2pError::Timeout)?
    }

    /// Subscribe to a joined topic. Messages we published ourselves are
    /// filtered out before delivery.
    pub async fn subscribe(&self, name: &str) -> Result<mpsc::Receiver<TopicMessage>, P2pError> {
        let (tx, rx) = oneshot::channel();
        self.round_trip(
            Command::Subscribe {
                name: name.to_string(),
                reply: tx,
            },
            rx,
        )
        .await
    }

    /// Content-addressed fetch. The hint, when given, is a `/p2p/` multiaddr
    /// of a known seeder; otherwise any connected peer is asked.
    pub async fn fetch(&self, cid: Cid, hint: Option<Multiaddr>) -> Result<Vec<u8>, P2pError> {
        let (tx, rx) = oneshot::channel();
        self.round_trip(Command::Fetch { cid, hint, reply: tx }, rx).await
    }
}

#[derive(Debug)]
enum BehaviourEvent {
    Gossipsub(gossipsub::Event),
    Identify(()),
    Ping(()),
    Mdns(mdns::Event),
    Fetch(request_response::Event<FetchRequest, FetchResponse>),
}
impl From<gossipsub::Event> for BehaviourEvent {
    fn from(e: gossipsub::Event) -> Self {
        Self::Gossipsub(e)
    }
}
impl From<identify::Event> for BehaviourEvent {
    fn from(_e: identify::Event) -> Self {
        Self::Identify(())
    }
}
impl From<ping::Event> for BehaviourEvent {
    fn from(_e: ping::Event) -> Self {
        Self::Ping(())
    }
}
impl From<mdns::Event> for BehaviourEvent {
    fn from(e: mdns::Event) -> Self {
        Self::Mdns(e)
    }
}
impl From<request_response::Event<FetchRequest, FetchResponse>> for BehaviourEvent {
    fn from(e: request_response::Event<FetchRequest, FetchResponse>) -> Self {
        Self::Fetch(e)
    }
}

#[derive(NetworkBehaviour)]
#[behaviour(to_swarm = "BehaviourEvent")]
struct Behaviour {
    gossipsub: gossipsub::Behaviour,
    identify: identify::Behaviour,
    ping: ping::Behaviour,
    mdns: mdns::tokio::Behaviour,
    fetch: request_response::cbor::Behaviour<FetchRequest, FetchResponse>,
}

struct TopicState {
    topic: IdentTopic,
    subscribers: Vec<mpsc::Sender<TopicMessage>>,
}

fn peer_id_from_multiaddr(addr: &Multiaddr) -> Option<PeerId> {
    addr.iter().find_map(|p| match p {
        Protocol::P2p(peer_id) => Some(peer_id),
        _ => None,
    })
}

/// Spawn the overlay task.
pub fn spawn_p2p(
    cfg: &P2pConfig,
    data_dir: &str,
    cancel: CancellationToken,
    metrics: Arc<Metrics>,
) -> Result<(P2pHandle, tokio::task::JoinHandle<()>), P2pError> {
    let (local_peer_id, id_keys) =
        crate::networking::p2p_identity::load_or_create_identity(data_dir)
            .map_err(|_| P2pError::Io)?;

    let listen_addr = format!("/ip4/{}/tcp/{}", cfg.addr, cfg.port);
    let bootstrap = cfg.bootstrap.clone();
    let peer_limit = cfg.peer_limit;
    let group_name = cfg.group_name.clone();

    let (cmd_tx, mut cmd_rx) = mpsc::channel::<Command>(64);

    let join = tokio::spawn(async move {
        // --- Transport (TCP + Noise + Yamux) ---
        let noise_keys = match noise::Config::new(&id_keys) {
            Ok(v) => v,
            Err(_) => {
                warn!("failed to build noise config");
                return;
            }
        };

        let transport = tcp::tokio::Transport::new(tcp::Config::default().nodelay(true))
            .upgrade(upgrade::Version::V1)
            .authenticate(noise_keys)
            .multiplex(yamux::Config::default())
            .boxed();

        // --- Gossipsub ---
        let gcfg = gossipsub::ConfigBuilder::default()
            .validation_mode(gossipsub::ValidationMode::Permissive)
            .heartbeat_interval(Duration::from_secs(1))
            .build()
            .unwrap_or_else(|_| gossipsub::Config::default());

        let gossipsub = match gossipsub::Behaviour::new(
            MessageAuthenticity::Signed(id_keys.clone()),
            gcfg,
        ) {
            Ok(v) => v,
            Err(_) => {
                warn!("failed to create gossipsub behaviour");
                return;
            }
        };

        let identify = identify::Behaviour::new(identify::Config::new(
            "openmesh-core/1.0.0".to_string(),
            id_keys.public(),
        ));

        let ping = ping::Behaviour::new(
            ping::Config::new()
                .with_interval(Duration::from_secs(10))
                .with_timeout(Duration::from_secs(20)),
        );

        let mdns = match mdns::tokio::Behaviour::new(mdns::Config::default(), local_peer_id) {
            Ok(v) => v,
            Err(_) => {
                warn!("failed to create mdns behaviour");
                return;
            }
        };

        let fetch = request_response::cbor::Behaviour::new(
            [(StreamProtocol::new(FETCH_PROTOCOL), ProtocolSupport::Full)],
            request_response::Config::default(),
        );

        let behaviour = Behaviour {
            gossipsub,
            identify,
            ping,
            mdns,
            fetch,
        };

        let mut swarm = Swarm::new(
            transport,
            behaviour,
            local_peer_id,
            SwarmConfig::with_tokio_executor(),
        );

        let listen: Multiaddr = match listen_addr.parse() {
            Ok(v) => v,
            Err(_) => {
                warn!(addr = %listen_addr, "bad listen address");
                return;
            }
        };
        if let Err(e) = swarm.listen_on(listen) {
            warn!(err = ?e, "listen_on failed");
            return;
        }

        for b in bootstrap.iter().map(|x| x.trim()).filter(|x| !x.is_empty()) {
            match b.parse::<Multiaddr>() {
                Ok(ma) => {
                    if let Err(e) = swarm.dial(ma) {
                        warn!(boot = %b, err = ?e, "dial bootstrap failed");
                    } else {
                        info!(boot = %b, "dialing bootstrap");
                    }
                }
                Err(_) => warn!(boot = %b, "bad bootstrap addr, skipping"),
            }
        }

        info!(%local_peer_id, group = %group_name, "p2p loop started");
        metrics.p2p_peers.set(0);

        let mut topics: HashMap<String, TopicState> = HashMap::new();
        let mut names_by_hash: HashMap<TopicHash, String> = HashMap::new();
        let mut pending_fetch: HashMap<
            OutboundRequestId,
            (Cid, oneshot::Sender<Result<Vec<u8>, P2pError>>),
        > = HashMap::new();
        let mut connected: usize = 0;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("p2p loop stopping");
                    return;
                }

                maybe_cmd = cmd_rx.recv() => {
                    let Some(cmd) = maybe_cmd else {
                        warn!("command channel closed, stopping p2p task");
                        return;
                    };
                    handle_command(cmd, &mut swarm, &mut topics, &mut names_by_hash, &mut pending_fetch);
                }

                ev = swarm.select_next_some() => {
                    match ev {
                        SwarmEvent::NewListenAddr { address, .. } => {
                            info!(addr = %address, "listening");
                        }

                        SwarmEvent::ConnectionEstablished { peer_id, .. } => {
                            connected += 1;
                            metrics.p2p_peers.inc();
                            info!(%peer_id, "peer connected");
                        }

                        SwarmEvent::ConnectionClosed { peer_id, .. } => {
                            connected = connected.saturating_sub(1);
                            metrics.p2p_peers.dec();
                            info!(%peer_id, "peer disconnected");
                        }

                        SwarmEvent::Behaviour(BehaviourEvent::Gossipsub(gossipsub::Event::Message { propagation_source, message, .. })) => {
                            // Only consider messages delivered by other peers.
                            if propagation_source == local_peer_id {
                                continue;
                            }
                            let Some(name) = names_by_hash.get(&message.topic) else {
                                debug!(topic = %message.topic, "message on unjoined topic");
                                continue;
                            };
                            if let Some(state) = topics.get_mut(name) {
                                let delivery = TopicMessage {
                                    data: message.data.clone(),
                                    received_from: propagation_source,
                                };
                                state.subscribers.retain(|tx| tx.try_send(delivery.clone()).is_ok());
                            }
                        }

                        SwarmEvent::Behaviour(BehaviourEvent::Mdns(mdns::Event::Discovered(peers))) => {
                            for (peer_id, addr) in peers {
                                // Don't connect to new peers past the limit.
                                if connected >= peer_limit {
                                    debug!(%peer_id, limit = peer_limit, "peer limit reached, ignoring discovered peer");
                                    continue;
                                }
                                if let Err(e) = swarm.dial(addr.clone()) {
                                    debug!(%peer_id, err = ?e, "dial discovered peer failed");
                                }
                            }
                        }
                        SwarmEvent::Behaviour(BehaviourEvent::Mdns(mdns::Event::Expired(_))) => {}

                        SwarmEvent::Behaviour(BehaviourEvent::Fetch(event)) => {
                            handle_fetch_event(event, &mut swarm, &mut pending_fetch);
                        }

                        SwarmEvent::Behaviour(BehaviourEvent::Identify(_)) => {}
                        SwarmEvent::Behaviour(BehaviourEvent::Ping(_)) => {}

                        _ => {}
                    }
                }
            }
        }
    });

    Ok((
        P2pHandle {
            commands: cmd_tx,
            local_peer_id,
        },
        join,
    ))
}

fn handle_command(
    cmd: Command,
    swarm: &mut Swarm<Behaviour>,
    topics: &mut HashMap<String, TopicState>,
    names_by_hash: &mut HashMap<TopicHash, String>,
    pending_fetch: &mut HashMap<OutboundRequestId, (Cid, oneshot::Sender<Result<Vec<u8>, P2pError>>)>,
) {
    match cmd {
        Command::JoinTopic { name, reply } => {
            if topics.contains_key(&name) {
                let _ = reply.send(Err(P2pError::AlreadyJoined(name)));
                return;
            }
            let topic = IdentTopic::new(name.clone());
            match swarm.behaviour_mut().gossipsub.subscribe(&topic) {
                Ok(_) => {
                    names_by_hash.insert(topic.hash(), name.clone());
                    topics.insert(
                        name,
                        TopicState {
                            topic,
                            subscribers: Vec::new(),
                        },
                    );
                    let _ = reply.send(Ok(()));
                }
                Err(e) => {
                    warn!(err = ?e, "topic subscribe failed");
                    let _ = reply.send(Err(P2pError::Config));
                }
            }
        }

        Command::Publish { name, data, reply } => {
            let Some(state) = topics.get(&name) else {
                let _ = reply.send(Err(P2pError::NotJoined(name)));
                return;
            };
            let result = swarm
                .behaviour_mut()
                .gossipsub
                .publish(state.topic.clone(), data)
                .map(|_| ())
                .map_err(|e| {
                    warn!(topic = %name, err = ?e, "gossipsub publish failed");
                    P2pError::Publish
                });
            let _ = reply.send(result);
        }

        Command::Subscribe { name, reply } => {
            let Some(state) = topics.get_mut(&name) else {
                let _ = reply.send(Err(P2pError::NotJoined(name)));
                return;
            };
            let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
            state.subscribers.push(tx);
            let _ = reply.send(Ok(rx));
        }

        Command::Fetch { cid, hint, reply } => {
            let peer = match &hint {
                Some(addr) => {
                    let Some(peer) = peer_id_from_multiaddr(addr) else {
                        let _ = reply.send(Err(P2pError::BadAddress));
                        return;
                    };
                    // Already-connected dials fail the dial condition; the
                    // request below still goes through.
                    if let Err(e) = swarm.dial(addr.clone()) {
                        debug!(addr = %addr, err = ?e, "seeder dial");
                    }
                    peer
                }
                None => match swarm.connected_peers().next().cloned() {
                    Some(peer) => peer,
                    None => {
                        let _ = reply.send(Err(P2pError::NoPeers));
                        return;
                    }
                },
            };

            let request_id = swarm.behaviour_mut().fetch.send_request(
                &peer,
                FetchRequest {
                    cid: cid.to_bytes(),
                },
            );
            pending_fetch.insert(request_id, (cid, reply));
        }
    }
}

fn handle_fetch_event(
    event: request_response::Event<FetchRequest, FetchResponse>,
    swarm: &mut Swarm<Behaviour>,
    pending_fetch: &mut HashMap<OutboundRequestId, (Cid, oneshot::Sender<Result<Vec<u8>, P2pError>>)>,
) {
    match event {
        request_response::Event::Message { peer, message } => match message {
            request_response::Message::Request { channel, request, .. } => {
                // This node keeps no blob store; answer negatively so the
                // requester can try another seeder.
                debug!(%peer, cid = %hex::encode(&request.cid), "fetch request, nothing to serve");
                let _ = swarm
                    .behaviour_mut()
                    .fetch
                    .send_response(channel, FetchResponse { data: None });
            }
            request_response::Message::Response { request_id, response } => {
                let Some((cid, reply)) = pending_fetch.remove(&request_id) else {
                    return;
                };
                let _ = reply.send(verify_fetched(&cid, response));
            }
        },
        request_response::Event::OutboundFailure { request_id, error, .. } => {
            if let Some((cid, reply)) = pending_fetch.remove(&request_id) {
                warn!(%cid, err = ?error, "fetch failed");
                let _ = reply.send(Err(P2pError::Fetch));
            }
        }
        request_response::Event::InboundFailure { .. } => {}
        request_response::Event::ResponseSent { .. } => {}
    }
}

/// Check that the returned bytes hash to the requested CID before handing
/// them to the caller.
fn verify_fetched(cid: &Cid, response: FetchResponse) -> Result<Vec<u8>, P2pError> {
    let Some(data) = response.data else {
        return Err(P2pError::Fetch);
    };
    let digest = ring::digest::digest(&ring::digest::SHA256, &data);
    if cid.hash().digest() != digest.as_ref() {
        return Err(P2pError::DigestMismatch);
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::content_id;

    #[test]
    fn fetched_bytes_must_match_the_cid() {
        let cid = content_id(b"release");
        let ok = verify_fetched(
            &cid,
            FetchResponse {
                data: Some(b"release".to_vec()),
            },
        );
        assert_eq!(ok.unwrap(), b"release".to_vec());

        let tampered = verify_fetched(
            &cid,
            FetchResponse {
                data: Some(b"malware".to_vec()),
            },
        );
        assert!(matches!(tampered, Err(P2pError::DigestMismatch)));

        let missing = verify_fetched(&cid, FetchResponse { data: None });
        assert!(matches!(missing, Err(P2pError::Fetch)));
    }

    #[test]
    fn peer_id_extraction_from_multiaddr() {
        let peer: PeerId = "12D3KooWPYkNZrwQo5yESaXbBQ64f3GyFaUPFynPUoE7PfJ4xL4u"
            .parse()
            .unwrap();
        let addr: Multiaddr = format!("/ip4/10.0.17.23/tcp/4001/p2p/{peer}").parse().unwrap();
        assert_eq!(peer_id_from_multiaddr(&addr), Some(peer));

        let bare: Multiaddr = "/ip4/10.0.17.23/tcp/4001".parse().unwrap();
        assert_eq!(peer_id_from_multiaddr(&bare), None);
    }
}
