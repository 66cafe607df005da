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

//! Signed auto-update engine.
//!
//! Release announcements arrive on the gossip topic [`UPDATE_TOPIC`] as
//! canonically encoded [`UpdateRequest`] messages. Per trusted key only the
//! highest-nonce verified request is retained; once two thirds of the keys
//! back the same binary CID, the binary is fetched over the overlay, written
//! to disk and spawned, and the process hands off.

use crate::core::keystore::verify_pubkey_bytes;
use crate::core::types::decode_canonical_limited;
use crate::monitoring::metrics::Metrics;
use crate::networking::p2p::{P2pError, P2pHandle};
use cid::Cid;
use libp2p::Multiaddr;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Gossip topic carrying release announcements.
pub const UPDATE_TOPIC: &str = "openmesh-core-update";
/// Hard cap on an encoded update request.
const UPDATE_REQUEST_MAX_BYTES: usize = 4096;
/// On-disk name of the fetched binary.
const UPDATE_BINARY_PATH: &str = "executable-file";
/// Argument handed to the spawned binary.
const HANDOFF_ARG: &str = "wazzup";

/// Ed25519 public key authorized to co-sign releases.
pub type PublicKey = [u8; 32];

/// Updater errors.
#[derive(Debug, Error)]
pub enum UpdaterError {
    #[error("overlay")]
    Overlay(#[from] P2pError),
    #[error("invalid key encoding")]
    BadKey,
    #[error("subscription closed")]
    SubscriptionClosed,
}

/// Outcome of the subscription loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdaterOutcome {
    /// Cancelled by shutdown; no update happened.
    Cancelled,
    /// A new binary was spawned; the caller should exit with code 0.
    Handoff,
}

/// Signed release announcement payload. Nonce 0 is reserved as "absent".
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateRequestContent {
    /// Strictly increasing per signing key.
    pub nonce: i64,
    /// Raw CID bytes of the release binary.
    pub binary_cid: Vec<u8>,
}

/// A release announcement as carried on the wire.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateRequest {
    /// Signing key; must be one of the trusted keys.
    pub public_key: PublicKey,
    /// Ed25519 signature (64 bytes) over [`hash_request_content`].
    pub signature: Vec<u8>,
    /// The signed payload.
    pub content: UpdateRequestContent,
}

/// Published signature layout for [`UpdateRequestContent`]: the nonce as 8
/// little-endian bytes, the CID length as 8 little-endian bytes, then the
/// raw CID bytes. All implementations must agree on it byte for byte.
pub fn content_signing_bytes(content: &UpdateRequestContent) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + content.binary_cid.len());
    out.extend_from_slice(&content.nonce.to_le_bytes());
    out.extend_from_slice(&(content.binary_cid.len() as u64).to_le_bytes());
    out.extend_from_slice(&content.binary_cid);
    out
}

/// SHA-256 over the canonical content layout; this is what gets signed.
pub fn hash_request_content(content: &UpdateRequestContent) -> [u8; 32] {
    let digest = ring::digest::digest(&ring::digest::SHA256, &content_signing_bytes(content));
    let mut out = [0u8; 32];
    out.copy_from_slice(digest.as_ref());
    out
}

/// Decode an un-padded base64 trusted-key literal.
pub fn public_key_from_base64(encoded: &str) -> Result<PublicKey, UpdaterError> {
    use base64::Engine;
    let bytes = base64::engine::general_purpose::STANDARD_NO_PAD
        .decode(encoded)
        .map_err(|_| UpdaterError::BadKey)?;
    if bytes.len() != 32 {
        return Err(UpdaterError::BadKey);
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}

/// Holds the latest verified request per trusted key and decides updates.
pub struct UpdaterInstance {
    trusted_keys: Vec<PublicKey>,
    /// Indexed by trusted-key position; nonce 0 everywhere initially.
    /// Nonces are monotonically non-decreasing over the process lifetime.
    latest: Vec<UpdateRequest>,
}

impl UpdaterInstance {
    /// Create an instance for the given trusted-key list.
    pub fn new(trusted_keys: Vec<PublicKey>) -> Self {
        let latest = vec![UpdateRequest::default(); trusted_keys.len()];
        Self {
            trusted_keys,
            latest,
        }
    }

    /// Verify one announcement and, if it is fresh, retain it.
    ///
    /// Returns false for unknown keys, bad signatures and replays; in those
    /// cases the retained state does not advance.
    pub fn verify_request(&mut self, req: &UpdateRequest) -> bool {
        let mut trusted_index = None;
        for (i, key) in self.trusted_keys.iter().enumerate() {
            if bool::from(key[..].ct_eq(&req.public_key[..])) {
                trusted_index = Some(i);
                break;
            }
        }
        let Some(index) = trusted_index else {
            debug!("update request from unknown key");
            return false;
        };

        let digest = hash_request_content(&req.content);
        if verify_pubkey_bytes(&req.public_key, &digest, &req.signature).is_err() {
            warn!(key = index, "trusted key with incorrect signature");
            return false;
        }

        if self.latest[index].content.nonce >= req.content.nonce {
            debug!(
                key = index,
                held = self.latest[index].content.nonce,
                received = req.content.nonce,
                "outdated update request"
            );
            return false;
        }

        self.latest[index] = req.clone();
        true
    }

    /// Snapshot of the retained requests for read-only observers.
    pub fn snapshot(&self) -> Vec<UpdateRequest> {
        self.latest.clone()
    }

    /// Tally the retained CIDs and return the winner once two thirds of the
    /// trusted keys back it. Entries with nonce 0 or an unparseable CID are
    /// excluded before the tally; ties break toward the first CID seen.
    pub fn winning_cid(&self) -> Option<Cid> {
        let mut tallies: Vec<(&[u8], usize)> = Vec::new();
        for req in &self.latest {
            if req.content.nonce <= 0 {
                continue;
            }
            if Cid::try_from(req.content.binary_cid.as_slice()).is_err() {
                continue;
            }
            match tallies
                .iter_mut()
                .find(|(cid, _)| *cid == req.content.binary_cid.as_slice())
            {
                Some((_, n)) => *n += 1,
                None => tallies.push((req.content.binary_cid.as_slice(), 1)),
            }
        }

        let mut winner: Option<(&[u8], usize)> = None;
        for (cid, tally) in tallies {
            match winner {
                Some((_, best)) if tally <= best => {}
                _ => winner = Some((cid, tally)),
            }
        }
        let (cid_bytes, highest_tally) = winner?;

        // Two-thirds supermajority: 3 * tally >= 2 * |trusted keys|.
        if 3 * highest_tally < 2 * self.trusted_keys.len() {
            debug!(highest_tally, "no CID holds a supermajority of keys");
            return None;
        }

        Cid::try_from(cid_bytes).ok()
    }

    /// If a CID holds a supermajority, fetch it, write it to disk and spawn
    /// it. Returns true when a handoff happened; any failure along the way
    /// leaves the current version running.
    pub async fn update_if_appropriate(
        &self,
        p2p: &P2pHandle,
        seeder: Option<&Multiaddr>,
    ) -> bool {
        let Some(cid) = self.winning_cid() else {
            return false;
        };

        info!(%cid, "release reached consensus, downloading");
        let binary = match p2p.fetch(cid, seeder.cloned()).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(%cid, err = %e, "binary fetch failed, staying on current version");
                return false;
            }
        };

        if let Err(e) = write_executable(UPDATE_BINARY_PATH, &binary) {
            warn!(err = %e, "could not write release binary");
            return false;
        }

        match spawn_handoff(UPDATE_BINARY_PATH) {
            Ok(()) => true,
            Err(e) => {
                warn!(err = %e, "error launching new process");
                false
            }
        }
    }

    /// Consume the update topic until cancelled or a handoff succeeds.
    pub async fn run(
        mut self,
        cancel: CancellationToken,
        p2p: P2pHandle,
        seeder: Option<Multiaddr>,
        metrics: Arc<Metrics>,
    ) -> Result<UpdaterOutcome, UpdaterError> {
        p2p.join_topic(UPDATE_TOPIC).await?;
        let mut subscription = p2p.subscribe(UPDATE_TOPIC).await?;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(UpdaterOutcome::Cancelled),
                message = subscription.recv() => {
                    let Some(message) = message else {
                        return Err(UpdaterError::SubscriptionClosed);
                    };

                    match decode_canonical_limited::<UpdateRequest>(
                        &message.data,
                        UPDATE_REQUEST_MAX_BYTES,
                    ) {
                        Ok(request) => {
                            if self.verify_request(&request) {
                                metrics.update_requests_verified_total.inc();
                            } else {
                                metrics.update_requests_rejected_total.inc();
                            }
                        }
                        Err(_) => {
                            debug!("undecodable update request");
                            metrics.update_requests_rejected_total.inc();
                        }
                    }

                    // Threshold state may already be satisfied from earlier
                    // messages, so evaluate on every arrival.
                    if self.update_if_appropriate(&p2p, seeder.as_ref()).await {
                        info!("spawned child process, updater is finished");
                        return Ok(UpdaterOutcome::Handoff);
                    }
                }
            }
        }
    }
}

fn write_executable(path: &str, bytes: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, bytes)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o777))?;
    }
    Ok(())
}

fn spawn_handoff(path: &str) -> std::io::Result<()> {
    let mut command = std::process::Command::new(format!("./{path}"));
    command.arg(HANDOFF_ARG);
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.arg0(path);
    }
    command.spawn()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::content_id;
    use ring::signature::{Ed25519KeyPair, KeyPair};

    fn keypair() -> Ed25519KeyPair {
        let rng = ring::rand::SystemRandom::new();
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng).unwrap();
        Ed25519KeyPair::from_pkcs8(pkcs8.as_ref()).unwrap()
    }

    fn public_key_of(kp: &Ed25519KeyPair) -> PublicKey {
        let mut out = [0u8; 32];
        out.copy_from_slice(kp.public_key().as_ref());
        out
    }

    fn signed_request(kp: &Ed25519KeyPair, nonce: i64, binary_cid: Vec<u8>) -> UpdateRequest {
        let content = UpdateRequestContent { nonce, binary_cid };
        let signature = kp.sign(&hash_request_content(&content)).as_ref().to_vec();
        UpdateRequest {
            public_key: public_key_of(kp),
            signature,
            content,
        }
    }

    fn release_cid() -> Vec<u8> {
        content_id(b"release binary").to_bytes()
    }

    #[test]
    fn signing_bytes_layout_is_published() {
        let content = UpdateRequestContent {
            nonce: 1,
            binary_cid: vec![0xaa, 0xbb],
        };
        assert_eq!(
            content_signing_bytes(&content),
            vec![
                1, 0, 0, 0, 0, 0, 0, 0, // nonce LE
                2, 0, 0, 0, 0, 0, 0, 0, // cid length LE
                0xaa, 0xbb,
            ]
        );
    }

    #[test]
    fn verify_twice_accepts_then_rejects_replay() {
        let kp = keypair();
        let mut updater = UpdaterInstance::new(vec![public_key_of(&kp)]);
        let req = signed_request(&kp, 1, release_cid());

        assert!(updater.verify_request(&req));
        assert!(!updater.verify_request(&req));
        assert_eq!(updater.latest[0].content.nonce, 1);
    }

    #[test]
    fn unknown_key_is_rejected() {
        let kp = keypair();
        let stranger = keypair();
        let mut updater = UpdaterInstance::new(vec![public_key_of(&kp)]);
        assert!(!updater.verify_request(&signed_request(&stranger, 1, release_cid())));
    }

    #[test]
    fn tampered_signature_is_rejected() {
        let kp = keypair();
        let mut updater = UpdaterInstance::new(vec![public_key_of(&kp)]);
        let mut req = signed_request(&kp, 1, release_cid());
        req.content.nonce = 2;
        assert!(!updater.verify_request(&req));
        assert_eq!(updater.latest[0].content.nonce, 0);
    }

    #[test]
    fn nonces_never_go_backwards() {
        let kp = keypair();
        let mut updater = UpdaterInstance::new(vec![public_key_of(&kp)]);
        assert!(updater.verify_request(&signed_request(&kp, 5, release_cid())));
        assert!(!updater.verify_request(&signed_request(&kp, 3, release_cid())));
        assert_eq!(updater.latest[0].content.nonce, 5);
    }

    #[test]
    fn single_trusted_key_reaches_threshold() {
        let kp = keypair();
        let mut updater = UpdaterInstance::new(vec![public_key_of(&kp)]);
        assert!(updater.verify_request(&signed_request(&kp, 1, release_cid())));
        assert_eq!(updater.winning_cid(), Cid::try_from(release_cid().as_slice()).ok());
    }

    #[test]
    fn minority_signers_do_not_trigger_updates() {
        let signer = keypair();
        let mut keys = vec![public_key_of(&signer)];
        keys.extend((0..4).map(|_| public_key_of(&keypair())));
        let mut updater = UpdaterInstance::new(keys);

        assert!(updater.verify_request(&signed_request(&signer, 1, release_cid())));
        assert_eq!(updater.winning_cid(), None);
    }

    #[test]
    fn four_of_six_keys_is_a_supermajority() {
        let signers: Vec<Ed25519KeyPair> = (0..6).map(|_| keypair()).collect();
        let keys: Vec<PublicKey> = signers.iter().map(public_key_of).collect();
        let mut updater = UpdaterInstance::new(keys);

        for kp in &signers[..4] {
            assert!(updater.verify_request(&signed_request(kp, 1, release_cid())));
        }
        assert_eq!(updater.winning_cid(), Cid::try_from(release_cid().as_slice()).ok());
    }

    #[test]
    fn valid_signature_with_invalid_cid_is_discarded() {
        let kp = keypair();
        let mut updater = UpdaterInstance::new(vec![public_key_of(&kp)]);
        assert!(updater.verify_request(&signed_request(&kp, 1, b"not a cid".to_vec())));
        assert_eq!(updater.winning_cid(), None);
    }

    #[test]
    fn base64_trusted_key_literals_decode() {
        let kp = keypair();
        use base64::Engine;
        let encoded =
            base64::engine::general_purpose::STANDARD_NO_PAD.encode(public_key_of(&kp));
        assert_eq!(public_key_from_base64(&encoded).unwrap(), public_key_of(&kp));
        assert!(public_key_from_base64("too-short").is_err());
    }
}
