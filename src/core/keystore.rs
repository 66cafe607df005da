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

//! Node keystore: file-backed Ed25519 signing and verification.
//!
//! The validator key lives at `data_dir/validator.key` as plaintext PKCS#8,
//! written atomically with 0600 permissions on first start.

use ring::{
    rand::SystemRandom,
    signature::{Ed25519KeyPair, KeyPair, UnparsedPublicKey, ED25519},
};
use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};
use thiserror::Error;
use zeroize::Zeroize;

/// Keystore errors.
#[derive(Debug, Error)]
pub enum KeystoreError {
    #[error("io")]
    Io,
    #[error("invalid key encoding")]
    InvalidKey,
    #[error("bad signature")]
    BadSignature,
}

fn set_private_perms_best_effort(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o600));
    }
}

/// Atomic write to disk (best-effort fsync, then rename).
fn atomic_write_private(path: &Path, bytes: &[u8]) -> Result<(), KeystoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|_| KeystoreError::Io)?;
    }

    let mut tmp = path.to_path_buf();
    tmp.set_extension("tmp");

    {
        let mut f = fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&tmp)
            .map_err(|_| KeystoreError::Io)?;
        f.write_all(bytes).map_err(|_| KeystoreError::Io)?;
        let _ = f.sync_all();
    }

    set_private_perms_best_effort(&tmp);
    fs::rename(&tmp, path).map_err(|_| KeystoreError::Io)?;
    set_private_perms_best_effort(path);
    Ok(())
}

/// File-backed Ed25519 keystore.
pub struct Keystore {
    keypair: Ed25519KeyPair,
}

impl Keystore {
    /// Load or create the key file at `data_dir/validator.key`.
    pub fn open(data_dir: &str) -> Result<Self, KeystoreError> {
        let mut key_path = PathBuf::from(data_dir);
        key_path.push("validator.key");
        Self::load_or_create(&key_path)
    }

    /// Load an existing PKCS#8 key file or generate and persist a new one.
    pub fn load_or_create(path: &Path) -> Result<Self, KeystoreError> {
        if path.exists() {
            let mut bytes = fs::read(path).map_err(|_| KeystoreError::Io)?;
            let kp = Ed25519KeyPair::from_pkcs8(&bytes).map_err(|_| KeystoreError::InvalidKey);
            bytes.zeroize();
            return Ok(Self { keypair: kp? });
        }

        let rng = SystemRandom::new();
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng).map_err(|_| KeystoreError::InvalidKey)?;
        atomic_write_private(path, pkcs8.as_ref())?;

        let kp = Ed25519KeyPair::from_pkcs8(pkcs8.as_ref()).map_err(|_| KeystoreError::InvalidKey)?;
        Ok(Self { keypair: kp })
    }

    /// Ed25519 public key bytes.
    pub fn public_key(&self) -> [u8; 32] {
        let pk = self.keypair.public_key().as_ref();
        let mut out = [0u8; 32];
        out.copy_from_slice(pk);
        out
    }

    /// Sign message bytes, returning the 64-byte signature.
    pub fn sign(&self, msg: &[u8]) -> [u8; 64] {
        let sig = self.keypair.sign(msg);
        let mut out = [0u8; 64];
        out.copy_from_slice(sig.as_ref());
        out
    }
}

/// Verify a signature given raw Ed25519 public key bytes.
pub fn verify_pubkey_bytes(
    pk_bytes: &[u8; 32],
    msg: &[u8],
    sig: &[u8],
) -> Result<(), KeystoreError> {
    // ring requires signature length 64 for Ed25519.
    if sig.len() != 64 {
        return Err(KeystoreError::BadSignature);
    }
    let pk = UnparsedPublicKey::new(&ED25519, pk_bytes);
    pk.verify(msg, sig).map_err(|_| KeystoreError::BadSignature)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_persists_across_open() {
        let dir = tempfile::tempdir().unwrap();
        let ks1 = Keystore::open(dir.path().to_str().unwrap()).unwrap();
        let ks2 = Keystore::open(dir.path().to_str().unwrap()).unwrap();
        assert_eq!(ks1.public_key(), ks2.public_key());
    }

    #[test]
    fn sign_verify_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let ks = Keystore::open(dir.path().to_str().unwrap()).unwrap();
        let sig = ks.sign(b"payload");
        assert!(verify_pubkey_bytes(&ks.public_key(), b"payload", &sig).is_ok());
        assert!(verify_pubkey_bytes(&ks.public_key(), b"tampered", &sig).is_err());
    }
}
