#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Persistent overlay identity.
//!
//! The node keeps one Ed25519 keypair for libp2p at `data_dir/p2p_identity.key`
//! so its peer id survives restarts.

use libp2p::{identity, PeerId};
use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};
use thiserror::Error;

/// Identity errors.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("io")]
    Io,
    #[error("decode")]
    Decode,
}

impl From<std::io::Error> for IdentityError {
    fn from(_: std::io::Error) -> Self {
        IdentityError::Io
    }
}

/// Load the keypair from disk, or create and persist a fresh one.
///
/// Returns `(PeerId, Keypair)`.
pub fn load_or_create_identity(
    data_dir: impl AsRef<Path>,
) -> Result<(PeerId, identity::Keypair), IdentityError> {
    let dir = data_dir.as_ref();
    fs::create_dir_all(dir)?;

    let path: PathBuf = dir.join("p2p_identity.key");

    if path.exists() {
        let bytes = fs::read(&path)?;
        let keypair =
            identity::Keypair::from_protobuf_encoding(&bytes).map_err(|_| IdentityError::Decode)?;
        let peer_id = PeerId::from(keypair.public());
        return Ok((peer_id, keypair));
    }

    let keypair = identity::Keypair::generate_ed25519();
    let bytes = keypair
        .to_protobuf_encoding()
        .map_err(|_| IdentityError::Decode)?;

    // Write to a tmp file then rename so a crash never leaves a torn key.
    let tmp = dir.join("p2p_identity.key.tmp");
    {
        let mut f = fs::File::create(&tmp)?;
        f.write_all(&bytes)?;
        f.sync_all()?;
    }
    fs::rename(&tmp, &path)?;

    let peer_id = PeerId::from(keypair.public());
    Ok((peer_id, keypair))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_stable_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let (first, _) = load_or_create_identity(dir.path()).unwrap();
        let (second, _) = load_or_create_identity(dir.path()).unwrap();
        assert_eq!(first, second);
    }
}
