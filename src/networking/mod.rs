#![forbid(unsafe_code)]
#![allow(missing_docs)]

//! Networking: libp2p overlay and persistent identity.

pub mod p2p;
pub mod p2p_identity;
