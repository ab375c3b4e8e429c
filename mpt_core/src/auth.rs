//! JOIN handshake authentication material.
//!
//! The SYN-ACK of a JOIN carries a 64-bit truncated MAC, the final ACK a
//! 160-bit one. Both are computed over the two connection keys and the two
//! handshake nonces, so only the endpoints of the original connection can
//! produce them.

use sha2::{Digest, Sha256};

use crate::types::token::Key;

fn join_digest(local_key: Key, remote_key: Key, local_nonce: u32, remote_nonce: u32) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(local_key.0.to_be_bytes());
    hasher.update(remote_key.0.to_be_bytes());
    hasher.update(local_nonce.to_be_bytes());
    hasher.update(remote_nonce.to_be_bytes());
    hasher.finalize().into()
}

/// The truncated MAC carried by a JOIN SYN-ACK.
pub fn join_mac64(local_key: Key, remote_key: Key, local_nonce: u32, remote_nonce: u32) -> u64 {
    let digest = join_digest(local_key, remote_key, local_nonce, remote_nonce);
    u64::from_be_bytes(digest[..8].try_into().unwrap())
}

/// The full-width MAC carried by the final JOIN ACK.
pub fn join_mac160(local_key: Key, remote_key: Key, local_nonce: u32, remote_nonce: u32) -> [u8; 20] {
    let digest = join_digest(local_key, remote_key, local_nonce, remote_nonce);
    digest[..20].try_into().unwrap()
}
