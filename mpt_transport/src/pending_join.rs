//! The pending-join table.
//!
//! A JOIN SYN carries the token, the completing ACK does not; half-open
//! JOINs are therefore indexed globally by the peer 4-tuple until the
//! handshake finishes. Every request is also listed in its connection's
//! own syn-table, and removal from either side is idempotent: the
//! completing-ACK path and a concurrent connection teardown may both try
//! to delete the same entry.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use tracing::debug;

use crate::mpcb::Mpcb;

/// The peer 4-tuple a pending JOIN is keyed by.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TupleKey {
    pub rem_addr: std::net::IpAddr,
    pub rem_port: u16,
    pub loc_addr: std::net::IpAddr,
    pub loc_port: u16,
}

impl TupleKey {
    pub fn new(local: SocketAddr, remote: SocketAddr) -> Self {
        Self {
            rem_addr: remote.ip(),
            rem_port: remote.port(),
            loc_addr: local.ip(),
            loc_port: local.port(),
        }
    }
}

/// One half-open JOIN.
#[derive(Debug)]
pub struct PendingJoin {
    pub key: TupleKey,
    pub mpcb: Weak<Mpcb>,
    /// Address id the peer used in its JOIN SYN.
    pub rem_id: u8,
    /// Our address id for the local endpoint of the new subflow.
    pub loc_id: u8,
    pub local_nonce: u32,
    pub remote_nonce: u32,
    pub deadline: Instant,
}

#[derive(Default)]
pub struct PendingJoinTable {
    inner: Mutex<HashMap<TupleKey, Arc<PendingJoin>>>,
}

impl PendingJoinTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, req: Arc<PendingJoin>) {
        let mut map = self.inner.lock().unwrap();
        map.insert(req.key.clone(), req);
    }

    /// Exact 4-tuple lookup.
    pub fn lookup(&self, key: &TupleKey) -> Option<Arc<PendingJoin>> {
        self.inner.lock().unwrap().get(key).cloned()
    }

    /// Removes by key; a no-op when the entry is already gone.
    pub fn remove(&self, key: &TupleKey) -> Option<Arc<PendingJoin>> {
        self.inner.lock().unwrap().remove(key)
    }

    /// Marker deletion: removes this exact request if it is still the one
    /// registered under its key. A different request under the same tuple
    /// (a re-issued JOIN) stays untouched.
    pub fn remove_entry(&self, req: &Arc<PendingJoin>) {
        let mut map = self.inner.lock().unwrap();
        if let Some(current) = map.get(&req.key) {
            if Arc::ptr_eq(current, req) {
                map.remove(&req.key);
            }
        }
    }

    /// Drops every request whose deadline passed, both globally and from
    /// its connection's syn-table. Returns the number of expired entries.
    pub fn remove_expired(&self, now: Instant) -> usize {
        let expired: Vec<Arc<PendingJoin>> = {
            let map = self.inner.lock().unwrap();
            map.values().filter(|r| r.deadline <= now).cloned().collect()
        };
        for req in &expired {
            debug!(?req.key, "pending join expired");
            self.remove_entry(req);
            if let Some(mpcb) = req.mpcb.upgrade() {
                mpcb.remove_pending_join(req);
            }
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }
}
