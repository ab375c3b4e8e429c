//! Per-connection address inventories.
//!
//! Each MPCB keeps two inventories: the local addresses it may open
//! subflows from, and the remote addresses the peer advertised. Entries
//! carry stable 8-bit ids; id 0 is the implicit ULID of the master pair and
//! is never stored.

use std::net::IpAddr;

use tracing::{debug, warn};

use mpt_core::AddressEntry;

/// Fixed cap on either inventory.
pub const MPTCP_MAX_ADDR: usize = 12;

/// Outcome of feeding one advertised address into the inventory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// Stored as a new entry; the path table needs a rebuild.
    Added,
    /// Exact (addr, port) already present.
    Known,
    /// The id was present with a different address: the peer sits behind a
    /// NAT and the address as we observe it is authoritative, so the entry
    /// was overwritten in place. Path table needs a rebuild.
    Updated,
    /// The id was 0 (the peer's ULID), never stored.
    Ulid,
    /// Inventory full; the address was dropped.
    Full,
}

impl AddOutcome {
    /// True when the path table has to be recomputed.
    pub fn changed(&self) -> bool {
        matches!(self, AddOutcome::Added | AddOutcome::Updated)
    }
}

#[derive(Debug, Default)]
pub struct AddressSet {
    entries: Vec<AddressEntry>,
    /// Number of entries not yet advertised to the peer.
    unsent: usize,
}

impl AddressSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AddressEntry> {
        self.entries.iter()
    }

    pub fn by_id(&self, id: u8) -> Option<&AddressEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    /// The id of the entry matching `addr`, if any. The master's own local
    /// address is not in the set; its id is the implicit 0.
    pub fn id_of(&self, addr: IpAddr) -> Option<u8> {
        self.entries.iter().find(|e| e.addr == addr).map(|e| e.id)
    }

    pub fn contains_addr(&self, addr: IpAddr) -> bool {
        self.entries.iter().any(|e| e.addr == addr)
    }

    /// Feeds one address learned from the peer (ADD_ADDR, or the source of
    /// a JOIN SYN) into the inventory.
    pub fn add_received(&mut self, addr: IpAddr, port: u16, id: u8) -> AddOutcome {
        if id == 0 {
            return AddOutcome::Ulid;
        }

        if self.entries.iter().any(|e| e.addr == addr && e.port == port) {
            return AddOutcome::Known;
        }

        if let Some(entry) = self.entries.iter_mut().find(|e| e.id == id) {
            debug!(old = %entry.addr, new = %addr, id, "updating NATed address");
            entry.addr = addr;
            entry.port = port;
            return AddOutcome::Updated;
        }

        if self.entries.len() == MPTCP_MAX_ADDR {
            warn!(%addr, id, "address inventory full, dropping");
            return AddOutcome::Full;
        }

        self.entries.push(AddressEntry::new(id, addr, port));
        AddOutcome::Added
    }

    /// Replaces the whole inventory with the result of a local interface
    /// scan. The new set is built aside and swapped in at the end, so a
    /// concurrent advertise pass never observes a half-filled scan.
    pub fn commit_scan(&mut self, addrs: impl IntoIterator<Item = IpAddr>) {
        let mut next_id = 1u8;
        let mut fresh = Vec::new();
        for addr in addrs {
            if fresh.len() == MPTCP_MAX_ADDR {
                debug!("at max number of local addresses, truncating scan");
                break;
            }
            fresh.push(AddressEntry::new(next_id, addr, 0));
            next_id += 1;
        }
        self.unsent = fresh.len();
        self.entries = fresh;
    }

    /// Appends one newly-arrived local address (interface UP mid-life).
    pub fn append_local(&mut self, addr: IpAddr) -> AddOutcome {
        if self.entries.len() == MPTCP_MAX_ADDR {
            warn!(%addr, "address inventory full, dropping new local address");
            return AddOutcome::Full;
        }
        let id = self.entries.iter().map(|e| e.id).max().unwrap_or(0) + 1;
        self.entries.push(AddressEntry::new(id, addr, 0));
        self.unsent += 1;
        AddOutcome::Added
    }

    /// Entries not yet advertised; calling this marks them sent.
    pub fn take_unsent(&mut self) -> Vec<AddressEntry> {
        if self.unsent == 0 {
            return Vec::new();
        }
        let start = self.entries.len() - self.unsent;
        self.unsent = 0;
        self.entries[start..].to_vec()
    }

    pub fn has_unsent(&self) -> bool {
        self.unsent > 0
    }
}
