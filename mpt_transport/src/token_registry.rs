//! Process-wide token registry.
//!
//! Maps a 32-bit connection token to its control block so that a JOIN SYN
//! can find the connection it extends. Token allocation is monotonically
//! increasing; the only contract is process-wide uniqueness at any point
//! in time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

use tracing::debug;

use mpt_core::Token;

use crate::mpcb::Mpcb;
use crate::pending_join::PendingJoinTable;
use crate::{MptcpError, Result};

#[derive(Default)]
pub struct TokenRegistry {
    inner: RwLock<HashMap<u32, Arc<Mpcb>>>,
    next_token: AtomicU32,
}

impl TokenRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a fresh, non-zero token.
    pub fn allocate(&self) -> Token {
        loop {
            let raw = self.next_token.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if raw != 0 && !self.inner.read().unwrap().contains_key(&raw) {
                return Token(raw);
            }
        }
    }

    pub fn insert(&self, mpcb: Arc<Mpcb>) -> Result<()> {
        let token = mpcb.local_token;
        let mut map = self.inner.write().unwrap();
        if map.contains_key(&token.0) {
            return Err(MptcpError::TokenCollision(token));
        }
        debug!(%token, "mpcb added to token registry");
        map.insert(token.0, mpcb);
        Ok(())
    }

    /// Looks a connection up by token. The returned `Arc` is the reference
    /// that keeps the control block alive across the lookup.
    pub fn find(&self, token: Token) -> Option<Arc<Mpcb>> {
        self.inner.read().unwrap().get(&token.0).cloned()
    }

    /// Removes a connection, and with it every pending JOIN of that
    /// connection from the global table. The pending-join removal is a
    /// marker deletion: a concurrently completing JOIN may have removed
    /// the same entry already, and either order is fine.
    pub fn remove(&self, mpcb: &Mpcb, pending: &PendingJoinTable) {
        let removed = self.inner.write().unwrap().remove(&mpcb.local_token.0);
        if removed.is_some() {
            debug!(token = %mpcb.local_token, "mpcb removed from token registry");
        }
        for req in mpcb.pending_joins() {
            pending.remove_entry(&req);
            mpcb.remove_pending_join(&req);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().unwrap().is_empty()
    }

    /// Visits every registered connection, e.g. to fan an interface event
    /// out.
    pub fn for_each(&self, mut f: impl FnMut(&Arc<Mpcb>)) {
        for mpcb in self.inner.read().unwrap().values() {
            f(mpcb);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MptcpConfig;
    use crate::test_support::FakeIo;
    use mpt_core::Key;

    fn mpcb_with_token(token: Token) -> Arc<Mpcb> {
        let io = FakeIo::new("10.0.0.1:40000", "192.0.2.1:80");
        Mpcb::new(MptcpConfig::default(), token, Key::new(token, 1), false, io, 0)
    }

    #[test]
    fn test_allocate_monotonic_nonzero() {
        let reg = TokenRegistry::new();
        let a = reg.allocate();
        let b = reg.allocate();
        assert!(a.is_valid());
        assert!(b.is_valid());
        assert!(b.0 > a.0);
    }

    #[test]
    fn test_insert_find_remove() {
        let reg = TokenRegistry::new();
        let pending = PendingJoinTable::new();
        let token = reg.allocate();
        let mpcb = mpcb_with_token(token);
        reg.insert(mpcb.clone()).unwrap();

        let found = reg.find(token).expect("registered");
        assert_eq!(found.local_token, token);
        assert!(reg.find(Token(0xdead_beef)).is_none());

        reg.remove(&mpcb, &pending);
        assert!(reg.find(token).is_none());
    }

    #[test]
    fn test_collision_rejected() {
        let reg = TokenRegistry::new();
        let token = reg.allocate();
        reg.insert(mpcb_with_token(token)).unwrap();
        let err = reg.insert(mpcb_with_token(token)).unwrap_err();
        assert!(matches!(err, MptcpError::TokenCollision(t) if t == token));
    }

    #[test]
    fn test_allocate_skips_registered() {
        let reg = TokenRegistry::new();
        // Occupy the token the allocator would hand out next.
        let next = Token(reg.allocate().0 + 1);
        reg.insert(mpcb_with_token(next)).unwrap();
        let allocated = reg.allocate();
        assert_ne!(allocated, next);
    }
}
