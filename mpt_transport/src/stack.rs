//! The process-wide multipath stack.
//!
//! Owns the token registry, the global pending-join table and the
//! deferred-work queue, and hosts the entry points that are not tied to a
//! single connection: master handshake dispatch, server-side JOIN
//! handling, interface-event fan-out and fallback.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use mpt_core::{auth, pi_flag, Join, Key, MptcpOption};

use crate::config::MptcpConfig;
use crate::mpcb::Mpcb;
use crate::pending_join::{PendingJoin, PendingJoinTable, TupleKey};
use crate::subflow::{SubflowDelivery, SubflowIo};
use crate::token_registry::TokenRegistry;
use crate::watcher::AddressEvent;
use crate::worker::Worker;
use crate::{MptcpError, Result};

/// Which execution context an entry point runs in. Work that must take the
/// meta lock is deferred to the worker when called from interrupt-like
/// context (packet reception under a subflow lock).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecContext {
    User,
    Interrupt,
}

pub struct MptcpStack {
    config: MptcpConfig,
    registry: Arc<TokenRegistry>,
    pending: Arc<PendingJoinTable>,
    worker: Worker,
}

impl MptcpStack {
    /// Builds the stack and spawns its worker drain task; must be called
    /// within a tokio runtime.
    pub fn new(config: MptcpConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry: Arc::new(TokenRegistry::new()),
            pending: Arc::new(PendingJoinTable::new()),
            worker: Worker::new(),
        })
    }

    pub fn config(&self) -> &MptcpConfig {
        &self.config
    }

    pub fn registry(&self) -> &TokenRegistry {
        &self.registry
    }

    pub fn pending_joins(&self) -> &PendingJoinTable {
        &self.pending
    }

    /// Client side: allocates a control block around the connecting master
    /// subflow. The caller places `mpcb.capable_syn()` on the SYN.
    pub fn connect(&self, master_io: Arc<dyn SubflowIo>) -> Result<Arc<Mpcb>> {
        if !self.config.enabled {
            return Err(MptcpError::FallbackRequired);
        }
        let token = self.registry.allocate();
        let key = Key::new(token, rand::random());
        let mpcb = Mpcb::new(self.config.clone(), token, key, false, master_io, 0);
        self.registry.insert(mpcb.clone())?;
        Ok(mpcb)
    }

    /// Server side: a SYN arrived with CAPABLE. Allocates the control
    /// block with a pre-assigned token; the caller answers with
    /// `mpcb.capable_synack()` and completes with `on_master_ack`.
    pub fn accept(&self, master_io: Arc<dyn SubflowIo>, syn_options: &[MptcpOption]) -> Result<Arc<Mpcb>> {
        if !self.config.enabled {
            return Err(MptcpError::FallbackRequired);
        }
        if !syn_options.iter().any(|o| matches!(o, MptcpOption::Capable(_))) {
            return Err(MptcpError::FallbackRequired);
        }
        let token = self.registry.allocate();
        let key = Key::new(token, rand::random());
        let mpcb = Mpcb::new(self.config.clone(), token, key, true, master_io, 0);
        self.registry.insert(mpcb.clone())?;
        Ok(mpcb)
    }

    /// Reverts a connection to plain TCP: the control block is destroyed,
    /// the master subflow lives on untouched. Callable from interrupt
    /// context, where the actual teardown is deferred to the worker.
    pub fn fallback(self: &Arc<Self>, mpcb: &Arc<Mpcb>, ctx: ExecContext) {
        match ctx {
            ExecContext::User => self.do_fallback(mpcb),
            ExecContext::Interrupt => {
                let stack = self.clone();
                let mpcb = mpcb.clone();
                self.worker.defer(move || stack.do_fallback(&mpcb));
            }
        }
    }

    fn do_fallback(&self, mpcb: &Arc<Mpcb>) {
        info!(token = %mpcb.local_token, "falling back to plain TCP");
        self.registry.remove(mpcb, &self.pending);
        mpcb.destroy();
    }

    /// Orderly close of a meta-connection, then registry removal.
    pub async fn close(&self, mpcb: &Arc<Mpcb>, timeout: Duration) {
        mpcb.close(timeout).await;
        self.registry.remove(mpcb, &self.pending);
    }

    // ---------------------------------------------------------------
    // Server-side JOIN handling.
    // ---------------------------------------------------------------

    /// A SYN arrived on a listening port with a JOIN option. Returns the
    /// JOIN SYN-ACK to answer with, or `Ok(None)` when the packet carries
    /// no JOIN and belongs to regular connection establishment.
    ///
    /// `TokenUnknown` maps to the "required key not available" signal: the
    /// caller must not answer the SYN.
    pub fn on_join_syn(
        &self,
        local: std::net::SocketAddr,
        remote: std::net::SocketAddr,
        options: &[MptcpOption],
    ) -> Result<Option<MptcpOption>> {
        // One parse serves both the address bookkeeping and the request
        // construction below.
        let Some((addr_id, token, remote_nonce)) = options.iter().find_map(|o| match o {
            MptcpOption::Join(Join::Syn { addr_id, token, nonce, .. }) => {
                Some((*addr_id, *token, *nonce))
            }
            _ => None,
        }) else {
            return Ok(None);
        };

        let Some(mpcb) = self.registry.find(token) else {
            warn!(%token, "JOIN for unknown token");
            return Err(MptcpError::TokenUnknown(token));
        };

        // The JOIN's source address is an implicit advertisement, NAT
        // rewrites included.
        {
            let mut guard = mpcb.inner.lock().unwrap();
            let inner = &mut *guard;
            if inner
                .rem_addrs
                .add_received(remote.ip(), 0, addr_id)
                .changed()
            {
                inner.addr_list_changed = true;
                crate::mpcb::rebuild_paths(inner, mpcb.config());
            }
        }

        let (remote_key, loc_id) = {
            let guard = mpcb.inner.lock().unwrap();
            (guard.remote_key, guard.loc_addrs.id_of(local.ip()).unwrap_or(0))
        };
        let Some(remote_key) = remote_key else {
            return Err(MptcpError::JoinAuthFailed);
        };
        let local_nonce: u32 = rand::random();
        let req = Arc::new(PendingJoin {
            key: TupleKey::new(local, remote),
            mpcb: Arc::downgrade(&mpcb),
            rem_id: addr_id,
            loc_id,
            local_nonce,
            remote_nonce,
            deadline: Instant::now() + self.config.join_timeout,
        });
        self.pending.insert(req.clone());
        mpcb.enqueue_pending_join(req);

        let mac = auth::join_mac64(mpcb.local_key, remote_key, local_nonce, remote_nonce);
        debug!(%token, %remote, "pending JOIN created");
        Ok(Some(MptcpOption::Join(Join::SynAck {
            addr_id: loc_id,
            backup: false,
            mac,
            nonce: local_nonce,
        })))
    }

    /// The ACK completing a JOIN handshake arrived; attaches the new
    /// subflow to its connection. Segments received on the subflow before
    /// this point are replayed atomically with the attach.
    pub fn on_join_ack(
        &self,
        io: Arc<dyn SubflowIo>,
        options: &[MptcpOption],
        rcv_isn: u32,
        snd_isn: u32,
        pending_rx: Vec<SubflowDelivery>,
    ) -> Result<(Arc<Mpcb>, u32)> {
        let key = TupleKey::new(io.local_addr(), io.remote_addr());
        let Some(req) = self.pending.lookup(&key) else {
            return Err(MptcpError::JoinAuthFailed);
        };
        let Some(mpcb) = req.mpcb.upgrade() else {
            self.pending.remove_entry(&req);
            return Err(MptcpError::JoinAuthFailed);
        };

        let mac = options.iter().find_map(|o| match o {
            MptcpOption::Join(Join::Ack { mac }) => Some(*mac),
            _ => None,
        });
        let Some(mac) = mac else {
            return Err(MptcpError::JoinAuthFailed);
        };

        let remote_key = mpcb
            .inner
            .lock()
            .unwrap()
            .remote_key
            .ok_or(MptcpError::JoinAuthFailed)?;
        let expected =
            auth::join_mac160(remote_key, mpcb.local_key, req.remote_nonce, req.local_nonce);
        if expected != mac {
            warn!("JOIN final ACK failed authentication");
            return Err(MptcpError::JoinAuthFailed);
        }

        // Both removals are idempotent against a concurrent teardown.
        self.pending.remove_entry(&req);
        mpcb.remove_pending_join(&req);

        // The accept path hands us an established subflow; attach counts
        // it among the established set itself.
        let path_index = mpcb.attach_subflow(io, rcv_isn, snd_isn, pending_rx)?;
        info!(token = %mpcb.local_token, path_index, "JOIN subflow attached");
        Ok((mpcb, path_index))
    }

    /// Expires half-open JOINs past their deadline.
    pub fn sweep_pending_joins(&self) -> usize {
        self.pending.remove_expired(Instant::now())
    }

    // ---------------------------------------------------------------
    // Interface events.
    // ---------------------------------------------------------------

    /// Fans one interface UP/DOWN event out to every connection.
    pub fn on_address_event(&self, event: AddressEvent) {
        self.registry.for_each(|mpcb| mpcb.on_address_event(&event));
    }

    /// Path indices a client should open subflows for, as a bitmask
    /// excluding paths already carrying one.
    pub fn update_notification(&self, mpcb: &Mpcb) -> u32 {
        let guard = mpcb.inner.lock().unwrap();
        let mut mask = guard.paths.indices_mask();
        for sub in &guard.subflows {
            mask &= !pi_flag(sub.path_index);
        }
        mask
    }
}
