//! The multipath connection control block.
//!
//! One [`Mpcb`] anchors one meta-connection: the subflow set, the DSN send
//! state, the meta reassembly queues, the address inventories and the path
//! table. A single mutex over [`MpcbInner`] is the meta lock; the
//! subflow-TCP state itself lives behind each subflow's [`SubflowIo`]
//! handle and has its own locking below us.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use mpt_core::{
    auth, checksum, seq, AddAddr, Capable, Dss, DssMapping, Fail, Join, Key, MptcpOption, Segment,
    Token,
};

use crate::addr_set::AddressSet;
use crate::config::MptcpConfig;
use crate::mapping::{self, MappingDisposition};
use crate::path_table::{Path, PathTable};
use crate::pending_join::PendingJoin;
use crate::reassembly::MetaReceive;
use crate::scheduler::{self, Scheduler};
use crate::subflow::{Subflow, SubflowDelivery, SubflowIo, TcpState, WireSegment};
use crate::watcher::AddressEvent;
use crate::{MptcpError, Result};

/// Meta-socket state, derived from the subflow states and clamped by the
/// DATA_FIN exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaState {
    SynSent,
    SynRecv,
    Established,
    CloseWait,
    FinWait1,
    FinWait2,
    Closing,
    LastAck,
    TimeWait,
    Closed,
}

impl MetaState {
    pub fn can_send(&self) -> bool {
        matches!(self, MetaState::Established | MetaState::CloseWait)
    }
}

pub(crate) struct MpcbInner {
    pub state: MetaState,
    pub remote_key: Option<Key>,
    pub remote_token: Option<Token>,
    pub master_local: SocketAddr,
    pub master_remote: SocketAddr,

    // DSN send state.
    pub write_seq: u32,
    pub snd_una: u32,
    pub fin_enqueued: bool,
    /// Receive side stopped requiring mappings.
    pub infinite_mapping: bool,
    /// Send side stopped emitting mappings.
    pub send_infinite_mapping: bool,
    pub infinite_cutoff_seq: u32,

    pub send_queue: VecDeque<Segment>,
    pub reinject_queue: VecDeque<Segment>,
    pub recv: MetaReceive,

    pub subflows: Vec<Subflow>,
    pub cnt_established: usize,
    /// Path mask of subflows the scheduler must skip.
    pub noneligible: u32,
    pub next_unused_pi: u32,

    pub loc_addrs: AddressSet,
    pub rem_addrs: AddressSet,
    pub paths: PathTable,
    /// An address inventory changed; the path table needs recomputing.
    pub addr_list_changed: bool,

    /// Half-open JOINs hanging off this connection.
    pub syn_queue: Vec<Arc<PendingJoin>>,

    pub sndbuf: usize,
    pub rcvbuf: usize,
    pub window_clamp: u32,
    pub rcv_ssthresh: u32,
    /// Receive window last advertised to the peer.
    pub rcv_wnd: u32,
    /// Bytes sitting in `send_queue`.
    pub queued_bytes: usize,

    pub dead: bool,
    /// A protocol violation failed the whole MPCB.
    pub fatal: bool,
}

/// The multipath connection control block.
pub struct Mpcb {
    pub local_token: Token,
    pub local_key: Key,
    server_side: bool,
    config: MptcpConfig,
    scheduler: Box<dyn Scheduler>,
    pub(crate) inner: Mutex<MpcbInner>,
    rx_wakeup: Notify,
    tx_wakeup: Notify,
}

impl std::fmt::Debug for Mpcb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mpcb")
            .field("local_token", &self.local_token)
            .field("server_side", &self.server_side)
            .finish_non_exhaustive()
    }
}

impl Mpcb {
    /// Allocates the control block around an already-connected (or
    /// connecting) master subflow.
    pub(crate) fn new(
        config: MptcpConfig,
        local_token: Token,
        local_key: Key,
        server_side: bool,
        master_io: Arc<dyn SubflowIo>,
        initial_dsn: u32,
    ) -> Arc<Self> {
        let master_local = master_io.local_addr();
        let master_remote = master_io.remote_addr();
        let metrics = master_io.metrics();

        let mut master = Subflow::new(1, master_io);
        master.attached = true;

        let scheduler = scheduler::by_index(config.scheduler);
        let state = if server_side { MetaState::SynRecv } else { MetaState::SynSent };

        let mpcb = Arc::new(Self {
            local_token,
            local_key,
            server_side,
            scheduler,
            inner: Mutex::new(MpcbInner {
                state,
                remote_key: None,
                remote_token: None,
                master_local,
                master_remote,
                write_seq: initial_dsn,
                snd_una: initial_dsn,
                fin_enqueued: false,
                infinite_mapping: false,
                send_infinite_mapping: false,
                infinite_cutoff_seq: 0,
                send_queue: VecDeque::new(),
                reinject_queue: VecDeque::new(),
                recv: MetaReceive::new(initial_dsn),
                subflows: vec![master],
                cnt_established: 0,
                noneligible: 0,
                // Index 1 belongs to the master.
                next_unused_pi: 2,
                loc_addrs: AddressSet::new(),
                rem_addrs: AddressSet::new(),
                paths: PathTable::new(),
                addr_list_changed: false,
                syn_queue: Vec::new(),
                sndbuf: config.sndbuf,
                rcvbuf: config.rcvbuf,
                window_clamp: metrics.window_clamp,
                rcv_ssthresh: metrics.rcv_ssthresh,
                rcv_wnd: metrics.window_clamp,
                queued_bytes: 0,
                dead: false,
                fatal: false,
            }),
            rx_wakeup: Notify::new(),
            tx_wakeup: Notify::new(),
            config,
        });
        info!(token = %local_token, server_side, "allocated mpcb");
        mpcb
    }

    pub fn config(&self) -> &MptcpConfig {
        &self.config
    }

    pub fn is_server_side(&self) -> bool {
        self.server_side
    }

    pub fn state(&self) -> MetaState {
        self.inner.lock().unwrap().state
    }

    pub fn remote_token(&self) -> Option<Token> {
        self.inner.lock().unwrap().remote_token
    }

    pub fn cnt_subflows(&self) -> usize {
        self.inner.lock().unwrap().subflows.len()
    }

    pub fn cnt_established(&self) -> usize {
        self.inner.lock().unwrap().cnt_established
    }

    /// Next DSN expected from the peer.
    pub fn rcv_nxt(&self) -> u32 {
        self.inner.lock().unwrap().recv.rcv_nxt
    }

    /// Lowest DSN the peer has not acknowledged.
    pub fn snd_una(&self) -> u32 {
        self.inner.lock().unwrap().snd_una
    }

    /// Next DSN to assign to outgoing bytes.
    pub fn write_seq(&self) -> u32 {
        self.inner.lock().unwrap().write_seq
    }

    /// Snapshot of the local address inventory.
    pub fn local_addresses(&self) -> Vec<mpt_core::AddressEntry> {
        self.inner.lock().unwrap().loc_addrs.iter().copied().collect()
    }

    /// Snapshot of the addresses the peer has advertised.
    pub fn remote_addresses(&self) -> Vec<mpt_core::AddressEntry> {
        self.inner.lock().unwrap().rem_addrs.iter().copied().collect()
    }

    // ---------------------------------------------------------------
    // CAPABLE handshake.
    // ---------------------------------------------------------------

    /// The CAPABLE option for the master SYN.
    pub fn capable_syn(&self) -> MptcpOption {
        MptcpOption::Capable(Capable::syn(self.config.checksum))
    }

    /// The CAPABLE option for the master SYN-ACK (server side).
    pub fn capable_synack(&self) -> MptcpOption {
        MptcpOption::Capable(Capable::synack(self.config.checksum, self.local_key))
    }

    /// Client side: digests the SYN-ACK options. Returns the CAPABLE to
    /// put on the final ACK, or `FallbackRequired` when the peer did not
    /// negotiate multipath.
    pub fn on_master_synack(&self, options: &[MptcpOption]) -> Result<MptcpOption> {
        let capable = find_capable(options).ok_or(MptcpError::FallbackRequired)?;
        let peer_key = capable.sender_key.ok_or(MptcpError::FallbackRequired)?;

        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        inner.remote_key = Some(peer_key);
        inner.remote_token = Some(peer_key.token());
        debug!(remote_token = %peer_key.token(), "capable negotiated");
        Ok(MptcpOption::Capable(Capable::ack(
            self.config.checksum || capable.checksum_required,
            self.local_key,
            peer_key,
        )))
    }

    /// Server side: digests the final ACK options.
    pub fn on_master_ack(&self, options: &[MptcpOption]) -> Result<()> {
        let capable = find_capable(options).ok_or(MptcpError::FallbackRequired)?;
        let peer_key = capable.sender_key.ok_or(MptcpError::FallbackRequired)?;

        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        inner.remote_key = Some(peer_key);
        inner.remote_token = Some(peer_key.token());
        Ok(())
    }

    /// Called when the master subflow completes its handshake.
    pub fn on_master_established(&self) {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        inner.cnt_established += 1;
        if matches!(inner.state, MetaState::SynSent | MetaState::SynRecv) {
            inner.state = MetaState::Established;
        }
        update_buffers(inner);
        self.tx_wakeup.notify_one();
        info!(token = %self.local_token, "meta-connection established");
    }

    // ---------------------------------------------------------------
    // Path management.
    // ---------------------------------------------------------------

    /// Seeds the local address inventory from an interface scan. Addresses
    /// have already been filtered by the watcher; the master's own local
    /// address is dropped here. Recomputes the path table.
    pub fn set_local_addresses(&self, addrs: impl IntoIterator<Item = std::net::IpAddr>) {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        let master_ip = inner.master_local.ip();
        inner
            .loc_addrs
            .commit_scan(addrs.into_iter().filter(|a| *a != master_ip));
        inner.addr_list_changed = true;
        rebuild_paths(inner, &self.config);
    }

    /// Paths published by the path table with no subflow on them yet; the
    /// caller (the connecting side) opens one subflow per returned path.
    pub fn paths_to_open(&self) -> Vec<Path> {
        let guard = self.inner.lock().unwrap();
        guard
            .paths
            .iter()
            .filter(|p| !guard.subflows.iter().any(|s| s.path_index == p.path_index))
            .cloned()
            .collect()
    }

    /// ADD_ADDR options for local addresses not yet advertised.
    pub fn advertise_pending(&self) -> Vec<MptcpOption> {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        take_advertisements(inner)
    }

    /// Interface UP/DOWN notification. DOWN marks matching subflows
    /// potentially failed (and reinjects their outstanding data); UP
    /// clears the flag, and a previously unknown address joins the local
    /// inventory.
    pub fn on_address_event(&self, event: &AddressEvent) {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        let mut found = false;
        let mut reinject_idx = Vec::new();

        for (idx, sub) in inner.subflows.iter_mut().enumerate() {
            if sub.local_addr().ip() != event.addr() {
                continue;
            }
            found = true;
            match event {
                AddressEvent::Down(addr) => {
                    info!(%addr, path_index = sub.path_index, "interface down, marking pf");
                    reinject_idx.push(idx);
                }
                AddressEvent::Up(addr) => {
                    debug!(%addr, path_index = sub.path_index, "interface up, clearing pf");
                    sub.pf = false;
                }
            }
        }

        for idx in reinject_idx {
            inner.reinject_data(idx);
        }

        if !found {
            if let AddressEvent::Up(addr) = event {
                if *addr != inner.master_local.ip()
                    && !inner.loc_addrs.contains_addr(*addr)
                    && inner.loc_addrs.append_local(*addr).changed()
                {
                    inner.addr_list_changed = true;
                    rebuild_paths(inner, &self.config);
                }
            }
        }
        push_frames(inner, &*self.scheduler, &self.config);
    }

    // ---------------------------------------------------------------
    // Subflow attach / detach.
    // ---------------------------------------------------------------

    /// Attaches one subflow, either actively opened towards a published
    /// path or accepted from a JOIN. Segments the subflow layer received
    /// before the attach are replayed atomically with it, so the mapping
    /// cursor cannot be raced. Returns the assigned path index.
    pub fn attach_subflow(
        &self,
        io: Arc<dyn SubflowIo>,
        rcv_isn: u32,
        snd_isn: u32,
        pending_rx: Vec<SubflowDelivery>,
    ) -> Result<u32> {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;

        let local = io.local_addr();
        let remote = io.remote_addr();
        let loc_id = inner.loc_addrs.id_of(local.ip()).unwrap_or(0);
        let rem_id = inner.rem_addrs.id_of(remote.ip()).unwrap_or(0);

        let path_index = if self.config.ndiffports > 1 {
            // Port-diversity mode bypasses the path table.
            let pi = inner.next_unused_pi;
            inner.next_unused_pi += 1;
            pi
        } else {
            match inner.paths.find(loc_id, rem_id, local.port(), remote.port()) {
                Some(p) => p.path_index,
                None => {
                    let pi = inner.next_unused_pi;
                    inner.next_unused_pi += 1;
                    pi
                }
            }
        };
        inner.paths.commit_ports(path_index, local.port(), remote.port());

        let established = io.metrics().state == TcpState::Established;
        let mut sub = Subflow::new(path_index, io);
        sub.loc_id = loc_id;
        sub.rem_id = rem_id;
        sub.rcv_isn = rcv_isn;
        sub.snd_isn = snd_isn;
        sub.attached = true;

        info!(
            token = %self.local_token,
            path_index,
            %local,
            %remote,
            cnt_subflows = inner.subflows.len() + 1,
            "attaching subflow"
        );

        // Head insertion, like the connection list.
        inner.subflows.insert(0, sub);
        update_buffers(inner);

        if established {
            inner.cnt_established += 1;
            if matches!(inner.state, MetaState::SynSent | MetaState::SynRecv) {
                inner.state = MetaState::Established;
            }
        }

        // Drain anything that arrived on the subflow before it was ours.
        for delivery in pending_rx {
            self.deliver_locked(inner, path_index, delivery)?;
        }
        if inner.recv.readable() {
            self.rx_wakeup.notify_one();
        }

        push_frames(inner, &*self.scheduler, &self.config);
        self.tx_wakeup.notify_one();
        Ok(path_index)
    }

    /// Removes a subflow from the connection list. The control block
    /// itself lives on until the last reference goes.
    pub fn detach_subflow(&self, path_index: u32) {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        if let Some(pos) = inner.subflows.iter().position(|s| s.path_index == path_index) {
            let mut sub = inner.subflows.remove(pos);
            sub.attached = false;
            debug!(path_index, remaining = inner.subflows.len(), "detached subflow");
            update_buffers(inner);
        }
    }

    /// Hard subflow failure: clone its outstanding data for other paths,
    /// then drop it.
    pub fn on_subflow_reset(&self, path_index: u32) {
        {
            let mut guard = self.inner.lock().unwrap();
            let inner = &mut *guard;
            if let Some(idx) = inner.subflows.iter().position(|s| s.path_index == path_index) {
                warn!(path_index, "subflow reset");
                inner.reinject_data(idx);
                push_frames(inner, &*self.scheduler, &self.config);
            }
        }
        self.detach_subflow(path_index);
        self.rx_wakeup.notify_one();
        self.tx_wakeup.notify_one();
    }

    /// Declares a path potentially failed and reinjects its outstanding
    /// segments onto the surviving subflows.
    pub fn mark_path_failed(&self, path_index: u32) {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        if let Some(idx) = inner.subflows.iter().position(|s| s.path_index == path_index) {
            inner.reinject_data(idx);
            push_frames(inner, &*self.scheduler, &self.config);
        }
    }

    /// A slave subflow finished its handshake.
    pub fn on_subflow_established(&self, path_index: u32) {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        if inner.subflows.iter().any(|s| s.path_index == path_index) {
            inner.cnt_established += 1;
            if matches!(inner.state, MetaState::SynSent | MetaState::SynRecv) {
                inner.state = MetaState::Established;
            }
            update_buffers(inner);
            push_frames(inner, &*self.scheduler, &self.config);
            self.tx_wakeup.notify_one();
        }
    }

    // ---------------------------------------------------------------
    // Receive path.
    // ---------------------------------------------------------------

    /// Entry point for every segment a subflow delivers, in subflow order.
    pub fn on_subflow_delivery(&self, path_index: u32, delivery: SubflowDelivery) -> Result<()> {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        let res = self.deliver_locked(inner, path_index, delivery);
        if inner.recv.readable() {
            self.rx_wakeup.notify_one();
        }
        res
    }

    fn deliver_locked(
        &self,
        inner: &mut MpcbInner,
        path_index: u32,
        delivery: SubflowDelivery,
    ) -> Result<()> {
        let Some(idx) = inner.subflows.iter().position(|s| s.path_index == path_index) else {
            return Err(MptcpError::SubflowReset { path_index });
        };

        let mut dss: Option<Dss> = None;
        let mut rebuild = false;
        for option in &delivery.options {
            match option {
                MptcpOption::Dss(d) => {
                    if let Some(ack) = d.data_ack {
                        self.handle_data_ack(inner, ack);
                    }
                    dss = Some(*d);
                }
                MptcpOption::AddAddr(add) => {
                    if inner
                        .rem_addrs
                        .add_received(add.addr, add.port.unwrap_or(0), add.addr_id)
                        .changed()
                    {
                        rebuild = true;
                    }
                }
                MptcpOption::Fail(fail) => {
                    // The peer saw a broken checksum from us: stop mapping.
                    warn!(dsn = fail.data_seq, "peer requested infinite mapping");
                    inner.send_infinite_mapping = true;
                    inner.infinite_cutoff_seq = fail.data_seq;
                }
                MptcpOption::Capable(_) | MptcpOption::Join(_) => {
                    // Handshake options have no business on an attached
                    // subflow; ignore.
                }
            }
        }
        if rebuild {
            inner.addr_list_changed = true;
            rebuild_paths(inner, &self.config);
        }

        let mut seg = Segment::inbound(delivery.seq, delivery.payload, delivery.fin);

        if let Some(d) = dss {
            if let Some(m) = d.mapping {
                if let Some(cs) = m.checksum {
                    if self.config.checksum
                        && !checksum::validate(&seg.payload, m.data_seq, m.sub_seq, m.data_len, cs)
                    {
                        return self.checksum_failure(inner, idx);
                    }
                }
                let sub = &inner.subflows[idx];
                seg.data_seq = m.data_seq;
                seg.sub_seq = m.sub_seq.wrapping_add(sub.rcv_isn);
                seg.data_len = m.data_len;
                seg.end_data_seq = m.data_seq.wrapping_add(seg.len() as u32);
                if d.data_fin {
                    seg.data_fin = true;
                    seg.end_data_seq = seg.end_data_seq.wrapping_add(1);
                    inner.recv.dfin.rcvd = true;
                    inner.recv.dfin.fin_dsn = m.data_seq.wrapping_add(m.data_len as u32);
                }
            } else if d.data_fin {
                // A DATA_FIN always rides a mapping covering its byte; a
                // bare flag carries nothing actionable.
                debug!("DATA_FIN without a mapping, ignoring");
            }
        }

        if seg.is_empty() && !seg.fin && !seg.data_fin {
            // Pure ack or option-only packet.
            return Ok(());
        }

        let was_shutdown = inner.recv.rcv_shutdown;

        let disposition = match mapping::apply_mapping(
            &mut inner.subflows[idx].cursor,
            &mut seg,
            inner.recv.copied_seq,
            &inner.recv.dfin,
            inner.infinite_mapping,
        ) {
            Ok(d) => d,
            Err(err) => {
                // Protocol violation: fatal for the whole MPCB.
                inner.fatal = true;
                for sub in &inner.subflows {
                    sub.io.reset();
                }
                self.rx_wakeup.notify_one();
                self.tx_wakeup.notify_one();
                return Err(err);
            }
        };

        match disposition {
            MappingDisposition::SubflowFinOnly => return Ok(()),
            MappingDisposition::InOrder | MappingDisposition::OutOfOrder => {
                seg.mark_carried(path_index);
                inner.recv.enqueue(seg);
            }
        }

        if inner.recv.rcv_shutdown && !was_shutdown {
            self.on_data_fin_delivered(inner);
        }
        Ok(())
    }

    fn checksum_failure(&self, inner: &mut MpcbInner, idx: usize) -> Result<()> {
        let path_index = inner.subflows[idx].path_index;
        warn!(path_index, "DSS checksum failure, resetting subflow");
        inner.subflows[idx].csum_error = true;
        inner.subflows[idx].io.reset();

        // Tell the sender to fall back to a single unmapped stream.
        inner.infinite_mapping = true;
        let fail = MptcpOption::Fail(Fail { data_seq: inner.recv.rcv_nxt });
        if let Some(other) = inner.subflows.iter().find(|s| !s.csum_error && s.state().can_send()) {
            let wire = WireSegment {
                seq: other.snd_isn.wrapping_add(other.snd_next),
                payload: Bytes::new(),
                fin: false,
                options: vec![fail],
            };
            if let Err(err) = other.io.send_segment(wire) {
                warn!(%err, "failed to send MP_FAIL");
            }
        }

        // The carrying subflow is gone; the remaining single path carries
        // the unmapped rest of the stream.
        let mut sub = inner.subflows.remove(idx);
        sub.attached = false;
        update_buffers(inner);
        Err(MptcpError::ChecksumMismatch { path_index })
    }

    fn on_data_fin_delivered(&self, inner: &mut MpcbInner) {
        inner.state = match inner.state {
            MetaState::Established => MetaState::CloseWait,
            MetaState::FinWait1 => MetaState::Closing,
            MetaState::FinWait2 => MetaState::Closed,
            other => other,
        };
        debug!(state = ?inner.state, "peer DATA_FIN delivered");
        self.rx_wakeup.notify_one();
    }

    fn handle_data_ack(&self, inner: &mut MpcbInner, ack: u32) {
        if !seq::after(ack, inner.snd_una) {
            return;
        }
        inner.snd_una = ack;
        for sub in &mut inner.subflows {
            sub.clean_rtx_queue(ack);
        }
        while let Some(front) = inner.reinject_queue.front() {
            if front.fully_before(ack) {
                inner.reinject_queue.pop_front();
            } else {
                break;
            }
        }

        if inner.fin_enqueued && inner.snd_una == inner.write_seq {
            inner.state = match inner.state {
                MetaState::FinWait1 => MetaState::FinWait2,
                MetaState::Closing => MetaState::TimeWait,
                MetaState::LastAck => MetaState::Closed,
                other => other,
            };
        }
        self.tx_wakeup.notify_one();
    }

    // ---------------------------------------------------------------
    // Send path.
    // ---------------------------------------------------------------

    /// Writes application bytes onto the meta-stream. Blocks while the
    /// send buffer is full; returns the number of bytes accepted.
    pub async fn send(&self, data: &[u8]) -> Result<usize> {
        let mut written = 0;
        while written < data.len() {
            let made_progress = {
                let mut guard = self.inner.lock().unwrap();
                let inner = &mut *guard;
                if inner.fatal || inner.dead {
                    return Err(MptcpError::NotConnected);
                }
                if inner.state.can_send() {
                    while written < data.len() && inner.queued_bytes < inner.sndbuf {
                        let take = (data.len() - written).min(self.config.mss as usize);
                        let chunk = Bytes::copy_from_slice(&data[written..written + take]);
                        let seg = Segment::outbound(inner.write_seq, chunk);
                        inner.write_seq = inner.write_seq.wrapping_add(take as u32);
                        inner.queued_bytes += take;
                        inner.send_queue.push_back(seg);
                        written += take;
                    }
                    push_frames(inner, &*self.scheduler, &self.config);
                    if written == data.len() {
                        return Ok(written);
                    }
                    // Scheduling may have freed queue space already; only
                    // park when the buffer is still full.
                    inner.queued_bytes < inner.sndbuf
                } else if matches!(inner.state, MetaState::SynSent | MetaState::SynRecv) {
                    false
                } else {
                    return Err(MptcpError::NotConnected);
                }
            };
            if !made_progress {
                self.tx_wakeup.notified().await;
            }
        }
        Ok(written)
    }

    /// Retries scheduling of queued and reinjected segments, e.g. after
    /// the subflow layer reports fresh congestion-window room.
    pub fn push_pending_frames(&self) {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        push_frames(inner, &*self.scheduler, &self.config);
    }

    /// Reads in-order bytes from the meta-stream. Returns 0 only at
    /// DATA_FIN (clean EOF).
    pub async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            {
                let mut guard = self.inner.lock().unwrap();
                let inner = &mut *guard;
                if inner.fatal {
                    return Err(MptcpError::NotConnected);
                }
                let (n, eof) = inner.recv.read(buf);
                if n > 0 || eof {
                    cleanup_rbuf(inner, n);
                    return Ok(n);
                }
                if inner.dead || inner.subflows.is_empty() {
                    return Err(MptcpError::NotConnected);
                }
            }
            self.rx_wakeup.notified().await;
        }
    }

    // ---------------------------------------------------------------
    // Close / teardown.
    // ---------------------------------------------------------------

    /// Enqueues the DATA_FIN: piggybacked on the last unsent segment when
    /// there is one, otherwise on a zero-payload carrier.
    pub(crate) fn send_data_fin(&self, inner: &mut MpcbInner) {
        if inner.fin_enqueued {
            return;
        }
        match inner.send_queue.back_mut() {
            Some(last) if !last.data_fin => {
                last.data_fin = true;
                last.end_data_seq = last.end_data_seq.wrapping_add(1);
            }
            _ => {
                let mut carrier = Segment::outbound(inner.write_seq, Bytes::new());
                carrier.data_fin = true;
                carrier.end_data_seq = carrier.end_data_seq.wrapping_add(1);
                inner.send_queue.push_back(carrier);
            }
        }
        inner.write_seq = inner.write_seq.wrapping_add(1);
        inner.fin_enqueued = true;
        push_frames(inner, &*self.scheduler, &self.config);
    }

    /// Closes the meta-socket: flushes undelivered receive data, sends the
    /// DATA_FIN, waits up to `timeout` for the peer to ack outstanding
    /// data, then closes every subflow.
    pub async fn close(&self, timeout: Duration) {
        {
            let mut guard = self.inner.lock().unwrap();
            let inner = &mut *guard;

            let unread = inner.recv.flush_unread();
            if unread > 0 {
                debug!(unread, "discarding unread receive data at close");
            }

            let send_fin = match inner.state {
                MetaState::Established | MetaState::SynRecv => {
                    inner.state = MetaState::FinWait1;
                    true
                }
                MetaState::CloseWait => {
                    inner.state = MetaState::LastAck;
                    true
                }
                MetaState::SynSent => {
                    inner.state = MetaState::Closed;
                    false
                }
                _ => false,
            };
            if send_fin {
                self.send_data_fin(inner);
            }
        }

        let all_acked = |inner: &MpcbInner| {
            inner.snd_una == inner.write_seq
                && inner.send_queue.is_empty()
                && inner.reinject_queue.is_empty()
        };

        let wait = async {
            loop {
                {
                    let guard = self.inner.lock().unwrap();
                    if all_acked(&*guard) || guard.fatal {
                        break;
                    }
                }
                self.tx_wakeup.notified().await;
            }
        };
        if tokio::time::timeout(timeout, wait).await.is_err() {
            warn!(token = %self.local_token, "close timed out with unacked data");
        }

        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        for sub in &inner.subflows {
            sub.io.close();
        }
        inner.dead = true;
        if inner.state == MetaState::TimeWait {
            inner.state = MetaState::Closed;
        }
        info!(token = %self.local_token, state = ?inner.state, "meta-socket closed");
    }

    /// Marks the control block dead without the FIN exchange (fallback,
    /// listener teardown).
    pub(crate) fn destroy(&self) {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        inner.dead = true;
        inner.state = MetaState::Closed;
        self.rx_wakeup.notify_one();
        self.tx_wakeup.notify_one();
    }

    // ---------------------------------------------------------------
    // Client-side JOIN handshake.
    // ---------------------------------------------------------------

    /// Builds the JOIN SYN for a new subflow from `local_addr`, carrying
    /// the peer's token.
    pub fn initiate_join(&self, local_addr: std::net::IpAddr) -> Result<(MptcpOption, JoinInitiation)> {
        let guard = self.inner.lock().unwrap();
        let remote_token = guard.remote_token.ok_or(MptcpError::NotConnected)?;
        let addr_id = guard.loc_addrs.id_of(local_addr).unwrap_or(0);
        let nonce: u32 = rand::random();
        let syn = MptcpOption::Join(Join::Syn { addr_id, backup: false, token: remote_token, nonce });
        Ok((syn, JoinInitiation { local_nonce: nonce, addr_id }))
    }

    /// Verifies the JOIN SYN-ACK and produces the final ACK option.
    pub fn complete_join(&self, init: &JoinInitiation, synack: &Join) -> Result<MptcpOption> {
        let Join::SynAck { mac, nonce: remote_nonce, .. } = synack else {
            return Err(MptcpError::JoinAuthFailed);
        };
        let remote_key = {
            let guard = self.inner.lock().unwrap();
            guard.remote_key.ok_or(MptcpError::NotConnected)?
        };
        let expected = auth::join_mac64(remote_key, self.local_key, *remote_nonce, init.local_nonce);
        if expected != *mac {
            return Err(MptcpError::JoinAuthFailed);
        }
        let ack_mac =
            auth::join_mac160(self.local_key, remote_key, init.local_nonce, *remote_nonce);
        Ok(MptcpOption::Join(Join::Ack { mac: ack_mac }))
    }

    pub(crate) fn enqueue_pending_join(&self, req: Arc<PendingJoin>) {
        self.inner.lock().unwrap().syn_queue.push(req);
    }

    /// Idempotently drops a pending JOIN from the local syn-table.
    pub(crate) fn remove_pending_join(&self, req: &Arc<PendingJoin>) {
        let mut guard = self.inner.lock().unwrap();
        guard.syn_queue.retain(|r| !Arc::ptr_eq(r, req));
    }

    pub(crate) fn pending_joins(&self) -> Vec<Arc<PendingJoin>> {
        self.inner.lock().unwrap().syn_queue.clone()
    }
}

/// Client-side state carried between the JOIN SYN and the SYN-ACK.
#[derive(Debug, Clone, Copy)]
pub struct JoinInitiation {
    pub local_nonce: u32,
    pub addr_id: u8,
}

fn find_capable(options: &[MptcpOption]) -> Option<Capable> {
    options.iter().find_map(|o| match o {
        MptcpOption::Capable(c) => Some(*c),
        _ => None,
    })
}

/// Recomputes the path table in whichever construction mode is configured.
pub(crate) fn rebuild_paths(inner: &mut MpcbInner, config: &MptcpConfig) {
    if !inner.addr_list_changed {
        return;
    }
    inner.addr_list_changed = false;
    if config.ndiffports > 1 {
        let (local, remote) = (inner.master_local, inner.master_remote);
        let next = &mut inner.next_unused_pi;
        inner.paths.seed_ndiffports(local, remote, config.ndiffports, next);
    } else {
        let (local, remote) = (inner.master_local, inner.master_remote);
        let next = &mut inner.next_unused_pi;
        let loc = &inner.loc_addrs;
        let rem = &inner.rem_addrs;
        inner.paths.rebuild(loc, rem, local, remote, next);
    }
}

/// Sums the subflow contributions into the meta buffers.
pub(crate) fn update_buffers(inner: &mut MpcbInner) {
    let mut window_clamp = 0u32;
    let mut rcv_ssthresh = 0u32;
    let mut rcvbuf = 0usize;
    let mut sndbuf = 0usize;
    for sub in &inner.subflows {
        let m = sub.metrics();
        window_clamp += m.window_clamp;
        rcv_ssthresh += m.rcv_ssthresh;
        rcvbuf += m.rcvbuf;
        sndbuf += m.sndbuf;
    }
    if !inner.subflows.is_empty() {
        inner.window_clamp = window_clamp;
        inner.rcv_ssthresh = rcv_ssthresh;
        inner.rcvbuf = rcvbuf;
        inner.sndbuf = sndbuf;
    }
}

/// Drains pending local-address advertisements into ADD_ADDR options.
fn take_advertisements(inner: &mut MpcbInner) -> Vec<MptcpOption> {
    inner
        .loc_addrs
        .take_unsent()
        .into_iter()
        .map(|e| {
            MptcpOption::AddAddr(AddAddr {
                addr_id: e.id,
                addr: e.addr,
                port: (e.port != 0).then_some(e.port),
            })
        })
        .collect()
}

/// The send engine: repeatedly takes the next segment (reinjection queue
/// first) and hands it to the scheduler's pick, stamping the DSS mapping.
pub(crate) fn push_frames(inner: &mut MpcbInner, sched: &dyn Scheduler, config: &MptcpConfig) {
    loop {
        let (from_reinject, path_mask) = match (inner.reinject_queue.front(), inner.send_queue.front()) {
            (Some(seg), _) => (true, seg.path_mask),
            (None, Some(seg)) => (false, seg.path_mask),
            (None, None) => break,
        };

        let Some(idx) = sched.select(&inner.subflows, path_mask, inner.noneligible) else {
            break;
        };

        let mut seg = if from_reinject {
            inner.reinject_queue.pop_front().unwrap()
        } else {
            let seg = inner.send_queue.pop_front().unwrap();
            inner.queued_bytes -= seg.len();
            seg
        };

        let advertisements = take_advertisements(inner);
        let sub = &mut inner.subflows[idx];
        let rel_sub_seq = sub.snd_next;
        seg.seq = sub.snd_isn.wrapping_add(rel_sub_seq);
        seg.end_seq = seg.seq.wrapping_add(seg.len() as u32);
        seg.sub_seq = seg.seq;
        seg.mark_carried(sub.path_index);

        let mapping = (!inner.send_infinite_mapping).then(|| {
            let data_len = seg.dsn_len() as u16;
            DssMapping {
                data_seq: seg.data_seq,
                sub_seq: rel_sub_seq,
                data_len,
                checksum: config
                    .checksum
                    .then(|| checksum::compute(&seg.payload, seg.data_seq, rel_sub_seq, data_len)),
            }
        });
        let mut options = vec![MptcpOption::Dss(Dss {
            data_ack: Some(inner.recv.rcv_nxt),
            mapping,
            data_fin: seg.data_fin,
        })];
        options.extend(advertisements);

        let wire = WireSegment {
            seq: seg.seq,
            payload: seg.payload.clone(),
            fin: false,
            options,
        };

        sub.snd_next = sub.snd_next.wrapping_add(seg.len() as u32);
        match sub.io.send_segment(wire) {
            Ok(()) => {
                sub.rtx_queue.push_back(seg);
            }
            Err(err) => {
                warn!(path_index = sub.path_index, %err, "subflow send failed, marking pf");
                sub.snd_next = rel_sub_seq;
                sub.pf = true;
                // Give the segment back to its queue; another subflow may
                // take it on the next turn of the loop.
                if from_reinject {
                    inner.reinject_queue.push_front(seg);
                } else {
                    inner.queued_bytes += seg.len();
                    inner.send_queue.push_front(seg);
                }
            }
        }
    }
}

/// Post-read bookkeeping: recomputes the advertisable window and, when the
/// cleared buffer at least doubles it, pushes an explicit window update on
/// every subflow still able to receive.
fn cleanup_rbuf(inner: &mut MpcbInner, copied: usize) {
    if copied == 0 || inner.recv.rcv_shutdown {
        return;
    }

    let rcv_window_now = inner.rcv_wnd;
    if 2 * rcv_window_now > inner.window_clamp {
        return;
    }

    let unread = inner.recv.unread_bytes();
    let new_window =
        (inner.rcvbuf.saturating_sub(unread) as u32).min(inner.window_clamp);
    if new_window == 0 || new_window < 2 * rcv_window_now {
        return;
    }

    inner.rcv_wnd = new_window;
    let ack = MptcpOption::Dss(Dss {
        data_ack: Some(inner.recv.rcv_nxt),
        mapping: None,
        data_fin: false,
    });
    for sub in &inner.subflows {
        if sub.state().can_receive() {
            let wire = WireSegment {
                seq: sub.snd_isn.wrapping_add(sub.snd_next),
                payload: Bytes::new(),
                fin: false,
                options: vec![ack],
            };
            if let Err(err) = sub.io.send_segment(wire) {
                debug!(path_index = sub.path_index, %err, "window update send failed");
            }
        }
    }
}
