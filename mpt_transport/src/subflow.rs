//! The per-path subflow and the external TCP contract it is built on.
//!
//! The engine does not implement TCP. Each subflow wraps a handle to an
//! external single-flow TCP implementation ([`SubflowIo`]) and keeps only
//! the multipath-side state: the path index, the DSS mapping cursor, the
//! potentially-failed flag and the retransmit shadow queue the reinjecter
//! clones from.

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use mpt_core::{pi_flag, MptcpOption, Segment};

use crate::mapping::MappingCursor;

/// Single-flow TCP connection states, as reported by the subflow layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    SynSent,
    SynRecv,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
    Closed,
}

impl TcpState {
    /// States in which the subflow may carry new meta-data.
    pub fn can_send(&self) -> bool {
        matches!(self, TcpState::Established | TcpState::CloseWait)
    }

    /// States in which the subflow can still receive, and is therefore a
    /// valid target for an explicit window update.
    pub fn can_receive(&self) -> bool {
        matches!(
            self,
            TcpState::Established | TcpState::FinWait1 | TcpState::FinWait2
        )
    }
}

/// Snapshot of the subflow-TCP state the scheduler and the meta-level
/// buffer accounting read.
#[derive(Debug, Clone, Copy)]
pub struct SubflowMetrics {
    pub srtt: Duration,
    /// Congestion window, in bytes.
    pub snd_cwnd: u32,
    /// Unacknowledged bytes in flight, in bytes.
    pub in_flight: u32,
    pub state: TcpState,
    pub rcv_mss: u16,
    /// True while the congestion controller is in loss recovery.
    pub in_loss_recovery: bool,
    /// Subflow send buffer; the meta sndbuf is the sum over subflows.
    pub sndbuf: usize,
    /// Subflow receive buffer; summed likewise.
    pub rcvbuf: usize,
    pub window_clamp: u32,
    pub rcv_ssthresh: u32,
}

impl SubflowMetrics {
    /// Remaining congestion-window room.
    pub fn cwnd_room(&self) -> u32 {
        self.snd_cwnd.saturating_sub(self.in_flight)
    }
}

/// One TCP segment handed to the subflow layer for transmission.
#[derive(Debug, Clone)]
pub struct WireSegment {
    /// Absolute subflow sequence of the first payload byte.
    pub seq: u32,
    pub payload: Bytes,
    pub fin: bool,
    pub options: Vec<MptcpOption>,
}

/// One segment the subflow layer delivers upward, already in subflow
/// order, with its MPTCP options decoded.
#[derive(Debug, Clone)]
pub struct SubflowDelivery {
    /// Absolute subflow sequence of the first payload byte.
    pub seq: u32,
    pub payload: Bytes,
    pub fin: bool,
    pub options: Vec<MptcpOption>,
}

/// Contract the external single-flow TCP implementation fulfils for every
/// subflow. The implementation must deliver payload in subflow order via
/// the MPCB's receive entry point and report `snd_una` advances via the
/// data-ack path.
pub trait SubflowIo: Send + Sync {
    fn send_segment(&self, segment: WireSegment) -> std::io::Result<()>;

    /// Graceful subflow close (FIN).
    fn close(&self);

    /// Abortive close (RST).
    fn reset(&self);

    fn metrics(&self) -> SubflowMetrics;

    fn local_addr(&self) -> SocketAddr;

    fn remote_addr(&self) -> SocketAddr;
}

/// One attached subflow of an MPCB. All fields are protected by the meta
/// lock.
pub struct Subflow {
    pub path_index: u32,
    /// False only for the master subflow.
    pub is_slave: bool,
    pub loc_id: u8,
    pub rem_id: u8,
    pub attached: bool,
    /// Potentially failed: excluded from scheduling until the path
    /// recovers.
    pub pf: bool,
    /// Current DSS mapping window of the receive direction.
    pub cursor: MappingCursor,
    /// Subflow ISN of the receive direction; DSS `sub_seq` values are
    /// relative to it.
    pub rcv_isn: u32,
    /// Subflow ISN of the send direction.
    pub snd_isn: u32,
    /// Next subflow sequence to assign, relative to `snd_isn`.
    pub snd_next: u32,
    /// Segments handed to this subflow and not yet covered by a DATA_ACK.
    pub rtx_queue: VecDeque<Segment>,
    /// Set when a DSS checksum failed on this subflow.
    pub csum_error: bool,
    pub io: Arc<dyn SubflowIo>,
}

impl Subflow {
    pub fn new(path_index: u32, io: Arc<dyn SubflowIo>) -> Self {
        Self {
            path_index,
            is_slave: path_index != 1,
            loc_id: 0,
            rem_id: 0,
            attached: false,
            pf: false,
            cursor: MappingCursor::default(),
            rcv_isn: 0,
            snd_isn: 0,
            snd_next: 0,
            rtx_queue: VecDeque::new(),
            csum_error: false,
            io,
        }
    }

    pub fn flag(&self) -> u32 {
        pi_flag(self.path_index)
    }

    pub fn metrics(&self) -> SubflowMetrics {
        self.io.metrics()
    }

    pub fn state(&self) -> TcpState {
        self.io.metrics().state
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.io.local_addr()
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.io.remote_addr()
    }

    /// Drops every rtx entry fully covered by the meta-level `snd_una`.
    pub fn clean_rtx_queue(&mut self, snd_una: u32) {
        while let Some(front) = self.rtx_queue.front() {
            if front.fully_before(snd_una) {
                self.rtx_queue.pop_front();
            } else {
                break;
            }
        }
    }
}

impl fmt::Debug for Subflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subflow")
            .field("path_index", &self.path_index)
            .field("is_slave", &self.is_slave)
            .field("loc_id", &self.loc_id)
            .field("rem_id", &self.rem_id)
            .field("pf", &self.pf)
            .field("attached", &self.attached)
            .field("cursor", &self.cursor)
            .field("rtx_queue_len", &self.rtx_queue.len())
            .finish()
    }
}
