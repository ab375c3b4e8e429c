//! Multipath TCP engine.
//!
//! Aggregates multiple concurrent TCP subflows into one in-order, reliable
//! byte stream. The crate is organized around the connection control block
//! ([`mpcb::Mpcb`]): subflows feed received segments into the DSN
//! [`mapping`] engine and the meta [`reassembly`] queues; application
//! writes go through the [`scheduler`] onto the best subflow, with the
//! [`reinject`] engine covering for paths that fail mid-stream. The
//! process-wide side lives in [`stack::MptcpStack`]: the token registry,
//! the pending-join table and the deferred-work queue.
//!
//! The per-subflow TCP machinery itself (retransmission, congestion
//! control, the 3-way handshake) is an external collaborator consumed
//! through [`subflow::SubflowIo`].

use thiserror::Error;

use mpt_core::Token;

pub mod addr_set;
pub mod config;
pub mod logging;
pub mod mapping;
pub mod mpcb;
pub mod path_table;
pub mod pending_join;
pub mod reassembly;
pub mod reinject;
pub mod scheduler;
pub mod stack;
pub mod subflow;
pub mod token_registry;
pub mod watcher;
pub mod worker;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::MptcpConfig;
pub use mpcb::Mpcb;
pub use stack::MptcpStack;
pub use subflow::{SubflowDelivery, SubflowIo, SubflowMetrics, TcpState, WireSegment};

/// Errors surfaced by the engine.
///
/// Codec-level problems are recovered locally and never reach the
/// application; protocol-layer violations fail the MPCB; IO errors surface
/// as classical send/recv errors on the master socket.
#[derive(Debug, Error)]
pub enum MptcpError {
    #[error("malformed option: {0}")]
    OptionMalformed(#[from] mpt_core::OptionError),

    #[error("DSS checksum mismatch on path {path_index}")]
    ChecksumMismatch { path_index: u32 },

    #[error(
        "subflow bytes {seq:#x}..{end_seq:#x} outside the mapping {map_start:#x}..{map_end:#x}"
    )]
    MappingViolation { seq: u32, end_seq: u32, map_start: u32, map_end: u32 },

    #[error("no connection with token {0}")]
    TokenUnknown(Token),

    #[error("token {0} already registered")]
    TokenCollision(Token),

    #[error("address inventory full ({0} entries)")]
    AddressSetFull(usize),

    #[error("backlog full, deferred packet dropped")]
    BackpressureDrop,

    #[error("peer did not negotiate multipath, falling back to plain TCP")]
    FallbackRequired,

    #[error("subflow {path_index} reset")]
    SubflowReset { path_index: u32 },

    #[error("join authentication failed")]
    JoinAuthFailed,

    #[error("meta-socket is not connected")]
    NotConnected,

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, MptcpError>;
