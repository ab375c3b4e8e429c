//! Wire-level vocabulary for the multipath TCP engine.
//!
//! This crate holds everything both endpoints must agree on byte-for-byte:
//! the MPTCP TCP-option codec, the DSS checksum, wrapping 32-bit sequence
//! arithmetic shared by subflow and data-sequence space, and the segment
//! buffer that carries payload together with its cached mapping metadata.
//! The engine itself (control blocks, path management, scheduling) lives in
//! `mpt_transport`.

pub mod auth;
pub mod checksum;
pub mod options;
pub mod seq;
pub mod types;

pub use options::{AddAddr, Capable, Dss, DssMapping, Fail, Join, MptcpOption, OptionError};
pub use types::addr::AddressEntry;
pub use types::segment::{pi_flag, Segment};
pub use types::token::{Key, Token};
