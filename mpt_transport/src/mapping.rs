//! The DSN mapping engine.
//!
//! Each subflow carries a mapping cursor describing a window of subflow
//! bytes whose DSN is `data_seq + (subflow_seq - sub_seq)`. Segments arrive
//! here in subflow order; a segment carrying a fresh DSS mapping replaces
//! the cursor, every segment must then fall inside it, and its definitive
//! DSN range is derived by linear extrapolation.

use tracing::error;

use mpt_core::seq;
use mpt_core::Segment;

use crate::{MptcpError, Result};

/// The active DSS mapping of one subflow's receive direction.
#[derive(Debug, Clone, Copy, Default)]
pub struct MappingCursor {
    pub data_seq: u32,
    /// Absolute subflow sequence the mapping anchors to.
    pub sub_seq: u32,
    /// Mapped length in DSN space. A mapping whose segment carries the
    /// DATA_FIN counts the FIN byte here, so a DATA_FIN carrier is never a
    /// zero-length mapping.
    pub data_len: u16,
    /// False until the first mapping is received.
    pub valid: bool,
}

impl MappingCursor {
    pub fn replace(&mut self, data_seq: u32, sub_seq: u32, data_len: u16) {
        self.data_seq = data_seq;
        self.sub_seq = sub_seq;
        self.data_len = data_len;
        self.valid = true;
    }

    /// One past the last subflow byte covered, allowing for a subflow FIN.
    fn end_sub_seq(&self, fin: bool) -> u32 {
        self.sub_seq
            .wrapping_add(self.data_len as u32)
            .wrapping_add(fin as u32)
    }
}

/// Where the peer's DATA_FIN sits, once signalled.
#[derive(Debug, Clone, Copy, Default)]
pub struct DataFinState {
    pub rcvd: bool,
    /// DSN of the byte following the DATA_FIN.
    pub fin_dsn: u32,
}

/// Result of applying the mapping to one in-subflow-order segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingDisposition {
    /// The segment's DSN range includes the meta `copied_seq`: deliverable
    /// to the application right away.
    InOrder,
    /// Subflow-ordered but meta-out-of-order.
    OutOfOrder,
    /// Pure subflow-level FIN; no DSN state was touched.
    SubflowFinOnly,
}

/// Applies (and, if the segment carries one, replaces) the subflow's
/// mapping, deriving the segment's definitive DSN range.
///
/// `copied_seq` is the meta-level read cursor; `dfin` the connection-level
/// DATA_FIN state. In `infinite` mode (post-FAIL fallback) the peer has
/// stopped emitting mappings and the last cursor extends over the rest of
/// the stream, so the containment check is waived. On success the
/// segment's `data_len` is cleared to mark the carried mapping as
/// consumed.
pub fn apply_mapping(
    cursor: &mut MappingCursor,
    seg: &mut Segment,
    copied_seq: u32,
    dfin: &DataFinState,
    infinite: bool,
) -> Result<MappingDisposition> {
    if seg.data_len != 0 {
        cursor.replace(seg.data_seq, seg.sub_seq, seg.data_len);
    }

    // A subflow FIN without DATA_FIN and without payload is acknowledged at
    // the subflow level only.
    if seg.fin && !seg.data_fin && seg.is_empty() {
        return Ok(MappingDisposition::SubflowFinOnly);
    }

    let map_end = cursor.end_sub_seq(seg.fin);
    let contained = cursor.valid
        && !seq::before(seg.seq, cursor.sub_seq)
        && !seq::after(seg.end_seq, map_end);
    if !contained && !(infinite && cursor.valid && !seq::before(seg.seq, cursor.sub_seq)) {
        // Bytes outside the active mapping: the stream is corrupted or the
        // peer is misbehaving. Fatal for the connection.
        error!(
            seq = format_args!("{:#x}", seg.seq),
            end_seq = format_args!("{:#x}", seg.end_seq),
            map_start = format_args!("{:#x}", cursor.sub_seq),
            map_end = format_args!("{:#x}", map_end),
            "segment outside its mapping cursor"
        );
        return Err(MptcpError::MappingViolation {
            seq: seg.seq,
            end_seq: seg.end_seq,
            map_start: cursor.sub_seq,
            map_end,
        });
    }

    // Inside the mapping: derive the DSN range. Even when the segment
    // carried the mapping itself the derivation must run, because the
    // segment boundaries may differ from the mapped window (segmentation
    // below us keeps the option as-is).
    seg.data_seq = cursor
        .data_seq
        .wrapping_add(seg.seq.wrapping_sub(cursor.sub_seq));
    seg.end_data_seq = seg.data_seq.wrapping_add(seg.len() as u32);

    // The DATA_FIN byte extends this segment only if the segment tail
    // abuts it and the DATA_FIN option actually rode on this segment; the
    // peer may equally deliver the DATA_FIN separately and out of order.
    if dfin.rcvd && seg.end_data_seq.wrapping_add(1) == dfin.fin_dsn && seg.data_fin {
        seg.end_data_seq = seg.end_data_seq.wrapping_add(1);
    }

    // Mapping consumed; a derived DSN is now authoritative for this
    // segment.
    seg.data_len = 0;

    if !seq::before(copied_seq, seg.data_seq) && seq::before(copied_seq, seg.end_data_seq) {
        Ok(MappingDisposition::InOrder)
    } else {
        Ok(MappingDisposition::OutOfOrder)
    }
}
