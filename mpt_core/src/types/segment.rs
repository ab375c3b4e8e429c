use bytes::Bytes;

use crate::seq;

/// Bit flag for a path index, as used in `Segment::path_mask` and the
/// scheduler's noneligible mask. Path indices are 1-based; index 1 is the
/// master subflow.
#[inline]
pub fn pi_flag(path_index: u32) -> u32 {
    debug_assert!(path_index >= 1);
    1 << (path_index - 1)
}

/// Carrier of payload bytes with cached subflow-level and data-level
/// sequence metadata.
///
/// On the receive side a segment starts with whatever the DSS option
/// carried; the mapping engine then derives the definitive DSN range and
/// clears `data_len` to mark the carried mapping as consumed. On the send
/// side `path_mask` accumulates the subflows that have already carried this
/// byte range, so the scheduler and the reinjecter never hand the same
/// bytes to the same path twice.
#[derive(Debug, Clone)]
pub struct Segment {
    pub payload: Bytes,

    /// Subflow sequence range `[seq, end_seq)`.
    pub seq: u32,
    pub end_seq: u32,

    /// Data-sequence range `[data_seq, end_data_seq)`, including the one
    /// byte a DATA_FIN consumes.
    pub data_seq: u32,
    pub end_data_seq: u32,

    /// Length of the DSS mapping carried by this segment; zero once the
    /// mapping engine has consumed it (or when none was carried).
    pub data_len: u16,

    /// Subflow sequence number the carried mapping anchors to.
    pub sub_seq: u32,

    /// One bit per path index that already carries this byte range.
    pub path_mask: u32,

    /// Subflow-level FIN.
    pub fin: bool,

    /// DATA_FIN (DSS `F` flag).
    pub data_fin: bool,
}

impl Segment {
    /// A receive-side segment as delivered by a subflow, before any mapping
    /// has been applied.
    pub fn inbound(seq: u32, payload: Bytes, fin: bool) -> Self {
        let end_seq = seq.wrapping_add(payload.len() as u32).wrapping_add(fin as u32);
        Self {
            payload,
            seq,
            end_seq,
            data_seq: 0,
            end_data_seq: 0,
            data_len: 0,
            sub_seq: 0,
            path_mask: 0,
            fin,
            data_fin: false,
        }
    }

    /// A send-side segment entailed at `data_seq` in the meta write queue.
    pub fn outbound(data_seq: u32, payload: Bytes) -> Self {
        let end_data_seq = data_seq.wrapping_add(payload.len() as u32);
        Self {
            payload,
            seq: 0,
            end_seq: 0,
            data_seq,
            end_data_seq,
            data_len: 0,
            sub_seq: 0,
            path_mask: 0,
            fin: false,
            data_fin: false,
        }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Length of this segment in DSN space (payload plus the DATA_FIN byte).
    pub fn dsn_len(&self) -> u32 {
        self.end_data_seq.wrapping_sub(self.data_seq)
    }

    pub fn carried_by(&self, path_index: u32) -> bool {
        self.path_mask & pi_flag(path_index) != 0
    }

    pub fn mark_carried(&mut self, path_index: u32) {
        self.path_mask |= pi_flag(path_index);
    }

    /// True once the meta receiver at `rcv_nxt` has nothing left to take
    /// from this segment.
    pub fn fully_before(&self, rcv_nxt: u32) -> bool {
        !seq::before(rcv_nxt, self.end_data_seq)
    }
}
