//! Meta-level reassembly.
//!
//! Two queues in DSN space: the receive queue, contiguous from below
//! `rcv_nxt`, and the out-of-order queue, sorted by `data_seq` with
//! overlaps coalesced at insertion. Subflows may interleave arbitrarily;
//! this module alone enforces that the application sees strict DSN order.

use std::collections::VecDeque;

use tracing::debug;

use mpt_core::seq;
use mpt_core::Segment;

use crate::mapping::DataFinState;

/// What happened to an enqueued segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// Every byte was already received (late retransmit on another path).
    Duplicate,
    /// Appended to the receive queue; `rcv_nxt` advanced.
    InOrder,
    /// Parked in the out-of-order queue.
    OutOfOrder,
}

#[derive(Debug, Default)]
pub struct MetaReceive {
    /// Next DSN expected in order.
    pub rcv_nxt: u32,
    /// First DSN not yet handed to the application.
    pub copied_seq: u32,
    /// Peer DATA_FIN state, shared with the mapping engine.
    pub dfin: DataFinState,
    /// Set once the DATA_FIN has been delivered in order.
    pub rcv_shutdown: bool,
    queue: VecDeque<Segment>,
    ofo: VecDeque<Segment>,
}

impl MetaReceive {
    pub fn new(initial_dsn: u32) -> Self {
        Self {
            rcv_nxt: initial_dsn,
            copied_seq: initial_dsn,
            ..Self::default()
        }
    }

    pub fn ofo_len(&self) -> usize {
        self.ofo.len()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Payload bytes queued but not yet read by the application.
    pub fn unread_bytes(&self) -> usize {
        self.queue
            .iter()
            .map(|s| {
                if seq::before(self.copied_seq, s.data_seq) {
                    s.len()
                } else {
                    let skip = self.copied_seq.wrapping_sub(s.data_seq) as usize;
                    s.len().saturating_sub(skip)
                }
            })
            .sum()
    }

    /// Inserts one segment whose DSN range has been derived by the mapping
    /// engine.
    pub fn enqueue(&mut self, seg: Segment) -> Enqueued {
        if seg.fully_before(self.rcv_nxt) {
            // Retransmitted by the sender on another subflow and already
            // received there.
            debug!(
                data_seq = seg.data_seq,
                end = seg.end_data_seq,
                rcv_nxt = self.rcv_nxt,
                "dropping duplicate segment"
            );
            return Enqueued::Duplicate;
        }

        if seq::before(self.rcv_nxt, seg.data_seq) {
            self.enqueue_ofo(seg);
            return Enqueued::OutOfOrder;
        }

        self.push_in_order(seg);
        self.drain_ofo();
        Enqueued::InOrder
    }

    fn push_in_order(&mut self, seg: Segment) {
        self.rcv_nxt = seg.end_data_seq;
        self.queue.push_back(seg);
        if self.dfin.rcvd && self.rcv_nxt == self.dfin.fin_dsn {
            self.rcv_shutdown = true;
        }
    }

    fn enqueue_ofo(&mut self, seg: Segment) {
        // First position whose segment starts strictly after the new one.
        let pos = self
            .ofo
            .iter()
            .position(|s| seq::after(s.data_seq, seg.data_seq))
            .unwrap_or(self.ofo.len());

        // Overlap with the predecessor?
        if pos > 0 {
            let prev = &self.ofo[pos - 1];
            if seq::before(seg.data_seq, prev.end_data_seq) {
                if !seq::after(seg.end_data_seq, prev.end_data_seq) {
                    // Fully contained duplicate.
                    return;
                }
                if seg.data_seq == prev.data_seq {
                    // Same start, strictly longer: the new segment
                    // replaces the old one.
                    self.ofo.remove(pos - 1);
                    self.insert_and_trim(pos - 1, seg);
                    return;
                }
            }
        }
        self.insert_and_trim(pos, seg);
    }

    fn insert_and_trim(&mut self, pos: usize, seg: Segment) {
        // Drop every following segment the new one fully covers.
        while pos < self.ofo.len() {
            let next = &self.ofo[pos];
            if seq::after(seg.end_data_seq, next.data_seq)
                && !seq::before(seg.end_data_seq, next.end_data_seq)
            {
                self.ofo.remove(pos);
            } else {
                break;
            }
        }
        self.ofo.insert(pos, seg);
    }

    fn drain_ofo(&mut self) {
        while let Some(front) = self.ofo.front() {
            if seq::after(front.data_seq, self.rcv_nxt) {
                break;
            }
            let seg = self.ofo.pop_front().expect("front checked above");
            if seg.fully_before(self.rcv_nxt) {
                // Covered meanwhile by an in-order arrival.
                continue;
            }
            self.push_in_order(seg);
        }
    }

    /// True when the segment's DSN range covers one byte beyond its
    /// payload, which can only be the DATA_FIN.
    fn covers_fin(seg: &Segment) -> bool {
        seg.dsn_len() as usize == seg.len() + 1
    }

    /// Copies in-order bytes to `buf`, eating segments once fully read.
    /// Returns the byte count and whether the read hit the DATA_FIN.
    pub fn read(&mut self, buf: &mut [u8]) -> (usize, bool) {
        let mut copied = 0;

        while copied < buf.len() {
            let Some(front) = self.queue.front() else {
                break;
            };

            let offset = self.copied_seq.wrapping_sub(front.data_seq) as usize;
            if offset >= front.len() {
                // Payload consumed; a trailing DATA_FIN byte is eaten as a
                // zero-byte terminator.
                if Self::covers_fin(front) {
                    self.copied_seq = front.end_data_seq;
                    self.queue.pop_front();
                    return (copied, true);
                }
                self.queue.pop_front();
                continue;
            }

            let take = (front.len() - offset).min(buf.len() - copied);
            buf[copied..copied + take]
                .copy_from_slice(&front.payload[offset..offset + take]);
            copied += take;
            self.copied_seq = self.copied_seq.wrapping_add(take as u32);

            if self.copied_seq.wrapping_sub(front.data_seq) as usize == front.len() {
                if Self::covers_fin(front) {
                    self.copied_seq = front.end_data_seq;
                    self.queue.pop_front();
                    return (copied, true);
                }
                self.queue.pop_front();
            }
        }

        let at_eof = self.rcv_shutdown && self.copied_seq == self.rcv_nxt;
        (copied, at_eof)
    }

    /// True when a blocked reader has something to wake up for.
    pub fn readable(&self) -> bool {
        self.unread_bytes() > 0 || self.rcv_shutdown
    }

    /// Drops everything the application never read, for close-time
    /// accounting. Returns the number of discarded payload bytes.
    pub fn flush_unread(&mut self) -> usize {
        let unread = self.unread_bytes();
        self.queue.clear();
        self.ofo.clear();
        unread
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn seg(data_seq: u32, payload: &[u8]) -> Segment {
        let mut s = Segment::outbound(data_seq, Bytes::copy_from_slice(payload));
        s.data_len = 0;
        s
    }

    fn fin_seg(data_seq: u32, payload: &[u8]) -> Segment {
        let mut s = seg(data_seq, payload);
        s.data_fin = true;
        s.end_data_seq = s.end_data_seq.wrapping_add(1);
        s
    }

    #[test]
    fn test_in_order_delivery() {
        let mut rx = MetaReceive::new(0);
        assert_eq!(rx.enqueue(seg(0, b"abc")), Enqueued::InOrder);
        assert_eq!(rx.enqueue(seg(3, b"def")), Enqueued::InOrder);
        assert_eq!(rx.rcv_nxt, 6);

        let mut buf = [0u8; 16];
        let (n, eof) = rx.read(&mut buf);
        assert_eq!(&buf[..n], b"abcdef");
        assert!(!eof);
    }

    #[test]
    fn test_ofo_then_fill_gap() {
        let mut rx = MetaReceive::new(0);
        assert_eq!(rx.enqueue(seg(3, b"def")), Enqueued::OutOfOrder);
        assert_eq!(rx.rcv_nxt, 0);
        assert_eq!(rx.enqueue(seg(0, b"abc")), Enqueued::InOrder);
        assert_eq!(rx.rcv_nxt, 6);
        assert_eq!(rx.ofo_len(), 0);

        let mut buf = [0u8; 6];
        let (n, _) = rx.read(&mut buf);
        assert_eq!(&buf[..n], b"abcdef");
    }

    #[test]
    fn test_duplicate_dropped() {
        let mut rx = MetaReceive::new(0);
        rx.enqueue(seg(0, b"abcdef"));
        assert_eq!(rx.enqueue(seg(0, b"abc")), Enqueued::Duplicate);
        assert_eq!(rx.enqueue(seg(2, b"cdef")), Enqueued::Duplicate);
    }

    #[test]
    fn test_ofo_contained_duplicate_dropped() {
        let mut rx = MetaReceive::new(0);
        rx.enqueue(seg(10, b"0123456789"));
        assert_eq!(rx.ofo_len(), 1);
        // Fully inside the parked segment.
        rx.enqueue(seg(12, b"23"));
        assert_eq!(rx.ofo_len(), 1);
    }

    #[test]
    fn test_ofo_same_start_extension_replaces() {
        let mut rx = MetaReceive::new(0);
        rx.enqueue(seg(10, b"01"));
        rx.enqueue(seg(10, b"0123"));
        assert_eq!(rx.ofo_len(), 1);

        rx.enqueue(seg(0, b"0123456789"));
        assert_eq!(rx.rcv_nxt, 14);
    }

    #[test]
    fn test_ofo_covering_segment_trims_successors() {
        let mut rx = MetaReceive::new(0);
        rx.enqueue(seg(20, b"ab"));
        rx.enqueue(seg(24, b"cd"));
        rx.enqueue(seg(30, b"ef"));
        assert_eq!(rx.ofo_len(), 3);
        // Covers the first two parked segments entirely.
        rx.enqueue(seg(18, b"XXabXcdX"));
        assert_eq!(rx.ofo_len(), 2);

        rx.enqueue(seg(0, b"0123456789_1234567"));
        assert_eq!(rx.rcv_nxt, 26);
    }

    #[test]
    fn test_ofo_kept_sorted() {
        let mut rx = MetaReceive::new(0);
        rx.enqueue(seg(30, b"c"));
        rx.enqueue(seg(10, b"a"));
        rx.enqueue(seg(20, b"b"));
        let starts: Vec<u32> = rx.ofo.iter().map(|s| s.data_seq).collect();
        assert_eq!(starts, vec![10, 20, 30]);
    }

    #[test]
    fn test_data_fin_sets_shutdown_and_eof() {
        let mut rx = MetaReceive::new(1000);
        rx.dfin = DataFinState { rcvd: true, fin_dsn: 1101 };

        rx.enqueue(seg(1000, &[7u8; 100]));
        let mut fin = fin_seg(1100, b"");
        fin.data_seq = 1100;
        assert_eq!(rx.enqueue(fin), Enqueued::InOrder);
        assert_eq!(rx.rcv_nxt, 1101);
        assert!(rx.rcv_shutdown);

        let mut buf = [0u8; 200];
        let (n, eof) = rx.read(&mut buf);
        assert_eq!(n, 100);
        assert!(eof);
        let (n, eof) = rx.read(&mut buf);
        assert_eq!(n, 0);
        assert!(eof);
    }

    #[test]
    fn test_data_fin_piggybacked() {
        let mut rx = MetaReceive::new(0);
        rx.dfin = DataFinState { rcvd: true, fin_dsn: 101 };
        rx.enqueue(fin_seg(0, &[3u8; 100]));
        assert!(rx.rcv_shutdown);
        assert_eq!(rx.rcv_nxt, 101);

        let mut buf = [0u8; 50];
        let (n, eof) = rx.read(&mut buf);
        assert_eq!((n, eof), (50, false));
        let (n, eof) = rx.read(&mut buf);
        assert_eq!((n, eof), (50, true));
    }

    #[test]
    fn test_partial_reads_split_segment() {
        let mut rx = MetaReceive::new(0);
        rx.enqueue(seg(0, b"hello world"));
        let mut buf = [0u8; 5];
        let (n, _) = rx.read(&mut buf);
        assert_eq!(&buf[..n], b"hello");
        let (n, _) = rx.read(&mut buf);
        assert_eq!(&buf[..n], b" worl");
        let (n, _) = rx.read(&mut buf);
        assert_eq!(&buf[..n], b"d");
        assert_eq!(rx.unread_bytes(), 0);
    }

    #[test]
    fn test_flush_unread_counts() {
        let mut rx = MetaReceive::new(0);
        rx.enqueue(seg(0, b"0123456789"));
        let mut buf = [0u8; 4];
        rx.read(&mut buf);
        assert_eq!(rx.flush_unread(), 6);
        assert_eq!(rx.queue_len(), 0);
    }
}
