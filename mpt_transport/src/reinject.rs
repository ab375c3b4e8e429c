//! The reinjection engine.
//!
//! When a subflow is declared potentially failed, every segment still
//! sitting in its retransmit queue is cloned onto the MPCB-level
//! reinjection queue, which the send engine serves ahead of fresh data.
//! The original stays where it is: the subflow may yet recover and deliver
//! it, in which case the receiver's reassembler discards the late copy as
//! a duplicate. Unsent segments are never migrated between subflows; only
//! retransmit-queue data travels this path.

use tracing::debug;

use crate::mpcb::MpcbInner;

impl MpcbInner {
    /// Clones the retransmit queue of `subflows[idx]` into the reinjection
    /// queue and marks the subflow potentially failed.
    pub(crate) fn reinject_data(&mut self, idx: usize) {
        if self.subflows[idx].pf {
            // Already reinjected; while pf is set no new data was put on
            // this subflow either.
            return;
        }
        self.subflows[idx].pf = true;

        let own_flag = self.subflows[idx].flag();
        let candidates: u32 = self
            .subflows
            .iter()
            .filter(|s| s.attached && s.flag() != own_flag && s.state().can_send())
            .map(|s| s.flag())
            .fold(0, |acc, f| acc | f);

        let mut cloned = 0usize;
        for seg in self.subflows[idx].rtx_queue.iter() {
            // Only worth cloning if some working subflow has never carried
            // these bytes.
            if candidates & !seg.path_mask == 0 {
                continue;
            }
            let mut copy = seg.clone();
            copy.seq = 0;
            copy.end_seq = 0;
            self.reinject_queue.push_back(copy);
            cloned += 1;
        }

        debug!(
            path_index = self.subflows[idx].path_index,
            cloned,
            reinject_queue = self.reinject_queue.len(),
            "subflow entered pf state"
        );
    }
}
