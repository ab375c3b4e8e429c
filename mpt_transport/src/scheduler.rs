//! Send-side subflow selection.
//!
//! The scheduler table keeps the selector pluggable behind an index, the
//! way the sysctl did; one scheduler is registered today. Eligibility is
//! shared policy, the strategy only ranks the eligible subflows.

use tracing::warn;

use crate::subflow::Subflow;

/// Number of registered schedulers.
pub const MPTCP_SCHED_MAX: usize = 1;

/// Shared eligibility test: a subflow may carry a new segment when it is in
/// a data state, not potentially failed, not masked out by the MPCB, its
/// congestion controller is not recovering from loss, and its window has
/// room.
pub fn is_available(sub: &Subflow, noneligible: u32) -> bool {
    if !sub.attached || sub.pf || noneligible & sub.flag() != 0 {
        return false;
    }
    let m = sub.metrics();
    if !m.state.can_send() || m.in_loss_recovery {
        return false;
    }
    m.cwnd_room() > 0
}

pub trait Scheduler: Send + Sync {
    /// Picks the subflow (by position in `subflows`) to carry a segment
    /// whose `path_mask` records the paths that already carry it.
    fn select(&self, subflows: &[Subflow], path_mask: u32, noneligible: u32) -> Option<usize>;
}

/// Minimum smoothed-RTT scheduler.
pub struct MinRttScheduler;

impl Scheduler for MinRttScheduler {
    fn select(&self, subflows: &[Subflow], path_mask: u32, noneligible: u32) -> Option<usize> {
        // With one subflow attached there is nothing to rank.
        if subflows.len() == 1 {
            return is_available(&subflows[0], noneligible).then_some(0);
        }

        subflows
            .iter()
            .enumerate()
            .filter(|(_, sub)| is_available(sub, noneligible))
            .filter(|(_, sub)| path_mask & sub.flag() == 0)
            .min_by_key(|(_, sub)| sub.metrics().srtt)
            .map(|(i, _)| i)
    }
}

/// Resolves the configured scheduler index (1-based, as the sysctl was).
pub fn by_index(index: usize) -> Box<dyn Scheduler> {
    match index {
        1 => Box::new(MinRttScheduler),
        other => {
            warn!(index = other, "unknown scheduler index, using min-rtt");
            Box::new(MinRttScheduler)
        }
    }
}
