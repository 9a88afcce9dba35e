//! Per-IP request record.

use std::sync::Arc;

use parking_lot::Mutex;

use super::standing::IpStanding;

pub(crate) type SharedNode = Arc<Mutex<RequestNode>>;

/// What a housekeeping sweep did with a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PeriodOutcome {
    /// Quiet OK node; drop it from the map.
    Remove,
    /// Temporarily blocked node that went quiet, now OK again.
    Reinstated,
    Retained,
}

/// Request counts for the current monitor period plus the IP's standing.
///
/// Always accessed under its mutex. Once `deleted` is set the node has left
/// the map and must not be mutated; callers look the IP up again.
#[derive(Debug, Default)]
pub(crate) struct RequestNode {
    legitimate: u32,
    erroneous: u32,
    denied: u32,
    standing: IpStanding,
    standing_updated_at: u64,
    deleted: bool,
}

impl RequestNode {
    pub(crate) fn new(now_ms: u64) -> Self {
        Self {
            standing_updated_at: now_ms,
            ..Self::default()
        }
    }

    /// Node rebuilt from a checkpoint: zero counts, preserved standing.
    pub(crate) fn restored(standing: IpStanding, standing_updated_at: u64) -> Self {
        Self {
            standing,
            standing_updated_at,
            ..Self::default()
        }
    }

    pub(crate) fn shared(self) -> SharedNode {
        Arc::new(Mutex::new(self))
    }

    /// Returns true if this request escalated the node to TemporarilyBlocked.
    pub(crate) fn record_legitimate(&mut self, spam_threshold: u32, now_ms: u64) -> bool {
        self.legitimate = self.legitimate.saturating_add(1);
        self.escalate_if(self.legitimate >= spam_threshold, now_ms)
    }

    /// Returns true if this request escalated the node to TemporarilyBlocked.
    pub(crate) fn record_erroneous(&mut self, erroneous_threshold: u32, now_ms: u64) -> bool {
        self.erroneous = self.erroneous.saturating_add(1);
        self.escalate_if(self.erroneous >= erroneous_threshold, now_ms)
    }

    pub(crate) fn record_denied(&mut self) {
        self.denied = self.denied.saturating_add(1);
    }

    fn escalate_if(&mut self, reached: bool, now_ms: u64) -> bool {
        if reached && self.standing == IpStanding::Ok {
            self.set_standing(IpStanding::TemporarilyBlocked, now_ms);
            true
        } else {
            false
        }
    }

    pub(crate) fn set_standing(&mut self, standing: IpStanding, now_ms: u64) {
        self.standing = standing;
        self.standing_updated_at = now_ms;
    }

    /// Recompute the standing from this period's total request count.
    pub(crate) fn parole(&mut self, spam_threshold: u32, now_ms: u64) -> IpStanding {
        let standing = if self.total_requests() >= spam_threshold {
            IpStanding::TemporarilyBlocked
        } else {
            IpStanding::Ok
        };
        self.set_standing(standing, now_ms);
        standing
    }

    /// Apply the end-of-period rules. Counters are reset on surviving nodes.
    pub(crate) fn end_period(&mut self, spam_threshold: u32, now_ms: u64) -> PeriodOutcome {
        let outcome = match self.standing {
            IpStanding::Ok if self.legitimate == 0 && self.erroneous == 0 => PeriodOutcome::Remove,
            IpStanding::TemporarilyBlocked if self.total_requests() < spam_threshold => {
                self.set_standing(IpStanding::Ok, now_ms);
                PeriodOutcome::Reinstated
            }
            _ => PeriodOutcome::Retained,
        };

        if outcome == PeriodOutcome::Remove {
            self.mark_deleted();
        } else {
            self.reset_counts();
        }
        outcome
    }

    pub(crate) fn reset_counts(&mut self) {
        self.legitimate = 0;
        self.erroneous = 0;
        self.denied = 0;
    }

    pub(crate) fn mark_deleted(&mut self) {
        self.deleted = true;
    }

    pub(crate) fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub(crate) fn total_requests(&self) -> u32 {
        self.legitimate
            .saturating_add(self.erroneous)
            .saturating_add(self.denied)
    }

    pub(crate) fn legitimate(&self) -> u32 {
        self.legitimate
    }

    pub(crate) fn erroneous(&self) -> u32 {
        self.erroneous
    }

    pub(crate) fn denied(&self) -> u32 {
        self.denied
    }

    pub(crate) fn standing(&self) -> IpStanding {
        self.standing
    }

    pub(crate) fn standing_updated_at(&self) -> u64 {
        self.standing_updated_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escalates_once_at_threshold() {
        let mut node = RequestNode::new(1);
        assert!(!node.record_legitimate(3, 2));
        assert!(!node.record_legitimate(3, 3));
        assert!(node.record_legitimate(3, 4));
        assert!(!node.record_legitimate(3, 5));
        assert_eq!(node.standing(), IpStanding::TemporarilyBlocked);
        assert_eq!(node.standing_updated_at(), 4);
    }

    #[test]
    fn denied_requests_never_escalate() {
        let mut node = RequestNode::new(0);
        for _ in 0..100 {
            node.record_denied();
        }
        assert_eq!(node.standing(), IpStanding::Ok);
        assert_eq!(node.total_requests(), 100);
    }

    #[test]
    fn blacklist_is_not_downgraded_by_escalation() {
        let mut node = RequestNode::new(0);
        node.set_standing(IpStanding::Blacklisted, 10);
        assert!(!node.record_erroneous(1, 20));
        assert_eq!(node.standing(), IpStanding::Blacklisted);
        assert_eq!(node.standing_updated_at(), 10);
    }

    #[test]
    fn quiet_ok_node_is_removed() {
        let mut node = RequestNode::new(0);
        node.record_denied();
        assert_eq!(node.end_period(10, 1), PeriodOutcome::Remove);
        assert!(node.is_deleted());
    }

    #[test]
    fn busy_blocked_node_stays_blocked() {
        let mut node = RequestNode::new(0);
        for _ in 0..10 {
            node.record_legitimate(10, 0);
        }
        assert_eq!(node.end_period(10, 1), PeriodOutcome::Retained);
        assert_eq!(node.standing(), IpStanding::TemporarilyBlocked);
        assert_eq!(node.total_requests(), 0);
    }

    #[test]
    fn parole_uses_period_total() {
        let mut node = RequestNode::restored(IpStanding::Blacklisted, 5);
        for _ in 0..4 {
            node.record_denied();
        }
        assert_eq!(node.parole(4, 6), IpStanding::TemporarilyBlocked);
        node.reset_counts();
        assert_eq!(node.parole(4, 7), IpStanding::Ok);
    }
}
