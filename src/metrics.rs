/// Diagnostic counters of the reliability engine, updated synchronously on the
///  engine's execution context. External consumers get a cloned snapshot
///  rather than a live reference.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct ReliabilityMetrics {
    /// messages accepted into the outbound queue
    pub msg_queued: u64,
    /// send units created by the batcher
    pub msg_to_unit: u64,
    /// data units put on the wire, first sends and resends alike
    pub units_sent: u64,
    /// data units sent more than once
    pub units_resent: u64,
    /// resends triggered by the retransmission timeout
    pub rto_resends: u64,
    /// resends requested by the peer via NACK
    pub nack_resends: u64,
    /// resends triggered by duplicate acks for later units
    pub fast_resends: u64,
    /// acks that arrived for a slot whose unit had already been resent under a
    ///  new sequence number - the retransmission turned out to be unnecessary
    pub unneeded_resends: u64,
    /// inbound data units discarded as duplicate or out of tolerated range
    pub duplicate_units_dropped: u64,
}

impl ReliabilityMetrics {
    pub fn snapshot(&self) -> ReliabilityMetrics {
        self.clone()
    }

    pub fn reset(&mut self) {
        *self = ReliabilityMetrics::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_is_detached_and_reset_clears() {
        let mut metrics = ReliabilityMetrics::default();
        metrics.msg_queued = 3;
        metrics.rto_resends = 1;

        let snapshot = metrics.snapshot();
        metrics.msg_queued = 7;
        assert_eq!(snapshot.msg_queued, 3);

        metrics.reset();
        assert_eq!(metrics, ReliabilityMetrics::default());
        assert_eq!(snapshot.rto_resends, 1);
    }
}
