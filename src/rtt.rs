use std::time::Duration;

/// Smoothed round-trip estimator in the classic sRTT / deviation form, kept in
///  integer milliseconds. Retransmission timing depends on the exact truncating
///  arithmetic here, so all divisions stay integral.
pub struct RttEstimator {
    s_rtt_ms: u32,
    rx_rtt_ms: u32,
    rx_rto_ms: u32,

    rto_interval_ms: u32,
    rto_min_ms: u32,
    rto_max_ms: u32,
}

impl RttEstimator {
    pub fn new(rto_interval: Duration, rto_min: Duration, rto_max: Duration) -> RttEstimator {
        let rto_interval_ms = rto_interval.as_millis() as u32;
        let rto_min_ms = rto_min.as_millis() as u32;
        RttEstimator {
            s_rtt_ms: 0,
            rx_rtt_ms: 0,
            // before the first sample, allow one interval on top of the floor
            rx_rto_ms: rto_min_ms + rto_interval_ms,
            rto_interval_ms,
            rto_min_ms,
            rto_max_ms: rto_max.as_millis() as u32,
        }
    }

    pub fn update(&mut self, sample: Duration) {
        let sample_ms = sample.as_millis().min(u32::MAX as u128) as u32;

        if self.s_rtt_ms == 0 {
            self.s_rtt_ms = sample_ms;
            self.rx_rtt_ms = sample_ms / 2;
        }
        else {
            let delta = self.s_rtt_ms.abs_diff(sample_ms);
            self.rx_rtt_ms = (3 * self.rx_rtt_ms + delta) / 4;
            self.s_rtt_ms = (7 * self.s_rtt_ms + sample_ms) / 8;
            if self.s_rtt_ms < 1 {
                self.s_rtt_ms = 1;
            }
        }

        self.rx_rto_ms = (self.s_rtt_ms + self.rto_interval_ms.max(4 * self.rx_rtt_ms))
            .clamp(self.rto_min_ms, self.rto_max_ms);
    }

    pub fn rx_rto(&self) -> Duration {
        Duration::from_millis(self.rx_rto_ms as u64)
    }

    pub fn smoothed_rtt(&self) -> Duration {
        Duration::from_millis(self.s_rtt_ms as u64)
    }
}
