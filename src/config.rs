use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context};

use crate::seq::SeqNr;

/// Bytes of the datagram budget reserved for the datagram header and the
///  per-record framing when batching messages into a unit.
const BATCH_HEADROOM: usize = 200;

/// Per-connection tuning of the reliability engine. All values have defaults
///  matching the protocol's traditional constants and can be overridden from
///  the environment (`RAKNET_*` variables).
pub struct ReliabilityConfig {
    /// UDP payload size the connection may use per datagram. The engine does
    ///  not discover this; MTU negotiation belongs to the session layer.
    pub mtu: usize,

    /// number of units that may be awaiting acknowledgement; the backing
    ///  window allocates the next power of two above this to keep room for
    ///  resend duplicates
    pub send_window_size: u32,

    /// periodic retransmission-check interval
    pub rto_interval: Duration,
    pub rto_min: Duration,
    pub rto_max: Duration,
    /// slack added on top of the sampled RTO for a unit's very first send, so
    ///  the first round trip is not timed out prematurely
    pub rto_first_send_slack: Duration,

    /// a unit transmitted this many times without an ack closes the connection
    pub max_retransmissions: u32,
    /// duplicate acks for later units before a unit is resent early
    pub fast_resend_threshold: u32,

    /// inbound units further than this ahead of the receive cursor are dropped
    ///  as invalid
    pub max_out_of_order_span: u32,
    /// buffered out-of-order messages per ordering channel before the gap is
    ///  declared unrecoverable
    pub max_ordering_loss: usize,
    /// split-message reassembly budget; consumed by the fragmentation layer,
    ///  carried here so one config object describes the connection
    pub max_buffered_splits: usize,

    /// lower bound for the coalescing flush delay (sRTT / 10 can be zero)
    pub min_flush_delay: Duration,
}

impl ReliabilityConfig {
    /// Defaults for IPV4 with full Ethernet frames and no optional IP headers.
    pub fn default_ipv4() -> ReliabilityConfig {
        let rto_interval = Duration::from_millis(100);
        let rto_min = Duration::from_millis(200);
        ReliabilityConfig {
            mtu: 1472,
            send_window_size: 128,
            rto_interval,
            rto_min,
            rto_max: Duration::from_millis(60_000),
            rto_first_send_slack: rto_interval,
            max_retransmissions: 20,
            fast_resend_threshold: 3,
            max_out_of_order_span: (1 << 16) - 1,
            max_ordering_loss: 10240,
            max_buffered_splits: 4096,
            min_flush_delay: Duration::from_millis(1),
        }
    }

    /// Defaults with environment overrides applied.
    pub fn from_env() -> anyhow::Result<ReliabilityConfig> {
        let mut config = Self::default_ipv4();
        env_override("RAKNET_MTU", &mut config.mtu)?;
        env_override("RAKNET_SND_WINDOW", &mut config.send_window_size)?;
        env_override_millis("RAKNET_RTO_INTERVAL", &mut config.rto_interval)?;
        env_override_millis("RAKNET_RTO_MIN", &mut config.rto_min)?;
        env_override_millis("RAKNET_RTO_MAX", &mut config.rto_max)?;
        env_override("RAKNET_MAX_RETRANSMISSION", &mut config.max_retransmissions)?;
        env_override("RAKNET_ACK_FAST_RESEND", &mut config.fast_resend_threshold)?;
        env_override("RAKNET_MAX_PACKET_LOSS", &mut config.max_ordering_loss)?;
        env_override("RAKNET_MAX_PACKET_SPLITS", &mut config.max_buffered_splits)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.mtu <= BATCH_HEADROOM {
            bail!("mtu {} leaves no room for payload", self.mtu);
        }
        if self.send_window_size == 0 {
            bail!("send window size must be at least 1");
        }
        if (1u64 << self.window_capacity_power()) > SeqNr::MAX_VALUE as u64 {
            bail!("send window size {} does not fit the sequence space", self.send_window_size);
        }
        if self.rto_min > self.rto_max {
            bail!("rto_min {:?} is above rto_max {:?}", self.rto_min, self.rto_max);
        }
        if self.rto_interval.is_zero() {
            bail!("rto_interval must be non-zero");
        }
        if self.fast_resend_threshold == 0 {
            bail!("fast resend threshold must be at least 1");
        }
        if self.max_retransmissions < 2 {
            bail!("max_retransmissions {} would close the connection on the first resend", self.max_retransmissions);
        }
        Ok(())
    }

    /// The backing window's power-of-two exponent: strictly more capacity than
    ///  the configured window size, so resent duplicates have room.
    pub fn window_capacity_power(&self) -> u32 {
        (self.send_window_size + 1).next_power_of_two().trailing_zeros()
    }

    /// Upper bound for a unit's batched record bytes, derived from the MTU.
    pub fn unit_payload_limit(&self) -> usize {
        self.mtu - BATCH_HEADROOM
    }
}

fn env_override<T: FromStr>(key: &str, value: &mut T) -> anyhow::Result<()>
where
    <T as FromStr>::Err: std::error::Error + Send + Sync + 'static,
{
    if let Ok(raw) = std::env::var(key) {
        *value = raw.parse()
            .with_context(|| format!("invalid value {:?} for {}", raw, key))?;
    }
    Ok(())
}

fn env_override_millis(key: &str, value: &mut Duration) -> anyhow::Result<()> {
    let mut millis = value.as_millis() as u64;
    env_override(key, &mut millis)?;
    *value = Duration::from_millis(millis);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(ReliabilityConfig::default_ipv4().validate().is_ok());
    }

    #[rstest]
    #[case::window_128(128, 8)]
    #[case::window_127(127, 7)]
    #[case::window_1(1, 1)]
    #[case::window_100(100, 7)]
    fn test_window_capacity_power(#[case] send_window_size: u32, #[case] expected_power: u32) {
        let mut config = ReliabilityConfig::default_ipv4();
        config.send_window_size = send_window_size;
        assert_eq!(config.window_capacity_power(), expected_power);
    }

    #[rstest]
    #[case::tiny_mtu(|c: &mut ReliabilityConfig| c.mtu = 100)]
    #[case::zero_window(|c: &mut ReliabilityConfig| c.send_window_size = 0)]
    #[case::huge_window(|c: &mut ReliabilityConfig| c.send_window_size = 1 << 24)]
    #[case::inverted_rto_bounds(|c: &mut ReliabilityConfig| c.rto_min = Duration::from_secs(120))]
    #[case::zero_interval(|c: &mut ReliabilityConfig| c.rto_interval = Duration::ZERO)]
    #[case::zero_fast_resend(|c: &mut ReliabilityConfig| c.fast_resend_threshold = 0)]
    #[case::single_transmission(|c: &mut ReliabilityConfig| c.max_retransmissions = 1)]
    fn test_validate_rejects(#[case] break_config: fn(&mut ReliabilityConfig)) {
        let mut config = ReliabilityConfig::default_ipv4();
        break_config(&mut config);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("RAKNET_SND_WINDOW", "64");
        let config = ReliabilityConfig::from_env().unwrap();
        std::env::remove_var("RAKNET_SND_WINDOW");

        assert_eq!(config.send_window_size, 64);
        assert_eq!(config.max_ordering_loss, 10240);
    }
}
