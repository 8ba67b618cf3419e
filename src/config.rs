use rand::Rng;
use tokio::time::Duration;

/// Retransmission schedule parameters for confirmable messages (RFC 7252
/// section 4.8 names: ACK_TIMEOUT, ACK_RANDOM_FACTOR, MAX_RETRANSMIT).
#[derive(Debug, Clone, Copy)]
pub struct TransmissionParams {
    pub ack_timeout: Duration,
    pub ack_random_factor: f64,
    pub max_retransmit: u8,
}

impl Default for TransmissionParams {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(2),
            ack_random_factor: 1.5,
            max_retransmit: 4,
        }
    }
}

impl TransmissionParams {
    /// Jittered base timeout for one new transaction.
    pub fn initial_timeout(&self) -> Duration {
        if self.ack_random_factor <= 1.0 {
            return self.ack_timeout;
        }
        let factor = rand::thread_rng().gen_range(1.0..=self.ack_random_factor);
        self.ack_timeout.mul_f64(factor)
    }
}

#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub transmission: TransmissionParams,
    /// Entry cap of the duplicate-detector cache.
    pub duplicate_cache_size: usize,
    /// How long a received message id is remembered.
    pub duplicate_ttl: Duration,
    /// Window for a separate response after an empty ACK.
    pub delayed_timeout: Duration,
    /// Period of the retransmit/eviction tick.
    pub tick_period: Duration,
    /// Every n-th notification per relation is sent confirmable.
    pub force_con_every: u32,
    /// Per-remote cap on queued (not in-flight) transactions. None = unbounded.
    pub queue_limit: Option<usize>,
    /// Answer requests carrying unknown critical options with 4.02.
    pub critical_option_check: bool,
    /// When set, oversized notifications carry only the first block2 block.
    pub notification_block_size: Option<usize>,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            transmission: TransmissionParams::default(),
            duplicate_cache_size: 10_000,
            duplicate_ttl: Duration::from_secs(30),
            delayed_timeout: Duration::from_secs(120),
            tick_period: Duration::from_secs(1),
            force_con_every: 20,
            queue_limit: None,
            critical_option_check: true,
            notification_block_size: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_timeout_within_factor() {
        let params = TransmissionParams::default();
        for _ in 0..50 {
            let t = params.initial_timeout();
            assert!(t >= Duration::from_secs(2));
            assert!(t <= Duration::from_secs(3));
        }
    }

    #[test]
    fn initial_timeout_without_jitter() {
        let params = TransmissionParams {
            ack_random_factor: 1.0,
            ..Default::default()
        };
        assert_eq!(params.initial_timeout(), Duration::from_secs(2));
    }
}
