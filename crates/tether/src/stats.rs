/// Sliding byte-rate estimator: the accumulator decays linearly by however
/// far the clock has moved past the window, so the value approximates
/// "bytes over the last `window_ms`" without per-sample history.
#[derive(Debug, Clone, Copy)]
pub struct RateEstimator {
    window_ms: i64,
    time: i64,
    bytes: i64,
}

impl RateEstimator {
    pub fn new(window_ms: u32) -> Self {
        Self {
            window_ms: window_ms as i64,
            time: 0,
            bytes: 0,
        }
    }

    pub fn update(&mut self, time_ms: u32, size: usize) {
        let time = time_ms as i64;
        if time - self.time > self.window_ms {
            self.bytes -= self.bytes * (time - self.time - self.window_ms) / self.window_ms;
            if self.bytes < 0 {
                self.bytes = 0;
            }
        }
        self.time = time - self.window_ms;
        self.bytes += size as i64;
    }

    /// Bytes accumulated over the current window.
    pub fn value(&self) -> u32 {
        self.bytes.max(0) as u32
    }

    pub fn reset(&mut self) {
        self.time = 0;
        self.bytes = 0;
    }
}

/// Windowed packet-loss ratio, decayed the same way as [`RateEstimator`].
#[derive(Debug, Clone, Copy)]
pub struct LossEstimator {
    window_ms: i64,
    time: i64,
    received: f32,
    dropped: f32,
}

impl LossEstimator {
    pub fn new(window_ms: u32) -> Self {
        Self {
            window_ms: window_ms as i64,
            time: 0,
            received: 0.0,
            dropped: 0.0,
        }
    }

    pub fn update(&mut self, time_ms: u32, num_received: u32, num_dropped: u32) {
        let time = time_ms as i64;
        if time - self.time > self.window_ms {
            let scale = (time - self.time - self.window_ms) as f32 / self.window_ms as f32;
            self.received = (self.received - self.received * scale).max(0.0);
            self.dropped = (self.dropped - self.dropped * scale).max(0.0);
        }
        self.time = time - self.window_ms;
        self.received += num_received as f32;
        self.dropped += num_dropped as f32;
    }

    /// Loss percentage over the window, 0 when no traffic was seen.
    pub fn percent(&self) -> f32 {
        let total = self.received + self.dropped;
        if total > 0.0 {
            self.dropped * 100.0 / total
        } else {
            0.0
        }
    }

    pub fn reset(&mut self) {
        self.time = 0;
        self.received = 0.0;
        self.dropped = 0.0;
    }
}

#[derive(Debug, Clone, Default)]
pub struct NetworkStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_lost: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub rtt_ms: f32,
    pub packet_loss_percent: f32,
}

/// Drops a fraction of outgoing datagrams before they reach the socket, for
/// exercising the loss accounting without a real lossy link.
#[derive(Debug, Clone, Default)]
pub struct PacketLossSimulation {
    pub enabled: bool,
    pub loss_percent: f32,
}

impl PacketLossSimulation {
    pub fn should_drop(&self) -> bool {
        if !self.enabled || self.loss_percent <= 0.0 {
            return false;
        }
        rand_percent() * 100.0 < self.loss_percent
    }
}

pub fn rand_percent() -> f32 {
    (rand_u64() % 10000) as f32 / 10000.0
}

pub fn rand_u64() -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let state = RandomState::new();
    let mut hasher = state.build_hasher();
    hasher.write_u64(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos() as u64,
    );
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_estimator_bounded() {
        let mut rate = RateEstimator::new(1000);
        // 100 bytes every 10 ms for 10 simulated seconds
        for tick in 0..1000u32 {
            rate.update(tick * 10, 100);
        }
        // steady state stays in the region of 100 bytes * 100 ticks/sec
        assert!(rate.value() <= 10_000 + 1_000, "rate {}", rate.value());
        assert!(rate.value() > 5_000, "rate {}", rate.value());
    }

    #[test]
    fn test_rate_estimator_decays_when_idle() {
        let mut rate = RateEstimator::new(1000);
        rate.update(0, 1000);
        let busy = rate.value();
        rate.update(10_000, 0);
        assert!(rate.value() < busy / 10);
    }

    #[test]
    fn test_loss_estimator_percent() {
        let mut loss = LossEstimator::new(5000);
        loss.update(0, 3, 1);
        assert_eq!(loss.percent(), 25.0);
    }

    #[test]
    fn test_loss_estimator_idle_is_zero() {
        let loss = LossEstimator::new(5000);
        assert_eq!(loss.percent(), 0.0);
    }

    #[test]
    fn test_loss_simulation_disabled_never_drops() {
        let sim = PacketLossSimulation::default();
        assert!(!sim.should_drop());

        let sim = PacketLossSimulation {
            enabled: true,
            loss_percent: 100.0,
        };
        assert!(sim.should_drop());
    }
}
