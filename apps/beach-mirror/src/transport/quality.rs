use parking_lot::Mutex;

const LATENCY_SMOOTHING: f64 = 0.25;
const OFFSET_SMOOTHING: f64 = 0.25;

#[derive(Debug, Default, Clone, Copy)]
struct Estimates {
    latency_ms: Option<f64>,
    clock_offset_ms: Option<f64>,
}

/// Round-trip latency and remote clock offset of one connection, fed by
/// heartbeat round trips.
#[derive(Debug, Default)]
pub struct ConnectionQuality {
    estimates: Mutex<Estimates>,
}

impl ConnectionQuality {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exponential moving average of the round trip time.
    pub fn record_round_trip(&self, rtt_ms: f64) {
        let mut estimates = self.estimates.lock();
        estimates.latency_ms = Some(match estimates.latency_ms {
            Some(previous) => previous + (rtt_ms - previous) * LATENCY_SMOOTHING,
            None => rtt_ms,
        });
    }

    /// Folds in one clock sample: the peer reported `remote_ms` while the
    /// request was in flight between `sent_ms` and `received_ms` (local clock).
    pub fn record_clock_sample(&self, remote_ms: u64, sent_ms: u64, received_ms: u64) {
        let midpoint = sent_ms as f64 + (received_ms.saturating_sub(sent_ms) as f64) / 2.0;
        let sample = remote_ms as f64 - midpoint;
        let mut estimates = self.estimates.lock();
        estimates.clock_offset_ms = Some(match estimates.clock_offset_ms {
            Some(previous) => previous + (sample - previous) * OFFSET_SMOOTHING,
            None => sample,
        });
    }

    pub fn latency_ms(&self) -> Option<f64> {
        self.estimates.lock().latency_ms
    }

    /// Positive when the peer's clock runs ahead of ours.
    pub fn clock_offset_ms(&self) -> Option<f64> {
        self.estimates.lock().clock_offset_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn latency_moves_toward_new_samples() {
        let quality = ConnectionQuality::new();
        assert_eq!(quality.latency_ms(), None);
        quality.record_round_trip(100.0);
        assert_eq!(quality.latency_ms(), Some(100.0));
        quality.record_round_trip(200.0);
        assert_eq!(quality.latency_ms(), Some(125.0));
    }

    #[test_timeout::timeout]
    fn clock_offset_uses_round_trip_midpoint() {
        let quality = ConnectionQuality::new();
        quality.record_clock_sample(10_550, 1_000, 1_100);
        assert_eq!(quality.clock_offset_ms(), Some(9_500.0));
    }
}
