//! Packet counters and handling-latency histogram

use std::sync::atomic::{AtomicU64, Ordering};

use crate::verdict::Verdict;

/// Global per-verdict packet counters (cache-line aligned).
#[repr(C, align(64))]
#[derive(Debug, Default)]
pub struct PacketCounters {
    accepted: AtomicU64,
    blocked: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
}

impl PacketCounters {
    /// Count one applied verdict.
    ///
    /// Reroute verdicts count as accepted: the packet passes, just
    /// toward a local listener.
    #[inline(always)]
    pub fn record(&self, verdict: Verdict) {
        let counter = match verdict {
            Verdict::Accept | Verdict::RerouteToNameserver | Verdict::RerouteToTunnel => {
                &self.accepted
            }
            Verdict::Block => &self.blocked,
            Verdict::Drop | Verdict::Undecided => &self.dropped,
            Verdict::Failed => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a failed sink write.
    #[inline(always)]
    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Current values without resetting.
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            blocked: self.blocked.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    /// Read and reset, used by the periodic stat line.
    pub fn snapshot_and_reset(&self) -> CounterSnapshot {
        CounterSnapshot {
            accepted: self.accepted.swap(0, Ordering::Relaxed),
            blocked: self.blocked.swap(0, Ordering::Relaxed),
            dropped: self.dropped.swap(0, Ordering::Relaxed),
            failed: self.failed.swap(0, Ordering::Relaxed),
        }
    }
}

/// Counter values at one point in time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    /// Packets accepted (including reroutes)
    pub accepted: u64,
    /// Packets blocked
    pub blocked: u64,
    /// Packets dropped
    pub dropped: u64,
    /// Packets that failed decision or sink
    pub failed: u64,
}

impl CounterSnapshot {
    /// Sum of all four counters.
    pub fn total(&self) -> u64 {
        self.accepted + self.blocked + self.dropped + self.failed
    }
}

/// Lock-free histogram of per-packet handling latency
#[derive(Debug)]
pub struct LatencyHistogram {
    /// Buckets: 0-10μs, 10-50μs, 50-100μs, 100-500μs, 0.5-1ms, 1-5ms, 5-10ms, >10ms
    buckets: [AtomicU64; 8],
    count: AtomicU64,
    sum_us: AtomicU64,
    max_us: AtomicU64,
}

const BUCKET_LIMITS_US: [u64; 8] = [10, 50, 100, 500, 1_000, 5_000, 10_000, 100_000];

impl LatencyHistogram {
    /// Empty histogram.
    pub const fn new() -> Self {
        Self {
            buckets: [
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
            ],
            count: AtomicU64::new(0),
            sum_us: AtomicU64::new(0),
            max_us: AtomicU64::new(0),
        }
    }

    /// Record one handling duration in microseconds.
    #[inline(always)]
    pub fn record(&self, latency_us: u64) {
        let bucket = match latency_us {
            0..=10 => 0,
            11..=50 => 1,
            51..=100 => 2,
            101..=500 => 3,
            501..=1_000 => 4,
            1_001..=5_000 => 5,
            5_001..=10_000 => 6,
            _ => 7,
        };

        self.buckets[bucket].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_us.fetch_add(latency_us, Ordering::Relaxed);

        loop {
            let current = self.max_us.load(Ordering::Relaxed);
            if latency_us <= current {
                break;
            }
            if self
                .max_us
                .compare_exchange_weak(current, latency_us, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }

    /// Number of recorded samples.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Average latency in microseconds.
    pub fn average(&self) -> f64 {
        let count = self.count.load(Ordering::Relaxed);
        if count == 0 {
            return 0.0;
        }
        self.sum_us.load(Ordering::Relaxed) as f64 / count as f64
    }

    /// Approximate percentile, resolved to bucket upper bounds.
    pub fn percentile(&self, p: f64) -> u64 {
        let target = ((self.count.load(Ordering::Relaxed) as f64) * p) as u64;
        let mut cumulative = 0u64;
        for (i, bucket) in self.buckets.iter().enumerate() {
            cumulative += bucket.load(Ordering::Relaxed);
            if cumulative >= target {
                return BUCKET_LIMITS_US[i];
            }
        }
        BUCKET_LIMITS_US[7]
    }

    /// Maximum recorded latency in microseconds.
    pub fn max(&self) -> u64 {
        self.max_us.load(Ordering::Relaxed)
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Stats block owned by the core
#[derive(Debug, Default)]
pub struct Stats {
    /// Per-verdict counters
    pub counters: PacketCounters,
    /// Per-packet handling latency
    pub latency: LatencyHistogram,
}

impl Stats {
    /// Emit the periodic stat line and reset the counters.
    pub(crate) fn log_stat_line(&self) {
        let s = self.counters.snapshot_and_reset();
        tracing::info!(
            accepted = s.accepted,
            blocked = s.blocked,
            dropped = s.dropped,
            failed = s.failed,
            "filter: packets accepted {}, blocked {}, dropped {}, failed {}",
            s.accepted,
            s.blocked,
            s.dropped,
            s.failed,
        );
    }
}
