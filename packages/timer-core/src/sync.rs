//! SYNC — NTP-style clock synchronizer.
//!
//! Collects four-timestamp samples from a ping/pong exchange with a peer
//! device, filters by round-trip time, and maintains a running median
//! offset between the two monotonic clocks with a MAD-based uncertainty
//! bound.

use std::collections::VecDeque;

use crate::clock::now_nanos;

const SAMPLE_WINDOW: usize = 100;
const MIN_READY_SAMPLES: usize = 10;

/// One NTP-style four-timestamp exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSample {
    pub t1: i64,
    pub t2: i64,
    pub t3: i64,
    pub t4: i64,
    pub rtt: i64,
    pub offset: i64,
}

impl SyncSample {
    /// Builds a sample from the raw exchange, rejecting malformed input.
    /// `t3 < t2` or `t4 < t1` would mean the responder's clock ran
    /// backwards within the exchange or the pong predates the ping —
    /// both are treated as unusable and rejected silently by the caller.
    fn new(t1: i64, t2: i64, t3: i64, t4: i64) -> Option<Self> {
        if t4 < t1 || t3 < t2 {
            return None;
        }
        let rtt = (t4 - t1) - (t3 - t2);
        let offset = ((t2 - t1) + (t3 - t4)) / 2;
        Some(Self { t1, t2, t3, t4, rtt, offset })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quality {
    Excellent,
    Good,
    Ok,
    Poor,
}

impl Quality {
    fn from_uncertainty_ms(ms: f64) -> Self {
        if ms <= 3.0 {
            Quality::Excellent
        } else if ms <= 5.0 {
            Quality::Good
        } else if ms <= 10.0 {
            Quality::Ok
        } else {
            Quality::Poor
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncStatus {
    pub offset_nanos: i64,
    pub uncertainty_ms: f64,
    pub sample_count: usize,
    pub quality: Quality,
    pub is_ready: bool,
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self {
            offset_nanos: 0,
            uncertainty_ms: 999.0,
            sample_count: 0,
            quality: Quality::Poor,
            is_ready: false,
        }
    }
}

pub struct Sync {
    samples: VecDeque<SyncSample>,
    status: SyncStatus,
}

impl Default for Sync {
    fn default() -> Self {
        Self::new()
    }
}

impl Sync {
    pub fn new() -> Self {
        Self { samples: VecDeque::with_capacity(SAMPLE_WINDOW), status: SyncStatus::default() }
    }

    /// Monotonic nanosecond clock, exposed so callers timestamp their side
    /// of the ping/pong exchange with the same clock SYNC itself uses.
    pub fn now_nanos(&self) -> i64 {
        now_nanos()
    }

    /// Responder side of one ping/pong round. `t2` is captured on entry,
    /// `t3` immediately before return, so the responder's own processing
    /// time is excluded from the measured offset as closely as possible.
    pub fn handle_ping(&self, _t1: i64) -> (i64, i64) {
        let t2 = now_nanos();
        let t3 = now_nanos();
        (t2, t3)
    }

    /// Initiator side: called once the pong has arrived and `t4` has been
    /// captured. Malformed input is rejected silently — counters do not
    /// advance.
    pub fn add_sample(&mut self, t1: i64, t2: i64, t3: i64, t4: i64) {
        let Some(sample) = SyncSample::new(t1, t2, t3, t4) else {
            return;
        };
        if self.samples.len() == SAMPLE_WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
        self.recompute();
    }

    pub fn status(&self) -> SyncStatus {
        self.status
    }

    pub fn reset(&mut self) {
        self.samples.clear();
        self.status = SyncStatus::default();
    }

    /// `remoteNanos - offsetNanos`, per the `remote ≈ local + offset` sign
    /// convention.
    pub fn convert_remote_to_local(&self, remote_nanos: i64, offset_nanos: i64) -> i64 {
        remote_nanos - offset_nanos
    }

    fn recompute(&mut self) {
        let n = self.samples.len();
        self.status.sample_count = n;
        self.status.is_ready = n >= MIN_READY_SAMPLES;
        if !self.status.is_ready {
            self.status.offset_nanos = 0;
            self.status.uncertainty_ms = 999.0;
            self.status.quality = Quality::Poor;
            return;
        }

        let mut by_rtt: Vec<SyncSample> = self.samples.iter().copied().collect();
        by_rtt.sort_by_key(|s| s.rtt);
        let keep = (MIN_READY_SAMPLES).max(((n as f64) * 0.30).ceil() as usize).min(n);
        let best = &by_rtt[..keep];

        let offsets: Vec<i64> = best.iter().map(|s| s.offset).collect();
        let rtts: Vec<i64> = best.iter().map(|s| s.rtt).collect();
        let median_offset = median_i64(&offsets);
        let median_rtt = median_i64(&rtts);
        let deviations: Vec<i64> = offsets.iter().map(|o| (o - median_offset).abs()).collect();
        let mad = median_i64(&deviations) as f64;

        let uncertainty_ms = (mad + (median_rtt as f64) / 2.0) / 1e6;

        self.status.offset_nanos = median_offset;
        self.status.uncertainty_ms = uncertainty_ms;
        self.status.quality = Quality::from_uncertainty_ms(uncertainty_ms);
    }
}

/// Median of an i64 slice via a sorted copy; for even lengths, the lower
/// of the two middle elements (avoids introducing a non-integer offset).
fn median_i64(values: &[i64]) -> i64 {
    let mut v = values.to_vec();
    v.sort_unstable();
    v[v.len() / 2]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_ready_below_ten_samples() {
        let mut s = Sync::new();
        for i in 0..9 {
            let base = i * 1_000_000;
            s.add_sample(base, base + 100, base + 110, base + 200);
        }
        let st = s.status();
        assert!(!st.is_ready);
        assert_eq!(st.offset_nanos, 0);
        assert_eq!(st.uncertainty_ms, 999.0);
        assert_eq!(st.quality, Quality::Poor);
    }

    #[test]
    fn ntp_offset_scenario() {
        // Device A's clock is 1_000_000 ns ahead of device B's; RTT uniform
        // at 20ms split evenly each way.
        let mut s = Sync::new();
        let true_offset = 1_000_000i64;
        let one_way = 10_000_000i64; // 10ms
        for i in 0..20 {
            let t1 = i * 50_000_000;
            let t2 = t1 + true_offset + one_way;
            let t3 = t2 + 1; // negligible responder processing time
            let t4 = t1 + 2 * one_way;
            s.add_sample(t1, t2, t3, t4);
        }
        let st = s.status();
        assert!(st.is_ready);
        assert!((st.offset_nanos - true_offset).abs() < 1_000);
        assert!((st.uncertainty_ms - 10.0).abs() < 1.0);
        assert_eq!(st.quality, Quality::Ok);
    }

    #[test]
    fn malformed_samples_rejected_silently() {
        let mut s = Sync::new();
        s.add_sample(100, 50, 60, 200); // t3 < t2
        s.add_sample(200, 210, 220, 100); // t4 < t1
        assert_eq!(s.status().sample_count, 0);
    }

    #[test]
    fn convert_round_trip() {
        let s = Sync::new();
        let local = 123_456_789i64;
        let offset = -42_000i64;
        let remote = local + offset;
        assert_eq!(s.convert_remote_to_local(remote, offset), local);
    }
}
