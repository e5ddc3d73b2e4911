//! Bounded log-linear latency histogram.
//!
//! Each power-of-two range `[2^e, 2^(e+1))` is split into [`SUB_BUCKETS`]
//! equal-width buckets, so a quantile estimate is off by at most half a
//! bucket width (about 3% of the value). Values below 1 share bucket 0 and
//! values at or past `2^(MAX_EXPONENT+1)` share the last bucket. Memory is
//! fixed regardless of how many samples are recorded.

use serde::Serialize;

const SUB_BUCKETS: usize = 16;
const MAX_EXPONENT: usize = 40;
const BUCKETS: usize = 1 + (MAX_EXPONENT + 1) * SUB_BUCKETS;

/// Summary of recorded latencies, in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LatencyStats {
    pub samples: u64,
    pub min_us: f64,
    pub max_us: f64,
    pub mean_us: f64,
    /// Approximate median.
    pub p50_us: f64,
    /// Approximate 95th percentile.
    pub p95_us: f64,
}

#[derive(Debug, Clone)]
pub struct LatencyHistogram {
    counts: Vec<u64>,
    samples: u64,
    sum: f64,
    min: f64,
    max: f64,
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

impl LatencyHistogram {
    pub fn new() -> Self {
        Self {
            counts: vec![0; BUCKETS],
            samples: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    /// Record one sample. Negative and non-finite values are ignored.
    pub fn record(&mut self, value_us: f64) -> bool {
        if !value_us.is_finite() || value_us < 0.0 {
            return false;
        }
        self.counts[bucket_index(value_us)] += 1;
        self.samples += 1;
        self.sum += value_us;
        self.min = self.min.min(value_us);
        self.max = self.max.max(value_us);
        true
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }

    /// Estimate the `q` quantile (`0.0..=1.0`), clamped to the observed range.
    pub fn quantile(&self, q: f64) -> Option<f64> {
        if self.samples == 0 {
            return None;
        }
        let rank = ((q.clamp(0.0, 1.0) * self.samples as f64).ceil() as u64).max(1);
        let mut seen = 0u64;
        for (index, count) in self.counts.iter().enumerate() {
            seen += count;
            if seen >= rank {
                let (lo, hi) = bucket_bounds(index);
                return Some(((lo + hi) / 2.0).clamp(self.min, self.max));
            }
        }
        Some(self.max)
    }

    pub fn stats(&self) -> Option<LatencyStats> {
        Some(LatencyStats {
            samples: self.samples,
            min_us: self.min,
            max_us: self.max,
            mean_us: self.sum / self.samples as f64,
            p50_us: self.quantile(0.50)?,
            p95_us: self.quantile(0.95)?,
        })
    }
}

fn bucket_index(value: f64) -> usize {
    if value < 1.0 {
        return 0;
    }
    let exponent = value.log2().floor() as usize;
    if exponent > MAX_EXPONENT {
        return BUCKETS - 1;
    }
    let base = (exponent as f64).exp2();
    let sub = (((value / base) - 1.0) * SUB_BUCKETS as f64) as usize;
    1 + exponent * SUB_BUCKETS + sub.min(SUB_BUCKETS - 1)
}

fn bucket_bounds(index: usize) -> (f64, f64) {
    if index == 0 {
        return (0.0, 1.0);
    }
    let exponent = (index - 1) / SUB_BUCKETS;
    let sub = ((index - 1) % SUB_BUCKETS) as f64;
    let base = (exponent as f64).exp2();
    let width = base / SUB_BUCKETS as f64;
    (base + sub * width, base + (sub + 1.0) * width)
}
