//! Aggregators behind the named statistics. Each statistic keeps one
//! windowed and one cumulative aggregator of the same shape.

use std::collections::{BTreeMap, HashSet};

use serde_json::{json, Value};
use tdigest::TDigest;

/// Exact set below this size, hyperloglog estimate above it.
const UNIQUES_EXACT_LIMIT: usize = 10_000;
/// Latency samples buffered before a digest merge.
const DIGEST_BATCH: usize = 4096;

#[derive(Debug)]
pub(crate) enum Agg {
    Latency(LatencyDigest),
    Codes(BTreeMap<u16, u64>),
    Uniques(Uniques),
    Peak(usize),
    Count(u64),
    Bytes(u64),
}

impl Agg {
    pub(crate) fn fresh(&self) -> Agg {
        match self {
            Agg::Latency(_) => Agg::Latency(LatencyDigest::default()),
            Agg::Codes(_) => Agg::Codes(BTreeMap::new()),
            Agg::Uniques(_) => Agg::Uniques(Uniques::default()),
            Agg::Peak(_) => Agg::Peak(0),
            Agg::Count(_) => Agg::Count(0),
            Agg::Bytes(_) => Agg::Bytes(0),
        }
    }

    pub(crate) fn snapshot(&mut self, percentiles: &[f64]) -> Value {
        match self {
            Agg::Latency(digest) => digest.snapshot(percentiles),
            Agg::Codes(codes) => json!(codes
                .iter()
                .map(|(code, count)| (code.to_string(), *count))
                .collect::<BTreeMap<_, _>>()),
            Agg::Uniques(uniques) => json!({ "count": uniques.count() }),
            Agg::Peak(peak) => json!(*peak),
            Agg::Count(count) => json!(*count),
            Agg::Bytes(bytes) => json!(*bytes),
        }
    }
}

/// Latency histogram: exact count/min/max/mean plus tdigest quantiles.
/// Samples are buffered and merged in batches.
#[derive(Debug, Default)]
pub(crate) struct LatencyDigest {
    digest: Option<TDigest>,
    buffer: Vec<f64>,
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
}

impl LatencyDigest {
    pub(crate) fn observe(&mut self, millis: f64) {
        if self.count == 0 {
            self.min = millis;
            self.max = millis;
        } else {
            self.min = self.min.min(millis);
            self.max = self.max.max(millis);
        }
        self.count += 1;
        self.sum += millis;
        self.buffer.push(millis);
        if self.buffer.len() >= DIGEST_BATCH {
            self.merge();
        }
    }

    fn merge(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let values = std::mem::take(&mut self.buffer);
        let digest = self.digest.take().unwrap_or_default();
        self.digest = Some(digest.merge_unsorted(values));
    }

    pub(crate) fn quantile(&mut self, q: f64) -> f64 {
        self.merge();
        match &self.digest {
            Some(digest) => digest.estimate_quantile(q),
            None => 0.0,
        }
    }

    pub(crate) fn count(&self) -> u64 {
        self.count
    }

    fn snapshot(&mut self, percentiles: &[f64]) -> Value {
        if self.count == 0 {
            return json!({ "count": 0 });
        }
        let quantiles: BTreeMap<String, f64> = percentiles
            .iter()
            .map(|&p| (format!("p{}", p * 100.0), self.quantile(p)))
            .collect();
        json!({
            "count": self.count,
            "min": self.min,
            "max": self.max,
            "mean": self.sum / self.count as f64,
            "percentiles": quantiles,
        })
    }
}

/// Distinct-fingerprint counter: exact while small, probabilistic once
/// the set outgrows [`UNIQUES_EXACT_LIMIT`].
#[derive(Debug)]
pub(crate) enum Uniques {
    Exact(HashSet<u64>),
    Estimated(HyperLogLog),
}

impl Default for Uniques {
    fn default() -> Self {
        Self::Exact(HashSet::new())
    }
}

impl Uniques {
    pub(crate) fn insert(&mut self, fingerprint: u64) {
        match self {
            Uniques::Exact(set) => {
                set.insert(fingerprint);
                if set.len() > UNIQUES_EXACT_LIMIT {
                    let mut hll = HyperLogLog::default();
                    for value in set.drain() {
                        hll.insert(value);
                    }
                    *self = Uniques::Estimated(hll);
                }
            }
            Uniques::Estimated(hll) => hll.insert(fingerprint),
        }
    }

    pub(crate) fn count(&self) -> u64 {
        match self {
            Uniques::Exact(set) => set.len() as u64,
            Uniques::Estimated(hll) => hll.estimate().round() as u64,
        }
    }
}

/// Fixed 2¹⁰-register hyperloglog over pre-hashed 64-bit values.
#[derive(Debug)]
pub(crate) struct HyperLogLog {
    registers: Vec<u8>,
}

const HLL_BITS: u32 = 10;
const HLL_REGISTERS: usize = 1 << HLL_BITS;

impl Default for HyperLogLog {
    fn default() -> Self {
        Self {
            registers: vec![0; HLL_REGISTERS],
        }
    }
}

impl HyperLogLog {
    pub(crate) fn insert(&mut self, hash: u64) {
        let index = (hash >> (64 - HLL_BITS)) as usize;
        let rest = hash << HLL_BITS;
        let rank = (rest.leading_zeros() + 1).min(64 - HLL_BITS + 1) as u8;
        if rank > self.registers[index] {
            self.registers[index] = rank;
        }
    }

    pub(crate) fn estimate(&self) -> f64 {
        let m = HLL_REGISTERS as f64;
        let alpha = 0.7213 / (1.0 + 1.079 / m);
        let sum: f64 = self
            .registers
            .iter()
            .map(|&r| 2f64.powi(-(r as i32)))
            .sum();
        let raw = alpha * m * m / sum;
        let zeros = self.registers.iter().filter(|&&r| r == 0).count();
        if raw <= 2.5 * m && zeros > 0 {
            // Small-range correction.
            m * (m / zeros as f64).ln()
        } else {
            raw
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latency_digest_tracks_basic_moments() {
        let mut digest = LatencyDigest::default();
        for v in 1..=100 {
            digest.observe(v as f64);
        }
        assert_eq!(digest.count(), 100);
        let snapshot = digest.snapshot(&[0.5]);
        assert_eq!(snapshot["min"], 1.0);
        assert_eq!(snapshot["max"], 100.0);
        assert_eq!(snapshot["mean"], 50.5);
        let p50 = snapshot["percentiles"]["p50"].as_f64().unwrap();
        assert!((p50 - 50.0).abs() <= 5.0, "p50 was {p50}");
    }

    #[test]
    fn empty_latency_snapshot_is_just_a_count() {
        let mut digest = LatencyDigest::default();
        assert_eq!(digest.snapshot(&[0.5, 0.99]), json!({ "count": 0 }));
    }

    #[test]
    fn uniques_are_exact_below_the_limit() {
        let mut uniques = Uniques::default();
        for fp in [1u64, 2, 3, 2, 1] {
            uniques.insert(fp);
        }
        assert_eq!(uniques.count(), 3);
    }

    #[test]
    fn uniques_degrade_to_an_estimate() {
        // splitmix64 gives well-mixed inputs, as real fingerprints are.
        fn splitmix64(mut x: u64) -> u64 {
            x = x.wrapping_add(0x9e3779b97f4a7c15);
            x = (x ^ (x >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
            x = (x ^ (x >> 27)).wrapping_mul(0x94d049bb133111eb);
            x ^ (x >> 31)
        }
        let mut uniques = Uniques::default();
        let n = 50_000u64;
        for i in 0..n {
            uniques.insert(splitmix64(i));
        }
        assert!(matches!(uniques, Uniques::Estimated(_)));
        let estimate = uniques.count() as f64;
        let error = (estimate - n as f64).abs() / n as f64;
        assert!(error < 0.1, "estimate {estimate} off by {error}");
    }
}
