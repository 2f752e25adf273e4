//! Windowed quantile summaries.

use std::fmt;

use crate::error::Error;
use crate::metrics::atree::Atree;
use crate::metrics::Accumulate;

/// Numeric sample types a [`Summary`] can digest.
pub trait Sample: Copy + PartialOrd {
    fn as_f64(self) -> f64;
}

macro_rules! impl_sample {
    ($($t:ty)*) => ($(
        impl Sample for $t {
            #[inline]
            fn as_f64(self) -> f64 {
                self as f64
            }
        }
    )*)
}
impl_sample!(i8 i16 i32 i64 isize u8 u16 u32 u64 usize f32 f64);

/// Online summary statistics over a stream of samples: running mean and
/// variance on every sample, plus min/p50/p90/p95/p99/p99.9/max tracked
/// through a window of recent samples.
///
/// Samples accumulate in a count-augmented search tree giving exact
/// windowed quantiles. When the window fills, each quantile estimate is
/// folded in with an exponentially weighted update
/// `p += (window_value - p) / total_samples` and the tree is cleared.
/// Readers observe a consistent snapshot only while the producer is
/// quiescent.
pub struct Summary<T> {
    name: String,
    units: String,
    window_size: i64,

    samples: Atree<T>,

    initialized: bool,
    min: f64,
    p50: f64,
    p90: f64,
    p95: f64,
    p99: f64,
    p999: f64,
    max: f64,

    total_samples: i64,
    mean: f64,
    squared_total: f64,
    variance: f64,
}

impl<T: Sample> Summary<T> {
    pub fn new(name: impl Into<String>, units: impl Into<String>, window_size: usize) -> Self {
        Self {
            name: name.into(),
            units: units.into(),
            window_size: window_size as i64,
            samples: Atree::new(),
            initialized: false,
            min: 0.0,
            p50: 0.0,
            p90: 0.0,
            p95: 0.0,
            p99: 0.0,
            p999: 0.0,
            max: 0.0,
            total_samples: 0,
            mean: 0.0,
            squared_total: 0.0,
            variance: 0.0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn units(&self) -> &str {
        &self.units
    }

    /// Record one sample.
    pub fn push(&mut self, value: T) {
        if self.samples.size() == self.window_size {
            self.flush();
        }
        self.samples.insert(value);
        self.total_samples += 1;

        let v = value.as_f64();
        let delta = v - self.mean;
        self.mean += delta / self.total_samples as f64;
        self.squared_total += v * v;
        self.variance = self.squared_total / self.total_samples as f64 - self.mean * self.mean;
    }

    /// Roll the current window into the quantile estimates and clear it.
    pub fn flush(&mut self) {
        if self.samples.size() == 0 {
            return;
        }
        let window = |p: f64| -> f64 {
            self.samples
                .find_percentile(p)
                .expect("window is non-empty")
                .as_f64()
        };
        if !self.initialized {
            self.min = window(0.0);
            self.p50 = window(50.0);
            self.p90 = window(90.0);
            self.p95 = window(95.0);
            self.p99 = window(99.0);
            self.p999 = window(99.9);
            self.max = window(100.0);
            self.initialized = true;
        } else {
            let n = self.total_samples as f64;
            self.min = self.min.min(window(0.0));
            self.p50 += (window(50.0) - self.p50) / n;
            self.p90 += (window(90.0) - self.p90) / n;
            self.p95 += (window(95.0) - self.p95) / n;
            self.p99 += (window(99.0) - self.p99) / n;
            self.p999 += (window(99.9) - self.p999) / n;
            self.max = self.max.max(window(100.0));
        }
        self.samples.clear();
    }

    pub fn min(&mut self) -> f64 {
        self.flush();
        self.min
    }

    pub fn p50(&mut self) -> f64 {
        self.flush();
        self.p50
    }

    pub fn p90(&mut self) -> f64 {
        self.flush();
        self.p90
    }

    pub fn p95(&mut self) -> f64 {
        self.flush();
        self.p95
    }

    pub fn p99(&mut self) -> f64 {
        self.flush();
        self.p99
    }

    pub fn p999(&mut self) -> f64 {
        self.flush();
        self.p999
    }

    pub fn max(&mut self) -> f64 {
        self.flush();
        self.max
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn stddev(&self) -> f64 {
        self.variance.sqrt()
    }

    pub fn num_samples(&self) -> i64 {
        self.total_samples
    }
}

impl<T: Sample> Accumulate for Summary<T> {
    /// Merge by sample-weighted average. The other summary should be
    /// flushed first so its window is reflected in its estimates.
    fn accumulate(&mut self, other: &Self) -> crate::Result<()> {
        if self.name != other.name {
            return Err(Error::FailedPrecondition(format!(
                "summary name does not match: {}",
                other.name
            )));
        }
        self.flush();

        let n = self.total_samples as f64;
        let m = other.total_samples as f64;
        if m == 0.0 {
            return Ok(());
        }
        let merge = |ours: f64, theirs: f64| ours + (theirs * m - ours * n) / (n + m);
        self.min = merge(self.min, other.min);
        self.p50 = merge(self.p50, other.p50);
        self.p90 = merge(self.p90, other.p90);
        self.p95 = merge(self.p95, other.p95);
        self.p99 = merge(self.p99, other.p99);
        self.p999 = merge(self.p999, other.p999);
        self.max = merge(self.max, other.max);
        self.mean = merge(self.mean, other.mean);
        self.variance = merge(self.variance, other.variance);
        self.total_samples += other.total_samples;
        Ok(())
    }
}

impl<T> fmt::Display for Summary<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "units: \"{}\", summary: {{mean: {}, stddev: {}, samples: {}}}, \
             percentiles: {{min: {}, p50: {}, p90: {}, p95: {}, p99: {}, p999: {}, max: {}}}",
            self.units,
            self.mean,
            self.variance.sqrt(),
            self.total_samples,
            self.min,
            self.p50,
            self.p90,
            self.p95,
            self.p99,
            self.p999,
            self.max
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;
    use rand_distr::Normal;

    #[test]
    fn mean_and_stddev_of_a_constant() {
        let mut s = Summary::<u64>::new("lat", "ns", 10);
        for _ in 0..100 {
            s.push(5);
        }
        assert_eq!(s.num_samples(), 100);
        assert!((s.mean() - 5.0).abs() < 1e-9);
        assert!(s.stddev() < 1e-6);
        assert_eq!(s.p50(), 5.0);
    }

    #[test]
    fn quantiles_of_a_uniform_ramp() {
        let mut s = Summary::<i64>::new("lat", "ns", 1000);
        for v in 1..=1000i64 {
            s.push(v);
        }
        assert_eq!(s.min(), 1.0);
        assert!((s.p50() - 500.0).abs() <= 1.0);
        assert!((s.p90() - 900.0).abs() <= 1.0);
        assert!((s.p99() - 990.0).abs() <= 1.0);
        assert_eq!(s.max(), 1000.0);
    }

    #[test]
    fn windowed_normal_quantiles_converge() {
        let mut s = Summary::<i64>::new("lat", "ns", 1000);
        let normal = Normal::new(1000.0, 15.0).unwrap();
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _ in 0..500_000 {
            s.push(normal.sample(&mut rng).round() as i64);
        }
        assert!((s.mean() - 1000.0).abs() < 1.0);
        assert!((s.stddev() - 15.0).abs() < 1.0);
        assert!((s.p50() - 1000.0).abs() <= 2.0);
        // z(0.90) = 1.2816, z(0.95) = 1.6449, z(0.99) = 2.3263.
        assert!((s.p90() - (1000.0 + 1.2816 * 15.0)).abs() <= 3.0);
        assert!((s.p95() - (1000.0 + 1.6449 * 15.0)).abs() <= 3.0);
        assert!((s.p99() - (1000.0 + 2.3263 * 15.0)).abs() <= 4.0);
    }

    #[test]
    fn accumulate_weights_by_sample_count() {
        let mut a = Summary::<u64>::new("lat", "ns", 100);
        let mut b = Summary::<u64>::new("lat", "ns", 100);
        for _ in 0..100 {
            a.push(10);
            b.push(20);
        }
        b.flush();
        a.accumulate(&b).unwrap();
        assert_eq!(a.num_samples(), 200);
        assert!((a.mean() - 15.0).abs() < 1e-9);
        assert!((a.p50() - 15.0).abs() < 1e-9);
    }

    #[test]
    fn accumulate_rejects_mismatched_names() {
        let mut a = Summary::<u64>::new("lat", "ns", 10);
        let b = Summary::<u64>::new("qps", "ops/s", 10);
        assert!(a.accumulate(&b).is_err());
    }
}
