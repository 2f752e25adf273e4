//! TSC-based timing.

use std::fmt;
use std::time::Duration;

/// All of these are KHz.
const TSC_FREQ_KHZ_PATH: &str = "/sys/devices/system/cpu/cpu0/tsc_freq_khz";
const BASE_FREQ_PATH: &str = "/sys/devices/system/cpu/cpu0/cpufreq/base_frequency";
const DEFAULT_CPU_FREQ_KHZ: u64 = 2_300_000;

#[cfg(target_arch = "x86_64")]
#[inline]
fn rdtscp() -> u64 {
    let mut aux = 0u32;
    unsafe { core::arch::x86_64::__rdtscp(&mut aux) }
}

/// Targets without a TSC synthesize cycle counts from the monotonic
/// clock at the calibrated frequency, keeping the arithmetic identical.
#[cfg(not(target_arch = "x86_64"))]
#[inline]
fn rdtscp() -> u64 {
    use std::sync::OnceLock;
    use std::time::Instant;
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = *EPOCH.get_or_init(Instant::now);
    let nanos = epoch.elapsed().as_nanos() as f64;
    (nanos * khz_to_ghz(tsc_freq_khz())) as u64
}

#[inline]
fn khz_to_ghz(khz: u64) -> f64 {
    khz as f64 / 1e6
}

fn read_khz(path: &str) -> Option<u64> {
    std::fs::read_to_string(path)
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
}

/// Discover the TSC frequency: `tsc_freq_khz` if the kernel exposes it,
/// else the base CPU frequency, else a compile-time default.
fn tsc_freq_khz() -> u64 {
    use std::sync::OnceLock;
    static KHZ: OnceLock<u64> = OnceLock::new();
    *KHZ.get_or_init(|| {
        if let Some(khz) = read_khz(TSC_FREQ_KHZ_PATH) {
            log::info!("loading tsc_freq from tsc_freq_khz: {}", khz);
            khz
        } else if let Some(khz) = read_khz(BASE_FREQ_PATH) {
            log::info!("loading tsc_freq from base_frequency: {}", khz);
            khz
        } else {
            log::warn!(
                "could not determine CPU frequency, using compile-time value: {} KHz \
                 [results may be inaccurate]",
                DEFAULT_CPU_FREQ_KHZ
            );
            DEFAULT_CPU_FREQ_KHZ
        }
    })
}

/// A measured period of time, closed at construction.
#[derive(Debug, Clone, Copy)]
pub struct Split {
    tsc_freq_khz: u64,
    start: u64,
    end: u64,
}

impl Split {
    fn ending_now(tsc_freq_khz: u64, start: u64) -> Self {
        Self {
            tsc_freq_khz,
            start,
            end: rdtscp(),
        }
    }

    pub fn runtime(&self) -> Duration {
        let cycles = self.end.saturating_sub(self.start);
        Duration::from_nanos((cycles as f64 / khz_to_ghz(self.tsc_freq_khz)) as u64)
    }
}

/// TSC-based stopwatch.
///
/// `get_split` measures from the stopwatch's start; `get_lap` measures
/// from the last lap and advances it; `get_lap_split` measures from the
/// last lap without advancing.
pub struct Stopwatch {
    name: String,
    tsc_freq_khz: u64,
    start: u64,
    end: u64,
    lap: u64,
}

impl Stopwatch {
    /// Calibrate the frequency and start the watch.
    pub fn start(name: impl Into<String>) -> Self {
        let tsc_freq_khz = tsc_freq_khz();
        let start = rdtscp();
        Self {
            name: name.into(),
            tsc_freq_khz,
            start,
            end: 0,
            lap: start,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Time since the stopwatch started.
    pub fn get_split(&self) -> Split {
        Split::ending_now(self.tsc_freq_khz, self.start)
    }

    /// Time since the last lap; advances the lap marker.
    pub fn get_lap(&mut self) -> Split {
        let split = Split::ending_now(self.tsc_freq_khz, self.lap);
        self.lap = rdtscp();
        split
    }

    /// Time since the last lap without advancing it.
    pub fn get_lap_split(&self) -> Split {
        Split::ending_now(self.tsc_freq_khz, self.lap)
    }

    /// Freeze the total runtime. Splits keep working afterwards.
    pub fn stop(&mut self) {
        self.end = rdtscp();
    }

    /// Total measured runtime; valid after [`Stopwatch::stop`].
    pub fn runtime(&self) -> Duration {
        Split {
            tsc_freq_khz: self.tsc_freq_khz,
            start: self.start,
            end: self.end,
        }
        .runtime()
    }
}

impl fmt::Display for Stopwatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "runtime: {} ns", self.runtime().as_nanos())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_covers_a_sleep() {
        let mut watch = Stopwatch::start("test");
        std::thread::sleep(Duration::from_millis(10));
        watch.stop();
        assert!(watch.runtime() >= Duration::from_millis(10));
        // Allow wild scheduling noise but catch unit mistakes.
        assert!(watch.runtime() < Duration::from_secs(5));
    }

    #[test]
    fn runtime_scales_with_sleeps() {
        let mut a = Stopwatch::start("a");
        std::thread::sleep(Duration::from_millis(5));
        a.stop();

        let mut b = Stopwatch::start("b");
        std::thread::sleep(Duration::from_millis(25));
        b.stop();

        assert!(b.runtime() > a.runtime());
        assert!(b.runtime() - a.runtime() >= Duration::from_millis(10));
    }

    #[test]
    fn laps_advance_while_lap_splits_do_not() {
        let mut watch = Stopwatch::start("laps");
        std::thread::sleep(Duration::from_millis(5));

        let peek = watch.get_lap_split().runtime();
        let lap = watch.get_lap().runtime();
        assert!(lap >= peek);

        // The lap marker moved, so the next lap split restarts near zero.
        let after = watch.get_lap_split().runtime();
        assert!(after < lap);
    }

    #[test]
    fn split_is_monotonic_with_the_watch() {
        let watch = Stopwatch::start("split");
        let first = watch.get_split().runtime();
        std::thread::sleep(Duration::from_millis(2));
        let second = watch.get_split().runtime();
        assert!(second > first);
    }
}
