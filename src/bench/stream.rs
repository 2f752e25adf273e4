//! Lazy, composable operation streams.

use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::Zipf;

use crate::error::{Error, Result};

/// A stream of operations for driving a workload.
///
/// `next` yields the next element or [`Error::StreamTerminated`] once
/// the stream is exhausted; after `terminate` every call yields
/// [`Error::StreamTerminated`].
pub trait Stream<T> {
    fn next(&mut self) -> Result<T>;
    fn terminate(&mut self);
}

/// Yields a fixed vector of values, then terminates.
pub struct TestStream<T> {
    output: std::vec::IntoIter<T>,
    terminated: bool,
}

impl<T> TestStream<T> {
    pub fn new(input: Vec<T>) -> Self {
        Self {
            output: input.into_iter(),
            terminated: false,
        }
    }
}

impl<T> Stream<T> for TestStream<T> {
    fn next(&mut self) -> Result<T> {
        if self.terminated {
            return Err(Error::StreamTerminated);
        }
        self.output.next().ok_or(Error::StreamTerminated)
    }

    fn terminate(&mut self) {
        self.terminated = true;
    }
}

/// An infinite stream drawing from a distribution with an entropy-seeded
/// deterministic generator.
pub struct RandomDistributionStream<D, T>
where
    D: Distribution<T>,
{
    rng: StdRng,
    distribution: D,
    terminated: bool,
    _marker: std::marker::PhantomData<T>,
}

impl<D, T> RandomDistributionStream<D, T>
where
    D: Distribution<T>,
{
    pub fn new(distribution: D) -> Self {
        Self {
            rng: StdRng::from_entropy(),
            distribution,
            terminated: false,
            _marker: std::marker::PhantomData,
        }
    }
}

impl<D, T> Stream<T> for RandomDistributionStream<D, T>
where
    D: Distribution<T>,
{
    fn next(&mut self) -> Result<T> {
        if self.terminated {
            return Err(Error::StreamTerminated);
        }
        Ok(self.distribution.sample(&mut self.rng))
    }

    fn terminate(&mut self) {
        self.terminated = true;
    }
}

/// Uniform integers in `[lo, hi]`.
pub fn uniform_int_stream(lo: i64, hi: i64) -> RandomDistributionStream<Uniform<i64>, i64> {
    RandomDistributionStream::new(Uniform::new_inclusive(lo, hi))
}

/// Uniform doubles in `[lo, hi)`.
pub fn uniform_double_stream(lo: f64, hi: f64) -> RandomDistributionStream<Uniform<f64>, f64> {
    RandomDistributionStream::new(Uniform::new(lo, hi))
}

/// Picks among `choices` with relative frequencies given by `weights`.
///
/// Resolution goes through an expanded vector holding each choice as
/// many times as its weight, indexed uniformly.
pub struct WeightedStream<E> {
    output: Vec<E>,
    index: Uniform<usize>,
    rng: StdRng,
    terminated: bool,
}

impl<E: Copy> WeightedStream<E> {
    pub fn new(choices: &[E], weights: &[u32]) -> Self {
        assert_eq!(
            choices.len(),
            weights.len(),
            "each choice needs exactly one weight"
        );
        let mut output = Vec::with_capacity(weights.iter().map(|&w| w as usize).sum());
        for (choice, &weight) in choices.iter().zip(weights) {
            for _ in 0..weight {
                output.push(*choice);
            }
        }
        assert!(!output.is_empty(), "at least one weight must be non-zero");
        Self {
            index: Uniform::new(0, output.len()),
            output,
            rng: StdRng::from_entropy(),
            terminated: false,
        }
    }
}

impl<E: Copy> Stream<E> for WeightedStream<E> {
    fn next(&mut self) -> Result<E> {
        if self.terminated {
            return Err(Error::StreamTerminated);
        }
        Ok(self.output[self.index.sample(&mut self.rng)])
    }

    fn terminate(&mut self) {
        self.terminated = true;
    }
}

/// `init, init + step, init + 2*step, …`
pub struct MonotonicStream<T> {
    step: T,
    value: T,
    terminated: bool,
}

impl<T> MonotonicStream<T> {
    pub fn new(init: T, step: T) -> Self {
        Self {
            step,
            value: init,
            terminated: false,
        }
    }
}

impl<T> Stream<T> for MonotonicStream<T>
where
    T: Copy + std::ops::AddAssign,
{
    fn next(&mut self) -> Result<T> {
        if self.terminated {
            return Err(Error::StreamTerminated);
        }
        self.value += self.step;
        Ok(self.value)
    }

    fn terminate(&mut self) {
        self.terminated = true;
    }
}

/// Steps through `[start, start + end)` and wraps around.
pub struct CircularStream<T> {
    step: T,
    start: T,
    end: T,
    curr: T,
    terminated: bool,
}

impl<T: Default> CircularStream<T> {
    pub fn new(start: T, end: T, step: T) -> Self {
        Self {
            step,
            start,
            end,
            curr: T::default(),
            terminated: false,
        }
    }
}

impl<T> Stream<T> for CircularStream<T>
where
    T: Copy + std::ops::AddAssign + std::ops::Rem<Output = T> + std::ops::Add<Output = T>,
{
    fn next(&mut self) -> Result<T> {
        if self.terminated {
            return Err(Error::StreamTerminated);
        }
        let temp = self.curr;
        self.curr += self.step;
        Ok((temp % self.end) + self.start)
    }

    fn terminate(&mut self) {
        self.terminated = true;
    }
}

/// Applies a function over a bundle of source streams on every pull.
///
/// The bundle is any type the closure knows how to drive, typically a
/// tuple of streams; termination of a source propagates through the
/// closure's error.
pub struct MappedStream<T, S> {
    sources: S,
    generator: Box<dyn FnMut(&mut S) -> Result<T> + Send>,
    terminated: bool,
}

impl<T, S> MappedStream<T, S> {
    pub fn new(generator: impl FnMut(&mut S) -> Result<T> + Send + 'static, sources: S) -> Self {
        Self {
            sources,
            generator: Box::new(generator),
            terminated: false,
        }
    }
}

impl<T, S> Stream<T> for MappedStream<T, S> {
    fn next(&mut self) -> Result<T> {
        if self.terminated {
            return Err(Error::StreamTerminated);
        }
        (self.generator)(&mut self.sources)
    }

    fn terminate(&mut self) {
        self.terminated = true;
    }
}

/// Remembers the last `size` elements pulled through it; [`LatestStream::latest`]
/// samples among them with a zipfian skew toward the most recent.
pub struct LatestStream<T, S> {
    inner: S,
    window: Vec<T>,
    newest: usize,
    skew: Zipf<f64>,
    rng: StdRng,
    terminated: bool,
}

impl<T, S> LatestStream<T, S>
where
    T: Copy,
    S: Stream<T>,
{
    /// Wrap `inner`, priming the window with its first `size` elements.
    pub fn new(mut inner: S, size: usize) -> Result<Self> {
        assert!(size > 0, "an empty history cannot be sampled");
        let mut window = Vec::with_capacity(size);
        for _ in 0..size {
            window.push(inner.next()?);
        }
        window.reverse(); // Newest first.
        Ok(Self {
            inner,
            window,
            newest: 0,
            skew: Zipf::new(size as u64, 0.99).expect("zipf parameters are static"),
            rng: StdRng::from_entropy(),
            terminated: false,
        })
    }

    /// Sample a recent element, biased toward the newest.
    pub fn latest(&mut self) -> T {
        let size = self.window.len();
        let offset = self.skew.sample(&mut self.rng) as usize - 1;
        self.window[(self.newest + offset) % size]
    }
}

impl<T, S> Stream<T> for LatestStream<T, S>
where
    T: Copy,
    S: Stream<T>,
{
    fn next(&mut self) -> Result<T> {
        if self.terminated {
            return Err(Error::StreamTerminated);
        }
        let next = self.inner.next()?;
        let size = self.window.len();
        self.newest = if self.newest == 0 { size - 1 } else { self.newest - 1 };
        self.window[self.newest] = next;
        Ok(next)
    }

    fn terminate(&mut self) {
        self.terminated = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_yields_then_terminates() {
        let mut s = TestStream::new(vec![1, 2, 3]);
        assert_eq!(s.next().unwrap(), 1);
        assert_eq!(s.next().unwrap(), 2);
        assert_eq!(s.next().unwrap(), 3);
        assert!(s.next().unwrap_err().is_stream_terminated());
        assert!(s.next().unwrap_err().is_stream_terminated());
    }

    #[test]
    fn terminate_cuts_a_stream_short() {
        let mut s = TestStream::new(vec![1, 2, 3]);
        assert_eq!(s.next().unwrap(), 1);
        s.terminate();
        assert!(s.next().unwrap_err().is_stream_terminated());
    }

    #[test]
    fn uniform_int_stays_in_bounds() {
        let mut s = uniform_int_stream(5, 10);
        for _ in 0..10_000 {
            let v = s.next().unwrap();
            assert!((5..=10).contains(&v));
        }
    }

    #[test]
    fn weighted_frequencies_follow_the_weights() {
        #[derive(Clone, Copy, PartialEq)]
        enum Op {
            Get,
            Insert,
            Scan,
        }
        let weights = [50u32, 30, 20];
        let mut s = WeightedStream::new(&[Op::Get, Op::Insert, Op::Scan], &weights);

        const N: usize = 1_000_000;
        let mut counts = [0usize; 3];
        for _ in 0..N {
            match s.next().unwrap() {
                Op::Get => counts[0] += 1,
                Op::Insert => counts[1] += 1,
                Op::Scan => counts[2] += 1,
            }
        }
        let total: u32 = weights.iter().sum();
        for (count, weight) in counts.iter().zip(weights) {
            let actual = *count as f64 / N as f64;
            let expected = weight as f64 / total as f64;
            assert!(
                (actual - expected).abs() < 0.01,
                "frequency {} deviates from {}",
                actual,
                expected
            );
        }
    }

    #[test]
    fn monotonic_advances_by_step() {
        let mut s = MonotonicStream::new(10i64, 3);
        assert_eq!(s.next().unwrap(), 13);
        assert_eq!(s.next().unwrap(), 16);
        assert_eq!(s.next().unwrap(), 19);
    }

    #[test]
    fn circular_wraps_modulo_end() {
        let mut s = CircularStream::new(100i64, 4, 1);
        let got: Vec<_> = (0..6).map(|_| s.next().unwrap()).collect();
        assert_eq!(got, vec![100, 101, 102, 103, 100, 101]);
    }

    #[test]
    fn mapped_stream_combines_sources() {
        let keys = TestStream::new(vec![1i64, 2, 3]);
        let ops = TestStream::new(vec!["get", "put", "get"]);
        let mut s = MappedStream::new(
            |(keys, ops): &mut (TestStream<i64>, TestStream<&str>)| {
                let k = keys.next()?;
                let o = ops.next()?;
                Ok((o, k))
            },
            (keys, ops),
        );
        assert_eq!(s.next().unwrap(), ("get", 1));
        assert_eq!(s.next().unwrap(), ("put", 2));
        assert_eq!(s.next().unwrap(), ("get", 3));
        assert!(s.next().unwrap_err().is_stream_terminated());
    }

    #[test]
    fn latest_stream_samples_recent_history() {
        let inner = MonotonicStream::new(0i64, 1);
        let mut s = LatestStream::new(inner, 10).unwrap();
        // Window primed with 1..=10; push 11..=20 through.
        for _ in 0..10 {
            s.next().unwrap();
        }
        for _ in 0..1000 {
            let v = s.latest();
            assert!((11..=20).contains(&v), "sampled {} outside the window", v);
        }
    }

    #[test]
    fn latest_stream_propagates_termination() {
        let inner = TestStream::new(vec![1, 2, 3]);
        let mut s = LatestStream::new(inner, 3).unwrap();
        assert!(s.next().unwrap_err().is_stream_terminated());
        // The window itself is still sampleable.
        let v = s.latest();
        assert!((1..=3).contains(&v));
    }
}
