//! The workload driver: pulls operations from a stream, feeds them to a
//! client adaptor, and records latency and throughput online.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::bench::qps::QpsController;
use crate::bench::stream::Stream;
use crate::error::{Error, Result};
use crate::metrics::{Counter, Stopwatch, Summary};

/// The driver's view of the system under test. Wraps a data structure,
/// a distributed-system client, or anything else that can apply the
/// operations a stream produces.
pub trait ClientAdaptor<O> {
    fn start(&mut self) -> Result<()>;
    fn apply(&mut self, op: &O) -> Result<()>;
    fn stop(&mut self) -> Result<()>;
}

/// Metrics recorded by the run thread. Readers observe a consistent
/// snapshot once the driver has stopped.
pub struct DriverMetrics {
    pub ops: Counter<u64>,
    pub lat_summary: Summary<f64>,
    pub qps_summary: Summary<f64>,
    pub runtime: Option<Duration>,
}

impl DriverMetrics {
    fn new(qps_window: usize) -> Self {
        Self {
            ops: Counter::new("total_ops"),
            lat_summary: Summary::new("sampled_lat", "ns", 1000),
            qps_summary: Summary::new("sampled_qps", "ops/s", qps_window),
            runtime: None,
        }
    }
}

/// Single-producer benchmarking engine.
///
/// `start` launches a run thread that starts the client and then loops:
/// wait on the QPS controller (if any), pull the next operation, apply
/// it, and sample latency and throughput at the configured rates. The
/// loop exits when the stream terminates, an error surfaces, or `stop`
/// is called.
pub struct WorkloadDriver<O> {
    terminated: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
    metrics: Arc<Mutex<DriverMetrics>>,

    client: Option<Box<dyn ClientAdaptor<O> + Send>>,
    stream: Option<Box<dyn Stream<O> + Send>>,
    qps_controller: Option<Arc<dyn QpsController>>,
    lat_sampling_rate: Duration,
    qps_sampling_rate: Duration,

    run_thread: Option<JoinHandle<Result<()>>>,
}

impl<O: Send + 'static> WorkloadDriver<O> {
    /// Assemble a driver. A `qps_controller` of `None` leaves the
    /// offered load unthrottled; `qps_sampling_rate` defaults to
    /// sampling throughput as often as latency.
    pub fn new(
        client: Box<dyn ClientAdaptor<O> + Send>,
        stream: Box<dyn Stream<O> + Send>,
        qps_controller: Option<Arc<dyn QpsController>>,
        qps_sampling_rate: Option<Duration>,
    ) -> Self {
        Self {
            terminated: Arc::new(AtomicBool::new(false)),
            running: Arc::new(AtomicBool::new(false)),
            finished: Arc::new(AtomicBool::new(false)),
            metrics: Arc::new(Mutex::new(DriverMetrics::new(1000))),
            client: Some(client),
            stream: Some(stream),
            qps_controller,
            lat_sampling_rate: Duration::from_millis(10),
            qps_sampling_rate: qps_sampling_rate.unwrap_or(Duration::ZERO),
            run_thread: None,
        }
    }

    /// Launch the run thread and wait until it is pumping operations.
    pub fn start(&mut self) -> Result<()> {
        if self.terminated.load(Ordering::Acquire) {
            return Err(Error::unavailable(
                "cannot restart a terminated workload driver",
            ));
        }
        let mut client = self.client.take().ok_or_else(|| {
            Error::unavailable("workload driver already started")
        })?;
        let mut stream = self.stream.take().expect("stream travels with the client");

        let terminated = Arc::clone(&self.terminated);
        let running = Arc::clone(&self.running);
        let finished = Arc::clone(&self.finished);
        let metrics = Arc::clone(&self.metrics);
        let qps_controller = self.qps_controller.clone();
        let lat_sampling_rate = self.lat_sampling_rate;
        let qps_sampling_rate = self.qps_sampling_rate;

        let handle = std::thread::Builder::new()
            .name("remex-driver".into())
            .spawn(move || {
                let result = run(
                    client.as_mut(),
                    stream.as_mut(),
                    qps_controller.as_deref(),
                    &terminated,
                    &running,
                    &metrics,
                    lat_sampling_rate,
                    qps_sampling_rate,
                );
                finished.store(true, Ordering::Release);
                result
            })
            .map_err(|e| Error::internal(format!("run thread: {}", e)))?;
        self.run_thread = Some(handle);

        while !self.running.load(Ordering::Acquire) {
            if self.finished.load(Ordering::Acquire) {
                // The client failed to start; surface its error.
                self.terminated.store(true, Ordering::Release);
                return match self.run_thread.take() {
                    Some(t) => t
                        .join()
                        .map_err(|_| Error::internal("run thread panicked"))?
                        .map(|_| ()),
                    None => Err(Error::internal("run thread vanished")),
                };
            }
            std::hint::spin_loop();
        }
        Ok(())
    }

    /// Stop pumping operations, stop the client, and return the first
    /// error the run captured.
    pub fn stop(&mut self) -> Result<()> {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return Err(Error::unavailable("workload driver was already terminated"));
        }
        match self.run_thread.take() {
            Some(t) => t
                .join()
                .map_err(|_| Error::internal("run thread panicked"))?,
            None => Ok(()),
        }
    }

    /// The recorded metrics. Consistent once [`WorkloadDriver::stop`]
    /// returned.
    pub fn metrics(&self) -> Arc<Mutex<DriverMetrics>> {
        Arc::clone(&self.metrics)
    }

    /// Render every metric for reporting.
    pub fn report(&self) -> String {
        let m = self.metrics.lock().unwrap();
        let runtime = m
            .runtime
            .map(|r| format!("runtime: {} ns", r.as_nanos()))
            .unwrap_or_else(|| "runtime: still running".into());
        format!(
            "{}\n{}\n{}\n{}",
            m.ops, m.lat_summary, m.qps_summary, runtime
        )
    }
}

impl<O> Drop for WorkloadDriver<O> {
    fn drop(&mut self) {
        self.terminated.store(true, Ordering::Release);
        if let Some(t) = self.run_thread.take() {
            let _ = t.join();
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run<O>(
    client: &mut (dyn ClientAdaptor<O> + Send),
    stream: &mut (dyn Stream<O> + Send),
    qps_controller: Option<&dyn QpsController>,
    terminated: &AtomicBool,
    running: &AtomicBool,
    metrics: &Mutex<DriverMetrics>,
    lat_sampling_rate: Duration,
    qps_sampling_rate: Duration,
) -> Result<()> {
    client.start()?;
    let mut stopwatch = Stopwatch::start("driver_stopwatch");
    running.store(true, Ordering::Release);

    let mut status = Ok(());
    let mut prev_ops: u64 = 0;
    while !terminated.load(Ordering::Acquire) {
        if let Some(qps) = qps_controller {
            qps.wait();
        }

        let op = match stream.next() {
            Ok(op) => op,
            Err(e) => {
                if !e.is_stream_terminated() {
                    status = Err(e);
                }
                break;
            }
        };

        let curr_lap = stopwatch.get_lap_split().runtime();
        let applied = client.apply(&op);
        if curr_lap > lat_sampling_rate {
            let after = stopwatch.get_lap_split().runtime();
            metrics
                .lock()
                .unwrap()
                .lat_summary
                .push((after - curr_lap).as_nanos() as f64);
        }
        if let Err(e) = applied {
            status = Err(e);
            break;
        }

        let mut m = metrics.lock().unwrap();
        m.ops.increment();
        if curr_lap > qps_sampling_rate {
            let curr_ops = m.ops.get();
            let lap_secs = stopwatch.get_lap().runtime().as_secs_f64();
            if lap_secs > 0.0 {
                m.qps_summary.push((curr_ops - prev_ops) as f64 / lap_secs);
            }
            prev_ops = curr_ops;
        }
    }

    // The client's stop may block on outstanding operations; afterwards
    // it is assumed idle.
    let stop_status = client.stop();
    stopwatch.stop();
    let mut m = metrics.lock().unwrap();
    m.lat_summary.flush();
    m.qps_summary.flush();
    m.runtime = Some(stopwatch.runtime());
    drop(m);
    status.and(stop_status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bench::stream::TestStream;

    /// Counts every operation it sees.
    struct CountingClient {
        started: bool,
        stopped: bool,
        applied: Arc<Mutex<Vec<u64>>>,
    }

    impl CountingClient {
        fn new() -> (Self, Arc<Mutex<Vec<u64>>>) {
            let applied = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    started: false,
                    stopped: false,
                    applied: Arc::clone(&applied),
                },
                applied,
            )
        }
    }

    impl ClientAdaptor<u64> for CountingClient {
        fn start(&mut self) -> Result<()> {
            self.started = true;
            Ok(())
        }

        fn apply(&mut self, op: &u64) -> Result<()> {
            assert!(self.started && !self.stopped);
            self.applied.lock().unwrap().push(*op);
            Ok(())
        }

        fn stop(&mut self) -> Result<()> {
            self.stopped = true;
            Ok(())
        }
    }

    #[test]
    fn drives_a_stream_to_completion() {
        let ops: Vec<u64> = (0..1000).collect();
        let (client, applied) = CountingClient::new();
        let mut driver = WorkloadDriver::new(
            Box::new(client),
            Box::new(TestStream::new(ops.clone())),
            None,
            None,
        );
        driver.start().unwrap();

        // The stream is finite; the run loop exits on its own.
        while !driver.finished.load(Ordering::Acquire) {
            std::thread::sleep(Duration::from_millis(1));
        }
        driver.stop().unwrap();

        assert_eq!(*applied.lock().unwrap(), ops);
        let m = driver.metrics();
        let m = m.lock().unwrap();
        assert_eq!(m.ops.get(), 1000);
        assert!(m.runtime.is_some());
    }

    #[test]
    fn stop_is_not_restartable() {
        let (client, _) = CountingClient::new();
        let mut driver = WorkloadDriver::new(
            Box::new(client),
            Box::new(TestStream::new(vec![1u64])),
            None,
            None,
        );
        driver.start().unwrap();
        driver.stop().unwrap();
        assert!(driver.stop().unwrap_err().is_unavailable());
        assert!(driver.start().unwrap_err().is_unavailable());
    }

    struct FailingClient;

    impl ClientAdaptor<u64> for FailingClient {
        fn start(&mut self) -> Result<()> {
            Err(Error::internal("client refused to start"))
        }

        fn apply(&mut self, _op: &u64) -> Result<()> {
            unreachable!("apply after failed start")
        }

        fn stop(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn client_start_failure_surfaces() {
        let mut driver = WorkloadDriver::new(
            Box::new(FailingClient),
            Box::new(TestStream::new(vec![1u64])),
            None,
            None,
        );
        let err = driver.start().unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }
}
