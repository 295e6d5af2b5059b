//! Asynchronous inference scheduler
//!
//! Runs one inference request a fixed number of times. The first submission
//! comes from the driving thread; every later one is issued by the completion
//! handler on the backend's thread, so the backend drives the iteration count
//! without the caller polling. The driver sleeps on a condition variable
//! until the target is reached or a failure is captured.
//!
//! ```text
//! Idle -> Submitted -> Completed -> Submitted -> ... -> Done
//!                  \-> Failed
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

use super::backend::{AsyncInferRequest, CompletionCallback};
use super::batch::BatchTensor;
use super::decode::OutputTensor;
use crate::error::{DeviceError, PipelineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Submitted,
    Completed,
    Failed,
    Done,
}

/// Shared between the driver and the completion handler, always under lock
#[derive(Debug)]
struct CompletionState {
    /// Incremented per run; completions of an earlier run are ignored
    run: u64,
    completed: usize,
    target: usize,
    failure: Option<DeviceError>,
    state: SchedulerState,
}

impl CompletionState {
    fn is_terminal(&self) -> bool {
        matches!(self.state, SchedulerState::Done | SchedulerState::Failed)
    }

    fn record_failure(&mut self, err: DeviceError) {
        // first failure wins
        if self.failure.is_none() {
            self.failure = Some(err.at_iteration(self.completed + 1));
            self.state = SchedulerState::Failed;
        }
    }
}

#[derive(Debug)]
struct Shared {
    state: Mutex<CompletionState>,
    cond: Condvar,
}

/// Timing of a finished run
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunStats {
    pub iterations: usize,
    pub elapsed: Duration,
}

impl RunStats {
    pub fn average_latency(&self) -> Duration {
        match u32::try_from(self.iterations) {
            Ok(n) if n > 0 => self.elapsed / n,
            _ => Duration::ZERO,
        }
    }

    /// Images per second across all iterations
    pub fn throughput(&self, batch_size: usize) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            (self.iterations * batch_size) as f64 / secs
        } else {
            0.0
        }
    }
}

/// Drives one request at a time through its iterations
#[derive(Debug)]
pub struct InferenceScheduler {
    iterations: usize,
    shared: Arc<Shared>,
}

impl InferenceScheduler {
    pub const DEFAULT_ITERATIONS: usize = 10;

    pub fn new(iterations: usize) -> Self {
        Self {
            iterations,
            shared: Arc::new(Shared {
                state: Mutex::new(CompletionState {
                    run: 0,
                    completed: 0,
                    target: iterations,
                    failure: None,
                    state: SchedulerState::Idle,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    /// State of the current or last run
    pub fn state(&self) -> SchedulerState {
        self.shared.state.lock().state
    }

    /// Run the request to the configured iteration count and return its output
    pub fn run(
        &self,
        request: Arc<dyn AsyncInferRequest>,
        batch: &BatchTensor,
    ) -> Result<OutputTensor> {
        self.run_with_stats(request, batch).map(|(output, _)| output)
    }

    /// As [`run`](Self::run), also returning timing
    pub fn run_with_stats(
        &self,
        request: Arc<dyn AsyncInferRequest>,
        batch: &BatchTensor,
    ) -> Result<(OutputTensor, RunStats)> {
        if self.iterations == 0 {
            return Err(PipelineError::configuration(
                "iteration count must be at least 1",
            ));
        }

        let run = {
            let mut guard = self.shared.state.lock();
            if matches!(
                guard.state,
                SchedulerState::Submitted | SchedulerState::Completed
            ) {
                return Err(PipelineError::configuration(
                    "scheduler is already running a request",
                ));
            }
            guard.run += 1;
            guard.completed = 0;
            guard.target = self.iterations;
            guard.failure = None;
            guard.state = SchedulerState::Idle;
            guard.run
        };

        request.set_input(batch)?;
        request.set_callback(completion_handler(&self.shared, &request, run));

        info!("Start inference ({} asynchronous executions)", self.iterations);
        let start = Instant::now();
        self.shared.state.lock().state = SchedulerState::Submitted;
        if let Err(err) = request.submit_async() {
            let mut guard = self.shared.state.lock();
            guard.record_failure(err);
            return Err(guard
                .failure
                .clone()
                .unwrap_or_else(|| DeviceError::new("submission failed"))
                .into());
        }

        let mut guard = self.shared.state.lock();
        while !guard.is_terminal() {
            self.shared.cond.wait(&mut guard);
        }
        let elapsed = start.elapsed();

        if guard.state == SchedulerState::Failed {
            let err = guard
                .failure
                .clone()
                .unwrap_or_else(|| DeviceError::new("inference failed"));
            return Err(err.into());
        }
        let completed = guard.completed;
        drop(guard);

        info!("Completed async requests execution");
        let output = request.output()?;
        let stats = RunStats {
            iterations: completed,
            elapsed,
        };
        debug!(
            "{} iterations in {:?}, {:?} per iteration",
            completed,
            elapsed,
            stats.average_latency()
        );

        Ok((output, stats))
    }
}

impl Default for InferenceScheduler {
    fn default() -> Self {
        Self::new(Self::DEFAULT_ITERATIONS)
    }
}

/// Handler invoked on the backend thread after every submission of `run`.
///
/// Holds only a weak reference to the request so the request and its
/// callback do not keep each other alive.
fn completion_handler(
    shared: &Arc<Shared>,
    request: &Arc<dyn AsyncInferRequest>,
    run: u64,
) -> CompletionCallback {
    let shared = Arc::clone(shared);
    let request = Arc::downgrade(request);

    Arc::new(move |outcome| {
        let mut guard = shared.state.lock();
        if guard.run != run || guard.is_terminal() {
            return;
        }

        match outcome {
            Err(err) => {
                guard.record_failure(err);
                shared.cond.notify_all();
            }
            Ok(()) => {
                guard.completed += 1;
                guard.state = SchedulerState::Completed;
                debug!("Completed {} async request execution", guard.completed);

                if guard.completed < guard.target {
                    let resubmitted = match request.upgrade() {
                        Some(request) => request.submit_async(),
                        None => Err(DeviceError::new(
                            "inference request dropped before the last iteration",
                        )),
                    };
                    match resubmitted {
                        Ok(()) => guard.state = SchedulerState::Submitted,
                        Err(err) => {
                            guard.record_failure(err);
                            shared.cond.notify_all();
                        }
                    }
                } else {
                    guard.state = SchedulerState::Done;
                    shared.cond.notify_all();
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    use crate::engine::preprocess::{to_plane_major, RawImage};
    use crate::engine::reference::ReferenceBackend;

    fn batch(values: &[u8]) -> BatchTensor {
        let buffers: Vec<_> = values
            .iter()
            .map(|&v| {
                let img = RawImage::new(vec![v; 2 * 2], 2, 2, 1).unwrap();
                to_plane_major(&img, 2, 2, 1).unwrap()
            })
            .collect();
        BatchTensor::assemble(&buffers).unwrap()
    }

    #[test]
    fn test_runs_exactly_k_iterations() {
        let backend = ReferenceBackend::new().with_input(1, 2, 2).with_classes(4);
        let request = backend.model().compile_reference(2).create_request();
        let scheduler = InferenceScheduler::new(7);
        assert_eq!(scheduler.state(), SchedulerState::Idle);

        let (output, stats) = scheduler
            .run_with_stats(request.clone(), &batch(&[1, 2]))
            .unwrap();

        assert_eq!(scheduler.state(), SchedulerState::Done);
        assert_eq!(stats.iterations, 7);
        assert_eq!(request.submissions(), 7);
        assert_eq!(output.batch_size(), 2);
        assert_eq!(output.row(0), &[0.0, 1.0, 0.0, 0.0]);
        assert_eq!(output.row(1), &[0.0, 0.0, 1.0, 0.0]);
    }

    #[test]
    fn test_failure_is_raised_on_driver() {
        let backend = ReferenceBackend::new()
            .with_input(1, 2, 2)
            .with_classes(4)
            .failing_at(3);
        let request = backend.model().compile_reference(1).create_request();
        let scheduler = InferenceScheduler::new(10);

        let err = scheduler.run(request.clone(), &batch(&[5])).unwrap_err();
        match err {
            PipelineError::Device(e) => assert_eq!(e.iteration, Some(3)),
            other => panic!("expected device error, got {other:?}"),
        }
        // no resubmission after the failed one
        assert_eq!(request.submissions(), 3);
        assert_eq!(scheduler.state(), SchedulerState::Failed);
    }

    #[test]
    fn test_zero_iterations_rejected() {
        let backend = ReferenceBackend::new().with_input(1, 2, 2);
        let request = backend.model().compile_reference(1).create_request();
        let scheduler = InferenceScheduler::new(0);
        let err = scheduler.run(request.clone(), &batch(&[0])).unwrap_err();

        assert!(matches!(err, PipelineError::Configuration(_)));
        assert_eq!(request.submissions(), 0);
        assert_eq!(scheduler.state(), SchedulerState::Idle);
    }

    /// Request whose completions are fired by hand from the test thread
    struct ManualRequest {
        callback: Mutex<Option<CompletionCallback>>,
        submitted: Mutex<mpsc::Sender<()>>,
    }

    impl AsyncInferRequest for ManualRequest {
        fn set_input(&self, _batch: &BatchTensor) -> Result<()> {
            Ok(())
        }

        fn set_callback(&self, callback: CompletionCallback) {
            *self.callback.lock() = Some(callback);
        }

        fn submit_async(&self) -> std::result::Result<(), DeviceError> {
            let _ = self.submitted.lock().send(());
            Ok(())
        }

        fn output(&self) -> Result<OutputTensor> {
            panic!("output must not be read after a failure");
        }
    }

    fn manual_request() -> (Arc<ManualRequest>, mpsc::Receiver<()>) {
        let (tx, rx) = mpsc::channel();
        let request = Arc::new(ManualRequest {
            callback: Mutex::new(None),
            submitted: Mutex::new(tx),
        });
        (request, rx)
    }

    #[test]
    fn test_first_failure_wins_and_late_signals_are_ignored() {
        let (request, rx) = manual_request();
        let scheduler = Arc::new(InferenceScheduler::new(3));

        let driver = {
            let request: Arc<dyn AsyncInferRequest> = request.clone();
            let scheduler = Arc::clone(&scheduler);
            let batch = batch(&[0]);
            std::thread::spawn(move || scheduler.run(request, &batch))
        };

        rx.recv().unwrap();
        assert_eq!(scheduler.state(), SchedulerState::Submitted);
        let callback = request.callback.lock().clone().unwrap();

        callback(Ok(()));
        rx.recv().unwrap();
        assert_eq!(scheduler.state(), SchedulerState::Submitted);

        callback(Err(DeviceError::new("first")));
        assert_eq!(scheduler.state(), SchedulerState::Failed);
        callback(Err(DeviceError::new("second")));
        callback(Ok(()));

        match driver.join().unwrap() {
            Err(PipelineError::Device(e)) => {
                assert_eq!(e.message, "first");
                assert_eq!(e.iteration, Some(2));
            }
            other => panic!("expected device error, got {other:?}"),
        }
        // the late success did not trigger another submission
        assert!(rx.try_recv().is_err());
        assert_eq!(scheduler.state(), SchedulerState::Failed);
    }

    #[test]
    fn test_stale_completion_does_not_touch_next_run() {
        let (manual, rx) = manual_request();
        let scheduler = Arc::new(InferenceScheduler::new(2));

        let driver = {
            let request: Arc<dyn AsyncInferRequest> = manual.clone();
            let scheduler = Arc::clone(&scheduler);
            let batch = batch(&[0]);
            std::thread::spawn(move || scheduler.run(request, &batch))
        };
        rx.recv().unwrap();
        let stale = manual.callback.lock().clone().unwrap();
        stale(Err(DeviceError::new("fault")));
        assert!(driver.join().unwrap().is_err());

        let request = ReferenceBackend::new()
            .with_input(1, 2, 2)
            .with_classes(4)
            .model()
            .compile_reference(1)
            .create_request();
        scheduler.run(request.clone(), &batch(&[3])).unwrap();
        assert_eq!(scheduler.state(), SchedulerState::Done);

        stale(Ok(()));
        assert_eq!(scheduler.state(), SchedulerState::Done);
        assert!(rx.try_recv().is_err());
        assert_eq!(request.submissions(), 2);
    }

    #[test]
    fn test_run_stats() {
        let stats = RunStats {
            iterations: 4,
            elapsed: Duration::from_millis(200),
        };
        assert_eq!(stats.average_latency(), Duration::from_millis(50));
        assert!((stats.throughput(2) - 40.0).abs() < 1e-9);
    }
}
