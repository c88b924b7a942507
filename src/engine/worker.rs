use crate::engine::Registry;
use crate::engine::iteration::{IterationContext, execute_iteration};
use crate::engine::metrics::names;
use crate::error::MetricError;
use crate::types::{RequestSpec, ThinkTime};
use futures_util::FutureExt;
use reqwest::Client;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Running = 0,
    /// Finish the current iteration, then exit
    Draining = 1,
    Stopped = 2,
}

/// Lifecycle cell shared between a worker and the pool that owns it.
#[derive(Debug, Clone)]
pub struct StateCell(Arc<AtomicU8>);

impl StateCell {
    pub fn new() -> Self {
        Self(Arc::new(AtomicU8::new(WorkerState::Running as u8)))
    }

    pub fn get(&self) -> WorkerState {
        match self.0.load(Ordering::Acquire) {
            0 => WorkerState::Running,
            1 => WorkerState::Draining,
            _ => WorkerState::Stopped,
        }
    }

    /// Running -> Draining. A worker that already stopped stays stopped.
    pub fn drain(&self) {
        let _ = self.0.compare_exchange(
            WorkerState::Running as u8,
            WorkerState::Draining as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    fn stop(&self) {
        self.0.store(WorkerState::Stopped as u8, Ordering::Release);
    }
}

pub struct Worker {
    id: u32,
    client: Client,
    requests: Arc<Vec<RequestSpec>>,
    registry: Arc<Registry>,
    think_time: ThinkTime,
    state: StateCell,
    wake: CancellationToken,
}

impl Worker {
    pub fn new(
        id: u32,
        client: Client,
        requests: Arc<Vec<RequestSpec>>,
        registry: Arc<Registry>,
        think_time: ThinkTime,
        state: StateCell,
        wake: CancellationToken,
    ) -> Self {
        Self {
            id,
            client,
            requests,
            registry,
            think_time,
            state,
            wake,
        }
    }

    pub async fn run(self) {
        tracing::debug!("Worker {} started", self.id);

        let mut iteration = 0u64;

        // Stop requests are only honoured here, never mid-request
        while self.state.get() == WorkerState::Running && !self.wake.is_cancelled() {
            let ctx = IterationContext {
                vu: self.id,
                iteration,
            };

            let outcome = guarded(execute_iteration(
                &self.client,
                &self.requests,
                &self.registry,
                ctx,
            ))
            .await;

            match outcome {
                IterationOutcome::Done => {}
                IterationOutcome::Failed(e) => {
                    tracing::warn!("Worker {} iteration {} failed: {}", self.id, iteration, e);
                    self.record_failed_iteration();
                }
                IterationOutcome::Panicked(msg) => {
                    tracing::error!("Worker {} iteration {} panicked: {}", self.id, iteration, msg);
                    self.record_failed_iteration();
                }
            }

            iteration += 1;

            let pause = self.think_time.sample();
            if pause.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::select! {
                    _ = sleep(pause) => {}
                    _ = self.wake.cancelled() => {}
                }
            }
        }

        self.state.stop();
        tracing::debug!("Worker {} stopped after {} iterations", self.id, iteration);
    }

    fn record_failed_iteration(&self) {
        if let Err(e) = self.registry.add(names::FAILED_ITERATIONS, 1) {
            tracing::error!("Worker {} cannot record failed iteration: {}", self.id, e);
        }
    }
}

#[derive(Debug, PartialEq)]
enum IterationOutcome {
    Done,
    Failed(MetricError),
    Panicked(String),
}

/// Run one iteration so that neither an error nor a panic escapes the worker.
async fn guarded<F>(iteration: F) -> IterationOutcome
where
    F: Future<Output = Result<(), MetricError>>,
{
    match AssertUnwindSafe(iteration).catch_unwind().await {
        Ok(Ok(())) => IterationOutcome::Done,
        Ok(Err(e)) => IterationOutcome::Failed(e),
        Err(panic) => IterationOutcome::Panicked(panic_message(&panic).to_string()),
    }
}

fn panic_message(panic: &Box<dyn Any + Send>) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        let cell = StateCell::new();
        assert_eq!(cell.get(), WorkerState::Running);
        cell.drain();
        assert_eq!(cell.get(), WorkerState::Draining);
        cell.stop();
        assert_eq!(cell.get(), WorkerState::Stopped);
        // Stopped workers never go back to draining
        cell.drain();
        assert_eq!(cell.get(), WorkerState::Stopped);
    }

    #[tokio::test]
    async fn test_guarded_catches_errors_and_panics() {
        assert_eq!(guarded(async { Ok(()) }).await, IterationOutcome::Done);

        let err = MetricError::SampleMismatch(crate::engine::MetricKind::Rate);
        let outcome = guarded(async { Err(err.clone()) }).await;
        assert_eq!(outcome, IterationOutcome::Failed(err));

        let outcome = guarded(async {
            if true {
                panic!("iteration blew up");
            }
            Ok(())
        })
        .await;
        assert_eq!(
            outcome,
            IterationOutcome::Panicked("iteration blew up".to_string())
        );

        let outcome = guarded(async {
            if true {
                panic!("vu {} gave up", 3);
            }
            Ok(())
        })
        .await;
        assert_eq!(outcome, IterationOutcome::Panicked("vu 3 gave up".to_string()));
    }
}
