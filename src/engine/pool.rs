use crate::engine::Registry;
use crate::engine::worker::{StateCell, Worker, WorkerState};
use crate::types::{RequestSpec, ThinkTime};
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout_at};
use tokio_util::sync::CancellationToken;

struct Slot {
    id: u32,
    state: StateCell,
    wake: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owns every spawned virtual user. Scaling down never interrupts a request:
/// surplus workers are flagged and finish their iteration on their own.
pub struct VuPool {
    client: Client,
    requests: Arc<Vec<RequestSpec>>,
    registry: Arc<Registry>,
    think_time: ThinkTime,
    shutdown: CancellationToken,
    slots: Vec<Slot>,
    next_id: u32,
}

impl VuPool {
    pub fn new(
        client: Client,
        requests: Arc<Vec<RequestSpec>>,
        registry: Arc<Registry>,
        think_time: ThinkTime,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            client,
            requests,
            registry,
            think_time,
            shutdown,
            slots: Vec::new(),
            next_id: 0,
        }
    }

    /// Workers still accepting new iterations.
    pub fn live(&self) -> u32 {
        self.slots
            .iter()
            .filter(|s| s.state.get() == WorkerState::Running)
            .count() as u32
    }

    /// Workers that have not exited yet, draining ones included.
    pub fn active(&self) -> u32 {
        self.slots.iter().filter(|s| !s.handle.is_finished()).count() as u32
    }

    pub fn scale_to(&mut self, target: u32) {
        self.slots.retain(|s| !s.handle.is_finished());

        let live = self.live();
        if target > live {
            for _ in live..target {
                self.spawn();
            }
            tracing::debug!("Scaled up {} -> {} workers", live, target);
        } else if target < live {
            let surplus = (live - target) as usize;
            for slot in self
                .slots
                .iter()
                .rev()
                .filter(|s| s.state.get() == WorkerState::Running)
                .take(surplus)
            {
                slot.state.drain();
                slot.wake.cancel();
            }
            tracing::debug!("Scaled down {} -> {} workers", live, target);
        }
    }

    fn spawn(&mut self) {
        let id = self.next_id;
        self.next_id += 1;

        let state = StateCell::new();
        let wake = self.shutdown.child_token();
        let worker = Worker::new(
            id,
            self.client.clone(),
            self.requests.clone(),
            self.registry.clone(),
            self.think_time,
            state.clone(),
            wake.clone(),
        );

        self.slots.push(Slot {
            id,
            state,
            wake,
            handle: tokio::spawn(worker.run()),
        });
    }

    /// Stop every worker and wait for in-flight iterations to finish.
    /// Workers still busy after `grace` are aborted; returns how many were.
    /// No worker records metrics once this returns.
    pub async fn drain(self, grace: Duration) -> u32 {
        for slot in &self.slots {
            slot.state.drain();
            slot.wake.cancel();
        }

        let deadline = Instant::now() + grace;
        let mut aborted = 0;

        for mut slot in self.slots {
            match timeout_at(deadline, &mut slot.handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!("Worker {} exited abnormally: {}", slot.id, e),
                Err(_) => {
                    slot.handle.abort();
                    let _ = slot.handle.await;
                    aborted += 1;
                }
            }
        }

        if aborted > 0 {
            tracing::warn!(
                "{} workers did not finish within {:?} and were interrupted",
                aborted,
                grace
            );
        }
        aborted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MetricKind;
    use crate::engine::metrics::names;
    use crate::types::TrendStorage;
    use reqwest::Method;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn pool_for(server: &MockServer, think: Duration) -> (VuPool, Arc<Registry>) {
        let registry = Arc::new(Registry::new(TrendStorage::Exact));
        let requests = Arc::new(vec![RequestSpec {
            name: "root".to_string(),
            method: Method::GET,
            url: server.uri(),
            headers: Vec::new(),
            body: None,
            checks: Vec::new(),
        }]);
        let pool = VuPool::new(
            Client::new(),
            requests,
            registry.clone(),
            ThinkTime::new(think, think).unwrap(),
            CancellationToken::new(),
        );
        (pool, registry)
    }

    #[tokio::test]
    async fn test_scale_converges_immediately() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let (mut pool, _) = pool_for(&server, Duration::from_millis(20)).await;
        for target in [3, 7, 2, 0, 5] {
            pool.scale_to(target);
            assert_eq!(pool.live(), target);
        }
        assert_eq!(pool.drain(Duration::from_secs(5)).await, 0);
    }

    #[tokio::test]
    async fn test_scale_down_lets_inflight_request_finish() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(300)))
            .mount(&server)
            .await;

        let (mut pool, registry) = pool_for(&server, Duration::from_secs(10)).await;
        pool.scale_to(1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.scale_to(0);
        assert_eq!(pool.live(), 0);
        assert_eq!(pool.active(), 1);

        assert_eq!(pool.drain(Duration::from_secs(5)).await, 0);
        let snap = registry.snapshot(Duration::ZERO);
        assert_eq!(snap.counter(names::ITERATIONS), Some(1));
        assert_eq!(snap.rate_counts(names::HTTP_REQ_FAILED), Some((0, 1)));
    }

    #[tokio::test]
    async fn test_drain_interrupts_stragglers_after_grace() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let (mut pool, registry) = pool_for(&server, Duration::ZERO).await;
        pool.scale_to(2);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(pool.drain(Duration::from_millis(100)).await, 2);
        assert_eq!(registry.snapshot(Duration::ZERO).counter(names::ITERATIONS), None);
    }

    #[tokio::test]
    async fn test_failing_iterations_keep_workers_running() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let (mut pool, registry) = pool_for(&server, Duration::from_millis(10)).await;
        // Wrong kind: every iteration fails when it records its first request
        registry.register(names::HTTP_REQS, MetricKind::Rate).unwrap();

        pool.scale_to(2);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(pool.live(), 2);
        assert_eq!(pool.active(), 2);

        assert_eq!(pool.drain(Duration::from_secs(5)).await, 0);
        let snap = registry.snapshot(Duration::ZERO);
        let failed = snap.counter(names::FAILED_ITERATIONS).unwrap();
        assert!(failed >= 4, "only {} failed iterations", failed);
        assert_eq!(snap.counter(names::ITERATIONS), None);
    }
}
