use crate::engine::metrics::{Registry, builtin_metrics, names};
use crate::engine::pool::VuPool;
use crate::engine::scheduler::{StageInfo, StagePlan};
use crate::engine::snapshot::MetricsSnapshot;
use crate::engine::thresholds::evaluate_threshold;
use crate::error::{ConfigError, EngineError};
use crate::http::create_client;
use crate::types::{LoadConfig, RunState, Threshold};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior, interval, sleep_until};
use tokio_util::sync::CancellationToken;

/// Outcome of a finished run. The snapshot is taken after every worker has
/// stopped, so nothing recorded after it can change the report.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub snapshot: MetricsSnapshot,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub state: RunState,
    /// Threshold that stopped the run early, if any
    pub aborted_by: Option<String>,
    /// Workers cut off when the graceful stop period ran out
    pub interrupted: u32,
}

impl RunSummary {
    pub fn aborted(&self) -> bool {
        self.state == RunState::Aborted
    }
}

pub struct Engine {
    config: LoadConfig,
    plan: StagePlan,
    registry: Arc<Registry>,
    cancel_token: CancellationToken,
    stage_info_tx: watch::Sender<StageInfo>,
}

impl Engine {
    pub fn new(config: LoadConfig) -> Result<Self, ConfigError> {
        let plan = StagePlan::new(config.stages.clone(), config.start_target)?;

        let registry = Arc::new(Registry::new(config.trend_storage));
        for (name, kind) in builtin_metrics(&config.requests) {
            registry.register(&name, kind)?;
        }

        let (stage_info_tx, _) = watch::channel(StageInfo::default());

        Ok(Self {
            config,
            plan,
            registry,
            cancel_token: CancellationToken::new(),
            stage_info_tx,
        })
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    pub fn stage_info_rx(&self) -> watch::Receiver<StageInfo> {
        self.stage_info_tx.subscribe()
    }

    pub async fn run(self) -> Result<RunSummary, EngineError> {
        let client = create_client(
            self.config.max_target(),
            self.config.timeout,
            self.config.connect_timeout,
            self.config.insecure,
        )?;

        let shutdown = CancellationToken::new();
        let mut pool = VuPool::new(
            client,
            Arc::new(self.config.requests.clone()),
            self.registry.clone(),
            self.config.think_time,
            shutdown.clone(),
        );

        let abort_thresholds: Vec<&Threshold> = self
            .config
            .thresholds
            .iter()
            .filter(|t| t.abort_on_fail)
            .collect();

        let started_at = Utc::now();
        let start = Instant::now();
        let end = start + self.plan.total_duration();

        let mut ticker = interval(self.config.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            "Starting '{}': {} stages over {:?}, peak {} VUs",
            self.config.test_name,
            self.plan.stages().len(),
            self.plan.total_duration(),
            self.config.max_target()
        );

        let mut aborted_by = None;
        let mut cancelled = false;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = sleep_until(end) => {
                    tracing::info!("All stages complete");
                    break;
                }
                _ = self.cancel_token.cancelled() => {
                    tracing::info!("Cancellation requested");
                    cancelled = true;
                    break;
                }
            }

            let elapsed = start.elapsed();
            let Some(target) = self.plan.workers_at(elapsed) else {
                tracing::info!("All stages complete");
                break;
            };

            pool.scale_to(target);
            let live = pool.live();
            if let Err(e) = self.registry.push(names::VUS, live as f64) {
                tracing::error!("Cannot record VU count: {}", e);
            }

            let info = self.plan.stage_info(elapsed, live);
            tracing::info!(
                "stage {}/{} t={:.1}s vus={} target={}",
                info.stage_index + 1,
                info.stage_count,
                elapsed.as_secs_f64(),
                live,
                info.target
            );
            let _ = self.stage_info_tx.send(info);

            let due: Vec<&Threshold> = abort_thresholds
                .iter()
                .copied()
                .filter(|t| elapsed >= t.delay_abort_eval)
                .collect();
            if !due.is_empty() {
                let snapshot = self.registry.snapshot(elapsed);
                if let Some(failed) = due
                    .into_iter()
                    .map(|t| evaluate_threshold(t, &snapshot))
                    .find(|r| !r.passed)
                {
                    tracing::warn!(
                        "Threshold '{}: {}' crossed (actual {:.4}), aborting run",
                        failed.metric,
                        failed.expression,
                        failed.actual
                    );
                    aborted_by = Some(format!("{}: {}", failed.metric, failed.expression));
                    break;
                }
            }
        }

        // Rates cover the load window, not the drain that follows it
        let run_time = start.elapsed();

        let draining = pool.active();
        tracing::info!("Draining {} workers", draining);
        self.stage_info_tx.send_modify(|info| {
            info.state = RunState::Draining;
            info.current = draining;
        });
        shutdown.cancel();
        let interrupted = pool.drain(self.config.graceful_stop).await;

        let snapshot = self.registry.snapshot(run_time);
        let ended_at = Utc::now();

        let state = if cancelled || aborted_by.is_some() {
            RunState::Aborted
        } else {
            RunState::Completed
        };
        self.stage_info_tx.send_modify(|info| {
            info.state = state;
            info.current = 0;
        });

        Ok(RunSummary {
            snapshot,
            started_at,
            ended_at,
            state,
            aborted_by,
            interrupted,
        })
    }
}
