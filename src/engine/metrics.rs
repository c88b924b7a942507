use crate::engine::snapshot::{MetricValue, MetricsSnapshot, TrendSnapshot};
use crate::error::MetricError;
use crate::types::{RequestSpec, TrendStorage};
use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

/// Highest trackable histogram value: one hour in microseconds.
const HISTOGRAM_MAX_US: u64 = 3_600_000_000;

/// Built-in metric names.
pub mod names {
    pub const HTTP_REQS: &str = "http_reqs";
    pub const HTTP_REQ_DURATION: &str = "http_req_duration";
    pub const HTTP_REQ_FAILED: &str = "http_req_failed";
    pub const DATA_RECEIVED: &str = "data_received";
    pub const ITERATIONS: &str = "iterations";
    pub const ITERATION_DURATION: &str = "iteration_duration";
    pub const FAILED_ITERATIONS: &str = "failed_iterations";
    pub const CHECKS: &str = "checks";
    pub const ERRORS: &str = "errors";
    pub const VUS: &str = "vus";

    /// `http_req_duration{name:health}`
    pub fn per_request(base: &str, request: &str) -> String {
        format!("{}{{name:{}}}", base, request)
    }

    /// `checks{check:status is 200}`
    pub fn per_check(check: &str) -> String {
        format!("{}{{check:{}}}", CHECKS, check)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Counter,
    Rate,
    Trend,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MetricKind::Counter => "counter",
            MetricKind::Rate => "rate",
            MetricKind::Trend => "trend",
        };
        f.write_str(name)
    }
}

/// Every metric a run over `requests` records, with its kind, in a stable order.
pub fn builtin_metrics(requests: &[RequestSpec]) -> Vec<(String, MetricKind)> {
    let mut metrics = vec![
        (names::HTTP_REQS.to_string(), MetricKind::Counter),
        (names::HTTP_REQ_DURATION.to_string(), MetricKind::Trend),
        (names::HTTP_REQ_FAILED.to_string(), MetricKind::Rate),
        (names::DATA_RECEIVED.to_string(), MetricKind::Counter),
        (names::ITERATIONS.to_string(), MetricKind::Counter),
        (names::ITERATION_DURATION.to_string(), MetricKind::Trend),
        (names::FAILED_ITERATIONS.to_string(), MetricKind::Counter),
        (names::CHECKS.to_string(), MetricKind::Rate),
        (names::ERRORS.to_string(), MetricKind::Rate),
        (names::VUS.to_string(), MetricKind::Trend),
    ];

    for request in requests {
        metrics.push((
            names::per_request(names::HTTP_REQS, &request.name),
            MetricKind::Counter,
        ));
        metrics.push((
            names::per_request(names::HTTP_REQ_DURATION, &request.name),
            MetricKind::Trend,
        ));
        for check in &request.checks {
            let name = names::per_check(&check.name);
            if !metrics.iter().any(|(n, _)| *n == name) {
                metrics.push((name, MetricKind::Rate));
            }
        }
    }
    metrics
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Sample {
    Add(u64),
    Bool(bool),
    Value(f64),
}

// Poisoning is ignored: every update leaves the accumulator consistent.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct Rate {
    // (trues, total) move together
    counts: Mutex<(u64, u64)>,
}

impl Rate {
    pub fn observe(&self, value: bool) {
        let mut counts = lock(&self.counts);
        if value {
            counts.0 += 1;
        }
        counts.1 += 1;
    }

    pub fn counts(&self) -> (u64, u64) {
        *lock(&self.counts)
    }
}

enum TrendData {
    Exact(Vec<f64>),
    Histogram {
        hist: Box<Histogram<u64>>,
        min: f64,
        max: f64,
        sum: f64,
    },
}

pub struct Trend {
    data: Mutex<TrendData>,
}

impl Trend {
    pub fn new(storage: TrendStorage) -> Self {
        let data = match storage {
            TrendStorage::Exact => TrendData::Exact(Vec::new()),
            TrendStorage::Histogram => TrendData::Histogram {
                hist: Box::new(
                    Histogram::<u64>::new_with_bounds(1, HISTOGRAM_MAX_US, 3)
                        .expect("Failed to create histogram"),
                ),
                min: f64::INFINITY,
                max: f64::NEG_INFINITY,
                sum: 0.0,
            },
        };
        Self {
            data: Mutex::new(data),
        }
    }

    pub fn add(&self, value: f64) {
        if !value.is_finite() {
            return;
        }
        let mut data = lock(&self.data);
        match &mut *data {
            TrendData::Exact(samples) => samples.push(value),
            TrendData::Histogram {
                hist,
                min,
                max,
                sum,
            } => {
                let us = ((value * 1000.0).round() as u64).clamp(1, HISTOGRAM_MAX_US);
                hist.saturating_record(us);
                *min = min.min(value);
                *max = max.max(value);
                *sum += value;
            }
        }
    }

    /// Point-in-time copy taken under the lock.
    pub fn snapshot(&self) -> TrendSnapshot {
        let data = lock(&self.data);
        match &*data {
            TrendData::Exact(samples) => TrendSnapshot::from_samples(samples.clone()),
            TrendData::Histogram {
                hist,
                min,
                max,
                sum,
            } => TrendSnapshot::from_histogram((**hist).clone(), *min, *max, *sum),
        }
    }
}

enum Metric {
    Counter(Counter),
    Rate(Rate),
    Trend(Trend),
}

impl Metric {
    fn kind(&self) -> MetricKind {
        match self {
            Metric::Counter(_) => MetricKind::Counter,
            Metric::Rate(_) => MetricKind::Rate,
            Metric::Trend(_) => MetricKind::Trend,
        }
    }

    fn value(&self) -> MetricValue {
        match self {
            Metric::Counter(c) => MetricValue::Counter { count: c.get() },
            Metric::Rate(r) => {
                let (trues, total) = r.counts();
                MetricValue::Rate { trues, total }
            }
            Metric::Trend(t) => MetricValue::Trend(t.snapshot()),
        }
    }
}

/// Shared store for every metric of a run. Workers only ever touch metrics
/// through `record`; nothing else hands out mutable access.
pub struct Registry {
    metrics: RwLock<HashMap<String, Arc<Metric>>>,
    trend_storage: TrendStorage,
}

impl Registry {
    pub fn new(trend_storage: TrendStorage) -> Self {
        Self {
            metrics: RwLock::new(HashMap::new()),
            trend_storage,
        }
    }

    /// Declare a metric up front so thresholds can reference it and reports
    /// list it even if nothing was recorded.
    pub fn register(&self, name: &str, kind: MetricKind) -> Result<(), MetricError> {
        self.get_or_create(name, kind).map(|_| ())
    }

    pub fn record(&self, name: &str, kind: MetricKind, sample: Sample) -> Result<(), MetricError> {
        let metric = self.get_or_create(name, kind)?;
        match (&*metric, sample) {
            (Metric::Counter(c), Sample::Add(n)) => c.add(n),
            (Metric::Rate(r), Sample::Bool(b)) => r.observe(b),
            (Metric::Trend(t), Sample::Value(v)) => t.add(v),
            _ => return Err(MetricError::SampleMismatch(kind)),
        }
        Ok(())
    }

    pub fn add(&self, name: &str, n: u64) -> Result<(), MetricError> {
        self.record(name, MetricKind::Counter, Sample::Add(n))
    }

    pub fn observe(&self, name: &str, value: bool) -> Result<(), MetricError> {
        self.record(name, MetricKind::Rate, Sample::Bool(value))
    }

    pub fn push(&self, name: &str, value: f64) -> Result<(), MetricError> {
        self.record(name, MetricKind::Trend, Sample::Value(value))
    }

    /// `elapsed` is the run time the snapshot covers; per-second rates
    /// divide by it.
    pub fn snapshot(&self, elapsed: Duration) -> MetricsSnapshot {
        let metrics: Vec<(String, Arc<Metric>)> = self
            .metrics
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let metrics: BTreeMap<String, MetricValue> = metrics
            .into_iter()
            .map(|(name, metric)| (name, metric.value()))
            .collect();

        MetricsSnapshot { elapsed, metrics }
    }

    fn get_or_create(&self, name: &str, kind: MetricKind) -> Result<Arc<Metric>, MetricError> {
        let existing = self
            .metrics
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned();

        let metric = match existing {
            Some(m) => m,
            None => {
                let mut metrics = self.metrics.write().unwrap_or_else(|e| e.into_inner());
                metrics
                    .entry(name.to_string())
                    .or_insert_with(|| {
                        Arc::new(match kind {
                            MetricKind::Counter => Metric::Counter(Counter::default()),
                            MetricKind::Rate => Metric::Rate(Rate::default()),
                            MetricKind::Trend => Metric::Trend(Trend::new(self.trend_storage)),
                        })
                    })
                    .clone()
            }
        };

        if metric.kind() != kind {
            return Err(MetricError::KindMismatch {
                name: name.to_string(),
                existing: metric.kind(),
                requested: kind,
            });
        }
        Ok(metric)
    }
}
