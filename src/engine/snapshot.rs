use crate::engine::MetricKind;
use hdrhistogram::Histogram;
use std::collections::BTreeMap;
use std::time::Duration;

/// Frozen view of every metric, taken at one point in time. Thresholds and
/// reports only ever read from one of these.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub elapsed: Duration,
    pub metrics: BTreeMap<String, MetricValue>,
}

#[derive(Debug, Clone)]
pub enum MetricValue {
    Counter { count: u64 },
    Rate { trues: u64, total: u64 },
    Trend(TrendSnapshot),
}

impl MetricValue {
    pub fn kind(&self) -> MetricKind {
        match self {
            MetricValue::Counter { .. } => MetricKind::Counter,
            MetricValue::Rate { .. } => MetricKind::Rate,
            MetricValue::Trend(_) => MetricKind::Trend,
        }
    }
}

pub fn rate_of(trues: u64, total: u64) -> f64 {
    if total > 0 {
        trues as f64 / total as f64
    } else {
        0.0
    }
}

impl MetricsSnapshot {
    pub fn get(&self, name: &str) -> Option<&MetricValue> {
        self.metrics.get(name)
    }

    pub fn counter(&self, name: &str) -> Option<u64> {
        match self.metrics.get(name)? {
            MetricValue::Counter { count } => Some(*count),
            _ => None,
        }
    }

    pub fn rate_counts(&self, name: &str) -> Option<(u64, u64)> {
        match self.metrics.get(name)? {
            MetricValue::Rate { trues, total } => Some((*trues, *total)),
            _ => None,
        }
    }

    pub fn rate(&self, name: &str) -> Option<f64> {
        self.rate_counts(name).map(|(t, n)| rate_of(t, n))
    }

    #[cfg(test)]
    pub fn trend(&self, name: &str) -> Option<&TrendSnapshot> {
        match self.metrics.get(name)? {
            MetricValue::Trend(t) => Some(t),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
enum TrendInner {
    /// Sorted ascending
    Exact(Vec<f64>),
    Histogram {
        hist: Box<Histogram<u64>>,
        min: f64,
        max: f64,
        sum: f64,
    },
}

#[derive(Debug, Clone)]
pub struct TrendSnapshot {
    inner: TrendInner,
}

impl TrendSnapshot {
    pub fn from_samples(mut samples: Vec<f64>) -> Self {
        samples.sort_by(f64::total_cmp);
        Self {
            inner: TrendInner::Exact(samples),
        }
    }

    /// Histogram values are microseconds; min/max/sum are exact milliseconds.
    pub fn from_histogram(hist: Histogram<u64>, min: f64, max: f64, sum: f64) -> Self {
        Self {
            inner: TrendInner::Histogram {
                hist: Box::new(hist),
                min,
                max,
                sum,
            },
        }
    }

    pub fn is_approximate(&self) -> bool {
        matches!(self.inner, TrendInner::Histogram { .. })
    }

    pub fn count(&self) -> u64 {
        match &self.inner {
            TrendInner::Exact(s) => s.len() as u64,
            TrendInner::Histogram { hist, .. } => hist.len(),
        }
    }

    pub fn min(&self) -> f64 {
        if self.count() == 0 {
            return 0.0;
        }
        match &self.inner {
            TrendInner::Exact(s) => s[0],
            TrendInner::Histogram { min, .. } => *min,
        }
    }

    pub fn max(&self) -> f64 {
        if self.count() == 0 {
            return 0.0;
        }
        match &self.inner {
            TrendInner::Exact(s) => s[s.len() - 1],
            TrendInner::Histogram { max, .. } => *max,
        }
    }

    pub fn mean(&self) -> f64 {
        let count = self.count();
        if count == 0 {
            return 0.0;
        }
        let sum = match &self.inner {
            TrendInner::Exact(s) => s.iter().sum::<f64>(),
            TrendInner::Histogram { sum, .. } => *sum,
        };
        sum / count as f64
    }

    pub fn med(&self) -> f64 {
        self.percentile(50.0)
    }

    /// `p` in `[0, 100]`. Exact storage interpolates linearly between the
    /// two closest ranks, so `percentile(0) == min()` and
    /// `percentile(100) == max()` in both modes.
    pub fn percentile(&self, p: f64) -> f64 {
        if self.count() == 0 {
            return 0.0;
        }
        let p = p.clamp(0.0, 100.0);
        match &self.inner {
            TrendInner::Exact(s) => {
                let rank = p / 100.0 * (s.len() - 1) as f64;
                let lo = rank.floor() as usize;
                let hi = rank.ceil() as usize;
                s[lo] + (s[hi] - s[lo]) * (rank - lo as f64)
            }
            TrendInner::Histogram { hist, min, max, .. } => {
                if p <= 0.0 {
                    *min
                } else if p >= 100.0 {
                    *max
                } else {
                    (hist.value_at_percentile(p) as f64 / 1000.0).clamp(*min, *max)
                }
            }
        }
    }
}
