use crate::engine::{MetricKind, MetricValue, RunSummary, names, rate_of};
use crate::types::{LoadConfig, ThresholdAccessor, ThresholdResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

const TREND_PERCENTILES: &[f64] = &[90.0, 95.0, 99.0];

#[derive(Debug, Serialize, Deserialize)]
pub struct Report {
    pub metadata: Metadata,
    pub summary: Summary,
    pub metrics: BTreeMap<String, MetricReport>,
    pub checks: Vec<CheckReport>,
    pub thresholds: ThresholdsOutput,
    pub passed: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ThresholdsOutput {
    pub passed: bool,
    pub results: Vec<ThresholdResult>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Metadata {
    pub tool: String,
    pub version: String,
    pub test_name: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub aborted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aborted_by: Option<String>,
    /// VUs cut off mid-iteration when the graceful stop period ran out
    pub interrupted_vus: u32,
    pub stages: Vec<StageOutput>,
    pub requests: Vec<RequestOutput>,
    pub env: Environment,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StageOutput {
    pub duration_secs: f64,
    pub target: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RequestOutput {
    pub name: String,
    pub method: String,
    pub url: String,
    pub headers: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Environment {
    pub hostname: String,
    pub os: String,
    pub cpus: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Summary {
    pub iterations: u64,
    pub failed_iterations: u64,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub error_rate: f64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MetricReport {
    #[serde(rename = "type")]
    pub kind: MetricKind,
    pub values: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub approximate: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub thresholds: BTreeMap<String, ThresholdOk>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ThresholdOk {
    pub ok: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CheckReport {
    pub name: String,
    pub request: String,
    pub passes: u64,
    pub fails: u64,
}

fn redact_header(name: &str, value: &str) -> String {
    let lower = name.to_lowercase();
    if lower == "authorization"
        || lower == "cookie"
        || lower == "x-api-key"
        || lower.contains("token")
        || lower.contains("secret")
        || lower.contains("password")
    {
        format!("{}: <redacted>", name)
    } else {
        format!("{}: {}", name, value)
    }
}

/// Build the report for a finished run. Timestamps come from the summary,
/// so building twice yields the same document.
pub fn create_report(
    summary: &RunSummary,
    config: &LoadConfig,
    threshold_results: &[ThresholdResult],
) -> Report {
    let snapshot = &summary.snapshot;
    let elapsed_secs = snapshot.elapsed.as_secs_f64();

    let mut metrics = BTreeMap::new();
    for (name, value) in &snapshot.metrics {
        let mut values = BTreeMap::new();
        let mut approximate = false;

        match value {
            MetricValue::Counter { count } => {
                values.insert("count".to_string(), *count as f64);
                let rate = if elapsed_secs > 0.0 {
                    *count as f64 / elapsed_secs
                } else {
                    0.0
                };
                values.insert("rate".to_string(), rate);
            }
            MetricValue::Rate { trues, total } => {
                values.insert("rate".to_string(), rate_of(*trues, *total));
                values.insert("passes".to_string(), *trues as f64);
                values.insert("fails".to_string(), (total - trues) as f64);
            }
            MetricValue::Trend(trend) => {
                approximate = trend.is_approximate();
                values.insert("avg".to_string(), trend.mean());
                values.insert("min".to_string(), trend.min());
                values.insert("med".to_string(), trend.med());
                values.insert("max".to_string(), trend.max());

                let requested = config.thresholds.iter().filter_map(|t| match t.accessor {
                    ThresholdAccessor::Percentile(p) if t.metric == *name => Some(p),
                    _ => None,
                });
                for p in TREND_PERCENTILES.iter().copied().chain(requested) {
                    values.insert(format!("p({})", p), trend.percentile(p));
                }
            }
        }

        let thresholds = threshold_results
            .iter()
            .filter(|r| r.metric == *name)
            .map(|r| (r.expression.clone(), ThresholdOk { ok: r.passed }))
            .collect();

        metrics.insert(
            name.clone(),
            MetricReport {
                kind: value.kind(),
                values,
                approximate,
                thresholds,
            },
        );
    }

    let mut seen = BTreeSet::new();
    let mut checks = Vec::new();
    for request in &config.requests {
        for check in &request.checks {
            if !seen.insert(check.name.clone()) {
                continue;
            }
            let (passes, total) = snapshot
                .rate_counts(&names::per_check(&check.name))
                .unwrap_or((0, 0));
            checks.push(CheckReport {
                name: check.name.clone(),
                request: request.name.clone(),
                passes,
                fails: total - passes,
            });
        }
    }

    let (failed_requests, total_from_rate) = snapshot
        .rate_counts(names::HTTP_REQ_FAILED)
        .unwrap_or((0, 0));
    let thresholds_passed = threshold_results.iter().all(|r| r.passed);

    Report {
        metadata: Metadata {
            tool: "rampstage".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            test_name: config.test_name.clone(),
            started_at: summary.started_at,
            ended_at: summary.ended_at,
            duration_secs: elapsed_secs,
            aborted: summary.aborted(),
            aborted_by: summary.aborted_by.clone(),
            interrupted_vus: summary.interrupted,
            stages: config
                .stages
                .iter()
                .map(|s| StageOutput {
                    duration_secs: s.duration.as_secs_f64(),
                    target: s.target,
                })
                .collect(),
            requests: config
                .requests
                .iter()
                .map(|r| RequestOutput {
                    name: r.name.clone(),
                    method: r.method.to_string(),
                    url: r.url.clone(),
                    headers: r.headers.iter().map(|(k, v)| redact_header(k, v)).collect(),
                })
                .collect(),
            env: Environment {
                hostname: hostname::get()
                    .map(|h| h.to_string_lossy().to_string())
                    .unwrap_or_else(|_| "unknown".to_string()),
                os: std::env::consts::OS.to_string(),
                cpus: num_cpus(),
            },
        },
        summary: Summary {
            iterations: snapshot.counter(names::ITERATIONS).unwrap_or(0),
            failed_iterations: snapshot.counter(names::FAILED_ITERATIONS).unwrap_or(0),
            total_requests: snapshot.counter(names::HTTP_REQS).unwrap_or(total_from_rate),
            failed_requests,
            error_rate: snapshot.rate(names::HTTP_REQ_FAILED).unwrap_or(0.0),
        },
        metrics,
        checks,
        thresholds: ThresholdsOutput {
            passed: thresholds_passed,
            results: threshold_results.to_vec(),
        },
        passed: thresholds_passed,
    }
}

pub fn write_json(report: &Report, path: &Path) -> io::Result<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, report)?;
    writer.write_all(b"\n")?;
    writer.flush()
}

pub fn print_json(report: &Report) -> io::Result<()> {
    let stdout = io::stdout();
    let mut writer = BufWriter::new(stdout.lock());
    serde_json::to_writer_pretty(&mut writer, report)?;
    writer.write_all(b"\n")?;
    writer.flush()
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1)
}
