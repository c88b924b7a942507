use crate::error::ConfigError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::cell::OnceCell;
use std::path::PathBuf;
use std::time::Duration;

// ============================================================================
// Stages
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Stage {
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    pub target: u32,
}

// ============================================================================
// Requests & Checks
// ============================================================================

#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub name: String,
    pub method: reqwest::Method,
    /// Absolute URL, may contain `${...}` templates
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
    pub checks: Vec<Check>,
}

impl RequestSpec {
    pub fn needs_body(&self) -> bool {
        self.checks.iter().any(|c| c.condition.needs_body())
    }
}

#[derive(Debug, Clone)]
pub struct Check {
    pub name: String,
    pub condition: CheckCondition,
}

#[derive(Debug, Clone)]
pub enum CheckCondition {
    StatusEquals(u16),
    StatusNotEquals(u16),
    StatusIn(Vec<u16>),
    StatusLt(u16),
    StatusGt(u16),
    DurationLt(f64),
    DurationLte(f64),
    BodyContains(String),
    BodyNotContains(String),
    BodyMatches(regex_lite::Regex),
    /// JSON pointer must resolve to a non-null, non-empty value
    JsonExists(String),
    JsonEquals(String, serde_json::Value),
}

/// What a check gets to look at. The body is parsed as JSON at most once,
/// and only when a JSON check asks for it.
pub struct ResponseView<'a> {
    pub status: Option<u16>,
    pub duration_ms: f64,
    pub body: &'a str,
    json: OnceCell<Option<serde_json::Value>>,
}

impl<'a> ResponseView<'a> {
    pub fn new(status: Option<u16>, duration_ms: f64, body: &'a str) -> Self {
        Self {
            status,
            duration_ms,
            body,
            json: OnceCell::new(),
        }
    }

    fn json(&self) -> Option<&serde_json::Value> {
        self.json
            .get_or_init(|| serde_json::from_str(self.body).ok())
            .as_ref()
    }
}

impl CheckCondition {
    pub fn parse(s: &str) -> Result<Self, String> {
        let s = s.trim();
        let (subject, rest) = s
            .split_once(char::is_whitespace)
            .ok_or("expected '<subject> <operator> <value>'")?;
        let rest = rest.trim();

        match subject {
            "status" => parse_status_condition(rest),
            "duration" => {
                if let Some(v) = rest.strip_prefix("<=") {
                    Ok(CheckCondition::DurationLte(parse_millis(v)?))
                } else if let Some(v) = rest.strip_prefix('<') {
                    Ok(CheckCondition::DurationLt(parse_millis(v)?))
                } else {
                    Err("duration supports only '<' and '<='".to_string())
                }
            }
            "body" => {
                if let Some(v) = rest.strip_prefix("not contains") {
                    Ok(CheckCondition::BodyNotContains(unquote(v)?))
                } else if let Some(v) = rest.strip_prefix("contains") {
                    Ok(CheckCondition::BodyContains(unquote(v)?))
                } else if let Some(v) = rest.strip_prefix("matches") {
                    let pattern = unquote(v)?;
                    let re = regex_lite::Regex::new(&pattern)
                        .map_err(|e| format!("invalid regex: {}", e))?;
                    Ok(CheckCondition::BodyMatches(re))
                } else {
                    Err("body supports 'contains', 'not contains' and 'matches'".to_string())
                }
            }
            "json" => {
                let (path, op) = rest
                    .split_once(char::is_whitespace)
                    .ok_or("expected 'json <path> exists' or 'json <path> == <value>'")?;
                let pointer = json_pointer(path);
                let op = op.trim();
                if op == "exists" {
                    Ok(CheckCondition::JsonExists(pointer))
                } else if let Some(literal) = op.strip_prefix("==") {
                    let value = serde_json::from_str(literal.trim())
                        .map_err(|e| format!("invalid JSON literal: {}", e))?;
                    Ok(CheckCondition::JsonEquals(pointer, value))
                } else {
                    Err(format!("unknown json operator '{}'", op))
                }
            }
            other => Err(format!(
                "unknown subject '{}'. Expected status, duration, body or json",
                other
            )),
        }
    }

    pub fn needs_body(&self) -> bool {
        !matches!(
            self,
            CheckCondition::StatusEquals(_)
                | CheckCondition::StatusNotEquals(_)
                | CheckCondition::StatusIn(_)
                | CheckCondition::StatusLt(_)
                | CheckCondition::StatusGt(_)
                | CheckCondition::DurationLt(_)
                | CheckCondition::DurationLte(_)
        )
    }

    pub fn evaluate(&self, response: &ResponseView<'_>) -> bool {
        let status = response.status;
        match self {
            CheckCondition::StatusEquals(expected) => status == Some(*expected),
            CheckCondition::StatusNotEquals(code) => status.is_some_and(|s| s != *code),
            CheckCondition::StatusIn(codes) => status.is_some_and(|s| codes.contains(&s)),
            CheckCondition::StatusLt(threshold) => status.is_some_and(|s| s < *threshold),
            CheckCondition::StatusGt(threshold) => status.is_some_and(|s| s > *threshold),
            CheckCondition::DurationLt(ms) => response.duration_ms < *ms,
            CheckCondition::DurationLte(ms) => response.duration_ms <= *ms,
            CheckCondition::BodyContains(needle) => response.body.contains(needle.as_str()),
            CheckCondition::BodyNotContains(needle) => !response.body.contains(needle.as_str()),
            CheckCondition::BodyMatches(re) => re.is_match(response.body),
            CheckCondition::JsonExists(pointer) => response
                .json()
                .and_then(|v| v.pointer(pointer))
                .is_some_and(is_present),
            CheckCondition::JsonEquals(pointer, expected) => response
                .json()
                .and_then(|v| v.pointer(pointer))
                .is_some_and(|v| v == expected),
        }
    }
}

fn parse_status_condition(rest: &str) -> Result<CheckCondition, String> {
    let parse_code = |v: &str| {
        v.trim()
            .parse::<u16>()
            .map_err(|_| format!("'{}' is not a status code", v.trim()))
    };

    if let Some(v) = rest.strip_prefix("==") {
        Ok(CheckCondition::StatusEquals(parse_code(v)?))
    } else if let Some(v) = rest.strip_prefix("!=") {
        Ok(CheckCondition::StatusNotEquals(parse_code(v)?))
    } else if let Some(v) = rest.strip_prefix('<') {
        Ok(CheckCondition::StatusLt(parse_code(v)?))
    } else if let Some(v) = rest.strip_prefix('>') {
        Ok(CheckCondition::StatusGt(parse_code(v)?))
    } else if let Some(v) = rest.strip_prefix("in") {
        let list = v
            .trim()
            .strip_prefix('[')
            .and_then(|v| v.strip_suffix(']'))
            .ok_or("expected a list like [200, 201]")?;
        let codes = list
            .split(',')
            .filter(|c| !c.trim().is_empty())
            .map(parse_code)
            .collect::<Result<Vec<_>, _>>()?;
        if codes.is_empty() {
            return Err("status list is empty".to_string());
        }
        Ok(CheckCondition::StatusIn(codes))
    } else {
        Err(format!("unknown status operator in '{}'", rest))
    }
}

fn parse_millis(v: &str) -> Result<f64, String> {
    let v = v.trim();
    let v = v.strip_suffix("ms").unwrap_or(v).trim();
    v.parse::<f64>()
        .map_err(|_| format!("'{}' is not a number of milliseconds", v))
}

fn unquote(v: &str) -> Result<String, String> {
    let v = v.trim();
    v.strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .or_else(|| v.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')))
        .map(str::to_string)
        .ok_or_else(|| format!("expected a quoted string, got {}", v))
}

/// `data.items.0.id` -> `/data/items/0/id`
fn json_pointer(path: &str) -> String {
    let path = path.strip_prefix("$.").unwrap_or(path);
    if path.starts_with('/') {
        return path.to_string();
    }
    path.split('.')
        .map(|seg| format!("/{}", seg.replace('~', "~0").replace('/', "~1")))
        .collect()
}

fn is_present(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => false,
        serde_json::Value::String(s) => !s.is_empty(),
        serde_json::Value::Array(a) => !a.is_empty(),
        serde_json::Value::Object(o) => !o.is_empty(),
        _ => true,
    }
}

// ============================================================================
// Thresholds
// ============================================================================

/// Parsed form of an expression such as `p(95) < 500`.
#[derive(Debug, Clone, PartialEq)]
pub struct Threshold {
    pub metric: String,
    pub expression: String,
    pub accessor: ThresholdAccessor,
    pub operator: ThresholdOp,
    pub value: f64,
    pub abort_on_fail: bool,
    pub delay_abort_eval: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ThresholdAccessor {
    Value,
    Count,
    Rate,
    Avg,
    Min,
    Med,
    Max,
    Percentile(f64),
}

impl ThresholdAccessor {
    pub fn label(&self) -> String {
        match self {
            ThresholdAccessor::Value => "value".to_string(),
            ThresholdAccessor::Count => "count".to_string(),
            ThresholdAccessor::Rate => "rate".to_string(),
            ThresholdAccessor::Avg => "avg".to_string(),
            ThresholdAccessor::Min => "min".to_string(),
            ThresholdAccessor::Med => "med".to_string(),
            ThresholdAccessor::Max => "max".to_string(),
            ThresholdAccessor::Percentile(p) => format!("p({})", p),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdOp {
    Lt,
    Lte,
    Gt,
    Gte,
}

impl ThresholdOp {
    pub fn evaluate(&self, actual: f64, expected: f64) -> bool {
        match self {
            ThresholdOp::Lt => actual < expected,
            ThresholdOp::Lte => actual <= expected,
            ThresholdOp::Gt => actual > expected,
            ThresholdOp::Gte => actual >= expected,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdResult {
    pub metric: String,
    pub expression: String,
    pub actual: f64,
    pub passed: bool,
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    Dns,
    Connect,
    Tls,
    Refused,
    Reset,
    Http,
    Body,
    Other,
}

impl ErrorKind {
    pub fn from_reqwest_error(err: &reqwest::Error) -> Self {
        let msg = err.to_string();
        if err.is_timeout() {
            ErrorKind::Timeout
        } else if err.is_connect() {
            if msg.contains("dns") || msg.contains("resolve") {
                ErrorKind::Dns
            } else if msg.contains("refused") {
                ErrorKind::Refused
            } else if msg.contains("reset") {
                ErrorKind::Reset
            } else {
                ErrorKind::Connect
            }
        } else if err.is_request() || err.is_builder() {
            ErrorKind::Http
        } else if err.is_body() || err.is_decode() {
            ErrorKind::Body
        } else if msg.contains("tls") || msg.contains("certificate") {
            ErrorKind::Tls
        } else {
            ErrorKind::Other
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::Dns => "dns",
            ErrorKind::Connect => "connect",
            ErrorKind::Tls => "tls",
            ErrorKind::Refused => "refused",
            ErrorKind::Reset => "reset",
            ErrorKind::Http => "http",
            ErrorKind::Body => "body",
            ErrorKind::Other => "other",
        }
    }
}

// ============================================================================
// HTTP Request Result
// ============================================================================

#[derive(Debug, Clone)]
pub struct RequestResult {
    pub latency_us: u64,
    pub status: Option<u16>,
    pub error: Option<ErrorKind>,
    pub bytes_received: u64,
    pub body: Option<String>,
}

impl RequestResult {
    pub fn success(latency_us: u64, status: u16, bytes_received: u64, body: Option<String>) -> Self {
        Self {
            latency_us,
            status: Some(status),
            error: None,
            bytes_received,
            body,
        }
    }

    pub fn error(latency_us: u64, kind: ErrorKind) -> Self {
        Self {
            latency_us,
            status: None,
            error: Some(kind),
            bytes_received: 0,
            body: None,
        }
    }

    pub fn latency_ms(&self) -> f64 {
        self.latency_us as f64 / 1000.0
    }

    /// Transport errors and anything outside 200..=399 count as failed.
    pub fn is_failed(&self) -> bool {
        !self.status.is_some_and(|s| (200..400).contains(&s))
    }
}

// ============================================================================
// Load configuration
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ThinkTime {
    #[serde(with = "humantime_serde")]
    pub min: Duration,
    #[serde(with = "humantime_serde")]
    pub max: Duration,
}

impl ThinkTime {
    pub fn new(min: Duration, max: Duration) -> Result<Self, ConfigError> {
        if min > max {
            return Err(ConfigError::InvalidThinkTime { min, max });
        }
        Ok(Self { min, max })
    }

    /// Uniformly distributed in `[min, max]`.
    pub fn sample(&self) -> Duration {
        if self.min == self.max {
            return self.min;
        }
        let min = self.min.as_secs_f64();
        let max = self.max.as_secs_f64();
        Duration::from_secs_f64(rand::rng().random_range(min..=max))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendStorage {
    /// Every sample retained, exact percentiles
    #[default]
    Exact,
    /// HDR histogram, bounded memory, approximate percentiles
    Histogram,
}

#[derive(Debug, Clone)]
pub struct LoadConfig {
    pub test_name: String,
    pub stages: Vec<Stage>,
    pub start_target: u32,
    pub requests: Vec<RequestSpec>,
    pub thresholds: Vec<Threshold>,
    pub think_time: ThinkTime,
    pub tick: Duration,
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub graceful_stop: Duration,
    pub insecure: bool,
    pub trend_storage: TrendStorage,
    pub summary_file: Option<PathBuf>,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            test_name: "rampstage".to_string(),
            stages: Vec::new(),
            start_target: 0,
            requests: Vec::new(),
            thresholds: Vec::new(),
            think_time: ThinkTime {
                min: Duration::ZERO,
                max: Duration::ZERO,
            },
            tick: Duration::from_secs(1),
            timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(5),
            graceful_stop: Duration::from_secs(30),
            insecure: false,
            trend_storage: TrendStorage::Exact,
            summary_file: None,
        }
    }
}

impl LoadConfig {
    pub fn total_duration(&self) -> Duration {
        self.stages.iter().map(|s| s.duration).sum()
    }

    pub fn max_target(&self) -> u32 {
        self.stages
            .iter()
            .map(|s| s.target)
            .max()
            .unwrap_or(0)
            .max(self.start_target)
    }
}

/// Lifecycle of a test run as seen from outside the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RunState {
    #[default]
    Initializing,
    Running,
    Draining,
    Completed,
    Aborted,
}
