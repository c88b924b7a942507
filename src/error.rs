use crate::engine::MetricKind;
use std::path::PathBuf;
use thiserror::Error;

/// Everything that can be wrong with a test definition. All of these are
/// raised before the first virtual user is spawned.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("environment variable '{0}' not set")]
    MissingEnvVar(String),

    #[error("invalid stage list: {0}")]
    InvalidStages(String),

    #[error("no requests defined; add at least one [[requests]] entry")]
    NoRequests,

    #[error("request '{name}': {reason}")]
    InvalidRequest { name: String, reason: String },

    #[error("duplicate request name '{0}'")]
    DuplicateRequest(String),

    #[error("check '{name}': cannot parse condition '{condition}': {reason}")]
    InvalidCheck {
        name: String,
        condition: String,
        reason: String,
    },

    #[error("threshold on unknown metric '{0}'")]
    UnknownMetric(String),

    #[error("malformed threshold '{expression}' on '{metric}': {reason}")]
    MalformedThreshold {
        metric: String,
        expression: String,
        reason: String,
    },

    #[error("invalid think time: min {min:?} is greater than max {max:?}")]
    InvalidThinkTime {
        min: std::time::Duration,
        max: std::time::Duration,
    },

    #[error("tick interval must be greater than zero")]
    ZeroTick,

    #[error("cannot register metric: {0}")]
    Metric(#[from] MetricError),
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum MetricError {
    #[error("metric '{name}' is a {existing}, cannot record it as a {requested}")]
    KindMismatch {
        name: String,
        existing: MetricKind,
        requested: MetricKind,
    },

    #[error("sample does not fit metric kind {0}")]
    SampleMismatch(MetricKind),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to create HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("failed to write output: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}
