mod iteration;
pub mod metrics;
mod pool;
mod runner;
mod scheduler;
pub mod snapshot;
mod thresholds;
mod worker;

pub use iteration::TEMPLATE_VARS;
pub use metrics::{MetricKind, Registry, builtin_metrics, names};
pub use runner::{Engine, RunSummary};
pub use scheduler::{StageInfo, StagePlan};
pub use snapshot::{MetricValue, rate_of};
pub use thresholds::{evaluate_thresholds, parse_threshold, print_threshold_results};
