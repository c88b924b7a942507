use crate::engine::MetricKind;
use crate::engine::snapshot::{MetricValue, MetricsSnapshot, rate_of};
use crate::error::ConfigError;
use crate::types::{Threshold, ThresholdAccessor, ThresholdOp, ThresholdResult};
use std::time::Duration;

/// Parse `[accessor] op literal`, e.g. `p(95) < 500`, `rate<0.01`, `count >= 100`.
///
/// `kind` is the kind of the metric the threshold is attached to, or `None`
/// when no such metric exists.
pub fn parse_threshold(
    metric: &str,
    expression: &str,
    kind: Option<MetricKind>,
) -> Result<Threshold, ConfigError> {
    let malformed = |reason: &str| ConfigError::MalformedThreshold {
        metric: metric.to_string(),
        expression: expression.to_string(),
        reason: reason.to_string(),
    };

    let kind = kind.ok_or_else(|| ConfigError::UnknownMetric(metric.to_string()))?;

    let trimmed = expression.trim();
    let op_pos = trimmed
        .find(['<', '>'])
        .ok_or_else(|| malformed("expected one of <, <=, >, >="))?;

    let rest = &trimmed[op_pos..];
    let (operator, op_len) = if rest.starts_with("<=") {
        (ThresholdOp::Lte, 2)
    } else if rest.starts_with(">=") {
        (ThresholdOp::Gte, 2)
    } else if rest.starts_with('<') {
        (ThresholdOp::Lt, 1)
    } else {
        (ThresholdOp::Gt, 1)
    };

    let accessor = parse_accessor(trimmed[..op_pos].trim()).map_err(|r| malformed(&r))?;

    let literal = trimmed[op_pos + op_len..].trim();
    let value: f64 = literal
        .parse()
        .ok()
        .filter(|v: &f64| v.is_finite())
        .ok_or_else(|| malformed(&format!("'{}' is not a number", literal)))?;

    let applies = match accessor {
        ThresholdAccessor::Value => true,
        ThresholdAccessor::Count => kind == MetricKind::Counter,
        ThresholdAccessor::Rate => matches!(kind, MetricKind::Counter | MetricKind::Rate),
        ThresholdAccessor::Avg
        | ThresholdAccessor::Min
        | ThresholdAccessor::Med
        | ThresholdAccessor::Max
        | ThresholdAccessor::Percentile(_) => kind == MetricKind::Trend,
    };
    if !applies {
        return Err(malformed(&format!(
            "'{}' does not apply to {} metrics",
            accessor.label(),
            kind
        )));
    }

    Ok(Threshold {
        metric: metric.to_string(),
        expression: trimmed.to_string(),
        accessor,
        operator,
        value,
        abort_on_fail: false,
        delay_abort_eval: Duration::ZERO,
    })
}

fn parse_accessor(s: &str) -> Result<ThresholdAccessor, String> {
    let accessor = match s {
        "" | "value" => ThresholdAccessor::Value,
        "count" => ThresholdAccessor::Count,
        "rate" => ThresholdAccessor::Rate,
        "avg" => ThresholdAccessor::Avg,
        "min" => ThresholdAccessor::Min,
        "med" => ThresholdAccessor::Med,
        "max" => ThresholdAccessor::Max,
        _ => {
            let inner = s
                .strip_prefix("p(")
                .and_then(|r| r.strip_suffix(')'))
                .ok_or_else(|| format!("unknown aggregation '{}'", s))?;
            let p: f64 = inner
                .trim()
                .parse()
                .map_err(|_| format!("invalid percentile '{}'", inner))?;
            if !(0.0..=100.0).contains(&p) {
                return Err(format!("percentile {} is outside 0..=100", p));
            }
            ThresholdAccessor::Percentile(p)
        }
    };
    Ok(accessor)
}

pub fn evaluate_thresholds(
    thresholds: &[Threshold],
    snapshot: &MetricsSnapshot,
) -> Vec<ThresholdResult> {
    thresholds
        .iter()
        .map(|t| evaluate_threshold(t, snapshot))
        .collect()
}

pub fn evaluate_threshold(threshold: &Threshold, snapshot: &MetricsSnapshot) -> ThresholdResult {
    let actual = match snapshot.get(&threshold.metric) {
        Some(value) => metric_value(threshold.accessor, value, snapshot.elapsed),
        None => {
            tracing::warn!("Threshold metric '{}' has no data", threshold.metric);
            0.0
        }
    };
    let passed = threshold.operator.evaluate(actual, threshold.value);

    ThresholdResult {
        metric: threshold.metric.clone(),
        expression: threshold.expression.clone(),
        actual,
        passed,
    }
}

fn metric_value(accessor: ThresholdAccessor, value: &MetricValue, elapsed: Duration) -> f64 {
    match value {
        MetricValue::Counter { count } => match accessor {
            ThresholdAccessor::Rate => {
                let secs = elapsed.as_secs_f64();
                if secs > 0.0 { *count as f64 / secs } else { 0.0 }
            }
            _ => *count as f64,
        },
        MetricValue::Rate { trues, total } => rate_of(*trues, *total),
        MetricValue::Trend(trend) => match accessor {
            ThresholdAccessor::Min => trend.min(),
            ThresholdAccessor::Med => trend.med(),
            ThresholdAccessor::Max => trend.max(),
            ThresholdAccessor::Percentile(p) => trend.percentile(p),
            _ => trend.mean(),
        },
    }
}

pub fn print_threshold_results(results: &[ThresholdResult]) {
    if results.is_empty() {
        return;
    }

    println!("\n{}", "=".repeat(60));
    println!("THRESHOLDS");
    println!("{}", "=".repeat(60));

    let any_failed = results.iter().any(|r| !r.passed);

    for result in results {
        let status = if result.passed {
            "\x1b[32m✓ PASS\x1b[0m"
        } else {
            "\x1b[31m✗ FAIL\x1b[0m"
        };

        println!(
            "  {} {}: {} (actual: {})",
            status,
            result.metric,
            result.expression,
            format_metric_value(&result.metric, result.actual)
        );
    }

    println!();
    if any_failed {
        println!("\x1b[31mThresholds failed! Exiting with code 4.\x1b[0m");
    } else {
        println!("\x1b[32mAll thresholds passed.\x1b[0m");
    }
}

fn format_metric_value(metric: &str, value: f64) -> String {
    if metric.contains("duration") {
        format!("{:.2}ms", value)
    } else if metric.starts_with("http_req_failed")
        || metric.starts_with("checks")
        || metric.starts_with("errors")
    {
        format!("{:.4}", value)
    } else {
        format!("{:.2}", value)
    }
}
