use crate::engine::Registry;
use crate::engine::metrics::names;
use crate::error::MetricError;
use crate::http::execute_request;
use crate::types::{RequestSpec, ResponseView};
use rand::Rng;
use regex_lite::{Captures, Regex};
use reqwest::Client;
use std::sync::LazyLock;
use std::time::Instant;

static TEMPLATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{(VU|ITERATION|TIMESTAMP_MS|TIMESTAMP|RANDOM:(\d+))\}")
        .expect("template pattern is valid")
});

/// Names reserved for per-request templates; config loading leaves these alone.
pub const TEMPLATE_VARS: &[&str] = &["VU", "ITERATION", "TIMESTAMP_MS", "TIMESTAMP", "RANDOM"];

#[derive(Debug, Clone, Copy)]
pub struct IterationContext {
    pub vu: u32,
    pub iteration: u64,
}

pub fn interpolate(template: &str, ctx: &IterationContext) -> String {
    if !template.contains("${") {
        return template.to_string();
    }

    TEMPLATE_RE
        .replace_all(template, |caps: &Captures<'_>| match &caps[1] {
            "VU" => ctx.vu.to_string(),
            "ITERATION" => ctx.iteration.to_string(),
            "TIMESTAMP_MS" => chrono::Utc::now().timestamp_millis().to_string(),
            "TIMESTAMP" => chrono::Utc::now().to_rfc3339(),
            _ => {
                let bound = caps
                    .get(2)
                    .and_then(|m| m.as_str().parse::<u64>().ok())
                    .unwrap_or(0);
                if bound == 0 {
                    "0".to_string()
                } else {
                    rand::rng().random_range(0..bound).to_string()
                }
            }
        })
        .into_owned()
}

/// Run every request of the scenario once, in order.
///
/// Transport failures and failed checks are recorded and the iteration moves
/// on; only a metric that cannot be recorded aborts it.
pub async fn execute_iteration(
    client: &Client,
    requests: &[RequestSpec],
    registry: &Registry,
    ctx: IterationContext,
) -> Result<(), MetricError> {
    let started = Instant::now();

    for spec in requests {
        let url = interpolate(&spec.url, &ctx);
        let headers: Vec<(String, String)> = spec
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), interpolate(v, &ctx)))
            .collect();
        let body = spec.body.as_ref().map(|b| interpolate(b, &ctx));

        let result = execute_request(
            client,
            &url,
            &spec.method,
            &headers,
            body.as_deref(),
            spec.needs_body(),
        )
        .await;

        if let Some(kind) = result.error {
            tracing::trace!("VU {} request '{}' failed: {}", ctx.vu, spec.name, kind.as_str());
        }

        let duration_ms = result.latency_ms();
        registry.add(names::HTTP_REQS, 1)?;
        registry.push(names::HTTP_REQ_DURATION, duration_ms)?;
        registry.observe(names::HTTP_REQ_FAILED, result.is_failed())?;
        registry.add(names::DATA_RECEIVED, result.bytes_received)?;
        registry.add(&names::per_request(names::HTTP_REQS, &spec.name), 1)?;
        registry.push(&names::per_request(names::HTTP_REQ_DURATION, &spec.name), duration_ms)?;

        let view = ResponseView::new(result.status, duration_ms, result.body.as_deref().unwrap_or(""));
        for check in &spec.checks {
            let passed = check.condition.evaluate(&view);
            registry.observe(names::CHECKS, passed)?;
            registry.observe(&names::per_check(&check.name), passed)?;
            registry.observe(names::ERRORS, !passed)?;
        }
    }

    registry.add(names::ITERATIONS, 1)?;
    registry.push(
        names::ITERATION_DURATION,
        started.elapsed().as_secs_f64() * 1000.0,
    )?;
    Ok(())
}
