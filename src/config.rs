use crate::cli::RunArgs;
use crate::engine::{StagePlan, TEMPLATE_VARS, builtin_metrics, parse_threshold};
use crate::error::ConfigError;
use crate::types::{
    Check, CheckCondition, LoadConfig, RequestSpec, Stage, ThinkTime, Threshold, TrendStorage,
};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

const METHODS: &[&str] = &["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS"];

static ENV_VAR_RE: LazyLock<regex_lite::Regex> = LazyLock::new(|| {
    regex_lite::Regex::new(r"\$\{([^}]+)\}").expect("env var pattern is valid")
});

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct TomlConfig {
    #[serde(default)]
    pub test: TestSection,
    #[serde(default)]
    pub load: LoadSection,
    #[serde(default)]
    pub stages: Vec<StageConfig>,
    #[serde(default)]
    pub thresholds: BTreeMap<String, Vec<ThresholdEntry>>,
    #[serde(default)]
    pub requests: Vec<RequestConfig>,
    #[serde(default)]
    pub output: OutputSection,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct TestSection {
    pub name: Option<String>,
    pub base_url: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct LoadSection {
    pub think_time: Option<ThinkTimeConfig>,
    #[serde(default, with = "humantime_serde::option")]
    pub tick: Option<Duration>,
    #[serde(default, with = "humantime_serde::option")]
    pub timeout: Option<Duration>,
    #[serde(default, with = "humantime_serde::option")]
    pub connect_timeout: Option<Duration>,
    #[serde(default, with = "humantime_serde::option")]
    pub graceful_stop: Option<Duration>,
    pub start_target: Option<u32>,
    pub trend_storage: Option<TrendStorage>,
    #[serde(default)]
    pub insecure: bool,
}

/// `think_time = "1s"` or `think_time = { min = "1s", max = "3s" }`
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ThinkTimeConfig {
    Fixed(#[serde(with = "humantime_serde")] Duration),
    Range {
        #[serde(with = "humantime_serde")]
        min: Duration,
        #[serde(with = "humantime_serde")]
        max: Duration,
    },
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageConfig {
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    pub target: u32,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ThresholdEntry {
    Expression(String),
    Detailed {
        threshold: String,
        #[serde(default)]
        abort_on_fail: bool,
        #[serde(default, with = "humantime_serde::option")]
        delay_abort_eval: Option<Duration>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestConfig {
    pub name: String,
    #[serde(default = "default_method")]
    pub method: String,
    pub path: Option<String>,
    pub url: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
    #[serde(default)]
    pub checks: Vec<CheckConfig>,
}

fn default_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckConfig {
    pub name: Option<String>,
    pub condition: String,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct OutputSection {
    pub summary_file: Option<PathBuf>,
}

pub fn load_config(path: &Path) -> Result<TomlConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let content = interpolate_env_vars(&content)?;

    Ok(toml::from_str(&content)?)
}

/// Substitute `${VAR}` and `${VAR:-default}` from the environment.
/// Per-request template names such as `${VU}` or `${RANDOM:10}` are kept,
/// and comment lines are copied untouched.
fn interpolate_env_vars(content: &str) -> Result<String, ConfigError> {
    interpolate_with(content, |name| std::env::var(name).ok())
}

fn interpolate_with(
    content: &str,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<String, ConfigError> {
    let mut missing = None;
    let mut result = String::with_capacity(content.len());

    for line in content.split_inclusive('\n') {
        if line.trim_start().starts_with('#') {
            result.push_str(line);
            continue;
        }

        let replaced = ENV_VAR_RE.replace_all(line, |caps: &regex_lite::Captures<'_>| {
            let var_expr = &caps[1];

            let (var_name, default) = match var_expr.find(":-") {
                Some(pos) => (&var_expr[..pos], Some(&var_expr[pos + 2..])),
                None => (var_expr, None),
            };

            let template_name = var_name.split(':').next().unwrap_or(var_name);
            if default.is_none() && TEMPLATE_VARS.contains(&template_name) {
                return caps[0].to_string();
            }

            match lookup(var_name) {
                Some(v) => v,
                None => match default {
                    Some(d) => d.to_string(),
                    None => {
                        missing.get_or_insert_with(|| var_name.to_string());
                        String::new()
                    }
                },
            }
        });
        result.push_str(&replaced);
    }

    match missing {
        Some(name) => Err(ConfigError::MissingEnvVar(name)),
        None => Ok(result),
    }
}

pub fn merge_config(args: &RunArgs, toml: TomlConfig) -> Result<LoadConfig, ConfigError> {
    let defaults = LoadConfig::default();

    let test_name = toml
        .test
        .name
        .or_else(|| {
            args.config
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
        })
        .unwrap_or(defaults.test_name);

    let base_url = args.base_url.clone().or(toml.test.base_url);

    let start_target = toml.load.start_target.unwrap_or(0);
    let stages: Vec<Stage> = toml
        .stages
        .into_iter()
        .map(|s| Stage {
            duration: s.duration,
            target: s.target,
        })
        .collect();
    // Validates the stage list up front
    StagePlan::new(stages.clone(), start_target)?;

    let requests = build_requests(toml.requests, base_url.as_deref())?;

    let thresholds = build_thresholds(toml.thresholds, &requests)?;
    let thresholds = if args.no_thresholds {
        Vec::new()
    } else {
        thresholds
    };

    let think_time = match toml.load.think_time {
        None => defaults.think_time,
        Some(ThinkTimeConfig::Fixed(d)) => ThinkTime::new(d, d)?,
        Some(ThinkTimeConfig::Range { min, max }) => ThinkTime::new(min, max)?,
    };

    let tick = toml.load.tick.unwrap_or(defaults.tick);
    if tick.is_zero() {
        return Err(ConfigError::ZeroTick);
    }

    Ok(LoadConfig {
        test_name,
        stages,
        start_target,
        requests,
        thresholds,
        think_time,
        tick,
        timeout: toml.load.timeout.unwrap_or(defaults.timeout),
        connect_timeout: toml.load.connect_timeout.unwrap_or(defaults.connect_timeout),
        graceful_stop: toml.load.graceful_stop.unwrap_or(defaults.graceful_stop),
        insecure: args.insecure || toml.load.insecure,
        trend_storage: toml.load.trend_storage.unwrap_or_default(),
        summary_file: args.output.clone().or(toml.output.summary_file),
    })
}

fn build_requests(
    configs: Vec<RequestConfig>,
    base_url: Option<&str>,
) -> Result<Vec<RequestSpec>, ConfigError> {
    if configs.is_empty() {
        return Err(ConfigError::NoRequests);
    }

    let mut seen = HashSet::new();
    let mut requests = Vec::with_capacity(configs.len());

    for rc in configs {
        if !seen.insert(rc.name.clone()) {
            return Err(ConfigError::DuplicateRequest(rc.name));
        }

        let invalid = |reason: String| ConfigError::InvalidRequest {
            name: rc.name.clone(),
            reason,
        };

        let method_str = rc.method.to_uppercase();
        if !METHODS.contains(&method_str.as_str()) {
            return Err(invalid(format!("unsupported HTTP method '{}'", rc.method)));
        }
        let method = reqwest::Method::from_bytes(method_str.as_bytes())
            .map_err(|_| invalid(format!("invalid HTTP method '{}'", rc.method)))?;

        let url = match (&rc.url, &rc.path) {
            (Some(_), Some(_)) => {
                return Err(invalid("set either url or path, not both".to_string()));
            }
            (Some(url), None) => url.clone(),
            (None, Some(path)) => {
                let base = base_url.ok_or_else(|| {
                    invalid("path requires base_url in [test] or --base-url".to_string())
                })?;
                join_url(base, path)
            }
            (None, None) => return Err(invalid("url or path is required".to_string())),
        };

        let parsed = reqwest::Url::parse(&url)
            .map_err(|e| invalid(format!("bad URL '{}': {}", url, e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(invalid(format!("unsupported URL scheme '{}'", parsed.scheme())));
        }

        let mut checks = Vec::with_capacity(rc.checks.len());
        for cc in &rc.checks {
            let name = cc.name.clone().unwrap_or_else(|| cc.condition.clone());
            let condition =
                CheckCondition::parse(&cc.condition).map_err(|reason| ConfigError::InvalidCheck {
                    name: name.clone(),
                    condition: cc.condition.clone(),
                    reason,
                })?;
            checks.push(Check { name, condition });
        }

        requests.push(RequestSpec {
            name: rc.name.clone(),
            method,
            url,
            headers: rc.headers.clone().into_iter().collect(),
            body: rc.body.clone(),
            checks,
        });
    }

    Ok(requests)
}

fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    if path.starts_with('/') {
        format!("{}{}", base, path)
    } else {
        format!("{}/{}", base, path)
    }
}

fn build_thresholds(
    entries: BTreeMap<String, Vec<ThresholdEntry>>,
    requests: &[RequestSpec],
) -> Result<Vec<Threshold>, ConfigError> {
    let known: HashMap<String, crate::engine::MetricKind> =
        builtin_metrics(requests).into_iter().collect();

    let mut thresholds = Vec::new();
    for (metric, list) in entries {
        let kind = known.get(&metric).copied();
        for entry in list {
            let threshold = match entry {
                ThresholdEntry::Expression(expr) => parse_threshold(&metric, &expr, kind)?,
                ThresholdEntry::Detailed {
                    threshold,
                    abort_on_fail,
                    delay_abort_eval,
                } => Threshold {
                    abort_on_fail,
                    delay_abort_eval: delay_abort_eval.unwrap_or(Duration::ZERO),
                    ..parse_threshold(&metric, &threshold, kind)?
                },
            };
            thresholds.push(threshold);
        }
    }
    Ok(thresholds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ThresholdAccessor;
    use clap::Parser;

    fn args(extra: &[&str]) -> RunArgs {
        let mut argv = vec!["run", "-f", "smoke.toml"];
        argv.extend_from_slice(extra);
        RunArgs::parse_from(argv)
    }

    fn parse(content: &str) -> TomlConfig {
        toml::from_str(content).unwrap()
    }

    const MINIMAL: &str = r#"
        [test]
        base_url = "http://localhost:8080"

        [[stages]]
        duration = "10s"
        target = 5

        [[requests]]
        name = "health"
        path = "/health"
    "#;

    #[test]
    fn test_interpolation_keeps_template_vars() {
        let lookup = |name: &str| (name == "HOST").then(|| "example.com".to_string());
        let out = interpolate_with(
            "url = \"http://${HOST}/u/${VU}?i=${ITERATION}&r=${RANDOM:100}&t=${TIMESTAMP}\"",
            lookup,
        )
        .unwrap();
        assert_eq!(
            out,
            "url = \"http://example.com/u/${VU}?i=${ITERATION}&r=${RANDOM:100}&t=${TIMESTAMP}\""
        );
    }

    #[test]
    fn test_interpolation_defaults_and_missing() {
        let none = |_: &str| None;
        assert_eq!(
            interpolate_with("${BASE_URL:-http://localhost:8080}", none).unwrap(),
            "http://localhost:8080"
        );
        let err = interpolate_with("token = \"${API_TOKEN}\"", none).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(name) if name == "API_TOKEN"));
    }

    #[test]
    fn test_interpolation_skips_comment_lines() {
        let none = |_: &str| None;
        let content = "# Use ${NAME} or ${NAME:-default}\n  # ${ALSO_UNSET}\nurl = \"${HOST:-localhost}\" # ${TRAILING:-x}\n";
        assert_eq!(
            interpolate_with(content, none).unwrap(),
            "# Use ${NAME} or ${NAME:-default}\n  # ${ALSO_UNSET}\nurl = \"localhost\" # x\n"
        );
        assert!(interpolate_with("# ${NAME}\nkey = \"${NAME}\"", none).is_err());
    }

    #[test]
    fn test_minimal_config_defaults() {
        let config = merge_config(&args(&[]), parse(MINIMAL)).unwrap();
        assert_eq!(config.test_name, "smoke");
        assert_eq!(config.requests[0].url, "http://localhost:8080/health");
        assert_eq!(config.requests[0].method, reqwest::Method::GET);
        assert_eq!(config.tick, Duration::from_secs(1));
        assert_eq!(config.graceful_stop, Duration::from_secs(30));
        assert_eq!(config.think_time.max, Duration::ZERO);
        assert_eq!(config.trend_storage, TrendStorage::Exact);
        assert!(config.thresholds.is_empty());
    }

    #[test]
    fn test_cli_overrides() {
        let config = merge_config(
            &args(&["--base-url", "http://staging:9000/", "-o", "out.json"]),
            parse(MINIMAL),
        )
        .unwrap();
        assert_eq!(config.requests[0].url, "http://staging:9000/health");
        assert_eq!(config.summary_file, Some(PathBuf::from("out.json")));
    }

    #[test]
    fn test_full_config() {
        let toml = parse(
            r#"
            [test]
            name = "event-pipeline"
            base_url = "http://localhost:8080"

            [load]
            think_time = { min = "1s", max = "3s" }
            trend_storage = "histogram"
            graceful_stop = "5s"

            [[stages]]
            duration = "2m"
            target = 10

            [[stages]]
            duration = "30s"
            target = 0

            [thresholds]
            http_req_duration = ["p(95)<500"]
            "http_req_duration{name:events}" = ["max < 2000"]
            errors = [{ threshold = "rate<0.1", abort_on_fail = true, delay_abort_eval = "30s" }]

            [[requests]]
            name = "events"
            method = "post"
            path = "/api/v1/events"
            headers = { Content-Type = "application/json" }
            body = '{"user":"user_${RANDOM:1000}"}'

            [[requests.checks]]
            name = "event creation status is 200"
            condition = "status == 200"

            [[requests.checks]]
            condition = "json event_id exists"
            "#,
        );

        let config = merge_config(&args(&[]), toml).unwrap();
        assert_eq!(config.test_name, "event-pipeline");
        assert_eq!(config.think_time.min, Duration::from_secs(1));
        assert_eq!(config.think_time.max, Duration::from_secs(3));
        assert_eq!(config.trend_storage, TrendStorage::Histogram);
        assert_eq!(config.stages.len(), 2);
        assert_eq!(config.requests[0].method, reqwest::Method::POST);
        assert_eq!(config.requests[0].checks[1].name, "json event_id exists");
        assert_eq!(
            config.requests[0].headers,
            vec![("Content-Type".to_string(), "application/json".to_string())]
        );

        assert_eq!(config.thresholds.len(), 3);
        let errors = config.thresholds.iter().find(|t| t.metric == "errors").unwrap();
        assert!(errors.abort_on_fail);
        assert_eq!(errors.delay_abort_eval, Duration::from_secs(30));
        let per_request = config
            .thresholds
            .iter()
            .find(|t| t.metric == "http_req_duration{name:events}")
            .unwrap();
        assert_eq!(per_request.accessor, ThresholdAccessor::Max);
    }

    #[test]
    fn test_no_thresholds_flag_still_validates() {
        let mut toml = parse(MINIMAL);
        toml.thresholds.insert(
            "http_req_failed".to_string(),
            vec![ThresholdEntry::Expression("rate<0.1".to_string())],
        );
        let config = merge_config(&args(&["--no-thresholds"]), toml).unwrap();
        assert!(config.thresholds.is_empty());

        let mut toml = parse(MINIMAL);
        toml.thresholds.insert(
            "http_req_failed".to_string(),
            vec![ThresholdEntry::Expression("p(95)<1".to_string())],
        );
        assert!(merge_config(&args(&["--no-thresholds"]), toml).is_err());
    }

    #[test]
    fn test_threshold_on_unknown_metric() {
        let mut toml = parse(MINIMAL);
        toml.thresholds.insert(
            "http_req_duration{name:missing}".to_string(),
            vec![ThresholdEntry::Expression("p(95)<500".to_string())],
        );
        let err = merge_config(&args(&[]), toml).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownMetric(_)));
    }

    #[test]
    fn test_invalid_requests() {
        let no_base = parse(
            r#"
            [[stages]]
            duration = "10s"
            target = 1
            [[requests]]
            name = "health"
            path = "/health"
            "#,
        );
        assert!(matches!(
            merge_config(&args(&[]), no_base),
            Err(ConfigError::InvalidRequest { .. })
        ));

        let duplicate = parse(
            r#"
            [[stages]]
            duration = "10s"
            target = 1
            [[requests]]
            name = "a"
            url = "http://localhost/a"
            [[requests]]
            name = "a"
            url = "http://localhost/b"
            "#,
        );
        assert!(matches!(
            merge_config(&args(&[]), duplicate),
            Err(ConfigError::DuplicateRequest(name)) if name == "a"
        ));

        let bad_method = parse(
            r#"
            [[stages]]
            duration = "10s"
            target = 1
            [[requests]]
            name = "a"
            method = "FETCH"
            url = "http://localhost/a"
            "#,
        );
        assert!(merge_config(&args(&[]), bad_method).is_err());

        let bad_check = parse(
            r#"
            [[stages]]
            duration = "10s"
            target = 1
            [[requests]]
            name = "a"
            url = "http://localhost/a"
            [[requests.checks]]
            condition = "status is great"
            "#,
        );
        assert!(matches!(
            merge_config(&args(&[]), bad_check),
            Err(ConfigError::InvalidCheck { .. })
        ));

        let no_requests = parse(
            r#"
            [[stages]]
            duration = "10s"
            target = 1
            "#,
        );
        assert!(matches!(
            merge_config(&args(&[]), no_requests),
            Err(ConfigError::NoRequests)
        ));
    }

    #[test]
    fn test_invalid_load_settings() {
        let no_stages = parse(
            r#"
            [[requests]]
            name = "a"
            url = "http://localhost/a"
            "#,
        );
        assert!(matches!(
            merge_config(&args(&[]), no_stages),
            Err(ConfigError::InvalidStages(_))
        ));

        let mut toml = parse(MINIMAL);
        toml.load.think_time = Some(ThinkTimeConfig::Range {
            min: Duration::from_secs(3),
            max: Duration::from_secs(1),
        });
        assert!(matches!(
            merge_config(&args(&[]), toml),
            Err(ConfigError::InvalidThinkTime { .. })
        ));

        let mut toml = parse(MINIMAL);
        toml.load.tick = Some(Duration::ZERO);
        assert!(matches!(merge_config(&args(&[]), toml), Err(ConfigError::ZeroTick)));
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let result: Result<TomlConfig, _> = toml::from_str("[load]\nconcurrency = 5\n");
        assert!(result.is_err());
    }
}
