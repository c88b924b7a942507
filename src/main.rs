mod cli;
mod config;
mod engine;
mod error;
mod http;
mod output;
mod types;

use clap::Parser;
use cli::{Cli, Commands, InitArgs, RunArgs};
use config::{load_config, merge_config};
use engine::{Engine, StageInfo, evaluate_thresholds, print_threshold_results};
use error::Error;
use output::{create_report, print_check_results, print_json, print_summary, write_json};
use tokio::sync::watch;
use types::{LoadConfig, RunState};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let exit_code = match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    };

    std::process::exit(exit_code);
}

async fn run() -> Result<i32, Error> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run_load_test(&args).await,
        Commands::Init(args) => run_init(&args),
        Commands::Completions(args) => {
            cli::generate_completions(args.shell);
            Ok(0)
        }
        Commands::Man => {
            cli::generate_man_page()?;
            Ok(0)
        }
    }
}

const STARTER_CONFIG: &str = r#"# rampstage load test configuration
#
# Per-request templates: ${VU}, ${ITERATION}, ${TIMESTAMP}, ${TIMESTAMP_MS}, ${RANDOM:N}
# Environment variables: ${NAME} or ${NAME:-default}, substituted when the file is loaded

[test]
name = "event-pipeline"
base_url = "${BASE_URL:-{base_url}}"

[load]
think_time = { min = "1s", max = "3s" }
timeout = "10s"
connect_timeout = "2s"
graceful_stop = "30s"
# tick = "1s"
# start_target = 0
# trend_storage = "exact"   # or "histogram" (bounded memory, approximate percentiles)

# Ramp to 10 VUs, hold, ramp to 20, hold, ramp down
[[stages]]
duration = "2m"
target = 10

[[stages]]
duration = "5m"
target = 10

[[stages]]
duration = "2m"
target = 20

[[stages]]
duration = "5m"
target = 20

[[stages]]
duration = "2m"
target = 0

[thresholds]
http_req_duration = ["p(95)<500"]
http_req_failed = ["rate<0.1"]
errors = ["rate<0.1"]
# Stop early if the error rate gets out of hand:
# errors = [{ threshold = "rate<0.5", abort_on_fail = true, delay_abort_eval = "1m" }]

[[requests]]
name = "health"
method = "GET"
path = "/health"

[[requests.checks]]
name = "health check status is 200"
condition = "status == 200"

[[requests.checks]]
name = "health check response time < 100ms"
condition = "duration < 100"

[[requests]]
name = "events"
method = "POST"
path = "/api/v1/events"
headers = { Content-Type = "application/json" }
body = '{"type":"user_action","user_id":"user_${RANDOM:1000}","data":{"action":"test_action","page":"/page_${RANDOM:10}","timestamp":"${TIMESTAMP}"},"source":"load_test"}'

[[requests.checks]]
name = "event creation status is 200"
condition = "status == 200"

[[requests.checks]]
name = "event creation response time < 1000ms"
condition = "duration < 1000"

[[requests.checks]]
name = "event creation returns event_id"
condition = "json event_id exists"

[[requests]]
name = "generate"
method = "POST"
path = "/api/v1/generate?count=3"

[[requests.checks]]
name = "generate events status is 200"
condition = "status == 200"

[[requests.checks]]
name = "generate events response time < 2000ms"
condition = "duration < 2000"

[[requests.checks]]
name = "generate events returns count"
condition = "json count == 3"

[[requests]]
name = "stats"
method = "GET"
path = "/api/v1/stats"

[[requests.checks]]
name = "stats status is 200"
condition = "status == 200"

[[requests.checks]]
name = "stats response time < 500ms"
condition = "duration < 500"

[[requests.checks]]
name = "stats returns data"
condition = "json total_events exists"

[[requests]]
name = "metrics"
method = "GET"
path = "/metrics"

[[requests.checks]]
name = "metrics status is 200"
condition = "status == 200"

[[requests.checks]]
name = "metrics response time < 200ms"
condition = "duration < 200"

[[requests.checks]]
name = "metrics returns prometheus format"
condition = 'body contains "http_requests_total"'

[output]
summary_file = "load-test-results.json"
"#;

fn run_init(args: &InitArgs) -> Result<i32, Error> {
    if args.output.exists() && !args.force {
        return Err(Error::Other(format!(
            "File '{}' already exists. Use --force to overwrite.",
            args.output.display()
        )));
    }

    let base_url = args.base_url.as_deref().unwrap_or("http://localhost:8080");
    let config = STARTER_CONFIG.replace("{base_url}", base_url);

    std::fs::write(&args.output, config)?;

    eprintln!("Created config file: {}", args.output.display());
    eprintln!("\nRun with: rampstage run -f {}", args.output.display());

    Ok(0)
}

fn print_plan(config: &LoadConfig) {
    eprintln!("Configuration validated successfully!\n");
    eprintln!("Test:        {}", config.test_name);
    eprintln!(
        "Stages:      {} defined (total: {:?}, max VUs: {})",
        config.stages.len(),
        config.total_duration(),
        config.max_target()
    );
    for (i, s) in config.stages.iter().enumerate() {
        eprintln!("  {}. {:?} -> {} VUs", i + 1, s.duration, s.target);
    }
    eprintln!("Requests:    {} per iteration", config.requests.len());
    for r in &config.requests {
        eprintln!("  - {} ({} {}) {} checks", r.name, r.method, r.url, r.checks.len());
    }
    eprintln!(
        "Think time:  {:?} - {:?}",
        config.think_time.min, config.think_time.max
    );
    if !config.thresholds.is_empty() {
        eprintln!("Thresholds:  {} defined", config.thresholds.len());
        for t in &config.thresholds {
            let abort = if t.abort_on_fail { " (abort on fail)" } else { "" };
            eprintln!("  - {}: {}{}", t.metric, t.expression, abort);
        }
    }
    if let Some(path) = &config.summary_file {
        eprintln!("Report:      {}", path.display());
    }
}

fn spawn_progress(mut stage_rx: watch::Receiver<StageInfo>) {
    tokio::spawn(async move {
        while stage_rx.changed().await.is_ok() {
            let info = stage_rx.borrow_and_update().clone();
            match info.state {
                RunState::Running => eprintln!(
                    "[{:>6.1}s] stage {}/{} ({:.0}s/{:.0}s) vus {}/{}",
                    info.elapsed.as_secs_f64(),
                    info.stage_index + 1,
                    info.stage_count,
                    info.stage_elapsed.as_secs_f64(),
                    info.stage_duration.as_secs_f64(),
                    info.current,
                    info.target
                ),
                RunState::Draining => {
                    eprintln!("Waiting for {} virtual users to finish...", info.current)
                }
                RunState::Aborted => eprintln!("Run aborted"),
                RunState::Initializing | RunState::Completed => {}
            }
        }
    });
}

async fn run_load_test(args: &RunArgs) -> Result<i32, Error> {
    let toml_config = load_config(&args.config)?;
    let config = merge_config(args, toml_config)?;

    if args.dry_run {
        print_plan(&config);
        return Ok(0);
    }

    let engine = Engine::new(config.clone())?;
    let cancel_token = engine.cancel_token();

    if !args.quiet && !args.json {
        spawn_progress(engine.stage_info_rx());
    }

    let ctrl_c_token = cancel_token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, stopping virtual users");
            ctrl_c_token.cancel();
        }
    });

    let summary = engine.run().await?;

    let threshold_results = evaluate_thresholds(&config.thresholds, &summary.snapshot);
    let report = create_report(&summary, &config, &threshold_results);

    if let Some(path) = &config.summary_file {
        write_json(&report, path)?;
        if !args.quiet && !args.json {
            eprintln!("Results written to: {}", path.display());
        }
    }

    if args.json {
        print_json(&report)?;
    } else if !args.quiet {
        print_summary(&report)?;
        print_threshold_results(&threshold_results);
        print_check_results(&report);
    }

    if !report.passed || summary.aborted_by.is_some() {
        Ok(4)
    } else {
        Ok(0)
    }
}
