//! Load test integration tests using wiremock
//!
//! These tests verify the load testing functionality works correctly
//! against a mock HTTP server.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::time::Duration;
use tempfile::{TempDir, tempdir};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn rampstage() -> Command {
    Command::cargo_bin("rampstage").unwrap()
}

async fn setup_mock_server() -> MockServer {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"status":"ok"}"#))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(r#"{"status":"ok"}"#)
                .set_delay(Duration::from_millis(50)),
        )
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/error"))
        .respond_with(ResponseTemplate::new(500).set_body_string(r#"{"error":"internal"}"#))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/api/v1/events"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(r#"{"event_id":"e-1","status":"queued"}"#),
        )
        .mount(&server)
        .await;

    server
}

/// Short run: jump to `target` VUs and hold for one second.
fn write_config(server: &MockServer, target: u32, body: &str) -> (TempDir, String) {
    let dir = tempdir().unwrap();
    let path = dir.path().join("load.toml");
    let content = format!(
        r#"
[test]
name = "integration"
base_url = "{}"

[load]
think_time = {{ min = "10ms", max = "20ms" }}
tick = "100ms"
graceful_stop = "5s"

[[stages]]
duration = "0s"
target = {}

[[stages]]
duration = "1s"
target = {}

{}
"#,
        server.uri(),
        target,
        target,
        body
    );
    fs::write(&path, content).unwrap();
    let path = path.to_str().unwrap().to_string();
    (dir, path)
}

#[tokio::test]
async fn passing_run_exits_zero_and_prints_digest() {
    let server = setup_mock_server().await;
    let (_dir, config) = write_config(
        &server,
        5,
        r#"
[thresholds]
http_req_duration = ["p(95)<1000"]
http_req_failed = ["rate<0.1"]

[[requests]]
name = "slow"
path = "/slow"

[[requests.checks]]
name = "slow status is 200"
condition = "status == 200"
"#,
    );

    rampstage()
        .args(["run", "-f", &config])
        .assert()
        .code(0)
        .stdout(predicate::str::contains("Load Test Results:"))
        .stdout(predicate::str::contains("Error Rate: 0.00%"))
        .stdout(predicate::str::contains("All thresholds passed."))
        .stdout(predicate::str::contains("slow status is 200"));
}

#[tokio::test]
async fn failing_threshold_exits_four() {
    let server = setup_mock_server().await;
    let (_dir, config) = write_config(
        &server,
        2,
        r#"
[thresholds]
http_req_failed = ["rate<0.1"]

[[requests]]
name = "error"
path = "/error"
"#,
    );

    rampstage()
        .args(["run", "-f", &config])
        .assert()
        .code(4)
        .stdout(predicate::str::contains("Thresholds failed!"));
}

#[tokio::test]
async fn no_thresholds_flag_ignores_failures() {
    let server = setup_mock_server().await;
    let (_dir, config) = write_config(
        &server,
        2,
        r#"
[thresholds]
http_req_failed = ["rate<0.1"]

[[requests]]
name = "error"
path = "/error"
"#,
    );

    rampstage()
        .args(["run", "-f", &config, "--no-thresholds", "-q"])
        .assert()
        .code(0);
}

#[tokio::test]
async fn json_report_written_to_file() {
    let server = setup_mock_server().await;
    let dir = tempdir().unwrap();
    let output = dir.path().join("results.json");
    let (_cfg_dir, config) = write_config(
        &server,
        3,
        r#"
[thresholds]
"http_req_duration{name:events}" = ["p(99)<2000"]
errors = ["rate<0.5"]

[[requests]]
name = "health"
path = "/health"

[[requests.checks]]
name = "health status is 200"
condition = "status == 200"

[[requests]]
name = "events"
method = "POST"
path = "/api/v1/events"
headers = { Content-Type = "application/json" }
body = '{"user_id":"user_${RANDOM:1000}","vu":${VU},"at":"${TIMESTAMP}"}'

[[requests.checks]]
name = "event creation status is 200"
condition = "status == 200"

[[requests.checks]]
name = "event id returned"
condition = "json event_id exists"
"#,
    );

    rampstage()
        .args(["run", "-f", &config, "-o", output.to_str().unwrap(), "-q"])
        .assert()
        .code(0);

    let report: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&output).unwrap()).unwrap();

    assert_eq!(report["metadata"]["tool"], "rampstage");
    assert_eq!(report["metadata"]["test_name"], "integration");
    assert_eq!(report["metadata"]["aborted"], false);
    assert_eq!(report["passed"], true);
    assert_eq!(report["thresholds"]["passed"], true);

    let total = report["summary"]["total_requests"].as_u64().unwrap();
    assert!(total >= 6, "only {} requests", total);
    assert_eq!(report["summary"]["failed_requests"], 0);

    let health = report["metrics"]["http_reqs{name:health}"]["values"]["count"]
        .as_f64()
        .unwrap();
    let events = report["metrics"]["http_reqs{name:events}"]["values"]["count"]
        .as_f64()
        .unwrap();
    assert_eq!(health, events);

    let duration = &report["metrics"]["http_req_duration{name:events}"];
    assert_eq!(duration["type"], "trend");
    assert!(duration["values"]["p(99)"].as_f64().is_some());
    assert_eq!(duration["thresholds"]["p(99)<2000"]["ok"], true);

    let checks = report["checks"].as_array().unwrap();
    assert_eq!(checks.len(), 3);
    for check in checks {
        assert_eq!(check["fails"], 0, "check {} failed", check["name"]);
    }
}

#[tokio::test]
async fn json_flag_prints_report_to_stdout() {
    let server = setup_mock_server().await;
    let (_dir, config) = write_config(
        &server,
        1,
        r#"
[[requests]]
name = "health"
path = "/health"
"#,
    );

    let assert = rampstage()
        .args(["run", "-f", &config, "--json"])
        .assert()
        .code(0);

    let stdout = String::from_utf8(assert.get_output().stdout.clone()).unwrap();
    let report: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert!(report["metrics"]["vus"]["values"]["max"].as_f64().unwrap() >= 1.0);
    assert!(report["metrics"]["iterations"]["values"]["count"].as_f64().unwrap() >= 1.0);
}

#[tokio::test]
async fn abort_on_fail_threshold_stops_early() {
    let server = setup_mock_server().await;
    let dir = tempdir().unwrap();
    let output = dir.path().join("results.json");
    let config = dir.path().join("abort.toml");
    fs::write(
        &config,
        format!(
            r#"
[test]
base_url = "{}"

[load]
tick = "100ms"

[[stages]]
duration = "60s"
target = 2

[thresholds]
http_req_failed = [{{ threshold = "rate<0.1", abort_on_fail = true, delay_abort_eval = "200ms" }}]

[[requests]]
name = "error"
path = "/error"
"#,
            server.uri()
        ),
    )
    .unwrap();

    rampstage()
        .args([
            "run",
            "-f",
            config.to_str().unwrap(),
            "-o",
            output.to_str().unwrap(),
            "-q",
        ])
        .timeout(Duration::from_secs(20))
        .assert()
        .code(4);

    let report: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&output).unwrap()).unwrap();
    assert_eq!(report["metadata"]["aborted"], true);
    assert_eq!(report["metadata"]["aborted_by"], "http_req_failed: rate<0.1");
    assert!(report["metadata"]["duration_secs"].as_f64().unwrap() < 20.0);
}

#[tokio::test]
async fn unreachable_target_records_failures_without_crashing() {
    let dir = tempdir().unwrap();
    let output = dir.path().join("results.json");
    let config = dir.path().join("down.toml");
    fs::write(
        &config,
        r#"
[load]
tick = "100ms"
think_time = "50ms"
connect_timeout = "500ms"

[[stages]]
duration = "500ms"
target = 1

[[requests]]
name = "down"
url = "http://127.0.0.1:9/health"

[[requests.checks]]
name = "down status is 200"
condition = "status == 200"
"#,
    )
    .unwrap();

    rampstage()
        .args([
            "run",
            "-f",
            config.to_str().unwrap(),
            "-o",
            output.to_str().unwrap(),
            "-q",
        ])
        .assert()
        .code(0);

    let report: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&output).unwrap()).unwrap();
    let total = report["summary"]["total_requests"].as_u64().unwrap();
    assert!(total >= 1);
    assert_eq!(report["summary"]["failed_requests"].as_u64().unwrap(), total);
    assert_eq!(report["summary"]["error_rate"], 1.0);
    assert_eq!(report["checks"][0]["passes"], 0);
}
