use crate::output::json::Report;
use std::io::{self, Write};

/// Plain-text digest of the headline request numbers.
pub fn write_digest<W: Write>(w: &mut W, report: &Report) -> io::Result<()> {
    let duration = report.metrics.get("http_req_duration");
    let value = |key: &str| {
        duration
            .and_then(|m| m.values.get(key))
            .copied()
            .unwrap_or(0.0)
    };

    writeln!(w, "Load Test Results:")?;
    writeln!(w, "==================")?;
    writeln!(w, "Total Requests: {}", report.summary.total_requests)?;
    writeln!(w, "Failed Requests: {}", report.summary.failed_requests)?;
    writeln!(w, "Error Rate: {:.2}%", report.summary.error_rate * 100.0)?;
    writeln!(w, "Average Response Time: {:.2}ms", value("avg"))?;
    writeln!(w, "95th Percentile: {:.2}ms", value("p(95)"))?;
    writeln!(w, "Max Response Time: {:.2}ms", value("max"))?;

    if report.metadata.aborted {
        match &report.metadata.aborted_by {
            Some(threshold) => writeln!(w, "Run aborted: threshold '{}' failed", threshold)?,
            None => writeln!(w, "Run interrupted before all stages completed")?,
        }
    }
    Ok(())
}

pub fn print_summary(report: &Report) -> io::Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    writeln!(out)?;
    write_digest(&mut out, report)?;
    writeln!(
        out,
        "Iterations: {} ({} failed)",
        report.summary.iterations, report.summary.failed_iterations
    )
}

pub fn print_check_results(report: &Report) {
    if report.checks.is_empty() {
        return;
    }

    println!("\n{}", "=".repeat(60));
    println!("CHECKS");
    println!("{}", "=".repeat(60));

    for check in &report.checks {
        let total = check.passes + check.fails;
        let pct = if total > 0 {
            check.passes as f64 / total as f64 * 100.0
        } else {
            0.0
        };

        let status = if check.fails == 0 {
            "\x1b[32m✓\x1b[0m"
        } else {
            "\x1b[31m✗\x1b[0m"
        };

        println!(
            "  {} {} [{}] {:.1}% ({}/{})",
            status, check.name, check.request, pct, check.passes, total
        );
    }
}
