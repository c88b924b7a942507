use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "rampstage",
    author,
    version,
    about = "Staged HTTP load generator with SLO thresholds",
    long_about = "rampstage ramps virtual users through a staged concurrency plan, runs a \
                  scripted HTTP scenario against the target, and verifies the aggregated \
                  metrics against pass/fail thresholds.\n\n\
                  Exit codes: 0 = thresholds passed, 4 = a threshold failed, 1 = error."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a load test from a config file
    #[command(name = "run")]
    Run(Box<RunArgs>),

    /// Generate a starter config file
    Init(InitArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),

    /// Generate man page
    Man,
}

#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Config file path (TOML)
    #[arg(short = 'f', long = "config", default_value = "rampstage.toml")]
    pub config: PathBuf,

    /// Base URL prepended to request paths (overrides [test] base_url)
    #[arg(long, value_name = "URL")]
    pub base_url: Option<String>,

    /// Write the JSON report to this file (overrides [output] summary_file)
    #[arg(short = 'o', long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Print the JSON report to stdout instead of the text summary
    #[arg(long)]
    pub json: bool,

    /// Suppress progress and summary output (for CI)
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// Validate config and exit without running
    #[arg(long)]
    pub dry_run: bool,

    /// Validate thresholds but do not enforce them
    #[arg(long)]
    pub no_thresholds: bool,

    /// Skip TLS certificate verification
    #[arg(long)]
    pub insecure: bool,
}

#[derive(Parser, Debug)]
pub struct InitArgs {
    /// Output file path
    #[arg(short, long, default_value = "rampstage.toml")]
    pub output: PathBuf,

    /// Base URL to include in config
    #[arg(long, value_name = "URL")]
    pub base_url: Option<String>,

    /// Overwrite existing file
    #[arg(long)]
    pub force: bool,
}

#[derive(Parser, Debug)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: Shell,
}

pub fn generate_completions(shell: Shell) {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, "rampstage", &mut std::io::stdout());
}

pub fn generate_man_page() -> Result<(), std::io::Error> {
    let cmd = Cli::command();
    let man = clap_mangen::Man::new(cmd);
    man.render(&mut std::io::stdout())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_args() {
        let cli = Cli::parse_from([
            "rampstage",
            "run",
            "-f",
            "load.toml",
            "--base-url",
            "http://localhost:8080",
            "--json",
            "--no-thresholds",
        ]);
        let Commands::Run(args) = cli.command else {
            panic!("expected run command");
        };
        assert_eq!(args.config, PathBuf::from("load.toml"));
        assert_eq!(args.base_url.as_deref(), Some("http://localhost:8080"));
        assert!(args.json);
        assert!(args.no_thresholds);
        assert!(!args.dry_run);
    }
}
