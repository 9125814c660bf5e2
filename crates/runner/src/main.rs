mod api;
mod cmd;
mod config;
mod error;
mod status;

use std::fmt;
use std::process::ExitCode;
use std::time::Instant;

use clap::{Parser, Subcommand};
use tracing_subscriber::fmt::time::FormatTime;

struct Elapsed(Instant);

impl FormatTime for Elapsed {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> fmt::Result {
        let d = self.0.elapsed();
        let total_secs = d.as_secs();
        let mins = total_secs / 60;
        let secs = total_secs % 60;
        let millis = d.subsec_millis();
        write!(w, "[{mins:02}:{secs:02}:{millis:03}]")
    }
}

#[derive(Parser)]
#[command(name = "sqlbox-runner", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the sandbox supervisor and run until SIGTERM/SIGINT
    Start(cmd::StartArgs),
    /// Validate runner.yaml and print the resolved sandbox presets
    CheckConfig(cmd::CheckConfigArgs),
    /// Provision one sandbox, query it through the gate, and tear it down
    Benchmark(cmd::BenchmarkArgs),
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_timer(Elapsed(Instant::now()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Command::Start(args) => cmd::run_start(args).await.map(|()| ExitCode::SUCCESS),
        Command::CheckConfig(args) => cmd::run_check_config(args)
            .await
            .map(|()| ExitCode::SUCCESS),
        Command::Benchmark(args) => cmd::run_benchmark(args).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
