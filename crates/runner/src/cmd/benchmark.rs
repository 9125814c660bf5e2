use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Args;
use sandbox::Endpoint;
use supervisor::{AdmissionController, GateError, QueryGate, SandboxManager};
use tokio::net::TcpStream;
use tracing::{info, warn};

use crate::config;
use crate::error::{RunnerError, RunnerResult};

const BENCHMARK_USER: &str = "benchmark";

#[derive(Args)]
pub struct BenchmarkArgs {
    /// Path to runner.yaml config file
    #[arg(long, short, env = "SQLBOX_RUNNER_CONFIG")]
    config: PathBuf,
    /// Preset to provision (defaults to lifecycle.default_preset)
    #[arg(long)]
    preset: Option<String>,
    /// Number of queries to send through the admission gate
    #[arg(long, default_value_t = 3)]
    queries: u32,
    /// Seconds to wait for the sandbox endpoint to accept a connection
    #[arg(long, default_value_t = 10)]
    connect_timeout_secs: u64,
}

struct Timing {
    provision_ms: u128,
    query_ms: Vec<u128>,
    rate_limited: u32,
}

/// Provision one sandbox, run queries against it through the gate, tear it down.
pub async fn run_benchmark(args: BenchmarkArgs) -> RunnerResult<ExitCode> {
    let total = Instant::now();

    // 1. Load config and resolve the preset
    let runner_config = config::load(&args.config).await?;
    let policy = runner_config.policy(args.preset.as_deref())?;
    let image = policy.image.clone();

    // 2. Connect runtime
    let t = Instant::now();
    let runtime = super::connect_runtime(&runner_config).await?;
    let connect_ms = t.elapsed().as_millis();
    info!(connect_ms, image = %image, "runtime ready");

    let manager = Arc::new(SandboxManager::new(
        runtime,
        policy,
        runner_config.lifecycle.provision_timeout(),
    ));
    let admission = Arc::new(AdmissionController::new(
        runner_config.admission.capacity,
        runner_config.admission.window(),
    ));
    let gate = QueryGate::new(admission, manager.clone());

    // 3. Run queries, always tearing the sandbox down afterwards
    let session_key = format!("benchmark-{}", std::process::id());
    let connect_timeout = Duration::from_secs(args.connect_timeout_secs);
    let (result, timing) = run_queries(&gate, &session_key, args.queries, connect_timeout).await;

    let t = Instant::now();
    let removed = manager.shutdown().await;
    let teardown_ms = t.elapsed().as_millis();
    let total_ms = total.elapsed().as_millis();

    // 4. Log timing summary (always, even on error)
    let Timing {
        provision_ms,
        query_ms,
        rate_limited,
    } = timing;
    let queries_ok = query_ms.len();
    let query_ms_max = query_ms.iter().copied().max().unwrap_or(0);
    match &result {
        Ok(endpoint) => {
            info!(
                connect_ms,
                provision_ms,
                queries_ok,
                query_ms_max,
                rate_limited,
                teardown_ms,
                removed,
                total_ms,
                endpoint = %endpoint,
                "benchmark complete"
            );
        }
        Err(e) => {
            info!(connect_ms, provision_ms, queries_ok, teardown_ms, total_ms, error = %e, "benchmark failed");
        }
    }

    let endpoint = result?;
    println!("endpoint: {endpoint}");
    for (i, ms) in query_ms.iter().enumerate() {
        println!("query {}: {ms} ms", i + 1);
    }
    if rate_limited > 0 {
        println!("rate limited: {rate_limited}");
    }

    if removed == 0 {
        warn!("sandbox was not removed");
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

/// Send `queries` connection attempts through the gate.
/// The first admitted query pays for provisioning. Timing is always returned.
async fn run_queries(
    gate: &QueryGate,
    session_key: &str,
    queries: u32,
    connect_timeout: Duration,
) -> (RunnerResult<Endpoint>, Timing) {
    let mut timing = Timing {
        provision_ms: 0,
        query_ms: Vec::new(),
        rate_limited: 0,
    };
    let mut endpoint = None;

    for i in 0..queries.max(1) {
        let t = Instant::now();
        let result = gate
            .run(BENCHMARK_USER, session_key, |endpoint| {
                connect(endpoint, connect_timeout)
            })
            .await;
        let elapsed_ms = t.elapsed().as_millis();

        match result {
            Ok(ep) => {
                if i == 0 {
                    timing.provision_ms = elapsed_ms;
                    info!(provision_ms = elapsed_ms, endpoint = %ep, "sandbox ready");
                } else {
                    info!(query = i + 1, query_ms = elapsed_ms, "query complete");
                }
                timing.query_ms.push(elapsed_ms);
                endpoint = Some(ep);
            }
            Err(GateError::RateLimited { user_id }) => {
                warn!(query = i + 1, user = %user_id, "query rejected by admission");
                timing.rate_limited += 1;
            }
            Err(GateError::Provisioning(e)) => return (Err(e.into()), timing),
            Err(GateError::Query(e)) => return (Err(e.into()), timing),
        }
    }

    match endpoint {
        Some(ep) => (Ok(ep), timing),
        None => (
            Err(RunnerError::Internal("no query was admitted".into())),
            timing,
        ),
    }
}

/// Open and close a TCP connection to the sandbox endpoint.
async fn connect(endpoint: Endpoint, timeout: Duration) -> std::io::Result<Endpoint> {
    let stream = tokio::time::timeout(
        timeout,
        TcpStream::connect((endpoint.host.as_str(), endpoint.port)),
    )
    .await
    .map_err(|_| {
        std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("connect to {endpoint} timed out after {timeout:?}"),
        )
    })??;
    drop(stream);
    Ok(endpoint)
}
