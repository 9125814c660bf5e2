use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use sandbox::ContainerRuntime;
use supervisor::{AdmissionController, HealthMonitor, IdleReaper, QueryGate, SandboxManager};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::api::{self, ApiState};
use crate::config::{self, RunnerConfig};
use crate::error::{RunnerError, RunnerResult};
use crate::status::{RunnerMode, StatusTracker};

#[derive(Args)]
pub struct StartArgs {
    /// Path to runner.yaml config file
    #[arg(long, short, env = "SQLBOX_RUNNER_CONFIG")]
    config: PathBuf,
}

/// Load config, start the supervisor and run until a shutdown signal.
pub async fn run_start(args: StartArgs) -> RunnerResult<()> {
    let runner_config = config::load(&args.config).await?;

    if let Some(dir) = runner_config.status_file.parent() {
        tokio::fs::create_dir_all(dir).await.map_err(|e| {
            RunnerError::Config(format!("create status dir {}: {e}", dir.display()))
        })?;
    }

    let runtime = super::connect_runtime(&runner_config).await?;
    info!(runtime = runtime.name(), host = runtime.host(), "container runtime ready");

    run(runner_config, runtime).await
}

async fn run(config: RunnerConfig, runtime: Arc<dyn ContainerRuntime>) -> RunnerResult<()> {
    let policy = config.policy(None)?;
    let health_interval = policy.health.interval();
    let manager = Arc::new(SandboxManager::new(
        runtime.clone(),
        policy,
        config.lifecycle.provision_timeout(),
    ));
    let admission = Arc::new(AdmissionController::new(
        config.admission.capacity,
        config.admission.window(),
    ));
    let status = Arc::new(StatusTracker::new(
        config.status_file.clone(),
        runtime.name(),
    ));
    let api_state = ApiState::new(
        QueryGate::new(admission.clone(), manager.clone()),
        config.presets(),
    );
    let leases = api_state.leases().clone();
    let listener = TcpListener::bind(config.api.listen)
        .await
        .map_err(|e| RunnerError::Config(format!("bind {}: {e}", config.api.listen)))?;

    status.write_initial().await;
    info!(
        preset = %config.lifecycle.default_preset,
        capacity = config.admission.capacity,
        window_secs = config.admission.window_secs,
        listen = %config.api.listen,
        "supervisor started"
    );

    // -----------------------------------------------------------------------
    // Background tasks
    // -----------------------------------------------------------------------
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let monitor = HealthMonitor::new(manager.clone(), health_interval).spawn(shutdown_rx.clone());
    let reaper = IdleReaper::new(manager.clone(), config.lifecycle.sweep_interval())
        .spawn(shutdown_rx.clone());
    let intake = tokio::spawn(api::serve(listener, api_state, shutdown_rx));

    // -----------------------------------------------------------------------
    // Signal handling
    // -----------------------------------------------------------------------
    let (mode_tx, mut mode_rx) = watch::channel(RunnerMode::Running);

    tokio::spawn(async move {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = signal(SignalKind::terminate()).ok();
        let mut sigint = signal(SignalKind::interrupt()).ok();

        tokio::select! {
            _ = recv_signal(&mut sigterm) => {
                info!("received SIGTERM, draining");
            }
            _ = recv_signal(&mut sigint) => {
                info!("received SIGINT, draining");
            }
        }
        let _ = mode_tx.send(RunnerMode::Draining);
    });

    // -----------------------------------------------------------------------
    // Main loop
    // -----------------------------------------------------------------------
    let mut ticker = tokio::time::interval(config.lifecycle.status_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let retention = config.admission.bucket_retention();
    let lease_timeout = config.api.lease_timeout();
    let mut current_mode = RunnerMode::Running;
    loop {
        let mode = *mode_rx.borrow_and_update();
        if mode != current_mode {
            current_mode = mode;
            status.set_mode(mode).await;
        }
        match mode {
            RunnerMode::Draining | RunnerMode::Stopped => break,
            RunnerMode::Running => {}
        }

        tokio::select! {
            _ = mode_rx.changed() => {}
            _ = ticker.tick() => {
                let purged = admission.purge_stale(retention);
                if purged > 0 {
                    debug!(purged, "dropped stale rate buckets");
                }
                let expired = leases.expire(lease_timeout);
                if expired > 0 {
                    debug!(expired, "released stale query leases");
                }
                status.update(manager.snapshot(), admission.len(), leases.len()).await;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Shutdown: stop intake and background tasks, then tear down every sandbox
    // -----------------------------------------------------------------------
    shutdown_tx.send_replace(true);
    match intake.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "intake api failed"),
        Err(e) => error!(error = %e, "intake api panicked"),
    }
    for (task, handle) in [("health monitor", monitor), ("idle reaper", reaper)] {
        if let Err(e) = handle.await {
            error!(task, error = %e, "background task panicked");
        }
    }

    let dropped = leases.clear();
    if dropped > 0 {
        info!(dropped, "released open query leases");
    }
    let removed = manager.shutdown().await;
    info!(removed, "sandboxes torn down");

    status.update(manager.snapshot(), admission.len(), leases.len()).await;
    status.set_mode(RunnerMode::Stopped).await;
    info!("supervisor stopped");
    Ok(())
}

/// Wait for a signal, or pend forever if the handler could not be installed.
async fn recv_signal(sig: &mut Option<tokio::signal::unix::Signal>) {
    match sig {
        Some(s) => {
            s.recv().await;
        }
        None => std::future::pending().await,
    }
}
