use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::manager::SandboxManager;
use crate::state::{SandboxRecord, SandboxState};

pub const IDLE_TIMEOUT: &str = "idle-timeout";

const MIN_INTERVAL: Duration = Duration::from_millis(10);

/// Outcome of one [`IdleReaper::sweep`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub marked_idle: usize,
    pub evicted: usize,
    pub reconciled: usize,
}

/// Marks quiet sandboxes Idle and evicts those past their idle timeout.
///
/// InUse sandboxes are never touched. Each sweep also runs the manager's
/// reconciliation pass.
pub struct IdleReaper {
    manager: Arc<SandboxManager>,
    sweep_interval: Duration,
}

impl IdleReaper {
    pub fn new(manager: Arc<SandboxManager>, sweep_interval: Duration) -> Self {
        Self {
            manager,
            sweep_interval,
        }
    }

    pub async fn sweep(&self) -> SweepReport {
        let now = Instant::now();
        let mut report = SweepReport::default();
        let mut expired = Vec::new();

        for entry in self.manager.entries() {
            let (marked, past_timeout) = entry.update(|r| {
                let idle_for = r.idle_for(now);
                match r.state {
                    SandboxState::Ready | SandboxState::Idle
                        if idle_for > r.policy.idle_timeout() =>
                    {
                        (false, true)
                    }
                    SandboxState::Ready if idle_for >= self.sweep_interval => {
                        (r.transition(SandboxState::Idle), false)
                    }
                    _ => (false, false),
                }
            });
            if marked {
                report.marked_idle += 1;
            }
            if past_timeout {
                expired.push(entry);
            }
        }

        for entry in expired {
            // Re-checked under the record lock: a query may have started
            // since the scan.
            let still_idle = |r: &SandboxRecord| {
                matches!(r.state, SandboxState::Ready | SandboxState::Idle)
                    && r.idle_for(Instant::now()) > r.policy.idle_timeout()
            };
            if let Ok(true) = self.manager.evict(&entry, IDLE_TIMEOUT, still_idle).await {
                report.evicted += 1;
            }
        }

        report.reconciled = self.manager.reconcile().await;
        if report != SweepReport::default() {
            debug!(
                marked_idle = report.marked_idle,
                evicted = report.evicted,
                reconciled = report.reconciled,
                "idle sweep"
            );
        }
        report
    }

    /// Sweep on every tick until `shutdown` changes or its sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.sweep_interval.max(MIN_INTERVAL));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        info!(
            sweep_interval_secs = self.sweep_interval.as_secs(),
            "idle reaper started"
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep().await;
                }
                _ = shutdown.changed() => break,
            }
        }
        info!("idle reaper stopped");
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}
