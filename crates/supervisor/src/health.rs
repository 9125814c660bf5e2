use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use sandbox::{ContainerRef, SandboxPolicy};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::manager::{SandboxManager, probe_once};
use crate::state::{Entry, SandboxState};

/// `last_error` of a sandbox evicted for failing its health checks.
pub const HEALTH_CHECK_EXHAUSTED: &str = "health-check-exhausted";

const MIN_INTERVAL: Duration = Duration::from_millis(10);

/// Periodically probes every Ready or InUse sandbox.
///
/// Probes run concurrently and without any record lock held, so a hung
/// container only delays its own result.
pub struct HealthMonitor {
    manager: Arc<SandboxManager>,
    interval: Duration,
}

impl HealthMonitor {
    pub fn new(manager: Arc<SandboxManager>, interval: Duration) -> Self {
        Self { manager, interval }
    }

    /// Probe all eligible sandboxes once. Returns how many were evicted.
    pub async fn check_all(&self) -> usize {
        let targets: Vec<_> = self
            .manager
            .entries()
            .into_iter()
            .filter_map(|entry| {
                let target = entry.read(|r| {
                    if !matches!(r.state, SandboxState::Ready | SandboxState::InUse) {
                        return None;
                    }
                    Some((r.container.clone()?, Arc::clone(&r.policy)))
                });
                target.map(|(container, policy)| (entry, container, policy))
            })
            .collect();

        let results = join_all(
            targets
                .into_iter()
                .map(|(entry, container, policy)| self.check_one(entry, container, policy)),
        )
        .await;
        results.into_iter().filter(|evicted| *evicted).count()
    }

    async fn check_one(
        &self,
        entry: Arc<Entry>,
        container: ContainerRef,
        policy: Arc<SandboxPolicy>,
    ) -> bool {
        let result = probe_once(self.manager.runtime().as_ref(), &container, &policy.health).await;

        let (key, failures, exhausted) = entry.update(|r| {
            // Evicted or replaced while the probe was running.
            if !matches!(r.state, SandboxState::Ready | SandboxState::InUse) {
                return (r.session_key.clone(), 0, false);
            }
            match &result {
                Ok(()) => {
                    r.health_failure_count = 0;
                    r.last_health_check_at = Some(Instant::now());
                    (r.session_key.clone(), 0, false)
                }
                Err(_) => {
                    r.health_failure_count = r.health_failure_count.saturating_add(1);
                    let exhausted = r.health_failure_count >= policy.health.retries
                        && r.fail(HEALTH_CHECK_EXHAUSTED);
                    (r.session_key.clone(), r.health_failure_count, exhausted)
                }
            }
        });

        if let Err(reason) = &result {
            warn!(
                session = %key,
                container = %container,
                failures,
                retries = policy.health.retries,
                error = %reason,
                "health probe failed"
            );
        }
        if !exhausted {
            return false;
        }

        error!(session = %key, container = %container, "health checks exhausted, evicting sandbox");
        matches!(
            self.manager
                .evict(&entry, HEALTH_CHECK_EXHAUSTED, |r| r.state == SandboxState::Error)
                .await,
            Ok(true)
        )
    }

    /// Probe on every tick until `shutdown` changes or its sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval.max(MIN_INTERVAL));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; sandboxes were just probed
        // during provisioning.
        ticker.tick().await;

        info!(interval_ms = self.interval.as_millis() as u64, "health monitor started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.check_all().await;
                }
                _ = shutdown.changed() => break,
            }
        }
        info!("health monitor stopped");
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}
