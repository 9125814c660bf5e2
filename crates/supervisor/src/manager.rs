//! Per-session sandbox lifecycle.
//!
//! The table lock is held only for lookup/insert/remove. Each record has its
//! own lock (see [`Entry`]) that is never held across a runtime call, so a
//! slow container operation on one session never blocks another.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::future::join_all;
use sandbox::{
    ContainerRef, ContainerRuntime, CreateRequest, Endpoint, HealthCheck, ProbeOutcome,
    RuntimeError, SandboxPolicy,
};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{Result, SupervisorError};
use crate::state::{Entry, SandboxInfo, SandboxRecord, SandboxState};

pub const DEFAULT_PROVISION_TIMEOUT: Duration = Duration::from_secs(120);

/// Container names are `sqlbox-<session slug>-<uuid>`.
const NAME_PREFIX: &str = "sqlbox";
const MAX_SLUG_LEN: usize = 40;

pub struct SandboxManager {
    runtime: Arc<dyn ContainerRuntime>,
    policy: Arc<SandboxPolicy>,
    provision_timeout: Duration,
    sandboxes: Mutex<HashMap<String, Arc<Entry>>>,
    /// Records replaced in the table while their teardown was still
    /// outstanding. Retried by [`SandboxManager::reconcile`].
    stuck: Mutex<Vec<Arc<Entry>>>,
}

impl SandboxManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        policy: SandboxPolicy,
        provision_timeout: Duration,
    ) -> Self {
        Self {
            runtime,
            policy: Arc::new(policy),
            provision_timeout,
            sandboxes: Mutex::new(HashMap::new()),
            stuck: Mutex::new(Vec::new()),
        }
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    /// Policy used by [`acquire`](Self::acquire).
    pub fn policy(&self) -> &Arc<SandboxPolicy> {
        &self.policy
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, Arc<Entry>>> {
        self.sandboxes.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn stuck_list(&self) -> MutexGuard<'_, Vec<Arc<Entry>>> {
        self.stuck.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lookup(&self, key: &str) -> Result<Arc<Entry>> {
        self.table()
            .get(key)
            .cloned()
            .ok_or_else(|| SupervisorError::UnknownSession(key.to_string()))
    }

    pub(crate) fn entries(&self) -> Vec<Arc<Entry>> {
        self.table().values().cloned().collect()
    }

    /// Current state of the tracked sandbox for `key`, if any.
    pub fn state(&self, key: &str) -> Option<SandboxState> {
        self.table().get(key).map(|e| e.state())
    }

    // -----------------------------------------------------------------------
    // Acquire / release
    // -----------------------------------------------------------------------

    /// Return the endpoint of a ready sandbox for `key`, provisioning one
    /// with the default policy if needed.
    pub async fn acquire(&self, key: &str) -> Result<Endpoint> {
        self.acquire_with(key, Arc::clone(&self.policy)).await
    }

    /// Like [`acquire`](Self::acquire) with an explicit policy. The policy
    /// only applies when a new sandbox is provisioned; an existing sandbox
    /// keeps the policy it was created with.
    ///
    /// Concurrent callers for one key share a single provisioning attempt and
    /// all observe its outcome. A failed attempt is not retried here.
    pub async fn acquire_with(&self, key: &str, policy: Arc<SandboxPolicy>) -> Result<Endpoint> {
        loop {
            let entry = self.reserve(key, &policy);
            let mut rx = entry.subscribe();
            let settled = match rx.wait_for(|s| !s.is_provisioning()).await {
                Ok(state) => *state,
                Err(_) => return Err(SupervisorError::Evicted(key.to_string())),
            };

            match settled {
                state if state.is_live() => {
                    let endpoint = entry.update(|r| {
                        if !r.state.is_live() {
                            return None;
                        }
                        r.touch();
                        r.endpoint.clone()
                    });
                    if let Some(endpoint) = endpoint {
                        return Ok(endpoint);
                    }
                }
                SandboxState::Error => {
                    let failure = entry.read(|r| {
                        r.failed_from
                            .is_some_and(SandboxState::is_provisioning)
                            .then(|| r.last_error.clone().unwrap_or_default())
                    });
                    if let Some(reason) = failure {
                        return Err(SupervisorError::ProvisioningFailed {
                            key: key.to_string(),
                            reason,
                        });
                    }
                }
                SandboxState::Stopping => {
                    debug!(session = %key, "waiting for teardown before provisioning");
                    let _ = rx
                        .wait_for(|s| matches!(s, SandboxState::Removed | SandboxState::Error))
                        .await;
                }
                _ => {}
            }
        }
    }

    /// Find the record for `key`, or insert a fresh one and start
    /// provisioning it. Removed and Error records are replaced.
    fn reserve(&self, key: &str, policy: &Arc<SandboxPolicy>) -> Arc<Entry> {
        let mut table = self.table();
        if let Some(existing) = table.get(key) {
            match existing.state() {
                SandboxState::Removed => {}
                SandboxState::Error => {
                    if existing.read(SandboxRecord::needs_teardown) {
                        self.stuck_list().push(Arc::clone(existing));
                    }
                }
                _ => return Arc::clone(existing),
            }
        }

        let entry = Arc::new(Entry::new(key.to_string(), Arc::clone(policy)));
        table.insert(key.to_string(), Arc::clone(&entry));
        drop(table);

        info!(session = %key, image = %policy.image, "provisioning sandbox");
        tokio::spawn(provision(
            Arc::clone(&self.runtime),
            Arc::clone(&entry),
            self.provision_timeout,
        ));
        entry
    }

    /// Record activity on `key` without stopping anything.
    pub fn release(&self, key: &str) -> Result<()> {
        let entry = self.lookup(key)?;
        entry.update(|r| {
            r.touch();
            if r.state == SandboxState::InUse && r.active_queries == 0 {
                r.transition(SandboxState::Ready);
            }
        });
        Ok(())
    }

    /// Flag the sandbox InUse until the returned lease is dropped.
    pub fn begin_query(&self, key: &str) -> Result<QueryLease> {
        let entry = self.lookup(key)?;
        let endpoint = entry.update(|r| {
            if !r.state.is_live() {
                return None;
            }
            let endpoint = r.endpoint.clone()?;
            if r.state != SandboxState::InUse && !r.transition(SandboxState::InUse) {
                return None;
            }
            r.active_queries = r.active_queries.saturating_add(1);
            r.last_activity_at = Instant::now();
            Some(endpoint)
        });
        match endpoint {
            Some(endpoint) => Ok(QueryLease { entry, endpoint }),
            None => Err(SupervisorError::Evicted(key.to_string())),
        }
    }

    /// [`acquire`](Self::acquire) followed by [`begin_query`](Self::begin_query),
    /// re-acquiring if the sandbox is evicted in between.
    pub async fn acquire_lease(&self, key: &str) -> Result<QueryLease> {
        loop {
            self.acquire(key).await?;
            match self.begin_query(key) {
                Err(SupervisorError::Evicted(_) | SupervisorError::UnknownSession(_)) => {
                    debug!(session = %key, "sandbox went away before the query started");
                }
                other => return other,
            }
        }
    }

    // -----------------------------------------------------------------------
    // Eviction
    // -----------------------------------------------------------------------

    /// Stop and remove the sandbox for `key`. An in-flight provisioning
    /// attempt is allowed to settle first.
    pub async fn force_evict(&self, key: &str, reason: &str) -> Result<()> {
        let entry = self.lookup(key)?;
        let mut rx = entry.subscribe();
        let _ = rx.wait_for(|s| !s.is_provisioning()).await;
        if self.evict(&entry, reason, |_| true).await? {
            return Ok(());
        }

        // Another caller is tearing it down; wait for the outcome.
        let settled = rx
            .wait_for(|s| matches!(s, SandboxState::Removed | SandboxState::Error))
            .await
            .map(|s| *s)
            .unwrap_or(SandboxState::Removed);
        match settled {
            SandboxState::Error => {
                let last_error = entry.read(|r| r.last_error.clone()).unwrap_or_default();
                Err(RuntimeError::RemoveFailed(last_error).into())
            }
            _ => Ok(()),
        }
    }

    /// Tear down `entry` if `guard` still holds once the record is locked.
    ///
    /// Returns `Ok(false)` when nothing was done: the guard failed, the
    /// record is still provisioning, or another caller is already tearing
    /// it down.
    pub(crate) async fn evict(
        &self,
        entry: &Arc<Entry>,
        reason: &str,
        guard: impl FnOnce(&SandboxRecord) -> bool,
    ) -> Result<bool> {
        let claimed = entry.update(|r| {
            if r.state.is_provisioning()
                || matches!(r.state, SandboxState::Stopping | SandboxState::Removed)
                || !guard(r)
                || !r.transition(SandboxState::Stopping)
            {
                return None;
            }
            Some((
                r.session_key.clone(),
                r.container.clone(),
                r.policy.stop_timeout(),
            ))
        });
        let Some((key, container, stop_timeout)) = claimed else {
            return Ok(false);
        };

        info!(session = %key, reason, "evicting sandbox");
        let result = match &container {
            Some(container) => teardown(self.runtime.as_ref(), container, stop_timeout).await,
            None => Ok(()),
        };

        match result {
            Ok(()) => {
                entry.update(|r| {
                    r.container = None;
                    r.transition(SandboxState::Removed);
                });
                self.forget(entry);
                info!(session = %key, reason, "sandbox removed");
                Ok(true)
            }
            Err(e) => {
                entry.update(|r| r.fail(format!("teardown failed: {e}")));
                error!(session = %key, error = %e, "sandbox teardown failed");
                Err(e.into())
            }
        }
    }

    /// Drop `entry` from the table if it is still the current record for its key.
    fn forget(&self, entry: &Arc<Entry>) {
        let key = entry.read(|r| r.session_key.clone());
        let mut table = self.table();
        if table.get(&key).is_some_and(|e| Arc::ptr_eq(e, entry)) {
            table.remove(&key);
        }
    }

    /// Retry teardown of records left in Error by a failed teardown, and
    /// drop Error records whose container is already gone.
    ///
    /// Returns the number of containers removed.
    pub async fn reconcile(&self) -> usize {
        let mut candidates: Vec<Arc<Entry>> = std::mem::take(&mut *self.stuck_list());
        candidates.extend(
            self.entries()
                .into_iter()
                .filter(|e| e.state() == SandboxState::Error),
        );

        let mut recovered = 0;
        let mut still_stuck = Vec::new();
        for entry in candidates {
            let settled = entry.update(|r| {
                r.state == SandboxState::Error
                    && r.container.is_none()
                    && r.transition(SandboxState::Removed)
            });
            if settled {
                self.forget(&entry);
                continue;
            }

            match self
                .evict(&entry, "reconcile", SandboxRecord::needs_teardown)
                .await
            {
                Ok(true) => recovered += 1,
                Ok(false) => {}
                Err(_) => {
                    let key = entry.read(|r| r.session_key.clone());
                    let tracked = self
                        .table()
                        .get(&key)
                        .is_some_and(|e| Arc::ptr_eq(e, &entry));
                    if !tracked {
                        still_stuck.push(entry);
                    }
                }
            }
        }

        if !still_stuck.is_empty() {
            warn!(count = still_stuck.len(), "sandboxes still awaiting teardown");
            self.stuck_list().extend(still_stuck);
        }
        if recovered > 0 {
            info!(recovered, "reconciled stuck sandboxes");
        }
        recovered
    }

    /// Evict every tracked sandbox. Returns the number removed.
    pub async fn shutdown(&self) -> usize {
        let keys: Vec<String> = self.table().keys().cloned().collect();
        info!(count = keys.len(), "evicting all sandboxes");

        let results = join_all(keys.iter().map(|key| self.force_evict(key, "shutdown"))).await;
        let removed = results.iter().filter(|r| r.is_ok()).count();
        let failed = results.len() - removed;
        let reconciled = self.reconcile().await;
        if failed > reconciled {
            warn!(
                failed = failed - reconciled,
                "some sandboxes could not be removed during shutdown"
            );
        }
        removed + reconciled
    }

    /// Serializable view of every tracked record, including stuck ones.
    pub fn snapshot(&self) -> Vec<SandboxInfo> {
        let now = Instant::now();
        let mut entries = self.entries();
        entries.extend(self.stuck_list().iter().cloned());
        let mut infos: Vec<SandboxInfo> = entries.iter().map(|e| e.info(now)).collect();
        infos.sort_by(|a, b| a.session_key.cmp(&b.session_key));
        infos
    }
}

/// Holds a sandbox InUse while a query runs.
///
/// Dropping the lease returns the sandbox to Ready once no other lease is
/// outstanding, and refreshes its last activity.
pub struct QueryLease {
    entry: Arc<Entry>,
    endpoint: Endpoint,
}

impl QueryLease {
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

impl std::fmt::Debug for QueryLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryLease")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl Drop for QueryLease {
    fn drop(&mut self) {
        self.entry.update(|r| {
            r.active_queries = r.active_queries.saturating_sub(1);
            r.last_activity_at = Instant::now();
            if r.active_queries == 0 && r.state == SandboxState::InUse {
                r.transition(SandboxState::Ready);
            }
        });
    }
}

// ---------------------------------------------------------------------------
// Provisioning
// ---------------------------------------------------------------------------

fn container_name(key: &str) -> String {
    let slug: String = key
        .chars()
        .take(MAX_SLUG_LEN)
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .collect();
    format!("{NAME_PREFIX}-{slug}-{}", Uuid::new_v4().simple())
}

/// Drive a fresh record to Ready, or to Error with its container cleaned up.
async fn provision(runtime: Arc<dyn ContainerRuntime>, entry: Arc<Entry>, timeout: Duration) {
    let (key, policy) = entry.read(|r| (r.session_key.clone(), Arc::clone(&r.policy)));
    // Named before creation so a create call cut short by the timeout can
    // still be cleaned up.
    let container = ContainerRef::new(container_name(&key));
    entry.update(|r| r.container = Some(container.clone()));

    let started = Instant::now();
    let outcome = tokio::time::timeout(
        timeout,
        bring_up(runtime.as_ref(), &entry, &key, &container, &policy),
    )
    .await;

    let reason = match outcome {
        Ok(Ok(endpoint)) => {
            info!(
                session = %key,
                container = %container,
                endpoint = %endpoint,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "sandbox ready"
            );
            return;
        }
        Ok(Err(reason)) => reason,
        Err(_) => format!("provisioning timed out after {}s", timeout.as_secs()),
    };

    warn!(session = %key, container = %container, error = %reason, "sandbox provisioning failed");

    // Waiters are released by the Error transition, so the container must
    // already be gone by then.
    let cleaned = match teardown(runtime.as_ref(), &container, policy.stop_timeout()).await {
        Ok(()) => true,
        Err(e) => {
            warn!(
                session = %key,
                container = %container,
                error = %e,
                "cleanup after failed provisioning failed"
            );
            false
        }
    };
    entry.update(|r| {
        if cleaned {
            r.container = None;
        }
        r.fail(reason);
    });
}

async fn bring_up(
    runtime: &dyn ContainerRuntime,
    entry: &Entry,
    key: &str,
    container: &ContainerRef,
    policy: &SandboxPolicy,
) -> std::result::Result<Endpoint, String> {
    entry.update(|r| r.transition(SandboxState::Creating));
    let host_port = runtime.allocate_port().await.map_err(|e| e.to_string())?;
    runtime
        .create(&CreateRequest {
            container,
            session_key: key,
            host_port,
            policy,
        })
        .await
        .map_err(|e| e.to_string())?;

    entry.update(|r| r.transition(SandboxState::Starting));
    runtime.start(container).await.map_err(|e| e.to_string())?;

    entry.update(|r| r.transition(SandboxState::HealthChecking));
    wait_until_healthy(runtime, container, &policy.health).await?;

    let endpoint = Endpoint {
        host: runtime.host().to_string(),
        port: host_port,
    };
    let ready = entry.update(|r| {
        if !r.transition(SandboxState::Ready) {
            return false;
        }
        let now = Instant::now();
        r.endpoint = Some(endpoint.clone());
        r.last_activity_at = now;
        r.last_health_check_at = Some(now);
        true
    });
    if !ready {
        return Err("sandbox left provisioning unexpectedly".into());
    }
    Ok(endpoint)
}

/// Poll the readiness probe until it passes or the startup attempts run out.
async fn wait_until_healthy(
    runtime: &dyn ContainerRuntime,
    container: &ContainerRef,
    health: &HealthCheck,
) -> std::result::Result<(), String> {
    let attempts = health.startup_retries.max(1);
    let mut last_error = String::new();
    for attempt in 1..=attempts {
        match probe_once(runtime, container, health).await {
            Ok(()) => return Ok(()),
            Err(reason) => {
                debug!(container = %container, attempt, error = %reason, "readiness probe failed");
                last_error = reason;
            }
        }
        if attempt < attempts {
            tokio::time::sleep(health.startup_interval()).await;
        }
    }
    Err(format!("not ready after {attempts} probes: {last_error}"))
}

/// Run the health command once, bounded by the configured timeout.
pub(crate) async fn probe_once(
    runtime: &dyn ContainerRuntime,
    container: &ContainerRef,
    health: &HealthCheck,
) -> std::result::Result<(), String> {
    let timeout = health.timeout();
    match tokio::time::timeout(timeout, runtime.probe(container, &health.command, timeout)).await {
        Ok(Ok(ProbeOutcome::Healthy)) => Ok(()),
        Ok(Ok(ProbeOutcome::Unhealthy { exit_code, output })) => {
            Err(format!("probe exited with {exit_code}: {output}"))
        }
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err(format!("probe timed out after {}ms", timeout.as_millis())),
    }
}

/// Stop then remove. A failed stop still attempts a forced removal.
async fn teardown(
    runtime: &dyn ContainerRuntime,
    container: &ContainerRef,
    stop_timeout: Duration,
) -> sandbox::Result<()> {
    if let Err(e) = runtime.stop(container, stop_timeout).await {
        warn!(container = %container, error = %e, "stop failed, forcing removal");
    }
    runtime.remove(container).await
}
