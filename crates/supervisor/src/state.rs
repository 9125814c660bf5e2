use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use sandbox::{ContainerRef, Endpoint, SandboxPolicy};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Lifecycle state of one sandbox.
///
/// ```text
/// Requested -> Creating -> Starting -> HealthChecking -> Ready <-> InUse
///                                                          |  \     |
///                                                          |   Idle |
///                                                          v        v
///                                                       Stopping -> Removed
/// ```
/// `Error` is reachable from every provisioning phase, from Ready/InUse/Idle
/// (health exhaustion) and from Stopping (failed teardown).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxState {
    Requested,
    Creating,
    Starting,
    HealthChecking,
    Ready,
    InUse,
    Idle,
    Stopping,
    Removed,
    Error,
}

impl SandboxState {
    /// Provisioning is still in flight; callers wait for it to settle.
    pub fn is_provisioning(self) -> bool {
        matches!(
            self,
            Self::Requested | Self::Creating | Self::Starting | Self::HealthChecking
        )
    }

    /// The sandbox is serving, or may serve, queries and has an endpoint.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Ready | Self::InUse | Self::Idle)
    }

    pub fn can_transition_to(self, next: SandboxState) -> bool {
        use SandboxState::*;
        matches!(
            (self, next),
            (Requested, Creating | Error)
                | (Creating, Starting | Error)
                | (Starting, HealthChecking | Error)
                | (HealthChecking, Ready | Error)
                | (Ready, InUse | Idle | Stopping | Error)
                | (InUse, Ready | Stopping | Error)
                | (Idle, Ready | InUse | Stopping | Error)
                | (Stopping, Removed | Error)
                | (Error, Stopping | Removed)
        )
    }
}

impl std::fmt::Display for SandboxState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Requested => "requested",
            Self::Creating => "creating",
            Self::Starting => "starting",
            Self::HealthChecking => "health_checking",
            Self::Ready => "ready",
            Self::InUse => "in_use",
            Self::Idle => "idle",
            Self::Stopping => "stopping",
            Self::Removed => "removed",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Tracked state of one session's sandbox.
#[derive(Debug)]
pub struct SandboxRecord {
    pub session_key: String,
    /// Set once the container name is chosen; cleared after confirmed removal.
    pub container: Option<ContainerRef>,
    pub state: SandboxState,
    pub endpoint: Option<Endpoint>,
    pub policy: Arc<SandboxPolicy>,
    pub created_at: Instant,
    pub created_wall: DateTime<Utc>,
    pub last_activity_at: Instant,
    pub last_health_check_at: Option<Instant>,
    pub health_failure_count: u32,
    pub last_error: Option<String>,
    /// State the record was in when it entered Error.
    pub failed_from: Option<SandboxState>,
    /// Outstanding [`QueryLease`](crate::QueryLease)s.
    pub active_queries: u32,
}

impl SandboxRecord {
    fn new(session_key: String, policy: Arc<SandboxPolicy>) -> Self {
        let now = Instant::now();
        Self {
            session_key,
            container: None,
            state: SandboxState::Requested,
            endpoint: None,
            policy,
            created_at: now,
            created_wall: Utc::now(),
            last_activity_at: now,
            last_health_check_at: None,
            health_failure_count: 0,
            last_error: None,
            failed_from: None,
            active_queries: 0,
        }
    }

    /// Move to `next` if the state machine allows it.
    ///
    /// Leaving the live states drops the endpoint.
    pub fn transition(&mut self, next: SandboxState) -> bool {
        if !self.state.can_transition_to(next) {
            warn!(
                session = %self.session_key,
                from = %self.state,
                to = %next,
                "rejected sandbox state transition"
            );
            return false;
        }
        debug!(session = %self.session_key, from = %self.state, to = %next, "sandbox state");
        if next == SandboxState::Error {
            self.failed_from = Some(self.state);
        }
        self.state = next;
        if !next.is_live() {
            self.endpoint = None;
        }
        true
    }

    /// Enter Error with `reason`.
    pub fn fail(&mut self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        if self.transition(SandboxState::Error) {
            self.last_error = Some(reason);
            true
        } else {
            false
        }
    }

    /// Mark activity. An Idle sandbox becomes Ready again.
    pub fn touch(&mut self) {
        self.last_activity_at = Instant::now();
        if self.state == SandboxState::Idle {
            self.transition(SandboxState::Ready);
        }
    }

    pub fn idle_for(&self, now: Instant) -> std::time::Duration {
        now.saturating_duration_since(self.last_activity_at)
    }

    /// Error left over from a teardown that did not complete.
    pub fn needs_teardown(&self) -> bool {
        self.state == SandboxState::Error && self.container.is_some()
    }

    fn info(&self, now: Instant) -> SandboxInfo {
        SandboxInfo {
            session_key: self.session_key.clone(),
            container: self.container.as_ref().map(|c| c.as_str().to_string()),
            state: self.state,
            endpoint: self.endpoint.clone(),
            image: self.policy.image.clone(),
            created_at: self.created_wall,
            age_secs: now.saturating_duration_since(self.created_at).as_secs(),
            idle_secs: self.idle_for(now).as_secs(),
            active_queries: self.active_queries,
            health_failure_count: self.health_failure_count,
            last_error: self.last_error.clone(),
        }
    }
}

/// Serializable view of a [`SandboxRecord`].
#[derive(Debug, Clone, Serialize)]
pub struct SandboxInfo {
    pub session_key: String,
    pub container: Option<String>,
    pub state: SandboxState,
    pub endpoint: Option<Endpoint>,
    pub image: String,
    pub created_at: DateTime<Utc>,
    pub age_secs: u64,
    pub idle_secs: u64,
    pub active_queries: u32,
    pub health_failure_count: u32,
    pub last_error: Option<String>,
}

/// A record plus the channel its state changes are published on.
///
/// The record lock is only held to read or write fields, never across an
/// await point.
pub(crate) struct Entry {
    record: Mutex<SandboxRecord>,
    state_tx: watch::Sender<SandboxState>,
}

impl Entry {
    pub(crate) fn new(session_key: String, policy: Arc<SandboxPolicy>) -> Self {
        let (state_tx, _) = watch::channel(SandboxState::Requested);
        Self {
            record: Mutex::new(SandboxRecord::new(session_key, policy)),
            state_tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SandboxRecord> {
        self.record.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Mutate the record and publish the resulting state to waiters.
    pub(crate) fn update<R>(&self, f: impl FnOnce(&mut SandboxRecord) -> R) -> R {
        let mut record = self.lock();
        let out = f(&mut record);
        let state = record.state;
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        out
    }

    pub(crate) fn read<R>(&self, f: impl FnOnce(&SandboxRecord) -> R) -> R {
        f(&self.lock())
    }

    pub(crate) fn state(&self) -> SandboxState {
        self.lock().state
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<SandboxState> {
        self.state_tx.subscribe()
    }

    pub(crate) fn info(&self, now: Instant) -> SandboxInfo {
        self.lock().info(now)
    }
}
