use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use supervisor::{SandboxInfo, SandboxState};
use tokio::sync::Mutex;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerMode {
    Running,
    Draining,
    Stopped,
}

#[derive(Debug, Serialize)]
struct RunnerStatus<'a> {
    mode: RunnerMode,
    runtime: &'a str,
    sandbox_count: usize,
    by_state: BTreeMap<SandboxState, usize>,
    sandboxes: &'a [SandboxInfo],
    rate_buckets: usize,
    active_leases: usize,
    #[serde(serialize_with = "serialize_iso")]
    started_at: DateTime<Utc>,
    #[serde(serialize_with = "serialize_iso")]
    updated_at: DateTime<Utc>,
}

/// Serialize as ISO 8601 with millisecond precision.
fn serialize_iso<S: serde::Serializer>(dt: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string())
}

/// Status tracker that persists the supervisor view to a JSON file atomically.
///
/// Share via `Arc<StatusTracker>`; immutable fields live outside the mutex.
pub struct StatusTracker {
    started_at: DateTime<Utc>,
    path: PathBuf,
    runtime: String,
    state: Mutex<MutableState>,
}

struct MutableState {
    mode: RunnerMode,
    sandboxes: Vec<SandboxInfo>,
    rate_buckets: usize,
    active_leases: usize,
}

impl StatusTracker {
    pub fn new(path: PathBuf, runtime: impl Into<String>) -> Self {
        Self {
            started_at: Utc::now(),
            path,
            runtime: runtime.into(),
            state: Mutex::new(MutableState {
                mode: RunnerMode::Running,
                sandboxes: Vec::new(),
                rate_buckets: 0,
                active_leases: 0,
            }),
        }
    }

    pub async fn set_mode(&self, mode: RunnerMode) {
        let mut state = self.state.lock().await;
        state.mode = mode;
        self.write_status(&state).await;
    }

    /// Replace the sandbox snapshot, the number of tracked rate buckets and
    /// the number of query leases held through the intake API.
    pub async fn update(
        &self,
        sandboxes: Vec<SandboxInfo>,
        rate_buckets: usize,
        active_leases: usize,
    ) {
        let mut state = self.state.lock().await;
        state.sandboxes = sandboxes;
        state.rate_buckets = rate_buckets;
        state.active_leases = active_leases;
        self.write_status(&state).await;
    }

    /// Write the initial status file.
    pub async fn write_initial(&self) {
        let state = self.state.lock().await;
        self.write_status(&state).await;
    }

    /// Atomic write: write to a temp file in the same directory, then rename.
    async fn write_status(&self, state: &MutableState) {
        let mut by_state = BTreeMap::new();
        for info in &state.sandboxes {
            *by_state.entry(info.state).or_insert(0) += 1;
        }
        let status = RunnerStatus {
            mode: state.mode,
            runtime: &self.runtime,
            sandbox_count: state.sandboxes.len(),
            by_state,
            sandboxes: &state.sandboxes,
            rate_buckets: state.rate_buckets,
            active_leases: state.active_leases,
            started_at: self.started_at,
            updated_at: Utc::now(),
        };

        let json = match serde_json::to_string_pretty(&status) {
            Ok(j) => j,
            Err(e) => {
                warn!(error = %e, "failed to serialize status");
                return;
            }
        };

        let tmp = self.path.with_extension("tmp");
        if let Err(e) = tokio::fs::write(&tmp, json.as_bytes()).await {
            warn!(error = %e, path = %tmp.display(), "failed to write status temp file");
            return;
        }
        if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
            warn!(error = %e, "failed to rename status file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandbox::Endpoint;

    fn read_status(path: &std::path::Path) -> serde_json::Value {
        let content = std::fs::read_to_string(path).unwrap();
        serde_json::from_str(&content).unwrap()
    }

    fn info(key: &str, state: SandboxState) -> SandboxInfo {
        SandboxInfo {
            session_key: key.into(),
            container: Some(format!("sqlbox-{key}")),
            state,
            endpoint: Some(Endpoint {
                host: "127.0.0.1".into(),
                port: 40001,
            }),
            image: "postgres:16-alpine".into(),
            created_at: Utc::now(),
            age_secs: 12,
            idle_secs: 3,
            active_queries: 0,
            health_failure_count: 0,
            last_error: None,
        }
    }

    #[tokio::test]
    async fn write_initial_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.json");
        let tracker = StatusTracker::new(path.clone(), "docker");

        tracker.write_initial().await;

        let status = read_status(&path);
        assert_eq!(status["mode"], "running");
        assert_eq!(status["runtime"], "docker");
        assert_eq!(status["sandbox_count"], 0);
        assert!(status["sandboxes"].as_array().unwrap().is_empty());
        assert!(status["started_at"].as_str().is_some());
        assert!(status["updated_at"].as_str().is_some());
    }

    #[tokio::test]
    async fn set_mode_updates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.json");
        let tracker = StatusTracker::new(path.clone(), "docker");

        tracker.write_initial().await;
        tracker.set_mode(RunnerMode::Draining).await;

        let status = read_status(&path);
        assert_eq!(status["mode"], "draining");
    }

    #[tokio::test]
    async fn update_writes_sandboxes_and_counts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.json");
        let tracker = StatusTracker::new(path.clone(), "docker");

        tracker
            .update(
                vec![
                    info("ex-1", SandboxState::Ready),
                    info("ex-2", SandboxState::Ready),
                    info("ex-3", SandboxState::InUse),
                ],
                4,
                1,
            )
            .await;

        let status = read_status(&path);
        assert_eq!(status["sandbox_count"], 3);
        assert_eq!(status["by_state"]["ready"], 2);
        assert_eq!(status["by_state"]["in_use"], 1);
        assert_eq!(status["rate_buckets"], 4);
        assert_eq!(status["active_leases"], 1);
        assert!(status.get("rate_limited_users").is_none());
        assert_eq!(status["sandboxes"][2]["session_key"], "ex-3");
        assert_eq!(status["sandboxes"][0]["endpoint"]["port"], 40001);

        // The snapshot survives a mode change.
        tracker.set_mode(RunnerMode::Stopped).await;
        let status = read_status(&path);
        assert_eq!(status["mode"], "stopped");
        assert_eq!(status["sandbox_count"], 3);
    }

    #[tokio::test]
    async fn timestamps_are_iso8601() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.json");
        let tracker = StatusTracker::new(path.clone(), "docker");

        tracker.write_initial().await;

        let status = read_status(&path);
        let started = status["started_at"].as_str().unwrap();
        assert!(started.ends_with('Z'));
        assert!(started.contains('T'));
        assert_eq!(started.len(), 24); // "2026-02-10T12:34:56.789Z"
    }

    #[tokio::test]
    async fn no_temp_file_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.json");
        let tracker = StatusTracker::new(path.clone(), "docker");

        tracker.write_initial().await;
        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());
    }
}
