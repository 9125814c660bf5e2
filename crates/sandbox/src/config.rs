use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RuntimeError};

/// Memory and CPU caps applied to a sandbox container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub memory_mb: u32,
    /// Memory + swap. Equal to `memory_mb` disables swap entirely.
    pub memory_swap_mb: u32,
    /// Relative CPU weight (Docker default is 1024).
    pub cpu_shares: u32,
    /// CFS quota in microseconds per `cpu_period_us`.
    pub cpu_quota_us: u32,
    pub cpu_period_us: u32,
    pub pids_limit: u32,
}

/// Hardening flags for a sandbox container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityOptions {
    pub cap_drop: Vec<String>,
    /// Capabilities re-added after `cap_drop`. Database images need a few to
    /// switch from root to their service user during init.
    pub cap_add: Vec<String>,
    pub read_only_rootfs: bool,
    pub no_new_privileges: bool,
}

impl Default for SecurityOptions {
    fn default() -> Self {
        Self {
            cap_drop: vec!["ALL".into()],
            cap_add: Vec::new(),
            read_only_rootfs: true,
            no_new_privileges: true,
        }
    }
}

/// Readiness probe used both while provisioning and by the background monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub command: Vec<String>,
    /// Interval between background probes of a ready sandbox.
    pub interval_ms: u64,
    /// Upper bound for a single probe.
    pub timeout_ms: u64,
    /// Consecutive background failures before the sandbox is evicted.
    pub retries: u32,
    /// Interval between readiness probes while provisioning.
    pub startup_interval_ms: u64,
    /// Readiness probes attempted while provisioning before giving up.
    pub startup_retries: u32,
}

impl HealthCheck {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn startup_interval(&self) -> Duration {
        Duration::from_millis(self.startup_interval_ms)
    }
}

/// Everything needed to create, harden, probe and clean up one sandbox.
///
/// Read-only at runtime: a copy is taken when a sandbox is created and never
/// changes for the lifetime of that sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxPolicy {
    pub image: String,
    /// Port the database listens on inside the container.
    pub container_port: u16,
    #[serde(default)]
    pub env: Vec<String>,
    pub resources: ResourceLimits,
    #[serde(default)]
    pub security: SecurityOptions,
    /// Writable tmpfs mounts (path -> mount options), required when the
    /// root filesystem is read-only.
    #[serde(default)]
    pub tmpfs: BTreeMap<String, String>,
    pub network_mode: String,
    pub auto_remove: bool,
    pub stop_timeout_secs: u32,
    pub idle_timeout_secs: u64,
    pub health: HealthCheck,
}

impl SandboxPolicy {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.stop_timeout_secs))
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Reject policies that would produce an unusable or unbounded sandbox.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(RuntimeError::InvalidPolicy(msg));

        if self.image.trim().is_empty() {
            return invalid("image must not be empty".into());
        }
        if self.container_port == 0 {
            return invalid("container_port must be non-zero".into());
        }
        let r = &self.resources;
        if r.memory_mb == 0 {
            return invalid("resources.memory_mb must be non-zero".into());
        }
        if r.memory_swap_mb < r.memory_mb {
            return invalid(format!(
                "resources.memory_swap_mb ({}) must be >= memory_mb ({})",
                r.memory_swap_mb, r.memory_mb
            ));
        }
        if r.cpu_period_us == 0 || r.cpu_quota_us == 0 {
            return invalid("resources.cpu_quota_us and cpu_period_us must be non-zero".into());
        }
        if r.pids_limit == 0 {
            return invalid("resources.pids_limit must be non-zero".into());
        }
        if self.network_mode.trim().is_empty() {
            return invalid("network_mode must not be empty".into());
        }
        if self.idle_timeout_secs == 0 {
            return invalid("idle_timeout_secs must be non-zero".into());
        }
        let h = &self.health;
        if h.command.is_empty() {
            return invalid("health.command must not be empty".into());
        }
        if h.retries == 0 || h.startup_retries == 0 {
            return invalid("health.retries and health.startup_retries must be >= 1".into());
        }
        if h.interval_ms == 0 || h.timeout_ms == 0 || h.startup_interval_ms == 0 {
            return invalid("health intervals and timeout must be non-zero".into());
        }
        Ok(())
    }
}
