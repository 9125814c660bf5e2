//! Built-in sandbox policies, one per supported exercise database.
//!
//! The runner config can override these or add new ones by name; callers
//! pick a preset per exercise type.

use std::collections::BTreeMap;

use crate::config::{HealthCheck, ResourceLimits, SandboxPolicy, SecurityOptions};

pub const POSTGRES: &str = "postgres";
pub const MYSQL: &str = "mysql";

/// Capabilities database entrypoints need to chown their data directory and
/// drop from root to the service user.
const DB_INIT_CAPS: [&str; 5] = ["CHOWN", "DAC_OVERRIDE", "FOWNER", "SETGID", "SETUID"];

fn base_resources() -> ResourceLimits {
    ResourceLimits {
        memory_mb: 256,
        memory_swap_mb: 256,
        cpu_shares: 512,
        cpu_quota_us: 50_000,
        cpu_period_us: 100_000,
        pids_limit: 128,
    }
}

fn hardened() -> SecurityOptions {
    SecurityOptions {
        cap_add: DB_INIT_CAPS.iter().map(|c| (*c).to_string()).collect(),
        ..SecurityOptions::default()
    }
}

fn tmpfs(paths: &[&str]) -> BTreeMap<String, String> {
    paths
        .iter()
        .map(|p| ((*p).to_string(), "rw,size=64m".to_string()))
        .collect()
}

pub fn postgres() -> SandboxPolicy {
    SandboxPolicy {
        image: "postgres:16-alpine".into(),
        container_port: 5432,
        env: vec![
            "POSTGRES_PASSWORD=sandbox".into(),
            "POSTGRES_DB=exercise".into(),
        ],
        resources: base_resources(),
        security: hardened(),
        tmpfs: tmpfs(&["/tmp", "/var/run/postgresql", "/var/lib/postgresql/data"]),
        network_mode: "bridge".into(),
        auto_remove: true,
        stop_timeout_secs: 10,
        idle_timeout_secs: 30 * 60,
        health: HealthCheck {
            command: vec!["pg_isready".into(), "-U".into(), "postgres".into()],
            interval_ms: 30_000,
            timeout_ms: 5_000,
            retries: 3,
            startup_interval_ms: 1_000,
            startup_retries: 30,
        },
    }
}

pub fn mysql() -> SandboxPolicy {
    SandboxPolicy {
        image: "mysql:8.4".into(),
        container_port: 3306,
        env: vec![
            "MYSQL_ROOT_PASSWORD=sandbox".into(),
            "MYSQL_DATABASE=exercise".into(),
        ],
        resources: ResourceLimits {
            memory_mb: 512,
            memory_swap_mb: 512,
            ..base_resources()
        },
        security: hardened(),
        tmpfs: tmpfs(&["/tmp", "/var/run/mysqld", "/var/lib/mysql"]),
        network_mode: "bridge".into(),
        auto_remove: true,
        stop_timeout_secs: 10,
        idle_timeout_secs: 30 * 60,
        health: HealthCheck {
            command: vec![
                "mysqladmin".into(),
                "ping".into(),
                "-h".into(),
                "127.0.0.1".into(),
                "--silent".into(),
            ],
            interval_ms: 30_000,
            timeout_ms: 5_000,
            retries: 3,
            startup_interval_ms: 2_000,
            startup_retries: 45,
        },
    }
}

/// All built-in presets keyed by name.
pub fn builtin() -> BTreeMap<String, SandboxPolicy> {
    BTreeMap::from([
        (POSTGRES.to_string(), postgres()),
        (MYSQL.to_string(), mysql()),
    ])
}
