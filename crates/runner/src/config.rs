use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use sandbox::{SandboxPolicy, presets};
use sandbox_docker::{DockerConfig, DockerEndpoint};
use serde::{Deserialize, Serialize};

use crate::error::{RunnerError, RunnerResult};

pub(crate) const DEFAULT_CAPACITY: u32 = 10;
pub(crate) const DEFAULT_WINDOW_SECS: u64 = 60;
pub(crate) const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;
const DEFAULT_BUCKET_RETENTION_SECS: u64 = 3600;
const DEFAULT_PROVISION_TIMEOUT_SECS: u64 = 120;
const DEFAULT_STATUS_INTERVAL_SECS: u64 = 10;
const DEFAULT_STATUS_FILE: &str = "status.json";
const DEFAULT_API_PORT: u16 = 7070;
const DEFAULT_LEASE_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct RunnerConfig {
    #[serde(default)]
    pub docker: DockerSection,
    #[serde(default)]
    pub admission: AdmissionSection,
    #[serde(default)]
    pub lifecycle: LifecycleSection,
    #[serde(default)]
    pub api: ApiSection,
    /// Extra or overriding sandbox policies, by preset name.
    #[serde(default)]
    pub presets: BTreeMap<String, SandboxPolicy>,
    #[serde(default = "default_status_file")]
    pub status_file: PathBuf,
}

fn default_status_file() -> PathBuf {
    PathBuf::from(DEFAULT_STATUS_FILE)
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerSection {
    /// Unix socket of the daemon. Unset uses `DOCKER_HOST` or the platform default.
    pub socket: Option<PathBuf>,
    pub request_timeout_secs: u64,
    pub bind_ip: IpAddr,
    pub public_host: String,
}

impl Default for DockerSection {
    fn default() -> Self {
        let defaults = DockerConfig::default();
        Self {
            socket: None,
            request_timeout_secs: defaults.request_timeout_secs,
            bind_ip: defaults.bind_ip,
            public_host: defaults.public_host,
        }
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionSection {
    /// Queries allowed per user per window.
    pub capacity: u32,
    pub window_secs: u64,
    /// Rate buckets unused for this long are dropped.
    pub bucket_retention_secs: u64,
}

impl Default for AdmissionSection {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            window_secs: DEFAULT_WINDOW_SECS,
            bucket_retention_secs: DEFAULT_BUCKET_RETENTION_SECS,
        }
    }
}

impl AdmissionSection {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn bucket_retention(&self) -> Duration {
        Duration::from_secs(self.bucket_retention_secs)
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleSection {
    pub sweep_interval_secs: u64,
    pub provision_timeout_secs: u64,
    pub status_interval_secs: u64,
    pub default_preset: String,
}

impl Default for LifecycleSection {
    fn default() -> Self {
        Self {
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            provision_timeout_secs: DEFAULT_PROVISION_TIMEOUT_SECS,
            status_interval_secs: DEFAULT_STATUS_INTERVAL_SECS,
            default_preset: presets::POSTGRES.into(),
        }
    }
}

impl LifecycleSection {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn provision_timeout(&self) -> Duration {
        Duration::from_secs(self.provision_timeout_secs)
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval_secs)
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiSection {
    pub listen: SocketAddr,
    /// Query leases held longer than this are released on the next status tick.
    pub lease_timeout_secs: u64,
}

impl Default for ApiSection {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], DEFAULT_API_PORT)),
            lease_timeout_secs: DEFAULT_LEASE_TIMEOUT_SECS,
        }
    }
}

impl ApiSection {
    pub fn lease_timeout(&self) -> Duration {
        Duration::from_secs(self.lease_timeout_secs)
    }
}

/// Load and validate a runner config from a YAML file.
///
/// A relative `status_file` is resolved against the config file's parent directory.
pub async fn load(path: &Path) -> RunnerResult<RunnerConfig> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| RunnerError::Config(format!("read {}: {e}", path.display())))?;
    let mut config: RunnerConfig = serde_yaml_ng::from_str(&content)
        .map_err(|e| RunnerError::Config(format!("parse {}: {e}", path.display())))?;
    if let Some(config_dir) = path.parent() {
        config.resolve_relative_paths(config_dir);
    }
    config.validate()?;
    Ok(config)
}

impl RunnerConfig {
    fn resolve_relative_paths(&mut self, config_dir: &Path) {
        if self.status_file.is_relative() {
            self.status_file = config_dir.join(&self.status_file);
        }
    }

    fn validate(&self) -> RunnerResult<()> {
        let invalid = |msg: &str| Err(RunnerError::Config(msg.to_string()));

        if self.admission.capacity == 0 {
            return invalid("admission.capacity must be non-zero");
        }
        if self.admission.window_secs == 0 {
            return invalid("admission.window_secs must be non-zero");
        }
        if self.lifecycle.sweep_interval_secs == 0 {
            return invalid("lifecycle.sweep_interval_secs must be non-zero");
        }
        if self.lifecycle.provision_timeout_secs == 0 {
            return invalid("lifecycle.provision_timeout_secs must be non-zero");
        }
        if self.lifecycle.status_interval_secs == 0 {
            return invalid("lifecycle.status_interval_secs must be non-zero");
        }
        if self.api.lease_timeout_secs == 0 {
            return invalid("api.lease_timeout_secs must be non-zero");
        }
        if self.docker.request_timeout_secs == 0 {
            return invalid("docker.request_timeout_secs must be non-zero");
        }

        for (name, policy) in &self.presets {
            policy
                .validate()
                .map_err(|e| RunnerError::Config(format!("preset {name}: {e}")))?;
        }
        self.policy(None).map(|_| ())
    }

    /// Built-in presets overlaid with the ones defined in the config.
    pub fn presets(&self) -> BTreeMap<String, SandboxPolicy> {
        let mut all = presets::builtin();
        all.extend(
            self.presets
                .iter()
                .map(|(name, policy)| (name.clone(), policy.clone())),
        );
        all
    }

    /// Policy for preset `name`, or the configured default preset.
    pub fn policy(&self, name: Option<&str>) -> RunnerResult<SandboxPolicy> {
        let name = name.unwrap_or(self.lifecycle.default_preset.as_str());
        self.presets().remove(name).ok_or_else(|| {
            RunnerError::Config(format!(
                "unknown preset {name:?} (available: {})",
                self.presets().into_keys().collect::<Vec<_>>().join(", ")
            ))
        })
    }

    pub fn docker_config(&self) -> DockerConfig {
        DockerConfig {
            endpoint: match &self.docker.socket {
                Some(path) => DockerEndpoint::UnixSocket(path.clone()),
                None => DockerEndpoint::Local,
            },
            request_timeout_secs: self.docker.request_timeout_secs,
            bind_ip: self.docker.bind_ip,
            public_host: self.docker.public_host.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn write_config(dir: &Path, yaml: &str) -> PathBuf {
        let config_path = dir.join("runner.yaml");
        tokio::fs::write(&config_path, yaml).await.unwrap();
        config_path
    }

    #[tokio::test]
    async fn load_full_config() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = format!(
            r#"
docker:
  socket: /var/run/docker.sock
  request_timeout_secs: 30
  bind_ip: 10.0.0.5
  public_host: sandbox.internal
admission:
  capacity: 20
  window_secs: 30
  bucket_retention_secs: 600
lifecycle:
  sweep_interval_secs: 15
  provision_timeout_secs: 90
  status_interval_secs: 5
  default_preset: mysql
api:
  listen: 0.0.0.0:9000
  lease_timeout_secs: 60
status_file: {status}
"#,
            status = dir.path().join("state/status.json").display(),
        );
        let config = load(&write_config(dir.path(), &yaml).await).await.unwrap();

        assert_eq!(config.admission.capacity, 20);
        assert_eq!(config.admission.window(), Duration::from_secs(30));
        assert_eq!(config.lifecycle.sweep_interval(), Duration::from_secs(15));
        assert_eq!(config.lifecycle.provision_timeout(), Duration::from_secs(90));
        assert_eq!(config.status_file, dir.path().join("state/status.json"));
        assert_eq!(config.api.listen, SocketAddr::from(([0, 0, 0, 0], 9000)));
        assert_eq!(config.api.lease_timeout(), Duration::from_secs(60));

        let docker = config.docker_config();
        assert_eq!(
            docker.endpoint,
            DockerEndpoint::UnixSocket("/var/run/docker.sock".into())
        );
        assert_eq!(docker.bind_ip, IpAddr::from([10, 0, 0, 5]));
        assert_eq!(docker.public_host, "sandbox.internal");

        assert_eq!(config.policy(None).unwrap(), presets::mysql());
    }

    #[tokio::test]
    async fn load_defaults_for_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = load(&write_config(dir.path(), "{}\n").await).await.unwrap();

        assert_eq!(config.admission.capacity, DEFAULT_CAPACITY);
        assert_eq!(config.admission.window_secs, DEFAULT_WINDOW_SECS);
        assert_eq!(
            config.lifecycle.sweep_interval_secs,
            DEFAULT_SWEEP_INTERVAL_SECS
        );
        assert_eq!(config.docker_config().endpoint, DockerEndpoint::Local);
        assert_eq!(config.api.listen.to_string(), "127.0.0.1:7070");
        assert_eq!(config.api.lease_timeout_secs, DEFAULT_LEASE_TIMEOUT_SECS);
        assert_eq!(config.policy(None).unwrap(), presets::postgres());
    }

    #[tokio::test]
    async fn load_resolves_relative_status_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = load(&write_config(dir.path(), "status_file: run/status.json\n").await)
            .await
            .unwrap();
        assert!(config.status_file.is_absolute());
        assert_eq!(config.status_file, dir.path().join("run/status.json"));
    }

    #[tokio::test]
    async fn custom_preset_overrides_builtin() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = r#"
lifecycle:
  default_preset: postgres
presets:
  postgres:
    image: postgres:15-alpine
    container_port: 5432
    env: ["POSTGRES_PASSWORD=exercise"]
    resources:
      memory_mb: 128
      memory_swap_mb: 128
      cpu_shares: 256
      cpu_quota_us: 25000
      cpu_period_us: 100000
      pids_limit: 64
    network_mode: none
    auto_remove: true
    stop_timeout_secs: 5
    idle_timeout_secs: 600
    health:
      command: ["pg_isready"]
      interval_ms: 10000
      timeout_ms: 2000
      retries: 2
      startup_interval_ms: 500
      startup_retries: 20
"#;
        let config = load(&write_config(dir.path(), yaml).await).await.unwrap();

        let policy = config.policy(None).unwrap();
        assert_eq!(policy.image, "postgres:15-alpine");
        assert_eq!(policy.resources.memory_mb, 128);
        // Omitted security section falls back to the hardened defaults.
        assert_eq!(policy.security.cap_drop, vec!["ALL".to_string()]);
        assert!(config.presets().contains_key(presets::MYSQL));
    }

    #[tokio::test]
    async fn load_fails_on_unknown_default_preset() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = "lifecycle:\n  default_preset: oracle\n";
        let err = load(&write_config(dir.path(), yaml).await)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unknown preset"), "got: {err}");
    }

    #[tokio::test]
    async fn load_fails_on_invalid_preset() {
        let dir = tempfile::tempdir().unwrap();
        let mut policy = presets::postgres();
        policy.resources.memory_swap_mb = policy.resources.memory_mb - 1;
        let config = RunnerConfig {
            docker: DockerSection::default(),
            admission: AdmissionSection::default(),
            lifecycle: LifecycleSection::default(),
            api: ApiSection::default(),
            presets: BTreeMap::from([("tight".to_string(), policy)]),
            status_file: default_status_file(),
        };
        let yaml = serde_yaml_ng::to_string(&config).unwrap();

        let err = load(&write_config(dir.path(), &yaml).await)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("preset tight"), "got: {err}");
        assert!(err.to_string().contains("memory_swap_mb"), "got: {err}");
    }

    #[tokio::test]
    async fn load_fails_on_zero_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = "admission:\n  capacity: 0\n";
        let err = load(&write_config(dir.path(), yaml).await)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("capacity"), "got: {err}");
    }

    #[tokio::test]
    async fn load_fails_on_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = load(&dir.path().join("absent.yaml")).await.unwrap_err();
        assert!(matches!(err, RunnerError::Config(_)));
    }
}
