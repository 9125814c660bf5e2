use std::net::IpAddr;
use std::path::PathBuf;

/// How to reach the Docker daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DockerEndpoint {
    /// `DOCKER_HOST` or the platform default socket.
    Local,
    UnixSocket(PathBuf),
}

#[derive(Debug, Clone)]
pub struct DockerConfig {
    pub endpoint: DockerEndpoint,
    /// Seconds before a request to the daemon is abandoned.
    pub request_timeout_secs: u64,
    /// Host address published sandbox ports are bound to.
    pub bind_ip: IpAddr,
    /// Host name handed to clients in sandbox endpoints.
    pub public_host: String,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            endpoint: DockerEndpoint::Local,
            request_timeout_secs: 120,
            bind_ip: IpAddr::from([127, 0, 0, 1]),
            public_host: "127.0.0.1".into(),
        }
    }
}
