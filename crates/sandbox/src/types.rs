use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::SandboxPolicy;

/// Opaque handle for a runtime container.
///
/// The supervisor chooses the name before asking the runtime to create the
/// container, so the handle is known even when a create call is cut short.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerRef(String);

impl ContainerRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Address a client uses to reach the sandboxed database.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

pub struct CreateRequest<'a> {
    pub container: &'a ContainerRef,
    pub session_key: &'a str,
    /// Host port the container port is published on.
    pub host_port: u16,
    pub policy: &'a SandboxPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Healthy,
    Unhealthy { exit_code: i64, output: String },
}

impl ProbeOutcome {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_displays_host_and_port() {
        let ep = Endpoint {
            host: "127.0.0.1".into(),
            port: 40001,
        };
        assert_eq!(ep.to_string(), "127.0.0.1:40001");
    }

    #[test]
    fn container_ref_serializes_as_plain_string() {
        let json = serde_json::to_string(&ContainerRef::new("sqlbox-ex-42")).unwrap();
        assert_eq!(json, "\"sqlbox-ex-42\"");
    }
}
