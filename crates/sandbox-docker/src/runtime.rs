use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::API_DEFAULT_VERSION;
use bollard::Docker;
use bollard::container::{
    CreateContainerOptions, ListContainersOptions, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use futures_util::StreamExt;
use sandbox::{ContainerRef, ContainerRuntime, CreateRequest, ProbeOutcome, RuntimeError};
use tracing::{info, warn};

use crate::config::{DockerConfig, DockerEndpoint};
use crate::container::{MANAGED_LABEL, build_container_config};

/// Probe output kept for diagnostics; the rest is discarded.
const MAX_PROBE_OUTPUT: usize = 4096;

/// [`ContainerRuntime`] backed by the Docker Engine API.
pub struct DockerRuntime {
    docker: Docker,
    config: DockerConfig,
}

impl DockerRuntime {
    /// Connect to the daemon and verify it answers.
    pub async fn connect(config: DockerConfig) -> sandbox::Result<Self> {
        let docker = match &config.endpoint {
            DockerEndpoint::Local => Docker::connect_with_local_defaults(),
            DockerEndpoint::UnixSocket(path) => Docker::connect_with_socket(
                &path.to_string_lossy(),
                config.request_timeout_secs,
                API_DEFAULT_VERSION,
            ),
        }
        .map_err(|e| RuntimeError::Unavailable(format!("connect: {e}")))?;

        docker
            .ping()
            .await
            .map_err(|e| RuntimeError::Unavailable(format!("ping: {e}")))?;

        info!(endpoint = ?config.endpoint, "docker runtime connected");
        Ok(Self { docker, config })
    }

    /// Remove every container carrying the managed label.
    ///
    /// Called once at startup: anything labelled as ours that exists before
    /// the supervisor has created a single sandbox is left over from a
    /// previous process and is not tracked by anyone.
    pub async fn cleanup_orphans(&self) -> sandbox::Result<usize> {
        let filters = HashMap::from([("label".to_string(), vec![format!("{MANAGED_LABEL}=true")])]);
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| classify(e, RuntimeError::RemoveFailed))?;

        let mut removed = 0;
        for summary in containers {
            let Some(id) = summary.id else { continue };
            match self.remove(&ContainerRef::new(id.clone())).await {
                Ok(()) => removed += 1,
                Err(e) => warn!(container = %id, error = %e, "failed to remove orphaned container"),
            }
        }
        if removed > 0 {
            info!(removed, "removed orphaned sandbox containers");
        }
        Ok(removed)
    }

    async fn run_probe(
        &self,
        container: &ContainerRef,
        command: &[String],
    ) -> sandbox::Result<ProbeOutcome> {
        let exec = self
            .docker
            .create_exec(
                container.as_str(),
                CreateExecOptions {
                    cmd: Some(command.to_vec()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| classify(e, RuntimeError::ProbeFailed))?;

        let mut output = String::new();
        match self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| classify(e, RuntimeError::ProbeFailed))?
        {
            StartExecResults::Attached { output: mut stream, .. } => {
                while let Some(chunk) = stream.next().await {
                    let chunk = chunk.map_err(|e| classify(e, RuntimeError::ProbeFailed))?;
                    if output.len() < MAX_PROBE_OUTPUT {
                        output.push_str(&String::from_utf8_lossy(&chunk.into_bytes()));
                    }
                }
            }
            StartExecResults::Detached => {}
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| classify(e, RuntimeError::ProbeFailed))?;

        match inspect.exit_code {
            Some(0) => Ok(ProbeOutcome::Healthy),
            Some(exit_code) => Ok(ProbeOutcome::Unhealthy {
                exit_code,
                output: output.trim().to_string(),
            }),
            None => Err(RuntimeError::ProbeFailed(format!(
                "{container}: probe finished without exit code"
            ))),
        }
    }
}

/// Map a bollard error onto the runtime error taxonomy.
///
/// Responses from the daemon are failures of the operation itself; anything
/// that never produced a response means the daemon is unreachable.
fn classify(error: BollardError, op: fn(String) -> RuntimeError) -> RuntimeError {
    match error {
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => op(format!("{status_code}: {message}")),
        other => RuntimeError::Unavailable(other.to_string()),
    }
}

fn is_status(error: &BollardError, codes: &[u16]) -> bool {
    matches!(
        error,
        BollardError::DockerResponseServerError { status_code, .. } if codes.contains(status_code)
    )
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn name(&self) -> &str {
        "docker"
    }

    fn host(&self) -> &str {
        &self.config.public_host
    }

    async fn allocate_port(&self) -> sandbox::Result<u16> {
        // Bind to port 0 and let the kernel pick; the listener is released
        // immediately so Docker can bind the same port.
        let listener = tokio::net::TcpListener::bind((self.config.bind_ip, 0))
            .await
            .map_err(|e| RuntimeError::PortAllocation(e.to_string()))?;
        let port = listener
            .local_addr()
            .map_err(|e| RuntimeError::PortAllocation(e.to_string()))?
            .port();
        drop(listener);
        Ok(port)
    }

    async fn create(&self, request: &CreateRequest<'_>) -> sandbox::Result<ContainerRef> {
        let config = build_container_config(request, self.config.bind_ip);
        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: request.container.as_str().to_string(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| classify(e, RuntimeError::CreateFailed))?;

        info!(
            container = %request.container,
            session = request.session_key,
            image = %request.policy.image,
            "container created"
        );
        Ok(request.container.clone())
    }

    async fn start(&self, container: &ContainerRef) -> sandbox::Result<()> {
        self.docker
            .start_container(container.as_str(), None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| classify(e, RuntimeError::StartFailed))?;
        info!(container = %container, "container started");
        Ok(())
    }

    async fn probe(
        &self,
        container: &ContainerRef,
        command: &[String],
        timeout: Duration,
    ) -> sandbox::Result<ProbeOutcome> {
        match tokio::time::timeout(timeout, self.run_probe(container, command)).await {
            Ok(result) => result,
            Err(_) => Err(RuntimeError::ProbeFailed(format!(
                "{container}: probe timed out after {timeout:?}"
            ))),
        }
    }

    async fn stop(&self, container: &ContainerRef, timeout: Duration) -> sandbox::Result<()> {
        let t = i64::try_from(timeout.as_secs()).unwrap_or(i64::MAX);
        match self
            .docker
            .stop_container(container.as_str(), Some(StopContainerOptions { t }))
            .await
        {
            Ok(()) => {
                info!(container = %container, "container stopped");
                Ok(())
            }
            // 304: already stopped, 404: already gone (auto-remove).
            Err(e) if is_status(&e, &[304, 404]) => Ok(()),
            Err(e) => Err(classify(e, RuntimeError::StopFailed)),
        }
    }

    async fn remove(&self, container: &ContainerRef) -> sandbox::Result<()> {
        match self
            .docker
            .remove_container(
                container.as_str(),
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => {
                info!(container = %container, "container removed");
                Ok(())
            }
            // 404: gone already. 409: removal already in progress (auto-remove).
            Err(e) if is_status(&e, &[404, 409]) => Ok(()),
            Err(e) => Err(classify(e, RuntimeError::RemoveFailed)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_error(status_code: u16) -> BollardError {
        BollardError::DockerResponseServerError {
            status_code,
            message: "boom".into(),
        }
    }

    #[test]
    fn daemon_responses_map_to_operation_errors() {
        let err = classify(server_error(500), RuntimeError::CreateFailed);
        assert!(matches!(err, RuntimeError::CreateFailed(msg) if msg.contains("500")));
    }

    #[test]
    fn transport_errors_map_to_unavailable() {
        let err = classify(
            BollardError::RequestTimeoutError,
            RuntimeError::ProbeFailed,
        );
        assert!(err.is_unavailable());
    }

    #[test]
    fn status_matching() {
        assert!(is_status(&server_error(404), &[304, 404]));
        assert!(!is_status(&server_error(500), &[304, 404]));
        assert!(!is_status(&BollardError::RequestTimeoutError, &[404]));
    }
}
