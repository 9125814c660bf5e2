use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{ContainerRef, CreateRequest, ProbeOutcome};

/// Host container API as seen by the supervisor.
///
/// Implementations are thin: no retries, no state tracking. The supervisor
/// owns the lifecycle and decides when to call what.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Human-readable name for this runtime implementation (e.g. "docker").
    fn name(&self) -> &str;
    /// Host name or address clients use to reach published ports.
    fn host(&self) -> &str;

    /// Pick a free host port to publish a sandbox on.
    async fn allocate_port(&self) -> Result<u16>;
    /// Create (but do not start) a container named `request.container`.
    async fn create(&self, request: &CreateRequest<'_>) -> Result<ContainerRef>;
    async fn start(&self, container: &ContainerRef) -> Result<()>;
    /// Run `command` inside the container. A non-zero exit is reported as
    /// [`ProbeOutcome::Unhealthy`]; `Err` means the probe could not run at all.
    async fn probe(
        &self,
        container: &ContainerRef,
        command: &[String],
        timeout: Duration,
    ) -> Result<ProbeOutcome>;
    async fn stop(&self, container: &ContainerRef, timeout: Duration) -> Result<()>;
    /// Remove the container. Removing a container that no longer exists
    /// succeeds, so teardown can be retried safely.
    async fn remove(&self, container: &ContainerRef) -> Result<()>;
}
