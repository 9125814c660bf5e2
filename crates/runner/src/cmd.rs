mod benchmark;
mod check_config;
mod start;

use std::sync::Arc;

use sandbox_docker::DockerRuntime;
use tracing::{info, warn};

pub use benchmark::{BenchmarkArgs, run_benchmark};
pub use check_config::{CheckConfigArgs, run_check_config};
pub use start::{StartArgs, run_start};

use crate::config::RunnerConfig;
use crate::error::RunnerResult;

/// Connect to the Docker daemon and remove sandboxes left by a previous run.
async fn connect_runtime(config: &RunnerConfig) -> RunnerResult<Arc<DockerRuntime>> {
    let runtime = DockerRuntime::connect(config.docker_config()).await?;
    match runtime.cleanup_orphans().await {
        Ok(0) => {}
        Ok(removed) => info!(removed, "removed orphaned sandboxes"),
        Err(e) => warn!(error = %e, "orphan cleanup failed"),
    }
    Ok(Arc::new(runtime))
}
