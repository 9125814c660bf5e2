use std::path::PathBuf;

use clap::Args;
use tracing::info;

use crate::config;
use crate::error::{RunnerError, RunnerResult};

#[derive(Args)]
pub struct CheckConfigArgs {
    /// Path to runner.yaml config file
    #[arg(long, short, env = "SQLBOX_RUNNER_CONFIG")]
    config: PathBuf,
}

/// Validate the config and print the resolved sandbox presets as YAML.
pub async fn run_check_config(args: CheckConfigArgs) -> RunnerResult<()> {
    let runner_config = config::load(&args.config).await?;
    let presets = runner_config.presets();

    let yaml = serde_yaml_ng::to_string(&presets)
        .map_err(|e| RunnerError::Internal(format!("render presets: {e}")))?;
    info!(
        default_preset = %runner_config.lifecycle.default_preset,
        presets = presets.len(),
        status_file = %runner_config.status_file.display(),
        "config ok"
    );
    print!("{yaml}");
    Ok(())
}
