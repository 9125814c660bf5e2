mod config;
mod container;
mod runtime;

pub use config::{DockerConfig, DockerEndpoint};
pub use container::{MANAGED_LABEL, SESSION_LABEL};
pub use runtime::DockerRuntime;
