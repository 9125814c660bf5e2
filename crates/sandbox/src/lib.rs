mod config;
mod error;
mod memory;
pub mod presets;
mod runtime;
mod types;

pub use config::{HealthCheck, ResourceLimits, SandboxPolicy, SecurityOptions};
pub use error::{Result, RuntimeError};
pub use memory::{CallCounts, MemoryRuntime, ProbeStep};
pub use runtime::ContainerRuntime;
pub use types::{ContainerRef, CreateRequest, Endpoint, ProbeOutcome};
