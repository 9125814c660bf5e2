//! Sandbox lifecycle supervision and query admission.
//!
//! [`SandboxManager`] owns one sandbox per session key and drives it through
//! [`SandboxState`]. [`HealthMonitor`] and [`IdleReaper`] run beside it as
//! background tasks. [`AdmissionController`] rate-limits users, and
//! [`QueryGate`] combines the two for the request path.

mod admission;
mod error;
mod gate;
mod health;
mod manager;
mod reaper;
mod state;

pub use admission::{AdmissionController, RateBucket};
pub use error::{GateError, Result, SupervisorError};
pub use gate::QueryGate;
pub use health::{HEALTH_CHECK_EXHAUSTED, HealthMonitor};
pub use manager::{DEFAULT_PROVISION_TIMEOUT, QueryLease, SandboxManager};
pub use reaper::{IDLE_TIMEOUT, IdleReaper, SweepReport};
pub use state::{SandboxInfo, SandboxRecord, SandboxState};
