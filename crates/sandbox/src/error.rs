#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("container runtime not available: {0}")]
    Unavailable(String),

    #[error("container creation failed: {0}")]
    CreateFailed(String),

    #[error("container start failed: {0}")]
    StartFailed(String),

    #[error("container stop failed: {0}")]
    StopFailed(String),

    #[error("container removal failed: {0}")]
    RemoveFailed(String),

    #[error("health probe failed: {0}")]
    ProbeFailed(String),

    #[error("port allocation failed: {0}")]
    PortAllocation(String),

    #[error("invalid policy: {0}")]
    InvalidPolicy(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RuntimeError {
    /// `true` when the runtime itself could not be reached, as opposed to a
    /// single container operation failing.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
