use sandbox::RuntimeError;

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// Provisioning ended in Error. Not retried; the next acquire starts fresh.
    #[error("provisioning failed for session {key}: {reason}")]
    ProvisioningFailed { key: String, reason: String },

    #[error("sandbox for session {0} was evicted")]
    Evicted(String),

    #[error("unknown session: {0}")]
    UnknownSession(String),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

pub type Result<T> = std::result::Result<T, SupervisorError>;

/// Error returned by [`QueryGate::run`](crate::QueryGate::run).
///
/// Rate limiting, sandbox failures and failures of the query itself stay
/// distinguishable so callers can report them differently.
#[derive(Debug, thiserror::Error)]
pub enum GateError<E> {
    #[error("rate limited: no query points left for user {user_id}")]
    RateLimited { user_id: String },

    #[error(transparent)]
    Provisioning(SupervisorError),

    #[error("query failed: {0}")]
    Query(E),
}

impl<E> GateError<E> {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
}
