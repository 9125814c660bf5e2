use std::future::Future;
use std::sync::Arc;

use sandbox::Endpoint;
use tracing::debug;

use crate::admission::AdmissionController;
use crate::error::GateError;
use crate::manager::{QueryLease, SandboxManager};

/// Entry point for running one query on behalf of a user.
///
/// Order: admission, then acquire, then the query under a lease. A rate
/// limited attempt never touches the sandbox.
#[derive(Clone)]
pub struct QueryGate {
    admission: Arc<AdmissionController>,
    manager: Arc<SandboxManager>,
}

impl QueryGate {
    pub fn new(admission: Arc<AdmissionController>, manager: Arc<SandboxManager>) -> Self {
        Self { admission, manager }
    }

    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    pub fn manager(&self) -> &Arc<SandboxManager> {
        &self.manager
    }

    /// Run `query` against the session's sandbox if `user_id` has quota left.
    pub async fn run<F, Fut, T, E>(
        &self,
        user_id: &str,
        session_key: &str,
        query: F,
    ) -> Result<T, GateError<E>>
    where
        F: FnOnce(Endpoint) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let lease = self.admit(user_id, session_key).await?;
        debug!(user = %user_id, session = %session_key, endpoint = %lease.endpoint(), "running query");

        let result = query(lease.endpoint().clone()).await;
        drop(lease);
        result.map_err(GateError::Query)
    }

    /// Charge `user_id` one point and hold the session's sandbox InUse until
    /// the returned lease is dropped.
    pub async fn admit<E>(
        &self,
        user_id: &str,
        session_key: &str,
    ) -> Result<QueryLease, GateError<E>> {
        if !self.admission.try_consume(user_id) {
            return Err(GateError::RateLimited {
                user_id: user_id.to_string(),
            });
        }

        self.manager
            .acquire_lease(session_key)
            .await
            .map_err(GateError::Provisioning)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::manager::DEFAULT_PROVISION_TIMEOUT;
    use crate::state::SandboxState;
    use sandbox::{MemoryRuntime, presets};

    fn gate(rt: &Arc<MemoryRuntime>, capacity: u32) -> QueryGate {
        QueryGate::new(
            Arc::new(AdmissionController::new(capacity, Duration::from_secs(60))),
            Arc::new(SandboxManager::new(
                rt.clone(),
                presets::postgres(),
                DEFAULT_PROVISION_TIMEOUT,
            )),
        )
    }

    #[tokio::test]
    async fn query_runs_while_sandbox_is_in_use() {
        let rt = Arc::new(MemoryRuntime::new());
        let gate = gate(&rt, 5);
        let manager = gate.manager().clone();

        let port = gate
            .run("u1", "ex-42", |endpoint| {
                let state = manager.state("ex-42");
                async move {
                    assert_eq!(state, Some(SandboxState::InUse));
                    Ok::<_, String>(endpoint.port)
                }
            })
            .await
            .unwrap();

        assert!(port >= 40000);
        assert_eq!(gate.manager().state("ex-42"), Some(SandboxState::Ready));
        assert_eq!(gate.admission().remaining_points("u1"), 4);
    }

    #[tokio::test]
    async fn rate_limit_is_checked_before_provisioning() {
        let rt = Arc::new(MemoryRuntime::new());
        let gate = gate(&rt, 1);
        gate.run("u1", "ex-42", |_| async { Ok::<_, String>(()) })
            .await
            .unwrap();

        let err = gate
            .run("u1", "ex-43", |_| async { Ok::<_, String>(()) })
            .await
            .unwrap_err();
        assert!(err.is_rate_limited());
        assert_eq!(rt.calls().create, 1);
        assert_eq!(gate.manager().state("ex-43"), None);
    }

    #[tokio::test]
    async fn errors_stay_distinct() {
        let rt = Arc::new(MemoryRuntime::new());
        let gate = gate(&rt, 5);

        let err = gate
            .run("u1", "ex-42", |_| async { Err::<(), _>("syntax error") })
            .await
            .unwrap_err();
        assert!(matches!(err, GateError::Query("syntax error")));
        assert_eq!(gate.manager().state("ex-42"), Some(SandboxState::Ready));

        rt.set_create_failure(Some("no image"));
        let err = gate
            .run("u1", "ex-99", |_| async { Ok::<_, String>(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, GateError::Provisioning(_)));
    }

    #[tokio::test]
    async fn admitted_lease_holds_sandbox_until_dropped() {
        let rt = Arc::new(MemoryRuntime::new());
        let gate = gate(&rt, 1);

        let lease = gate.admit::<()>("u1", "ex-42").await.unwrap();
        assert_eq!(gate.manager().state("ex-42"), Some(SandboxState::InUse));
        assert_eq!(gate.admission().remaining_points("u1"), 0);

        assert!(matches!(
            gate.admit::<()>("u1", "ex-42").await,
            Err(GateError::RateLimited { .. })
        ));

        drop(lease);
        assert_eq!(gate.manager().state("ex-42"), Some(SandboxState::Ready));
    }
}
