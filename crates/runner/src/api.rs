//! HTTP intake for the request layer.
//!
//! Exposes session acquire/release/evict, query leases charged against the
//! caller's admission quota, and read-only views of sandboxes and quotas.
//! A query lease keeps its sandbox InUse until the caller ends it or it
//! outlives `api.lease_timeout_secs`.

use std::collections::{BTreeMap, HashMap};
use std::convert::Infallible;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use sandbox::{Endpoint, SandboxPolicy};
use serde::{Deserialize, Serialize};
use supervisor::{GateError, QueryGate, QueryLease, SandboxInfo, SupervisorError};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::RunnerResult;

// ---------------------------------------------------------------------------
// Lease table
// ---------------------------------------------------------------------------

struct HeldLease {
    session_key: String,
    user_id: String,
    started: Instant,
    _lease: QueryLease,
}

/// Query leases handed out to HTTP callers, by lease id.
#[derive(Default)]
pub struct LeaseTable {
    leases: Mutex<HashMap<Uuid, HeldLease>>,
}

impl LeaseTable {
    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, HeldLease>> {
        self.leases.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert(&self, session_key: &str, user_id: &str, lease: QueryLease) -> Uuid {
        let id = Uuid::new_v4();
        self.lock().insert(
            id,
            HeldLease {
                session_key: session_key.to_string(),
                user_id: user_id.to_string(),
                started: Instant::now(),
                _lease: lease,
            },
        );
        id
    }

    /// End lease `id` if it belongs to `session_key`.
    pub fn remove(&self, session_key: &str, id: Uuid) -> bool {
        let held = {
            let mut leases = self.lock();
            let owned = leases
                .get(&id)
                .is_some_and(|held| held.session_key == session_key);
            if owned { leases.remove(&id) } else { None }
        };
        held.is_some()
    }

    /// End every lease held longer than `max_age`. Returns how many ended.
    pub fn expire(&self, max_age: Duration) -> usize {
        let expired: Vec<HeldLease> = {
            let mut leases = self.lock();
            let ids: Vec<Uuid> = leases
                .iter()
                .filter(|(_, held)| held.started.elapsed() >= max_age)
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| leases.remove(id)).collect()
        };
        for held in &expired {
            warn!(
                session = %held.session_key,
                user = %held.user_id,
                held_secs = held.started.elapsed().as_secs(),
                "query lease expired"
            );
        }
        expired.len()
    }

    /// End every lease. Returns how many ended.
    pub fn clear(&self) -> usize {
        let all: Vec<HeldLease> = self.lock().drain().map(|(_, held)| held).collect();
        all.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

// ---------------------------------------------------------------------------
// State and errors
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ApiState {
    gate: QueryGate,
    presets: Arc<BTreeMap<String, Arc<SandboxPolicy>>>,
    leases: Arc<LeaseTable>,
}

impl ApiState {
    pub fn new(gate: QueryGate, presets: BTreeMap<String, SandboxPolicy>) -> Self {
        Self {
            gate,
            presets: Arc::new(
                presets
                    .into_iter()
                    .map(|(name, policy)| (name, Arc::new(policy)))
                    .collect(),
            ),
            leases: Arc::new(LeaseTable::default()),
        }
    }

    pub fn leases(&self) -> &Arc<LeaseTable> {
        &self.leases
    }
}

#[derive(Debug, thiserror::Error)]
enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("rate limited: no query points left for user {user_id}")]
    RateLimited {
        user_id: String,
        retry_after: Option<Duration>,
    },

    #[error("{0}")]
    Unavailable(String),
}

impl From<SupervisorError> for ApiError {
    fn from(e: SupervisorError) -> Self {
        match e {
            SupervisorError::UnknownSession(_) => Self::NotFound(e.to_string()),
            SupervisorError::Evicted(_) => Self::Conflict(e.to_string()),
            SupervisorError::ProvisioningFailed { .. } | SupervisorError::Runtime(_) => {
                Self::Unavailable(e.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        let body = Json(ErrorBody {
            error: self.to_string(),
        });
        match self {
            Self::RateLimited {
                retry_after: Some(wait),
                ..
            } => {
                // Round up so a client never retries before the window rolls over.
                let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
                (status, [(header::RETRY_AFTER, secs.to_string())], body).into_response()
            }
            _ => (status, body).into_response(),
        }
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    sandboxes: usize,
    leases: usize,
}

#[derive(Deserialize)]
struct AcquireParams {
    preset: Option<String>,
}

#[derive(Serialize)]
struct SessionResponse {
    session_key: String,
    endpoint: Endpoint,
}

#[derive(Deserialize)]
struct BeginQueryRequest {
    user_id: String,
}

#[derive(Serialize)]
struct LeaseResponse {
    lease_id: Uuid,
    session_key: String,
    endpoint: Endpoint,
    remaining_points: u32,
}

#[derive(Serialize)]
struct QuotaResponse {
    user_id: String,
    capacity: u32,
    remaining_points: u32,
    retry_after_secs: Option<u64>,
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/sandboxes", get(list_sandboxes))
        .route("/api/sessions/{key}", delete(evict_session))
        .route("/api/sessions/{key}/acquire", post(acquire_session))
        .route("/api/sessions/{key}/release", post(release_session))
        .route("/api/sessions/{key}/queries", post(begin_query))
        .route("/api/sessions/{key}/queries/{lease_id}", delete(end_query))
        .route("/api/users/{user_id}/quota", get(user_quota))
        .with_state(state)
}

/// Serve the intake API on `listener` until `shutdown` turns true.
pub async fn serve(
    listener: TcpListener,
    state: ApiState,
    mut shutdown: watch::Receiver<bool>,
) -> RunnerResult<()> {
    let addr = listener.local_addr()?;
    info!(%addr, "intake api listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
            info!("intake api shutting down");
        })
        .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health(State(state): State<ApiState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        sandboxes: state.gate.manager().snapshot().len(),
        leases: state.leases.len(),
    })
}

async fn list_sandboxes(State(state): State<ApiState>) -> Json<Vec<SandboxInfo>> {
    Json(state.gate.manager().snapshot())
}

async fn acquire_session(
    State(state): State<ApiState>,
    Path(key): Path<String>,
    Query(params): Query<AcquireParams>,
) -> Result<Json<SessionResponse>, ApiError> {
    let manager = state.gate.manager();
    let endpoint = match params.preset {
        Some(name) => {
            let policy = state
                .presets
                .get(&name)
                .cloned()
                .ok_or_else(|| ApiError::BadRequest(format!("unknown preset {name:?}")))?;
            manager.acquire_with(&key, policy).await?
        }
        None => manager.acquire(&key).await?,
    };
    Ok(Json(SessionResponse {
        session_key: key,
        endpoint,
    }))
}

async fn release_session(
    State(state): State<ApiState>,
    Path(key): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.gate.manager().release(&key)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn evict_session(
    State(state): State<ApiState>,
    Path(key): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.gate.manager().force_evict(&key, "api").await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn begin_query(
    State(state): State<ApiState>,
    Path(key): Path<String>,
    Json(request): Json<BeginQueryRequest>,
) -> Result<(StatusCode, Json<LeaseResponse>), ApiError> {
    let user_id = request.user_id;
    let admission = state.gate.admission();
    let lease = match state.gate.admit::<Infallible>(&user_id, &key).await {
        Ok(lease) => lease,
        Err(GateError::RateLimited { user_id }) => {
            let retry_after = admission.retry_after(&user_id);
            return Err(ApiError::RateLimited {
                user_id,
                retry_after,
            });
        }
        Err(GateError::Provisioning(e)) => return Err(e.into()),
        Err(GateError::Query(never)) => match never {},
    };

    let endpoint = lease.endpoint().clone();
    let lease_id = state.leases.insert(&key, &user_id, lease);
    debug!(session = %key, user = %user_id, lease = %lease_id, "query lease started");
    Ok((
        StatusCode::CREATED,
        Json(LeaseResponse {
            lease_id,
            session_key: key,
            endpoint,
            remaining_points: admission.remaining_points(&user_id),
        }),
    ))
}

async fn end_query(
    State(state): State<ApiState>,
    Path((key, lease_id)): Path<(String, Uuid)>,
) -> Result<StatusCode, ApiError> {
    if !state.leases.remove(&key, lease_id) {
        return Err(ApiError::NotFound(format!(
            "no query lease {lease_id} for session {key}"
        )));
    }
    debug!(session = %key, lease = %lease_id, "query lease ended");
    Ok(StatusCode::NO_CONTENT)
}

async fn user_quota(
    State(state): State<ApiState>,
    Path(user_id): Path<String>,
) -> Json<QuotaResponse> {
    let admission = state.gate.admission();
    Json(QuotaResponse {
        capacity: admission.capacity(),
        remaining_points: admission.remaining_points(&user_id),
        retry_after_secs: admission.retry_after(&user_id).map(|d| d.as_secs()),
        user_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode as Status;
    use sandbox::{MemoryRuntime, presets};
    use serde_json::{Value, json};
    use supervisor::{
        AdmissionController, DEFAULT_PROVISION_TIMEOUT, SandboxManager, SandboxState,
    };
    use tokio::task::JoinHandle;

    struct TestServer {
        base: String,
        state: ApiState,
        shutdown: watch::Sender<bool>,
        handle: JoinHandle<RunnerResult<()>>,
    }

    fn api_state(rt: &Arc<MemoryRuntime>, capacity: u32) -> ApiState {
        let manager = Arc::new(SandboxManager::new(
            rt.clone(),
            presets::postgres(),
            DEFAULT_PROVISION_TIMEOUT,
        ));
        let admission = Arc::new(AdmissionController::new(capacity, Duration::from_secs(60)));
        ApiState::new(QueryGate::new(admission, manager), presets::builtin())
    }

    async fn start(rt: &Arc<MemoryRuntime>, capacity: u32) -> TestServer {
        let state = api_state(rt, capacity);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let (shutdown, rx) = watch::channel(false);
        let handle = tokio::spawn(serve(listener, state.clone(), rx));
        TestServer {
            base,
            state,
            shutdown,
            handle,
        }
    }

    async fn begin(
        client: &reqwest::Client,
        base: &str,
        key: &str,
        user: &str,
    ) -> reqwest::Response {
        client
            .post(format!("{base}/api/sessions/{key}/queries"))
            .json(&json!({ "user_id": user }))
            .send()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn acquire_and_list_sandboxes() {
        let rt = Arc::new(MemoryRuntime::new());
        let server = start(&rt, 5).await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{}/api/sessions/ex-42/acquire", server.base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), Status::OK);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["session_key"], "ex-42");
        assert_eq!(body["endpoint"]["host"], "127.0.0.1");

        let list: Value = client
            .get(format!("{}/api/sandboxes", server.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(list.as_array().unwrap().len(), 1);
        assert_eq!(list[0]["state"], "ready");

        let health: Value = client
            .get(format!("{}/api/health", server.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["status"], "ok");
        assert_eq!(health["sandboxes"], 1);
    }

    #[tokio::test]
    async fn acquire_with_named_preset() {
        let rt = Arc::new(MemoryRuntime::new());
        let server = start(&rt, 5).await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{}/api/sessions/ex-42/acquire?preset=mysql", server.base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), Status::OK);
        let snapshot = server.state.gate.manager().snapshot();
        assert_eq!(snapshot[0].image, presets::mysql().image);

        let resp = client
            .post(format!("{}/api/sessions/ex-43/acquire?preset=oracle", server.base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), Status::BAD_REQUEST);
        assert_eq!(rt.calls().create, 1);
    }

    #[tokio::test]
    async fn query_lease_holds_sandbox_in_use() {
        let rt = Arc::new(MemoryRuntime::new());
        let server = start(&rt, 5).await;
        let client = reqwest::Client::new();
        let manager = server.state.gate.manager().clone();

        let resp = begin(&client, &server.base, "ex-42", "u1").await;
        assert_eq!(resp.status(), Status::CREATED);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["remaining_points"], 4);
        let lease_id = body["lease_id"].as_str().unwrap().to_string();
        assert_eq!(manager.state("ex-42"), Some(SandboxState::InUse));
        assert_eq!(server.state.leases().len(), 1);

        // A lease id only ends its own session's lease.
        let resp = client
            .delete(format!("{}/api/sessions/other/queries/{lease_id}", server.base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), Status::NOT_FOUND);

        let url = format!("{}/api/sessions/ex-42/queries/{lease_id}", server.base);
        let resp = client.delete(&url).send().await.unwrap();
        assert_eq!(resp.status(), Status::NO_CONTENT);
        assert_eq!(manager.state("ex-42"), Some(SandboxState::Ready));

        let resp = client.delete(&url).send().await.unwrap();
        assert_eq!(resp.status(), Status::NOT_FOUND);
    }

    #[tokio::test]
    async fn exhausted_quota_is_rejected_with_retry_after() {
        let rt = Arc::new(MemoryRuntime::new());
        let server = start(&rt, 1).await;
        let client = reqwest::Client::new();

        let resp = begin(&client, &server.base, "ex-42", "u1").await;
        assert_eq!(resp.status(), Status::CREATED);
        let resp = begin(&client, &server.base, "ex-43", "u1").await;
        assert_eq!(resp.status(), Status::TOO_MANY_REQUESTS);
        let retry_after: u64 = resp
            .headers()
            .get(header::RETRY_AFTER)
            .unwrap()
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!((1..=60).contains(&retry_after));
        assert_eq!(rt.calls().create, 1);

        let quota: Value = client
            .get(format!("{}/api/users/u1/quota", server.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(quota["capacity"], 1);
        assert_eq!(quota["remaining_points"], 0);

        // Other users are unaffected.
        let resp = begin(&client, &server.base, "ex-42", "u2").await;
        assert_eq!(resp.status(), Status::CREATED);
    }

    #[tokio::test]
    async fn errors_map_to_status_codes() {
        let rt = Arc::new(MemoryRuntime::new());
        let server = start(&rt, 5).await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{}/api/sessions/nope/release", server.base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), Status::NOT_FOUND);
        let body: Value = resp.json().await.unwrap();
        assert!(body["error"].as_str().unwrap().contains("unknown session"));

        let resp = client
            .delete(format!("{}/api/sessions/nope", server.base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), Status::NOT_FOUND);

        rt.set_create_failure(Some("image not found"));
        let resp = begin(&client, &server.base, "ex-42", "u1").await;
        assert_eq!(resp.status(), Status::SERVICE_UNAVAILABLE);
        let body: Value = resp.json().await.unwrap();
        assert!(body["error"].as_str().unwrap().contains("image not found"));
    }

    #[tokio::test]
    async fn release_then_evict_removes_container() {
        let rt = Arc::new(MemoryRuntime::new());
        let server = start(&rt, 5).await;
        let client = reqwest::Client::new();

        client
            .post(format!("{}/api/sessions/ex-42/acquire", server.base))
            .send()
            .await
            .unwrap();
        let resp = client
            .post(format!("{}/api/sessions/ex-42/release", server.base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), Status::NO_CONTENT);
        assert_eq!(rt.containers().len(), 1);

        let resp = client
            .delete(format!("{}/api/sessions/ex-42", server.base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), Status::NO_CONTENT);
        assert!(rt.containers().is_empty());
        assert_eq!(server.state.gate.manager().state("ex-42"), None);
    }

    #[tokio::test]
    async fn shutdown_stops_the_server() {
        let rt = Arc::new(MemoryRuntime::new());
        let server = start(&rt, 5).await;
        server.shutdown.send_replace(true);
        server.handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stale_leases_expire() {
        let rt = Arc::new(MemoryRuntime::new());
        let state = api_state(&rt, 5);
        let manager = state.gate.manager().clone();

        let old = state.gate.admit::<Infallible>("u1", "ex-42").await.unwrap();
        state.leases.insert("ex-42", "u1", old);
        tokio::time::advance(Duration::from_secs(240)).await;
        let fresh = state.gate.admit::<Infallible>("u2", "ex-43").await.unwrap();
        state.leases.insert("ex-43", "u2", fresh);

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(state.leases.expire(Duration::from_secs(300)), 1);
        assert_eq!(manager.state("ex-42"), Some(SandboxState::Ready));
        assert_eq!(manager.state("ex-43"), Some(SandboxState::InUse));

        assert_eq!(state.leases.clear(), 1);
        assert_eq!(manager.state("ex-43"), Some(SandboxState::Ready));
        assert!(state.leases.is_empty());
    }
}
