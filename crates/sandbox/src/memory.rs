//! In-memory [`ContainerRuntime`] for tests and local development.
//!
//! Tracks containers in a map, counts every call, and lets tests script
//! probe outcomes, inject failures and add latency to create/probe calls.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tracing::trace;

use crate::error::{Result, RuntimeError};
use crate::runtime::ContainerRuntime;
use crate::types::{ContainerRef, CreateRequest, ProbeOutcome};

const FIRST_PORT: u16 = 40_000;

/// What the next probe call does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStep {
    Healthy,
    /// Probe runs and reports a non-zero exit.
    Unhealthy,
    /// Probe cannot be executed at all.
    Error,
    /// Probe never returns; exercises caller-side timeouts.
    Hang,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub allocate_port: usize,
    pub create: usize,
    pub start: usize,
    pub probe: usize,
    pub stop: usize,
    pub remove: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ContainerState {
    Created,
    Running,
    Stopped,
}

struct MemoryContainer {
    state: ContainerState,
    auto_remove: bool,
    host_port: u16,
}

struct State {
    containers: HashMap<ContainerRef, MemoryContainer>,
    calls: CallCounts,
    probe_script: VecDeque<ProbeStep>,
    probe_default: ProbeStep,
    create_delay: Duration,
    probe_delay: Duration,
    stop_delay: Duration,
    create_failure: Option<String>,
    stop_failure: bool,
    remove_failure: bool,
    unavailable: bool,
}

pub struct MemoryRuntime {
    host: String,
    next_port: AtomicU16,
    state: Mutex<State>,
}

impl Default for MemoryRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRuntime {
    pub fn new() -> Self {
        Self {
            host: "127.0.0.1".into(),
            next_port: AtomicU16::new(FIRST_PORT),
            state: Mutex::new(State {
                containers: HashMap::new(),
                calls: CallCounts::default(),
                probe_script: VecDeque::new(),
                probe_default: ProbeStep::Healthy,
                create_delay: Duration::ZERO,
                probe_delay: Duration::ZERO,
                stop_delay: Duration::ZERO,
                create_failure: None,
                stop_failure: false,
                remove_failure: false,
                unavailable: false,
            }),
        }
    }

    /// Start handing out host ports at `port` instead of the default.
    pub fn with_first_port(self, port: u16) -> Self {
        self.next_port.store(port, Ordering::Relaxed);
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_available(&self) -> Result<()> {
        if self.lock().unavailable {
            return Err(RuntimeError::Unavailable("memory runtime offline".into()));
        }
        Ok(())
    }

    pub fn set_create_delay(&self, delay: Duration) {
        self.lock().create_delay = delay;
    }

    pub fn set_probe_delay(&self, delay: Duration) {
        self.lock().probe_delay = delay;
    }

    pub fn set_stop_delay(&self, delay: Duration) {
        self.lock().stop_delay = delay;
    }

    /// Make every subsequent `create` fail with `reason` (or succeed again with `None`).
    pub fn set_create_failure(&self, reason: Option<&str>) {
        self.lock().create_failure = reason.map(str::to_owned);
    }

    pub fn set_stop_failure(&self, fail: bool) {
        self.lock().stop_failure = fail;
    }

    pub fn set_remove_failure(&self, fail: bool) {
        self.lock().remove_failure = fail;
    }

    /// Simulate the runtime daemon going away entirely.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Outcome used once the scripted steps are exhausted.
    pub fn set_probe_default(&self, step: ProbeStep) {
        self.lock().probe_default = step;
    }

    /// Queue outcomes for the next probe calls, in order.
    pub fn push_probe_steps(&self, steps: impl IntoIterator<Item = ProbeStep>) {
        self.lock().probe_script.extend(steps);
    }

    /// Simulate the database process dying: the container stays but stops running.
    pub fn crash(&self, container: &ContainerRef) {
        if let Some(c) = self.lock().containers.get_mut(container) {
            c.state = ContainerState::Stopped;
        }
    }

    pub fn calls(&self) -> CallCounts {
        self.lock().calls
    }

    /// Names of containers that currently exist (any state).
    pub fn containers(&self) -> Vec<ContainerRef> {
        let mut names: Vec<_> = self.lock().containers.keys().cloned().collect();
        names.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        names
    }

    pub fn is_running(&self, container: &ContainerRef) -> bool {
        self.lock()
            .containers
            .get(container)
            .is_some_and(|c| c.state == ContainerState::Running)
    }

    pub fn host_port(&self, container: &ContainerRef) -> Option<u16> {
        self.lock().containers.get(container).map(|c| c.host_port)
    }
}

#[async_trait]
impl ContainerRuntime for MemoryRuntime {
    fn name(&self) -> &str {
        "memory"
    }

    fn host(&self) -> &str {
        &self.host
    }

    async fn allocate_port(&self) -> Result<u16> {
        self.check_available()?;
        self.lock().calls.allocate_port += 1;
        self.next_port
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |p| {
                (p < u16::MAX).then(|| p + 1)
            })
            .map_err(|_| RuntimeError::PortAllocation("port range exhausted".into()))
    }

    async fn create(&self, request: &CreateRequest<'_>) -> Result<ContainerRef> {
        self.check_available()?;
        let delay = {
            let mut state = self.lock();
            state.calls.create += 1;
            state.create_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        if let Some(reason) = &state.create_failure {
            return Err(RuntimeError::CreateFailed(reason.clone()));
        }
        if state.containers.contains_key(request.container) {
            return Err(RuntimeError::CreateFailed(format!(
                "name already in use: {}",
                request.container
            )));
        }
        state.containers.insert(
            request.container.clone(),
            MemoryContainer {
                state: ContainerState::Created,
                auto_remove: request.policy.auto_remove,
                host_port: request.host_port,
            },
        );
        trace!(container = %request.container, session = request.session_key, "memory container created");
        Ok(request.container.clone())
    }

    async fn start(&self, container: &ContainerRef) -> Result<()> {
        self.check_available()?;
        let mut state = self.lock();
        state.calls.start += 1;
        match state.containers.get_mut(container) {
            Some(c) => {
                c.state = ContainerState::Running;
                Ok(())
            }
            None => Err(RuntimeError::StartFailed(format!(
                "no such container: {container}"
            ))),
        }
    }

    async fn probe(
        &self,
        container: &ContainerRef,
        _command: &[String],
        _timeout: Duration,
    ) -> Result<ProbeOutcome> {
        self.check_available()?;
        let (step, delay) = {
            let mut state = self.lock();
            state.calls.probe += 1;
            let step = match state.probe_script.pop_front() {
                Some(step) => step,
                None => state.probe_default,
            };
            (step, state.probe_delay)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match step {
            ProbeStep::Hang => std::future::pending::<Result<ProbeOutcome>>().await,
            ProbeStep::Error => Err(RuntimeError::ProbeFailed("exec failed".into())),
            ProbeStep::Unhealthy => Ok(ProbeOutcome::Unhealthy {
                exit_code: 1,
                output: "not ready".into(),
            }),
            ProbeStep::Healthy => {
                let state = self.lock();
                match state.containers.get(container) {
                    Some(c) if c.state == ContainerState::Running => Ok(ProbeOutcome::Healthy),
                    Some(_) => Ok(ProbeOutcome::Unhealthy {
                        exit_code: 1,
                        output: "container is not running".into(),
                    }),
                    None => Err(RuntimeError::ProbeFailed(format!(
                        "no such container: {container}"
                    ))),
                }
            }
        }
    }

    async fn stop(&self, container: &ContainerRef, _timeout: Duration) -> Result<()> {
        self.check_available()?;
        let delay = {
            let mut state = self.lock();
            state.calls.stop += 1;
            state.stop_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        if state.stop_failure {
            return Err(RuntimeError::StopFailed(format!("{container}: injected")));
        }
        let auto_remove = match state.containers.get_mut(container) {
            Some(c) => {
                c.state = ContainerState::Stopped;
                c.auto_remove
            }
            None => return Ok(()),
        };
        if auto_remove {
            state.containers.remove(container);
        }
        Ok(())
    }

    async fn remove(&self, container: &ContainerRef) -> Result<()> {
        self.check_available()?;
        let mut state = self.lock();
        state.calls.remove += 1;
        if state.remove_failure {
            return Err(RuntimeError::RemoveFailed(format!("{container}: injected")));
        }
        state.containers.remove(container);
        Ok(())
    }
}
