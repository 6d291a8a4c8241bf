//! Non-blocking service calls.
//!
//! `TaskRunner::start` stages the request JSON on disk, launches a
//! transport and returns a [`TaskHandle`] immediately. The handle is polled
//! once per scheduler turn until it reaches a terminal state, at which point
//! it releases its staging files exactly once.

pub mod testing;
pub mod transport;

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::TaskError;
use crate::partgen_config::PartgenConfig;
use crate::util::{strip_bom_and_trim, truncate_for_log};
use transport::{InFlight, Transport, partial_path};

/// Service endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Generate,
    Plan,
    ArrangePlan,
    Enhance,
}

impl Endpoint {
    pub fn path(&self) -> &'static str {
        match self {
            Endpoint::Generate => "/generate",
            Endpoint::Plan => "/plan",
            Endpoint::ArrangePlan => "/arrange_plan",
            Endpoint::Enhance => "/enhance",
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.path().trim_start_matches('/'))
    }
}

/// Per-call time budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskTimeouts {
    pub generate: Duration,
    pub plan: Duration,
    pub enhance: Duration,
}

impl Default for TaskTimeouts {
    fn default() -> Self {
        Self {
            generate: Duration::from_secs(180),
            plan: Duration::from_secs(120),
            enhance: Duration::from_secs(60),
        }
    }
}

impl TaskTimeouts {
    pub fn for_endpoint(&self, endpoint: Endpoint) -> Duration {
        match endpoint {
            Endpoint::Generate => self.generate,
            Endpoint::Plan | Endpoint::ArrangePlan => self.plan,
            Endpoint::Enhance => self.enhance,
        }
    }
}

/// Result of one poll.
#[derive(Debug)]
pub enum TaskPoll<T> {
    Pending,
    Ready(T),
    Failed(TaskError),
}

impl<T> TaskPoll<T> {
    pub fn is_done(&self) -> bool {
        !matches!(self, TaskPoll::Pending)
    }
}

/// Starts tasks against one service.
pub struct TaskRunner {
    base_url: String,
    staging_dir: PathBuf,
    transports: Vec<Box<dyn Transport>>,
    timeouts: TaskTimeouts,
    grace: Duration,
}

impl TaskRunner {
    pub fn new(
        base_url: impl Into<String>,
        staging_dir: impl Into<PathBuf>,
        transports: Vec<Box<dyn Transport>>,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            staging_dir: staging_dir.into(),
            transports,
            timeouts: TaskTimeouts::default(),
            grace: Duration::from_millis(1500),
        }
    }

    pub fn from_config(config: &PartgenConfig) -> Self {
        let t = &config.toml.transport;
        Self::new(
            config.base_url(),
            config.staging_dir(),
            transport::select(config.transport_mode()),
        )
        .with_timeouts(TaskTimeouts {
            generate: Duration::from_secs(t.generate_timeout_secs),
            plan: Duration::from_secs(t.plan_timeout_secs),
            enhance: Duration::from_secs(t.enhance_timeout_secs),
        })
        .with_grace(config.grace())
    }

    pub fn with_timeouts(mut self, timeouts: TaskTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    /// Name of the transport `start` would use right now.
    pub fn available_transport(&self) -> Option<&'static str> {
        self.transports
            .iter()
            .find(|t| t.is_available())
            .map(|t| t.name())
    }

    /// Stage the request and launch it. Never waits on the network.
    pub fn start<R: Serialize>(
        &self,
        endpoint: Endpoint,
        request: &R,
    ) -> Result<TaskHandle, TaskError> {
        let transport = self
            .transports
            .iter()
            .find(|t| t.is_available())
            .ok_or_else(|| TaskError::NoClient {
                tried: self
                    .transports
                    .iter()
                    .map(|t| t.name())
                    .collect::<Vec<_>>()
                    .join(", "),
            })?;

        std::fs::create_dir_all(&self.staging_dir).map_err(|source| TaskError::Staging {
            path: self.staging_dir.clone(),
            source,
        })?;

        let id = Uuid::new_v4();
        let request_path = self.staging_dir.join(format!("{}.request.json", id));
        let response_path = self.staging_dir.join(format!("{}.response.json", id));
        let body = serde_json::to_vec(request).map_err(TaskError::Serialize)?;
        std::fs::write(&request_path, &body).map_err(|source| TaskError::Staging {
            path: request_path.clone(),
            source,
        })?;

        let budget = self.timeouts.for_endpoint(endpoint);
        let url = format!("{}{}", self.base_url, endpoint.path());
        let inflight = match transport.launch(&url, &request_path, &response_path, budget) {
            Ok(inflight) => inflight,
            Err(e) => {
                let _ = std::fs::remove_file(&request_path);
                return Err(e);
            }
        };

        info!(
            endpoint = %endpoint,
            transport = transport.name(),
            task = %id,
            bytes = body.len(),
            "Started service call"
        );

        Ok(TaskHandle {
            id,
            endpoint,
            request_path,
            response_path,
            started: Instant::now(),
            budget,
            grace: self.grace,
            inflight: Some(inflight),
            released: false,
        })
    }
}

/// One in-flight service call.
pub struct TaskHandle {
    id: Uuid,
    endpoint: Endpoint,
    request_path: PathBuf,
    response_path: PathBuf,
    started: Instant,
    budget: Duration,
    grace: Duration,
    inflight: Option<Box<dyn InFlight>>,
    released: bool,
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("request_path", &self.request_path)
            .field("budget", &self.budget)
            .field("released", &self.released)
            .finish()
    }
}

impl TaskHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    pub fn request_path(&self) -> &Path {
        &self.request_path
    }

    pub fn response_path(&self) -> &Path {
        &self.response_path
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    pub fn poll<T: DeserializeOwned>(&mut self) -> TaskPoll<T> {
        self.poll_at(Instant::now())
    }

    /// Poll as if the current time were `now`.
    pub fn poll_at<T: DeserializeOwned>(&mut self, now: Instant) -> TaskPoll<T> {
        if self.released {
            return TaskPoll::Failed(TaskError::Released);
        }
        let elapsed = now.saturating_duration_since(self.started);
        let result = self.check(elapsed);
        if result.is_done() {
            match &result {
                TaskPoll::Failed(e) => warn!(
                    endpoint = %self.endpoint,
                    task = %self.id,
                    elapsed_ms = elapsed.as_millis() as u64,
                    error = %e,
                    "Service call failed"
                ),
                _ => info!(
                    endpoint = %self.endpoint,
                    task = %self.id,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Service call completed"
                ),
            }
            self.release();
        }
        result
    }

    fn check<T: DeserializeOwned>(&mut self, elapsed: Duration) -> TaskPoll<T> {
        if elapsed > self.budget {
            return TaskPoll::Failed(TaskError::Timeout {
                elapsed,
                budget: self.budget,
            });
        }

        let transport_status = self.inflight.as_mut().and_then(|f| f.status());
        let in_grace = elapsed < self.grace;

        let raw = std::fs::read_to_string(&self.response_path).unwrap_or_default();
        let text = strip_bom_and_trim(&raw);

        if text.is_empty() {
            return match transport_status {
                None => TaskPoll::Pending,
                Some(Err(msg)) => TaskPoll::Failed(TaskError::Transport(msg)),
                Some(Ok(())) if in_grace => TaskPoll::Pending,
                Some(Ok(())) => TaskPoll::Failed(TaskError::Decode("empty response".to_string())),
            };
        }

        let value: serde_json::Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                // Still being written
                if in_grace || transport_status.is_none() {
                    return TaskPoll::Pending;
                }
                debug!(body = %truncate_for_log(text, 200), "Unparseable response");
                return TaskPoll::Failed(TaskError::Decode(e.to_string()));
            }
        };

        if let Some(message) = service_error(&value) {
            return TaskPoll::Failed(TaskError::Service(message));
        }

        match serde_json::from_value::<T>(value) {
            Ok(parsed) => TaskPoll::Ready(parsed),
            Err(e) => TaskPoll::Failed(TaskError::Decode(e.to_string())),
        }
    }

    /// Abandon the call and delete staging files. Idempotent.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Some(mut inflight) = self.inflight.take() {
            inflight.abandon();
        }
        for path in [
            &self.request_path,
            &self.response_path,
            &partial_path(&self.response_path),
        ] {
            if let Err(e) = std::fs::remove_file(path)
                && e.kind() != std::io::ErrorKind::NotFound
            {
                warn!(path = %path.display(), error = %e, "Failed to remove staging file");
            }
        }
        debug!(task = %self.id, "Released task");
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.release();
    }
}

/// A recognizable error payload: `{"detail": ...}` or `{"error": ...}`.
fn service_error(value: &serde_json::Value) -> Option<String> {
    let obj = value.as_object()?;
    for key in ["detail", "error"] {
        match obj.get(key) {
            None | Some(serde_json::Value::Null) => continue,
            Some(serde_json::Value::String(s)) => return Some(s.clone()),
            Some(other) => return Some(other.to_string()),
        }
    }
    None
}
