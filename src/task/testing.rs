//! A scripted transport for exercising flows without a service.
//!
//! Replies are queued per endpoint and written to the response path at
//! launch time, so the next poll observes them. Every request body is
//! recorded for later inspection.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::Endpoint;
use super::transport::{InFlight, Transport};
use crate::errors::TaskError;

/// What the fake service does with one call.
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    /// Write this JSON body
    Json(serde_json::Value),
    /// Write this text verbatim
    Raw(String),
    /// Never answer
    Silent,
    /// Fail at the transport level
    Fail(String),
}

#[derive(Debug, Default)]
struct Script {
    replies: HashMap<&'static str, VecDeque<ScriptedReply>>,
    requests: Vec<(String, serde_json::Value)>,
    abandoned: usize,
}

/// Cloning shares the script, so a test can keep a handle after boxing one copy.
#[derive(Debug, Clone, Default)]
pub struct ScriptedTransport {
    script: Arc<Mutex<Script>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a reply for the next call to `endpoint`.
    pub fn push(&self, endpoint: Endpoint, reply: ScriptedReply) {
        if let Ok(mut script) = self.script.lock() {
            script
                .replies
                .entry(endpoint.path())
                .or_default()
                .push_back(reply);
        }
    }

    pub fn push_json(&self, endpoint: Endpoint, body: serde_json::Value) {
        self.push(endpoint, ScriptedReply::Json(body));
    }

    /// Every `(url, body)` launched so far, in order.
    pub fn requests(&self) -> Vec<(String, serde_json::Value)> {
        self.script
            .lock()
            .map(|s| s.requests.clone())
            .unwrap_or_default()
    }

    /// Bodies sent to one endpoint, in order.
    pub fn requests_for(&self, endpoint: Endpoint) -> Vec<serde_json::Value> {
        self.requests()
            .into_iter()
            .filter(|(url, _)| url.ends_with(endpoint.path()))
            .map(|(_, body)| body)
            .collect()
    }

    /// How many calls were abandoned before finishing.
    pub fn abandoned(&self) -> usize {
        self.script.lock().map(|s| s.abandoned).unwrap_or(0)
    }
}

struct ScriptedInFlight {
    status: Option<Result<(), String>>,
    script: Arc<Mutex<Script>>,
}

impl InFlight for ScriptedInFlight {
    fn status(&mut self) -> Option<Result<(), String>> {
        self.status.clone()
    }

    fn abandon(&mut self) {
        if self.status.is_none()
            && let Ok(mut script) = self.script.lock()
        {
            script.abandoned += 1;
        }
    }
}

impl Transport for ScriptedTransport {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn is_available(&self) -> bool {
        true
    }

    fn launch(
        &self,
        url: &str,
        request_path: &Path,
        response_path: &Path,
        _budget: Duration,
    ) -> Result<Box<dyn InFlight>, TaskError> {
        let body = std::fs::read_to_string(request_path).map_err(|source| TaskError::Staging {
            path: request_path.to_path_buf(),
            source,
        })?;
        let body: serde_json::Value =
            serde_json::from_str(&body).map_err(|e| TaskError::Decode(e.to_string()))?;

        let reply = {
            let mut script = self
                .script
                .lock()
                .map_err(|_| TaskError::Transport("script lock poisoned".to_string()))?;
            script.requests.push((url.to_string(), body));
            script
                .replies
                .iter_mut()
                .find(|(path, _)| url.ends_with(*path))
                .and_then(|(_, queue)| queue.pop_front())
        };

        let status = match reply {
            Some(ScriptedReply::Json(value)) => {
                std::fs::write(response_path, value.to_string()).map_err(TaskError::Launch)?;
                Some(Ok(()))
            }
            Some(ScriptedReply::Raw(text)) => {
                std::fs::write(response_path, text).map_err(TaskError::Launch)?;
                Some(Ok(()))
            }
            Some(ScriptedReply::Silent) => None,
            Some(ScriptedReply::Fail(msg)) => Some(Err(msg)),
            None => Some(Err(format!("no scripted reply for {}", url))),
        };

        Ok(Box::new(ScriptedInFlight {
            status,
            script: Arc::clone(&self.script),
        }))
    }
}
