//! Typed error hierarchy for the generation engine.
//!
//! Two top-level enums cover the two layers:
//! - `TaskError`: one outbound service call
//! - `EngineError`: flow and commit failures surfaced to the caller

use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors from a single asynchronous service call.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("No capable HTTP client available (tried: {tried})")]
    NoClient { tried: String },

    #[error("Failed to stage request at {path}: {source}")]
    Staging {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize request: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("Failed to launch transport: {0}")]
    Launch(#[source] std::io::Error),

    #[error("Transport failed: {0}")]
    Transport(String),

    #[error("Request timed out after {elapsed:?} (budget {budget:?})")]
    Timeout { elapsed: Duration, budget: Duration },

    #[error("Malformed response: {0}")]
    Decode(String),

    #[error("Service error: {0}")]
    Service(String),

    #[error("Task handle already released")]
    Released,
}

impl TaskError {
    /// Errors that only affect the call that raised them.
    ///
    /// Inside a sequential session these skip the current destination
    /// instead of aborting the whole session.
    pub fn is_transient(&self) -> bool {
        !matches!(self, TaskError::Released)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, TaskError::Timeout { .. })
    }
}

/// Which singleton flow currently holds the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BusyKind {
    Single,
    Arrange,
    Compose,
    Commit,
    Enhance,
}

impl std::fmt::Display for BusyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BusyKind::Single => write!(f, "single generation"),
            BusyKind::Arrange => write!(f, "arrange session"),
            BusyKind::Compose => write!(f, "compose session"),
            BusyKind::Commit => write!(f, "commit"),
            BusyKind::Enhance => write!(f, "prompt enhancement"),
        }
    }
}

/// Errors from the engine and its flows.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Busy: a {0} is already in progress")]
    Busy(BusyKind),

    #[error("Structural error: {0}")]
    Structural(String),

    #[error("No destination selected")]
    NoDestination,

    #[error("Invalid time selection: start {start_sec}s, end {end_sec}s")]
    InvalidWindow { start_sec: f64, end_sec: f64 },

    #[error("Source sketch '{0}' has no notes in the selected window")]
    MissingSketch(String),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    pub fn is_busy(&self) -> bool {
        matches!(self, EngineError::Busy(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_error_timeout_carries_durations() {
        let err = TaskError::Timeout {
            elapsed: Duration::from_secs(181),
            budget: Duration::from_secs(180),
        };
        assert!(err.is_timeout());
        assert!(err.is_transient());
        assert!(err.to_string().contains("180"));
    }

    #[test]
    fn task_error_staging_carries_path() {
        let path = PathBuf::from("/tmp/partgen/req.json");
        let err = TaskError::Staging {
            path: path.clone(),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        match &err {
            TaskError::Staging { path: p, source } => {
                assert_eq!(p, &path);
                assert_eq!(source.kind(), std::io::ErrorKind::PermissionDenied);
            }
            _ => panic!("Expected Staging"),
        }
    }

    #[test]
    fn released_is_not_transient() {
        assert!(!TaskError::Released.is_transient());
        assert!(TaskError::Service("bad".into()).is_transient());
    }

    #[test]
    fn engine_error_converts_from_task_error() {
        let err: EngineError = TaskError::Decode("eof".into()).into();
        match &err {
            EngineError::Task(TaskError::Decode(msg)) => assert_eq!(msg, "eof"),
            _ => panic!("Expected EngineError::Task(Decode)"),
        }
    }

    #[test]
    fn busy_error_names_the_holder() {
        let err = EngineError::Busy(BusyKind::Compose);
        assert!(err.is_busy());
        assert!(err.to_string().contains("compose session"));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&TaskError::Released);
        assert_std_error(&EngineError::NoDestination);
    }
}
