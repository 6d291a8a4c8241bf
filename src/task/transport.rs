//! Transports that carry a staged request to the service.
//!
//! A transport reads the staged request file, performs the call in the
//! background and writes the response body to the response path. It never
//! blocks the caller; completion is observed through [`InFlight::status`].

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::debug;

use crate::errors::TaskError;
use crate::model::HealthResponse;
use crate::partgen_config::TransportMode;

/// A launched call.
pub trait InFlight: Send {
    /// `None` while running, `Some(Ok)` once the response file is complete,
    /// `Some(Err)` when the call itself failed.
    fn status(&mut self) -> Option<Result<(), String>>;
    /// Stop the call. Further status checks are meaningless.
    fn abandon(&mut self);
}

pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;
    fn is_available(&self) -> bool;
    fn launch(
        &self,
        url: &str,
        request_path: &Path,
        response_path: &Path,
        budget: Duration,
    ) -> Result<Box<dyn InFlight>, TaskError>;
}

/// In-process HTTP client running on the ambient tokio runtime.
#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

struct HttpInFlight {
    rx: oneshot::Receiver<Result<(), String>>,
    handle: tokio::task::JoinHandle<()>,
    finished: Option<Result<(), String>>,
}

impl InFlight for HttpInFlight {
    fn status(&mut self) -> Option<Result<(), String>> {
        if self.finished.is_none() {
            match self.rx.try_recv() {
                Ok(result) => self.finished = Some(result),
                Err(oneshot::error::TryRecvError::Empty) => return None,
                Err(oneshot::error::TryRecvError::Closed) => {
                    self.finished = Some(Err("HTTP call ended without a result".to_string()))
                }
            }
        }
        self.finished.clone()
    }

    fn abandon(&mut self) {
        self.handle.abort();
    }
}

/// Write to a sibling file and rename so readers never see a partial body.
async fn write_atomically(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = partial_path(path);
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await
}

pub(crate) fn partial_path(path: &Path) -> PathBuf {
    path.with_extension("part")
}

impl Transport for HttpTransport {
    fn name(&self) -> &'static str {
        "http"
    }

    fn is_available(&self) -> bool {
        tokio::runtime::Handle::try_current().is_ok()
    }

    fn launch(
        &self,
        url: &str,
        request_path: &Path,
        response_path: &Path,
        budget: Duration,
    ) -> Result<Box<dyn InFlight>, TaskError> {
        let body = std::fs::read(request_path).map_err(|source| TaskError::Staging {
            path: request_path.to_path_buf(),
            source,
        })?;
        let client = self.client.clone();
        let url = url.to_string();
        let response_path = response_path.to_path_buf();
        let (tx, rx) = oneshot::channel();

        let handle = tokio::spawn(async move {
            let result = async {
                let resp = client
                    .post(&url)
                    .header("Content-Type", "application/json")
                    .header("Accept", "application/json")
                    .timeout(budget)
                    .body(body)
                    .send()
                    .await
                    .map_err(|e| format!("POST {} failed: {}", url, e))?;
                let status = resp.status();
                let bytes = resp
                    .bytes()
                    .await
                    .map_err(|e| format!("Failed to read response body: {}", e))?;
                if bytes.is_empty() && !status.is_success() {
                    return Err(format!("HTTP {}", status));
                }
                write_atomically(&response_path, &bytes)
                    .await
                    .map_err(|e| format!("Failed to write response: {}", e))
            }
            .await;
            let _ = tx.send(result);
        });

        Ok(Box::new(HttpInFlight {
            rx,
            handle,
            finished: None,
        }))
    }
}

/// `curl` child process writing straight to the response path.
#[derive(Debug, Clone, Default)]
pub struct CurlTransport;

struct CurlInFlight {
    child: tokio::process::Child,
    finished: Option<Result<(), String>>,
}

impl InFlight for CurlInFlight {
    fn status(&mut self) -> Option<Result<(), String>> {
        if self.finished.is_none() {
            match self.child.try_wait() {
                Ok(Some(status)) if status.success() => self.finished = Some(Ok(())),
                Ok(Some(status)) => {
                    self.finished = Some(Err(format!("curl exited with {}", status)))
                }
                Ok(None) => return None,
                Err(e) => self.finished = Some(Err(format!("Failed to poll curl: {}", e))),
            }
        }
        self.finished.clone()
    }

    fn abandon(&mut self) {
        let _ = self.child.start_kill();
    }
}

impl Transport for CurlTransport {
    fn name(&self) -> &'static str {
        "curl"
    }

    fn is_available(&self) -> bool {
        which::which("curl").is_ok() && tokio::runtime::Handle::try_current().is_ok()
    }

    fn launch(
        &self,
        url: &str,
        request_path: &Path,
        response_path: &Path,
        budget: Duration,
    ) -> Result<Box<dyn InFlight>, TaskError> {
        let child = tokio::process::Command::new("curl")
            .arg("-sS")
            .arg("-X")
            .arg("POST")
            .arg("-H")
            .arg("Content-Type: application/json")
            .arg("--max-time")
            .arg(budget.as_secs().max(1).to_string())
            .arg("--data-binary")
            .arg(format!("@{}", request_path.display()))
            .arg("-o")
            .arg(response_path)
            .arg(url)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(TaskError::Launch)?;

        debug!(url = %url, "Launched curl");
        Ok(Box::new(CurlInFlight {
            child,
            finished: None,
        }))
    }
}

/// Candidate transports for a mode, in preference order.
pub fn select(mode: TransportMode) -> Vec<Box<dyn Transport>> {
    match mode {
        TransportMode::Auto => vec![Box::new(HttpTransport::new()), Box::new(CurlTransport)],
        TransportMode::Http => vec![Box::new(HttpTransport::new())],
        TransportMode::Curl => vec![Box::new(CurlTransport)],
    }
}

/// Query `GET /health` on the service.
pub async fn check_health(base_url: &str, wait: Duration) -> anyhow::Result<HealthResponse> {
    let url = format!("{}/health", base_url.trim_end_matches('/'));
    let client = reqwest::Client::new();
    let resp = client
        .get(&url)
        .header("Accept", "application/json")
        .timeout(wait)
        .send()
        .await?
        .error_for_status()?;
    Ok(resp.json::<HealthResponse>().await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_orders_candidates() {
        let names: Vec<&str> = select(TransportMode::Auto).iter().map(|t| t.name()).collect();
        assert_eq!(names, vec!["http", "curl"]);
        let names: Vec<&str> = select(TransportMode::Curl).iter().map(|t| t.name()).collect();
        assert_eq!(names, vec!["curl"]);
    }

    #[test]
    fn test_http_unavailable_outside_runtime() {
        assert!(!HttpTransport::new().is_available());
        assert!(!CurlTransport.is_available());
    }

    #[tokio::test]
    async fn test_http_available_inside_runtime() {
        assert!(HttpTransport::new().is_available());
    }

    #[test]
    fn test_partial_path_is_sibling() {
        let path = Path::new("/tmp/x/abc.response.json");
        assert_eq!(partial_path(path), PathBuf::from("/tmp/x/abc.response.part"));
    }

    #[tokio::test]
    async fn test_http_launch_reports_connection_failure() {
        let dir = tempfile::tempdir().unwrap();
        let request = dir.path().join("r.request.json");
        let response = dir.path().join("r.response.json");
        std::fs::write(&request, "{}").unwrap();

        // Port 9 (discard) on localhost is closed in test environments
        let mut inflight = HttpTransport::new()
            .launch(
                "http://127.0.0.1:9/generate",
                &request,
                &response,
                Duration::from_secs(5),
            )
            .unwrap();
        let mut status = None;
        for _ in 0..200 {
            status = inflight.status();
            if status.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(matches!(status, Some(Err(_))));
        assert!(!response.exists());
    }
}
