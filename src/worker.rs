//! Worker agent probe client.
//!
//! Every worker VM runs an agent at `http://{ip}:{WORKER_PORT}` exposing:
//! - `GET /status` reporting current match load
//! - `POST /start-match` launching a game-server container
//!
//! Both calls are bounded by explicit timeouts; the allocator and the
//! reconciler never wait on a worker indefinitely.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Timeout for `start-match` calls.
const START_MATCH_TIMEOUT: Duration = Duration::from_secs(15);

/// Worker probe errors.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("worker timed out")]
    Timeout,

    #[error("worker connection failed")]
    Connect,

    #[error("worker returned HTTP {0}")]
    Http(u16),

    #[error("malformed worker response: {0}")]
    Malformed(String),

    #[error("worker rejected start-match: {0}")]
    Rejected(String),

    #[error("worker transport error: {0}")]
    Transport(String),
}

impl From<reqwest::Error> for WorkerError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            WorkerError::Timeout
        } else if e.is_connect() {
            WorkerError::Connect
        } else if e.is_decode() {
            WorkerError::Malformed(e.to_string())
        } else {
            WorkerError::Transport(e.to_string())
        }
    }
}

/// `GET /status` result.
#[derive(Debug, Clone, Copy)]
pub struct WorkerStatus {
    /// Active matches reported by the worker, coerced to a non-negative
    /// integer. Non-numeric responses normalize to 0.
    pub active_matches: u32,
}

/// `POST /start-match` request body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartMatchRequest {
    pub match_id: String,
    pub game_mode: String,
    pub match_privacy: String,
    pub tick_rate: u32,
    pub match_type: String,
    pub playfab_secret_key: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartMatchWire {
    success: bool,
    #[serde(default)]
    server_port: Option<u16>,
    #[serde(default)]
    container_id: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Successful `start-match` outcome.
#[derive(Debug, Clone)]
pub struct MatchStarted {
    pub server_port: u16,
    pub container_id: String,
    pub message: Option<String>,
}

/// HTTP client for worker agents.
pub struct WorkerClient {
    client: reqwest::Client,
    worker_port: u16,
    status_timeout: Duration,
}

impl WorkerClient {
    pub fn new(worker_port: u16, status_timeout_ms: u64) -> Self {
        Self {
            client: reqwest::Client::new(),
            worker_port,
            status_timeout: Duration::from_millis(status_timeout_ms),
        }
    }

    /// Probe a worker's match load.
    pub async fn status(&self, ip: &str) -> Result<WorkerStatus, WorkerError> {
        let url = format!("http://{}:{}/status", ip, self.worker_port);

        let response = self
            .client
            .get(&url)
            .timeout(self.status_timeout)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(WorkerError::Http(status.as_u16()));
        }

        let body: serde_json::Value = response.json().await?;
        let active_matches = coerce_active_matches(body.get("activeMatches"));
        debug!(ip = %ip, active_matches, "Worker status");

        Ok(WorkerStatus { active_matches })
    }

    /// Ask a worker to start a match.
    ///
    /// `success: false` from the worker surfaces as `WorkerError::Rejected`.
    pub async fn start_match(
        &self,
        ip: &str,
        request: &StartMatchRequest,
    ) -> Result<MatchStarted, WorkerError> {
        let url = format!("http://{}:{}/start-match", ip, self.worker_port);

        let response = self
            .client
            .post(&url)
            .json(request)
            .timeout(START_MATCH_TIMEOUT)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(WorkerError::Http(status.as_u16()));
        }

        let body: StartMatchWire = response
            .json()
            .await
            .map_err(|e| WorkerError::Malformed(e.to_string()))?;

        if !body.success {
            return Err(WorkerError::Rejected(
                body.message.unwrap_or_else(|| "no reason given".to_string()),
            ));
        }

        let server_port = body
            .server_port
            .ok_or_else(|| WorkerError::Malformed("missing serverPort".to_string()))?;
        let container_id = body
            .container_id
            .ok_or_else(|| WorkerError::Malformed("missing containerId".to_string()))?;

        Ok(MatchStarted {
            server_port,
            container_id,
            message: body.message,
        })
    }
}

/// Coerce whatever the worker put in `activeMatches` to a non-negative count.
fn coerce_active_matches(value: Option<&serde_json::Value>) -> u32 {
    match value {
        Some(serde_json::Value::Number(n)) => {
            if let Some(u) = n.as_u64() {
                u.min(u32::MAX as u64) as u32
            } else {
                // Negative or fractional counts normalize to 0.
                n.as_f64().filter(|f| *f > 0.0).map(|f| f as u32).unwrap_or(0)
            }
        }
        Some(serde_json::Value::String(s)) => s.trim().parse::<u32>().unwrap_or(0),
        _ => 0,
    }
}
