use std::{future::Future, pin::Pin, time::Duration};

use serde::{Deserialize, Serialize};

pub const API_KEY_HEADER: &str = "x-api-key";

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug)]
pub enum DispenserError {
    /// The dispenser could not be reached or answered with a server error.
    /// The operation may succeed on retry.
    Unavailable { reason: String },
    /// The dispenser understood the request and refused it.
    Rejected { status: u16, reason: String },
}

impl std::fmt::Display for DispenserError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unavailable { reason } => write!(f, "dispenser unavailable: {reason}"),
            Self::Rejected { status, reason } => {
                write!(f, "dispenser rejected the request ({status}): {reason}")
            }
        }
    }
}

impl std::error::Error for DispenserError {}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct LeaseRequest {
    pub instance_id: String,
    pub plan_id: String,
    pub organization_id: String,
    pub space_id: String,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Complete,
    Failed,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct TaskReport {
    pub status: TaskStatus,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct TaskRef {
    task_id: String,
}

/// Outbound side of the broker. Every method returns once the dispenser has
/// accepted (or refused) the call; task completion is observed separately via
/// `task_status`.
pub trait Dispenser: Send + Sync + 'static {
    fn lease(&self, request: LeaseRequest) -> BoxFuture<'_, Result<String, DispenserError>>;

    fn release(&self, task_id: String) -> BoxFuture<'_, Result<String, DispenserError>>;

    fn task_status(&self, task_id: String) -> BoxFuture<'_, Result<TaskReport, DispenserError>>;
}

pub struct HttpDispenser {
    base: String,
    api_key: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl HttpDispenser {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Self {
        let client = reqwest::Client::builder().build().expect("reqwest client");
        Self {
            base: base_url.to_string(),
            api_key: api_key.to_string(),
            timeout,
            client,
        }
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(method, self.url(path))
            .timeout(self.timeout);
        if !self.api_key.is_empty() {
            builder = builder.header(API_KEY_HEADER, &self.api_key);
        }
        builder
    }

    async fn send(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, DispenserError> {
        let response = builder.send().await.map_err(|e| DispenserError::Unavailable {
            reason: e.to_string(),
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let text = response.text().await.unwrap_or_default();
        let text = text.trim();
        let reason = if text.is_empty() {
            format!("status {status}")
        } else {
            format!("status {status}: {text}")
        };
        if status.is_client_error() {
            Err(DispenserError::Rejected {
                status: status.as_u16(),
                reason,
            })
        } else {
            Err(DispenserError::Unavailable { reason })
        }
    }
}

impl Dispenser for HttpDispenser {
    fn lease(&self, request: LeaseRequest) -> BoxFuture<'_, Result<String, DispenserError>> {
        Box::pin(async move {
            let response = self
                .send(self.request(reqwest::Method::POST, "/v1/leases").json(&request))
                .await?;
            let body: TaskRef = response.json().await.map_err(invalid_body)?;
            Ok(body.task_id)
        })
    }

    fn release(&self, task_id: String) -> BoxFuture<'_, Result<String, DispenserError>> {
        Box::pin(async move {
            let response = self
                .send(self.request(reqwest::Method::DELETE, &format!("/v1/leases/{task_id}")))
                .await?;
            let body: TaskRef = response.json().await.map_err(invalid_body)?;
            Ok(body.task_id)
        })
    }

    fn task_status(&self, task_id: String) -> BoxFuture<'_, Result<TaskReport, DispenserError>> {
        Box::pin(async move {
            let response = self
                .send(self.request(reqwest::Method::GET, &format!("/v1/tasks/{task_id}")))
                .await?;
            let report: TaskReport = response.json().await.map_err(invalid_body)?;
            Ok(report)
        })
    }
}

fn invalid_body(err: reqwest::Error) -> DispenserError {
    DispenserError::Unavailable {
        reason: format!("invalid response body: {err}"),
    }
}
