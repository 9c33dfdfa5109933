//! HTTP client for the per-instance management agent
//!
//! The operator never talks SQL itself. Every change to a running database
//! goes through the agent sidecar's API, reached at the primary pod's IP.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

#[cfg(test)]
use mockall::automock;

use strata_common::agent::{
    backup_path, BackupRecord, CreateBackupRequest, CreateDatabaseRequest, CreateGrantRequest,
    CreateUserRequest, ErrorBody, BACKUPS_PATH, DATABASES_PATH, GRANTS_PATH, USERS_PATH,
};
use strata_common::IO_TIMEOUT_SECS;

/// Failures talking to an agent
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AgentError {
    /// The agent could not be reached (connect error, timeout, bad body)
    #[error("agent access failed: {0}")]
    AccessFailed(String),

    /// The agent answered with an error status
    #[error("agent request failed ({status}): {message}")]
    RequestFailed {
        /// HTTP status code
        status: u16,
        /// Error text from the agent
        message: String,
    },

    /// The agent is already running a backup
    #[error("agent conflict: {0}")]
    Conflict(String),

    /// The requested record does not exist on the agent
    #[error("agent record not found: {0}")]
    NotFound(String),
}

/// Operations offered by an instance agent
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AgentClient: Send + Sync {
    /// Create a database
    async fn create_database(&self, request: &CreateDatabaseRequest) -> Result<(), AgentError>;

    /// Create a login role
    async fn create_user(&self, request: &CreateUserRequest) -> Result<(), AgentError>;

    /// Grant privileges on a database to a role
    async fn create_grant(&self, request: &CreateGrantRequest) -> Result<(), AgentError>;

    /// Start a backup; the returned record is usually still running
    async fn create_backup(&self, request: &CreateBackupRequest)
        -> Result<BackupRecord, AgentError>;

    /// Fetch one backup record
    async fn get_backup(&self, id: Uuid) -> Result<BackupRecord, AgentError>;
}

/// Builds clients for agent endpoints
#[cfg_attr(test, automock)]
pub trait AgentConnector: Send + Sync {
    /// Client for an agent base URL such as `http://10.0.0.7:8080`
    fn connect(&self, endpoint: &str) -> Arc<dyn AgentClient>;
}

/// [`AgentConnector`] sharing one `reqwest` connection pool
#[derive(Clone)]
pub struct HttpAgentConnector {
    http: reqwest::Client,
}

impl HttpAgentConnector {
    /// Create a connector whose requests time out after the standard I/O timeout
    pub fn new() -> Result<Self, AgentError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(IO_TIMEOUT_SECS))
            .build()
            .map_err(|e| AgentError::AccessFailed(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { http })
    }
}

impl AgentConnector for HttpAgentConnector {
    fn connect(&self, endpoint: &str) -> Arc<dyn AgentClient> {
        Arc::new(HttpAgentClient {
            http: self.http.clone(),
            base: endpoint.trim_end_matches('/').to_string(),
        })
    }
}

/// [`AgentClient`] over HTTP/JSON
pub struct HttpAgentClient {
    http: reqwest::Client,
    base: String,
}

impl HttpAgentClient {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn post<B: serde::Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<reqwest::Response, AgentError> {
        let url = self.url(path);
        debug!(%url, "agent request");
        let response = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| AgentError::AccessFailed(e.to_string()))?;
        check_status(response).await
    }
}

/// Turn a non-2xx response into the matching [`AgentError`]
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, AgentError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&text)
        .map(|b| b.error)
        .unwrap_or(text);
    Err(classify(status, message))
}

fn classify(status: StatusCode, message: String) -> AgentError {
    match status {
        StatusCode::CONFLICT => AgentError::Conflict(message),
        StatusCode::NOT_FOUND => AgentError::NotFound(message),
        _ => AgentError::RequestFailed {
            status: status.as_u16(),
            message,
        },
    }
}

#[async_trait]
impl AgentClient for HttpAgentClient {
    async fn create_database(&self, request: &CreateDatabaseRequest) -> Result<(), AgentError> {
        self.post(DATABASES_PATH, request).await.map(|_| ())
    }

    async fn create_user(&self, request: &CreateUserRequest) -> Result<(), AgentError> {
        self.post(USERS_PATH, request).await.map(|_| ())
    }

    async fn create_grant(&self, request: &CreateGrantRequest) -> Result<(), AgentError> {
        self.post(GRANTS_PATH, request).await.map(|_| ())
    }

    async fn create_backup(
        &self,
        request: &CreateBackupRequest,
    ) -> Result<BackupRecord, AgentError> {
        self.post(BACKUPS_PATH, request)
            .await?
            .json()
            .await
            .map_err(|e| AgentError::AccessFailed(format!("invalid backup record: {e}")))
    }

    async fn get_backup(&self, id: Uuid) -> Result<BackupRecord, AgentError> {
        let url = self.url(&backup_path(&id));
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| AgentError::AccessFailed(e.to_string()))?;
        check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| AgentError::AccessFailed(format!("invalid backup record: {e}")))
    }
}
