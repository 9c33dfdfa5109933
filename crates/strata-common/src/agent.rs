//! Wire types for the per-instance management agent API
//!
//! Shared by the agent's HTTP server and the operator's client so both ends
//! agree on paths and JSON shapes.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// `POST` creates a database
pub const DATABASES_PATH: &str = "/api/databases";
/// `POST` creates a login role
pub const USERS_PATH: &str = "/api/users";
/// `POST` grants privileges
pub const GRANTS_PATH: &str = "/api/grants";
/// `POST` starts a backup, `GET` lists backups
pub const BACKUPS_PATH: &str = "/api/backups";
/// Liveness probe
pub const HEALTH_PATH: &str = "/healthz";

/// Create a database
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct CreateDatabaseRequest {
    /// Database name
    pub name: String,
}

/// Create a login role
#[derive(Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct CreateUserRequest {
    /// Role name
    pub username: String,
    /// Role password
    pub password: String,
}

impl std::fmt::Debug for CreateUserRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CreateUserRequest")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Grant privileges on a database to a role
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct CreateGrantRequest {
    /// Database name
    pub database: String,
    /// Role name
    pub username: String,
    /// Privileges such as SELECT or ALL
    pub privileges: Vec<String>,
}

/// Start a backup and push it to a storage backend
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct CreateBackupRequest {
    /// Storage backend registry key
    pub backend: String,
    /// Bucket to push into
    pub bucket: String,
    /// Object location inside the bucket
    pub location: String,
    /// Backend settings
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
}

/// Lifecycle of one backup record
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub enum BackupState {
    /// Accepted, worker not started yet
    #[default]
    Waiting,
    /// Dump or push in progress
    Running,
    /// Pushed to storage
    Succeeded,
    /// Dump or push failed
    Failed,
}

impl BackupState {
    /// Whether the record can no longer change
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl std::fmt::Display for BackupState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Waiting => write!(f, "Waiting"),
            Self::Running => write!(f, "Running"),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Agent-side record of one accepted backup request
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupRecord {
    /// Unique id, never reused
    pub id: Uuid,
    /// Target bucket
    pub bucket: String,
    /// Target location
    pub location: String,
    /// Current state
    pub status: BackupState,
    /// When the request was accepted
    pub start_time: DateTime<Utc>,
    /// When the record reached a terminal state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Failure detail, empty on success
    #[serde(default)]
    pub message: String,
}

/// Error body returned by the agent for non-2xx responses
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct ErrorBody {
    /// Human-readable error
    pub error: String,
}

/// Path for a single backup record
pub fn backup_path(id: &Uuid) -> String {
    format!("{}/{}", BACKUPS_PATH, id)
}
