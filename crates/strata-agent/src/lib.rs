//! Strata agent: the management API running beside each database instance
//!
//! The operator never connects to a database directly. It asks the agent to
//! create databases, roles and grants, and to take backups which the agent
//! dumps locally and pushes to a storage backend.

pub mod backup;
pub mod config;
pub mod dump;
pub mod error;
pub mod restore;
pub mod server;
pub mod sql;
pub mod storage;

pub use backup::{BackupHandle, BackupService, BackupTicket};
pub use config::AgentConfig;
pub use error::ApiError;
