//! Agent configuration from flags and environment
//!
//! The operator renders the agent container's environment (see the instance
//! workload); every flag here has an environment fallback so the container
//! needs no arguments.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use thiserror::Error;

/// Errors reading agent configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Some but not all restore variables are set
    #[error("incomplete restore configuration: {0} is not set")]
    IncompleteRestore(&'static str),

    /// `STRATA_RESTORE_VARIABLES` is not a JSON object of strings
    #[error("invalid restore variables: {0}")]
    InvalidVariables(#[from] serde_json::Error),
}

/// Strata agent - per-instance database management API
#[derive(Parser, Debug, Clone)]
#[command(name = "strata-agent", version, about, long_about = None)]
pub struct AgentConfig {
    /// Address the management API listens on
    #[arg(long, env = "STRATA_AGENT_LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Database host
    #[arg(long, env = "PGHOST", default_value = "127.0.0.1")]
    pub pg_host: String,

    /// Database port
    #[arg(long, env = "PGPORT", default_value_t = 5432)]
    pub pg_port: u16,

    /// Superuser name
    #[arg(long, env = "PGUSER", default_value = "postgres")]
    pub pg_user: String,

    /// Maintenance database used for server-wide statements
    #[arg(long, env = "PGDATABASE", default_value = "postgres")]
    pub pg_database: String,

    /// Directory for dump files before they are pushed
    #[arg(long, env = "STRATA_BACKUP_DIR", default_value = "/tmp/strata-backups")]
    pub backup_dir: PathBuf,

    /// Root directory of the `filesystem` storage backend
    #[arg(long, env = "STRATA_FILESYSTEM_ROOT", default_value = "/var/lib/strata/store")]
    pub filesystem_root: PathBuf,

    /// Storage backend holding the backup to restore on start
    #[arg(long, env = "STRATA_RESTORE_BACKEND")]
    pub restore_backend: Option<String>,

    /// Bucket holding the backup to restore
    #[arg(long, env = "STRATA_RESTORE_BUCKET")]
    pub restore_bucket: Option<String>,

    /// Object location of the backup to restore
    #[arg(long, env = "STRATA_RESTORE_LOCATION")]
    pub restore_location: Option<String>,

    /// Backend settings for the restore, as a JSON object
    #[arg(long, env = "STRATA_RESTORE_VARIABLES")]
    pub restore_variables: Option<String>,

    /// Human-readable logs instead of JSON
    #[arg(long, env = "STRATA_LOG_TEXT")]
    pub log_text: bool,
}

/// Connection parameters shared by `psql` and `pg_dumpall`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    /// Database host
    pub host: String,
    /// Database port
    pub port: u16,
    /// Superuser name
    pub user: String,
    /// Maintenance database
    pub database: String,
}

impl ConnectionParams {
    /// Command-line arguments selecting this server and user
    pub fn args(&self) -> Vec<String> {
        vec![
            "-h".to_string(),
            self.host.clone(),
            "-p".to_string(),
            self.port.to_string(),
            "-U".to_string(),
            self.user.clone(),
        ]
    }
}

/// Backup to restore before the agent starts serving
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreConfig {
    /// Storage backend registry key
    pub backend: String,
    /// Bucket holding the backup
    pub bucket: String,
    /// Object location
    pub location: String,
    /// Backend settings
    pub variables: BTreeMap<String, String>,
}

impl AgentConfig {
    /// Connection parameters for the local database
    pub fn connection(&self) -> ConnectionParams {
        ConnectionParams {
            host: self.pg_host.clone(),
            port: self.pg_port,
            user: self.pg_user.clone(),
            database: self.pg_database.clone(),
        }
    }

    /// The restore request, if one is configured.
    ///
    /// No backend means no restore; a backend without bucket or location is
    /// an error rather than a silent skip.
    pub fn restore(&self) -> Result<Option<RestoreConfig>, ConfigError> {
        let Some(backend) = self.restore_backend.clone().filter(|b| !b.is_empty()) else {
            return Ok(None);
        };
        let bucket = self
            .restore_bucket
            .clone()
            .ok_or(ConfigError::IncompleteRestore("STRATA_RESTORE_BUCKET"))?;
        let location = self
            .restore_location
            .clone()
            .ok_or(ConfigError::IncompleteRestore("STRATA_RESTORE_LOCATION"))?;
        let variables = match self.restore_variables.as_deref() {
            Some(raw) if !raw.trim().is_empty() => serde_json::from_str(raw)?,
            _ => BTreeMap::new(),
        };
        Ok(Some(RestoreConfig {
            backend,
            bucket,
            location,
            variables,
        }))
    }
}
