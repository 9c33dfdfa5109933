//! Database dumps
//!
//! A dump is a plain SQL script of the whole server (roles included), so a
//! restore is a single `psql -f`.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::info;

#[cfg(test)]
use mockall::automock;

use crate::config::ConnectionParams;

/// Failures producing a dump
#[derive(Debug, Error)]
pub enum DumpError {
    /// The dump tool could not be started or its output not written
    #[error("failed to run pg_dumpall: {0}")]
    Io(#[from] std::io::Error),

    /// The dump tool exited with an error
    #[error("pg_dumpall failed ({code:?}): {stderr}")]
    Failed {
        /// Exit code, if the process exited normally
        code: Option<i32>,
        /// Captured standard error
        stderr: String,
    },
}

/// Writes a dump of the local server to a file
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Dumper: Send + Sync {
    /// Dump everything into `destination`, replacing it if present
    async fn dump(&self, destination: &Path) -> Result<(), DumpError>;
}

/// [`Dumper`] running `pg_dumpall`.
///
/// The child is killed if the dump future is dropped, which is how a
/// cancelled backup stops its dump.
#[derive(Debug, Clone)]
pub struct PgDumpAll {
    connection: ConnectionParams,
}

impl PgDumpAll {
    /// Dumper for the given server
    pub fn new(connection: ConnectionParams) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl Dumper for PgDumpAll {
    async fn dump(&self, destination: &Path) -> Result<(), DumpError> {
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let output = Command::new("pg_dumpall")
            .args(self.connection.args())
            .args(["--clean", "--if-exists", "-f"])
            .arg(destination)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;
        if !output.status.success() {
            return Err(DumpError::Failed {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        let size = tokio::fs::metadata(destination).await?.len();
        info!(path = %destination.display(), size, "dump written");
        Ok(())
    }
}
