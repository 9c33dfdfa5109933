//! Restore-on-start
//!
//! When the Instance was declared with a restore source, the agent pulls
//! that backup and replays it before serving. A server that already holds
//! user databases is left untouched, so agent restarts never replay twice.

use std::path::Path;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info};

use crate::config::RestoreConfig;
use crate::sql::{DatabaseAdmin, SqlError};
use crate::storage::{StorageError, StorageRegistry};

const RESTORE_FILE: &str = "restore.sql";

/// Failures restoring a backup
#[derive(Debug, Error)]
pub enum RestoreError {
    /// The database never accepted connections
    #[error("database not reachable after {attempts} attempts: {source}")]
    Unreachable {
        /// Connection attempts made
        attempts: u32,
        /// Last failure
        source: SqlError,
    },

    /// Pulling the backup failed
    #[error("pulling backup failed: {0}")]
    Pull(#[from] StorageError),

    /// Replaying the backup failed
    #[error("replaying backup failed: {0}")]
    Replay(SqlError),

    /// Checking for existing data failed
    #[error("checking existing databases failed: {0}")]
    Check(SqlError),
}

/// What [`restore`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// The backup was replayed
    Restored,
    /// Data was already present
    Skipped,
}

/// How long to wait for the database to come up
#[derive(Debug, Clone, Copy)]
pub struct ReadinessPolicy {
    /// Connection attempts before giving up
    pub attempts: u32,
    /// Pause between attempts
    pub interval: Duration,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            attempts: 60,
            interval: Duration::from_secs(2),
        }
    }
}

async fn wait_for_database(
    admin: &DatabaseAdmin,
    policy: ReadinessPolicy,
) -> Result<(), RestoreError> {
    let mut attempt = 1;
    loop {
        match admin.ping().await {
            Ok(()) => return Ok(()),
            Err(e) if attempt >= policy.attempts => {
                return Err(RestoreError::Unreachable {
                    attempts: attempt,
                    source: e,
                })
            }
            Err(e) => {
                debug!(attempt, error = %e, "database not ready yet");
                attempt += 1;
                tokio::time::sleep(policy.interval).await;
            }
        }
    }
}

/// Pull the configured backup into `work_dir` and replay it
pub async fn restore(
    config: &RestoreConfig,
    storage: &StorageRegistry,
    admin: &DatabaseAdmin,
    work_dir: &Path,
    policy: ReadinessPolicy,
) -> Result<RestoreOutcome, RestoreError> {
    wait_for_database(admin, policy).await?;

    if admin
        .has_user_databases()
        .await
        .map_err(RestoreError::Check)?
    {
        info!(location = %config.location, "databases already present, skipping restore");
        return Ok(RestoreOutcome::Skipped);
    }

    tokio::fs::create_dir_all(work_dir)
        .await
        .map_err(|e| RestoreError::Pull(e.into()))?;
    let path = work_dir.join(RESTORE_FILE);
    info!(
        backend = %config.backend,
        bucket = %config.bucket,
        location = %config.location,
        "pulling backup"
    );
    storage
        .pull(
            &config.backend,
            &config.bucket,
            &config.location,
            &path,
            &config.variables,
        )
        .await?;

    let replayed = admin.run_script(&path).await.map_err(RestoreError::Replay);
    if let Err(e) = tokio::fs::remove_file(&path).await {
        debug!(error = %e, "failed to remove restore file");
    }
    replayed?;

    info!(location = %config.location, "backup restored");
    Ok(RestoreOutcome::Restored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use crate::sql::MockSqlExecutor;

    fn config() -> RestoreConfig {
        RestoreConfig {
            backend: "filesystem".to_string(),
            bucket: "archive".to_string(),
            location: "pg-main/1.sql".to_string(),
            variables: BTreeMap::new(),
        }
    }

    fn quick() -> ReadinessPolicy {
        ReadinessPolicy {
            attempts: 3,
            interval: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn pulls_and_replays_into_an_empty_server() {
        let root = tempfile::tempdir().expect("tempdir");
        let work = tempfile::tempdir().expect("tempdir");
        let object = root.path().join("archive/pg-main");
        std::fs::create_dir_all(&object).expect("mkdir");
        std::fs::write(object.join("1.sql"), "CREATE DATABASE orders;").expect("write");

        let mut sql = MockSqlExecutor::new();
        sql.expect_execute().returning(|_, _| Ok(()));
        sql.expect_exists().returning(|_, _| Ok(false));
        sql.expect_execute_file()
            .withf(|db, path| {
                db == "postgres"
                    && std::fs::read_to_string(path).is_ok_and(|s| s == "CREATE DATABASE orders;")
            })
            .times(1)
            .returning(|_, _| Ok(()));
        let admin = DatabaseAdmin::new(Arc::new(sql), "postgres");

        let outcome = restore(
            &config(),
            &StorageRegistry::with_builtins(root.path()),
            &admin,
            work.path(),
            quick(),
        )
        .await
        .expect("restore");
        assert_eq!(outcome, RestoreOutcome::Restored);
        assert!(!work.path().join(RESTORE_FILE).exists());
    }

    #[tokio::test]
    async fn existing_data_skips_the_restore() {
        let work = tempfile::tempdir().expect("tempdir");
        let mut sql = MockSqlExecutor::new();
        sql.expect_execute().returning(|_, _| Ok(()));
        sql.expect_exists().returning(|_, _| Ok(true));
        sql.expect_execute_file().never();
        let admin = DatabaseAdmin::new(Arc::new(sql), "postgres");

        let outcome = restore(
            &config(),
            &StorageRegistry::new(),
            &admin,
            work.path(),
            quick(),
        )
        .await
        .expect("restore");
        assert_eq!(outcome, RestoreOutcome::Skipped);
    }

    #[tokio::test]
    async fn unreachable_database_gives_up_after_the_policy() {
        let work = tempfile::tempdir().expect("tempdir");
        let mut sql = MockSqlExecutor::new();
        sql.expect_execute().times(3).returning(|_, _| {
            Err(SqlError::Failed {
                code: Some(2),
                stderr: "could not connect".to_string(),
            })
        });
        let admin = DatabaseAdmin::new(Arc::new(sql), "postgres");

        let err = restore(
            &config(),
            &StorageRegistry::new(),
            &admin,
            work.path(),
            quick(),
        )
        .await
        .expect_err("unreachable");
        assert!(matches!(err, RestoreError::Unreachable { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn missing_backup_is_a_pull_error() {
        let root = tempfile::tempdir().expect("tempdir");
        let work = tempfile::tempdir().expect("tempdir");
        let mut sql = MockSqlExecutor::new();
        sql.expect_execute().returning(|_, _| Ok(()));
        sql.expect_exists().returning(|_, _| Ok(false));
        sql.expect_execute_file().never();
        let admin = DatabaseAdmin::new(Arc::new(sql), "postgres");

        let err = restore(
            &config(),
            &StorageRegistry::with_builtins(root.path()),
            &admin,
            work.path(),
            quick(),
        )
        .await
        .expect_err("missing");
        assert!(matches!(err, RestoreError::Pull(StorageError::NotFound(_))));
    }
}
