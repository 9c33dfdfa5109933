//! Backup controller
//!
//! A Backup without a `backupId` asks the Instance's agent to dump and push
//! to the Store. Once the agent accepts, the record id is written to status
//! with the `Running` reason and later passes poll the agent record until it
//! reaches `Succeeded` or `Failed`.

use std::sync::Arc;

use kube::runtime::controller::Action;
use kube::ResourceExt;
use thiserror::Error;
use tracing::{debug, instrument};
use uuid::Uuid;

use strata_common::agent::{BackupRecord, BackupState, CreateBackupRequest};
use strata_common::crd::{Backup, BackupReason};
use strata_common::kube_utils::namespace_or_default;
use strata_common::Error;

use super::{classify, is_access_failure, Dependency};
use crate::agent_client::AgentError;
use crate::context::Context;
use crate::converge::{absorbed, apply, Outcome};
use crate::resolver::{ResolveError, Resolver};
use crate::settings::{store_settings, ConfigError};

/// Failures running a Backup
#[derive(Debug, Error)]
pub enum BackupError {
    /// The Instance could not be resolved
    #[error("instance: {0}")]
    Instance(ResolveError),

    /// The Store could not be resolved
    #[error("store: {0}")]
    Store(ResolveError),

    /// The Store's settings are unusable
    #[error(transparent)]
    Settings(#[from] ConfigError),

    /// The recorded backup id is not a UUID
    #[error("invalid backup id {0:?}")]
    InvalidBackupId(String),

    /// The agent no longer knows the recorded backup
    #[error("backup record {0} no longer exists on the agent")]
    RecordLost(Uuid),

    /// The agent call failed
    #[error(transparent)]
    Agent(#[from] AgentError),
}

/// What a pass learned about the agent-side record
#[derive(Debug)]
enum Progress {
    /// The agent accepted a new request
    Started(BackupRecord),
    /// The current state of a previously accepted request
    Observed(BackupRecord),
}

/// Reconcile a Backup
#[instrument(skip(backup, ctx), fields(backup = %backup.name_any()))]
pub async fn reconcile(backup: Arc<Backup>, ctx: Arc<Context>) -> Result<Action, Error> {
    if absorbed(backup.as_ref()) {
        debug!("backup settled");
        return Ok(Action::await_change());
    }

    let namespace = namespace_or_default(backup.as_ref());
    let resolver = Resolver::new(&ctx, &namespace);
    let backup_id = backup.status.as_ref().and_then(|s| s.backup_id.clone());
    let result = match backup_id {
        Some(id) => poll(&backup, &id, &resolver).await.map(Progress::Observed),
        None => start(&backup, &ctx, &resolver).await.map(Progress::Started),
    };
    apply(backup.as_ref(), outcome(result)?, &ctx).await
}

async fn start(
    backup: &Backup,
    ctx: &Context,
    resolver: &Resolver<'_>,
) -> Result<BackupRecord, BackupError> {
    resolver
        .instance(&backup.spec.instance)
        .await
        .map_err(BackupError::Instance)?;
    let store = resolver
        .store(&backup.spec.store)
        .await
        .map_err(BackupError::Store)?;
    let settings = store_settings(ctx.store.as_ref(), resolver.namespace(), &store).await?;
    let client = resolver
        .client_for_pod(&backup.spec.instance)
        .await
        .map_err(BackupError::Instance)?;

    let record = client
        .create_backup(&CreateBackupRequest {
            backend: settings.backend.as_str().to_string(),
            bucket: settings.bucket,
            location: store.spec.object_location(&backup.location()),
            variables: settings.variables,
        })
        .await?;
    Ok(record)
}

async fn poll(
    backup: &Backup,
    id: &str,
    resolver: &Resolver<'_>,
) -> Result<BackupRecord, BackupError> {
    let id = Uuid::parse_str(id).map_err(|_| BackupError::InvalidBackupId(id.to_string()))?;
    let client = resolver
        .client_for(&backup.spec.instance)
        .await
        .map_err(BackupError::Instance)?;
    match client.get_backup(id).await {
        Ok(record) => Ok(record),
        Err(AgentError::NotFound(_)) => Err(BackupError::RecordLost(id)),
        Err(e) => Err(e.into()),
    }
}

fn outcome(result: Result<Progress, BackupError>) -> Result<Outcome<BackupReason>, Error> {
    let outcome = match result {
        Ok(Progress::Started(record)) => Outcome::new(
            BackupReason::Running,
            format!("backup {} accepted by agent", record.id),
        )
        .with_field("backupId", record.id.to_string()),
        Ok(Progress::Observed(record)) => match record.status {
            BackupState::Waiting | BackupState::Running => Outcome::new(
                BackupReason::Running,
                format!("backup {} {}", record.id, record.status),
            ),
            BackupState::Succeeded => Outcome::new(
                BackupReason::Succeeded,
                format!("pushed to {}/{}", record.bucket, record.location),
            ),
            BackupState::Failed => Outcome::new(BackupReason::Failed, record.message),
        },
        Err(BackupError::Instance(e)) => match classify(e)? {
            Dependency::Unavailable(_, message) => {
                Outcome::new(BackupReason::InstanceAccessError, message)
            }
            Dependency::Unreachable(message) => {
                Outcome::new(BackupReason::AgentAccessError, message)
            }
        },
        Err(BackupError::Store(e)) => match classify(e)? {
            Dependency::Unavailable(_, message) | Dependency::Unreachable(message) => {
                Outcome::new(BackupReason::StoreAccessError, message)
            }
        },
        Err(BackupError::Settings(ConfigError::Lookup(e))) => return Err(e),
        Err(BackupError::Settings(e)) => {
            Outcome::new(BackupReason::StoreAccessError, e.to_string())
        }
        Err(e @ (BackupError::InvalidBackupId(_) | BackupError::RecordLost(_))) => {
            Outcome::new(BackupReason::Failed, e.to_string())
        }
        Err(BackupError::Agent(e @ AgentError::Conflict(_))) => {
            Outcome::new(BackupReason::BackupConflict, e.to_string())
        }
        Err(BackupError::Agent(e)) if is_access_failure(&e) => {
            Outcome::new(BackupReason::AgentAccessError, e.to_string())
        }
        Err(BackupError::Agent(e)) => Outcome::new(BackupReason::AgentFailed, e.to_string()),
    };
    Ok(outcome)
}
