//! Operation controller
//!
//! Runs a one-shot action against an Instance using the same job bodies
//! as the crontab. Ending maintenance through an Operation is
//! unconditional, unlike the scheduled end job.

use std::sync::Arc;

use chrono::Utc;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use thiserror::Error;
use tracing::{debug, instrument};

use strata_common::crd::{Operation, OperationAction, OperationReason};
use strata_common::kube_utils::namespace_or_default;
use strata_common::Error;

use super::{classify, Dependency};
use crate::context::Context;
use crate::converge::{absorbed, apply, Outcome};
use crate::crontab::JobError;
use crate::resolver::{ResolveError, Resolver};

/// Failures performing an Operation
#[derive(Debug, Error)]
pub enum OperationError {
    /// The Instance could not be resolved
    #[error(transparent)]
    Instance(#[from] ResolveError),

    /// The action's job failed
    #[error(transparent)]
    Job(#[from] JobError),
}

/// Reconcile an Operation
#[instrument(skip(operation, ctx), fields(operation = %operation.name_any(), action = %operation.spec.action))]
pub async fn reconcile(operation: Arc<Operation>, ctx: Arc<Context>) -> Result<Action, Error> {
    if absorbed(operation.as_ref()) {
        debug!("operation settled");
        return Ok(Action::await_change());
    }

    let namespace = namespace_or_default(operation.as_ref());
    let result = perform(&operation, &ctx, &namespace).await;
    apply(operation.as_ref(), outcome(result)?, &ctx).await
}

async fn perform(
    operation: &Operation,
    ctx: &Context,
    namespace: &str,
) -> Result<String, OperationError> {
    let instance = &operation.spec.instance;
    Resolver::new(ctx, namespace).instance(instance).await?;

    let now = Utc::now();
    let message = match operation.spec.action {
        OperationAction::Backup => {
            let backup = ctx.jobs.run_backup(namespace, instance, now).await?;
            format!("backup {backup} created")
        }
        OperationAction::StartMaintenance => {
            let end = ctx.jobs.start_maintenance(namespace, instance, now).await?;
            format!("maintenance window open until {}", end.to_rfc3339())
        }
        OperationAction::EndMaintenance => {
            ctx.jobs.end_maintenance(namespace, instance, now, true).await?;
            "maintenance window closed".to_string()
        }
    };
    Ok(message)
}

fn outcome(result: Result<String, OperationError>) -> Result<Outcome<OperationReason>, Error> {
    let outcome = match result {
        Ok(message) => Outcome::new(OperationReason::Completed, message),
        Err(OperationError::Instance(e)) => {
            let message = match classify(e)? {
                Dependency::Unavailable(_, message) | Dependency::Unreachable(message) => message,
            };
            Outcome::new(OperationReason::InstanceAccessError, message)
        }
        Err(OperationError::Job(e)) => Outcome::new(OperationReason::JobFailed, e.to_string()),
    };
    Ok(outcome)
}
