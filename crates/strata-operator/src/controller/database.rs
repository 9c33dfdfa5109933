//! Database controller
//!
//! Creates a logical database on its Instance through the agent.

use std::sync::Arc;

use kube::runtime::controller::Action;
use kube::ResourceExt;
use thiserror::Error;
use tracing::{debug, instrument};

use strata_common::agent::CreateDatabaseRequest;
use strata_common::crd::{Database, DatabaseReason};
use strata_common::kube_utils::namespace_or_default;
use strata_common::Error;

use super::{classify, is_access_failure, Dependency};
use crate::agent_client::AgentError;
use crate::context::Context;
use crate::converge::{absorbed, apply, Outcome};
use crate::resolver::{ResolveError, Resolver};

/// Failures creating a Database
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// The Instance could not be resolved
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    /// The agent call failed
    #[error(transparent)]
    Agent(#[from] AgentError),
}

/// Reconcile a Database
#[instrument(skip(database, ctx), fields(database = %database.name_any()))]
pub async fn reconcile(database: Arc<Database>, ctx: Arc<Context>) -> Result<Action, Error> {
    if absorbed(database.as_ref()) {
        debug!("database settled");
        return Ok(Action::await_change());
    }

    let namespace = namespace_or_default(database.as_ref());
    let result = create(&database, &Resolver::new(&ctx, &namespace)).await;
    apply(database.as_ref(), outcome(&database, result)?, &ctx).await
}

async fn create(database: &Database, resolver: &Resolver<'_>) -> Result<(), DatabaseError> {
    let client = resolver.client_for(&database.spec.instance).await?;
    client
        .create_database(&CreateDatabaseRequest {
            name: database.spec.name.clone(),
        })
        .await?;
    Ok(())
}

fn outcome(
    database: &Database,
    result: Result<(), DatabaseError>,
) -> Result<Outcome<DatabaseReason>, Error> {
    let outcome = match result {
        Ok(()) => Outcome::new(
            DatabaseReason::Created,
            format!("database {} created", database.spec.name),
        ),
        Err(DatabaseError::Resolve(e)) => match classify(e)? {
            Dependency::Unavailable(_, message) => {
                Outcome::new(DatabaseReason::InstanceAccessError, message)
            }
            Dependency::Unreachable(message) => {
                Outcome::new(DatabaseReason::AgentAccessError, message)
            }
        },
        Err(DatabaseError::Agent(e)) if is_access_failure(&e) => {
            Outcome::new(DatabaseReason::AgentAccessError, e.to_string())
        }
        Err(DatabaseError::Agent(e)) => Outcome::new(DatabaseReason::AgentFailed, e.to_string()),
    };
    Ok(outcome)
}
