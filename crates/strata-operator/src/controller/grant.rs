//! Grant controller
//!
//! Grants a User privileges on a Database. Dependencies are checked in a
//! fixed order: the User, then the Database, then that both belong to the
//! same Instance, and only then is the Instance's agent contacted. A
//! mismatch is permanent and is decided without talking to any runtime.

use std::sync::Arc;

use kube::runtime::controller::Action;
use kube::ResourceExt;
use thiserror::Error;
use tracing::{debug, instrument};

use strata_common::agent::CreateGrantRequest;
use strata_common::crd::{Grant, GrantReason, ResourceKind};
use strata_common::kube_utils::namespace_or_default;
use strata_common::Error;

use super::{classify, is_access_failure, Dependency};
use crate::agent_client::AgentError;
use crate::context::Context;
use crate::converge::{absorbed, apply, Outcome};
use crate::resolver::{ResolveError, Resolver};

/// Failures granting privileges
#[derive(Debug, Error)]
pub enum GrantError {
    /// The User could not be resolved
    #[error("user: {0}")]
    User(ResolveError),

    /// The Database could not be resolved
    #[error("database: {0}")]
    Database(ResolveError),

    /// User and Database live on different Instances
    #[error("user is on instance {user_instance} but database is on instance {database_instance}")]
    UserDatabaseMismatch {
        /// Instance of the User
        user_instance: String,
        /// Instance of the Database
        database_instance: String,
    },

    /// The shared Instance or its agent could not be resolved
    #[error(transparent)]
    Instance(ResolveError),

    /// The agent call failed
    #[error(transparent)]
    Agent(#[from] AgentError),
}

/// Reconcile a Grant
#[instrument(skip(grant, ctx), fields(grant = %grant.name_any()))]
pub async fn reconcile(grant: Arc<Grant>, ctx: Arc<Context>) -> Result<Action, Error> {
    if absorbed(grant.as_ref()) {
        debug!("grant settled");
        return Ok(Action::await_change());
    }

    let namespace = namespace_or_default(grant.as_ref());
    let result = create(&grant, &Resolver::new(&ctx, &namespace)).await;
    apply(grant.as_ref(), outcome(&grant, result)?, &ctx).await
}

async fn create(grant: &Grant, resolver: &Resolver<'_>) -> Result<(), GrantError> {
    let user = resolver
        .user(&grant.spec.user)
        .await
        .map_err(GrantError::User)?;
    let database = resolver
        .database(&grant.spec.database)
        .await
        .map_err(GrantError::Database)?;

    if user.spec.instance != database.spec.instance {
        return Err(GrantError::UserDatabaseMismatch {
            user_instance: user.spec.instance,
            database_instance: database.spec.instance,
        });
    }

    let client = resolver
        .client_for(&user.spec.instance)
        .await
        .map_err(GrantError::Instance)?;
    client
        .create_grant(&CreateGrantRequest {
            database: database.spec.name,
            username: user.spec.username,
            privileges: grant.spec.privileges.clone(),
        })
        .await?;
    Ok(())
}

fn outcome(grant: &Grant, result: Result<(), GrantError>) -> Result<Outcome<GrantReason>, Error> {
    let dependency = |reason: GrantReason, e: ResolveError| -> Result<Outcome<GrantReason>, Error> {
        Ok(match classify(e)? {
            Dependency::Unavailable(_, message) => Outcome::new(reason, message),
            Dependency::Unreachable(message) => {
                Outcome::new(GrantReason::AgentAccessError, message)
            }
        })
    };

    match result {
        Ok(()) => Ok(Outcome::new(
            GrantReason::Granted,
            format!(
                "{} granted to {} on {}",
                grant.spec.privileges.join(", "),
                grant.spec.user,
                grant.spec.database
            ),
        )),
        Err(GrantError::User(e)) => dependency(GrantReason::UserAccessError, e),
        Err(GrantError::Database(e)) => dependency(GrantReason::DatabaseAccessError, e),
        Err(e @ GrantError::UserDatabaseMismatch { .. }) => {
            Ok(Outcome::new(GrantReason::UserDatabaseMismatch, e.to_string()))
        }
        Err(GrantError::Instance(e)) => match classify(e)? {
            Dependency::Unavailable(ResourceKind::Instance, message) => {
                Ok(Outcome::new(GrantReason::InstanceAccessError, message))
            }
            Dependency::Unavailable(_, message) | Dependency::Unreachable(message) => {
                Ok(Outcome::new(GrantReason::AgentAccessError, message))
            }
        },
        Err(GrantError::Agent(e)) if is_access_failure(&e) => {
            Ok(Outcome::new(GrantReason::AgentAccessError, e.to_string()))
        }
        Err(GrantError::Agent(e)) => Ok(Outcome::new(GrantReason::AgentFailed, e.to_string())),
    }
}
