//! User controller
//!
//! Creates a login role on the owning Instance. The password is read from
//! the referenced Secret on every attempt and is never written to status.

use std::sync::Arc;

use kube::runtime::controller::Action;
use kube::ResourceExt;
use thiserror::Error;
use tracing::{debug, instrument};

use strata_common::agent::CreateUserRequest;
use strata_common::crd::{User, UserReason};
use strata_common::kube_utils::namespace_or_default;
use strata_common::Error;

use super::{classify, is_access_failure, Dependency};
use crate::agent_client::AgentError;
use crate::context::Context;
use crate::converge::{absorbed, apply, Outcome};
use crate::resolver::{ResolveError, Resolver};
use crate::settings::{secret_password, ConfigError};

/// Failures creating a User
#[derive(Debug, Error)]
pub enum UserError {
    /// The Instance could not be resolved
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    /// The password Secret is unusable
    #[error(transparent)]
    Password(#[from] ConfigError),

    /// The agent call failed
    #[error(transparent)]
    Agent(#[from] AgentError),
}

/// Reconcile a User
#[instrument(skip(user, ctx), fields(user = %user.name_any()))]
pub async fn reconcile(user: Arc<User>, ctx: Arc<Context>) -> Result<Action, Error> {
    if absorbed(user.as_ref()) {
        debug!("user settled");
        return Ok(Action::await_change());
    }

    let namespace = namespace_or_default(user.as_ref());
    let result = create(&user, &ctx, &namespace).await;
    apply(user.as_ref(), outcome(&user, result)?, &ctx).await
}

async fn create(user: &User, ctx: &Context, namespace: &str) -> Result<(), UserError> {
    let resolver = Resolver::new(ctx, namespace);
    let client = resolver.client_for(&user.spec.instance).await?;
    let password =
        secret_password(ctx.store.as_ref(), namespace, &user.spec.password_secret).await?;
    client
        .create_user(&CreateUserRequest {
            username: user.spec.username.clone(),
            password,
        })
        .await?;
    Ok(())
}

fn outcome(user: &User, result: Result<(), UserError>) -> Result<Outcome<UserReason>, Error> {
    let outcome = match result {
        Ok(()) => Outcome::new(
            UserReason::Created,
            format!("role {} created", user.spec.username),
        ),
        Err(UserError::Resolve(e)) => match classify(e)? {
            Dependency::Unavailable(_, message) => {
                Outcome::new(UserReason::InstanceAccessError, message)
            }
            Dependency::Unreachable(message) => Outcome::new(UserReason::AgentAccessError, message),
        },
        Err(UserError::Password(ConfigError::Lookup(e))) => return Err(e),
        Err(UserError::Password(e)) => Outcome::new(UserReason::PasswordError, e.to_string()),
        Err(UserError::Agent(e)) if is_access_failure(&e) => {
            Outcome::new(UserReason::AgentAccessError, e.to_string())
        }
        Err(UserError::Agent(e)) => Outcome::new(UserReason::AgentFailed, e.to_string()),
    };
    Ok(outcome)
}
