//! Store controller
//!
//! Validates a Store's backend name and the variables that backend needs.
//! Nothing outside the cluster is contacted; agents receive the settings
//! when a backup or restore runs.

use std::sync::Arc;

use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, instrument};

use strata_common::crd::{Store, StoreReason};
use strata_common::kube_utils::namespace_or_default;
use strata_common::Error;

use crate::context::Context;
use crate::converge::{absorbed, apply, Outcome};
use crate::settings::{store_settings, ConfigError, StoreSettings};

/// Reconcile a Store
#[instrument(skip(store, ctx), fields(store = %store.name_any()))]
pub async fn reconcile(store: Arc<Store>, ctx: Arc<Context>) -> Result<Action, Error> {
    if absorbed(store.as_ref()) {
        debug!("store settled");
        return Ok(Action::await_change());
    }

    let namespace = namespace_or_default(store.as_ref());
    let result = store_settings(ctx.store.as_ref(), &namespace, &store).await;
    apply(store.as_ref(), outcome(result)?, &ctx).await
}

fn outcome(result: Result<StoreSettings, ConfigError>) -> Result<Outcome<StoreReason>, Error> {
    let outcome = match result {
        Ok(settings) => Outcome::new(
            StoreReason::Ready,
            format!("{} backend, bucket {}", settings.backend, settings.bucket),
        ),
        Err(e @ ConfigError::UnknownBackend(_)) => {
            Outcome::new(StoreReason::UnknownBackend, e.to_string())
        }
        Err(e @ ConfigError::MissingVariable(_)) => {
            Outcome::new(StoreReason::MissingVariable, e.to_string())
        }
        Err(
            e @ (ConfigError::SecretNotFound(_)
            | ConfigError::KeyNotFound { .. }
            | ConfigError::MissingPassword(_)),
        ) => Outcome::new(StoreReason::SecretAccessError, e.to_string()),
        Err(ConfigError::Lookup(e)) => return Err(e),
    };
    Ok(outcome)
}
