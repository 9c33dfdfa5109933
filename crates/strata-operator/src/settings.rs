//! Configuration derived from Stores and Secrets

use std::collections::BTreeMap;

use thiserror::Error;

use strata_common::crd::{SecretKeyRef, Store, StoreBackend};
use strata_common::Error;

use crate::store::ResourceStore;

/// Failures deriving configuration from referenced resources
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The Store names a backend that does not exist
    #[error("unknown storage backend {0:?}")]
    UnknownBackend(String),

    /// A referenced Secret does not exist
    #[error("secret {0} not found")]
    SecretNotFound(String),

    /// A backend setting is missing or empty
    #[error("missing variable {0}")]
    MissingVariable(String),

    /// A Secret lacks the referenced key
    #[error("key {key} not found in secret {secret}")]
    KeyNotFound {
        /// Secret name
        secret: String,
        /// Missing key
        key: String,
    },

    /// The password value is empty
    #[error("secret {0} holds an empty password")]
    MissingPassword(String),

    /// Reading the Secret failed
    #[error(transparent)]
    Lookup(#[from] Error),
}

/// Everything an agent needs to reach a Store's bucket
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreSettings {
    /// Backend kind
    pub backend: StoreBackend,
    /// Bucket
    pub bucket: String,
    /// Variables with the Secret's data merged over the spec's
    pub variables: BTreeMap<String, String>,
}

/// Resolve a Store's backend and merged variables, checking required ones
pub async fn store_settings(
    resources: &dyn ResourceStore,
    namespace: &str,
    store: &Store,
) -> Result<StoreSettings, ConfigError> {
    let backend: StoreBackend = store
        .spec
        .backend
        .parse()
        .map_err(|_| ConfigError::UnknownBackend(store.spec.backend.clone()))?;

    let mut variables = store.spec.variables.clone();
    if let Some(secret) = store.spec.secret_ref.as_deref() {
        let data = resources
            .get_secret(namespace, secret)
            .await?
            .ok_or_else(|| ConfigError::SecretNotFound(secret.to_string()))?;
        variables.extend(data);
    }

    if let Some(missing) = backend
        .required_variables()
        .iter()
        .find(|key| variables.get(**key).map_or(true, |v| v.is_empty()))
    {
        return Err(ConfigError::MissingVariable(missing.to_string()));
    }

    Ok(StoreSettings {
        backend,
        bucket: store.spec.bucket.clone(),
        variables,
    })
}

/// Read a password from a Secret key, rejecting missing keys and empty values
pub async fn secret_password(
    resources: &dyn ResourceStore,
    namespace: &str,
    reference: &SecretKeyRef,
) -> Result<String, ConfigError> {
    let data = resources
        .get_secret(namespace, &reference.name)
        .await?
        .ok_or_else(|| ConfigError::SecretNotFound(reference.name.clone()))?;
    let value = data
        .get(&reference.key)
        .ok_or_else(|| ConfigError::KeyNotFound {
            secret: reference.name.clone(),
            key: reference.key.clone(),
        })?;
    if value.is_empty() {
        return Err(ConfigError::MissingPassword(reference.name.clone()));
    }
    Ok(value.clone())
}
