//! Common types for Strata: CRDs, conditions, backoff, errors, and agent wire types

#![deny(missing_docs)]

pub mod agent;
pub mod backoff;
pub mod crd;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod reason;
pub mod telemetry;

pub use backoff::BackoffTable;
pub use error::Error;
pub use reason::{Reason, ReasonClass};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group for all Strata custom resources
pub const API_GROUP: &str = "strata.dev";

/// Port the per-instance management agent listens on
pub const DEFAULT_AGENT_PORT: u16 = 8080;

/// Field manager used for server-side apply and status patches
pub const FIELD_MANAGER: &str = "strata-operator";

/// Label key identifying the owning Instance on generated resources
pub const INSTANCE_LABEL_KEY: &str = "strata.dev/instance";

/// Label key for the managed-by label
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Label value for resources created by the operator
pub const LABEL_MANAGED_BY_STRATA: &str = "strata";

/// Requeue interval after a driver-level reconcile error (status write, lookup)
pub const REQUEUE_ERROR_SECS: u64 = 30;

/// Timeout for calls to an instance agent and for storage backend operations
pub const IO_TIMEOUT_SECS: u64 = 60;
