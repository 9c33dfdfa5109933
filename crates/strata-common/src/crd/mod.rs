//! Custom Resource Definitions for Strata
//!
//! Eight namespaced kinds in `strata.dev/v1alpha1`. Spec is the user's
//! desired state and is never written by a controller; controllers only
//! write status, which always carries an `Available` condition history.

mod backup;
mod chat;
mod database;
mod grant;
mod instance;
mod operation;
mod store;
mod types;
mod user;

pub use backup::{Backup, BackupReason, BackupSpec, BackupStatus};
pub use chat::{Chat, ChatReason, ChatSpec, ChatStatus};
pub use database::{Database, DatabaseReason, DatabaseSpec, DatabaseStatus};
pub use grant::{Grant, GrantReason, GrantSpec, GrantStatus};
pub use instance::{
    BackupScheduleSpec, Instance, InstanceReason, InstanceSpec, InstanceStatus, JobKind,
    MaintenanceSpec, RestoreSpec, ScheduleEntry, ScheduleStatus, UNSCHEDULED,
};
pub use operation::{Operation, OperationAction, OperationReason, OperationSpec, OperationStatus};
pub use store::{Store, StoreBackend, StoreReason, StoreSpec, StoreStatus};
pub use types::{
    current_reason, is_ready, latest, push_condition, Condition, ConditionStatus, SecretKeyRef,
    CONDITION_HISTORY_CAP, CONDITION_TYPE_AVAILABLE,
};
pub use user::{User, UserReason, UserSpec, UserStatus};

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::CustomResourceExt;

use crate::reason::Reason;

/// The managed kinds, used where an object-safe API needs to name a kind
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// Database server instance
    Instance,
    /// Backup storage location
    Store,
    /// Database login role
    User,
    /// Logical database
    Database,
    /// Privileges of a User on a Database
    Grant,
    /// One backup run
    Backup,
    /// One-shot imperative action on an Instance
    Operation,
    /// Notification channel
    Chat,
}

impl ResourceKind {
    /// Every kind, in dependency order
    pub const ALL: [ResourceKind; 8] = [
        Self::Store,
        Self::Chat,
        Self::Instance,
        Self::User,
        Self::Database,
        Self::Grant,
        Self::Backup,
        Self::Operation,
    ];

    /// Kubernetes kind name
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Instance => "Instance",
            Self::Store => "Store",
            Self::User => "User",
            Self::Database => "Database",
            Self::Grant => "Grant",
            Self::Backup => "Backup",
            Self::Operation => "Operation",
            Self::Chat => "Chat",
        }
    }

    /// CustomResourceDefinition for the kind
    pub fn crd(self) -> CustomResourceDefinition {
        match self {
            Self::Instance => Instance::crd(),
            Self::Store => Store::crd(),
            Self::User => User::crd(),
            Self::Database => Database::crd(),
            Self::Grant => Grant::crd(),
            Self::Backup => Backup::crd(),
            Self::Operation => Operation::crd(),
            Self::Chat => Chat::crd(),
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A CRD driven by the convergence step
pub trait Managed:
    kube::Resource<DynamicType = ()> + Clone + std::fmt::Debug + Send + Sync + 'static
{
    /// The kind's reason enum
    type Reason: Reason;

    /// Kind of this resource
    const KIND: ResourceKind;

    /// Condition history, oldest first
    fn conditions(&self) -> &[Condition];

    /// Reason of the newest condition, if recognised
    fn current_reason(&self) -> Option<Self::Reason> {
        current_reason(self.conditions())
    }

    /// Whether the resource reached its terminal success reason
    fn is_ready(&self) -> bool {
        is_ready(self.conditions())
    }
}

/// Implement [`Managed`] for a CRD whose status has a `conditions` field
macro_rules! impl_managed {
    ($ty:ty, $reason:ty, $kind:expr) => {
        impl $crate::crd::Managed for $ty {
            type Reason = $reason;
            const KIND: $crate::crd::ResourceKind = $kind;

            fn conditions(&self) -> &[$crate::crd::Condition] {
                self.status
                    .as_ref()
                    .map(|s| s.conditions.as_slice())
                    .unwrap_or_default()
            }
        }
    };
}
pub(crate) use impl_managed;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kind_has_a_crd_in_the_strata_group() {
        for kind in ResourceKind::ALL {
            let crd = kind.crd();
            assert_eq!(crd.spec.group, crate::API_GROUP);
            assert_eq!(crd.spec.names.kind, kind.as_str());
            assert_eq!(crd.spec.scope, "Namespaced");
        }
    }

    #[test]
    fn managed_reports_no_reason_without_status() {
        let db = Database::new(
            "orders",
            DatabaseSpec {
                instance: "pg-main".to_string(),
                name: "orders".to_string(),
            },
        );
        assert!(db.current_reason().is_none());
        assert!(!Managed::is_ready(&db));
    }
}
