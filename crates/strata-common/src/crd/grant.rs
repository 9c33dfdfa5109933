//! Grant Custom Resource Definition
//!
//! Privileges of a User on a Database. Both must be ready and must belong
//! to the same Instance before the agent is asked to grant anything.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Condition;
use super::{impl_managed, ResourceKind};
use crate::reason::{Reason, ReasonClass};

/// Specification for a Grant
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "strata.dev",
    version = "v1alpha1",
    kind = "Grant",
    plural = "grants",
    shortname = "stg",
    namespaced,
    status = "GrantStatus",
    printcolumn = r#"{"name":"User","type":"string","jsonPath":".spec.user"}"#,
    printcolumn = r#"{"name":"Database","type":"string","jsonPath":".spec.database"}"#,
    printcolumn = r#"{"name":"Reason","type":"string","jsonPath":".status.conditions[-1:].reason"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct GrantSpec {
    /// User resource name
    pub user: String,
    /// Database resource name
    pub database: String,
    /// Privileges to grant (e.g. SELECT, INSERT); defaults to ALL
    #[serde(default = "default_privileges")]
    pub privileges: Vec<String>,
}

fn default_privileges() -> Vec<String> {
    vec!["ALL".to_string()]
}

/// Status of a Grant
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GrantStatus {
    /// Availability condition history, oldest first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

crate::reason_enum! {
    /// Condition reasons for a Grant
    pub enum GrantReason: "Grant" {
        /// Not yet attempted
        Pending => Initial,
        /// User missing or not ready
        UserAccessError => Transient,
        /// Database missing or not ready
        DatabaseAccessError => Transient,
        /// Instance missing or not ready
        InstanceAccessError => Transient,
        /// Instance agent unreachable
        AgentAccessError => Transient,
        /// User and Database belong to different Instances
        UserDatabaseMismatch => Failed,
        /// Agent rejected the request or an unclassified error occurred
        AgentFailed => Transient,
        /// Privileges granted
        Granted => Succeeded,
    }
}

impl Reason for GrantReason {
    const KIND: &'static str = "Grant";
    const ALL: &'static [Self] = &[
        Self::Pending,
        Self::UserAccessError,
        Self::DatabaseAccessError,
        Self::InstanceAccessError,
        Self::AgentAccessError,
        Self::UserDatabaseMismatch,
        Self::AgentFailed,
        Self::Granted,
    ];

    fn class(self) -> ReasonClass {
        self.class_of()
    }
}

impl_managed!(Grant, GrantReason, ResourceKind::Grant);
