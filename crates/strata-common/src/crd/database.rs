//! Database Custom Resource Definition

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Condition;
use super::{impl_managed, ResourceKind};
use crate::reason::{Reason, ReasonClass};

/// Specification for a Database
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "strata.dev",
    version = "v1alpha1",
    kind = "Database",
    plural = "databases",
    shortname = "stdb",
    namespaced,
    status = "DatabaseStatus",
    printcolumn = r#"{"name":"Instance","type":"string","jsonPath":".spec.instance"}"#,
    printcolumn = r#"{"name":"Reason","type":"string","jsonPath":".status.conditions[-1:].reason"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseSpec {
    /// Owning Instance
    pub instance: String,
    /// Database name on the server
    pub name: String,
}

/// Status of a Database
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseStatus {
    /// Availability condition history, oldest first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

crate::reason_enum! {
    /// Condition reasons for a Database
    pub enum DatabaseReason: "Database" {
        /// Not yet attempted
        Pending => Initial,
        /// Owning Instance missing or not ready
        InstanceAccessError => Transient,
        /// Instance agent unreachable
        AgentAccessError => Transient,
        /// Agent rejected the request or an unclassified error occurred
        AgentFailed => Transient,
        /// Database exists on the server
        Created => Succeeded,
    }
}

impl Reason for DatabaseReason {
    const KIND: &'static str = "Database";
    const ALL: &'static [Self] = &[
        Self::Pending,
        Self::InstanceAccessError,
        Self::AgentAccessError,
        Self::AgentFailed,
        Self::Created,
    ];

    fn class(self) -> ReasonClass {
        self.class_of()
    }
}

impl_managed!(Database, DatabaseReason, ResourceKind::Database);
