//! Operation Custom Resource Definition
//!
//! A one-shot imperative action against an Instance. It reuses the same job
//! bodies as the crontab, so a manual backup or maintenance window behaves
//! exactly like a scheduled one.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Condition;
use super::{impl_managed, ResourceKind};
use crate::reason::{Reason, ReasonClass};

/// Action an Operation performs
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum OperationAction {
    /// Create a Backup of the Instance now
    Backup,
    /// Open a maintenance window now
    StartMaintenance,
    /// Close the current maintenance window now
    EndMaintenance,
}

impl std::fmt::Display for OperationAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Backup => write!(f, "Backup"),
            Self::StartMaintenance => write!(f, "StartMaintenance"),
            Self::EndMaintenance => write!(f, "EndMaintenance"),
        }
    }
}

/// Specification for an Operation
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "strata.dev",
    version = "v1alpha1",
    kind = "Operation",
    plural = "operations",
    shortname = "sto",
    namespaced,
    status = "OperationStatus",
    printcolumn = r#"{"name":"Instance","type":"string","jsonPath":".spec.instance"}"#,
    printcolumn = r#"{"name":"Action","type":"string","jsonPath":".spec.action"}"#,
    printcolumn = r#"{"name":"Reason","type":"string","jsonPath":".status.conditions[-1:].reason"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct OperationSpec {
    /// Target Instance
    pub instance: String,
    /// What to do
    pub action: OperationAction,
}

/// Status of an Operation
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OperationStatus {
    /// Availability condition history, oldest first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

crate::reason_enum! {
    /// Condition reasons for an Operation
    pub enum OperationReason: "Operation" {
        /// Not yet attempted
        Pending => Initial,
        /// Instance missing or not ready
        InstanceAccessError => Transient,
        /// The action's job failed
        JobFailed => Transient,
        /// Action performed
        Completed => Succeeded,
    }
}

impl Reason for OperationReason {
    const KIND: &'static str = "Operation";
    const ALL: &'static [Self] = &[
        Self::Pending,
        Self::InstanceAccessError,
        Self::JobFailed,
        Self::Completed,
    ];

    fn class(self) -> ReasonClass {
        self.class_of()
    }
}

impl_managed!(Operation, OperationReason, ResourceKind::Operation);
