//! Backup Custom Resource Definition
//!
//! One backup run of an Instance into a Store. The operator asks the
//! instance agent to start the dump and then polls the agent's record
//! until it reaches a terminal state.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Condition;
use super::{impl_managed, ResourceKind};
use crate::reason::{Reason, ReasonClass};

/// Specification for a Backup
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "strata.dev",
    version = "v1alpha1",
    kind = "Backup",
    plural = "backups",
    shortname = "stb",
    namespaced,
    status = "BackupStatus",
    printcolumn = r#"{"name":"Instance","type":"string","jsonPath":".spec.instance"}"#,
    printcolumn = r#"{"name":"Store","type":"string","jsonPath":".spec.store"}"#,
    printcolumn = r#"{"name":"Reason","type":"string","jsonPath":".status.conditions[-1:].reason"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BackupSpec {
    /// Instance to back up
    pub instance: String,
    /// Store to push the dump to
    pub store: String,
    /// Object location inside the store; defaults to `<instance>/<backup name>.dump`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl Backup {
    /// Location the dump is pushed to, before the store prefix is applied
    pub fn location(&self) -> String {
        match &self.spec.location {
            Some(location) if !location.is_empty() => location.clone(),
            _ => format!(
                "{}/{}.dump",
                self.spec.instance,
                self.metadata.name.as_deref().unwrap_or("backup")
            ),
        }
    }
}

/// Status of a Backup
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupStatus {
    /// Availability condition history, oldest first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Agent-side backup record id once the agent accepted the request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_id: Option<String>,
}

crate::reason_enum! {
    /// Condition reasons for a Backup
    pub enum BackupReason: "Backup" {
        /// Not yet attempted
        Pending => Initial,
        /// Instance missing or not ready
        InstanceAccessError => Transient,
        /// Store missing or not ready
        StoreAccessError => Transient,
        /// Instance agent unreachable
        AgentAccessError => Transient,
        /// The agent is already running another backup
        BackupConflict => Transient,
        /// Agent accepted the backup and is running it
        Running => Transient,
        /// Agent rejected the request or an unclassified error occurred
        AgentFailed => Transient,
        /// Dump pushed to the store
        Succeeded => Succeeded,
        /// The agent reported the backup as failed
        Failed => Failed,
    }
}

impl Reason for BackupReason {
    const KIND: &'static str = "Backup";
    const ALL: &'static [Self] = &[
        Self::Pending,
        Self::InstanceAccessError,
        Self::StoreAccessError,
        Self::AgentAccessError,
        Self::BackupConflict,
        Self::Running,
        Self::AgentFailed,
        Self::Succeeded,
        Self::Failed,
    ];

    fn class(self) -> ReasonClass {
        self.class_of()
    }

    fn allows(self, to: Self) -> bool {
        match self {
            // once the agent owns the run, start-up reasons no longer apply
            Self::Running => !matches!(
                to,
                Self::Pending | Self::StoreAccessError | Self::BackupConflict
            ),
            _ => !self.class().is_terminal() && to.class() != ReasonClass::Initial,
        }
    }
}

impl_managed!(Backup, BackupReason, ResourceKind::Backup);
