//! Instance Custom Resource Definition
//!
//! An Instance is one database server: a StatefulSet running the database
//! with the management agent as a sidecar. It optionally restores from a
//! Store on first start, and declares recurring backup and maintenance
//! schedules that the operator installs into its crontab.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Condition;
use super::{impl_managed, ResourceKind};
use crate::reason::{Reason, ReasonClass};

/// Sentinel entry id for a job kind that is not installed
pub const UNSCHEDULED: i64 = -1;

/// Restore source applied when the Instance first starts
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RestoreSpec {
    /// Store holding the backup
    pub store: String,
    /// Object location of the backup inside the store's bucket
    pub location: String,
}

/// Recurring backup configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupScheduleSpec {
    /// Cron expression (e.g. "0 2 * * *"); empty disables scheduled backups
    #[serde(default)]
    pub schedule: String,
    /// Store that scheduled backups are pushed to
    pub store: String,
}

/// Recurring maintenance window configuration
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceSpec {
    /// Cron expression for the window start; empty disables maintenance windows
    #[serde(default)]
    pub schedule: String,
    /// Length of each window in minutes
    #[serde(default = "default_maintenance_minutes")]
    pub duration_minutes: u32,
}

fn default_maintenance_minutes() -> u32 {
    60
}

impl Default for MaintenanceSpec {
    fn default() -> Self {
        Self {
            schedule: String::new(),
            duration_minutes: default_maintenance_minutes(),
        }
    }
}

/// Specification for an Instance
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "strata.dev",
    version = "v1alpha1",
    kind = "Instance",
    plural = "instances",
    shortname = "sti",
    namespaced,
    status = "InstanceStatus",
    printcolumn = r#"{"name":"Reason","type":"string","jsonPath":".status.conditions[-1:].reason"}"#,
    printcolumn = r#"{"name":"Maintenance","type":"boolean","jsonPath":".status.maintenanceMode"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSpec {
    /// Database container image
    pub image: String,

    /// Persistent volume size (e.g. "10Gi")
    #[serde(default = "default_storage_size")]
    pub storage_size: String,

    /// Secret holding the superuser password under key `password`
    pub credentials_secret: String,

    /// Restore from a backup before first start
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore: Option<RestoreSpec>,

    /// Recurring backups
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup: Option<BackupScheduleSpec>,

    /// Recurring maintenance windows
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maintenance: Option<MaintenanceSpec>,

    /// Chat that receives maintenance notifications
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_ref: Option<String>,
}

fn default_storage_size() -> String {
    "10Gi".to_string()
}

impl InstanceSpec {
    /// Declared backup schedule, empty when none
    pub fn backup_schedule(&self) -> &str {
        self.backup.as_ref().map(|b| b.schedule.as_str()).unwrap_or("")
    }

    /// Declared maintenance-start schedule, empty when none
    pub fn maintenance_schedule(&self) -> &str {
        self.maintenance
            .as_ref()
            .map(|m| m.schedule.as_str())
            .unwrap_or("")
    }

    /// Declared maintenance window length
    pub fn maintenance_duration(&self) -> chrono::Duration {
        let minutes = self
            .maintenance
            .as_ref()
            .map(|m| m.duration_minutes)
            .unwrap_or_else(default_maintenance_minutes);
        chrono::Duration::minutes(i64::from(minutes))
    }
}

/// Recurring job kinds tracked per Instance
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum JobKind {
    /// Scheduled backup
    Backup,
    /// Start of a maintenance window
    MaintenanceStart,
    /// End of the current maintenance window (one-shot)
    MaintenanceEnd,
}

impl JobKind {
    /// All kinds
    pub const ALL: [JobKind; 3] = [Self::Backup, Self::MaintenanceStart, Self::MaintenanceEnd];
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Backup => write!(f, "backup"),
            Self::MaintenanceStart => write!(f, "maintenance-start"),
            Self::MaintenanceEnd => write!(f, "maintenance-end"),
        }
    }
}

/// Identity of one installed crontab entry
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleEntry {
    /// Engine-assigned entry id, or -1 when not installed
    #[serde(default = "unscheduled")]
    pub entry_id: i64,
    /// Schedule installed under `entry_id`
    #[serde(default)]
    pub schedule: String,
}

fn unscheduled() -> i64 {
    UNSCHEDULED
}

impl Default for ScheduleEntry {
    fn default() -> Self {
        Self {
            entry_id: UNSCHEDULED,
            schedule: String::new(),
        }
    }
}

impl ScheduleEntry {
    /// Whether an entry id is recorded
    pub fn is_installed(&self) -> bool {
        self.entry_id != UNSCHEDULED
    }
}

/// Crontab state recorded on an Instance.
///
/// Entry ids are only meaningful while `incarnation` equals the running
/// scheduler's incarnation; after an operator restart they are stale.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleStatus {
    /// Scheduler incarnation the entries were installed under
    #[serde(default)]
    pub incarnation: String,
    /// Recurring backup entry
    #[serde(default)]
    pub backup: ScheduleEntry,
    /// Maintenance window start entry
    #[serde(default)]
    pub maintenance_start: ScheduleEntry,
    /// Maintenance window end entry
    #[serde(default)]
    pub maintenance_end: ScheduleEntry,
    /// When the current maintenance window ends
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maintenance_end_time: Option<DateTime<Utc>>,
}

impl ScheduleStatus {
    /// Entry for a job kind
    pub fn entry(&self, kind: JobKind) -> &ScheduleEntry {
        match kind {
            JobKind::Backup => &self.backup,
            JobKind::MaintenanceStart => &self.maintenance_start,
            JobKind::MaintenanceEnd => &self.maintenance_end,
        }
    }

    /// Mutable entry for a job kind
    pub fn entry_mut(&mut self, kind: JobKind) -> &mut ScheduleEntry {
        match kind {
            JobKind::Backup => &mut self.backup,
            JobKind::MaintenanceStart => &mut self.maintenance_start,
            JobKind::MaintenanceEnd => &mut self.maintenance_end,
        }
    }
}

/// Status of an Instance
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstanceStatus {
    /// Availability condition history, oldest first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Installed crontab entries
    #[serde(default)]
    pub schedule: ScheduleStatus,

    /// Whether a maintenance window is open
    #[serde(default)]
    pub maintenance_mode: bool,
}

crate::reason_enum! {
    /// Condition reasons for an Instance
    pub enum InstanceReason: "Instance" {
        /// Not yet attempted
        Pending => Initial,
        /// Spec cannot be satisfied (e.g. invalid cron expression); a spec
        /// fix lets provisioning resume
        InvalidSpec => Transient,
        /// Restore store missing or not ready
        StoreAccessError => Transient,
        /// Superuser credentials Secret missing or incomplete
        CredentialsError => Transient,
        /// Workload could not be applied
        ProvisionFailed => Transient,
        /// Workload applied, waiting for the pod to become ready
        Provisioning => Transient,
        /// Unclassified failure
        AgentFailed => Transient,
        /// Instance is serving
        Available => Succeeded,
    }
}

impl Reason for InstanceReason {
    const KIND: &'static str = "Instance";
    const ALL: &'static [Self] = &[
        Self::Pending,
        Self::InvalidSpec,
        Self::StoreAccessError,
        Self::CredentialsError,
        Self::ProvisionFailed,
        Self::Provisioning,
        Self::AgentFailed,
        Self::Available,
    ];

    fn class(self) -> ReasonClass {
        self.class_of()
    }
}

impl_managed!(Instance, InstanceReason, ResourceKind::Instance);
