//! Restart-safe recurring jobs for Instances
//!
//! The cron engine only lives in memory, so an operator restart silently
//! loses every installed job. Each Instance records the entries it owns
//! together with the scheduler's *incarnation*; a fresh process has a new
//! incarnation, which marks every recorded entry id as stale and makes
//! [`Crontab::reconcile_all`] reinstall the jobs exactly once.

mod engine;
pub mod jobs;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use strata_common::crd::{InstanceSpec, InstanceStatus, JobKind, ScheduleEntry, ScheduleStatus};

pub use engine::CronEngine;
pub use jobs::{JobError, Jobs};

/// A job body; each call produces one run
pub type Job = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Seconds between a maintenance window's end time and the job that closes it
pub const MAINTENANCE_END_GRACE_SECS: i64 = 60;

/// When the job closing a window that ends at `end` fires
pub fn maintenance_end_trigger(end: DateTime<Utc>) -> Trigger {
    Trigger::At(end + chrono::Duration::seconds(MAINTENANCE_END_GRACE_SECS))
}

/// Scheduler errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    /// The cron expression does not parse
    #[error("invalid schedule {expression:?}: {message}")]
    InvalidSchedule {
        /// Offending expression
        expression: String,
        /// Parser message
        message: String,
    },
}

/// When an entry fires
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Trigger {
    /// Recurring 5-field cron expression
    Cron(String),
    /// Once, at the given time; the entry removes itself after firing
    At(DateTime<Utc>),
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cron(expression) => f.write_str(expression),
            Self::At(at) => write!(f, "@{}", at.to_rfc3339()),
        }
    }
}

/// Identity of one scheduler lifetime
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Incarnation(Uuid);

impl Incarnation {
    /// Fresh random incarnation
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Fixed incarnation, for tests and tooling
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }
}

impl Default for Incarnation {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Incarnation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Builds job bodies for an Instance
pub trait JobFactory: Send + Sync {
    /// Job of the given kind for `namespace/instance`
    fn job(&self, namespace: &str, instance: &str, kind: JobKind) -> Job;
}

/// What [`Crontab::reconcile_all`] did to the status
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// The schedule status (or maintenance mode) changed and must be persisted
    pub changed: bool,
    /// A maintenance window whose end passed while no end job existed was closed
    pub maintenance_cleared: bool,
}

/// Check a cron expression without installing anything
pub fn validate_schedule(expression: &str) -> Result<(), SchedulerError> {
    engine::parse_cron(expression).map(|_| ())
}

/// Status patch body for a schedule; the end time is always present so a
/// merge patch clears it when unset
pub fn schedule_patch(schedule: &ScheduleStatus) -> Value {
    let mut value =
        serde_json::to_value(schedule).unwrap_or_else(|_| Value::Object(Default::default()));
    if let Value::Object(map) = &mut value {
        map.insert(
            "maintenanceEndTime".to_string(),
            schedule
                .maintenance_end_time
                .map(|t| Value::String(t.to_rfc3339()))
                .unwrap_or(Value::Null),
        );
    }
    value
}

/// The Instance a crontab entry belongs to
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Owner {
    /// Instance namespace
    pub namespace: String,
    /// Instance name
    pub instance: String,
}

impl Owner {
    /// Owner for `namespace/instance`
    pub fn new(namespace: &str, instance: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            instance: instance.to_string(),
        }
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.instance)
    }
}

type OwnerIndex = HashMap<(Owner, JobKind), i64>;

/// Cron engine plus the incarnation its entry ids belong to.
///
/// The engine holds at most one live entry per owner and job kind. Recorded
/// entry ids only say whether a status was written under this incarnation;
/// the owner index decides which engine entry a new schedule replaces, so a
/// lost status write or a stale read never leaves a second entry behind.
pub struct Crontab {
    engine: CronEngine,
    incarnation: Incarnation,
    owners: Mutex<OwnerIndex>,
}

impl Default for Crontab {
    fn default() -> Self {
        Self::new()
    }
}

impl Crontab {
    /// Crontab with a fresh incarnation
    pub fn new() -> Self {
        Self::with_incarnation(Incarnation::new())
    }

    /// Crontab with a given incarnation
    pub fn with_incarnation(incarnation: Incarnation) -> Self {
        Self {
            engine: CronEngine::new(),
            incarnation,
            owners: Mutex::new(HashMap::new()),
        }
    }

    /// This scheduler's incarnation
    pub fn incarnation(&self) -> Incarnation {
        self.incarnation
    }

    /// The underlying engine
    pub fn engine(&self) -> &CronEngine {
        &self.engine
    }

    fn owners(&self) -> MutexGuard<'_, OwnerIndex> {
        self.owners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn owns(&self, status: &ScheduleStatus) -> bool {
        status.incarnation == self.incarnation.to_string()
    }

    /// Engine entry currently installed for `owner` and `kind`
    pub fn live_entry(&self, owner: &Owner, kind: JobKind) -> Option<i64> {
        self.owners()
            .get(&(owner.clone(), kind))
            .copied()
            .filter(|id| self.engine.contains(*id))
    }

    /// Whether the recorded entry for `kind` is live in this scheduler
    pub fn is_scheduled(&self, status: &ScheduleStatus, kind: JobKind) -> bool {
        self.owns(status) && status.entry(kind).is_installed()
    }

    /// Remove the owner's entry for `kind` and reset the record.
    ///
    /// Returns whether an engine entry was removed.
    pub fn unschedule(&self, owner: &Owner, status: &mut ScheduleStatus, kind: JobKind) -> bool {
        let mut owners = self.owners();
        let removed = self.release(&mut owners, owner, status, kind);
        *status.entry_mut(kind) = ScheduleEntry::default();
        removed
    }

    fn release(
        &self,
        owners: &mut OwnerIndex,
        owner: &Owner,
        status: &ScheduleStatus,
        kind: JobKind,
    ) -> bool {
        let indexed = owners
            .remove(&(owner.clone(), kind))
            .is_some_and(|id| self.engine.remove(id));
        let recorded =
            self.is_scheduled(status, kind) && self.engine.remove(status.entry(kind).entry_id);
        indexed || recorded
    }

    /// Install `job` for the owner's `kind`, replacing whatever entry of that
    /// kind the owner already has.
    pub fn schedule(
        &self,
        owner: &Owner,
        status: &mut ScheduleStatus,
        kind: JobKind,
        trigger: Trigger,
        job: Job,
    ) -> Result<i64, SchedulerError> {
        if let Trigger::Cron(expression) = &trigger {
            validate_schedule(expression)?;
        }
        let text = trigger.to_string();

        let mut owners = self.owners();
        self.release(&mut owners, owner, status, kind);
        let id = self.engine.add(trigger, job)?;
        owners.insert((owner.clone(), kind), id);
        drop(owners);

        *status.entry_mut(kind) = ScheduleEntry {
            entry_id: id,
            schedule: text,
        };
        debug!(%owner, %kind, entry_id = id, "job scheduled");
        Ok(id)
    }

    /// Remove every entry an owner has; returns how many were live
    pub fn forget(&self, owner: &Owner) -> usize {
        let mut owners = self.owners();
        let removed = JobKind::ALL
            .into_iter()
            .filter_map(|kind| owners.remove(&(owner.clone(), kind)))
            .filter(|id| self.engine.remove(*id))
            .count();
        if removed > 0 {
            info!(%owner, removed, "crontab entries removed");
        }
        removed
    }

    /// Bring an Instance's installed jobs in line with its spec.
    ///
    /// Declared schedules are validated before anything changes, so an error
    /// leaves both the engine and `status` untouched. On an incarnation
    /// mismatch every recorded id is stale: the records are reset, the
    /// incarnation is stamped, and all declared jobs are installed, each
    /// replacing any entry the owner already has. An open maintenance window
    /// gets its end job back, or is closed at once if its end time has
    /// passed. When the incarnation matches, only kinds whose declared
    /// schedule differs from that same kind's installed schedule are
    /// reinstalled.
    pub fn reconcile_all(
        &self,
        namespace: &str,
        instance: &str,
        spec: &InstanceSpec,
        status: &mut InstanceStatus,
        now: DateTime<Utc>,
        jobs: &dyn JobFactory,
    ) -> Result<ReconcileOutcome, SchedulerError> {
        let declared = [
            (JobKind::Backup, spec.backup_schedule()),
            (JobKind::MaintenanceStart, spec.maintenance_schedule()),
        ];
        for (_, expression) in declared {
            if !expression.is_empty() {
                validate_schedule(expression)?;
            }
        }

        let owner = Owner::new(namespace, instance);
        let mut outcome = ReconcileOutcome::default();
        let schedule = &mut status.schedule;

        let fresh = !self.owns(schedule);
        if fresh {
            info!(
                %owner,
                previous = %schedule.incarnation,
                current = %self.incarnation,
                "adopting instance into scheduler incarnation"
            );
            for kind in JobKind::ALL {
                *schedule.entry_mut(kind) = ScheduleEntry::default();
            }
            schedule.incarnation = self.incarnation.to_string();
            outcome.changed = true;
        }

        for (kind, expression) in declared {
            if expression.is_empty() {
                let recorded = schedule.entry(kind).is_installed();
                if self.unschedule(&owner, schedule, kind) || recorded {
                    outcome.changed = true;
                }
                continue;
            }
            let current = schedule.entry(kind);
            if self.is_scheduled(schedule, kind)
                && current.schedule == expression
                && self.live_entry(&owner, kind).is_some()
            {
                continue;
            }
            self.schedule(
                &owner,
                schedule,
                kind,
                Trigger::Cron(expression.to_string()),
                jobs.job(namespace, instance, kind),
            )?;
            outcome.changed = true;
        }

        if fresh && status.maintenance_mode {
            match schedule.maintenance_end_time {
                Some(end) if end > now => {
                    self.schedule(
                        &owner,
                        schedule,
                        JobKind::MaintenanceEnd,
                        maintenance_end_trigger(end),
                        jobs.job(namespace, instance, JobKind::MaintenanceEnd),
                    )?;
                }
                _ => {
                    info!(%owner, "maintenance window ended while unscheduled, closing");
                    self.unschedule(&owner, schedule, JobKind::MaintenanceEnd);
                    schedule.maintenance_end_time = None;
                    status.maintenance_mode = false;
                    outcome.maintenance_cleared = true;
                }
            }
            outcome.changed = true;
        }

        Ok(outcome)
    }
}
