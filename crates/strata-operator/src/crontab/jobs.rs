//! Job bodies for scheduled backups and maintenance windows
//!
//! The same functions back the crontab entries and the imperative
//! Operation resource. Scheduled runs log failures and wait for the next
//! tick; they never retry on their own.

use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};

use strata_common::crd::{Backup, BackupSpec, Instance, JobKind, Managed, ResourceKind};
use strata_common::kube_utils::owner_reference;
use strata_common::{Error, INSTANCE_LABEL_KEY};

use super::{
    maintenance_end_trigger, schedule_patch, Crontab, Job, JobFactory, Owner, SchedulerError,
};
use crate::notify::NotificationSink;
use crate::store::ResourceStore;

/// Job failures
#[derive(Debug, Error)]
pub enum JobError {
    /// The Instance no longer exists
    #[error("instance {0} not found")]
    InstanceNotFound(String),

    /// A backup was requested for an Instance without a backup store
    #[error("instance {0} has no backup store configured")]
    NoBackupStore(String),

    /// The scheduler is shutting down
    #[error("scheduler is not running")]
    SchedulerStopped,

    /// The end job could not be installed
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    /// Reading or writing cluster state failed
    #[error(transparent)]
    Store(#[from] Error),
}

/// Name of a scheduled Backup: `<instance>-<yyyymmddhhmmss>`
pub fn backup_name(instance: &str, at: DateTime<Utc>) -> String {
    format!("{}-{}", instance, at.format("%Y%m%d%H%M%S"))
}

/// Job bodies bound to the operator's store, notifier and crontab
#[derive(Clone)]
pub struct Jobs {
    store: Arc<dyn ResourceStore>,
    notifier: Arc<dyn NotificationSink>,
    crontab: Weak<Crontab>,
}

impl Jobs {
    /// Bind job bodies to their collaborators
    pub fn new(
        store: Arc<dyn ResourceStore>,
        notifier: Arc<dyn NotificationSink>,
        crontab: &Arc<Crontab>,
    ) -> Self {
        Self {
            store,
            notifier,
            crontab: Arc::downgrade(crontab),
        }
    }

    async fn instance(&self, namespace: &str, name: &str) -> Result<Instance, JobError> {
        self.store
            .get_instance(namespace, name)
            .await?
            .ok_or_else(|| JobError::InstanceNotFound(name.to_string()))
    }

    /// Create a Backup of the Instance into its configured backup store
    pub async fn run_backup(
        &self,
        namespace: &str,
        instance: &str,
        now: DateTime<Utc>,
    ) -> Result<String, JobError> {
        let inst = self.instance(namespace, instance).await?;
        let store = inst
            .spec
            .backup
            .as_ref()
            .map(|b| b.store.clone())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| JobError::NoBackupStore(instance.to_string()))?;

        let name = backup_name(instance, now);
        let backup = Backup {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(namespace.to_string()),
                labels: Some(
                    [(INSTANCE_LABEL_KEY.to_string(), instance.to_string())]
                        .into_iter()
                        .collect(),
                ),
                owner_references: owner_reference(&inst).map(|o| vec![o]),
                ..Default::default()
            },
            spec: BackupSpec {
                instance: instance.to_string(),
                store,
                location: None,
            },
            status: None,
        };
        self.store.create_backup(namespace, &backup).await?;
        info!(instance, backup = %name, "backup created");
        Ok(name)
    }

    /// Open a maintenance window and schedule its end.
    ///
    /// Returns the window's end time.
    pub async fn start_maintenance(
        &self,
        namespace: &str,
        instance: &str,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, JobError> {
        let inst = self.instance(namespace, instance).await?;
        let crontab = self.crontab.upgrade().ok_or(JobError::SchedulerStopped)?;

        let end = now + inst.spec.maintenance_duration();
        let mut schedule = inst.status.clone().unwrap_or_default().schedule;
        schedule.maintenance_end_time = Some(end);
        crontab.schedule(
            &Owner::new(namespace, instance),
            &mut schedule,
            JobKind::MaintenanceEnd,
            maintenance_end_trigger(end),
            self.job(namespace, instance, JobKind::MaintenanceEnd),
        )?;

        self.store
            .patch_status(
                ResourceKind::Instance,
                namespace,
                instance,
                json!({ "schedule": schedule_patch(&schedule), "maintenanceMode": true }),
            )
            .await?;
        info!(instance, end = %end, "maintenance window started");

        self.notify(
            &inst,
            &format!("Maintenance window for {instance} started, ends at {}", end.to_rfc3339()),
        )
        .await;
        Ok(end)
    }

    /// Close the maintenance window.
    ///
    /// Unless `force` is set, a window whose end time is still in the future
    /// belongs to a newer start and is left alone. Returns whether the window
    /// was closed.
    pub async fn end_maintenance(
        &self,
        namespace: &str,
        instance: &str,
        now: DateTime<Utc>,
        force: bool,
    ) -> Result<bool, JobError> {
        let inst = self.instance(namespace, instance).await?;
        let mut schedule = inst.status.clone().unwrap_or_default().schedule;

        if !force {
            if let Some(end) = schedule.maintenance_end_time.filter(|end| *end > now) {
                debug!(instance, end = %end, "newer maintenance window is open, skipping end");
                return Ok(false);
            }
        }

        if let Some(crontab) = self.crontab.upgrade() {
            crontab.unschedule(
                &Owner::new(namespace, instance),
                &mut schedule,
                JobKind::MaintenanceEnd,
            );
        }
        schedule.maintenance_end_time = None;

        self.store
            .patch_status(
                ResourceKind::Instance,
                namespace,
                instance,
                json!({ "schedule": schedule_patch(&schedule), "maintenanceMode": false }),
            )
            .await?;
        info!(instance, "maintenance window ended");

        self.notify(&inst, &format!("Maintenance window for {instance} ended"))
            .await;
        Ok(true)
    }

    /// Post to the Instance's Chat channel when one is set and ready.
    ///
    /// Failures are logged only.
    pub async fn notify(&self, instance: &Instance, text: &str) {
        let Some(chat_name) = instance.spec.chat_ref.as_deref() else {
            return;
        };
        let namespace = instance.metadata.namespace.as_deref().unwrap_or("default");
        let chat = match self.store.get_chat(namespace, chat_name).await {
            Ok(Some(chat)) if Managed::is_ready(&chat) => chat,
            Ok(_) => {
                debug!(chat = chat_name, "chat missing or not ready, skipping notification");
                return;
            }
            Err(e) => {
                warn!(chat = chat_name, error = %e, "failed to read chat");
                return;
            }
        };
        if let Err(e) = self.notifier.post(&chat.spec.channel, text).await {
            warn!(
                chat = chat_name,
                channel = %chat.spec.channel,
                error = %e,
                "notification failed"
            );
        }
    }

    async fn fire(&self, namespace: &str, instance: &str, kind: JobKind) {
        let now = Utc::now();
        let result = match kind {
            JobKind::Backup => self.run_backup(namespace, instance, now).await.map(|_| ()),
            JobKind::MaintenanceStart => self
                .start_maintenance(namespace, instance, now)
                .await
                .map(|_| ()),
            JobKind::MaintenanceEnd => self
                .end_maintenance(namespace, instance, now, false)
                .await
                .map(|_| ()),
        };
        match result {
            Ok(()) => {}
            Err(JobError::InstanceNotFound(_)) => {
                info!(instance, namespace, %kind, "instance is gone, dropping its jobs");
                if let Some(crontab) = self.crontab.upgrade() {
                    crontab.forget(&Owner::new(namespace, instance));
                }
            }
            Err(e) => {
                warn!(instance, namespace, %kind, error = %e, "scheduled job failed");
            }
        }
    }
}

impl JobFactory for Jobs {
    fn job(&self, namespace: &str, instance: &str, kind: JobKind) -> Job {
        let jobs = self.clone();
        let namespace = namespace.to_string();
        let instance = instance.to_string();
        Arc::new(move || {
            let jobs = jobs.clone();
            let namespace = namespace.clone();
            let instance = instance.clone();
            async move { jobs.fire(&namespace, &instance, kind).await }.boxed()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crontab::{Incarnation, Trigger};
    use crate::notify::MockNotificationSink;
    use crate::store::MockResourceStore;
    use mockall::predicate::eq;
    use std::sync::Mutex;
    use strata_common::crd::{
        BackupScheduleSpec, Chat, ChatReason, ChatSpec, ChatStatus, Condition, InstanceSpec,
        InstanceStatus, MaintenanceSpec, ScheduleStatus,
    };
    use uuid::Uuid;

    fn instance(chat: Option<&str>) -> Instance {
        let mut inst = Instance::new(
            "pg-main",
            InstanceSpec {
                image: "postgres:16".to_string(),
                storage_size: "10Gi".to_string(),
                credentials_secret: "creds".to_string(),
                restore: None,
                backup: Some(BackupScheduleSpec {
                    schedule: "0 2 * * *".to_string(),
                    store: "s3-prod".to_string(),
                }),
                maintenance: Some(MaintenanceSpec {
                    schedule: "0 4 * * SUN".to_string(),
                    duration_minutes: 30,
                }),
                chat_ref: chat.map(str::to_string),
            },
        );
        inst.metadata.namespace = Some("data".to_string());
        inst.metadata.uid = Some("uid-1".to_string());
        inst
    }

    fn ready_chat() -> Chat {
        let mut chat = Chat::new(
            "ops",
            ChatSpec {
                channel: "ops-alerts".to_string(),
            },
        );
        chat.status = Some(ChatStatus {
            conditions: vec![Condition::for_reason(ChatReason::Connected, "ok", Utc::now())],
        });
        chat
    }

    fn crontab() -> Arc<Crontab> {
        Arc::new(Crontab::with_incarnation(Incarnation::from_uuid(Uuid::from_u128(1))))
    }

    fn quiet_notifier() -> Arc<dyn NotificationSink> {
        let mut notifier = MockNotificationSink::new();
        notifier.expect_post().never();
        Arc::new(notifier)
    }

    #[test]
    fn backup_names_carry_a_timestamp() {
        let at = DateTime::parse_from_rfc3339("2026-10-18T02:00:05Z")
            .expect("time")
            .with_timezone(&Utc);
        assert_eq!(backup_name("pg-main", at), "pg-main-20261018020005");
    }

    #[tokio::test]
    async fn backup_job_creates_an_owned_backup() {
        let mut store = MockResourceStore::new();
        store
            .expect_get_instance()
            .with(eq("data"), eq("pg-main"))
            .returning(|_, _| Ok(Some(instance(None))));
        let created = Arc::new(Mutex::new(None));
        let sink = created.clone();
        store.expect_create_backup().times(1).returning(move |_, b| {
            *sink.lock().expect("lock") = Some(b.clone());
            Ok(())
        });

        let crontab = crontab();
        let jobs = Jobs::new(Arc::new(store), quiet_notifier(), &crontab);
        let name = jobs
            .run_backup("data", "pg-main", Utc::now())
            .await
            .expect("backup");

        let backup = created.lock().expect("lock").clone().expect("created");
        assert_eq!(backup.metadata.name.as_deref(), Some(name.as_str()));
        assert_eq!(backup.spec.store, "s3-prod");
        assert_eq!(backup.spec.instance, "pg-main");
        let owners = backup.metadata.owner_references.expect("owner");
        assert_eq!(owners[0].kind, "Instance");
    }

    #[tokio::test]
    async fn backup_job_needs_a_backup_store() {
        let mut store = MockResourceStore::new();
        store.expect_get_instance().returning(|_, _| {
            let mut inst = instance(None);
            inst.spec.backup = None;
            Ok(Some(inst))
        });
        store.expect_create_backup().never();

        let crontab = crontab();
        let jobs = Jobs::new(Arc::new(store), quiet_notifier(), &crontab);
        let err = jobs
            .run_backup("data", "pg-main", Utc::now())
            .await
            .expect_err("no store");
        assert!(matches!(err, JobError::NoBackupStore(_)));
    }

    #[tokio::test]
    async fn start_maintenance_schedules_end_and_notifies() {
        let now = Utc::now();
        let mut store = MockResourceStore::new();
        store
            .expect_get_instance()
            .returning(|_, _| Ok(Some(instance(Some("ops")))));
        store
            .expect_get_chat()
            .with(eq("data"), eq("ops"))
            .returning(|_, _| Ok(Some(ready_chat())));
        let patched = Arc::new(Mutex::new(None));
        let sink = patched.clone();
        store
            .expect_patch_status()
            .times(1)
            .returning(move |kind, _, _, status| {
                assert_eq!(kind, ResourceKind::Instance);
                *sink.lock().expect("lock") = Some(status);
                Ok(())
            });
        let mut notifier = MockNotificationSink::new();
        notifier
            .expect_post()
            .withf(|channel, text| channel == "ops-alerts" && text.contains("started"))
            .times(1)
            .returning(|_, _| Ok(()));

        let crontab = crontab();
        let jobs = Jobs::new(Arc::new(store), Arc::new(notifier), &crontab);
        let end = jobs
            .start_maintenance("data", "pg-main", now)
            .await
            .expect("start");

        assert_eq!(end, now + chrono::Duration::minutes(30));
        let status = patched.lock().expect("lock").clone().expect("patched");
        assert_eq!(status["maintenanceMode"], true);
        let entry_id = status["schedule"]["maintenanceEnd"]["entryId"]
            .as_i64()
            .expect("entry id");
        assert_eq!(
            crontab.engine().trigger(entry_id),
            Some(maintenance_end_trigger(end))
        );
    }

    #[tokio::test]
    async fn end_job_skips_a_newer_window() {
        let now = Utc::now();
        let mut store = MockResourceStore::new();
        store.expect_get_instance().returning(move |_, _| {
            let mut inst = instance(None);
            let mut status = InstanceStatus {
                maintenance_mode: true,
                ..Default::default()
            };
            status.schedule.maintenance_end_time = Some(now + chrono::Duration::minutes(20));
            inst.status = Some(status);
            Ok(Some(inst))
        });
        store.expect_patch_status().never();

        let crontab = crontab();
        let jobs = Jobs::new(Arc::new(store), quiet_notifier(), &crontab);
        let closed = jobs
            .end_maintenance("data", "pg-main", now, false)
            .await
            .expect("end");
        assert!(!closed);
    }

    #[tokio::test]
    async fn forced_end_clears_the_window() {
        let now = Utc::now();
        let crontab = crontab();
        let mut schedule = ScheduleStatus {
            incarnation: crontab.incarnation().to_string(),
            ..Default::default()
        };
        let job: Job = Arc::new(|| async {}.boxed());
        let end_id = crontab
            .schedule(
                &Owner::new("data", "pg-main"),
                &mut schedule,
                JobKind::MaintenanceEnd,
                Trigger::At(now + chrono::Duration::hours(1)),
                job,
            )
            .expect("schedule");
        schedule.maintenance_end_time = Some(now + chrono::Duration::minutes(59));

        let mut store = MockResourceStore::new();
        let recorded = schedule.clone();
        store.expect_get_instance().returning(move |_, _| {
            let mut inst = instance(None);
            inst.status = Some(InstanceStatus {
                maintenance_mode: true,
                schedule: recorded.clone(),
                ..Default::default()
            });
            Ok(Some(inst))
        });
        store
            .expect_patch_status()
            .withf(|_, _, _, status| {
                status["maintenanceMode"] == false
                    && status["schedule"]["maintenanceEndTime"].is_null()
                    && status["schedule"]["maintenanceEnd"]["entryId"] == -1
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let jobs = Jobs::new(Arc::new(store), quiet_notifier(), &crontab);
        let closed = jobs
            .end_maintenance("data", "pg-main", now, true)
            .await
            .expect("end");

        assert!(closed);
        assert!(!crontab.engine().contains(end_id));
    }

    #[tokio::test]
    async fn missing_instance_fails_the_job() {
        let mut store = MockResourceStore::new();
        store.expect_get_instance().returning(|_, _| Ok(None));
        let crontab = crontab();
        let jobs = Jobs::new(Arc::new(store), quiet_notifier(), &crontab);
        let err = jobs
            .start_maintenance("data", "pg-main", Utc::now())
            .await
            .expect_err("missing");
        assert!(matches!(err, JobError::InstanceNotFound(_)));
    }

    #[tokio::test]
    async fn job_of_a_deleted_instance_drops_its_entries() {
        let mut store = MockResourceStore::new();
        store.expect_get_instance().returning(|_, _| Ok(None));
        store.expect_create_backup().never();

        let crontab = crontab();
        let owner = Owner::new("data", "pg-main");
        let mut schedule = ScheduleStatus::default();
        let job: Job = Arc::new(|| async {}.boxed());
        for (kind, expression) in [(JobKind::Backup, "0 2 * * *"), (JobKind::MaintenanceStart, "0 4 * * SUN")] {
            crontab
                .schedule(&owner, &mut schedule, kind, Trigger::Cron(expression.to_string()), job.clone())
                .expect("schedule");
        }
        let neighbour = crontab
            .schedule(
                &Owner::new("data", "pg-replica"),
                &mut ScheduleStatus::default(),
                JobKind::Backup,
                Trigger::Cron("0 3 * * *".to_string()),
                job,
            )
            .expect("schedule");

        let jobs = Jobs::new(Arc::new(store), quiet_notifier(), &crontab);
        jobs.fire("data", "pg-main", JobKind::Backup).await;

        assert_eq!(crontab.engine().len(), 1);
        assert!(crontab.engine().contains(neighbour));
        assert_eq!(crontab.live_entry(&owner, JobKind::MaintenanceStart), None);
    }
}
