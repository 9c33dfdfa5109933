//! Instance controller
//!
//! Every pass first brings the Instance's crontab entries in line with its
//! schedules, whatever the condition says, so recurring jobs survive
//! operator restarts. Provisioning then checks the restore Store and the
//! superuser credentials, applies the StatefulSet and Service, and reports
//! `Available` once the primary pod is ready.

use std::sync::Arc;

use chrono::Utc;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use strata_common::crd::{Instance, InstanceReason, InstanceSpec, ResourceKind, SecretKeyRef};
use strata_common::kube_utils::namespace_or_default;
use strata_common::Error;

use super::{classify, Dependency};
use crate::context::Context;
use crate::converge::{absorbed, apply, Outcome};
use crate::crontab::{schedule_patch, validate_schedule, SchedulerError};
use crate::resolver::{ResolveError, Resolver};
use crate::settings::{secret_password, store_settings, ConfigError};
use crate::workload::{build_workload, RestoreSource, PASSWORD_KEY};

/// Failures provisioning an Instance
#[derive(Debug, Error)]
pub enum InstanceError {
    /// A declared schedule is not a valid cron expression
    #[error(transparent)]
    InvalidSchedule(#[from] SchedulerError),

    /// The restore Store could not be resolved
    #[error("restore store: {0}")]
    RestoreStore(ResolveError),

    /// The restore Store's settings are unusable
    #[error("restore store: {0}")]
    RestoreSettings(ConfigError),

    /// The superuser credentials are unusable
    #[error("credentials: {0}")]
    Credentials(ConfigError),

    /// Applying the workload failed
    #[error("apply failed: {0}")]
    Provision(Error),

    /// Reading workload readiness failed
    #[error(transparent)]
    Lookup(Error),
}

fn validate_schedules(spec: &InstanceSpec) -> Result<(), SchedulerError> {
    for expression in [spec.backup_schedule(), spec.maintenance_schedule()] {
        if !expression.is_empty() {
            validate_schedule(expression)?;
        }
    }
    Ok(())
}

/// Reconcile an Instance
#[instrument(skip(instance, ctx), fields(instance = %instance.name_any()))]
pub async fn reconcile(instance: Arc<Instance>, ctx: Arc<Context>) -> Result<Action, Error> {
    let namespace = namespace_or_default(instance.as_ref());

    match validate_schedules(&instance.spec) {
        Ok(()) => sync_crontab(&instance, &ctx, &namespace).await?,
        Err(e) => warn!(error = %e, "invalid schedule, crontab left untouched"),
    }

    if absorbed(instance.as_ref()) {
        debug!("instance settled");
        return Ok(Action::await_change());
    }

    let result = provision(&instance, &ctx, &namespace).await;
    apply(instance.as_ref(), outcome(&instance, result)?, &ctx).await
}

async fn sync_crontab(instance: &Instance, ctx: &Context, namespace: &str) -> Result<(), Error> {
    let name = instance.name_any();
    let mut status = instance.status.clone().unwrap_or_default();

    let outcome = ctx
        .crontab
        .reconcile_all(namespace, &name, &instance.spec, &mut status, Utc::now(), &ctx.jobs)
        .map_err(|e| Error::internal_with_context("crontab", e.to_string()))?;
    if !outcome.changed {
        return Ok(());
    }

    let patch = json!({
        "schedule": schedule_patch(&status.schedule),
        "maintenanceMode": status.maintenance_mode,
    });
    match ctx
        .store
        .patch_status(ResourceKind::Instance, namespace, &name, patch)
        .await
    {
        Ok(()) => {}
        Err(e) if e.is_not_found() => return Ok(()),
        Err(e) => return Err(e),
    }
    info!(incarnation = %status.schedule.incarnation, "crontab entries recorded");

    if outcome.maintenance_cleared {
        ctx.jobs
            .notify(instance, &format!("Maintenance window for {name} ended"))
            .await;
    }
    Ok(())
}

/// Apply the workload; returns whether the primary pod is ready
async fn provision(
    instance: &Instance,
    ctx: &Context,
    namespace: &str,
) -> Result<bool, InstanceError> {
    validate_schedules(&instance.spec)?;

    let restore = match &instance.spec.restore {
        Some(restore) => {
            let store = Resolver::new(ctx, namespace)
                .store(&restore.store)
                .await
                .map_err(InstanceError::RestoreStore)?;
            let settings = store_settings(ctx.store.as_ref(), namespace, &store)
                .await
                .map_err(InstanceError::RestoreSettings)?;
            Some(RestoreSource {
                backend: settings.backend.as_str().to_string(),
                bucket: settings.bucket,
                location: store.spec.object_location(&restore.location),
                variables: settings.variables,
            })
        }
        None => None,
    };

    let credentials = SecretKeyRef {
        name: instance.spec.credentials_secret.clone(),
        key: PASSWORD_KEY.to_string(),
    };
    secret_password(ctx.store.as_ref(), namespace, &credentials)
        .await
        .map_err(InstanceError::Credentials)?;

    let workload = build_workload(instance, &ctx.workload, restore.as_ref());
    ctx.store
        .apply_workload(namespace, &workload)
        .await
        .map_err(InstanceError::Provision)?;

    ctx.store
        .workload_ready(namespace, &instance.name_any())
        .await
        .map_err(InstanceError::Lookup)
}

fn outcome(
    instance: &Instance,
    result: Result<bool, InstanceError>,
) -> Result<Outcome<InstanceReason>, Error> {
    let outcome = match result {
        Ok(true) => Outcome::new(InstanceReason::Available, "primary pod ready"),
        Ok(false) => Outcome::new(
            InstanceReason::Provisioning,
            format!("waiting for pod {}-0", instance.name_any()),
        ),
        Err(e @ InstanceError::InvalidSchedule(_)) => {
            Outcome::new(InstanceReason::InvalidSpec, e.to_string())
        }
        Err(InstanceError::RestoreStore(e)) => match classify(e)? {
            Dependency::Unavailable(_, message) | Dependency::Unreachable(message) => {
                Outcome::new(InstanceReason::StoreAccessError, message)
            }
        },
        Err(InstanceError::RestoreSettings(ConfigError::Lookup(e)))
        | Err(InstanceError::Credentials(ConfigError::Lookup(e)))
        | Err(InstanceError::Lookup(e)) => return Err(e),
        Err(e @ InstanceError::RestoreSettings(_)) => {
            Outcome::new(InstanceReason::StoreAccessError, e.to_string())
        }
        Err(e @ InstanceError::Credentials(_)) => {
            Outcome::new(InstanceReason::CredentialsError, e.to_string())
        }
        Err(InstanceError::Provision(e)) if e.is_conflict() => return Err(e),
        Err(e @ InstanceError::Provision(_)) => {
            Outcome::new(InstanceReason::ProvisionFailed, e.to_string())
        }
    };
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use strata_common::crd::{
        BackupScheduleSpec, RestoreSpec, Store, StoreReason, StoreSpec, StoreStatus, UNSCHEDULED,
    };
    use uuid::Uuid;

    use crate::agent_client::MockAgentConnector;
    use crate::controller::fixtures::{
        context, history, instance, last_reason, meta, recording_store,
    };
    use crate::store::MockResourceStore;

    fn with_credentials(store: &mut MockResourceStore) {
        store.expect_get_secret().returning(|_, name| {
            Ok((name == "pg-main-credentials").then(|| {
                BTreeMap::from([("password".to_string(), "hunter2".to_string())])
            }))
        });
    }

    #[tokio::test]
    async fn applies_the_workload_and_waits_for_the_pod() {
        let (mut store, patches) = recording_store();
        with_credentials(&mut store);
        store
            .expect_apply_workload()
            .withf(|ns, w| ns == "data" && w.name == "pg-main")
            .times(1)
            .returning(|_, _| Ok(()));
        store.expect_workload_ready().returning(|_, _| Ok(false));

        let ctx = context(store, MockAgentConnector::new());
        reconcile(Arc::new(instance("pg-main", None)), ctx)
            .await
            .expect("reconcile");
        assert_eq!(last_reason(&patches).as_deref(), Some("Provisioning"));
    }

    #[tokio::test]
    async fn ready_pod_makes_the_instance_available() {
        let (mut store, patches) = recording_store();
        with_credentials(&mut store);
        store.expect_apply_workload().returning(|_, _| Ok(()));
        store.expect_workload_ready().returning(|_, _| Ok(true));

        let ctx = context(store, MockAgentConnector::new());
        reconcile(
            Arc::new(instance("pg-main", Some(InstanceReason::Provisioning))),
            ctx,
        )
        .await
        .expect("reconcile");
        assert_eq!(last_reason(&patches).as_deref(), Some("Available"));
    }

    #[tokio::test]
    async fn invalid_schedule_is_a_spec_error() {
        let (mut store, patches) = recording_store();
        store.expect_apply_workload().never();

        let mut inst = instance("pg-main", None);
        inst.spec.backup = Some(BackupScheduleSpec {
            schedule: "every night".to_string(),
            store: "backups".to_string(),
        });
        let ctx = context(store, MockAgentConnector::new());
        reconcile(Arc::new(inst), ctx).await.expect("reconcile");

        assert_eq!(last_reason(&patches).as_deref(), Some("InvalidSpec"));
        assert!(no_schedule_written(&patches));
    }

    fn no_schedule_written(patches: &std::sync::Mutex<Vec<serde_json::Value>>) -> bool {
        patches
            .lock()
            .expect("lock")
            .iter()
            .all(|p| p.get("schedule").is_none())
    }

    #[tokio::test]
    async fn restore_waits_for_its_store() {
        let (mut store, patches) = recording_store();
        store.expect_get_store().returning(|_, name| {
            Ok(Some(Store {
                metadata: meta(name),
                spec: StoreSpec {
                    backend: "filesystem".to_string(),
                    bucket: "archive".to_string(),
                    prefix: None,
                    variables: BTreeMap::new(),
                    secret_ref: None,
                },
                status: Some(StoreStatus {
                    conditions: history(Some(StoreReason::Pending)),
                }),
            }))
        });
        store.expect_get_secret().never();
        store.expect_apply_workload().never();

        let mut inst = instance("pg-main", None);
        inst.spec.restore = Some(RestoreSpec {
            store: "backups".to_string(),
            location: "pg-main/2026-10-01.dump".to_string(),
        });
        let ctx = context(store, MockAgentConnector::new());
        reconcile(Arc::new(inst), ctx).await.expect("reconcile");
        assert_eq!(last_reason(&patches).as_deref(), Some("StoreAccessError"));
    }

    #[tokio::test]
    async fn missing_credentials_block_provisioning() {
        let (mut store, patches) = recording_store();
        store.expect_get_secret().returning(|_, _| Ok(None));
        store.expect_apply_workload().never();

        let ctx = context(store, MockAgentConnector::new());
        reconcile(Arc::new(instance("pg-main", None)), ctx)
            .await
            .expect("reconcile");
        assert_eq!(last_reason(&patches).as_deref(), Some("CredentialsError"));
    }

    #[tokio::test]
    async fn apply_failure_is_reported() {
        let (mut store, patches) = recording_store();
        with_credentials(&mut store);
        store
            .expect_apply_workload()
            .returning(|_, _| Err(Error::internal("admission webhook denied")));

        let ctx = context(store, MockAgentConnector::new());
        reconcile(Arc::new(instance("pg-main", None)), ctx)
            .await
            .expect("reconcile");
        assert_eq!(last_reason(&patches).as_deref(), Some("ProvisionFailed"));
    }

    #[tokio::test]
    async fn available_instance_still_gets_its_jobs_installed() {
        let (mut store, patches) = recording_store();
        store.expect_apply_workload().never();

        let mut inst = instance("pg-main", Some(InstanceReason::Available));
        inst.spec.backup = Some(BackupScheduleSpec {
            schedule: "0 2 * * *".to_string(),
            store: "backups".to_string(),
        });
        if let Some(status) = inst.status.as_mut() {
            status.schedule.incarnation = Uuid::from_u128(0xB).to_string();
            status.schedule.backup.entry_id = 5;
            status.schedule.backup.schedule = "0 2 * * *".to_string();
        }

        let ctx = context(store, MockAgentConnector::new());
        let action = reconcile(Arc::new(inst), ctx.clone())
            .await
            .expect("reconcile");
        assert_eq!(action, Action::await_change());

        let written = patches.lock().expect("lock");
        assert_eq!(written.len(), 1);
        let schedule = &written[0]["schedule"];
        assert_eq!(schedule["incarnation"], Uuid::nil().to_string());
        let entry_id = schedule["backup"]["entryId"].as_i64().expect("entry id");
        assert_ne!(entry_id, 5);
        assert_ne!(entry_id, UNSCHEDULED);
        assert!(ctx.crontab.engine().contains(entry_id));
        assert_eq!(schedule["maintenanceStart"]["entryId"], UNSCHEDULED);
    }

    #[tokio::test]
    async fn corrected_spec_recovers_from_invalid_spec() {
        let (mut store, patches) = recording_store();
        with_credentials(&mut store);
        store.expect_apply_workload().times(1).returning(|_, _| Ok(()));
        store.expect_workload_ready().returning(|_, _| Ok(true));

        let mut inst = instance("pg-main", Some(InstanceReason::InvalidSpec));
        inst.spec.backup = Some(BackupScheduleSpec {
            schedule: "0 2 * * *".to_string(),
            store: "backups".to_string(),
        });
        let ctx = context(store, MockAgentConnector::new());
        reconcile(Arc::new(inst), ctx).await.expect("reconcile");

        assert_eq!(last_reason(&patches).as_deref(), Some("Available"));
    }

    #[tokio::test]
    async fn failed_schedule_writes_never_pile_up_entries() {
        let mut store = MockResourceStore::new();
        store
            .expect_patch_status()
            .times(3)
            .returning(|_, _, _, _| Err(Error::internal("etcd unavailable")));
        store.expect_apply_workload().never();

        let mut inst = instance("pg-main", Some(InstanceReason::Available));
        inst.spec.backup = Some(BackupScheduleSpec {
            schedule: "0 2 * * *".to_string(),
            store: "backups".to_string(),
        });
        let inst = Arc::new(inst);
        let ctx = context(store, MockAgentConnector::new());

        for _ in 0..3 {
            reconcile(inst.clone(), ctx.clone())
                .await
                .expect_err("status write fails");
        }
        assert_eq!(ctx.crontab.engine().len(), 1);
    }
}
