//! Instance workload generation
//!
//! An Instance runs as a single-replica StatefulSet: the database container
//! plus the management agent as a sidecar, fronted by a headless Service so
//! pod `<instance>-0` has a stable identity.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, EnvVarSource, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PodSpec, PodTemplateSpec, SecretKeySelector, Service,
    ServicePort, ServiceSpec, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::ResourceExt;

use strata_common::crd::Instance;
use strata_common::kube_utils::owner_reference;
use strata_common::{
    DEFAULT_AGENT_PORT, INSTANCE_LABEL_KEY, LABEL_MANAGED_BY, LABEL_MANAGED_BY_STRATA,
};

/// Port the database listens on
pub const DATABASE_PORT: u16 = 5432;

/// Key holding the superuser password in the credentials Secret
pub const PASSWORD_KEY: &str = "password";

const DATA_VOLUME: &str = "data";
const DATA_MOUNT_PATH: &str = "/var/lib/postgresql/data";

/// Images and ports used for generated workloads
#[derive(Clone, Debug)]
pub struct WorkloadConfig {
    /// Agent sidecar image
    pub agent_image: String,
    /// Port the agent listens on
    pub agent_port: u16,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            agent_image: "ghcr.io/strata-dev/strata-agent:latest".to_string(),
            agent_port: DEFAULT_AGENT_PORT,
        }
    }
}

/// Backup the agent restores before the database first starts
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RestoreSource {
    /// Storage backend registry key
    pub backend: String,
    /// Bucket holding the backup
    pub bucket: String,
    /// Object location, store prefix already applied
    pub location: String,
    /// Backend settings
    pub variables: BTreeMap<String, String>,
}

/// Everything applied for one Instance
#[derive(Clone, Debug)]
pub struct InstanceWorkload {
    /// Name shared by the StatefulSet and Service
    pub name: String,
    /// Database + agent StatefulSet
    pub stateful_set: StatefulSet,
    /// Headless Service
    pub service: Service,
}

fn labels(instance: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (INSTANCE_LABEL_KEY.to_string(), instance.to_string()),
        (
            LABEL_MANAGED_BY.to_string(),
            LABEL_MANAGED_BY_STRATA.to_string(),
        ),
    ])
}

fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

fn secret_env(name: &str, secret: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: secret.to_string(),
                key: key.to_string(),
                optional: Some(false),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn agent_env(
    instance: &Instance,
    config: &WorkloadConfig,
    restore: Option<&RestoreSource>,
) -> Vec<EnvVar> {
    let mut vars = vec![
        env("STRATA_AGENT_LISTEN", format!("0.0.0.0:{}", config.agent_port)),
        env("PGHOST", "127.0.0.1"),
        env("PGPORT", DATABASE_PORT.to_string()),
        env("PGUSER", "postgres"),
        secret_env("PGPASSWORD", &instance.spec.credentials_secret, PASSWORD_KEY),
    ];
    if let Some(restore) = restore {
        vars.push(env("STRATA_RESTORE_BACKEND", restore.backend.clone()));
        vars.push(env("STRATA_RESTORE_BUCKET", restore.bucket.clone()));
        vars.push(env("STRATA_RESTORE_LOCATION", restore.location.clone()));
        if !restore.variables.is_empty() {
            let encoded = serde_json::to_string(&restore.variables).unwrap_or_default();
            vars.push(env("STRATA_RESTORE_VARIABLES", encoded));
        }
    }
    vars
}

/// Build the StatefulSet and headless Service for an Instance
pub fn build_workload(
    instance: &Instance,
    config: &WorkloadConfig,
    restore: Option<&RestoreSource>,
) -> InstanceWorkload {
    let name = instance.name_any();
    let namespace = instance.namespace();
    let owner = owner_reference(instance).map(|o| vec![o]);

    let meta = ObjectMeta {
        name: Some(name.clone()),
        namespace: namespace.clone(),
        labels: Some(labels(&name)),
        owner_references: owner,
        ..Default::default()
    };

    let database = Container {
        name: "database".to_string(),
        image: Some(instance.spec.image.clone()),
        ports: Some(vec![ContainerPort {
            name: Some("postgres".to_string()),
            container_port: i32::from(DATABASE_PORT),
            ..Default::default()
        }]),
        env: Some(vec![secret_env(
            "POSTGRES_PASSWORD",
            &instance.spec.credentials_secret,
            PASSWORD_KEY,
        )]),
        volume_mounts: Some(vec![VolumeMount {
            name: DATA_VOLUME.to_string(),
            mount_path: DATA_MOUNT_PATH.to_string(),
            ..Default::default()
        }]),
        ..Default::default()
    };

    let agent = Container {
        name: "agent".to_string(),
        image: Some(config.agent_image.clone()),
        ports: Some(vec![ContainerPort {
            name: Some("agent".to_string()),
            container_port: i32::from(config.agent_port),
            ..Default::default()
        }]),
        env: Some(agent_env(instance, config, restore)),
        ..Default::default()
    };

    let stateful_set = StatefulSet {
        metadata: meta.clone(),
        spec: Some(StatefulSetSpec {
            replicas: Some(1),
            service_name: Some(name.clone()),
            selector: LabelSelector {
                match_labels: Some(labels(&name)),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels(&name)),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![database, agent],
                    ..Default::default()
                }),
            },
            volume_claim_templates: Some(vec![PersistentVolumeClaim {
                metadata: ObjectMeta {
                    name: Some(DATA_VOLUME.to_string()),
                    ..Default::default()
                },
                spec: Some(PersistentVolumeClaimSpec {
                    access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                    resources: Some(VolumeResourceRequirements {
                        requests: Some(BTreeMap::from([(
                            "storage".to_string(),
                            Quantity(instance.spec.storage_size.clone()),
                        )])),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    };

    let service = Service {
        metadata: meta,
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            selector: Some(labels(&name)),
            ports: Some(vec![
                ServicePort {
                    name: Some("postgres".to_string()),
                    port: i32::from(DATABASE_PORT),
                    ..Default::default()
                },
                ServicePort {
                    name: Some("agent".to_string()),
                    port: i32::from(config.agent_port),
                    ..Default::default()
                },
            ]),
            ..Default::default()
        }),
        ..Default::default()
    };

    InstanceWorkload {
        name,
        stateful_set,
        service,
    }
}

/// Name of the Instance's primary pod
pub fn primary_pod_name(instance: &str) -> String {
    format!("{instance}-0")
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_common::crd::{InstanceSpec, RestoreSpec};

    fn instance() -> Instance {
        let mut instance = Instance::new(
            "pg-main",
            InstanceSpec {
                image: "postgres:16".to_string(),
                storage_size: "20Gi".to_string(),
                credentials_secret: "pg-main-credentials".to_string(),
                restore: None,
                backup: None,
                maintenance: None,
                chat_ref: None,
            },
        );
        instance.metadata.namespace = Some("data".to_string());
        instance.metadata.uid = Some("uid-1".to_string());
        instance
    }

    fn agent_container(workload: &InstanceWorkload) -> Container {
        workload
            .stateful_set
            .spec
            .as_ref()
            .and_then(|s| s.template.spec.as_ref())
            .and_then(|p| p.containers.iter().find(|c| c.name == "agent").cloned())
            .expect("agent container")
    }

    #[test]
    fn workload_is_owned_and_labelled() {
        let workload = build_workload(&instance(), &WorkloadConfig::default(), None);
        assert_eq!(workload.name, "pg-main");

        let meta = &workload.stateful_set.metadata;
        assert_eq!(meta.namespace.as_deref(), Some("data"));
        let owners = meta.owner_references.as_ref().expect("owner");
        assert_eq!(owners[0].kind, "Instance");
        assert_eq!(
            meta.labels.as_ref().and_then(|l| l.get(INSTANCE_LABEL_KEY)),
            Some(&"pg-main".to_string())
        );

        let spec = workload.service.spec.as_ref().expect("service spec");
        assert_eq!(spec.cluster_ip.as_deref(), Some("None"));
    }

    #[test]
    fn storage_size_sets_the_claim() {
        let workload = build_workload(&instance(), &WorkloadConfig::default(), None);
        let claims = workload
            .stateful_set
            .spec
            .and_then(|s| s.volume_claim_templates)
            .expect("claims");
        let requests = claims[0]
            .spec
            .as_ref()
            .and_then(|s| s.resources.as_ref())
            .and_then(|r| r.requests.as_ref())
            .expect("requests");
        assert_eq!(requests.get("storage"), Some(&Quantity("20Gi".to_string())));
    }

    #[test]
    fn restore_source_is_passed_to_the_agent() {
        let mut inst = instance();
        inst.spec.restore = Some(RestoreSpec {
            store: "s3-prod".to_string(),
            location: "pg-main/latest.dump".to_string(),
        });
        let restore = RestoreSource {
            backend: "filesystem".to_string(),
            bucket: "backups".to_string(),
            location: "prod/pg-main/latest.dump".to_string(),
            variables: BTreeMap::from([("root".to_string(), "/mnt".to_string())]),
        };
        let workload = build_workload(&inst, &WorkloadConfig::default(), Some(&restore));
        let env = agent_container(&workload).env.expect("env");
        let value = |name: &str| {
            env.iter()
                .find(|e| e.name == name)
                .and_then(|e| e.value.clone())
        };
        assert_eq!(value("STRATA_RESTORE_BACKEND").as_deref(), Some("filesystem"));
        assert_eq!(
            value("STRATA_RESTORE_LOCATION").as_deref(),
            Some("prod/pg-main/latest.dump")
        );
        assert_eq!(
            value("STRATA_RESTORE_VARIABLES").as_deref(),
            Some(r#"{"root":"/mnt"}"#)
        );
    }

    #[test]
    fn no_restore_means_no_restore_env() {
        let workload = build_workload(&instance(), &WorkloadConfig::default(), None);
        let env = agent_container(&workload).env.expect("env");
        assert!(!env.iter().any(|e| e.name.starts_with("STRATA_RESTORE_")));
        assert!(env.iter().any(|e| e.name == "PGPASSWORD" && e.value_from.is_some()));
    }

    #[test]
    fn primary_pod_is_ordinal_zero() {
        assert_eq!(primary_pod_name("pg-main"), "pg-main-0");
    }
}
