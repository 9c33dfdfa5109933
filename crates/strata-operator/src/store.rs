//! Resource store abstraction
//!
//! Controllers and jobs read and write cluster state only through
//! [`ResourceStore`], so tests can drive them with a mock and count exactly
//! which lookups a convergence pass performed.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Pod, Secret, Service};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use strata_common::crd::{
    Backup, Chat, Database, Grant, Instance, Operation, ResourceKind, Store, User,
};
use strata_common::kube_utils::{get_optional, patch_resource_status, secret_string_data};
use strata_common::{Error, FIELD_MANAGER};

use crate::workload::InstanceWorkload;

/// Reads and writes the cluster state the controllers depend on
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Get an Instance, `None` when absent
    async fn get_instance(&self, namespace: &str, name: &str) -> Result<Option<Instance>, Error>;

    /// Get a Store, `None` when absent
    async fn get_store(&self, namespace: &str, name: &str) -> Result<Option<Store>, Error>;

    /// Get a User, `None` when absent
    async fn get_user(&self, namespace: &str, name: &str) -> Result<Option<User>, Error>;

    /// Get a Database, `None` when absent
    async fn get_database(&self, namespace: &str, name: &str) -> Result<Option<Database>, Error>;

    /// Get a Chat, `None` when absent
    async fn get_chat(&self, namespace: &str, name: &str) -> Result<Option<Chat>, Error>;

    /// Decoded data of a Secret, `None` when absent
    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>, Error>;

    /// Create a Backup resource
    async fn create_backup(&self, namespace: &str, backup: &Backup) -> Result<(), Error>;

    /// Merge-patch the status sub-resource of a managed resource
    async fn patch_status(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
        status: serde_json::Value,
    ) -> Result<(), Error>;

    /// Server-side apply an Instance's StatefulSet and headless Service
    async fn apply_workload(&self, namespace: &str, workload: &InstanceWorkload)
        -> Result<(), Error>;

    /// Whether the Instance's StatefulSet reports a ready replica
    async fn workload_ready(&self, namespace: &str, instance: &str) -> Result<bool, Error>;

    /// IP of a pod, `None` when the pod is absent or has no IP yet
    async fn pod_ip(&self, namespace: &str, pod: &str) -> Result<Option<String>, Error>;
}

/// Kubernetes-backed [`ResourceStore`]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    /// Create a store over the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ResourceStore for KubeStore {
    async fn get_instance(&self, namespace: &str, name: &str) -> Result<Option<Instance>, Error> {
        get_optional(&self.client, namespace, name).await
    }

    async fn get_store(&self, namespace: &str, name: &str) -> Result<Option<Store>, Error> {
        get_optional(&self.client, namespace, name).await
    }

    async fn get_user(&self, namespace: &str, name: &str) -> Result<Option<User>, Error> {
        get_optional(&self.client, namespace, name).await
    }

    async fn get_database(&self, namespace: &str, name: &str) -> Result<Option<Database>, Error> {
        get_optional(&self.client, namespace, name).await
    }

    async fn get_chat(&self, namespace: &str, name: &str) -> Result<Option<Chat>, Error> {
        get_optional(&self.client, namespace, name).await
    }

    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>, Error> {
        let secret: Option<Secret> = get_optional(&self.client, namespace, name).await?;
        Ok(secret.as_ref().map(secret_string_data))
    }

    async fn create_backup(&self, namespace: &str, backup: &Backup) -> Result<(), Error> {
        let api: Api<Backup> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), backup).await?;
        Ok(())
    }

    async fn patch_status(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
        status: serde_json::Value,
    ) -> Result<(), Error> {
        let client = &self.client;
        match kind {
            ResourceKind::Instance => {
                patch_resource_status::<Instance>(client, name, namespace, &status, FIELD_MANAGER)
                    .await
            }
            ResourceKind::Store => {
                patch_resource_status::<Store>(client, name, namespace, &status, FIELD_MANAGER)
                    .await
            }
            ResourceKind::User => {
                patch_resource_status::<User>(client, name, namespace, &status, FIELD_MANAGER)
                    .await
            }
            ResourceKind::Database => {
                patch_resource_status::<Database>(client, name, namespace, &status, FIELD_MANAGER)
                    .await
            }
            ResourceKind::Grant => {
                patch_resource_status::<Grant>(client, name, namespace, &status, FIELD_MANAGER)
                    .await
            }
            ResourceKind::Backup => {
                patch_resource_status::<Backup>(client, name, namespace, &status, FIELD_MANAGER)
                    .await
            }
            ResourceKind::Operation => {
                patch_resource_status::<Operation>(
                    client,
                    name,
                    namespace,
                    &status,
                    FIELD_MANAGER,
                )
                .await
            }
            ResourceKind::Chat => {
                patch_resource_status::<Chat>(client, name, namespace, &status, FIELD_MANAGER)
                    .await
            }
        }
    }

    async fn apply_workload(
        &self,
        namespace: &str,
        workload: &InstanceWorkload,
    ) -> Result<(), Error> {
        let params = PatchParams::apply(FIELD_MANAGER).force();

        let services: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        services
            .patch(&workload.name, &params, &Patch::Apply(&workload.service))
            .await?;

        let sets: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        sets.patch(&workload.name, &params, &Patch::Apply(&workload.stateful_set))
            .await?;

        debug!(instance = %workload.name, namespace, "applied instance workload");
        Ok(())
    }

    async fn workload_ready(&self, namespace: &str, instance: &str) -> Result<bool, Error> {
        let set: Option<StatefulSet> = get_optional(&self.client, namespace, instance).await?;
        Ok(set
            .and_then(|s| s.status)
            .and_then(|s| s.ready_replicas)
            .is_some_and(|ready| ready >= 1))
    }

    async fn pod_ip(&self, namespace: &str, pod: &str) -> Result<Option<String>, Error> {
        let pod: Option<Pod> = get_optional(&self.client, namespace, pod).await?;
        Ok(pod
            .and_then(|p| p.status)
            .and_then(|s| s.pod_ip)
            .filter(|ip| !ip.is_empty()))
    }
}
