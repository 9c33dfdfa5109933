//! Dependency resolution
//!
//! Lookups fail closed: a referenced resource that is absent is
//! [`ResolveError::NotFound`], one that has not reached its terminal success
//! reason is [`ResolveError::NotReady`]. Only ready resources are handed to
//! the caller.

use std::sync::Arc;

use thiserror::Error;
use tracing::trace;

use strata_common::crd::{Chat, Database, Instance, Managed, ResourceKind, Store, User};
use strata_common::Error;

use crate::agent_client::{AgentClient, AgentConnector};
use crate::context::Context;
use crate::store::ResourceStore;
use crate::workload::primary_pod_name;

/// Failures resolving a dependency
#[derive(Debug, Error)]
pub enum ResolveError {
    /// The referenced resource does not exist
    #[error("{kind} {name} not found")]
    NotFound {
        /// Kind looked up
        kind: ResourceKind,
        /// Name looked up
        name: String,
    },

    /// The referenced resource exists but is not ready
    #[error("{kind} {name} is not ready")]
    NotReady {
        /// Kind looked up
        kind: ResourceKind,
        /// Name looked up
        name: String,
    },

    /// The Instance's primary pod is missing or has no address
    #[error("pod {0} not found or has no address")]
    PodNotFound(String),

    /// The lookup itself failed
    #[error(transparent)]
    Lookup(#[from] Error),
}

fn require_ready<K: Managed>(name: &str, found: Option<K>) -> Result<K, ResolveError> {
    match found {
        None => Err(ResolveError::NotFound {
            kind: K::KIND,
            name: name.to_string(),
        }),
        Some(resource) if !Managed::is_ready(&resource) => Err(ResolveError::NotReady {
            kind: K::KIND,
            name: name.to_string(),
        }),
        Some(resource) => Ok(resource),
    }
}

/// Read-only dependency lookups within one namespace
pub struct Resolver<'a> {
    store: &'a dyn ResourceStore,
    agents: &'a dyn AgentConnector,
    namespace: &'a str,
    agent_port: u16,
}

impl<'a> Resolver<'a> {
    /// Resolver over the context's store and agent connector
    pub fn new(ctx: &'a Context, namespace: &'a str) -> Self {
        Self {
            store: ctx.store.as_ref(),
            agents: ctx.agents.as_ref(),
            namespace,
            agent_port: ctx.workload.agent_port,
        }
    }

    /// Namespace lookups happen in
    pub fn namespace(&self) -> &str {
        self.namespace
    }

    /// A ready Store
    pub async fn store(&self, name: &str) -> Result<Store, ResolveError> {
        let found = self.store.get_store(self.namespace, name).await?;
        require_ready(name, found)
    }

    /// A ready Instance
    pub async fn instance(&self, name: &str) -> Result<Instance, ResolveError> {
        let found = self.store.get_instance(self.namespace, name).await?;
        require_ready(name, found)
    }

    /// A ready User
    pub async fn user(&self, name: &str) -> Result<User, ResolveError> {
        let found = self.store.get_user(self.namespace, name).await?;
        require_ready(name, found)
    }

    /// A ready Database
    pub async fn database(&self, name: &str) -> Result<Database, ResolveError> {
        let found = self.store.get_database(self.namespace, name).await?;
        require_ready(name, found)
    }

    /// A ready Chat
    pub async fn chat(&self, name: &str) -> Result<Chat, ResolveError> {
        let found = self.store.get_chat(self.namespace, name).await?;
        require_ready(name, found)
    }

    /// Agent client for a ready Instance's primary pod
    pub async fn client_for(&self, instance: &str) -> Result<Arc<dyn AgentClient>, ResolveError> {
        self.instance(instance).await?;
        self.client_for_pod(instance).await
    }

    /// Agent client for an Instance already known to be ready
    pub async fn client_for_pod(
        &self,
        instance: &str,
    ) -> Result<Arc<dyn AgentClient>, ResolveError> {
        let pod = primary_pod_name(instance);
        let ip = self
            .store
            .pod_ip(self.namespace, &pod)
            .await?
            .ok_or(ResolveError::PodNotFound(pod))?;
        let endpoint = format!("http://{}:{}", ip, self.agent_port);
        trace!(instance, %endpoint, "resolved agent endpoint");
        Ok(self.agents.connect(&endpoint))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_client::{MockAgentClient, MockAgentConnector};
    use crate::notify::MockNotificationSink;
    use crate::store::MockResourceStore;
    use chrono::Utc;
    use mockall::predicate::eq;
    use strata_common::crd::{Condition, InstanceReason, InstanceSpec, InstanceStatus};

    pub(crate) fn instance(name: &str, reason: InstanceReason) -> Instance {
        let mut instance = Instance::new(
            name,
            InstanceSpec {
                image: "postgres:16".to_string(),
                storage_size: "10Gi".to_string(),
                credentials_secret: "creds".to_string(),
                restore: None,
                backup: None,
                maintenance: None,
                chat_ref: None,
            },
        );
        instance.status = Some(InstanceStatus {
            conditions: vec![Condition::for_reason(reason, "", Utc::now())],
            ..Default::default()
        });
        instance
    }

    fn context(store: MockResourceStore, agents: MockAgentConnector) -> Context {
        Context::for_testing(
            Arc::new(store),
            Arc::new(agents),
            Arc::new(MockNotificationSink::new()),
        )
    }

    #[tokio::test]
    async fn absent_and_unready_are_distinguished() {
        let mut store = MockResourceStore::new();
        store.expect_get_instance().returning(|_, name| match name {
            "ready" => Ok(Some(instance(name, InstanceReason::Available))),
            "booting" => Ok(Some(instance(name, InstanceReason::Provisioning))),
            _ => Ok(None),
        });
        let ctx = context(store, MockAgentConnector::new());
        let resolver = Resolver::new(&ctx, "data");

        assert!(resolver.instance("ready").await.is_ok());
        assert!(matches!(
            resolver.instance("booting").await,
            Err(ResolveError::NotReady { kind: ResourceKind::Instance, .. })
        ));
        assert!(matches!(
            resolver.instance("missing").await,
            Err(ResolveError::NotFound { kind: ResourceKind::Instance, .. })
        ));
    }

    #[tokio::test]
    async fn client_for_uses_the_primary_pod_address() {
        let mut store = MockResourceStore::new();
        store
            .expect_get_instance()
            .returning(|_, name| Ok(Some(instance(name, InstanceReason::Available))));
        store
            .expect_pod_ip()
            .with(eq("data"), eq("pg-main-0"))
            .returning(|_, _| Ok(Some("10.0.0.7".to_string())));
        let mut agents = MockAgentConnector::new();
        agents
            .expect_connect()
            .with(eq("http://10.0.0.7:8080"))
            .times(1)
            .returning(|_| Arc::new(MockAgentClient::new()));

        let ctx = context(store, agents);
        let resolver = Resolver::new(&ctx, "data");
        assert!(resolver.client_for("pg-main").await.is_ok());
    }

    #[tokio::test]
    async fn missing_pod_ip_is_pod_not_found() {
        let mut store = MockResourceStore::new();
        store
            .expect_get_instance()
            .returning(|_, name| Ok(Some(instance(name, InstanceReason::Available))));
        store.expect_pod_ip().returning(|_, _| Ok(None));
        let mut agents = MockAgentConnector::new();
        agents.expect_connect().never();

        let ctx = context(store, agents);
        let resolver = Resolver::new(&ctx, "data");
        assert!(matches!(
            resolver.client_for("pg-main").await,
            Err(ResolveError::PodNotFound(pod)) if pod == "pg-main-0"
        ));
    }

    #[tokio::test]
    async fn unready_instance_never_reaches_the_pod() {
        let mut store = MockResourceStore::new();
        store
            .expect_get_instance()
            .returning(|_, name| Ok(Some(instance(name, InstanceReason::Pending))));
        store.expect_pod_ip().never();
        let ctx = context(store, MockAgentConnector::new());
        let resolver = Resolver::new(&ctx, "data");
        assert!(matches!(
            resolver.client_for("pg-main").await,
            Err(ResolveError::NotReady { .. })
        ));
    }

    #[tokio::test]
    async fn lookup_failures_are_surfaced() {
        let mut store = MockResourceStore::new();
        store
            .expect_get_store()
            .returning(|_, _| Err(Error::internal("apiserver unavailable")));
        let ctx = context(store, MockAgentConnector::new());
        let resolver = Resolver::new(&ctx, "data");
        assert!(matches!(
            resolver.store("s3").await,
            Err(ResolveError::Lookup(_))
        ));
    }
}
