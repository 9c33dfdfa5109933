//! Controllers for the eight Strata kinds
//!
//! Each controller exposes `reconcile` and shares the generic
//! [`error_policy`]. A reconcile returns `Err` only for infrastructure
//! failures (lookups, status writes, illegal transitions); everything a
//! user should act on is recorded as a condition reason.

pub mod backup;
pub mod chat;
pub mod database;
pub mod grant;
pub mod instance;
pub mod operation;
pub mod store;
pub mod user;

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, error};

use strata_common::crd::{Managed, ResourceKind};
use strata_common::{Error, REQUEUE_ERROR_SECS};

use crate::agent_client::AgentError;
use crate::context::Context;
use crate::resolver::ResolveError;

/// Requeue delay after a stale-write conflict
const REQUEUE_CONFLICT_SECS: u64 = 1;

/// Requeue policy for reconcile errors of any kind
pub fn error_policy<K: Managed>(resource: Arc<K>, error: &Error, _ctx: Arc<Context>) -> Action {
    if error.is_conflict() {
        debug!(kind = %K::KIND, name = %resource.name_any(), "stale write, retrying");
        return Action::requeue(Duration::from_secs(REQUEUE_CONFLICT_SECS));
    }
    error!(
        ?error,
        kind = %K::KIND,
        name = %resource.name_any(),
        "reconciliation failed"
    );
    Action::requeue(Duration::from_secs(REQUEUE_ERROR_SECS))
}

/// How a dependency failure surfaces for a dependent
pub(crate) enum Dependency {
    /// The dependency of `kind` is missing or unready, with a message
    Unavailable(ResourceKind, String),
    /// The instance is ready but its agent cannot be located
    Unreachable(String),
}

/// Split a resolver error into a reason-worthy failure or a driver error
pub(crate) fn classify(err: ResolveError) -> Result<Dependency, Error> {
    match err {
        ResolveError::Lookup(e) => Err(e),
        ResolveError::PodNotFound(_) => Ok(Dependency::Unreachable(err.to_string())),
        ResolveError::NotFound { kind, .. } | ResolveError::NotReady { kind, .. } => {
            Ok(Dependency::Unavailable(kind, err.to_string()))
        }
    }
}

/// Whether an agent error means the agent was never reached
pub(crate) fn is_access_failure(err: &AgentError) -> bool {
    matches!(err, AgentError::AccessFailed(_))
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! Resource builders shared by controller tests

    use std::sync::{Arc, Mutex};

    use chrono::Utc;
    use kube::core::ObjectMeta;
    use serde_json::Value;

    use strata_common::crd::{
        Condition, Database, DatabaseReason, DatabaseSpec, DatabaseStatus, Instance,
        InstanceReason, InstanceSpec, InstanceStatus, SecretKeyRef, User, UserReason, UserSpec,
        UserStatus,
    };
    use strata_common::Reason;

    use crate::agent_client::{AgentClient, MockAgentClient, MockAgentConnector};
    use crate::context::Context;
    use crate::notify::MockNotificationSink;
    use crate::store::MockResourceStore;

    pub const NAMESPACE: &str = "data";

    pub fn meta(name: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            uid: Some(format!("uid-{name}")),
            ..Default::default()
        }
    }

    pub fn history<R: Reason>(reason: Option<R>) -> Vec<Condition> {
        reason
            .map(|r| vec![Condition::for_reason(r, "", Utc::now())])
            .unwrap_or_default()
    }

    pub fn instance(name: &str, reason: Option<InstanceReason>) -> Instance {
        Instance {
            metadata: meta(name),
            spec: InstanceSpec {
                image: "postgres:16".to_string(),
                storage_size: "10Gi".to_string(),
                credentials_secret: format!("{name}-credentials"),
                restore: None,
                backup: None,
                maintenance: None,
                chat_ref: None,
            },
            status: Some(InstanceStatus {
                conditions: history(reason),
                ..Default::default()
            }),
        }
    }

    pub fn user(name: &str, instance: &str, reason: Option<UserReason>) -> User {
        User {
            metadata: meta(name),
            spec: UserSpec {
                instance: instance.to_string(),
                username: name.to_string(),
                password_secret: SecretKeyRef {
                    name: format!("{name}-password"),
                    key: "password".to_string(),
                },
            },
            status: Some(UserStatus {
                conditions: history(reason),
            }),
        }
    }

    pub fn database(name: &str, instance: &str, reason: Option<DatabaseReason>) -> Database {
        Database {
            metadata: meta(name),
            spec: DatabaseSpec {
                instance: instance.to_string(),
                name: name.to_string(),
            },
            status: Some(DatabaseStatus {
                conditions: history(reason),
            }),
        }
    }

    /// Store mock that records every status patch
    pub fn recording_store() -> (MockResourceStore, Arc<Mutex<Vec<Value>>>) {
        let patches = Arc::new(Mutex::new(Vec::new()));
        let sink = patches.clone();
        let mut store = MockResourceStore::new();
        store
            .expect_patch_status()
            .returning(move |_, _, _, patch| {
                sink.lock().expect("lock").push(patch);
                Ok(())
            });
        (store, patches)
    }

    /// Connector handing out the given client for every endpoint
    pub fn connector(client: MockAgentClient) -> MockAgentConnector {
        let client: Arc<dyn AgentClient> = Arc::new(client);
        let mut agents = MockAgentConnector::new();
        agents
            .expect_connect()
            .returning(move |_| client.clone());
        agents
    }

    pub fn context(store: MockResourceStore, agents: MockAgentConnector) -> Arc<Context> {
        Arc::new(Context::for_testing(
            Arc::new(store),
            Arc::new(agents),
            Arc::new(MockNotificationSink::new()),
        ))
    }

    /// Reason of the condition written by the newest status patch
    pub fn last_reason(patches: &Mutex<Vec<Value>>) -> Option<String> {
        let patches = patches.lock().expect("lock");
        patches
            .last()
            .and_then(|p| p["conditions"].as_array())
            .and_then(|c| c.last())
            .and_then(|c| c["reason"].as_str())
            .map(str::to_string)
    }
}
