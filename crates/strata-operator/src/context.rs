//! Shared controller context
//!
//! One [`Context`] is built at startup and handed to every controller. All
//! collaborators are trait objects so controllers can be driven by mocks.

use std::collections::BTreeMap;
use std::sync::Arc;

use kube::Client;

use strata_common::events::{EventPublisher, KubeEventPublisher};
use strata_common::{BackoffTable, Error};

use crate::agent_client::{AgentConnector, HttpAgentConnector};
use crate::crontab::{Crontab, Jobs};
use crate::notify::{NotificationSink, WebhookNotifier};
use crate::store::{KubeStore, ResourceStore};
use crate::workload::WorkloadConfig;

/// Name events are reported under
pub const CONTROLLER_NAME: &str = "strata-operator";

/// Collaborators shared by all controllers
pub struct Context {
    /// Cluster reads and status writes
    pub store: Arc<dyn ResourceStore>,
    /// Agent clients
    pub agents: Arc<dyn AgentConnector>,
    /// Chat delivery
    pub notifier: Arc<dyn NotificationSink>,
    /// Kubernetes Events for condition transitions
    pub events: Arc<dyn EventPublisher>,
    /// Recurring jobs
    pub crontab: Arc<Crontab>,
    /// Job bodies bound to this context's store and notifier
    pub jobs: Jobs,
    /// Requeue delays for persisting transient reasons
    pub backoff: BackoffTable,
    /// Instance workload settings
    pub workload: WorkloadConfig,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Context over mocks, with a fixed crontab incarnation and no events
    #[cfg(test)]
    pub fn for_testing(
        store: Arc<dyn ResourceStore>,
        agents: Arc<dyn AgentConnector>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        use crate::crontab::Incarnation;
        use strata_common::events::NoopEventPublisher;

        let crontab = Arc::new(Crontab::with_incarnation(Incarnation::from_uuid(
            uuid::Uuid::nil(),
        )));
        let jobs = Jobs::new(store.clone(), notifier.clone(), &crontab);
        Self {
            store,
            agents,
            notifier,
            events: Arc::new(NoopEventPublisher),
            crontab,
            jobs,
            backoff: BackoffTable::default(),
            workload: WorkloadConfig::default(),
        }
    }
}

/// Builder for [`Context`]
pub struct ContextBuilder {
    client: Client,
    store: Option<Arc<dyn ResourceStore>>,
    agents: Option<Arc<dyn AgentConnector>>,
    notifier: Option<Arc<dyn NotificationSink>>,
    events: Option<Arc<dyn EventPublisher>>,
    channels: BTreeMap<String, String>,
    backoff: BackoffTable,
    workload: WorkloadConfig,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            store: None,
            agents: None,
            notifier: None,
            events: None,
            channels: BTreeMap::new(),
            backoff: BackoffTable::default(),
            workload: WorkloadConfig::default(),
        }
    }

    /// Override the resource store
    pub fn store(mut self, store: Arc<dyn ResourceStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Override the agent connector
    pub fn agents(mut self, agents: Arc<dyn AgentConnector>) -> Self {
        self.agents = Some(agents);
        self
    }

    /// Override the notification sink
    pub fn notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Override the event publisher
    pub fn events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Webhook channels for the default notifier
    pub fn channels(mut self, channels: BTreeMap<String, String>) -> Self {
        self.channels = channels;
        self
    }

    /// Port agents listen on
    pub fn agent_port(mut self, port: u16) -> Self {
        self.workload.agent_port = port;
        self
    }

    /// Agent sidecar image
    pub fn agent_image(mut self, image: impl Into<String>) -> Self {
        self.workload.agent_image = image.into();
        self
    }

    /// Requeue backoff table
    pub fn backoff(mut self, backoff: BackoffTable) -> Self {
        self.backoff = backoff;
        self
    }

    /// Build the context, constructing defaults for anything not overridden
    pub fn build(self) -> Result<Context, Error> {
        let store: Arc<dyn ResourceStore> = match self.store {
            Some(store) => store,
            None => Arc::new(KubeStore::new(self.client.clone())),
        };
        let agents: Arc<dyn AgentConnector> = match self.agents {
            Some(agents) => agents,
            None => Arc::new(
                HttpAgentConnector::new()
                    .map_err(|e| Error::internal_with_context("agent", e.to_string()))?,
            ),
        };
        let notifier: Arc<dyn NotificationSink> = match self.notifier {
            Some(notifier) => notifier,
            None => Arc::new(
                WebhookNotifier::new(self.channels)
                    .map_err(|e| Error::internal_with_context("notify", e.to_string()))?,
            ),
        };
        let events = self
            .events
            .unwrap_or_else(|| Arc::new(KubeEventPublisher::new(self.client, CONTROLLER_NAME)));

        let crontab = Arc::new(Crontab::new());
        let jobs = Jobs::new(store.clone(), notifier.clone(), &crontab);

        Ok(Context {
            store,
            agents,
            notifier,
            events,
            crontab,
            jobs,
            backoff: self.backoff,
            workload: self.workload,
        })
    }
}
