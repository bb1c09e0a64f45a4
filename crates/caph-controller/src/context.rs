//! Shared state of the reconcilers

use std::sync::Arc;
use std::time::Duration;

use kube::{Client, ResourceExt};

use caph_common::events::{EventPublisher, KubeEventPublisher, NoopEventPublisher};
use caph_common::rate_limit::{RateLimitGate, DEFAULT_RATE_LIMIT_WAIT};
use caph_common::crd::HetznerCluster;
use caph_common::{Error, Result};

use crate::hcloud::{ComputeApi, ComputeApiFactory, HCloudClientFactory, DEFAULT_ENDPOINT};
use crate::secrets::{token_from_secret, SecretHolder, SecretKey, SecretManager};
use crate::store::{KubeObjectStore, ObjectStore};
use crate::target_cluster::{KubeWorkloadConnector, TargetClusterRegistry, WorkloadConnector};

/// Name events are reported under
pub const CONTROLLER_NAME: &str = "caph-controller";

/// Cloud API access resolved from a cluster's secret
pub struct Credentials {
    /// The token as read from the secret
    pub token: String,
    /// Client authenticated with the token
    pub api: Arc<dyn ComputeApi>,
}

/// Controller context injected into every reconcile
pub struct Context {
    /// Kubernetes objects of the management cluster
    pub store: Arc<dyn ObjectStore>,
    /// Event sink
    pub events: Arc<dyn EventPublisher>,
    /// Builds cloud API clients from tokens
    pub compute: Arc<dyn ComputeApiFactory>,
    /// Reference counting of credential secrets
    pub secrets: SecretManager,
    /// Managers running against workload clusters
    pub registry: Arc<TargetClusterRegistry>,
    /// Connects to workload clusters
    pub connector: Arc<dyn WorkloadConnector>,
    /// Backoff after rate-limited cloud calls
    pub rate_limit: RateLimitGate,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Create a context for testing with custom implementations
    ///
    /// Events are dropped and the rate-limit wait is the default.
    pub fn for_testing(
        store: Arc<dyn ObjectStore>,
        compute: Arc<dyn ComputeApiFactory>,
        connector: Arc<dyn WorkloadConnector>,
    ) -> Self {
        Self {
            secrets: SecretManager::new(store.clone()),
            store,
            events: Arc::new(NoopEventPublisher),
            compute,
            registry: Arc::new(TargetClusterRegistry::new()),
            connector,
            rate_limit: RateLimitGate::default(),
        }
    }

    /// Resolve the cloud credentials referenced by `cluster`
    ///
    /// With `register` the cluster is recorded as a holder of the secret so
    /// the secret outlives it.
    pub async fn credentials(&self, cluster: &HetznerCluster, register: bool) -> Result<Credentials> {
        let secret_ref = &cluster.spec.hetzner_secret_ref;
        let key = SecretKey::new(cluster.namespace().unwrap_or_default(), &secret_ref.name);
        let holder = SecretHolder::of(cluster);
        let secret = self
            .secrets
            .acquire_secret(&key, &holder, true, register)
            .await?
            .ok_or_else(|| Error::SecretUnreachable {
                namespace: key.namespace.clone(),
                name: key.name.clone(),
                message: "secret not found".to_string(),
            })?;
        let token = token_from_secret(&secret, &key, &secret_ref.key.hcloud_token)?;
        let api = self.compute.for_token(&token);
        Ok(Credentials { token, api })
    }
}

/// Builder for constructing [`Context`] instances
///
/// ```text
/// let ctx = Context::builder(client)
///     .hcloud_endpoint("https://api.hetzner.cloud/v1")
///     .rate_limit_wait(Duration::from_secs(300))
///     .build()?;
/// ```
pub struct ContextBuilder {
    client: Client,
    store: Option<Arc<dyn ObjectStore>>,
    events: Option<Arc<dyn EventPublisher>>,
    compute: Option<Arc<dyn ComputeApiFactory>>,
    registry: Option<Arc<TargetClusterRegistry>>,
    hcloud_endpoint: String,
    rate_limit_wait: Duration,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            store: None,
            events: None,
            compute: None,
            registry: None,
            hcloud_endpoint: DEFAULT_ENDPOINT.to_string(),
            rate_limit_wait: DEFAULT_RATE_LIMIT_WAIT,
        }
    }

    /// Override the object store
    pub fn store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Override the event publisher
    pub fn events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Override the cloud client factory
    pub fn compute(mut self, compute: Arc<dyn ComputeApiFactory>) -> Self {
        self.compute = Some(compute);
        self
    }

    /// Share a target cluster registry between controllers
    pub fn registry(mut self, registry: Arc<TargetClusterRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Base URL of the cloud API
    pub fn hcloud_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.hcloud_endpoint = endpoint.into();
        self
    }

    /// How long to stay away from the API after a rate-limit response
    pub fn rate_limit_wait(mut self, wait: Duration) -> Self {
        self.rate_limit_wait = wait;
        self
    }

    /// Build the context
    pub fn build(self) -> Result<Context> {
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(KubeObjectStore::new(self.client.clone())));
        let events = self.events.unwrap_or_else(|| {
            Arc::new(KubeEventPublisher::new(self.client.clone(), CONTROLLER_NAME))
        });
        let compute = match self.compute {
            Some(compute) => compute,
            None => Arc::new(HCloudClientFactory::new(self.hcloud_endpoint)?),
        };
        Ok(Context {
            secrets: SecretManager::new(store.clone()),
            connector: Arc::new(KubeWorkloadConnector::new(store.clone(), events.clone())),
            store,
            events,
            compute,
            registry: self
                .registry
                .unwrap_or_else(|| Arc::new(TargetClusterRegistry::new())),
            rate_limit: RateLimitGate::new(self.rate_limit_wait),
        })
    }
}
