//! Connections to workload clusters
//!
//! Once the control plane of a cluster answers, a secondary manager runs
//! against the workload API server to approve kubelet serving certificates.
//! The [`TargetClusterRegistry`] keeps at most one such manager per cluster.
//! Managers are tasks on a shared [`TaskTracker`], each with its own child
//! [`CancellationToken`], so one cluster can be stopped on deletion and all
//! of them on shutdown.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::{Api, Patch, PatchParams};
use kube::core::ObjectMeta;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config, ResourceExt};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use caph_common::conditions::{reasons, types};
use caph_common::crd::{object_key, HetznerCluster};
use caph_common::events::EventPublisher;
use caph_common::{ConditionSeverity, Error, HasConditions, Result, FIELD_MANAGER};

use crate::csr;
use crate::store::{self, ObjectStore};

/// How long `stop` waits for a manager to wind down
pub const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Namespace of the credentials secret inside the workload cluster
pub const TARGET_SECRET_NAMESPACE: &str = "kube-system";

/// Key of the kubeconfig inside the CAPI kubeconfig secret
const KUBECONFIG_KEY: &str = "value";

/// A reachable workload cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WorkloadCluster: Send + Sync {
    /// Check that the API server answers
    async fn ping(&self) -> Result<()>;

    /// Run the manager until cancelled
    async fn run(&self, cancel: CancellationToken);

    /// Create or update a secret in the workload cluster
    async fn apply_secret(&self, secret: Secret) -> Result<()>;
}

/// Builds [`WorkloadCluster`]s from kubeconfigs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WorkloadConnector: Send + Sync {
    /// Connect to the cluster whose machines live in `namespace`
    async fn connect(&self, namespace: &str, kubeconfig: &str)
        -> Result<Arc<dyn WorkloadCluster>>;
}

/// Connects with kube clients; managers approve kubelet CSRs
pub struct KubeWorkloadConnector {
    store: Arc<dyn ObjectStore>,
    events: Arc<dyn EventPublisher>,
}

impl KubeWorkloadConnector {
    /// Connector whose managers look up machines through `store`
    pub fn new(store: Arc<dyn ObjectStore>, events: Arc<dyn EventPublisher>) -> Self {
        Self { store, events }
    }
}

#[async_trait]
impl WorkloadConnector for KubeWorkloadConnector {
    async fn connect(
        &self,
        namespace: &str,
        kubeconfig: &str,
    ) -> Result<Arc<dyn WorkloadCluster>> {
        let kubeconfig = Kubeconfig::from_yaml(kubeconfig)
            .map_err(|e| Error::target_cluster(namespace, format!("invalid kubeconfig: {e}")))?;
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| Error::target_cluster(namespace, format!("kubeconfig not usable: {e}")))?;
        let client = Client::try_from(config)?;
        Ok(Arc::new(KubeWorkloadCluster {
            client,
            namespace: namespace.to_string(),
            store: self.store.clone(),
            events: self.events.clone(),
        }))
    }
}

struct KubeWorkloadCluster {
    client: Client,
    namespace: String,
    store: Arc<dyn ObjectStore>,
    events: Arc<dyn EventPublisher>,
}

#[async_trait]
impl WorkloadCluster for KubeWorkloadCluster {
    async fn ping(&self) -> Result<()> {
        let version = self.client.apiserver_version().await?;
        debug!(namespace = %self.namespace, version = %version.git_version, "workload API server answers");
        Ok(())
    }

    async fn run(&self, cancel: CancellationToken) {
        let ctx = Arc::new(csr::CsrContext {
            store: self.store.clone(),
            decider: Arc::new(csr::KubeCsrDecider::new(self.client.clone())),
            events: self.events.clone(),
            namespace: self.namespace.clone(),
        });
        csr::run(self.client.clone(), ctx, cancel).await;
    }

    async fn apply_secret(&self, secret: Secret) -> Result<()> {
        let namespace = secret.namespace().unwrap_or_else(|| TARGET_SECRET_NAMESPACE.to_string());
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &namespace);
        api.patch(
            &secret.name_any(),
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&secret),
        )
        .await?;
        Ok(())
    }
}

struct Manager {
    generation: u64,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    cluster: Arc<dyn WorkloadCluster>,
}

/// Registry entry; `Starting` reserves the key while a pass connects
enum Slot {
    Starting(u64),
    Running(Manager),
}

type Managers = Arc<Mutex<HashMap<String, Slot>>>;

/// Running managers keyed by `namespace/name` of the HetznerCluster
///
/// The lock only guards map changes. Reading the kubeconfig, connecting
/// and probing happen outside of it, so a hanging API server of one
/// cluster does not hold up the others.
pub struct TargetClusterRegistry {
    managers: Managers,
    tracker: TaskTracker,
    root: CancellationToken,
    generation: AtomicU64,
}

impl Default for TargetClusterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TargetClusterRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self {
            managers: Arc::new(Mutex::new(HashMap::new())),
            tracker: TaskTracker::new(),
            root: CancellationToken::new(),
            generation: AtomicU64::new(0),
        }
    }

    /// Make sure a manager runs for the cluster
    ///
    /// Returns the workload cluster once its manager runs. `None` means the
    /// cluster is not reachable yet, or another pass is starting its
    /// manager; the caller should requeue. Reasons are recorded in the
    /// `TargetClusterReady` condition.
    pub async fn ensure(
        &self,
        store: &dyn ObjectStore,
        connector: &dyn WorkloadConnector,
        cluster: &mut HetznerCluster,
        control_plane_ready: bool,
    ) -> Result<Option<Arc<dyn WorkloadCluster>>> {
        let key = object_key(&cluster.metadata);
        let generation = {
            let mut managers = self.managers.lock().await;
            match managers.get(&key) {
                Some(Slot::Running(manager)) => {
                    cluster.conditions_mut().mark_true(types::TARGET_CLUSTER_READY);
                    return Ok(Some(manager.cluster.clone()));
                }
                Some(Slot::Starting(_)) => {
                    debug!(cluster = %key, "manager is being started by another pass");
                    return Ok(None);
                }
                None => {
                    let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                    managers.insert(key.clone(), Slot::Starting(generation));
                    generation
                }
            }
        };

        let connected = connect(store, connector, cluster, &key, control_plane_ready).await;

        let mut managers = self.managers.lock().await;
        let reserved = matches!(managers.get(&key), Some(Slot::Starting(g)) if *g == generation);
        let workload = match connected {
            Ok(Some(workload)) if reserved => workload,
            other => {
                if reserved {
                    managers.remove(&key);
                } else {
                    debug!(cluster = %key, generation, "cluster stopped while connecting");
                }
                return other.map(|_| None);
            }
        };

        let cancel = self.root.child_token();
        let handle = self.tracker.spawn({
            let workload = workload.clone();
            let cancel = cancel.clone();
            let managers = self.managers.clone();
            let key = key.clone();
            async move {
                workload.run(cancel).await;
                let mut managers = managers.lock().await;
                if matches!(managers.get(&key), Some(Slot::Running(m)) if m.generation == generation) {
                    managers.remove(&key);
                    debug!(cluster = %key, generation, "manager exited");
                }
            }
        });
        managers.insert(
            key.clone(),
            Slot::Running(Manager {
                generation,
                cancel,
                handle,
                cluster: workload.clone(),
            }),
        );
        info!(cluster = %key, generation, "started workload cluster manager");
        cluster.conditions_mut().mark_true(types::TARGET_CLUSTER_READY);
        Ok(Some(workload))
    }

    /// Whether a manager runs for `namespace/name`
    pub async fn is_running(&self, key: &str) -> bool {
        matches!(self.managers.lock().await.get(key), Some(Slot::Running(_)))
    }

    /// Stop the manager of one cluster and wait for it
    pub async fn stop(&self, key: &str) {
        let Some(Slot::Running(manager)) = self.managers.lock().await.remove(key) else {
            return;
        };
        manager.cancel.cancel();
        match tokio::time::timeout(STOP_TIMEOUT, manager.handle).await {
            Ok(_) => info!(cluster = %key, "stopped workload cluster manager"),
            Err(_) => warn!(cluster = %key, "workload cluster manager did not stop in time"),
        }
    }

    /// Cancel every manager and wait for all of them
    pub async fn shutdown(&self) {
        self.root.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        self.managers.lock().await.clear();
    }
}

/// Read the kubeconfig, connect and ping; no registry lock is held here
async fn connect(
    store: &dyn ObjectStore,
    connector: &dyn WorkloadConnector,
    cluster: &mut HetznerCluster,
    key: &str,
    control_plane_ready: bool,
) -> Result<Option<Arc<dyn WorkloadCluster>>> {
    let namespace = cluster.namespace().unwrap_or_default();
    let secret_name = format!("{}-kubeconfig", cluster.cluster_name());
    let Some(kubeconfig) = read_kubeconfig(store, &namespace, &secret_name).await? else {
        cluster.conditions_mut().mark_false(
            types::TARGET_CLUSTER_READY,
            reasons::KUBECONFIG_NOT_FOUND,
            ConditionSeverity::Info,
            format!("secret {namespace}/{secret_name} not found"),
        );
        return Ok(None);
    };

    if !control_plane_ready {
        cluster.conditions_mut().mark_false(
            types::TARGET_CLUSTER_READY,
            reasons::TARGET_CLUSTER_CONTROL_PLANE_NOT_READY,
            ConditionSeverity::Info,
            "control plane is not ready yet",
        );
        return Ok(None);
    }

    let workload = match connector.connect(&namespace, &kubeconfig).await {
        Ok(workload) => workload,
        Err(e) => {
            cluster.conditions_mut().mark_false(
                types::TARGET_CLUSTER_READY,
                reasons::TARGET_CLUSTER_CREATE_FAILED,
                ConditionSeverity::Error,
                e.to_string(),
            );
            return Err(Error::target_cluster(key, e.to_string()));
        }
    };

    if let Err(e) = workload.ping().await {
        debug!(cluster = %key, error = %e, "workload API server not responding");
        cluster.conditions_mut().mark_false(
            types::TARGET_CLUSTER_READY,
            reasons::KUBE_API_SERVER_NOT_RESPONDING,
            ConditionSeverity::Warning,
            e.to_string(),
        );
        return Ok(None);
    }
    Ok(Some(workload))
}

async fn read_kubeconfig(
    store: &dyn ObjectStore,
    namespace: &str,
    name: &str,
) -> Result<Option<String>> {
    let Some(secret) = store::get::<Secret>(store, namespace, name).await? else {
        return Ok(None);
    };
    Ok(secret
        .data
        .as_ref()
        .and_then(|d| d.get(KUBECONFIG_KEY))
        .map(|v| String::from_utf8_lossy(&v.0).into_owned())
        .filter(|v| !v.trim().is_empty()))
}

/// Credentials secret for the cloud controller manager in the workload cluster
pub fn target_secret(cluster: &HetznerCluster, token: &str) -> Secret {
    let mut data = BTreeMap::from([(
        cluster.spec.hetzner_secret_ref.key.hcloud_token.clone(),
        ByteString(token.as_bytes().to_vec()),
    )]);
    if let Some(id) = cluster.network_id() {
        data.insert("network".to_string(), ByteString(id.to_string().into_bytes()));
    }
    if let Some(endpoint) = cluster.spec.control_plane_endpoint.as_ref().filter(|e| e.is_set()) {
        data.insert(
            "apiserver-host".to_string(),
            ByteString(endpoint.host.clone().into_bytes()),
        );
        data.insert(
            "apiserver-port".to_string(),
            ByteString(endpoint.port.to_string().into_bytes()),
        );
    }
    Secret {
        metadata: ObjectMeta {
            name: Some(cluster.spec.hetzner_secret_ref.name.clone()),
            namespace: Some(TARGET_SECRET_NAMESPACE.to_string()),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::fake::FakeStore;
    use crate::testing::hetzner_cluster;
    use caph_common::crd::ApiEndpoint;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use tokio::sync::Notify;

    /// Workload cluster whose manager runs until cancelled
    #[derive(Default)]
    struct FakeWorkload {
        stopped: AtomicBool,
    }

    #[async_trait]
    impl WorkloadCluster for FakeWorkload {
        async fn ping(&self) -> Result<()> {
            Ok(())
        }

        async fn run(&self, cancel: CancellationToken) {
            cancel.cancelled().await;
            self.stopped.store(true, Ordering::SeqCst);
        }

        async fn apply_secret(&self, _secret: Secret) -> Result<()> {
            Ok(())
        }
    }

    struct CountingConnector {
        connects: AtomicUsize,
        workload: Arc<FakeWorkload>,
    }

    #[async_trait]
    impl WorkloadConnector for CountingConnector {
        async fn connect(
            &self,
            _namespace: &str,
            _kubeconfig: &str,
        ) -> Result<Arc<dyn WorkloadCluster>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            Ok(self.workload.clone())
        }
    }

    fn kubeconfig_secret() -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some("prod-kubeconfig".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(
                "value".to_string(),
                ByteString(b"apiVersion: v1".to_vec()),
            )])),
            ..Default::default()
        }
    }

    fn store_with_kubeconfig() -> FakeStore {
        let store = FakeStore::new();
        store.insert(&kubeconfig_secret());
        store
    }

    /// Story: concurrent reconciles start exactly one manager
    ///
    /// Several passes over the same cluster race to start its manager. Only
    /// the pass that reserved the cluster connects; the others either see
    /// the reservation and requeue or find the running manager.
    #[tokio::test]
    async fn story_one_manager_per_cluster_under_concurrency() {
        let registry = Arc::new(TargetClusterRegistry::new());
        let store = Arc::new(store_with_kubeconfig());
        let connector = Arc::new(CountingConnector {
            connects: AtomicUsize::new(0),
            workload: Arc::new(FakeWorkload::default()),
        });

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            let store = store.clone();
            let connector = connector.clone();
            tasks.push(tokio::spawn(async move {
                let mut cluster = hetzner_cluster(json!({}));
                registry
                    .ensure(store.as_ref(), connector.as_ref(), &mut cluster, true)
                    .await
                    .expect("ensure")
                    .is_some()
            }));
        }
        let mut started = 0;
        for task in tasks {
            if task.await.expect("task") {
                started += 1;
            }
        }

        assert!(started >= 1);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert!(registry.is_running("default/prod").await);

        let mut cluster = hetzner_cluster(json!({}));
        assert!(registry
            .ensure(store.as_ref(), connector.as_ref(), &mut cluster, true)
            .await
            .expect("ensure")
            .is_some());
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);

        registry.shutdown().await;
        assert!(connector.workload.stopped.load(Ordering::SeqCst));
    }

    /// Workload whose API server never answers a ping
    struct HangingWorkload {
        probing: Arc<Notify>,
    }

    #[async_trait]
    impl WorkloadCluster for HangingWorkload {
        async fn ping(&self) -> Result<()> {
            self.probing.notify_one();
            std::future::pending::<()>().await;
            Ok(())
        }

        async fn run(&self, cancel: CancellationToken) {
            cancel.cancelled().await;
        }

        async fn apply_secret(&self, _secret: Secret) -> Result<()> {
            Ok(())
        }
    }

    /// Hangs for kubeconfigs mentioning `slow`, answers for all others
    struct SplitConnector {
        probing: Arc<Notify>,
        fast: Arc<FakeWorkload>,
    }

    #[async_trait]
    impl WorkloadConnector for SplitConnector {
        async fn connect(
            &self,
            _namespace: &str,
            kubeconfig: &str,
        ) -> Result<Arc<dyn WorkloadCluster>> {
            if kubeconfig.contains("slow") {
                return Ok(Arc::new(HangingWorkload {
                    probing: self.probing.clone(),
                }));
            }
            Ok(self.fast.clone())
        }
    }

    fn kubeconfig_for(cluster: &str, body: &[u8]) -> Secret {
        let mut secret = kubeconfig_secret();
        secret.metadata.name = Some(format!("{cluster}-kubeconfig"));
        secret.data = Some(BTreeMap::from([(
            "value".to_string(),
            ByteString(body.to_vec()),
        )]));
        secret
    }

    fn cluster_named(name: &str) -> HetznerCluster {
        let mut cluster = hetzner_cluster(json!({}));
        cluster.metadata.name = Some(name.to_string());
        cluster.metadata.labels = Some(BTreeMap::from([(
            caph_common::labels::CLUSTER_NAME_LABEL.to_string(),
            name.to_string(),
        )]));
        cluster
    }

    /// Story: a hanging API server only holds up its own cluster
    ///
    /// `prod` never answers its ping. While that pass hangs, `other` gets
    /// its manager, and a second pass over `prod` sees the reservation and
    /// returns without connecting again.
    #[tokio::test]
    async fn story_hanging_api_server_does_not_block_other_clusters() {
        let registry = Arc::new(TargetClusterRegistry::new());
        let store = Arc::new(FakeStore::new());
        store.insert(&kubeconfig_for("prod", b"server: slow"));
        store.insert(&kubeconfig_for("other", b"server: fast"));
        let probing = Arc::new(Notify::new());
        let connector = Arc::new(SplitConnector {
            probing: probing.clone(),
            fast: Arc::new(FakeWorkload::default()),
        });

        let hanging = tokio::spawn({
            let registry = registry.clone();
            let store = store.clone();
            let connector = connector.clone();
            async move {
                let mut cluster = cluster_named("prod");
                registry
                    .ensure(store.as_ref(), connector.as_ref(), &mut cluster, true)
                    .await
            }
        });
        probing.notified().await;

        let mut other = cluster_named("other");
        let started = tokio::time::timeout(
            Duration::from_secs(1),
            registry.ensure(store.as_ref(), connector.as_ref(), &mut other, true),
        )
        .await
        .expect("other cluster is not blocked")
        .expect("ensure");
        assert!(started.is_some());
        assert!(registry.is_running("default/other").await);

        let mut prod = cluster_named("prod");
        let second = tokio::time::timeout(
            Duration::from_secs(1),
            registry.ensure(store.as_ref(), connector.as_ref(), &mut prod, true),
        )
        .await
        .expect("reservation answers at once")
        .expect("ensure");
        assert!(second.is_none());
        assert!(!registry.is_running("default/prod").await);

        hanging.abort();
        registry.shutdown().await;
    }

    /// Connector that lets the test decide when `connect` returns
    struct GatedConnector {
        entered: Arc<Notify>,
        release: Arc<Notify>,
        workload: Arc<FakeWorkload>,
    }

    #[async_trait]
    impl WorkloadConnector for GatedConnector {
        async fn connect(
            &self,
            _namespace: &str,
            _kubeconfig: &str,
        ) -> Result<Arc<dyn WorkloadCluster>> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(self.workload.clone())
        }
    }

    #[tokio::test]
    async fn stop_during_start_leaves_no_manager() {
        let registry = Arc::new(TargetClusterRegistry::new());
        let store = Arc::new(store_with_kubeconfig());
        let connector = Arc::new(GatedConnector {
            entered: Arc::new(Notify::new()),
            release: Arc::new(Notify::new()),
            workload: Arc::new(FakeWorkload::default()),
        });

        let starting = tokio::spawn({
            let registry = registry.clone();
            let store = store.clone();
            let connector = connector.clone();
            async move {
                let mut cluster = hetzner_cluster(json!({}));
                registry
                    .ensure(store.as_ref(), connector.as_ref(), &mut cluster, true)
                    .await
            }
        });
        connector.entered.notified().await;
        registry.stop("default/prod").await;
        connector.release.notify_one();

        let result = starting.await.expect("task").expect("ensure");
        assert!(result.is_none());
        assert!(!registry.is_running("default/prod").await);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn missing_kubeconfig_waits_without_connecting() {
        let registry = TargetClusterRegistry::new();
        let store = FakeStore::new();
        let mut connector = MockWorkloadConnector::new();
        connector.expect_connect().never();

        let mut cluster = hetzner_cluster(json!({}));
        let result = registry
            .ensure(&store, &connector, &mut cluster, true)
            .await
            .expect("ensure");
        assert!(result.is_none());
        let condition = cluster
            .conditions()
            .get(types::TARGET_CLUSTER_READY)
            .expect("condition");
        assert_eq!(condition.reason, reasons::KUBECONFIG_NOT_FOUND);
    }

    #[tokio::test]
    async fn control_plane_not_ready_waits_without_connecting() {
        let registry = TargetClusterRegistry::new();
        let store = store_with_kubeconfig();
        let mut connector = MockWorkloadConnector::new();
        connector.expect_connect().never();

        let mut cluster = hetzner_cluster(json!({}));
        let result = registry
            .ensure(&store, &connector, &mut cluster, false)
            .await
            .expect("ensure");
        assert!(result.is_none());
        let condition = cluster
            .conditions()
            .get(types::TARGET_CLUSTER_READY)
            .expect("condition");
        assert_eq!(condition.reason, reasons::TARGET_CLUSTER_CONTROL_PLANE_NOT_READY);
    }

    #[tokio::test]
    async fn unresponsive_api_server_starts_no_manager() {
        let registry = TargetClusterRegistry::new();
        let store = store_with_kubeconfig();
        let mut connector = MockWorkloadConnector::new();
        connector.expect_connect().times(1).returning(|_, _| {
            let mut workload = MockWorkloadCluster::new();
            workload
                .expect_ping()
                .returning(|| Err(Error::target_cluster("default/prod", "connection refused")));
            workload.expect_run().never();
            Ok(Arc::new(workload) as Arc<dyn WorkloadCluster>)
        });

        let mut cluster = hetzner_cluster(json!({}));
        let result = registry
            .ensure(&store, &connector, &mut cluster, true)
            .await
            .expect("ensure");
        assert!(result.is_none());
        assert!(!registry.is_running("default/prod").await);
        assert_eq!(
            cluster
                .conditions()
                .get(types::TARGET_CLUSTER_READY)
                .expect("condition")
                .reason,
            reasons::KUBE_API_SERVER_NOT_RESPONDING
        );
    }

    #[tokio::test]
    async fn connect_failure_is_an_error() {
        let registry = TargetClusterRegistry::new();
        let store = store_with_kubeconfig();
        let mut connector = MockWorkloadConnector::new();
        connector
            .expect_connect()
            .returning(|_, _| Err(Error::target_cluster("default", "invalid kubeconfig")));

        let mut cluster = hetzner_cluster(json!({}));
        assert!(registry
            .ensure(&store, &connector, &mut cluster, true)
            .await
            .is_err());
        assert!(cluster.conditions().is_false(types::TARGET_CLUSTER_READY));
    }

    /// Story: a stopped cluster can be started again
    #[tokio::test]
    async fn story_stop_then_restart() {
        let registry = TargetClusterRegistry::new();
        let store = store_with_kubeconfig();
        let connector = CountingConnector {
            connects: AtomicUsize::new(0),
            workload: Arc::new(FakeWorkload::default()),
        };
        let mut cluster = hetzner_cluster(json!({}));

        registry
            .ensure(&store, &connector, &mut cluster, true)
            .await
            .expect("ensure");
        registry.stop("default/prod").await;
        assert!(connector.workload.stopped.load(Ordering::SeqCst));
        assert!(!registry.is_running("default/prod").await);

        registry
            .ensure(&store, &connector, &mut cluster, true)
            .await
            .expect("ensure");
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
        assert!(registry.is_running("default/prod").await);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn manager_that_exits_leaves_the_registry() {
        let registry = TargetClusterRegistry::new();
        let store = store_with_kubeconfig();
        let mut connector = MockWorkloadConnector::new();
        connector.expect_connect().returning(|_, _| {
            let mut workload = MockWorkloadCluster::new();
            workload.expect_ping().returning(|| Ok(()));
            workload.expect_run().returning(|_| ());
            Ok(Arc::new(workload) as Arc<dyn WorkloadCluster>)
        });

        let mut cluster = hetzner_cluster(json!({}));
        registry
            .ensure(&store, &connector, &mut cluster, true)
            .await
            .expect("ensure");
        registry.tracker.close();
        registry.tracker.wait().await;
        assert!(!registry.is_running("default/prod").await);
    }

    #[test]
    fn target_secret_carries_token_network_and_endpoint() {
        let mut cluster = hetzner_cluster(json!({}));
        cluster.spec.control_plane_endpoint = Some(ApiEndpoint {
            host: "1.2.3.4".to_string(),
            port: 6443,
        });
        cluster.status_mut().network_status = Some(caph_common::crd::NetworkStatus {
            id: 7,
            attached_servers: vec![],
        });

        let secret = target_secret(&cluster, "s3cret");
        assert_eq!(secret.metadata.name.as_deref(), Some("hetzner"));
        assert_eq!(secret.metadata.namespace.as_deref(), Some("kube-system"));
        let data = secret.data.expect("data");
        assert_eq!(data["hcloud"].0, b"s3cret".to_vec());
        assert_eq!(data["network"].0, b"7".to_vec());
        assert_eq!(data["apiserver-host"].0, b"1.2.3.4".to_vec());
        assert_eq!(data["apiserver-port"].0, b"6443".to_vec());
    }
}
