//! Controller runner - builds controller futures for each kind
//!
//! Each `build_*` function returns boxed futures the caller joins. All
//! controllers share one [`Context`] so secret holders and target-cluster
//! managers are tracked in one place.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use kube::core::NamespaceResourceScope;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, Resource, ResourceExt};

use caph_common::crd::capi::{Cluster, Machine};
use caph_common::crd::{
    HCloudMachine, HCloudMachineTemplate, HCloudRemediation, HetznerBareMetalRemediation,
    HetznerCluster,
};
use caph_common::labels::CLUSTER_NAME_LABEL;
use caph_controller::remediation::{baremetal, hcloud};
use caph_controller::{cluster, machine, machine_template, Context};

/// Watcher timeout (seconds) - must be less than the client read timeout (30s)
/// so the API server closes idle watches before the client gives up on them.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Boxed controller future
pub type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

fn watcher_config() -> WatcherConfig {
    WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS)
}

/// Api for `K` in the watched namespace, or cluster-wide
fn scoped_api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope>,
    K::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// HetznerCluster controller, also woken by changes of the owning CAPI cluster
pub fn build_cluster_controllers(
    client: Client,
    namespace: Option<&str>,
    ctx: Arc<Context>,
) -> Vec<ControllerFuture> {
    let clusters: Api<HetznerCluster> = scoped_api(&client, namespace);
    let capi_clusters: Api<Cluster> = scoped_api(&client, namespace);

    tracing::info!("- HetznerCluster controller");

    vec![Box::pin(
        Controller::new(clusters, watcher_config())
            .watches(capi_clusters, watcher_config(), |cluster| {
                infrastructure_cluster_ref(&cluster)
            })
            .shutdown_on_signal()
            .run(cluster::reconcile, cluster::error_policy, ctx)
            .for_each(log_reconcile_result("HetznerCluster")),
    )]
}

/// HCloudMachine and HCloudMachineTemplate controllers
pub fn build_machine_controllers(
    client: Client,
    namespace: Option<&str>,
    ctx: Arc<Context>,
) -> Vec<ControllerFuture> {
    let machines: Api<HCloudMachine> = scoped_api(&client, namespace);
    let capi_machines: Api<Machine> = scoped_api(&client, namespace);
    let clusters: Api<HetznerCluster> = scoped_api(&client, namespace);
    let templates: Api<HCloudMachineTemplate> = scoped_api(&client, namespace);

    let machine_ctrl = Controller::new(machines, watcher_config());
    let known_machines = machine_ctrl.store();
    let machine_ctrl = machine_ctrl
        .watches(capi_machines, watcher_config(), |machine| {
            infrastructure_machine_ref(&machine)
        })
        .watches(clusters, watcher_config(), move |cluster| {
            machines_of_cluster(&cluster, &known_machines.state())
        })
        .shutdown_on_signal()
        .run(machine::reconcile, machine::error_policy, ctx.clone())
        .for_each(log_reconcile_result("HCloudMachine"));

    let template_ctrl = Controller::new(templates, watcher_config())
        .shutdown_on_signal()
        .run(
            machine_template::reconcile,
            machine_template::error_policy,
            ctx,
        )
        .for_each(log_reconcile_result("HCloudMachineTemplate"));

    tracing::info!("- HCloudMachine controller");
    tracing::info!("- HCloudMachineTemplate controller");

    vec![Box::pin(machine_ctrl), Box::pin(template_ctrl)]
}

/// HCloudRemediation and HetznerBareMetalRemediation controllers
pub fn build_remediation_controllers(
    client: Client,
    namespace: Option<&str>,
    ctx: Arc<Context>,
) -> Vec<ControllerFuture> {
    let hcloud_remediations: Api<HCloudRemediation> = scoped_api(&client, namespace);
    let baremetal_remediations: Api<HetznerBareMetalRemediation> =
        scoped_api(&client, namespace);

    let hcloud_ctrl = Controller::new(hcloud_remediations, watcher_config())
        .shutdown_on_signal()
        .run(hcloud::reconcile, hcloud::error_policy, ctx.clone())
        .for_each(log_reconcile_result("HCloudRemediation"));

    let baremetal_ctrl = Controller::new(baremetal_remediations, watcher_config())
        .shutdown_on_signal()
        .run(baremetal::reconcile, baremetal::error_policy, ctx)
        .for_each(log_reconcile_result("HetznerBareMetalRemediation"));

    tracing::info!("- HCloudRemediation controller");
    tracing::info!("- HetznerBareMetalRemediation controller");

    vec![Box::pin(hcloud_ctrl), Box::pin(baremetal_ctrl)]
}

/// HetznerCluster referenced as infrastructure of a CAPI cluster
fn infrastructure_cluster_ref(cluster: &Cluster) -> Option<ObjectRef<HetznerCluster>> {
    let reference = cluster.spec.infrastructure_ref.as_ref()?;
    if reference.kind.as_deref() != Some("HetznerCluster") {
        return None;
    }
    let namespace = reference
        .namespace
        .clone()
        .or_else(|| cluster.namespace())
        .unwrap_or_default();
    Some(ObjectRef::new(reference.name.as_deref()?).within(&namespace))
}

/// HCloudMachine referenced as infrastructure of a CAPI machine
fn infrastructure_machine_ref(machine: &Machine) -> Option<ObjectRef<HCloudMachine>> {
    let reference = machine.spec.infrastructure_ref.as_ref()?;
    if reference.kind.as_deref() != Some("HCloudMachine") {
        return None;
    }
    let namespace = machine.namespace().unwrap_or_default();
    Some(ObjectRef::new(reference.name.as_deref()?).within(&namespace))
}

/// Machines labelled with the CAPI cluster name of `cluster`
fn machines_of_cluster(
    cluster: &HetznerCluster,
    machines: &[Arc<HCloudMachine>],
) -> Vec<ObjectRef<HCloudMachine>> {
    let Some(cluster_name) = cluster.labels().get(CLUSTER_NAME_LABEL) else {
        return Vec::new();
    };
    let namespace = cluster.namespace();
    machines
        .iter()
        .filter(|m| m.namespace() == namespace)
        .filter(|m| m.labels().get(CLUSTER_NAME_LABEL) == Some(cluster_name))
        .map(|m| ObjectRef::from_obj(m.as_ref()))
        .collect()
}

/// Creates a closure for logging reconciliation results.
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
