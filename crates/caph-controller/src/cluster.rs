//! HetznerCluster reconciler
//!
//! Drives the cluster-wide cloud resources in dependency order (network,
//! control-plane load balancer, placement groups), publishes the API
//! endpoint and keeps a manager running against the workload cluster once
//! its control plane is up.

use std::sync::Arc;

use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use caph_common::conditions::{reasons, types};
use caph_common::crd::capi::{is_paused, Cluster};
use caph_common::crd::{object_key, ApiEndpoint, FailureDomain, HCloudMachine, HetznerCluster};
use caph_common::events::{actions, reasons as event_reasons};
use caph_common::labels::{add_finalizer, remove_finalizer, CLUSTER_FINALIZER, CLUSTER_NAME_LABEL};
use caph_common::rate_limit::Gate;
use caph_common::{ConditionSeverity, Error, HasConditions, Result};

use crate::context::{Context, Credentials};
use crate::scope::Scope;
use crate::secrets::{credentials_failure, mark_token_availability, SecretHolder, SecretKey};
use crate::services::{load_balancer, network, placement_group};
use crate::store;
use crate::target_cluster::{target_secret, WorkloadCluster};
use crate::{owners, ERROR_REQUEUE, OWNER_REQUEUE, WAIT_REQUEUE};

/// Reconcile a HetznerCluster
#[instrument(skip(cluster, ctx), fields(cluster = %cluster.name_any()))]
pub async fn reconcile(cluster: Arc<HetznerCluster>, ctx: Arc<Context>) -> Result<Action> {
    let deleting = cluster.meta().deletion_timestamp.is_some();
    let owner = owners::owner_cluster(ctx.store.as_ref(), &cluster.metadata).await?;
    if let Some(owner) = &owner {
        if is_paused(owner, &cluster.metadata) {
            debug!("reconciliation is paused");
            return Ok(Action::await_change());
        }
    }

    let mut scope = Scope::open(ctx.store.clone(), (*cluster).clone())?;
    let result = match (deleting, owner) {
        (true, _) => reconcile_delete(&ctx, &mut scope).await,
        (false, Some(owner)) => reconcile_normal(&ctx, &mut scope, &owner).await,
        (false, None) => {
            debug!("owner cluster not set yet");
            return Ok(Action::requeue(OWNER_REQUEUE));
        }
    };
    scope.close(result).await
}

async fn reconcile_normal(
    ctx: &Context,
    scope: &mut Scope<HetznerCluster>,
    owner: &Cluster,
) -> Result<Action> {
    if add_finalizer(&mut scope.object_mut().metadata.finalizers, CLUSTER_FINALIZER) {
        scope.persist().await?;
    }

    let credentials = match credentials(ctx, scope, true).await? {
        Ok(credentials) => credentials,
        Err(action) => return Ok(action),
    };

    if let Gate::Defer(after) = ctx.rate_limit.check(scope.conditions_mut()) {
        debug!("rate limited, deferring");
        return Ok(Action::requeue(after));
    }

    let object = object_key(&scope.object().metadata);
    let api = credentials.api.as_ref();
    let cluster = scope.object_mut();

    network::reconcile_network(api, cluster)
        .await
        .map_err(|e| Error::stage("network", &object, e))?;
    load_balancer::reconcile_load_balancer(api, cluster)
        .await
        .map_err(|e| Error::stage("load balancer", &object, e))?;
    placement_group::reconcile_placement_groups(api, cluster)
        .await
        .map_err(|e| Error::stage("placement groups", &object, e))?;

    set_failure_domains(cluster);
    if !reconcile_endpoint(cluster) {
        return Ok(Action::requeue(WAIT_REQUEUE));
    }
    cluster.status_mut().ready = true;

    let workload = ctx
        .registry
        .ensure(
            ctx.store.as_ref(),
            ctx.connector.as_ref(),
            cluster,
            owner.control_plane_ready(),
        )
        .await
        .map_err(|e| Error::stage("target cluster", &object, e))?;
    let Some(workload) = workload else {
        return Ok(Action::requeue(WAIT_REQUEUE));
    };

    sync_target_secret(workload.as_ref(), cluster, &credentials.token)
        .await
        .map_err(|e| Error::stage("target secret", &object, e))?;
    Ok(Action::await_change())
}

async fn reconcile_delete(ctx: &Context, scope: &mut Scope<HetznerCluster>) -> Result<Action> {
    let namespace = scope.namespace();
    let cluster_name = scope.object().cluster_name();
    let remaining = store::list::<HCloudMachine>(
        ctx.store.as_ref(),
        &namespace,
        Some(format!("{CLUSTER_NAME_LABEL}={cluster_name}")),
    )
    .await?;
    if !remaining.is_empty() {
        info!(machines = remaining.len(), "waiting for machines to be deleted");
        ctx.events
            .publish(
                &scope.object().object_ref(&()),
                EventType::Normal,
                event_reasons::WAITING_FOR_MACHINE_DELETION,
                actions::DELETE,
                Some(format!("{} machines remaining", remaining.len())),
            )
            .await;
        return Ok(Action::requeue(WAIT_REQUEUE));
    }

    let credentials = match credentials(ctx, scope, false).await? {
        Ok(credentials) => credentials,
        Err(action) => return Ok(action),
    };

    let key = object_key(&scope.object().metadata);
    let secret = SecretKey::new(&namespace, &scope.object().spec.hetzner_secret_ref.name);
    ctx.secrets
        .release_secret(&secret, &SecretHolder::of(scope.object()))
        .await?;

    ctx.registry.stop(&key).await;

    let api = credentials.api.as_ref();
    let cluster = scope.object_mut();
    load_balancer::delete_load_balancer(api, cluster)
        .await
        .map_err(|e| Error::stage("load balancer", &key, e))?;
    network::delete_network(api, cluster)
        .await
        .map_err(|e| Error::stage("network", &key, e))?;
    placement_group::delete_placement_groups(api, cluster)
        .await
        .map_err(|e| Error::stage("placement groups", &key, e))?;

    remove_finalizer(&mut cluster.metadata.finalizers, CLUSTER_FINALIZER);
    info!(cluster = %key, "cluster resources deleted");
    Ok(Action::await_change())
}

/// Resolve credentials, recording the outcome on the cluster
///
/// The inner `Err` is the action to return when the credentials are not
/// usable.
async fn credentials(
    ctx: &Context,
    scope: &mut Scope<HetznerCluster>,
    register: bool,
) -> Result<std::result::Result<Credentials, Action>> {
    let credentials = ctx.credentials(scope.object(), register).await;
    mark_token_availability(scope.conditions_mut(), &credentials);
    match credentials {
        Ok(credentials) => Ok(Ok(credentials)),
        Err(e) => {
            if matches!(e, Error::CredentialsInvalid { .. }) {
                ctx.events
                    .publish(
                        &scope.object().object_ref(&()),
                        EventType::Warning,
                        event_reasons::CREDENTIALS_INVALID,
                        actions::RECONCILE,
                        Some(e.to_string()),
                    )
                    .await;
            }
            credentials_failure(e).map(Err)
        }
    }
}

/// One failure domain per control-plane region
fn set_failure_domains(cluster: &mut HetznerCluster) {
    let domains = cluster
        .spec
        .control_plane_regions
        .iter()
        .map(|region| (region.clone(), FailureDomain { control_plane: true }))
        .collect();
    cluster.status_mut().failure_domains = domains;
}

/// Fill the API endpoint from the load balancer; whether one is known
fn reconcile_endpoint(cluster: &mut HetznerCluster) -> bool {
    let lb = &cluster.spec.control_plane_load_balancer;
    let user_set = cluster
        .spec
        .control_plane_endpoint
        .as_ref()
        .is_some_and(ApiEndpoint::is_set);
    if lb.enabled && !user_set {
        let ipv4 = cluster
            .status
            .as_ref()
            .and_then(|s| s.control_plane_load_balancer.as_ref())
            .and_then(|lb| lb.ipv4.clone());
        if let Some(host) = ipv4 {
            info!(%host, port = lb.port, "control plane endpoint from load balancer");
            cluster.spec.control_plane_endpoint = Some(ApiEndpoint {
                host,
                port: lb.port,
            });
        }
    }

    let set = cluster
        .spec
        .control_plane_endpoint
        .as_ref()
        .is_some_and(ApiEndpoint::is_set);
    if set {
        cluster
            .conditions_mut()
            .mark_true(types::CONTROL_PLANE_ENDPOINT_SET);
    } else {
        let message = if cluster.spec.control_plane_load_balancer.enabled {
            "load balancer has no IPv4 address yet"
        } else {
            "controlPlaneEndpoint must be set when the load balancer is disabled"
        };
        cluster.conditions_mut().mark_false(
            types::CONTROL_PLANE_ENDPOINT_SET,
            reasons::CONTROL_PLANE_ENDPOINT_NOT_SET,
            ConditionSeverity::Warning,
            message,
        );
        cluster.status_mut().ready = false;
    }
    set
}

async fn sync_target_secret(
    workload: &dyn WorkloadCluster,
    cluster: &mut HetznerCluster,
    token: &str,
) -> Result<()> {
    match workload.apply_secret(target_secret(cluster, token)).await {
        Ok(()) => {
            cluster
                .conditions_mut()
                .mark_true(types::TARGET_CLUSTER_SECRET_READY);
            Ok(())
        }
        Err(e) => {
            cluster.conditions_mut().mark_false(
                types::TARGET_CLUSTER_SECRET_READY,
                reasons::TARGET_SECRET_SYNC_FAILED,
                ConditionSeverity::Warning,
                e.to_string(),
            );
            Err(e)
        }
    }
}

/// Requeue failed cluster reconciles
pub fn error_policy(cluster: Arc<HetznerCluster>, error: &Error, _ctx: Arc<Context>) -> Action {
    warn!(cluster = %cluster.name_any(), error = %error, "cluster reconcile failed");
    Action::requeue(ERROR_REQUEUE)
}
