//! HCloudMachine reconciler

use std::sync::Arc;

use k8s_openapi::api::core::v1::Secret;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use caph_common::conditions::{reasons, types};
use caph_common::crd::capi::{is_paused, Machine};
use caph_common::crd::{object_key, HCloudMachine, HetznerCluster};
use caph_common::events::{actions, reasons as event_reasons};
use caph_common::labels::{add_finalizer, remove_finalizer, MACHINE_FINALIZER, REMEDIATE_MACHINE_ANNOTATION};
use caph_common::rate_limit::Gate;
use caph_common::{ConditionSeverity, Error, Result};

use crate::context::{Context, Credentials};
use crate::scope::Scope;
use crate::secrets::{credentials_failure, mark_token_availability};
use crate::services::server::{Deletion, ServerService};
use crate::store::{self, resource_of, ObjectPatch};
use crate::{owners, ERROR_REQUEUE, WAIT_REQUEUE};

/// Key of the bootstrap data in its secret
pub const BOOTSTRAP_DATA_KEY: &str = "value";

/// Reconcile an HCloudMachine
#[instrument(skip(hm, ctx), fields(machine = %hm.name_any()))]
pub async fn reconcile(hm: Arc<HCloudMachine>, ctx: Arc<Context>) -> Result<Action> {
    let store = ctx.store.as_ref();
    let Some(machine) = owners::owner_machine(store, &hm.metadata).await? else {
        return Ok(Action::await_change());
    };
    let Some(cluster) = owners::machine_cluster(store, &machine).await? else {
        debug!(machine = %machine.name_any(), "machine has no cluster yet");
        return Ok(Action::await_change());
    };
    if is_paused(&cluster, &hm.metadata) {
        debug!("reconciliation is paused");
        return Ok(Action::await_change());
    }
    let Some(hetzner_cluster) = owners::infrastructure_cluster(store, &cluster).await? else {
        debug!(cluster = %cluster.name_any(), "HetznerCluster not found yet");
        return Ok(Action::await_change());
    };

    let mut scope = Scope::open(ctx.store.clone(), (*hm).clone())?;
    let result = if hm.meta().deletion_timestamp.is_some() {
        reconcile_delete(&ctx, &mut scope, &machine, &hetzner_cluster).await
    } else {
        reconcile_normal(&ctx, &mut scope, &machine, &hetzner_cluster).await
    };
    scope.close(result).await
}

async fn reconcile_normal(
    ctx: &Context,
    scope: &mut Scope<HCloudMachine>,
    machine: &Machine,
    cluster: &HetznerCluster,
) -> Result<Action> {
    if scope.object().remediation_requested() {
        mark_delete_in_progress(ctx, scope.object_mut(), machine).await?;
        return Ok(Action::await_change());
    }

    if add_finalizer(&mut scope.object_mut().metadata.finalizers, MACHINE_FINALIZER) {
        scope.persist().await?;
    }

    if !cluster.status.as_ref().is_some_and(|s| s.ready) {
        debug!(cluster = %cluster.name_any(), "cluster infrastructure not ready yet");
        return Ok(Action::requeue(WAIT_REQUEUE));
    }

    let Some(user_data) = bootstrap_data(ctx, machine).await? else {
        scope.conditions_mut().mark_false(
            types::BOOTSTRAP_READY,
            reasons::BOOTSTRAP_NOT_READY,
            ConditionSeverity::Info,
            "bootstrap data secret is not available yet",
        );
        return Ok(Action::requeue(WAIT_REQUEUE));
    };
    scope.conditions_mut().mark_true(types::BOOTSTRAP_READY);

    if let Gate::Defer(after) = ctx.rate_limit.check(scope.conditions_mut()) {
        debug!("rate limited, deferring");
        return Ok(Action::requeue(after));
    }
    let credentials = match credentials(ctx, scope, cluster).await {
        Ok(credentials) => credentials,
        Err(e) => return credentials_failure(e),
    };

    let service = ServerService {
        api: credentials.api.as_ref(),
        events: ctx.events.as_ref(),
        cluster,
        machine,
    };
    let object = object_key(&scope.object().metadata);
    let action = service
        .reconcile(scope.object_mut(), &user_data)
        .await
        .map_err(|e| Error::stage("server", &object, e))?;

    if scope.object().remediation_requested() {
        mark_delete_in_progress(ctx, scope.object_mut(), machine).await?;
    }
    Ok(action)
}

async fn reconcile_delete(
    ctx: &Context,
    scope: &mut Scope<HCloudMachine>,
    machine: &Machine,
    cluster: &HetznerCluster,
) -> Result<Action> {
    if let Gate::Defer(after) = ctx.rate_limit.check(scope.conditions_mut()) {
        debug!("rate limited, deferring");
        return Ok(Action::requeue(after));
    }
    let credentials = match credentials(ctx, scope, cluster).await {
        Ok(credentials) => credentials,
        Err(e) => return credentials_failure(e),
    };

    let service = ServerService {
        api: credentials.api.as_ref(),
        events: ctx.events.as_ref(),
        cluster,
        machine,
    };
    let object = object_key(&scope.object().metadata);
    let deletion = service
        .delete(scope.object_mut())
        .await
        .map_err(|e| Error::stage("server", &object, e))?;
    match deletion {
        Deletion::Pending(after) => Ok(Action::requeue(after)),
        Deletion::Complete => {
            remove_finalizer(&mut scope.object_mut().metadata.finalizers, MACHINE_FINALIZER);
            info!(machine = %scope.name(), "machine deleted");
            Ok(Action::await_change())
        }
    }
}

async fn credentials(
    ctx: &Context,
    scope: &mut Scope<HCloudMachine>,
    cluster: &HetznerCluster,
) -> Result<Credentials> {
    let credentials = ctx.credentials(cluster, false).await;
    mark_token_availability(scope.conditions_mut(), &credentials);
    credentials
}

/// Cloud-init user data of the machine, once bootstrap has produced it
async fn bootstrap_data(ctx: &Context, machine: &Machine) -> Result<Option<String>> {
    let Some(name) = machine.spec.bootstrap.data_secret_name.as_deref() else {
        return Ok(None);
    };
    let namespace = machine.namespace().unwrap_or_default();
    let Some(secret) = store::get::<Secret>(ctx.store.as_ref(), &namespace, name).await? else {
        debug!(secret = name, "bootstrap data secret not found");
        return Ok(None);
    };
    Ok(secret
        .data
        .as_ref()
        .and_then(|d| d.get(BOOTSTRAP_DATA_KEY))
        .map(|v| String::from_utf8_lossy(&v.0).into_owned()))
}

/// Hand the machine to Cluster API for replacement
///
/// Sets `NoRemediateMachineAnnotation=False` on the HCloudMachine and the
/// remediate annotation on its CAPI Machine. The condition lands with the
/// caller's next persist; the annotation is patched here.
pub async fn mark_delete_in_progress(
    ctx: &Context,
    hm: &mut HCloudMachine,
    machine: &Machine,
) -> Result<()> {
    if !hm.remediation_requested() {
        hm.mark_remediation_requested();
    }
    if machine.annotations().contains_key(REMEDIATE_MACHINE_ANNOTATION) {
        return Ok(());
    }
    let patch = ObjectPatch {
        metadata: Some(json!({ "annotations": { REMEDIATE_MACHINE_ANNOTATION: "" } })),
        ..Default::default()
    };
    ctx.store
        .patch(
            &resource_of::<Machine>(),
            &machine.namespace().unwrap_or_default(),
            &machine.name_any(),
            &patch,
        )
        .await?;
    warn!(machine = %machine.name_any(), "machine marked for remediation");
    ctx.events
        .publish(
            &hm.object_ref(&()),
            EventType::Warning,
            event_reasons::MACHINE_WILL_BE_REMEDIATED,
            actions::REMEDIATE,
            Some(format!("machine {} will be remediated", machine.name_any())),
        )
        .await;
    Ok(())
}

/// Requeue failed machine reconciles
pub fn error_policy(hm: Arc<HCloudMachine>, error: &Error, _ctx: Arc<Context>) -> Action {
    warn!(machine = %hm.name_any(), error = %error, "machine reconcile failed");
    Action::requeue(ERROR_REQUEUE)
}
