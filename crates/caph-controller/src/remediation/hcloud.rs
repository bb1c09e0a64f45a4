//! HCloudRemediation reconciler

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use caph_common::crd::capi::{Cluster, Machine};
use caph_common::crd::{HCloudMachine, HCloudRemediation, RemediationPhase};
use caph_common::events::reasons as event_reasons;
use caph_common::rate_limit::Gate;
use caph_common::{Error, Result};

use super::{escalate, execute, resolve_owners, RemediationObject, Remediator};
use crate::context::Context;
use crate::hcloud::ComputeApi;
use crate::scope::Scope;
use crate::secrets::{credentials_failure, mark_token_availability};
use crate::services::cloud;
use crate::store;
use crate::{owners, ERROR_REQUEUE, OWNER_REQUEUE};

/// Reboots a cloud server found by its provider ID
pub struct ServerRemediator<'a> {
    api: &'a dyn ComputeApi,
    server_id: Option<i64>,
}

impl<'a> ServerRemediator<'a> {
    /// Remediator for the server with `server_id`; `None` means there is
    /// no server to act on
    pub fn new(api: &'a dyn ComputeApi, server_id: Option<i64>) -> Self {
        Self { api, server_id }
    }
}

#[async_trait]
impl Remediator for ServerRemediator<'_> {
    async fn instance_exists(&self) -> Result<bool> {
        let Some(id) = self.server_id else {
            return Ok(false);
        };
        let server = self.api.get_server(id).await.map_err(cloud("server"))?;
        Ok(server.is_some())
    }

    async fn reboot(&self) -> Result<()> {
        let id = self
            .server_id
            .ok_or_else(|| Error::internal("reboot without a server"))?;
        self.api.reboot_server(id).await.map_err(cloud("server"))
    }
}

/// Reconcile an HCloudRemediation
#[instrument(skip(remediation, ctx), fields(remediation = %remediation.name_any()))]
pub async fn reconcile(remediation: Arc<HCloudRemediation>, ctx: Arc<Context>) -> Result<Action> {
    if remediation.meta().deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }
    let store = ctx.store.as_ref();
    let Some((machine, cluster)) = resolve_owners(store, remediation.as_ref()).await? else {
        return Ok(Action::await_change());
    };

    let namespace = remediation.namespace().unwrap_or_default();
    let infra_name = machine
        .spec
        .infrastructure_ref
        .as_ref()
        .and_then(|r| r.name.clone())
        .unwrap_or_else(|| machine.name_any());
    let hcloud_machine = store::get::<HCloudMachine>(store, &namespace, &infra_name).await?;

    let mut scope = Scope::open(ctx.store.clone(), (*remediation).clone())?;
    let result = remediate(&ctx, &mut scope, &machine, &cluster, hcloud_machine.as_ref()).await;
    scope.close(result).await
}

async fn remediate(
    ctx: &Context,
    scope: &mut Scope<HCloudRemediation>,
    machine: &Machine,
    cluster: &Cluster,
    hcloud_machine: Option<&HCloudMachine>,
) -> Result<Action> {
    if scope.object().remediation().phase() == RemediationPhase::Deleting {
        return Ok(Action::await_change());
    }

    // The machine controller already gave up on this server
    if hcloud_machine.is_some_and(HCloudMachine::remediation_requested) {
        info!(machine = %machine.name_any(), "machine already marked for remediation");
        return escalate(ctx, scope, machine, event_reasons::EXIT_REMEDIATION).await;
    }

    if let Gate::Defer(after) = ctx.rate_limit.check(scope.conditions_mut()) {
        debug!("rate limited, deferring");
        return Ok(Action::requeue(after));
    }

    let Some(hetzner_cluster) = owners::infrastructure_cluster(ctx.store.as_ref(), cluster).await?
    else {
        debug!(cluster = %cluster.name_any(), "HetznerCluster not found yet");
        return Ok(Action::requeue(OWNER_REQUEUE));
    };
    let credentials = ctx.credentials(&hetzner_cluster, false).await;
    mark_token_availability(scope.conditions_mut(), &credentials);
    let credentials = match credentials {
        Ok(credentials) => credentials,
        Err(e) => return credentials_failure(e),
    };

    let server_id = hcloud_machine.and_then(|m| m.server_id().ok());
    let remediator = ServerRemediator::new(credentials.api.as_ref(), server_id);
    execute(ctx, scope, &remediator, machine, Utc::now()).await
}

/// Requeue failed remediations
pub fn error_policy(remediation: Arc<HCloudRemediation>, error: &Error, _ctx: Arc<Context>) -> Action {
    warn!(remediation = %remediation.name_any(), error = %error, "remediation reconcile failed");
    Action::requeue(ERROR_REQUEUE)
}
