//! HetznerBareMetalRemediation reconciler
//!
//! Bare-metal hosts are rebooted by the host controller; we only ask for it
//! through the reboot annotation.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use caph_common::crd::{
    HetznerBareMetalHost, HetznerBareMetalMachine, HetznerBareMetalRemediation,
    RebootAnnotationArguments, RebootType, RemediationPhase,
};
use caph_common::labels::REBOOT_ANNOTATION;
use caph_common::{Error, Result};

use super::{execute, resolve_owners, RemediationObject, Remediator};
use crate::context::Context;
use crate::scope::Scope;
use crate::store::{self, resource_of, ObjectPatch, ObjectStore};
use crate::ERROR_REQUEUE;

/// Requests hardware resets of a bare-metal host
pub struct HostRemediator<'a> {
    store: &'a dyn ObjectStore,
    host: Option<HetznerBareMetalHost>,
}

impl<'a> HostRemediator<'a> {
    /// Remediator for `host`; `None` means the host could not be found
    pub fn new(store: &'a dyn ObjectStore, host: Option<HetznerBareMetalHost>) -> Self {
        Self { store, host }
    }
}

#[async_trait]
impl Remediator for HostRemediator<'_> {
    async fn instance_exists(&self) -> Result<bool> {
        Ok(self
            .host
            .as_ref()
            .is_some_and(HetznerBareMetalHost::is_provisioned))
    }

    async fn reboot(&self) -> Result<()> {
        let host = self
            .host
            .as_ref()
            .ok_or_else(|| Error::internal("reboot without a host"))?;
        if host.in_maintenance() {
            info!(host = %host.name_any(), "host in maintenance mode, not rebooting");
            return Ok(());
        }

        let arguments = serde_json::to_string(&RebootAnnotationArguments {
            type_: RebootType::Hardware,
        })?;
        let patch = ObjectPatch {
            metadata: Some(json!({ "annotations": { REBOOT_ANNOTATION: arguments } })),
            ..Default::default()
        };
        self.store
            .patch(
                &resource_of::<HetznerBareMetalHost>(),
                &host.namespace().unwrap_or_default(),
                &host.name_any(),
                &patch,
            )
            .await
    }
}

/// Reconcile a HetznerBareMetalRemediation
#[instrument(skip(remediation, ctx), fields(remediation = %remediation.name_any()))]
pub async fn reconcile(
    remediation: Arc<HetznerBareMetalRemediation>,
    ctx: Arc<Context>,
) -> Result<Action> {
    if remediation.meta().deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }
    let store = ctx.store.as_ref();
    let Some((machine, _cluster)) = resolve_owners(store, remediation.as_ref()).await? else {
        return Ok(Action::await_change());
    };

    let mut scope = Scope::open(ctx.store.clone(), (*remediation).clone())?;
    if scope.object().remediation().phase() == RemediationPhase::Deleting {
        return scope.close(Ok(Action::await_change())).await;
    }

    let infra_name = machine
        .spec
        .infrastructure_ref
        .as_ref()
        .and_then(|r| r.name.clone())
        .unwrap_or_else(|| machine.name_any());
    let host = match find_host(store, &scope.namespace(), &infra_name).await {
        Ok(host) => host,
        Err(e) => return scope.close(Err(e)).await,
    };

    let remediator = HostRemediator::new(store, host);
    let result = execute(&ctx, &mut scope, &remediator, &machine, Utc::now()).await;
    scope.close(result).await
}

/// The host behind a bare-metal machine, if there still is one
async fn find_host(
    store: &dyn ObjectStore,
    namespace: &str,
    machine_name: &str,
) -> Result<Option<HetznerBareMetalHost>> {
    let Some(machine) = store::get::<HetznerBareMetalMachine>(store, namespace, machine_name).await?
    else {
        debug!(machine = machine_name, "bare-metal machine not found");
        return Ok(None);
    };
    let Ok((host_namespace, host_name)) = machine.host_key() else {
        debug!(machine = machine_name, "bare-metal machine has no host");
        return Ok(None);
    };
    store::get::<HetznerBareMetalHost>(store, &host_namespace, &host_name).await
}

/// Requeue failed remediations
pub fn error_policy(
    remediation: Arc<HetznerBareMetalRemediation>,
    error: &Error,
    _ctx: Arc<Context>,
) -> Action {
    warn!(remediation = %remediation.name_any(), error = %error, "bare-metal remediation reconcile failed");
    Action::requeue(ERROR_REQUEUE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hcloud::MockComputeApiFactory;
    use crate::store::fake::FakeStore;
    use crate::testing::{capi_cluster, capi_machine, capi_owner, no_workloads};
    use caph_common::conditions::{reasons, types};
    use caph_common::crd::capi::Machine;
    use caph_common::crd::{
        HetznerBareMetalHostSpec, HetznerBareMetalMachineSpec, HetznerBareMetalRemediationSpec,
    };
    use caph_common::labels::HOST_ANNOTATION;
    use caph_common::HasConditions;
    use std::collections::BTreeMap;

    fn remediation() -> HetznerBareMetalRemediation {
        let spec: HetznerBareMetalRemediationSpec = serde_json::from_value(json!({
            "strategy": {"type": "Reboot", "retryLimit": 1, "timeout": "5m"}
        }))
        .expect("valid spec");
        let mut remediation = HetznerBareMetalRemediation::new("bm-0", spec);
        remediation.metadata.namespace = Some("default".to_string());
        remediation.metadata.owner_references = Some(vec![capi_owner("Machine", "bm-0")]);
        remediation
    }

    fn host(state: &str, maintenance: bool) -> HetznerBareMetalHost {
        let spec: HetznerBareMetalHostSpec = serde_json::from_value(json!({
            "maintenanceMode": maintenance,
            "status": {"provisioningState": state}
        }))
        .expect("valid host");
        let mut host = HetznerBareMetalHost::new("host-1", spec);
        host.metadata.namespace = Some("default".to_string());
        host
    }

    fn store_with(host: Option<HetznerBareMetalHost>) -> Arc<FakeStore> {
        let store = Arc::new(FakeStore::new());
        store.insert(&capi_cluster(true));
        store.insert(&capi_machine("bm-0", false));
        let mut machine = HetznerBareMetalMachine::new("bm-0", HetznerBareMetalMachineSpec::default());
        machine.metadata.namespace = Some("default".to_string());
        machine.metadata.annotations = Some(BTreeMap::from([(
            HOST_ANNOTATION.to_string(),
            "default/host-1".to_string(),
        )]));
        store.insert(&machine);
        if let Some(host) = host {
            store.insert(&host);
        }
        store.insert(&remediation());
        store
    }

    fn context(store: Arc<FakeStore>) -> Arc<Context> {
        let mut factory = MockComputeApiFactory::new();
        factory.expect_for_token().never();
        Arc::new(Context::for_testing(store, Arc::new(factory), Arc::new(no_workloads())))
    }

    #[tokio::test]
    async fn provisioned_host_gets_a_hardware_reset_request() {
        let store = store_with(Some(host("provisioned", false)));
        reconcile(Arc::new(remediation()), context(store.clone()))
            .await
            .expect("reconciled");

        let host: HetznerBareMetalHost = store.read("default", "host-1").expect("host");
        assert_eq!(
            host.annotations().get(REBOOT_ANNOTATION).map(String::as_str),
            Some(r#"{"type":"hardware"}"#)
        );
        let stored: HetznerBareMetalRemediation = store.read("default", "bm-0").expect("remediation");
        assert_eq!(stored.status.expect("status").retry_count, 1);
    }

    #[tokio::test]
    async fn host_in_maintenance_is_left_alone() {
        let store = store_with(Some(host("provisioned", true)));
        reconcile(Arc::new(remediation()), context(store.clone()))
            .await
            .expect("reconciled");

        let host: HetznerBareMetalHost = store.read("default", "host-1").expect("host");
        assert!(host.annotations().get(REBOOT_ANNOTATION).is_none());
    }

    #[tokio::test]
    async fn deprovisioned_host_hands_the_machine_over() {
        let store = store_with(Some(host("deprovisioning", false)));
        reconcile(Arc::new(remediation()), context(store.clone()))
            .await
            .expect("reconciled");

        let machine: Machine = store.read("default", "bm-0").expect("machine");
        let condition = machine
            .conditions()
            .get(types::MACHINE_OWNER_REMEDIATED)
            .cloned()
            .expect("owner condition");
        assert_eq!(condition.reason, reasons::WAITING_FOR_REMEDIATION);
        let stored: HetznerBareMetalRemediation = store.read("default", "bm-0").expect("remediation");
        assert_eq!(stored.status.expect("status").phase(), RemediationPhase::Deleting);
    }

    #[tokio::test]
    async fn missing_host_counts_as_gone() {
        let store = store_with(None);
        reconcile(Arc::new(remediation()), context(store.clone()))
            .await
            .expect("reconciled");

        let stored: HetznerBareMetalRemediation = store.read("default", "bm-0").expect("remediation");
        let status = stored.status.expect("status");
        assert_eq!(status.phase(), RemediationPhase::Deleting);
        assert_eq!(status.retry_count, 0);
    }
}
