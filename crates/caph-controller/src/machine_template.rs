//! HCloudMachineTemplate reconciler
//!
//! Keeps `status.capacity` in line with the template's server type so the
//! cluster autoscaler can scale node groups up from zero.

use std::sync::Arc;

use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use tracing::{debug, instrument, warn};

use caph_common::crd::capi::is_paused;
use caph_common::crd::{HCloudMachineTemplate, HetznerCluster};
use caph_common::labels::{add_finalizer, remove_finalizer, MACHINE_TEMPLATE_FINALIZER};
use caph_common::rate_limit::Gate;
use caph_common::{Error, Result};

use crate::context::Context;
use crate::scope::Scope;
use crate::secrets::{credentials_failure, mark_token_availability};
use crate::services::machine_template::reconcile_capacity;
use crate::{owners, ERROR_REQUEUE};

/// Reconcile an HCloudMachineTemplate
#[instrument(skip(template, ctx), fields(template = %template.name_any()))]
pub async fn reconcile(template: Arc<HCloudMachineTemplate>, ctx: Arc<Context>) -> Result<Action> {
    let mut scope = Scope::open(ctx.store.clone(), (*template).clone())?;
    if template.meta().deletion_timestamp.is_some() {
        remove_finalizer(
            &mut scope.object_mut().metadata.finalizers,
            MACHINE_TEMPLATE_FINALIZER,
        );
        return scope.close(Ok(Action::await_change())).await;
    }

    let store = ctx.store.as_ref();
    let Some(cluster) = owners::owner_cluster(store, &template.metadata).await? else {
        return Ok(Action::await_change());
    };
    if is_paused(&cluster, &template.metadata) {
        debug!("reconciliation is paused");
        return Ok(Action::await_change());
    }
    let Some(hetzner_cluster) = owners::infrastructure_cluster(store, &cluster).await? else {
        debug!(cluster = %cluster.name_any(), "HetznerCluster not found yet");
        return Ok(Action::await_change());
    };

    let result = reconcile_normal(&ctx, &mut scope, &hetzner_cluster).await;
    scope.close(result).await
}

async fn reconcile_normal(
    ctx: &Context,
    scope: &mut Scope<HCloudMachineTemplate>,
    cluster: &HetznerCluster,
) -> Result<Action> {
    if add_finalizer(
        &mut scope.object_mut().metadata.finalizers,
        MACHINE_TEMPLATE_FINALIZER,
    ) {
        scope.persist().await?;
    }

    if let Gate::Defer(after) = ctx.rate_limit.check(scope.conditions_mut()) {
        return Ok(Action::requeue(after));
    }
    let credentials = ctx.credentials(cluster, false).await;
    mark_token_availability(scope.conditions_mut(), &credentials);
    let credentials = match credentials {
        Ok(credentials) => credentials,
        Err(e) => return credentials_failure(e),
    };

    reconcile_capacity(credentials.api.as_ref(), scope.object_mut()).await?;
    Ok(Action::await_change())
}

/// Requeue failed template reconciles
pub fn error_policy(
    template: Arc<HCloudMachineTemplate>,
    error: &Error,
    _ctx: Arc<Context>,
) -> Action {
    warn!(template = %template.name_any(), error = %error, "machine template reconcile failed");
    Action::requeue(ERROR_REQUEUE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use caph_common::conditions::types;
    use caph_common::crd::HCloudMachineTemplateSpec;
    use caph_common::HasConditions;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use serde_json::json;

    use crate::hcloud::{ComputeApi, MockComputeApi, MockComputeApiFactory, ServerType};
    use crate::store::fake::FakeStore;
    use crate::testing::{capi_cluster, capi_owner, hetzner_cluster, hetzner_secret, no_workloads};

    fn template() -> HCloudMachineTemplate {
        let spec: HCloudMachineTemplateSpec = serde_json::from_value(json!({
            "template": {"spec": {"type": "cpx31", "imageName": "ubuntu-24.04"}}
        }))
        .expect("valid template");
        let mut template = HCloudMachineTemplate::new("workers", spec);
        template.metadata.namespace = Some("default".to_string());
        template.metadata.owner_references = Some(vec![capi_owner("Cluster", "prod")]);
        template
    }

    fn context(store: Arc<FakeStore>, api: MockComputeApi) -> Arc<Context> {
        let api: Arc<dyn ComputeApi> = Arc::new(api);
        let mut factory = MockComputeApiFactory::new();
        factory.expect_for_token().returning(move |_| api.clone());
        Arc::new(Context::for_testing(store, Arc::new(factory), Arc::new(no_workloads())))
    }

    #[tokio::test]
    async fn capacity_is_published_with_finalizer() {
        let store = Arc::new(FakeStore::new());
        store.insert(&capi_cluster(true));
        store.insert(&hetzner_cluster(json!({})));
        store.insert(&hetzner_secret("secret-token"));
        store.insert(&template());
        let mut api = MockComputeApi::new();
        api.expect_list_server_types().returning(|| {
            Ok(vec![ServerType {
                id: 1,
                name: "cpx31".to_string(),
                cores: 4,
                memory: 8.0,
            }])
        });

        reconcile(Arc::new(template()), context(store.clone(), api))
            .await
            .expect("reconciled");

        let stored: HCloudMachineTemplate = store.read("default", "workers").expect("template");
        assert!(stored.finalizers().iter().any(|f| f == MACHINE_TEMPLATE_FINALIZER));
        assert!(stored.conditions().is_true(types::CAPACITY_READY));
        assert_eq!(stored.status.expect("status").capacity.len(), 2);
    }

    #[tokio::test]
    async fn deletion_only_drops_the_finalizer() {
        let store = Arc::new(FakeStore::new());
        let mut deleting = template();
        deleting.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        deleting.metadata.finalizers = Some(vec![MACHINE_TEMPLATE_FINALIZER.to_string()]);
        store.insert(&deleting);
        let mut api = MockComputeApi::new();
        api.expect_list_server_types().never();

        reconcile(Arc::new(deleting), context(store.clone(), api))
            .await
            .expect("reconciled");
        assert!(store.read::<HCloudMachineTemplate>("default", "workers").is_none());
    }
}
