//! Walking the owner chain up to the CAPI cluster
//!
//! A missing link is not an error: CAPI sets owner references after creating
//! our objects and the watches requeue us once it has.

use kube::core::ObjectMeta;
use kube::ResourceExt;
use tracing::debug;

use caph_common::crd::capi::{owner_name, Cluster, Machine};
use caph_common::crd::HetznerCluster;
use caph_common::labels::CLUSTER_NAME_LABEL;
use caph_common::Result;

use crate::store::{self, ObjectStore};

/// The CAPI machine owning `meta`
pub async fn owner_machine(store: &dyn ObjectStore, meta: &ObjectMeta) -> Result<Option<Machine>> {
    let Some(name) = owner_name(meta, "Machine") else {
        debug!(name = ?meta.name, "owner machine not set yet");
        return Ok(None);
    };
    let namespace = meta.namespace.clone().unwrap_or_default();
    store::get::<Machine>(store, &namespace, &name).await
}

/// The CAPI cluster owning `meta`
pub async fn owner_cluster(store: &dyn ObjectStore, meta: &ObjectMeta) -> Result<Option<Cluster>> {
    let Some(name) = owner_name(meta, "Cluster") else {
        debug!(name = ?meta.name, "owner cluster not set yet");
        return Ok(None);
    };
    let namespace = meta.namespace.clone().unwrap_or_default();
    store::get::<Cluster>(store, &namespace, &name).await
}

/// The CAPI cluster a machine belongs to
pub async fn machine_cluster(store: &dyn ObjectStore, machine: &Machine) -> Result<Option<Cluster>> {
    let name = if machine.spec.cluster_name.is_empty() {
        match machine.labels().get(CLUSTER_NAME_LABEL) {
            Some(name) => name.clone(),
            None => return Ok(None),
        }
    } else {
        machine.spec.cluster_name.clone()
    };
    store::get::<Cluster>(store, &machine.namespace().unwrap_or_default(), &name).await
}

/// The HetznerCluster backing a CAPI cluster
///
/// Falls back to the cluster's own name when the infrastructure reference
/// is not filled in.
pub async fn infrastructure_cluster(
    store: &dyn ObjectStore,
    cluster: &Cluster,
) -> Result<Option<HetznerCluster>> {
    let name = cluster
        .spec
        .infrastructure_ref
        .as_ref()
        .and_then(|r| r.name.clone())
        .unwrap_or_else(|| cluster.name_any());
    store::get::<HetznerCluster>(store, &cluster.namespace().unwrap_or_default(), &name).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::fake::FakeStore;
    use crate::testing::{capi_cluster, capi_machine, capi_owner, hcloud_machine, hetzner_cluster};
    use k8s_openapi::api::core::v1::ObjectReference;
    use serde_json::json;

    #[tokio::test]
    async fn chain_resolves_from_infrastructure_machine_to_hetzner_cluster() {
        let store = FakeStore::new();
        let mut cluster = capi_cluster(true);
        cluster.spec.infrastructure_ref = Some(ObjectReference {
            name: Some("prod".to_string()),
            ..Default::default()
        });
        store.insert(&cluster);
        store.insert(&capi_machine("cp-0", true));
        store.insert(&hetzner_cluster(json!({})));

        let machine = owner_machine(&store, &hcloud_machine("cp-0").metadata)
            .await
            .expect("lookup")
            .expect("machine");
        let cluster = machine_cluster(&store, &machine).await.expect("lookup").expect("cluster");
        let hetzner = infrastructure_cluster(&store, &cluster)
            .await
            .expect("lookup")
            .expect("hetzner cluster");
        assert_eq!(hetzner.name_any(), "prod");
    }

    #[tokio::test]
    async fn unset_owner_is_not_an_error() {
        let store = FakeStore::new();
        let mut orphan = hcloud_machine("w-0");
        orphan.metadata.owner_references = None;
        assert!(owner_machine(&store, &orphan.metadata).await.expect("lookup").is_none());

        orphan.metadata.owner_references = Some(vec![capi_owner("Cluster", "missing")]);
        assert!(owner_cluster(&store, &orphan.metadata).await.expect("lookup").is_none());
    }
}
