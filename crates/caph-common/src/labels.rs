//! Well-known labels, annotations and finalizers
//!
//! Cluster API keys are fixed by the upstream conventions; the `caph-*` keys
//! tag resources in the cloud project so they can be found again by label.

use std::collections::BTreeMap;

/// Label on every CAPI-managed object naming its cluster
pub const CLUSTER_NAME_LABEL: &str = "cluster.x-k8s.io/cluster-name";

/// Label present on control-plane machines
pub const CONTROL_PLANE_LABEL: &str = "cluster.x-k8s.io/control-plane";

/// Annotation pausing reconciliation of a single object
pub const PAUSED_ANNOTATION: &str = "cluster.x-k8s.io/paused";

/// Annotation asking CAPI to remediate (replace) a machine
pub const REMEDIATE_MACHINE_ANNOTATION: &str = "cluster.x-k8s.io/remediate-machine";

/// Annotation on a bare-metal machine naming its host as `namespace/name`
pub const HOST_ANNOTATION: &str = "infrastructure.cluster.x-k8s.io/HetznerBareMetalHost";

/// Annotation on a bare-metal host requesting a reboot
pub const REBOOT_ANNOTATION: &str = "reboot.hetzner.cloud";

/// Finalizer on HetznerCluster objects
pub const CLUSTER_FINALIZER: &str = "hetznercluster.infrastructure.cluster.x-k8s.io";

/// Finalizer on HCloudMachine objects
pub const MACHINE_FINALIZER: &str = "hcloudmachine.infrastructure.cluster.x-k8s.io";

/// Finalizer on HCloudMachineTemplate objects
pub const MACHINE_TEMPLATE_FINALIZER: &str =
    "hcloudmachinetemplate.infrastructure.cluster.x-k8s.io";

/// Finalizer on credential secrets while any owner holds them
pub const SECRET_FINALIZER: &str = "hetznercluster.infrastructure.cluster.x-k8s.io/secret";

/// Prefix of the per-owner marker annotations on credential secrets
pub const SECRET_HOLDER_PREFIX: &str = "holder.secret.caph.syself.com/";

/// Label key claiming a secret for this provider
pub const SECRET_ENVIRONMENT_LABEL: &str = "caph.environment";

/// Value of an owned resource or claimed secret
pub const OWNED: &str = "owned";

/// Cloud label naming the machine a server belongs to
pub const MACHINE_NAME_TAG_KEY: &str = "machine.caph-name";

/// Cloud label on images selectable by name
pub const IMAGE_NAME_TAG_KEY: &str = "caph-image-name";

/// Prefix of the cloud label that ties resources to a cluster
const CLUSTER_TAG_PREFIX: &str = "caph-cluster-";

/// Cloud label key owning resources for `cluster_name`
pub fn cluster_tag_key(cluster_name: &str) -> String {
    format!("{CLUSTER_TAG_PREFIX}{cluster_name}")
}

/// Labels every cloud resource of the cluster carries
pub fn cluster_tags(cluster_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(cluster_tag_key(cluster_name), OWNED.to_string())])
}

/// Label selector matching every cloud resource of the cluster
pub fn cluster_selector(cluster_name: &str) -> String {
    format!("{}=={OWNED}", cluster_tag_key(cluster_name))
}

/// Whether an annotation map carries the paused annotation
pub fn has_paused_annotation(annotations: &BTreeMap<String, String>) -> bool {
    annotations.contains_key(PAUSED_ANNOTATION)
}

/// Whether a finalizer list contains `finalizer`
pub fn has_finalizer(finalizers: Option<&Vec<String>>, finalizer: &str) -> bool {
    finalizers.is_some_and(|f| f.iter().any(|x| x == finalizer))
}

/// Add `finalizer` if missing; returns true when the list changed
pub fn add_finalizer(finalizers: &mut Option<Vec<String>>, finalizer: &str) -> bool {
    let list = finalizers.get_or_insert_with(Vec::new);
    if list.iter().any(|f| f == finalizer) {
        return false;
    }
    list.push(finalizer.to_string());
    true
}

/// Remove `finalizer` if present; returns true when the list changed
pub fn remove_finalizer(finalizers: &mut Option<Vec<String>>, finalizer: &str) -> bool {
    let Some(list) = finalizers.as_mut() else {
        return false;
    };
    let before = list.len();
    list.retain(|f| f != finalizer);
    before != list.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_tags_and_selector_agree() {
        let tags = cluster_tags("prod");
        assert_eq!(tags.get("caph-cluster-prod").map(String::as_str), Some("owned"));
        assert_eq!(cluster_selector("prod"), "caph-cluster-prod==owned");
    }

    #[test]
    fn finalizer_helpers_are_idempotent() {
        let mut finalizers = None;
        assert!(add_finalizer(&mut finalizers, CLUSTER_FINALIZER));
        assert!(!add_finalizer(&mut finalizers, CLUSTER_FINALIZER));
        assert!(has_finalizer(finalizers.as_ref(), CLUSTER_FINALIZER));
        assert!(remove_finalizer(&mut finalizers, CLUSTER_FINALIZER));
        assert!(!remove_finalizer(&mut finalizers, CLUSTER_FINALIZER));
        assert!(!has_finalizer(finalizers.as_ref(), CLUSTER_FINALIZER));
    }
}
