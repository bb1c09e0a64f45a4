//! Partial views of the Cluster API `Cluster` and `Machine` kinds
//!
//! Only the fields the infrastructure controllers read are modelled. Their
//! CRDs belong to Cluster API and are never installed by this provider.

use k8s_openapi::api::core::v1::ObjectReference;
use kube::core::ObjectMeta;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::ApiEndpoint;
use crate::conditions::Conditions;
use crate::impl_has_conditions;
use crate::labels::{has_paused_annotation, CONTROL_PLANE_LABEL};

/// API group of the Cluster API core kinds
pub const CAPI_GROUP: &str = "cluster.x-k8s.io";

/// CAPI Cluster
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cluster.x-k8s.io",
    version = "v1beta1",
    kind = "Cluster",
    namespaced,
    status = "ClusterStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Stops reconciliation of the cluster and everything in it
    #[serde(default)]
    pub paused: bool,

    /// API server endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane_endpoint: Option<ApiEndpoint>,

    /// The infrastructure cluster (our HetznerCluster)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub infrastructure_ref: Option<ObjectReference>,
}

/// Observed state of a CAPI cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    /// Control plane answers requests
    #[serde(default)]
    pub control_plane_ready: bool,

    /// Infrastructure reported ready
    #[serde(default)]
    pub infrastructure_ready: bool,

    /// Lifecycle phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,

    /// Conditions
    #[serde(default)]
    pub conditions: Conditions,
}

impl Cluster {
    /// Whether the CAPI control plane is ready
    pub fn control_plane_ready(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.control_plane_ready)
    }
}

/// CAPI Machine
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cluster.x-k8s.io",
    version = "v1beta1",
    kind = "Machine",
    namespaced,
    status = "MachineStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct MachineSpec {
    /// Owning cluster
    #[serde(default)]
    pub cluster_name: String,

    /// Bootstrap configuration
    #[serde(default)]
    pub bootstrap: Bootstrap,

    /// Infrastructure machine (our HCloudMachine)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub infrastructure_ref: Option<ObjectReference>,

    /// Provider ID copied from the infrastructure machine
    #[serde(rename = "providerID", default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,

    /// Failure domain the machine should be placed in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_domain: Option<String>,
}

/// Bootstrap part of a machine spec
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Bootstrap {
    /// Secret holding the cloud-init user data, set once bootstrap is done
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_secret_name: Option<String>,
}

/// Observed state of a CAPI machine
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineStatus {
    /// Lifecycle phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,

    /// Conditions
    #[serde(default)]
    pub conditions: Conditions,
}

impl_has_conditions!(Machine);

impl Machine {
    /// Whether this machine is part of the control plane
    pub fn is_control_plane(&self) -> bool {
        self.metadata
            .labels
            .as_ref()
            .is_some_and(|l| l.contains_key(CONTROL_PLANE_LABEL))
    }
}

/// Name of the owner of `meta` with the given CAPI kind
pub fn owner_name(meta: &ObjectMeta, kind: &str) -> Option<String> {
    meta.owner_references.as_ref()?.iter().find_map(|owner| {
        let group = owner.api_version.split('/').next().unwrap_or_default();
        (owner.kind == kind && group == CAPI_GROUP).then(|| owner.name.clone())
    })
}

/// Whether reconciliation is paused by the cluster or the object itself
pub fn is_paused(cluster: &Cluster, meta: &ObjectMeta) -> bool {
    cluster.spec.paused
        || meta
            .annotations
            .as_ref()
            .is_some_and(has_paused_annotation)
}
