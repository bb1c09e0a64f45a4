//! HCloudMachineTemplate CRD

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::HCloudMachineSpec;
use crate::conditions::Conditions;
use crate::impl_has_conditions;

/// Template for HCloudMachines created by MachineDeployments and control planes.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1beta1",
    kind = "HCloudMachineTemplate",
    namespaced,
    status = "HCloudMachineTemplateStatus",
    shortname = "hcmt",
    category = "cluster-api",
    printcolumn = r#"{"name":"Image","type":"string","jsonPath":".spec.template.spec.imageName"}"#,
    printcolumn = r#"{"name":"Type","type":"string","jsonPath":".spec.template.spec.type"}"#
)]
pub struct HCloudMachineTemplateSpec {
    /// Machine stamped out from this template
    pub template: HCloudMachineTemplateResource,
}

/// Body of the template
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct HCloudMachineTemplateResource {
    /// Spec of created machines
    pub spec: HCloudMachineSpec,
}

/// Observed state of a template
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct HCloudMachineTemplateStatus {
    /// Resources of one machine, read by the autoscaler when scaling from zero
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub capacity: BTreeMap<String, Quantity>,

    /// Conditions
    #[serde(default)]
    pub conditions: Conditions,
}

impl_has_conditions!(HCloudMachineTemplate);

impl HCloudMachineTemplate {
    /// Mutable status, created on first use
    pub fn status_mut(&mut self) -> &mut HCloudMachineTemplateStatus {
        self.status.get_or_insert_with(Default::default)
    }
}
