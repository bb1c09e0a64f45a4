//! Bare-metal kinds needed for remediation
//!
//! Only HetznerBareMetalRemediation is reconciled here. The machine and host
//! types are partial views: they carry the fields remediation reads, and the
//! controller only ever merge-patches their annotations.

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::remediation::{RemediationStatus, RemediationStrategy};
use crate::impl_has_conditions;
use crate::labels::HOST_ANNOTATION;

/// Remediation of an unhealthy bare-metal machine by rebooting its host.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1beta1",
    kind = "HetznerBareMetalRemediation",
    namespaced,
    status = "RemediationStatus",
    shortname = "hbr",
    category = "cluster-api",
    printcolumn = r#"{"name":"Strategy","type":"string","jsonPath":".spec.strategy.type"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Retries","type":"integer","jsonPath":".status.retryCount"}"#
)]
pub struct HetznerBareMetalRemediationSpec {
    /// How to remediate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<RemediationStrategy>,
}

impl_has_conditions!(HetznerBareMetalRemediation);

impl HetznerBareMetalRemediation {
    /// Mutable status, created on first use
    pub fn status_mut(&mut self) -> &mut RemediationStatus {
        self.status.get_or_insert_with(Default::default)
    }
}

/// View of a bare-metal machine
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1beta1",
    kind = "HetznerBareMetalMachine",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct HetznerBareMetalMachineSpec {
    /// Provider ID once provisioned
    #[serde(rename = "providerID", default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
}

impl HetznerBareMetalMachine {
    /// `(namespace, name)` of the host this machine runs on, from its host annotation
    pub fn host_key(&self) -> crate::Result<(String, String)> {
        let key = self.annotations().get(HOST_ANNOTATION).ok_or_else(|| {
            crate::Error::validation_for(self.name_any(), "host annotation is not set")
        })?;
        match key.split('/').collect::<Vec<_>>().as_slice() {
            [namespace, name] if !namespace.is_empty() && !name.is_empty() => {
                Ok((namespace.to_string(), name.to_string()))
            }
            _ => Err(crate::Error::validation_for(
                self.name_any(),
                format!("unexpected host key {key:?}"),
            )),
        }
    }
}

/// View of a bare-metal host
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1beta1",
    kind = "HetznerBareMetalHost",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct HetznerBareMetalHostSpec {
    /// Host is taken out of service and must not be rebooted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maintenance_mode: Option<bool>,

    /// Status written by the host controller
    #[serde(default)]
    pub status: HostProvisioningStatus,
}

/// Provisioning part of the host status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HostProvisioningStatus {
    /// Where the host is in its provisioning lifecycle
    #[serde(default)]
    pub provisioning_state: ProvisioningState,
}

/// Provisioning state of a host
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProvisioningState {
    /// Not known yet
    #[default]
    #[serde(rename = "")]
    None,
    /// Not managed
    Unmanaged,
    /// Being registered
    Registering,
    /// Free for use
    Available,
    /// Being prepared
    Preparing,
    /// Prepared
    Prepared,
    /// Image being installed
    Provisioning,
    /// Running its image
    Provisioned,
    /// Image being removed
    Deprovisioning,
    /// Being cleaned up for deletion
    Deleting,
}

impl HetznerBareMetalHost {
    /// Whether the host runs a provisioned machine
    pub fn is_provisioned(&self) -> bool {
        self.spec.status.provisioning_state == ProvisioningState::Provisioned
    }

    /// Whether the host is in maintenance mode
    pub fn in_maintenance(&self) -> bool {
        self.spec.maintenance_mode.unwrap_or(false)
    }
}

/// Kind of reboot requested through the reboot annotation
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RebootType {
    /// Hardware reset
    Hardware,
    /// Ctrl-alt-del style reboot
    Software,
}

/// Value of the reboot annotation on a host
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct RebootAnnotationArguments {
    /// Kind of reboot
    #[serde(rename = "type")]
    pub type_: RebootType,
}
