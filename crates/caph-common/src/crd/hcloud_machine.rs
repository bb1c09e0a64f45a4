//! HCloudMachine CRD

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::conditions::{reasons, types, ConditionSeverity, Conditions};
use crate::impl_has_conditions;

/// Prefix of provider IDs of cloud servers
pub const PROVIDER_ID_PREFIX: &str = "hcloud://";

/// HCloudMachine is one cloud server backing a CAPI Machine.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1beta1",
    kind = "HCloudMachine",
    namespaced,
    status = "HCloudMachineStatus",
    shortname = "hcma",
    category = "cluster-api",
    printcolumn = r#"{"name":"Cluster","type":"string","jsonPath":".metadata.labels.cluster\\.x-k8s\\.io/cluster-name"}"#,
    printcolumn = r#"{"name":"Image","type":"string","jsonPath":".spec.imageName"}"#,
    printcolumn = r#"{"name":"Type","type":"string","jsonPath":".spec.type"}"#,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.instanceState"}"#,
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"ProviderID","type":"string","jsonPath":".spec.providerID"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct HCloudMachineSpec {
    /// `hcloud://<server id>` once the server exists
    #[serde(rename = "providerID", default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,

    /// Server type, e.g. cpx31
    #[serde(rename = "type")]
    pub type_: String,

    /// Image name, or value of the `caph-image-name` label on a snapshot
    pub image_name: String,

    /// Extra SSH keys for this machine only
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ssh_keys: Vec<SshKey>,

    /// Placement group (from the cluster spec) to join
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placement_group_name: Option<String>,

    /// Public interfaces of the server
    #[serde(default)]
    pub public_network: PublicNetworkSpec,
}

/// An SSH key registered in the cloud project
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct SshKey {
    /// Name of the key
    pub name: String,
    /// Fingerprint, informational only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

/// Public IPs of a server
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PublicNetworkSpec {
    /// Assign a public IPv4
    #[serde(default = "default_true")]
    pub enable_ipv4: bool,
    /// Assign a public IPv6
    #[serde(default = "default_true")]
    pub enable_ipv6: bool,
}

fn default_true() -> bool {
    true
}

impl Default for PublicNetworkSpec {
    fn default() -> Self {
        Self {
            enable_ipv4: true,
            enable_ipv6: true,
        }
    }
}

/// Server status as reported by the cloud
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    /// Powered on
    Running,
    /// Being created
    Initializing,
    /// Powering on
    Starting,
    /// Powering off
    Stopping,
    /// Powered off
    Off,
    /// Being deleted
    Deleting,
    /// Moving between hosts
    Migrating,
    /// Image being rewritten
    Rebuilding,
    /// Anything else
    #[default]
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Initializing => "initializing",
            Self::Starting => "starting",
            Self::Stopping => "stopping",
            Self::Off => "off",
            Self::Deleting => "deleting",
            Self::Migrating => "migrating",
            Self::Rebuilding => "rebuilding",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Kind of a machine address
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum AddressType {
    /// Hostname
    Hostname,
    /// Public IP
    ExternalIP,
    /// Private network IP
    InternalIP,
}

/// One address of a machine, in the CAPI `MachineAddress` shape
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct MachineAddress {
    /// Address kind
    #[serde(rename = "type")]
    pub type_: AddressType,
    /// The address
    pub address: String,
}

/// Observed state of an HCloudMachine
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HCloudMachineStatus {
    /// Server exists and is running
    #[serde(default)]
    pub ready: bool,

    /// Addresses of the server
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<MachineAddress>,

    /// Location of the server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,

    /// Last observed server status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_state: Option<InstanceState>,

    /// Lifecycle step of the machine controller (e.g. `Initializing`,
    /// `WaitForServerRunning`, `Ready`, `ShuttingDown`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boot_state: Option<String>,

    /// Terminal failure reason for CAPI
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,

    /// Terminal failure message for CAPI
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,

    /// Conditions
    #[serde(default)]
    pub conditions: Conditions,
}

impl_has_conditions!(HCloudMachine);

impl HCloudMachine {
    /// Mutable status, created on first use
    pub fn status_mut(&mut self) -> &mut HCloudMachineStatus {
        self.status.get_or_insert_with(Default::default)
    }

    /// Server ID parsed from the provider ID
    pub fn server_id(&self) -> Result<i64, crate::Error> {
        server_id_from_provider_id(self.spec.provider_id.as_deref())
    }

    /// Record a terminal failure for CAPI to act on
    pub fn set_failure(&mut self, reason: &str, message: impl Into<String>) {
        let status = self.status_mut();
        status.failure_reason = Some(reason.to_string());
        status.failure_message = Some(message.into());
    }

    /// Whether the machine was flagged for replacement
    pub fn remediation_requested(&self) -> bool {
        use crate::conditions::HasConditions;
        self.conditions()
            .is_false(types::NO_REMEDIATE_MACHINE_ANNOTATION)
    }

    /// Flag the machine for replacement
    pub fn mark_remediation_requested(&mut self) {
        use crate::conditions::HasConditions;
        self.conditions_mut().mark_false(
            types::NO_REMEDIATE_MACHINE_ANNOTATION,
            reasons::REMEDIATE_MACHINE_ANNOTATION_IS_SET,
            ConditionSeverity::Info,
            "machine is marked for remediation",
        );
    }
}

/// Provider ID for a server
pub fn provider_id(server_id: i64) -> String {
    format!("{PROVIDER_ID_PREFIX}{server_id}")
}

/// Parse `hcloud://<id>` into the server ID
///
/// Rejects a missing or empty provider ID, a foreign prefix and IDs that are
/// not positive integers.
pub fn server_id_from_provider_id(provider_id: Option<&str>) -> Result<i64, crate::Error> {
    let raw = match provider_id {
        None | Some("") => {
            return Err(crate::Error::validation_for(
                "providerID",
                "provider ID is not set",
            ))
        }
        Some(raw) => raw,
    };
    let id = raw.strip_prefix(PROVIDER_ID_PREFIX).ok_or_else(|| {
        crate::Error::validation_for("providerID", format!("{raw}: missing prefix {PROVIDER_ID_PREFIX}"))
    })?;
    match id.parse::<i64>() {
        Ok(id) if id > 0 => Ok(id),
        _ => Err(crate::Error::validation_for(
            "providerID",
            format!("{raw}: server ID is not a positive number"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_id_parses_only_well_formed_values() {
        assert_eq!(server_id_from_provider_id(Some("hcloud://42")).ok(), Some(42));
        assert!(server_id_from_provider_id(None).is_err());
        assert!(server_id_from_provider_id(Some("")).is_err());
        assert!(server_id_from_provider_id(Some("aws://42")).is_err());
        assert!(server_id_from_provider_id(Some("hcloud://abc")).is_err());
        assert!(server_id_from_provider_id(Some("hcloud://-1")).is_err());
        assert_eq!(provider_id(7), "hcloud://7");
    }

    #[test]
    fn unknown_instance_states_do_not_break_decoding() {
        let state: InstanceState = serde_json::from_str("\"rebooting\"").expect("decodes");
        assert_eq!(state, InstanceState::Unknown);
        let state: InstanceState = serde_json::from_str("\"off\"").expect("decodes");
        assert_eq!(state, InstanceState::Off);
    }

    #[test]
    fn remediation_flag_lives_in_conditions() {
        let mut machine = HCloudMachine::new(
            "worker-0",
            HCloudMachineSpec {
                provider_id: None,
                type_: "cpx31".to_string(),
                image_name: "ubuntu-24.04".to_string(),
                ssh_keys: vec![],
                placement_group_name: None,
                public_network: PublicNetworkSpec::default(),
            },
        );
        assert!(!machine.remediation_requested());
        machine.mark_remediation_requested();
        assert!(machine.remediation_requested());
    }

    #[test]
    fn spec_uses_provider_id_wire_name() {
        let spec: HCloudMachineSpec = serde_json::from_value(serde_json::json!({
            "providerID": "hcloud://1",
            "type": "cx22",
            "imageName": "ubuntu"
        }))
        .expect("parses");
        assert_eq!(spec.provider_id.as_deref(), Some("hcloud://1"));
        assert!(spec.public_network.enable_ipv4);
    }
}
