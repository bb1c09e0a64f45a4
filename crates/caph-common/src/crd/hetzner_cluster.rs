//! HetznerCluster CRD
//!
//! Infrastructure side of a Cluster API cluster: the private network, the
//! control-plane load balancer, placement groups and the credentials used to
//! manage them.

use std::collections::BTreeMap;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::conditions::Conditions;
use crate::impl_has_conditions;
use crate::labels::CLUSTER_NAME_LABEL;

/// Default port of the Kubernetes API behind the load balancer
pub const DEFAULT_API_SERVER_PORT: u16 = 6443;

/// HetznerCluster defines the cloud resources shared by all machines of a cluster.
///
/// Example:
/// ```yaml
/// apiVersion: infrastructure.cluster.x-k8s.io/v1beta1
/// kind: HetznerCluster
/// metadata:
///   name: prod
/// spec:
///   controlPlaneRegions: [fsn1]
///   hcloudNetwork:
///     enabled: true
///   controlPlaneLoadBalancer:
///     region: fsn1
///   hetznerSecretRef:
///     name: hetzner
///     key:
///       hcloudToken: hcloud
/// ```
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1beta1",
    kind = "HetznerCluster",
    namespaced,
    status = "HetznerClusterStatus",
    shortname = "capihc",
    category = "cluster-api",
    printcolumn = r#"{"name":"Cluster","type":"string","jsonPath":".metadata.labels.cluster\\.x-k8s\\.io/cluster-name"}"#,
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"Endpoint","type":"string","jsonPath":".spec.controlPlaneEndpoint.host"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct HetznerClusterSpec {
    /// Private network for the cluster
    #[serde(default)]
    pub hcloud_network: HCloudNetworkSpec,

    /// Regions control-plane machines may be placed in (failure domains)
    #[serde(default)]
    pub control_plane_regions: Vec<String>,

    /// Endpoint of the workload API server; filled from the load balancer
    /// when it is enabled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane_endpoint: Option<ApiEndpoint>,

    /// Load balancer in front of the control plane
    #[serde(default)]
    pub control_plane_load_balancer: LoadBalancerSpec,

    /// Placement groups machines can join
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hcloud_placement_groups: Vec<PlacementGroupSpec>,

    /// Secret holding the cloud token
    pub hetzner_secret_ref: HetznerSecretRef,

    /// SSH keys added to every server
    #[serde(default)]
    pub ssh_keys: SshKeysSpec,
}

/// Private network settings
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HCloudNetworkSpec {
    /// Whether the cluster gets a private network
    #[serde(default)]
    pub enabled: bool,

    /// Network range
    #[serde(default = "default_cidr_block")]
    pub cidr_block: String,

    /// Subnet range servers are attached to
    #[serde(default = "default_subnet_cidr_block")]
    pub subnet_cidr_block: String,

    /// Network zone of the subnet
    #[serde(default = "default_network_zone")]
    pub network_zone: String,
}

fn default_cidr_block() -> String {
    "10.0.0.0/16".to_string()
}

fn default_subnet_cidr_block() -> String {
    "10.0.0.0/24".to_string()
}

fn default_network_zone() -> String {
    "eu-central".to_string()
}

impl Default for HCloudNetworkSpec {
    fn default() -> Self {
        Self {
            enabled: false,
            cidr_block: default_cidr_block(),
            subnet_cidr_block: default_subnet_cidr_block(),
            network_zone: default_network_zone(),
        }
    }
}

/// Host and port of an API server
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ApiEndpoint {
    /// Hostname or IP
    #[serde(default)]
    pub host: String,
    /// Port
    #[serde(default)]
    pub port: u16,
}

impl ApiEndpoint {
    /// Whether a host is set
    pub fn is_set(&self) -> bool {
        !self.host.is_empty()
    }
}

/// Load balancing algorithm
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancerAlgorithm {
    /// Round robin
    #[default]
    RoundRobin,
    /// Fewest open connections
    LeastConnections,
}

impl LoadBalancerAlgorithm {
    /// Name used by the cloud API
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::LeastConnections => "least_connections",
        }
    }
}

/// Control-plane load balancer settings
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerSpec {
    /// Whether to create the load balancer
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Name; defaults to `<cluster>-kube-apiserver`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Load balancer type (e.g. lb11)
    #[serde(rename = "type", default = "default_lb_type")]
    pub type_: String,

    /// Balancing algorithm
    #[serde(default)]
    pub algorithm: LoadBalancerAlgorithm,

    /// Listen port of the API server service
    #[serde(default = "default_port")]
    pub port: u16,

    /// Location of the load balancer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,

    /// Services beyond the API server
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_services: Vec<LoadBalancerServiceSpec>,
}

fn default_true() -> bool {
    true
}

fn default_lb_type() -> String {
    "lb11".to_string()
}

fn default_port() -> u16 {
    DEFAULT_API_SERVER_PORT
}

impl Default for LoadBalancerSpec {
    fn default() -> Self {
        Self {
            enabled: true,
            name: None,
            type_: default_lb_type(),
            algorithm: LoadBalancerAlgorithm::default(),
            port: DEFAULT_API_SERVER_PORT,
            region: None,
            extra_services: Vec::new(),
        }
    }
}

/// One load balancer service
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerServiceSpec {
    /// tcp, http or https
    #[serde(default = "default_protocol")]
    pub protocol: String,
    /// Port the load balancer listens on
    pub listen_port: u16,
    /// Port on the targets
    pub destination_port: u16,
}

fn default_protocol() -> String {
    "tcp".to_string()
}

/// Desired placement group
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct PlacementGroupSpec {
    /// Name, unique within the cluster
    pub name: String,
    /// Placement group type
    #[serde(rename = "type", default = "default_placement_group_type")]
    pub type_: String,
}

fn default_placement_group_type() -> String {
    "spread".to_string()
}

/// Reference to the credentials secret
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct HetznerSecretRef {
    /// Secret name, in the namespace of the cluster
    pub name: String,
    /// Keys inside the secret
    #[serde(default)]
    pub key: HetznerSecretKeyRef,
}

/// Keys inside the credentials secret
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HetznerSecretKeyRef {
    /// Key holding the cloud API token
    #[serde(default = "default_token_key")]
    pub hcloud_token: String,
}

fn default_token_key() -> String {
    "hcloud".to_string()
}

impl Default for HetznerSecretKeyRef {
    fn default() -> Self {
        Self {
            hcloud_token: default_token_key(),
        }
    }
}

/// SSH keys known to the cloud project
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct SshKeysSpec {
    /// Keys by name
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hcloud: Vec<super::SshKey>,
}

/// Observed state of a HetznerCluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HetznerClusterStatus {
    /// Infrastructure is ready for machines
    #[serde(default)]
    pub ready: bool,

    /// The cluster network
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_status: Option<NetworkStatus>,

    /// The control-plane load balancer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane_load_balancer: Option<LoadBalancerStatus>,

    /// Placement groups that exist in the cloud
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hcloud_placement_groups: Vec<PlacementGroupStatus>,

    /// Failure domains derived from the control-plane regions
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub failure_domains: BTreeMap<String, FailureDomain>,

    /// Conditions
    #[serde(default)]
    pub conditions: Conditions,
}

/// Observed network
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStatus {
    /// Cloud ID
    pub id: i64,
    /// Servers attached to the network
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attached_servers: Vec<i64>,
}

/// Observed load balancer
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerStatus {
    /// Cloud ID
    pub id: i64,
    /// Name
    #[serde(default)]
    pub name: String,
    /// Type
    #[serde(rename = "type", default)]
    pub type_: String,
    /// Algorithm
    #[serde(default)]
    pub algorithm: LoadBalancerAlgorithm,
    /// Public IPv4
    #[serde(default, rename = "ipv4", skip_serializing_if = "Option::is_none")]
    pub ipv4: Option<String>,
    /// Public IPv6
    #[serde(default, rename = "ipv6", skip_serializing_if = "Option::is_none")]
    pub ipv6: Option<String>,
    /// Address inside the cluster network
    #[serde(default, rename = "internalIP", skip_serializing_if = "Option::is_none")]
    pub internal_ip: Option<String>,
    /// Server IDs registered as targets
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<i64>,
    /// Whether the load balancer is attached to the cluster network
    #[serde(default)]
    pub attached_to_network: bool,
    /// Delete protection as reported by the cloud
    #[serde(default)]
    pub protected: bool,
}

/// Observed placement group
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct PlacementGroupStatus {
    /// Cloud ID
    pub id: i64,
    /// Name as given in the spec (without cluster prefix)
    pub name: String,
    /// Type
    #[serde(rename = "type", default)]
    pub type_: String,
    /// Member servers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub servers: Vec<i64>,
}

/// A failure domain
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FailureDomain {
    /// Whether control-plane machines may be placed here
    #[serde(default)]
    pub control_plane: bool,
}

impl_has_conditions!(HetznerCluster);

impl HetznerCluster {
    /// Name of the CAPI cluster, from the cluster-name label or our own name
    pub fn cluster_name(&self) -> String {
        self.labels()
            .get(CLUSTER_NAME_LABEL)
            .cloned()
            .unwrap_or_else(|| self.name_any())
    }

    /// Name of the control-plane load balancer
    pub fn load_balancer_name(&self) -> String {
        self.spec
            .control_plane_load_balancer
            .name
            .clone()
            .unwrap_or_else(|| format!("{}-kube-apiserver", self.name_any()))
    }

    /// Mutable status, created on first use
    pub fn status_mut(&mut self) -> &mut HetznerClusterStatus {
        self.status.get_or_insert_with(Default::default)
    }

    /// Cloud ID of the cluster network, if it exists
    pub fn network_id(&self) -> Option<i64> {
        self.status
            .as_ref()
            .and_then(|s| s.network_status.as_ref())
            .map(|n| n.id)
    }
}
