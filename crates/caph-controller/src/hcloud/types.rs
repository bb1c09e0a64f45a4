//! Wire types of the cloud REST API
//!
//! Only the fields the controllers use are modelled; unknown fields are
//! ignored on decode.

use std::collections::BTreeMap;

use caph_common::crd::InstanceState;
use serde::{Deserialize, Serialize};

/// A cloud server
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct Server {
    /// ID
    pub id: i64,
    /// Name
    pub name: String,
    /// Power and lifecycle status
    #[serde(default)]
    pub status: InstanceState,
    /// Public interfaces
    #[serde(default)]
    pub public_net: ServerPublicNet,
    /// Private network attachments
    #[serde(default)]
    pub private_net: Vec<PrivateNet>,
    /// Where the server runs
    #[serde(default)]
    pub datacenter: Option<Datacenter>,
    /// Labels
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl Server {
    /// Location name, if known
    pub fn location(&self) -> Option<&str> {
        self.datacenter.as_ref().map(|d| d.location.name.as_str())
    }
}

/// Public interfaces of a server or load balancer
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct ServerPublicNet {
    /// Public IPv4
    #[serde(default)]
    pub ipv4: Option<IpAddressInfo>,
    /// Public IPv6 network
    #[serde(default)]
    pub ipv6: Option<IpAddressInfo>,
}

/// An address as reported by the API
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct IpAddressInfo {
    /// Address, or network in CIDR notation for IPv6 servers
    pub ip: String,
}

/// Attachment to a private network
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct PrivateNet {
    /// Network ID
    pub network: i64,
    /// Address inside the network
    pub ip: String,
}

/// Datacenter of a server
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct Datacenter {
    /// Location of the datacenter
    pub location: Location,
}

/// A location
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct Location {
    /// Name, e.g. fsn1
    pub name: String,
}

/// Body of a server create call
#[derive(Clone, Debug, Default, Serialize, PartialEq)]
pub struct ServerCreateOpts {
    /// Name
    pub name: String,
    /// Server type name
    pub server_type: String,
    /// Image ID or name
    pub image: String,
    /// Location name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    /// Labels
    pub labels: BTreeMap<String, String>,
    /// Cloud-init user data
    pub user_data: String,
    /// SSH key names
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ssh_keys: Vec<String>,
    /// Networks to attach on creation
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub networks: Vec<i64>,
    /// Placement group to join
    #[serde(skip_serializing_if = "Option::is_none")]
    pub placement_group: Option<i64>,
    /// Public interfaces
    pub public_net: PublicNetOpts,
    /// Start the server right after creation
    pub start_after_create: bool,
    /// Automount attached volumes
    pub automount: bool,
}

/// Which public interfaces a new server gets
#[derive(Clone, Debug, Default, Serialize, PartialEq)]
pub struct PublicNetOpts {
    /// Public IPv4
    pub enable_ipv4: bool,
    /// Public IPv6
    pub enable_ipv6: bool,
}

/// A private network
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct Network {
    /// ID
    pub id: i64,
    /// Name
    pub name: String,
    /// Network range
    #[serde(default)]
    pub ip_range: String,
    /// Subnets
    #[serde(default)]
    pub subnets: Vec<NetworkSubnet>,
    /// Attached servers
    #[serde(default)]
    pub servers: Vec<i64>,
    /// Labels
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Subnet of a network
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct NetworkSubnet {
    /// Subnet type; always `cloud` for server subnets
    #[serde(rename = "type")]
    pub type_: String,
    /// Subnet range
    pub ip_range: String,
    /// Network zone
    pub network_zone: String,
}

/// Body of a network create call
#[derive(Clone, Debug, Default, Serialize, PartialEq)]
pub struct NetworkCreateOpts {
    /// Name
    pub name: String,
    /// Network range
    pub ip_range: String,
    /// Subnets
    pub subnets: Vec<NetworkSubnet>,
    /// Labels
    pub labels: BTreeMap<String, String>,
}

/// A load balancer
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct LoadBalancer {
    /// ID
    pub id: i64,
    /// Name
    pub name: String,
    /// Public interfaces
    #[serde(default)]
    pub public_net: ServerPublicNet,
    /// Private network attachments
    #[serde(default)]
    pub private_net: Vec<PrivateNet>,
    /// Balancing algorithm
    pub algorithm: AlgorithmInfo,
    /// Type
    pub load_balancer_type: LoadBalancerTypeInfo,
    /// Services
    #[serde(default)]
    pub services: Vec<LoadBalancerService>,
    /// Targets
    #[serde(default)]
    pub targets: Vec<LoadBalancerTarget>,
    /// Protection flags
    #[serde(default)]
    pub protection: Protection,
    /// Labels
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Algorithm of a load balancer
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct AlgorithmInfo {
    /// `round_robin` or `least_connections`
    #[serde(rename = "type")]
    pub type_: String,
}

/// Type of a load balancer
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct LoadBalancerTypeInfo {
    /// Name, e.g. lb11
    pub name: String,
}

/// One service of a load balancer
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct LoadBalancerService {
    /// tcp, http or https
    pub protocol: String,
    /// Port the load balancer listens on
    pub listen_port: u16,
    /// Port on the targets
    pub destination_port: u16,
    /// Send the PROXY protocol header
    #[serde(default)]
    pub proxyprotocol: bool,
}

/// A target of a load balancer
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct LoadBalancerTarget {
    /// `server`, `ip` or `label_selector`
    #[serde(rename = "type")]
    pub type_: String,
    /// Server, for server targets
    #[serde(default)]
    pub server: Option<TargetServer>,
}

/// Server reference inside a target
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct TargetServer {
    /// Server ID
    pub id: i64,
}

/// Protection flags
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct Protection {
    /// Deletion is blocked
    #[serde(default)]
    pub delete: bool,
}

/// Body of a load balancer create call
#[derive(Clone, Debug, Default, Serialize, PartialEq)]
pub struct LoadBalancerCreateOpts {
    /// Name
    pub name: String,
    /// Type name
    pub load_balancer_type: String,
    /// Algorithm
    pub algorithm: AlgorithmInfo,
    /// Location name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    /// Network to attach on creation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<i64>,
    /// Labels
    pub labels: BTreeMap<String, String>,
    /// Services
    pub services: Vec<LoadBalancerService>,
}

/// A placement group
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct PlacementGroup {
    /// ID
    pub id: i64,
    /// Name
    pub name: String,
    /// Type, e.g. spread
    #[serde(rename = "type")]
    pub type_: String,
    /// Member servers
    #[serde(default)]
    pub servers: Vec<i64>,
    /// Labels
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Body of a placement group create call
#[derive(Clone, Debug, Default, Serialize, PartialEq)]
pub struct PlacementGroupCreateOpts {
    /// Name
    pub name: String,
    /// Type
    #[serde(rename = "type")]
    pub type_: String,
    /// Labels
    pub labels: BTreeMap<String, String>,
}

/// A server type
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct ServerType {
    /// ID
    pub id: i64,
    /// Name, e.g. cpx31
    pub name: String,
    /// Number of vCPUs
    pub cores: u32,
    /// Memory in GB
    pub memory: f64,
}

/// An image or snapshot
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct Image {
    /// ID
    pub id: i64,
    /// Name; snapshots have none
    #[serde(default)]
    pub name: Option<String>,
    /// Labels
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Filter for image listing
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ImageQuery {
    /// Exact name
    pub name: Option<String>,
    /// Label selector
    pub label_selector: Option<String>,
}
