//! Custom Resource Definitions served and consumed by the provider
//!
//! The infrastructure kinds are served by this provider. The `capi` module
//! holds partial projections of the Cluster API kinds we read and patch; their
//! CRDs are installed by Cluster API itself.

pub mod capi;
mod baremetal;
mod hcloud_machine;
mod hetzner_cluster;
mod machine_template;
mod remediation;

pub use baremetal::{
    HetznerBareMetalHost, HetznerBareMetalHostSpec, HetznerBareMetalMachine,
    HetznerBareMetalMachineSpec, HetznerBareMetalRemediation, HetznerBareMetalRemediationSpec,
    HostProvisioningStatus, ProvisioningState, RebootAnnotationArguments, RebootType,
};
pub use hcloud_machine::{
    provider_id, server_id_from_provider_id, AddressType, HCloudMachine, HCloudMachineSpec,
    HCloudMachineStatus, InstanceState, MachineAddress, PublicNetworkSpec, SshKey,
    PROVIDER_ID_PREFIX,
};
pub use hetzner_cluster::{
    ApiEndpoint, FailureDomain, HCloudNetworkSpec, HetznerCluster, HetznerClusterSpec,
    HetznerClusterStatus, HetznerSecretKeyRef, HetznerSecretRef, LoadBalancerAlgorithm,
    LoadBalancerServiceSpec, LoadBalancerSpec, LoadBalancerStatus, NetworkStatus,
    PlacementGroupSpec, PlacementGroupStatus, SshKeysSpec, DEFAULT_API_SERVER_PORT,
};
pub use machine_template::{
    HCloudMachineTemplate, HCloudMachineTemplateResource, HCloudMachineTemplateSpec,
    HCloudMachineTemplateStatus,
};
pub use remediation::{
    parse_duration, HCloudRemediation, HCloudRemediationSpec, RemediationPhase,
    RemediationStatus, RemediationStrategy, RemediationType,
};

use kube::core::ObjectMeta;

/// `namespace/name` of an object, for logs and error messages
pub fn object_key(meta: &ObjectMeta) -> String {
    format!(
        "{}/{}",
        meta.namespace.as_deref().unwrap_or_default(),
        meta.name.as_deref().unwrap_or_default()
    )
}
