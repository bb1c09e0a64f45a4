//! Fixtures shared by the reconciler tests

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::runtime::events::EventType;
use mockall::mock;
use serde_json::json;

use caph_common::crd::capi::{Cluster, ClusterSpec, Machine, MachineSpec};
use caph_common::crd::{HCloudMachine, HCloudMachineSpec, HetznerCluster, HetznerClusterSpec};
use caph_common::events::EventPublisher;
use caph_common::labels::{CLUSTER_NAME_LABEL, CONTROL_PLANE_LABEL};

// Local mock for EventPublisher since the mockall-generated mock is only
// available within the caph-common crate's test configuration
mock! {
    pub Events {}

    #[async_trait::async_trait]
    impl EventPublisher for Events {
        async fn publish(
            &self,
            resource_ref: &ObjectReference,
            type_: EventType,
            reason: &str,
            action: &str,
            note: Option<String>,
        );
    }
}

/// Publisher that accepts any event
pub fn quiet_events() -> MockEvents {
    let mut events = MockEvents::new();
    events.expect_publish().returning(|_, _, _, _, _| ());
    events
}

/// Owner reference to a CAPI object
pub fn capi_owner(kind: &str, name: &str) -> OwnerReference {
    OwnerReference {
        api_version: "cluster.x-k8s.io/v1beta1".to_string(),
        kind: kind.to_string(),
        name: name.to_string(),
        uid: format!("{name}-uid"),
        ..Default::default()
    }
}

/// HetznerCluster `prod` in `default`, owned by CAPI cluster `prod`
pub fn hetzner_cluster(spec: serde_json::Value) -> HetznerCluster {
    let mut full = json!({"hetznerSecretRef": {"name": "hetzner"}});
    if let (Some(full), Some(extra)) = (full.as_object_mut(), spec.as_object()) {
        full.extend(extra.clone());
    }
    let spec: HetznerClusterSpec = serde_json::from_value(full).expect("valid spec");
    let mut cluster = HetznerCluster::new("prod", spec);
    cluster.metadata.namespace = Some("default".to_string());
    cluster.metadata.uid = Some("hc-uid".to_string());
    cluster.metadata.labels = Some(BTreeMap::from([(
        CLUSTER_NAME_LABEL.to_string(),
        "prod".to_string(),
    )]));
    cluster.metadata.owner_references = Some(vec![capi_owner("Cluster", "prod")]);
    cluster
}

/// CAPI cluster `prod` in `default`
pub fn capi_cluster(control_plane_ready: bool) -> Cluster {
    let mut cluster = Cluster::new("prod", ClusterSpec::default());
    cluster.metadata.namespace = Some("default".to_string());
    cluster.status = Some(caph_common::crd::capi::ClusterStatus {
        control_plane_ready,
        infrastructure_ready: true,
        ..Default::default()
    });
    cluster
}

/// CAPI machine `name` of cluster `prod` with bootstrap data ready
pub fn capi_machine(name: &str, control_plane: bool) -> Machine {
    let spec: MachineSpec = serde_json::from_value(json!({
        "clusterName": "prod",
        "bootstrap": {"dataSecretName": format!("{name}-bootstrap")},
        "failureDomain": "fsn1"
    }))
    .expect("valid machine spec");
    let mut machine = Machine::new(name, spec);
    machine.metadata.namespace = Some("default".to_string());
    let mut labels = BTreeMap::from([(CLUSTER_NAME_LABEL.to_string(), "prod".to_string())]);
    if control_plane {
        labels.insert(CONTROL_PLANE_LABEL.to_string(), String::new());
    }
    machine.metadata.labels = Some(labels);
    machine
}

/// HCloudMachine `name` owned by CAPI machine `name`
pub fn hcloud_machine(name: &str) -> HCloudMachine {
    let spec: HCloudMachineSpec = serde_json::from_value(json!({
        "type": "cpx31",
        "imageName": "ubuntu-24.04"
    }))
    .expect("valid machine spec");
    let mut machine = HCloudMachine::new(name, spec);
    machine.metadata.namespace = Some("default".to_string());
    machine.metadata.uid = Some(format!("{name}-hcm-uid"));
    machine.metadata.labels = Some(BTreeMap::from([(
        CLUSTER_NAME_LABEL.to_string(),
        "prod".to_string(),
    )]));
    machine.metadata.owner_references = Some(vec![capi_owner("Machine", name)]);
    machine
}

/// Credentials secret `default/hetzner` with the token under `hcloud`
pub fn hetzner_secret(token: &str) -> k8s_openapi::api::core::v1::Secret {
    k8s_openapi::api::core::v1::Secret {
        metadata: kube::core::ObjectMeta {
            name: Some("hetzner".to_string()),
            namespace: Some("default".to_string()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            "hcloud".to_string(),
            k8s_openapi::ByteString(token.as_bytes().to_vec()),
        )])),
        ..Default::default()
    }
}

/// Connector that must never be used
pub fn no_workloads() -> crate::target_cluster::MockWorkloadConnector {
    let mut connector = crate::target_cluster::MockWorkloadConnector::new();
    connector.expect_connect().never();
    connector
}
