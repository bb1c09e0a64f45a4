//! Cluster network

use kube::ResourceExt;
use tracing::{debug, info};

use caph_common::conditions::{reasons, types};
use caph_common::crd::{HetznerCluster, NetworkStatus};
use caph_common::labels::{cluster_selector, cluster_tags};
use caph_common::{ConditionSeverity, Error, HasConditions, Result};

use super::{cloud, ignore_not_found};
use crate::hcloud::{ComputeApi, Network, NetworkCreateOpts, NetworkSubnet};

/// Ensure the cluster network exists and mirror it into the status
///
/// Does nothing unless the network is enabled. More than one network carrying
/// the cluster label is an error.
pub async fn reconcile_network(api: &dyn ComputeApi, cluster: &mut HetznerCluster) -> Result<()> {
    if !cluster.spec.hcloud_network.enabled {
        cluster.status_mut().network_status = None;
        return Ok(());
    }

    match find_or_create(api, cluster).await {
        Ok(network) => {
            cluster.status_mut().network_status = Some(NetworkStatus {
                id: network.id,
                attached_servers: network.servers,
            });
            cluster.conditions_mut().mark_true(types::NETWORK_READY);
            Ok(())
        }
        Err(e) => {
            cluster.conditions_mut().mark_false(
                types::NETWORK_READY,
                reasons::NETWORK_RECONCILE_FAILED,
                ConditionSeverity::Warning,
                e.to_string(),
            );
            Err(e)
        }
    }
}

async fn find_or_create(api: &dyn ComputeApi, cluster: &HetznerCluster) -> Result<Network> {
    let name = cluster.name_any();
    let mut networks = api
        .list_networks(cluster_selector(&name))
        .await
        .map_err(cloud(format!("networks of {name}")))?;

    if networks.len() > 1 {
        return Err(Error::validation_for(
            name,
            format!("found {} networks with the cluster label", networks.len()),
        ));
    }
    if let Some(network) = networks.pop() {
        debug!(network = network.id, "network exists");
        return Ok(network);
    }

    let spec = &cluster.spec.hcloud_network;
    let opts = NetworkCreateOpts {
        name: name.clone(),
        ip_range: spec.cidr_block.clone(),
        subnets: vec![NetworkSubnet {
            type_: "cloud".to_string(),
            ip_range: spec.subnet_cidr_block.clone(),
            network_zone: spec.network_zone.clone(),
        }],
        labels: cluster_tags(&name),
    };
    let network = api
        .create_network(opts)
        .await
        .map_err(cloud(format!("network {name}")))?;
    info!(network = network.id, cluster = %name, "created network");
    Ok(network)
}

/// Delete the cluster network recorded in the status
pub async fn delete_network(api: &dyn ComputeApi, cluster: &mut HetznerCluster) -> Result<()> {
    let Some(id) = cluster.network_id() else {
        return Ok(());
    };
    ignore_not_found(api.delete_network(id).await).map_err(cloud(format!("network {id}")))?;
    info!(network = id, cluster = %cluster.name_any(), "deleted network");
    cluster.status_mut().network_status = None;
    Ok(())
}
