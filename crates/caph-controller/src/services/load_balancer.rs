//! Control-plane load balancer

use std::collections::BTreeMap;

use kube::ResourceExt;
use tracing::{debug, info, warn};

use caph_common::conditions::{reasons, types};
use caph_common::crd::{HetznerCluster, LoadBalancerAlgorithm, LoadBalancerStatus};
use caph_common::labels::{cluster_selector, cluster_tags};
use caph_common::{ConditionSeverity, Error, HasConditions, Result};

use super::{cloud, ignore_not_found};
use crate::hcloud::{
    codes, has_code, AlgorithmInfo, ComputeApi, LoadBalancer, LoadBalancerCreateOpts,
    LoadBalancerService,
};

/// Ensure the load balancer exists and matches the spec
///
/// Covers type, algorithm, name, network attachment and the extra services.
/// The API server service is created with the load balancer and left alone
/// afterwards.
pub async fn reconcile_load_balancer(
    api: &dyn ComputeApi,
    cluster: &mut HetznerCluster,
) -> Result<()> {
    if !cluster.spec.control_plane_load_balancer.enabled {
        cluster.status_mut().control_plane_load_balancer = None;
        return Ok(());
    }

    match reconcile_inner(api, cluster).await {
        Ok(lb) => {
            let attached = !lb.private_net.is_empty();
            cluster.status_mut().control_plane_load_balancer = Some(status_from(&lb, attached));
            cluster.conditions_mut().mark_true(types::LOAD_BALANCER_READY);
            Ok(())
        }
        Err(e) => {
            cluster.conditions_mut().mark_false(
                types::LOAD_BALANCER_READY,
                reasons::LOAD_BALANCER_RECONCILE_FAILED,
                ConditionSeverity::Warning,
                e.to_string(),
            );
            Err(e)
        }
    }
}

async fn reconcile_inner(api: &dyn ComputeApi, cluster: &mut HetznerCluster) -> Result<LoadBalancer> {
    let mut lb = find_or_create(api, cluster).await?;
    let spec = cluster.spec.control_plane_load_balancer.clone();
    let resource = format!("load balancer {}", lb.id);

    if lb.load_balancer_type.name != spec.type_ {
        api.change_load_balancer_type(lb.id, spec.type_.clone())
            .await
            .map_err(cloud(&resource))?;
        info!(lb = lb.id, to = %spec.type_, "changed load balancer type");
        lb.load_balancer_type.name = spec.type_.clone();
    }

    if lb.algorithm.type_ != spec.algorithm.as_str() {
        api.change_load_balancer_algorithm(lb.id, spec.algorithm.as_str().to_string())
            .await
            .map_err(cloud(&resource))?;
        info!(lb = lb.id, to = spec.algorithm.as_str(), "changed load balancer algorithm");
        lb.algorithm.type_ = spec.algorithm.as_str().to_string();
    }

    let name = cluster.load_balancer_name();
    if lb.name != name {
        lb = api
            .rename_load_balancer(lb.id, name.clone())
            .await
            .map_err(cloud(&resource))?;
        info!(lb = lb.id, %name, "renamed load balancer");
    }

    if cluster.spec.hcloud_network.enabled {
        attach_to_network(api, cluster, &mut lb).await?;
    }

    reconcile_services(api, cluster, &mut lb).await?;
    Ok(lb)
}

async fn find_or_create(api: &dyn ComputeApi, cluster: &HetznerCluster) -> Result<LoadBalancer> {
    let name = cluster.name_any();
    let mut found = api
        .list_load_balancers(cluster_selector(&name))
        .await
        .map_err(cloud(format!("load balancers of {name}")))?;

    if found.len() > 1 {
        return Err(Error::validation_for(
            name,
            format!("found {} load balancers with the cluster label", found.len()),
        ));
    }
    if let Some(lb) = found.pop() {
        debug!(lb = lb.id, "load balancer exists");
        return Ok(lb);
    }

    let spec = &cluster.spec.control_plane_load_balancer;
    let opts = LoadBalancerCreateOpts {
        name: cluster.load_balancer_name(),
        load_balancer_type: spec.type_.clone(),
        algorithm: AlgorithmInfo {
            type_: spec.algorithm.as_str().to_string(),
        },
        location: spec
            .region
            .clone()
            .or_else(|| cluster.spec.control_plane_regions.first().cloned()),
        network: cluster.network_id(),
        labels: cluster_tags(&name),
        services: vec![LoadBalancerService {
            protocol: "tcp".to_string(),
            listen_port: api_listen_port(cluster),
            destination_port: spec.port,
            proxyprotocol: false,
        }],
    };
    let lb = api
        .create_load_balancer(opts)
        .await
        .map_err(cloud(format!("load balancer {}", cluster.load_balancer_name())))?;
    info!(lb = lb.id, cluster = %name, "created load balancer");
    Ok(lb)
}

/// Port the API server service listens on
fn api_listen_port(cluster: &HetznerCluster) -> u16 {
    cluster
        .spec
        .control_plane_endpoint
        .as_ref()
        .filter(|e| e.port != 0)
        .map(|e| e.port)
        .unwrap_or(cluster.spec.control_plane_load_balancer.port)
}

async fn attach_to_network(
    api: &dyn ComputeApi,
    cluster: &mut HetznerCluster,
    lb: &mut LoadBalancer,
) -> Result<()> {
    if !lb.private_net.is_empty() {
        cluster
            .conditions_mut()
            .mark_true(types::LOAD_BALANCER_ATTACHED_TO_NETWORK);
        return Ok(());
    }

    let Some(network) = cluster.network_id() else {
        cluster.conditions_mut().mark_false(
            types::LOAD_BALANCER_ATTACHED_TO_NETWORK,
            reasons::LOAD_BALANCER_NO_NETWORK_FOUND,
            ConditionSeverity::Info,
            "no network found to attach the load balancer to",
        );
        return Ok(());
    };

    match api.attach_load_balancer_to_network(lb.id, network).await {
        Ok(()) => {}
        Err(e) if has_code(&e, codes::LOAD_BALANCER_ALREADY_ATTACHED) => {}
        Err(e) => {
            cluster.conditions_mut().mark_false(
                types::LOAD_BALANCER_ATTACHED_TO_NETWORK,
                reasons::LOAD_BALANCER_ATTACH_FAILED,
                ConditionSeverity::Error,
                e.to_string(),
            );
            return Err(Error::compute(format!("load balancer {}", lb.id), e));
        }
    }

    info!(lb = lb.id, network, "attached load balancer to network");
    // The address inside the network shows up on the next read.
    lb.private_net.push(crate::hcloud::PrivateNet {
        network,
        ip: String::new(),
    });
    cluster
        .conditions_mut()
        .mark_true(types::LOAD_BALANCER_ATTACHED_TO_NETWORK);
    Ok(())
}

async fn reconcile_services(
    api: &dyn ComputeApi,
    cluster: &HetznerCluster,
    lb: &mut LoadBalancer,
) -> Result<()> {
    let listen_api_port = api_listen_port(cluster);
    let resource = format!("load balancer {}", lb.id);

    let desired: BTreeMap<u16, LoadBalancerService> = cluster
        .spec
        .control_plane_load_balancer
        .extra_services
        .iter()
        .filter(|s| s.listen_port != listen_api_port)
        .map(|s| {
            (
                s.listen_port,
                LoadBalancerService {
                    protocol: s.protocol.clone(),
                    listen_port: s.listen_port,
                    destination_port: s.destination_port,
                    proxyprotocol: false,
                },
            )
        })
        .collect();
    let existing: BTreeMap<u16, LoadBalancerService> = lb
        .services
        .iter()
        .filter(|s| s.listen_port != listen_api_port)
        .map(|s| (s.listen_port, s.clone()))
        .collect();

    for port in existing.keys().filter(|p| !desired.contains_key(*p)) {
        ignore_not_found(api.delete_service(lb.id, *port).await).map_err(cloud(&resource))?;
        info!(lb = lb.id, port, "deleted load balancer service");
    }
    for (port, service) in desired.iter().filter(|(p, _)| !existing.contains_key(*p)) {
        api.add_service(lb.id, service.clone())
            .await
            .map_err(cloud(&resource))?;
        info!(lb = lb.id, port, "added load balancer service");
    }

    lb.services.retain(|s| s.listen_port == listen_api_port || desired.contains_key(&s.listen_port));
    for (port, service) in desired {
        if !existing.contains_key(&port) {
            lb.services.push(service);
        }
    }
    Ok(())
}

fn status_from(lb: &LoadBalancer, attached: bool) -> LoadBalancerStatus {
    let algorithm = match lb.algorithm.type_.as_str() {
        "least_connections" => LoadBalancerAlgorithm::LeastConnections,
        _ => LoadBalancerAlgorithm::RoundRobin,
    };
    LoadBalancerStatus {
        id: lb.id,
        name: lb.name.clone(),
        type_: lb.load_balancer_type.name.clone(),
        algorithm,
        ipv4: lb.public_net.ipv4.as_ref().map(|i| i.ip.clone()),
        ipv6: lb.public_net.ipv6.as_ref().map(|i| i.ip.clone()),
        internal_ip: lb
            .private_net
            .first()
            .map(|n| n.ip.clone())
            .filter(|ip| !ip.is_empty()),
        targets: lb
            .targets
            .iter()
            .filter_map(|t| t.server.as_ref().map(|s| s.id))
            .collect(),
        attached_to_network: attached,
        protected: lb.protection.delete,
    }
}

/// Delete the load balancer recorded in the status
///
/// A delete-protected load balancer is left in place and forgotten.
pub async fn delete_load_balancer(
    api: &dyn ComputeApi,
    cluster: &mut HetznerCluster,
) -> Result<()> {
    let Some(status) = cluster
        .status
        .as_ref()
        .and_then(|s| s.control_plane_load_balancer.clone())
    else {
        return Ok(());
    };

    if status.protected {
        warn!(lb = status.id, "load balancer is delete protected, leaving it");
    } else {
        ignore_not_found(api.delete_load_balancer(status.id).await)
            .map_err(cloud(format!("load balancer {}", status.id)))?;
        info!(lb = status.id, cluster = %cluster.name_any(), "deleted load balancer");
    }
    cluster.status_mut().control_plane_load_balancer = None;
    Ok(())
}
