//! Virtual Node object builder

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::api::core::v1::{
    DaemonEndpoint, Node, NodeAddress, NodeDaemonEndpoints, NodeSpec, NodeStatus, NodeSystemInfo,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};

use crate::adapters::control_plane::LEASE_NAMESPACE;
use crate::config::EngineConfig;
use crate::provider::Provider;

/// Kubelet version string advertised in the node info
pub const KUBELET_VERSION: &str = concat!("v", env!("CARGO_PKG_VERSION"), "-virtual-kubelet");

/// Lease duration in heartbeat intervals
pub const LEASE_DURATION_FACTOR: f64 = 5.0;

/// Build the node lease held by this kubelet, renewed at `now`
pub fn build_lease(config: &EngineConfig, now: DateTime<Utc>) -> Lease {
    let duration = (config.heartbeat_interval.as_secs_f64() * LEASE_DURATION_FACTOR).ceil() as i32;
    Lease {
        metadata: ObjectMeta {
            name: Some(config.node_name.clone()),
            namespace: Some(LEASE_NAMESPACE.to_string()),
            ..Default::default()
        },
        spec: Some(LeaseSpec {
            holder_identity: Some(config.node_name.clone()),
            lease_duration_seconds: Some(duration.max(1)),
            renew_time: Some(MicroTime(now)),
            ..Default::default()
        }),
    }
}

/// Build the node object registered at startup
pub fn build_node(config: &EngineConfig, provider: &dyn Provider) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(config.node_name.clone()),
            labels: Some(build_labels(config)),
            ..Default::default()
        },
        spec: Some(NodeSpec {
            taints: config.taint.clone().map(|taint| vec![taint]),
            ..Default::default()
        }),
        status: Some(build_status(config, provider)),
    }
}

fn build_labels(config: &EngineConfig) -> BTreeMap<String, String> {
    let os = config.operating_system.to_string().to_lowercase();
    let mut labels = BTreeMap::new();
    labels.insert("type".to_string(), "virtual-kubelet".to_string());
    labels.insert("kubernetes.io/role".to_string(), "agent".to_string());
    labels.insert("kubernetes.io/hostname".to_string(), config.node_name.clone());
    labels.insert("kubernetes.io/os".to_string(), os.clone());
    labels.insert("beta.kubernetes.io/os".to_string(), os);
    labels.insert(
        "alpha.service-controller.kubernetes.io/exclude-balancer".to_string(),
        "true".to_string(),
    );
    labels.insert(
        "node.kubernetes.io/exclude-from-external-load-balancers".to_string(),
        "true".to_string(),
    );
    labels
}

fn build_status(config: &EngineConfig, provider: &dyn Provider) -> NodeStatus {
    let capacity = provider.capacity();
    let daemon_endpoints = provider
        .node_daemon_endpoints()
        .unwrap_or_else(|| NodeDaemonEndpoints {
            kubelet_endpoint: Some(DaemonEndpoint {
                port: i32::from(config.kubelet_port),
            }),
        });

    NodeStatus {
        phase: Some("Running".to_string()),
        allocatable: Some(capacity.clone()),
        capacity: Some(capacity),
        conditions: Some(provider.node_conditions()),
        addresses: Some(addresses(config, provider)),
        daemon_endpoints: Some(daemon_endpoints),
        node_info: Some(NodeSystemInfo {
            operating_system: provider.operating_system(),
            architecture: "amd64".to_string(),
            kubelet_version: KUBELET_VERSION.to_string(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Provider addresses, plus the configured pod IP as InternalIP when the
/// provider does not already report one
fn addresses(config: &EngineConfig, provider: &dyn Provider) -> Vec<NodeAddress> {
    let mut addresses = provider.node_addresses();
    if let Some(ip) = &config.pod_ip {
        if !addresses.iter().any(|a| a.type_ == "InternalIP") {
            addresses.push(NodeAddress {
                type_: "InternalIP".to_string(),
                address: ip.clone(),
            });
        }
    }
    addresses
}

/// Overwrite the heartbeat-owned parts of the node status from the provider.
/// Taints and labels are left alone.
pub fn refresh_status(node: &mut Node, config: &EngineConfig, provider: &dyn Provider) {
    let capacity = provider.capacity();
    let status = node.status.get_or_insert_with(Default::default);
    status.conditions = Some(provider.node_conditions());
    status.allocatable = Some(capacity.clone());
    status.capacity = Some(capacity);
    status.addresses = Some(addresses(config, provider));
    status.phase = Some("Running".to_string());
}
