//! Control plane client seam
//!
//! Every write the engine performs against the API server goes through
//! [`ControlPlane`] so controllers can be exercised against an in-memory
//! implementation.

use async_trait::async_trait;
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::{Event, Node, Pod};
use kube::api::{DeleteParams, Patch, PatchParams, PostParams};
use kube::{Api, Client, ResourceExt};
use serde::Serialize;
use serde_json::json;
use tracing::debug;

use crate::{Error, Result};

/// Writes and point reads against the control plane
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Create the node object. Fails with [`Error::AlreadyExists`] if it is registered.
    async fn create_node(&self, node: &Node) -> Result<Node>;

    async fn get_node(&self, name: &str) -> Result<Option<Node>>;

    /// Replace the status of a node, guarded by its resource version
    async fn update_node_status(&self, node: &Node) -> Result<Node>;

    /// Create the node lease. Fails with [`Error::NotFound`] when the
    /// control plane does not serve leases.
    async fn create_lease(&self, lease: &Lease) -> Result<Lease>;

    /// Bump the holder and renew time of an existing lease.
    /// Fails with [`Error::NotFound`] when the lease is gone.
    async fn renew_lease(&self, lease: &Lease) -> Result<Lease>;

    async fn delete_lease(&self, name: &str) -> Result<()>;

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>>;

    /// Replace the status subresource of a pod, guarded by its resource version.
    /// Fields absent from `pod.status` are cleared. A stale resource version
    /// fails with [`Error::Conflict`].
    async fn update_pod_status(&self, pod: &Pod) -> Result<Pod>;

    /// Delete a pod immediately. A missing pod is not an error.
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()>;

    async fn create_event(&self, event: &Event) -> Result<()>;
}

/// [`ControlPlane`] backed by a kube client
#[derive(Clone)]
pub struct KubeControlPlane {
    client: Client,
}

impl KubeControlPlane {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

/// Namespace holding node leases
pub const LEASE_NAMESPACE: &str = "kube-node-lease";

/// Body of a status replace: the whole object, so unset status fields are dropped
fn replacement<K: Serialize>(object: &K) -> Result<Vec<u8>> {
    serde_json::to_vec(object).map_err(|e| Error::Internal(format!("encoding object: {}", e)))
}

/// Merge patch renewing a lease in place
fn lease_renewal(lease: &Lease) -> serde_json::Value {
    let spec = lease.spec.clone().unwrap_or_default();
    json!({
        "spec": {
            "holderIdentity": spec.holder_identity,
            "leaseDurationSeconds": spec.lease_duration_seconds,
            "renewTime": spec.renew_time,
        }
    })
}

#[async_trait]
impl ControlPlane for KubeControlPlane {
    async fn create_node(&self, node: &Node) -> Result<Node> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.create(&PostParams::default(), node).await?)
    }

    async fn get_node(&self, name: &str) -> Result<Option<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn update_node_status(&self, node: &Node) -> Result<Node> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api
            .replace_status(&node.name_any(), &PostParams::default(), replacement(node)?)
            .await?)
    }

    async fn create_lease(&self, lease: &Lease) -> Result<Lease> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), LEASE_NAMESPACE);
        Ok(api.create(&PostParams::default(), lease).await?)
    }

    async fn renew_lease(&self, lease: &Lease) -> Result<Lease> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), LEASE_NAMESPACE);
        let patch = lease_renewal(lease);
        Ok(api
            .patch(&lease.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?)
    }

    async fn delete_lease(&self, name: &str) -> Result<()> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), LEASE_NAMESPACE);
        api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn update_pod_status(&self, pod: &Pod) -> Result<Pod> {
        let namespace = pod.namespace().unwrap_or_default();
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);
        Ok(api
            .replace_status(&pod.name_any(), &PostParams::default(), replacement(pod)?)
            .await?)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = DeleteParams {
            grace_period_seconds: Some(0),
            ..Default::default()
        };
        match api.delete(name, &params).await {
            Ok(_) => Ok(()),
            Err(e) => match Error::from(e) {
                Error::NotFound(_) => {
                    debug!(namespace, name, "Pod already gone from the control plane");
                    Ok(())
                }
                other => Err(other),
            },
        }
    }

    async fn create_event(&self, event: &Event) -> Result<()> {
        let namespace = event.namespace().unwrap_or_else(|| "default".to_string());
        let api: Api<Event> = Api::namespaced(self.client.clone(), &namespace);
        api.create(&PostParams::default(), event).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use k8s_openapi::api::coordination::v1::LeaseSpec;
    use k8s_openapi::api::core::v1::PodStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
    use kube::api::ObjectMeta;

    #[test]
    fn status_replacement_drops_cleared_fields() {
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                resource_version: Some("42".to_string()),
                ..Default::default()
            },
            status: Some(PodStatus {
                phase: Some("Running".to_string()),
                reason: None,
                message: None,
                ..Default::default()
            }),
            ..Default::default()
        };

        let body: serde_json::Value = serde_json::from_slice(&replacement(&pod).unwrap()).unwrap();
        assert_eq!(body["metadata"]["resourceVersion"], "42");
        assert_eq!(body["status"]["phase"], "Running");
        assert!(body["status"].get("reason").is_none());
        assert!(body["status"].get("message").is_none());
    }

    #[test]
    fn lease_renewal_only_touches_the_spec() {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some("vk".to_string()),
                resource_version: Some("7".to_string()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some("vk".to_string()),
                lease_duration_seconds: Some(25),
                renew_time: Some(MicroTime(Utc::now())),
                ..Default::default()
            }),
        };

        let patch = lease_renewal(&lease);
        assert!(patch.get("metadata").is_none());
        assert_eq!(patch["spec"]["holderIdentity"], "vk");
        assert_eq!(patch["spec"]["leaseDurationSeconds"], 25);
        assert!(patch["spec"]["renewTime"].is_string());
    }
}
