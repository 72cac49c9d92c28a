//! In-memory control plane and fixtures for tests
//!
//! Testing aid for the integration tests and for providers built on this
//! crate. Nothing here is used by the engine itself.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::{Container, Event, Node, Pod, PodSpec};
use kube::api::ObjectMeta;
use kube::runtime::watcher;
use kube::ResourceExt;

use crate::adapters::ControlPlane;
use crate::manager::{object_key, ResourceManager};
use crate::{Error, Result};

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Control plane backed by maps. Every write bumps a global resource version
/// and writes carrying a stale resource version fail with a conflict.
/// Status updates replace the whole status, as the status subresource does.
#[derive(Default)]
pub struct InMemoryControlPlane {
    version: AtomicU64,
    nodes: Mutex<BTreeMap<String, Node>>,
    leases: Mutex<BTreeMap<String, Lease>>,
    leases_unsupported: AtomicBool,
    lease_renewals: AtomicUsize,
    pods: Mutex<BTreeMap<String, Pod>>,
    events: Mutex<Vec<Event>>,
    deleted: Mutex<Vec<String>>,
    forced_conflicts: AtomicUsize,
    node_creates: AtomicUsize,
}

impl InMemoryControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    /// Store a pod as if a user created it, returning the stored copy
    pub fn insert_pod(&self, mut pod: Pod) -> Pod {
        pod.metadata.resource_version = Some(self.next_version());
        let key = object_key(&pod.namespace().unwrap_or_default(), &pod.name_any());
        locked(&self.pods).insert(key, pod.clone());
        pod
    }

    pub fn pod(&self, namespace: &str, name: &str) -> Option<Pod> {
        locked(&self.pods).get(&object_key(namespace, name)).cloned()
    }

    pub fn node(&self, name: &str) -> Option<Node> {
        locked(&self.nodes).get(name).cloned()
    }

    pub fn remove_node(&self, name: &str) {
        locked(&self.nodes).remove(name);
    }

    pub fn lease(&self, name: &str) -> Option<Lease> {
        locked(&self.leases).get(name).cloned()
    }

    pub fn remove_lease(&self, name: &str) {
        locked(&self.leases).remove(name);
    }

    pub fn lease_renewals(&self) -> usize {
        self.lease_renewals.load(Ordering::SeqCst)
    }

    /// Behave like an API server without the coordination group
    pub fn disable_leases(&self) {
        self.leases_unsupported.store(true, Ordering::SeqCst);
    }

    fn leases_supported(&self) -> Result<()> {
        if self.leases_unsupported.load(Ordering::SeqCst) {
            return Err(Error::NotFound("the server could not find the requested resource".to_string()));
        }
        Ok(())
    }

    pub fn node_creates(&self) -> usize {
        self.node_creates.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> Vec<Event> {
        locked(&self.events).clone()
    }

    pub fn event_reasons(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| e.reason)
            .collect()
    }

    /// Keys of pods deleted through the control plane
    pub fn deleted_pods(&self) -> Vec<String> {
        locked(&self.deleted).clone()
    }

    /// Fail the next `n` pod status updates with a conflict
    pub fn force_conflicts(&self, n: usize) {
        self.forced_conflicts.store(n, Ordering::SeqCst);
    }

    fn take_forced_conflict(&self) -> bool {
        self.forced_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ControlPlane for InMemoryControlPlane {
    async fn create_node(&self, node: &Node) -> Result<Node> {
        self.node_creates.fetch_add(1, Ordering::SeqCst);
        let name = node.name_any();
        let mut nodes = locked(&self.nodes);
        if nodes.contains_key(&name) {
            return Err(Error::AlreadyExists(format!("nodes {:?} already exists", name)));
        }
        let mut stored = node.clone();
        stored.metadata.resource_version = Some(self.next_version());
        nodes.insert(name, stored.clone());
        Ok(stored)
    }

    async fn get_node(&self, name: &str) -> Result<Option<Node>> {
        Ok(self.node(name))
    }

    async fn update_node_status(&self, node: &Node) -> Result<Node> {
        let name = node.name_any();
        let mut nodes = locked(&self.nodes);
        let stored = nodes
            .get_mut(&name)
            .ok_or_else(|| Error::NotFound(format!("nodes {:?} not found", name)))?;
        if node.resource_version().is_some() && node.resource_version() != stored.resource_version() {
            return Err(Error::Conflict(format!("node {:?} was modified", name)));
        }
        stored.status = node.status.clone();
        stored.metadata.resource_version = Some(self.next_version());
        Ok(stored.clone())
    }

    async fn create_lease(&self, lease: &Lease) -> Result<Lease> {
        self.leases_supported()?;
        let name = lease.name_any();
        let mut leases = locked(&self.leases);
        if leases.contains_key(&name) {
            return Err(Error::AlreadyExists(format!("leases {:?} already exists", name)));
        }
        let mut stored = lease.clone();
        stored.metadata.resource_version = Some(self.next_version());
        leases.insert(name, stored.clone());
        Ok(stored)
    }

    async fn renew_lease(&self, lease: &Lease) -> Result<Lease> {
        self.leases_supported()?;
        let name = lease.name_any();
        let mut leases = locked(&self.leases);
        let stored = leases
            .get_mut(&name)
            .ok_or_else(|| Error::NotFound(format!("leases {:?} not found", name)))?;
        let renewed = lease.spec.clone().unwrap_or_default();
        let spec = stored.spec.get_or_insert_with(Default::default);
        spec.holder_identity = renewed.holder_identity;
        spec.lease_duration_seconds = renewed.lease_duration_seconds;
        spec.renew_time = renewed.renew_time;
        stored.metadata.resource_version = Some(self.next_version());
        self.lease_renewals.fetch_add(1, Ordering::SeqCst);
        Ok(stored.clone())
    }

    async fn delete_lease(&self, name: &str) -> Result<()> {
        self.leases_supported()?;
        locked(&self.leases)
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("leases {:?} not found", name)))
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        Ok(self.pod(namespace, name))
    }

    async fn update_pod_status(&self, pod: &Pod) -> Result<Pod> {
        let key = object_key(&pod.namespace().unwrap_or_default(), &pod.name_any());
        if self.take_forced_conflict() {
            return Err(Error::Conflict(format!("pod {:?} was modified", key)));
        }
        let mut pods = locked(&self.pods);
        let stored = pods
            .get_mut(&key)
            .ok_or_else(|| Error::NotFound(format!("pods {:?} not found", key)))?;
        if pod.resource_version().is_some() && pod.resource_version() != stored.resource_version() {
            return Err(Error::Conflict(format!("pod {:?} was modified", key)));
        }
        stored.status = pod.status.clone();
        stored.metadata.resource_version = Some(self.next_version());
        Ok(stored.clone())
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        let key = object_key(namespace, name);
        locked(&self.pods).remove(&key);
        locked(&self.deleted).push(key);
        Ok(())
    }

    async fn create_event(&self, event: &Event) -> Result<()> {
        locked(&self.events).push(event.clone());
        Ok(())
    }
}

/// Mark every informer of `resources` as synced with an empty initial list
pub fn sync_informers(resources: &ResourceManager) {
    resources.pod_informer().apply(watcher::Event::Init);
    resources.pod_informer().apply(watcher::Event::InitDone);
    resources.config_map_informer().apply(watcher::Event::Init);
    resources.config_map_informer().apply(watcher::Event::InitDone);
    resources.secret_informer().apply(watcher::Event::Init);
    resources.secret_informer().apply(watcher::Event::InitDone);
    resources.service_informer().apply(watcher::Event::Init);
    resources.service_informer().apply(watcher::Event::InitDone);
}

/// A pod with one container bound to `node`
pub fn pod(namespace: &str, name: &str, node: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            uid: Some(format!("uid-{}-{}", namespace, name)),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some(node.to_string()),
            containers: vec![Container {
                name: "nginx".to_string(),
                image: Some("nginx:1.25".to_string()),
                ..Default::default()
            }],
            ..Default::default()
        }),
        status: None,
    }
}
