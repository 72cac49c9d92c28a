//! Resource Manager
//!
//! Shared read view over the pod, configmap, secret and service informers.
//! All components read through this type so they observe the same caches.

use std::sync::Arc;

use k8s_openapi::api::core::v1::{ConfigMap, Pod, Secret, Service};
use kube::ResourceExt;

use super::cache::Upsert;
use super::informer::Informer;

pub struct ResourceManager {
    pods: Arc<Informer<Pod>>,
    config_maps: Arc<Informer<ConfigMap>>,
    secrets: Arc<Informer<Secret>>,
    services: Arc<Informer<Service>>,
}

impl Default for ResourceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceManager {
    pub fn new() -> Self {
        Self {
            pods: Arc::new(Informer::new("Pod")),
            config_maps: Arc::new(Informer::new("ConfigMap")),
            secrets: Arc::new(Informer::new("Secret")),
            services: Arc::new(Informer::new("Service")),
        }
    }

    pub fn pod_informer(&self) -> &Arc<Informer<Pod>> {
        &self.pods
    }

    pub fn config_map_informer(&self) -> &Arc<Informer<ConfigMap>> {
        &self.config_maps
    }

    pub fn secret_informer(&self) -> &Arc<Informer<Secret>> {
        &self.secrets
    }

    pub fn service_informer(&self) -> &Arc<Informer<Service>> {
        &self.services
    }

    pub fn get_pod(&self, namespace: &str, name: &str) -> Option<Arc<Pod>> {
        self.pods.cache().get(namespace, name)
    }

    pub fn get_pods(&self) -> Vec<Arc<Pod>> {
        self.pods.cache().list()
    }

    pub fn has_pod(&self, key: &str) -> bool {
        self.pods.cache().contains_key(key)
    }

    /// Store a newer copy of a pod. Returns true iff the stored pod changed.
    pub fn update_pod(&self, pod: Pod) -> bool {
        matches!(self.pods.cache().upsert(pod).0, Upsert::Added | Upsert::Updated)
    }

    pub fn delete_pod(&self, pod: &Pod) {
        self.pods
            .cache()
            .remove(&pod.namespace().unwrap_or_default(), &pod.name_any());
    }

    pub fn get_config_map(&self, name: &str, namespace: &str) -> Option<Arc<ConfigMap>> {
        self.config_maps.cache().get(namespace, name)
    }

    pub fn get_secret(&self, name: &str, namespace: &str) -> Option<Arc<Secret>> {
        self.secrets.cache().get(namespace, name)
    }

    /// Every cached service across namespaces
    pub fn get_services(&self) -> Vec<Arc<Service>> {
        self.services.cache().list()
    }
}
