//! Polling adapter for providers without NotifyPods
//!
//! Wraps a provider and synthesizes status notifications by calling
//! `get_pods` on a fixed interval. Mutating calls take the write side of a
//! reader/writer lock so they never interleave with a sweep; reads take the
//! read side. The lock is only held around the wrapped provider call and the
//! callback always runs after it has been released.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::{
    ConfigMap, ContainerState, ContainerStateTerminated, ContainerStatus, NodeAddress,
    NodeCondition, NodeDaemonEndpoints, Pod, PodStatus, Secret,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    ConfigMapUpdater, ContainerExecutor, ContainerLogOpts, LogStream, PodCallback,
    PodMetricsProvider, PodNotifier, Provider, ProviderResult, SecretUpdater,
};

/// Wraps a provider that cannot push status changes
pub struct PollingProvider {
    inner: Arc<dyn Provider>,
    lock: RwLock<()>,
    callback: Mutex<Option<PodCallback>>,
    deleted: Mutex<HashMap<String, Pod>>,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn pod_key(pod: &Pod) -> String {
    format!("{}/{}", pod.namespace().unwrap_or_default(), pod.name_any())
}

/// Status reported for a pod after the backend confirmed its deletion
fn terminated_status(pod: &Pod) -> PodStatus {
    let now = Time(Utc::now());
    let mut status = pod.status.clone().unwrap_or_default();
    status.phase = Some("Succeeded".to_string());

    let previous: BTreeMap<String, ContainerStatus> = status
        .container_statuses
        .take()
        .unwrap_or_default()
        .into_iter()
        .map(|cs| (cs.name.clone(), cs))
        .collect();

    let containers = pod
        .spec
        .as_ref()
        .map(|spec| spec.containers.as_slice())
        .unwrap_or_default();

    status.container_statuses = Some(
        containers
            .iter()
            .map(|c| {
                let prior = previous.get(&c.name);
                let started_at = prior
                    .and_then(|cs| cs.state.as_ref())
                    .and_then(|s| s.running.as_ref())
                    .and_then(|r| r.started_at.clone());
                ContainerStatus {
                    name: c.name.clone(),
                    image: c.image.clone().unwrap_or_default(),
                    image_id: prior.map(|cs| cs.image_id.clone()).unwrap_or_default(),
                    container_id: prior.and_then(|cs| cs.container_id.clone()),
                    ready: false,
                    restart_count: prior.map(|cs| cs.restart_count).unwrap_or_default(),
                    state: Some(ContainerState {
                        terminated: Some(ContainerStateTerminated {
                            exit_code: 0,
                            reason: Some("Terminated".to_string()),
                            message: Some("pod was deleted".to_string()),
                            started_at,
                            finished_at: Some(now.clone()),
                            container_id: prior.and_then(|cs| cs.container_id.clone()),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                }
            })
            .collect(),
    );
    status
}

impl PollingProvider {
    pub fn new(inner: Arc<dyn Provider>) -> Self {
        Self {
            inner,
            lock: RwLock::new(()),
            callback: Mutex::new(None),
            deleted: Mutex::new(HashMap::new()),
        }
    }

    fn notify(&self, pod: Pod) {
        let callback = locked(&self.callback).clone();
        if let Some(callback) = callback {
            callback(pod);
        }
    }

    /// One sweep: fetch every pod from the wrapped provider and notify each.
    /// Tombstones of deleted pods are reported one last time and dropped.
    pub async fn sweep(&self) -> ProviderResult<usize> {
        let pods = {
            let _guard = self.lock.read().await;
            self.inner.get_pods().await?
        };
        let count = pods.len();
        for pod in pods {
            self.notify(pod);
        }
        let tombstones: Vec<Pod> = locked(&self.deleted).drain().map(|(_, pod)| pod).collect();
        for pod in tombstones {
            self.notify(pod);
        }
        Ok(count)
    }

    #[cfg(test)]
    fn tombstones(&self) -> usize {
        locked(&self.deleted).len()
    }

    /// Sweep every `interval` until `token` is cancelled
    pub async fn run(self: Arc<Self>, interval: Duration, token: CancellationToken) {
        info!(interval_secs = interval.as_secs_f64(), "Starting provider polling loop");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    match self.sweep().await {
                        Ok(count) => debug!(pods = count, "Provider poll complete"),
                        Err(e) => warn!(error = %e, "Provider poll failed, retrying next tick"),
                    }
                }
            }
        }
        debug!("Provider polling loop stopped");
    }
}

#[async_trait]
impl Provider for PollingProvider {
    async fn create_pod(&self, pod: &Pod) -> ProviderResult<()> {
        {
            let _guard = self.lock.write().await;
            self.inner.create_pod(pod).await?;
        }
        locked(&self.deleted).remove(&pod_key(pod));
        Ok(())
    }

    async fn update_pod(&self, pod: &Pod) -> ProviderResult<()> {
        let _guard = self.lock.write().await;
        self.inner.update_pod(pod).await
    }

    async fn delete_pod(&self, pod: &Pod) -> ProviderResult<()> {
        {
            let _guard = self.lock.write().await;
            self.inner.delete_pod(pod).await?;
        }
        let mut terminal = pod.clone();
        terminal.status = Some(terminated_status(pod));
        locked(&self.deleted).insert(pod_key(pod), terminal.clone());
        self.notify(terminal);
        Ok(())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> ProviderResult<Option<Pod>> {
        let _guard = self.lock.read().await;
        self.inner.get_pod(namespace, name).await
    }

    async fn get_pod_status(
        &self,
        namespace: &str,
        name: &str,
    ) -> ProviderResult<Option<PodStatus>> {
        let status = {
            let _guard = self.lock.read().await;
            self.inner.get_pod_status(namespace, name).await?
        };
        if status.is_some() {
            return Ok(status);
        }
        let key = format!("{}/{}", namespace, name);
        Ok(locked(&self.deleted)
            .remove(&key)
            .and_then(|pod| pod.status))
    }

    async fn get_pods(&self) -> ProviderResult<Vec<Pod>> {
        let _guard = self.lock.read().await;
        self.inner.get_pods().await
    }

    async fn get_container_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        opts: &ContainerLogOpts,
    ) -> ProviderResult<LogStream> {
        let _guard = self.lock.read().await;
        self.inner
            .get_container_logs(namespace, pod, container, opts)
            .await
    }

    fn capacity(&self) -> BTreeMap<String, Quantity> {
        self.inner.capacity()
    }

    fn node_conditions(&self) -> Vec<NodeCondition> {
        self.inner.node_conditions()
    }

    fn node_addresses(&self) -> Vec<NodeAddress> {
        self.inner.node_addresses()
    }

    fn node_daemon_endpoints(&self) -> Option<NodeDaemonEndpoints> {
        self.inner.node_daemon_endpoints()
    }

    fn operating_system(&self) -> String {
        self.inner.operating_system()
    }

    fn as_pod_notifier(&self) -> Option<&dyn PodNotifier> {
        Some(self)
    }

    fn as_config_map_updater(&self) -> Option<&dyn ConfigMapUpdater> {
        self.inner.as_config_map_updater().map(|_| self as &dyn ConfigMapUpdater)
    }

    fn as_secret_updater(&self) -> Option<&dyn SecretUpdater> {
        self.inner.as_secret_updater().map(|_| self as &dyn SecretUpdater)
    }

    fn as_container_executor(&self) -> Option<&dyn ContainerExecutor> {
        self.inner.as_container_executor()
    }

    fn as_metrics_provider(&self) -> Option<&dyn PodMetricsProvider> {
        self.inner.as_metrics_provider()
    }
}

impl PodNotifier for PollingProvider {
    fn notify_pods(&self, callback: PodCallback) {
        *locked(&self.callback) = Some(callback);
    }
}

#[async_trait]
impl ConfigMapUpdater for PollingProvider {
    async fn update_config_map(
        &self,
        config_map: &ConfigMap,
        refs: &[String],
    ) -> ProviderResult<()> {
        let _guard = self.lock.write().await;
        match self.inner.as_config_map_updater() {
            Some(updater) => updater.update_config_map(config_map, refs).await,
            None => Ok(()),
        }
    }
}

#[async_trait]
impl SecretUpdater for PollingProvider {
    async fn update_secret(&self, secret: &Secret, refs: &[String]) -> ProviderResult<()> {
        let _guard = self.lock.write().await;
        match self.inner.as_secret_updater() {
            Some(updater) => updater.update_secret(secret, refs).await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::mock::{MockConfig, MockProvider};
    use k8s_openapi::api::core::v1::{Container, PodSpec};
    use kube::api::ObjectMeta;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pod(name: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                namespace: Some("default".to_string()),
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "app".to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn counting_callback() -> (PodCallback, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let callback: PodCallback = Arc::new(move |_pod: Pod| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        (callback, count)
    }

    #[tokio::test]
    async fn sweep_notifies_every_pod() {
        let mock = Arc::new(MockProvider::new(MockConfig::default()));
        mock.insert_pod(pod("a"));
        mock.insert_pod(pod("b"));
        let polling = PollingProvider::new(mock);
        let (callback, count) = counting_callback();
        polling.notify_pods(callback);

        assert_eq!(polling.sweep().await.unwrap(), 2);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn deleted_pods_report_terminal_status() {
        let mock = Arc::new(MockProvider::new(MockConfig::default()));
        let polling = PollingProvider::new(mock);
        polling.create_pod(&pod("web")).await.unwrap();
        polling.delete_pod(&pod("web")).await.unwrap();

        let status = polling
            .get_pod_status("default", "web")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.phase.as_deref(), Some("Succeeded"));
        let terminated = status.container_statuses.unwrap()[0]
            .state
            .clone()
            .unwrap()
            .terminated
            .unwrap();
        assert_eq!(terminated.reason.as_deref(), Some("Terminated"));
    }

    #[tokio::test]
    async fn terminal_status_is_served_once() {
        let mock = Arc::new(MockProvider::new(MockConfig::default()));
        let polling = PollingProvider::new(mock);
        polling.create_pod(&pod("web")).await.unwrap();
        polling.delete_pod(&pod("web")).await.unwrap();

        assert!(polling.get_pod_status("default", "web").await.unwrap().is_some());
        assert!(polling.get_pod_status("default", "web").await.unwrap().is_none());
        assert_eq!(polling.tombstones(), 0);
    }

    #[tokio::test]
    async fn sweeps_drop_reported_tombstones() {
        let mock = Arc::new(MockProvider::new(MockConfig::default()));
        let polling = PollingProvider::new(mock);
        let (callback, count) = counting_callback();
        polling.notify_pods(callback);

        for i in 0..500 {
            let churn = pod(&format!("churn-{}", i));
            polling.create_pod(&churn).await.unwrap();
            polling.delete_pod(&churn).await.unwrap();
        }
        assert_eq!(polling.tombstones(), 500);
        assert_eq!(count.load(Ordering::SeqCst), 500);

        assert_eq!(polling.sweep().await.unwrap(), 0);
        assert_eq!(polling.tombstones(), 0);
        assert_eq!(count.load(Ordering::SeqCst), 1000);

        polling.sweep().await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1000);
    }

    #[test]
    fn wrapper_always_offers_notify_pods() {
        let mock = Arc::new(MockProvider::new(MockConfig::default()));
        let polling = PollingProvider::new(mock);
        assert!(polling.as_pod_notifier().is_some());
    }
}
