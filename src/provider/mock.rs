//! In-memory provider
//!
//! Keeps pods in a map and reports them Running as soon as they are created.
//! Used by the binary when `--provider mock` is selected and by the tests,
//! which rely on its call log and failure injection.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::{
    ConfigMap, ContainerState, ContainerStateRunning, ContainerStatus, DaemonEndpoint,
    NodeAddress, NodeCondition, NodeDaemonEndpoints, Pod, PodCondition, PodStatus, Secret,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use super::{
    AttachIo, ConfigMapUpdater, ContainerExecutor, ContainerLogOpts, CpuStats, LogStream,
    MemoryStats, NodeStats, PodCallback, PodMetricsProvider, PodNotifier, PodReference, PodStats,
    Provider, ProviderError, ProviderResult, SecretUpdater, StatsSummary,
};

/// Static node metadata the mock advertises
#[derive(Clone, Debug)]
pub struct MockConfig {
    pub node_name: String,
    pub operating_system: String,
    pub internal_ip: String,
    pub daemon_port: i32,
    pub cpu: String,
    pub memory: String,
    pub pods: String,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            node_name: "virtual-kubelet".to_string(),
            operating_system: "Linux".to_string(),
            internal_ip: "127.0.0.1".to_string(),
            daemon_port: 10250,
            cpu: "20".to_string(),
            memory: "100Gi".to_string(),
            pods: "20".to_string(),
        }
    }
}

/// A mutating call observed by the mock
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProviderCall {
    Create(String),
    Update(String),
    Delete(String),
    UpdateConfigMap { key: String, refs: Vec<String> },
    UpdateSecret { key: String, refs: Vec<String> },
}

/// In-memory [`Provider`]
pub struct MockProvider {
    config: MockConfig,
    pods: Mutex<BTreeMap<String, Pod>>,
    calls: Mutex<Vec<ProviderCall>>,
    create_failure: Mutex<Option<ProviderError>>,
    callback: Mutex<Option<PodCallback>>,
    notifier: bool,
    resource_updates: bool,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn pod_key(pod: &Pod) -> String {
    format!("{}/{}", pod.namespace().unwrap_or_default(), pod.name_any())
}

fn resource_key(namespace: Option<String>, name: String) -> String {
    format!("{}/{}", namespace.unwrap_or_default(), name)
}

impl MockProvider {
    /// A mock with every optional capability enabled except NotifyPods
    pub fn new(config: MockConfig) -> Self {
        Self {
            config,
            pods: Mutex::new(BTreeMap::new()),
            calls: Mutex::new(Vec::new()),
            create_failure: Mutex::new(None),
            callback: Mutex::new(None),
            notifier: false,
            resource_updates: true,
        }
    }

    /// Toggle the NotifyPods capability
    pub fn with_notifier(mut self, enabled: bool) -> Self {
        self.notifier = enabled;
        self
    }

    /// Toggle the UpdateConfigMap and UpdateSecret capabilities
    pub fn with_resource_updates(mut self, enabled: bool) -> Self {
        self.resource_updates = enabled;
        self
    }

    /// Seed a pod the backend already owns
    pub fn insert_pod(&self, pod: Pod) {
        locked(&self.pods).insert(pod_key(&pod), pod);
    }

    /// Drop a pod behind the engine's back
    pub fn lose_pod(&self, namespace: &str, name: &str) {
        locked(&self.pods).remove(&format!("{}/{}", namespace, name));
    }

    /// Make every following CreatePod fail with `err`
    pub fn fail_creates_with(&self, err: ProviderError) {
        *locked(&self.create_failure) = Some(err);
    }

    pub fn clear_create_failure(&self) {
        *locked(&self.create_failure) = None;
    }

    /// Overwrite the status of a pod the mock holds and notify it if a callback is registered
    pub fn set_pod_status(&self, namespace: &str, name: &str, status: PodStatus) {
        let updated = {
            let mut pods = locked(&self.pods);
            pods.get_mut(&format!("{}/{}", namespace, name)).map(|pod| {
                pod.status = Some(status);
                pod.clone()
            })
        };
        if let Some(pod) = updated {
            self.notify(pod);
        }
    }

    pub fn calls(&self) -> Vec<ProviderCall> {
        locked(&self.calls).clone()
    }

    pub fn pod_keys(&self) -> Vec<String> {
        locked(&self.pods).keys().cloned().collect()
    }

    /// Pod as the mock received it on creation
    pub fn stored_pod(&self, namespace: &str, name: &str) -> Option<Pod> {
        locked(&self.pods).get(&format!("{}/{}", namespace, name)).cloned()
    }

    fn record(&self, call: ProviderCall) {
        locked(&self.calls).push(call);
    }

    fn notify(&self, pod: Pod) {
        let callback = locked(&self.callback).clone();
        if let Some(callback) = callback {
            callback(pod);
        }
    }
}

fn running_status(pod: &Pod) -> PodStatus {
    let now = Time(Utc::now());
    let container_statuses = pod
        .spec
        .as_ref()
        .map(|spec| {
            spec.containers
                .iter()
                .map(|c| ContainerStatus {
                    name: c.name.clone(),
                    image: c.image.clone().unwrap_or_default(),
                    image_id: String::new(),
                    ready: true,
                    restart_count: 0,
                    started: Some(true),
                    state: Some(ContainerState {
                        running: Some(ContainerStateRunning {
                            started_at: Some(now.clone()),
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                })
                .collect()
        })
        .unwrap_or_default();

    let conditions = ["PodScheduled", "Initialized", "Ready"]
        .iter()
        .map(|t| PodCondition {
            type_: t.to_string(),
            status: "True".to_string(),
            last_transition_time: Some(now.clone()),
            ..Default::default()
        })
        .collect();

    PodStatus {
        phase: Some("Running".to_string()),
        host_ip: Some("1.2.3.4".to_string()),
        pod_ip: Some("5.6.7.8".to_string()),
        start_time: Some(now),
        conditions: Some(conditions),
        container_statuses: Some(container_statuses),
        ..Default::default()
    }
}

#[async_trait]
impl Provider for MockProvider {
    async fn create_pod(&self, pod: &Pod) -> ProviderResult<()> {
        let key = pod_key(pod);
        self.record(ProviderCall::Create(key.clone()));

        if let Some(err) = locked(&self.create_failure).clone() {
            return Err(err);
        }

        let mut stored = pod.clone();
        stored.status = Some(running_status(pod));
        let existed = locked(&self.pods).insert(key.clone(), stored.clone()).is_some();
        if !existed {
            info!(pod = %key, "mock created pod");
            self.notify(stored);
        }
        Ok(())
    }

    async fn update_pod(&self, pod: &Pod) -> ProviderResult<()> {
        let key = pod_key(pod);
        self.record(ProviderCall::Update(key.clone()));
        let mut pods = locked(&self.pods);
        match pods.get_mut(&key) {
            Some(stored) => {
                let status = stored.status.take();
                *stored = pod.clone();
                stored.status = status;
                Ok(())
            }
            None => Err(ProviderError::NotFound(key)),
        }
    }

    async fn delete_pod(&self, pod: &Pod) -> ProviderResult<()> {
        let key = pod_key(pod);
        self.record(ProviderCall::Delete(key.clone()));
        match locked(&self.pods).remove(&key) {
            Some(_) => {
                debug!(pod = %key, "mock deleted pod");
                Ok(())
            }
            None => Err(ProviderError::NotFound(key)),
        }
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> ProviderResult<Option<Pod>> {
        Ok(self.stored_pod(namespace, name))
    }

    async fn get_pod_status(
        &self,
        namespace: &str,
        name: &str,
    ) -> ProviderResult<Option<PodStatus>> {
        Ok(self
            .stored_pod(namespace, name)
            .and_then(|pod| pod.status))
    }

    async fn get_pods(&self) -> ProviderResult<Vec<Pod>> {
        Ok(locked(&self.pods).values().cloned().collect())
    }

    async fn get_container_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        opts: &ContainerLogOpts,
    ) -> ProviderResult<LogStream> {
        if self.stored_pod(namespace, pod).is_none() {
            return Err(ProviderError::NotFound(format!("{}/{}", namespace, pod)));
        }
        let lines = opts.tail.unwrap_or(crate::provider::DEFAULT_TAIL_LINES).max(0);
        let mut out = String::new();
        for i in 0..lines {
            out.push_str(&format!("{}/{}/{} line {}\n", namespace, pod, container, i));
        }
        let mut bytes = out.into_bytes();
        if let Some(limit) = opts.limit_bytes {
            bytes.truncate(limit.max(0) as usize);
        }
        Ok(Box::pin(Cursor::new(bytes)))
    }

    fn capacity(&self) -> BTreeMap<String, Quantity> {
        BTreeMap::from([
            ("cpu".to_string(), Quantity(self.config.cpu.clone())),
            ("memory".to_string(), Quantity(self.config.memory.clone())),
            ("pods".to_string(), Quantity(self.config.pods.clone())),
        ])
    }

    fn node_conditions(&self) -> Vec<NodeCondition> {
        let now = Time(Utc::now());
        let condition = |type_: &str, status: &str, reason: &str, message: &str| NodeCondition {
            type_: type_.to_string(),
            status: status.to_string(),
            last_heartbeat_time: Some(now.clone()),
            last_transition_time: Some(now.clone()),
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
        };
        vec![
            condition("Ready", "True", "KubeletReady", "kubelet is ready."),
            condition("OutOfDisk", "False", "KubeletHasSufficientDisk", "kubelet has sufficient disk space available"),
            condition("MemoryPressure", "False", "KubeletHasSufficientMemory", "kubelet has sufficient memory available"),
            condition("DiskPressure", "False", "KubeletHasNoDiskPressure", "kubelet has no disk pressure"),
            condition("NetworkUnavailable", "False", "RouteCreated", "RouteController created a route"),
        ]
    }

    fn node_addresses(&self) -> Vec<NodeAddress> {
        vec![NodeAddress {
            type_: "InternalIP".to_string(),
            address: self.config.internal_ip.clone(),
        }]
    }

    fn node_daemon_endpoints(&self) -> Option<NodeDaemonEndpoints> {
        Some(NodeDaemonEndpoints {
            kubelet_endpoint: Some(DaemonEndpoint {
                port: self.config.daemon_port,
            }),
        })
    }

    fn operating_system(&self) -> String {
        self.config.operating_system.clone()
    }

    fn as_pod_notifier(&self) -> Option<&dyn PodNotifier> {
        if self.notifier {
            Some(self)
        } else {
            None
        }
    }

    fn as_config_map_updater(&self) -> Option<&dyn ConfigMapUpdater> {
        if self.resource_updates {
            Some(self)
        } else {
            None
        }
    }

    fn as_secret_updater(&self) -> Option<&dyn SecretUpdater> {
        if self.resource_updates {
            Some(self)
        } else {
            None
        }
    }

    fn as_container_executor(&self) -> Option<&dyn ContainerExecutor> {
        Some(self)
    }

    fn as_metrics_provider(&self) -> Option<&dyn PodMetricsProvider> {
        Some(self)
    }
}

impl PodNotifier for MockProvider {
    fn notify_pods(&self, callback: PodCallback) {
        *locked(&self.callback) = Some(callback);
    }
}

#[async_trait]
impl ConfigMapUpdater for MockProvider {
    async fn update_config_map(
        &self,
        config_map: &ConfigMap,
        refs: &[String],
    ) -> ProviderResult<()> {
        self.record(ProviderCall::UpdateConfigMap {
            key: resource_key(config_map.namespace(), config_map.name_any()),
            refs: refs.to_vec(),
        });
        Ok(())
    }
}

#[async_trait]
impl SecretUpdater for MockProvider {
    async fn update_secret(&self, secret: &Secret, refs: &[String]) -> ProviderResult<()> {
        self.record(ProviderCall::UpdateSecret {
            key: resource_key(secret.namespace(), secret.name_any()),
            refs: refs.to_vec(),
        });
        Ok(())
    }
}

#[async_trait]
impl ContainerExecutor for MockProvider {
    /// Echoes the command line to stdout and exits 0
    async fn run_in_container(
        &self,
        namespace: &str,
        pod: &str,
        _container: &str,
        command: Vec<String>,
        io: AttachIo,
    ) -> ProviderResult<i32> {
        if self.stored_pod(namespace, pod).is_none() {
            return Err(ProviderError::NotFound(format!("{}/{}", namespace, pod)));
        }
        if let Some(mut stdout) = io.stdout {
            let line = format!("{}\n", command.join(" "));
            stdout
                .write_all(line.as_bytes())
                .await
                .map_err(|e| ProviderError::Transient(e.to_string()))?;
            stdout
                .flush()
                .await
                .map_err(|e| ProviderError::Transient(e.to_string()))?;
        }
        Ok(0)
    }
}

#[async_trait]
impl PodMetricsProvider for MockProvider {
    async fn get_stats_summary(&self) -> ProviderResult<StatsSummary> {
        let now = Utc::now();
        let pods = locked(&self.pods)
            .values()
            .map(|pod| PodStats {
                pod_ref: PodReference {
                    name: pod.name_any(),
                    namespace: pod.namespace().unwrap_or_default(),
                    uid: pod.uid().unwrap_or_default(),
                },
                start_time: pod
                    .status
                    .as_ref()
                    .and_then(|s| s.start_time.as_ref())
                    .map(|t| t.0),
                containers: Vec::new(),
                cpu: Some(CpuStats {
                    time: now,
                    usage_nano_cores: Some(0),
                    usage_core_nano_seconds: Some(0),
                }),
                memory: Some(MemoryStats {
                    time: now,
                    usage_bytes: Some(0),
                    working_set_bytes: Some(0),
                }),
            })
            .collect();

        Ok(StatsSummary {
            node: NodeStats {
                node_name: self.config.node_name.clone(),
                start_time: None,
                cpu: None,
                memory: None,
            },
            pods,
        })
    }
}
