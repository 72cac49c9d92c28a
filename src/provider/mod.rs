//! Backend provider abstraction
//!
//! A provider realizes pods against some foreign execution backend. The
//! engine only ever talks to it through [`Provider`]; optional capabilities
//! are exposed through the `as_*` accessors and queried once when the engine
//! starts.

pub mod mock;
pub mod polling;

use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{
    ConfigMap, NodeAddress, NodeCondition, NodeDaemonEndpoints, Pod, PodStatus, Secret,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Result type at the provider boundary
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Errors a provider reports back to the engine
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// The backend does not know the object. Never an error on delete.
    #[error("not found: {0}")]
    NotFound(String),

    /// The backend refused the request and will keep refusing it
    #[error("{0}")]
    Permanent(String),

    /// The request failed but may succeed later
    #[error("{0}")]
    Transient(String),

    /// The provider lacks an optional capability
    #[error("{0} is not implemented by this provider")]
    NotImplemented(&'static str),

    /// The call was abandoned because the engine is shutting down
    #[error("provider call cancelled")]
    Cancelled,
}

impl ProviderError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ProviderError::NotFound(_))
    }
}

/// Readable log stream returned by [`Provider::get_container_logs`]
pub type LogStream = Pin<Box<dyn AsyncRead + Send>>;

/// Options accepted by the container logs endpoint
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContainerLogOpts {
    pub tail: Option<i64>,
    pub limit_bytes: Option<i64>,
    pub since_seconds: Option<i64>,
    pub timestamps: bool,
    pub follow: bool,
    pub previous: bool,
}

/// Number of lines returned when the caller does not ask for a tail
pub const DEFAULT_TAIL_LINES: i64 = 10;

impl Default for ContainerLogOpts {
    fn default() -> Self {
        Self {
            tail: Some(DEFAULT_TAIL_LINES),
            limit_bytes: None,
            since_seconds: None,
            timestamps: false,
            follow: false,
            previous: false,
        }
    }
}

/// Streams attached to a command executed inside a container
#[derive(Default)]
pub struct AttachIo {
    pub stdin: Option<Pin<Box<dyn AsyncRead + Send>>>,
    pub stdout: Option<Pin<Box<dyn AsyncWrite + Send>>>,
    pub stderr: Option<Pin<Box<dyn AsyncWrite + Send>>>,
    pub tty: bool,
}

/// Callback the engine hands to [`PodNotifier::notify_pods`]
pub type PodCallback = Arc<dyn Fn(Pod) + Send + Sync>;

/// Mandatory provider surface
#[async_trait]
pub trait Provider: Send + Sync {
    /// Deploy a pod in the backend
    async fn create_pod(&self, pod: &Pod) -> ProviderResult<()>;

    /// Update a pod in the backend. May be a no-op.
    async fn update_pod(&self, pod: &Pod) -> ProviderResult<()>;

    /// Delete a pod from the backend
    async fn delete_pod(&self, pod: &Pod) -> ProviderResult<()>;

    /// Fetch a pod from the backend. `None` means the backend does not have it.
    async fn get_pod(&self, namespace: &str, name: &str) -> ProviderResult<Option<Pod>>;

    /// Fetch the status of a pod. `None` means the status is unknown.
    async fn get_pod_status(&self, namespace: &str, name: &str)
        -> ProviderResult<Option<PodStatus>>;

    /// Snapshot of every pod the backend owns for this node
    async fn get_pods(&self) -> ProviderResult<Vec<Pod>>;

    /// Stream the logs of a container
    async fn get_container_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        opts: &ContainerLogOpts,
    ) -> ProviderResult<LogStream>;

    /// Resources the node advertises. Allocatable is the same list.
    fn capacity(&self) -> BTreeMap<String, Quantity>;

    fn node_conditions(&self) -> Vec<NodeCondition>;

    fn node_addresses(&self) -> Vec<NodeAddress>;

    /// Daemon endpoints to advertise. `None` lets the engine advertise its own kubelet port.
    fn node_daemon_endpoints(&self) -> Option<NodeDaemonEndpoints> {
        None
    }

    fn operating_system(&self) -> String;

    fn as_pod_notifier(&self) -> Option<&dyn PodNotifier> {
        None
    }

    fn as_config_map_updater(&self) -> Option<&dyn ConfigMapUpdater> {
        None
    }

    fn as_secret_updater(&self) -> Option<&dyn SecretUpdater> {
        None
    }

    fn as_container_executor(&self) -> Option<&dyn ContainerExecutor> {
        None
    }

    fn as_metrics_provider(&self) -> Option<&dyn PodMetricsProvider> {
        None
    }
}

/// Providers that push pod status changes instead of being polled
pub trait PodNotifier: Send + Sync {
    /// Register the callback to invoke on every pod status change.
    /// Must not block the caller.
    fn notify_pods(&self, callback: PodCallback);
}

/// Providers that want to know when a referenced configmap changes
#[async_trait]
pub trait ConfigMapUpdater: Send + Sync {
    /// `refs` holds the `namespace/name` keys of every pod referencing `config_map`
    async fn update_config_map(&self, config_map: &ConfigMap, refs: &[String])
        -> ProviderResult<()>;
}

/// Providers that want to know when a referenced secret changes
#[async_trait]
pub trait SecretUpdater: Send + Sync {
    async fn update_secret(&self, secret: &Secret, refs: &[String]) -> ProviderResult<()>;
}

/// Providers that can run commands inside containers
#[async_trait]
pub trait ContainerExecutor: Send + Sync {
    /// Run `command` in the container and return its exit code
    async fn run_in_container(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: Vec<String>,
        io: AttachIo,
    ) -> ProviderResult<i32>;
}

/// Providers that report kubelet summary stats
#[async_trait]
pub trait PodMetricsProvider: Send + Sync {
    async fn get_stats_summary(&self) -> ProviderResult<StatsSummary>;
}

/// Which optional capabilities a provider offers
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub notify_pods: bool,
    pub update_config_maps: bool,
    pub update_secrets: bool,
    pub run_in_container: bool,
    pub stats_summary: bool,
}

impl Capabilities {
    pub fn of(provider: &dyn Provider) -> Self {
        Self {
            notify_pods: provider.as_pod_notifier().is_some(),
            update_config_maps: provider.as_config_map_updater().is_some(),
            update_secrets: provider.as_secret_updater().is_some(),
            run_in_container: provider.as_container_executor().is_some(),
            stats_summary: provider.as_metrics_provider().is_some(),
        }
    }
}

/// Kubelet summary API payload
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatsSummary {
    pub node: NodeStats,
    #[serde(default)]
    pub pods: Vec<PodStats>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeStats {
    pub node_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<CpuStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryStats>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodReference {
    pub name: String,
    pub namespace: String,
    pub uid: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodStats {
    pub pod_ref: PodReference,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub containers: Vec<ContainerStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<CpuStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryStats>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContainerStats {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<CpuStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryStats>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CpuStats {
    pub time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage_nano_cores: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage_core_nano_seconds: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStats {
    pub time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_set_bytes: Option<u64>,
}
