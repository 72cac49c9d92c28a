//! Controllers driving the virtual node

pub mod node_controller;
pub mod pod_controller;
pub mod resource_controller;
pub mod status_reconciler;

use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::adapters::{ControlPlane, EventRecorder};
use crate::config::EngineConfig;
use crate::manager::{RefCounter, ResourceManager};
use crate::provider::{Provider, ProviderResult};
use crate::{Error, Result};

/// Shared context for controllers
pub struct Context {
    pub config: EngineConfig,
    pub provider: Arc<dyn Provider>,
    pub control_plane: Arc<dyn ControlPlane>,
    pub resources: Arc<ResourceManager>,
    pub recorder: EventRecorder,
    /// configmap key -> referencing pod keys
    pub config_map_refs: Arc<RefCounter>,
    /// secret key -> referencing pod keys
    pub secret_refs: Arc<RefCounter>,
    /// Root cancellation token
    pub token: CancellationToken,
}

impl Context {
    /// Create a new context
    pub fn new(
        config: EngineConfig,
        provider: Arc<dyn Provider>,
        control_plane: Arc<dyn ControlPlane>,
        resources: Arc<ResourceManager>,
        token: CancellationToken,
    ) -> Arc<Self> {
        let recorder = EventRecorder::new(control_plane.clone(), config.node_name.clone());
        Arc::new(Self {
            config,
            provider,
            control_plane,
            resources,
            recorder,
            config_map_refs: Arc::new(RefCounter::new()),
            secret_refs: Arc::new(RefCounter::new()),
            token,
        })
    }

    /// Run a provider call, abandoning it if the root token is cancelled
    pub async fn provider_call<T, F>(&self, call: F) -> Result<T>
    where
        F: Future<Output = ProviderResult<T>>,
    {
        tokio::select! {
            _ = self.token.cancelled() => Err(Error::Cancelled),
            res = call => res.map_err(Error::from),
        }
    }
}
