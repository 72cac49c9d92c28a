//! Engine wiring
//!
//! Owns the controllers, the informers and the provider adapters, and runs
//! them under one root cancellation token.

use std::sync::{Arc, Mutex};

use k8s_openapi::api::core::v1::{ConfigMap, Pod, Secret, Service};
use kube::runtime::watcher;
use kube::{Api, Client};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::adapters::{ControlPlane, KubeControlPlane};
use crate::config::EngineConfig;
use crate::controllers::{
    node_controller, pod_controller::PodController, resource_controller::ConfigMapController,
    resource_controller::SecretController, status_reconciler, Context,
};
use crate::manager::ResourceManager;
use crate::metrics::{ENGINE_HEALTH, ENGINE_READY};
use crate::provider::polling::PollingProvider;
use crate::provider::{Capabilities, Provider};

pub struct Engine {
    ctx: Arc<Context>,
    client: Option<Client>,
    pods: Arc<PodController>,
    config_maps: Option<Arc<ConfigMapController>>,
    secrets: Option<Arc<SecretController>>,
    polling: Option<Arc<PollingProvider>>,
    notifications: Mutex<Option<UnboundedReceiver<Pod>>>,
    ready: watch::Sender<bool>,
}

impl Engine {
    /// Build an engine over an arbitrary control plane. The caller feeds the
    /// informers of `resources`.
    pub fn new(
        config: EngineConfig,
        provider: Arc<dyn Provider>,
        control_plane: Arc<dyn ControlPlane>,
        resources: Arc<ResourceManager>,
    ) -> Self {
        let capabilities = Capabilities::of(provider.as_ref());
        info!(?capabilities, node = %config.node_name, "Creating engine");

        let (provider, polling): (Arc<dyn Provider>, Option<Arc<PollingProvider>>) =
            if capabilities.notify_pods {
                (provider, None)
            } else {
                info!("Provider cannot push pod status, polling it instead");
                let polling = Arc::new(PollingProvider::new(provider));
                (polling.clone(), Some(polling))
            };

        let (callback, notifications) = status_reconciler::notify_channel();
        if let Some(notifier) = provider.as_pod_notifier() {
            notifier.notify_pods(callback);
        }

        let ctx = Context::new(
            config,
            provider,
            control_plane,
            resources,
            CancellationToken::new(),
        );
        let pods = PodController::new(ctx.clone());
        let config_maps = ConfigMapController::new(ctx.clone());
        let secrets = SecretController::new(ctx.clone());
        let (ready, _) = watch::channel(false);

        Self {
            ctx,
            client: None,
            pods,
            config_maps,
            secrets,
            polling,
            notifications: Mutex::new(Some(notifications)),
            ready,
        }
    }

    /// Build an engine against a live cluster. Informers are started by [`Engine::run`].
    pub fn from_client(config: EngineConfig, provider: Arc<dyn Provider>, client: Client) -> Self {
        let control_plane = Arc::new(KubeControlPlane::new(client.clone()));
        let mut engine = Self::new(config, provider, control_plane, Arc::new(ResourceManager::new()));
        engine.client = Some(client);
        engine
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.ctx.resources
    }

    /// Provider as seen by the controllers, wrapped for polling if needed
    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.ctx.provider
    }

    pub fn pod_controller(&self) -> &Arc<PodController> {
        &self.pods
    }

    pub fn config_map_controller(&self) -> Option<&Arc<ConfigMapController>> {
        self.config_maps.as_ref()
    }

    pub fn secret_controller(&self) -> Option<&Arc<SecretController>> {
        self.secrets.as_ref()
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Resolves once the caches have synced and the dangling pod sweep is done
    pub async fn ready(&self) {
        let mut rx = self.ready.subscribe();
        // The sender lives as long as self
        let _ = rx.wait_for(|ready| *ready).await;
    }

    fn spawn_informers(&self, client: &Client) -> Vec<JoinHandle<()>> {
        let config = &self.ctx.config;
        let token = self.ctx.token.clone();
        let resources = &self.ctx.resources;

        let pods: Api<Pod> = match &config.namespace {
            Some(ns) => Api::namespaced(client.clone(), ns),
            None => Api::all(client.clone()),
        };
        let pod_filter =
            watcher::Config::default().fields(&format!("spec.nodeName={}", config.node_name));

        let config_maps: Api<ConfigMap> = Api::all(client.clone());
        let secrets: Api<Secret> = Api::all(client.clone());
        let services: Api<Service> = Api::all(client.clone());

        vec![
            tokio::spawn(resources.pod_informer().clone().run(pods, pod_filter, token.clone())),
            tokio::spawn(resources.config_map_informer().clone().run(
                config_maps,
                watcher::Config::default(),
                token.clone(),
            )),
            tokio::spawn(resources.secret_informer().clone().run(
                secrets,
                watcher::Config::default(),
                token.clone(),
            )),
            tokio::spawn(resources.service_informer().clone().run(
                services,
                watcher::Config::default(),
                token,
            )),
        ]
    }

    async fn wait_for_caches(&self) {
        let resources = &self.ctx.resources;
        tokio::join!(
            resources.pod_informer().wait_synced(),
            resources.config_map_informer().wait_synced(),
            resources.secret_informer().wait_synced(),
            resources.service_informer().wait_synced(),
        );
    }

    /// Run every component until `token` is cancelled, then wait for them to stop
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        let root = self.ctx.token.clone();
        let link = tokio::spawn({
            let root = root.clone();
            async move {
                token.cancelled().await;
                root.cancel();
            }
        });

        ENGINE_HEALTH.set(1.0);
        let mut handles = match &self.client {
            Some(client) => self.spawn_informers(client),
            None => Vec::new(),
        };
        handles.push(tokio::spawn(node_controller::run(self.ctx.clone())));

        tokio::select! {
            _ = root.cancelled() => {}
            _ = self.wait_for_caches() => {
                info!("Caches synced");
                match self.pods.sweep_dangling().await {
                    Ok(count) => info!(dangling = count, "Startup reconciliation complete"),
                    Err(e) => warn!(error = %e, "Dangling pod sweep failed"),
                }

                handles.push(tokio::spawn(self.pods.clone().run()));
                if let Some(controller) = &self.config_maps {
                    handles.push(tokio::spawn(controller.clone().run()));
                }
                if let Some(controller) = &self.secrets {
                    handles.push(tokio::spawn(controller.clone().run()));
                }
                if let Some(polling) = &self.polling {
                    handles.push(tokio::spawn(
                        polling.clone().run(self.ctx.config.poll_interval, root.clone()),
                    ));
                }
                let notifications = self
                    .notifications
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .take();
                if let Some(notifications) = notifications {
                    handles.push(tokio::spawn(status_reconciler::run(
                        self.ctx.clone(),
                        notifications,
                    )));
                }

                self.ready.send_replace(true);
                ENGINE_READY.set(1.0);
                info!("Engine ready");
                root.cancelled().await;
            }
        }

        info!("Shutting down engine");
        ENGINE_READY.set(0.0);
        futures::future::join_all(handles).await;
        link.abort();
        ENGINE_HEALTH.set(0.0);
        info!("Engine stopped");
    }
}
