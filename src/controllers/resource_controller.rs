//! ConfigMap and Secret re-push controllers
//!
//! When a referenced configmap or secret changes, the provider is handed
//! the new object together with the keys of the pods that reference it.
//! Inert for providers without the matching update capability.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument};

use crate::controllers::Context;
use crate::manager::{object_key, split_key, EventHandler, Informer, RefCounter, ResourceManager};
use crate::metrics::{RECONCILE_DURATION, RECONCILIATIONS, RECONCILIATION_ERRORS};
use crate::provider::{Provider, ProviderError, ProviderResult};
use crate::queue::{handle_result, ItemOutcome, WorkQueue};
use crate::Result;

/// A resource whose changes are pushed to the provider
#[async_trait]
pub trait PushedResource: Resource + Clone + Send + Sync + 'static {
    /// Queue and metric label
    const NAME: &'static str;

    fn informer(resources: &ResourceManager) -> &Arc<Informer<Self>>;

    fn refs(ctx: &Context) -> &Arc<RefCounter>;

    fn supported(provider: &dyn Provider) -> bool;

    async fn push(provider: &dyn Provider, obj: &Self, refs: &[String]) -> ProviderResult<()>;
}

#[async_trait]
impl PushedResource for ConfigMap {
    const NAME: &'static str = "configmaps";

    fn informer(resources: &ResourceManager) -> &Arc<Informer<Self>> {
        resources.config_map_informer()
    }

    fn refs(ctx: &Context) -> &Arc<RefCounter> {
        &ctx.config_map_refs
    }

    fn supported(provider: &dyn Provider) -> bool {
        provider.as_config_map_updater().is_some()
    }

    async fn push(provider: &dyn Provider, obj: &Self, refs: &[String]) -> ProviderResult<()> {
        match provider.as_config_map_updater() {
            Some(updater) => updater.update_config_map(obj, refs).await,
            None => Err(ProviderError::NotImplemented("UpdateConfigMap")),
        }
    }
}

#[async_trait]
impl PushedResource for Secret {
    const NAME: &'static str = "secrets";

    fn informer(resources: &ResourceManager) -> &Arc<Informer<Self>> {
        resources.secret_informer()
    }

    fn refs(ctx: &Context) -> &Arc<RefCounter> {
        &ctx.secret_refs
    }

    fn supported(provider: &dyn Provider) -> bool {
        provider.as_secret_updater().is_some()
    }

    async fn push(provider: &dyn Provider, obj: &Self, refs: &[String]) -> ProviderResult<()> {
        match provider.as_secret_updater() {
            Some(updater) => updater.update_secret(obj, refs).await,
            None => Err(ProviderError::NotImplemented("UpdateSecret")),
        }
    }
}

struct UpdateEvents {
    queue: Arc<WorkQueue>,
    refs: Arc<RefCounter>,
}

impl<K: PushedResource> EventHandler<K> for UpdateEvents {
    fn on_update(&self, _old: &K, new: &K) {
        let key = object_key(&new.namespace().unwrap_or_default(), &new.name_any());
        if self.refs.has_referrers(&key) {
            self.queue.add(key);
        }
    }
}

pub struct ResourceController<K> {
    ctx: Arc<Context>,
    queue: Arc<WorkQueue>,
    _kind: PhantomData<fn() -> K>,
}

pub type ConfigMapController = ResourceController<ConfigMap>;
pub type SecretController = ResourceController<Secret>;

impl<K: PushedResource> ResourceController<K> {
    /// Create the controller and subscribe it to update events, or `None`
    /// when the provider cannot take updates for this kind
    pub fn new(ctx: Arc<Context>) -> Option<Arc<Self>> {
        if !K::supported(ctx.provider.as_ref()) {
            debug!(kind = K::NAME, "Provider does not accept updates, controller disabled");
            return None;
        }
        let queue = WorkQueue::new(K::NAME);
        K::informer(&ctx.resources).add_handler(Arc::new(UpdateEvents {
            queue: queue.clone(),
            refs: K::refs(&ctx).clone(),
        }));
        Some(Arc::new(Self {
            ctx,
            queue,
            _kind: PhantomData,
        }))
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    /// Run `pod_sync_workers` workers until the root token is cancelled
    pub async fn run(self: Arc<Self>) {
        info!(kind = K::NAME, "Starting resource controller");
        let workers: Vec<_> = (0..self.ctx.config.pod_sync_workers)
            .map(|_| {
                let this = self.clone();
                tokio::spawn(async move {
                    while let Some(key) = this.queue.get().await {
                        this.process(&key).await;
                    }
                })
            })
            .collect();

        self.ctx.token.cancelled().await;
        self.queue.shut_down();
        futures::future::join_all(workers).await;
        info!(kind = K::NAME, "Resource controller stopped");
    }

    pub async fn process(&self, key: &str) -> ItemOutcome {
        let start = Instant::now();
        RECONCILIATIONS.with_label_values(&[K::NAME]).inc();
        let result = self.sync(key).await;
        RECONCILE_DURATION
            .with_label_values(&[K::NAME])
            .observe(start.elapsed().as_secs_f64());
        if result.is_err() {
            RECONCILIATION_ERRORS.with_label_values(&[K::NAME]).inc();
        }
        handle_result(&self.queue, key, result)
    }

    #[instrument(skip(self), fields(kind = K::NAME))]
    pub async fn sync(&self, key: &str) -> Result<()> {
        let (namespace, name) = split_key(key)?;
        let Some(obj) = K::informer(&self.ctx.resources).cache().get(namespace, name) else {
            debug!("Resource no longer exists");
            return Ok(());
        };
        let refs = K::refs(&self.ctx).referrers(key);
        if refs.is_empty() {
            return Ok(());
        }
        self.ctx
            .provider_call(K::push(self.ctx.provider.as_ref(), &obj, &refs))
            .await?;
        info!(referrers = refs.len(), "Pushed update to provider");
        Ok(())
    }
}
