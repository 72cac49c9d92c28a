//! Pod controller
//!
//! Informer events enqueue `namespace/name` keys; workers pop a key and
//! either realize the pod in the provider or tear it down.

use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use crate::controllers::Context;
use crate::manager::{object_key, split_key, EventHandler};
use crate::metrics::{MANAGED_PODS, RECONCILE_DURATION, RECONCILIATIONS, RECONCILIATION_ERRORS};
use crate::queue::{handle_result, ItemOutcome, WorkQueue};
use crate::reconcilers::pod as pod_reconciler;
use crate::Result;

const CONTROLLER: &str = "pod";

/// Enqueues pod keys from informer events
struct PodEvents {
    queue: Arc<WorkQueue>,
}

impl PodEvents {
    fn enqueue(&self, pod: &Pod) {
        self.queue
            .add(object_key(&pod.namespace().unwrap_or_default(), &pod.name_any()));
    }
}

/// Whether an update touches anything besides the status and resource version
pub fn should_enqueue_update(old: &Pod, new: &Pod) -> bool {
    let mut old_meta = old.metadata.clone();
    let mut new_meta = new.metadata.clone();
    old_meta.resource_version = None;
    new_meta.resource_version = None;
    old_meta != new_meta || old.spec != new.spec
}

impl EventHandler<Pod> for PodEvents {
    fn on_add(&self, pod: &Pod) {
        self.enqueue(pod);
    }

    fn on_update(&self, old: &Pod, new: &Pod) {
        if should_enqueue_update(old, new) {
            self.enqueue(new);
        }
    }

    fn on_delete(&self, pod: &Pod) {
        self.enqueue(pod);
    }
}

pub struct PodController {
    ctx: Arc<Context>,
    queue: Arc<WorkQueue>,
}

impl PodController {
    /// Create the controller and subscribe it to the pod informer
    pub fn new(ctx: Arc<Context>) -> Arc<Self> {
        let queue = WorkQueue::new("pods");
        ctx.resources
            .pod_informer()
            .add_handler(Arc::new(PodEvents {
                queue: queue.clone(),
            }));
        Arc::new(Self { ctx, queue })
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    /// Delete provider pods the control plane no longer knows about.
    ///
    /// Returns how many dangling pods were found. Failed deletes are logged.
    pub async fn sweep_dangling(&self) -> Result<usize> {
        let ctx = &self.ctx;
        let pods = ctx.provider_call(ctx.provider.get_pods()).await?;
        let dangling: Vec<Pod> = pods
            .into_iter()
            .filter(|p| {
                !ctx.resources
                    .has_pod(&object_key(&p.namespace().unwrap_or_default(), &p.name_any()))
            })
            .collect();
        let found = dangling.len();

        futures::stream::iter(dangling)
            .for_each_concurrent(ctx.config.pod_sync_workers, |pod| async move {
                let namespace = pod.namespace().unwrap_or_default();
                let name = pod.name_any();
                match ctx.provider_call(ctx.provider.delete_pod(&pod)).await {
                    Ok(()) => info!(namespace = %namespace, name = %name, "Deleted dangling pod"),
                    Err(e) if e.is_not_found() => {
                        debug!(namespace = %namespace, name = %name, "Dangling pod already gone")
                    }
                    Err(e) => {
                        warn!(namespace = %namespace, name = %name, error = %e, "Failed to delete dangling pod")
                    }
                }
            })
            .await;

        if found > 0 {
            info!(count = found, "Finished dangling pod sweep");
        }
        Ok(found)
    }

    /// Run `pod_sync_workers` workers until the root token is cancelled
    pub async fn run(self: Arc<Self>) {
        info!(workers = self.ctx.config.pod_sync_workers, "Starting pod controller");
        let workers: Vec<_> = (0..self.ctx.config.pod_sync_workers)
            .map(|id| tokio::spawn(self.clone().worker(id)))
            .collect();

        self.ctx.token.cancelled().await;
        self.queue.shut_down();
        futures::future::join_all(workers).await;
        info!("Pod controller stopped");
    }

    async fn worker(self: Arc<Self>, id: usize) {
        debug!(worker = id, "Pod worker started");
        while let Some(key) = self.queue.get().await {
            self.process(&key).await;
        }
        debug!(worker = id, "Pod worker stopped");
    }

    /// Sync one key and apply the retry policy to the result
    pub async fn process(&self, key: &str) -> ItemOutcome {
        let start = Instant::now();
        RECONCILIATIONS.with_label_values(&[CONTROLLER]).inc();

        let result = self.sync(key).await;
        RECONCILE_DURATION
            .with_label_values(&[CONTROLLER])
            .observe(start.elapsed().as_secs_f64());
        if result.is_err() {
            RECONCILIATION_ERRORS.with_label_values(&[CONTROLLER]).inc();
        }
        MANAGED_PODS.set(self.ctx.resources.get_pods().len() as f64);

        let outcome = handle_result(&self.queue, key, result);
        if let ItemOutcome::RetriesExhausted(err) = &outcome {
            if let Ok((ns, name)) = split_key(key) {
                if let Some(pod) = self.ctx.resources.get_pod(ns, name) {
                    self.ctx
                        .recorder
                        .warning(
                            &pod,
                            pod_reconciler::REASON_PROVIDER_FAILED,
                            format!("giving up after repeated failures: {}", err),
                        )
                        .await;
                }
            }
        }
        outcome
    }

    #[instrument(skip(self))]
    pub async fn sync(&self, key: &str) -> Result<()> {
        let (namespace, name) = split_key(key)?;
        match self.ctx.resources.get_pod(namespace, name) {
            None => pod_reconciler::delete_in_provider(&self.ctx, namespace, name, None).await,
            Some(pod) => self.sync_pod(&pod).await,
        }
    }

    async fn sync_pod(&self, pod: &Pod) -> Result<()> {
        let namespace = pod.namespace().unwrap_or_default();
        let name = pod.name_any();

        if pod.metadata.deletion_timestamp.is_some() {
            return pod_reconciler::delete_in_provider(&self.ctx, &namespace, &name, Some(pod)).await;
        }

        if pod_reconciler::is_terminal(pod) {
            warn!(
                namespace = %namespace,
                name = %name,
                phase = ?pod_reconciler::phase(pod),
                "Skipping sync of pod in terminal phase"
            );
            return Ok(());
        }

        let existing = self
            .ctx
            .provider_call(self.ctx.provider.get_pod(&namespace, &name))
            .await
            .or_else(|e| if e.is_not_found() { Ok(None) } else { Err(e) })?;
        if existing.is_some() {
            pod_reconciler::track_references(&self.ctx, pod);
            debug!(namespace = %namespace, name = %name, "Pod already exists in provider");
            return Ok(());
        }

        pod_reconciler::create_in_provider(&self.ctx, pod).await
    }
}
