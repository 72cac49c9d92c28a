//! Status reconciler
//!
//! Copies provider status onto the control plane pods. Runs a periodic
//! sweep over the cached pods and also drains the provider's NotifyPods
//! callbacks, both through [`pod_reconciler::update_status`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::controllers::Context;
use crate::provider::PodCallback;
use crate::reconcilers::pod as pod_reconciler;
use crate::Result;

/// Callback handed to the provider plus the receiving end the reconciler drains
pub fn notify_channel() -> (PodCallback, UnboundedReceiver<Pod>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let callback: PodCallback = Arc::new(move |pod: Pod| {
        if tx.send(pod).is_err() {
            debug!("Status reconciler stopped, dropping pod notification");
        }
    });
    (callback, rx)
}

/// Pods whose status is no longer reconciled from the provider
pub fn should_skip(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_some() || pod_reconciler::is_terminal(pod)
}

/// A failed create already explains why the provider has no such pod
fn create_failed(pod: &Pod) -> bool {
    pod_reconciler::reason(pod) == Some(pod_reconciler::REASON_PROVIDER_FAILED)
}

/// Reconcile one cached pod. Returns true when a status update was pushed.
pub async fn reconcile_pod(ctx: &Context, pod: &Pod, now: DateTime<Utc>) -> Result<bool> {
    if should_skip(pod) {
        return Ok(false);
    }
    let namespace = pod.namespace().unwrap_or_default();
    let name = pod.name_any();

    let status = ctx
        .provider_call(ctx.provider.get_pod_status(&namespace, &name))
        .await
        .or_else(|e| if e.is_not_found() { Ok(None) } else { Err(e) })?;

    let mut updated = pod.clone();
    match status {
        Some(status) => {
            if pod.status.as_ref() == Some(&status) {
                return Ok(false);
            }
            updated.status = Some(status);
            pod_reconciler::update_status(ctx, &updated, "sweep").await?;
        }
        None if !create_failed(pod) && pod_reconciler::should_declare_lost(pod, now) => {
            info!(namespace = %namespace, name = %name, "Pod not found in provider, marking it failed");
            updated.status = Some(pod_reconciler::provider_lost_status(pod, now));
            pod_reconciler::update_status(ctx, &updated, "lost").await?;
        }
        None => return Ok(false),
    }
    Ok(true)
}

/// Walk every cached pod once. Returns how many statuses were pushed.
pub async fn sweep(ctx: &Context) -> usize {
    let now = Utc::now();
    let mut pushed = 0;
    for pod in ctx.resources.get_pods() {
        match reconcile_pod(ctx, &pod, now).await {
            Ok(true) => pushed += 1,
            Ok(false) => {}
            Err(crate::Error::Cancelled) => break,
            Err(e) => warn!(
                namespace = %pod.namespace().unwrap_or_default(),
                name = %pod.name_any(),
                error = %e,
                "Failed to reconcile pod status"
            ),
        }
    }
    pushed
}

/// Apply a status pushed by the provider to the cached pod
pub async fn apply_notification(ctx: &Context, provider_pod: Pod) -> Result<()> {
    let namespace = provider_pod.namespace().unwrap_or_default();
    let name = provider_pod.name_any();
    let Some(cached) = ctx.resources.get_pod(&namespace, &name) else {
        debug!(namespace = %namespace, name = %name, "Notification for unknown pod");
        return Ok(());
    };
    if should_skip(&cached) || cached.status == provider_pod.status {
        return Ok(());
    }
    let mut updated = (*cached).clone();
    updated.status = provider_pod.status;
    pod_reconciler::update_status(ctx, &updated, "notify").await
}

/// Sweep every `status_interval` and apply notifications until cancelled
pub async fn run(ctx: Arc<Context>, mut notifications: UnboundedReceiver<Pod>) {
    let mut ticker = tokio::time::interval(ctx.config.status_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ctx.token.cancelled() => break,
            _ = ticker.tick() => {
                let pushed = sweep(&ctx).await;
                if pushed > 0 {
                    debug!(pushed, "Status sweep finished");
                }
            }
            Some(pod) = notifications.recv() => {
                if let Err(e) = apply_notification(&ctx, pod).await {
                    warn!(error = %e, "Failed to apply pod notification");
                }
            }
        }
    }

    info!("Status reconciler stopped");
}
