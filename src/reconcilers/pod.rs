//! Pod reconciliation against the provider
//!
//! Create, delete and status-push paths shared by the pod controller and
//! the status reconciler.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use k8s_openapi::api::core::v1::{ContainerStateTerminated, Pod, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use crate::controllers::Context;
use crate::manager::object_key;
use crate::metrics::POD_STATUS_UPDATES;
use crate::reconcilers::env;
use crate::{Error, Result};

pub const REASON_PROVIDER_FAILED: &str = "ProviderFailed";
pub const REASON_PROVIDER_CREATED: &str = "ProviderCreated";
pub const REASON_PROVIDER_DELETED: &str = "ProviderDeleted";
pub const REASON_NOT_FOUND: &str = "NotFound";

/// Exit code reported for containers the provider lost
pub const LOST_CONTAINER_EXIT_CODE: i32 = -137;

/// How long a pod may be missing from the provider before it is declared lost
pub fn provider_lost_grace() -> ChronoDuration {
    ChronoDuration::minutes(1)
}

/// Status update attempts before a conflicting update is dropped
pub const STATUS_UPDATE_ATTEMPTS: usize = 3;

pub fn phase(pod: &Pod) -> Option<&str> {
    pod.status.as_ref().and_then(|s| s.phase.as_deref())
}

pub fn reason(pod: &Pod) -> Option<&str> {
    pod.status.as_ref().and_then(|s| s.reason.as_deref())
}

pub fn is_terminal(pod: &Pod) -> bool {
    matches!(phase(pod), Some("Succeeded") | Some("Failed"))
}

/// Register the configmaps and secrets `pod` references
pub fn track_references(ctx: &Context, pod: &Pod) {
    let key = object_key(&pod.namespace().unwrap_or_default(), &pod.name_any());
    let (config_maps, secrets) = env::pod_references(pod);
    ctx.config_map_refs.set_pod_refs(&key, config_maps);
    ctx.secret_refs.set_pod_refs(&key, secrets);
}

pub fn forget_references(ctx: &Context, key: &str) {
    ctx.config_map_refs.remove_pod(key);
    ctx.secret_refs.remove_pod(key);
}

/// Status reported when the provider could not take the pod
pub fn provider_failed_status(pod: &Pod, message: &str) -> PodStatus {
    let never = pod
        .spec
        .as_ref()
        .and_then(|s| s.restart_policy.as_deref())
        == Some("Never");
    let mut status = pod.status.clone().unwrap_or_default();
    status.phase = Some(if never { "Failed" } else { "Pending" }.to_string());
    status.reason = Some(REASON_PROVIDER_FAILED.to_string());
    status.message = Some(message.to_string());
    status
}

/// Whether a pod missing from the provider should be declared lost at `now`
pub fn should_declare_lost(pod: &Pod, now: DateTime<Utc>) -> bool {
    if phase(pod) == Some("Running") {
        return true;
    }
    match pod.metadata.creation_timestamp.as_ref() {
        Some(created) => created.0 + provider_lost_grace() < now,
        None => false,
    }
}

/// Status of a pod the provider no longer knows about. Running containers
/// gain a terminated state that keeps their start time and container id.
pub fn provider_lost_status(pod: &Pod, now: DateTime<Utc>) -> PodStatus {
    let mut status = pod.status.clone().unwrap_or_default();
    status.phase = Some("Failed".to_string());
    status.reason = Some(REASON_NOT_FOUND.to_string());
    status.message = Some(
        "The pod status was not found and may have been deleted from the provider".to_string(),
    );
    for cs in status.container_statuses.iter_mut().flatten() {
        let Some(state) = cs.state.as_mut() else {
            continue;
        };
        let Some(running) = state.running.take() else {
            continue;
        };
        state.terminated = Some(ContainerStateTerminated {
            exit_code: LOST_CONTAINER_EXIT_CODE,
            reason: Some(REASON_NOT_FOUND.to_string()),
            message: Some("Container was not found and was likely deleted".to_string()),
            started_at: running.started_at,
            finished_at: Some(Time(now)),
            container_id: cs.container_id.clone(),
            signal: None,
        });
        cs.ready = false;
    }
    status
}

/// Create `pod` in the provider.
///
/// On failure the pod status is set to ProviderFailed and the original error is returned.
#[instrument(skip(ctx, pod), fields(namespace = %pod.namespace().unwrap_or_default(), name = %pod.name_any()))]
pub async fn create_in_provider(ctx: &Context, pod: &Pod) -> Result<()> {
    track_references(ctx, pod);

    let mut copy = pod.clone();
    if let Err(err) = env::populate_environment_variables(&mut copy, &ctx.resources, &ctx.recorder).await {
        warn!(error = %err, "Failed to materialize environment");
        mark_provider_failed(ctx, pod, &err).await;
        return Err(err);
    }

    match ctx.provider_call(ctx.provider.create_pod(&copy)).await {
        Ok(()) => {
            info!("Created pod in provider");
            ctx.recorder
                .normal(pod, REASON_PROVIDER_CREATED, "Created pod in provider")
                .await;
            Ok(())
        }
        Err(Error::Cancelled) => Err(Error::Cancelled),
        Err(err) => {
            warn!(error = %err, "Provider failed to create pod");
            ctx.recorder
                .warning(pod, REASON_PROVIDER_FAILED, err.to_string())
                .await;
            mark_provider_failed(ctx, pod, &err).await;
            Err(err)
        }
    }
}

async fn mark_provider_failed(ctx: &Context, pod: &Pod, err: &Error) {
    let mut failed = pod.clone();
    failed.status = Some(provider_failed_status(pod, &err.to_string()));
    if let Err(e) = update_status(ctx, &failed, "provider-failed").await {
        warn!(error = %e, "Failed to update pod status");
    }
}

/// Remove a pod from the provider and the control plane.
///
/// `pod` is the control plane copy when one is known; it is force-deleted
/// even if the provider never had it.
#[instrument(skip(ctx, pod))]
pub async fn delete_in_provider(ctx: &Context, namespace: &str, name: &str, pod: Option<&Pod>) -> Result<()> {
    let key = object_key(namespace, name);
    let existing = ctx
        .provider_call(ctx.provider.get_pod(namespace, name))
        .await
        .or_else(|e| if e.is_not_found() { Ok(None) } else { Err(e) })?;

    if existing.is_none() && pod.is_none() {
        debug!("Pod is gone from both the provider and the control plane");
        forget_references(ctx, &key);
        return Ok(());
    }

    if let Some(provider_pod) = &existing {
        match ctx.provider_call(ctx.provider.delete_pod(provider_pod)).await {
            Ok(()) => {
                info!("Deleted pod from provider");
                if let Some(pod) = pod {
                    ctx.recorder
                        .normal(pod, REASON_PROVIDER_DELETED, "Deleted pod from provider")
                        .await;
                }
            }
            Err(e) if e.is_not_found() => debug!("Pod already deleted from provider"),
            Err(e) => return Err(e),
        }
    }

    ctx.control_plane.delete_pod(namespace, name).await?;
    forget_references(ctx, &key);
    Ok(())
}

/// Push the status carried by `pod`.
///
/// A resource version conflict re-fetches the pod and retries with the same
/// status; after [`STATUS_UPDATE_ATTEMPTS`] conflicts the update is dropped.
pub async fn update_status(ctx: &Context, pod: &Pod, source: &str) -> Result<()> {
    let namespace = pod.namespace().unwrap_or_default();
    let name = pod.name_any();
    let mut candidate = pod.clone();

    for attempt in 1..=STATUS_UPDATE_ATTEMPTS {
        match ctx.control_plane.update_pod_status(&candidate).await {
            Ok(updated) => {
                POD_STATUS_UPDATES.with_label_values(&[source]).inc();
                debug!(
                    namespace = %namespace,
                    name = %name,
                    phase = ?phase(&updated),
                    reason = ?reason(&updated),
                    "Updated pod status"
                );
                ctx.resources.update_pod(updated);
                return Ok(());
            }
            Err(Error::NotFound(_)) => {
                debug!(namespace = %namespace, name = %name, "Pod gone before its status could be updated");
                return Ok(());
            }
            Err(Error::Conflict(msg)) => {
                debug!(namespace = %namespace, name = %name, attempt, "Status update conflict: {}", msg);
                match ctx.control_plane.get_pod(&namespace, &name).await? {
                    Some(mut latest) => {
                        latest.status = pod.status.clone();
                        candidate = latest;
                    }
                    None => return Ok(()),
                }
            }
            Err(e) => return Err(e),
        }
    }

    warn!(namespace = %namespace, name = %name, "Dropping status update after repeated conflicts");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateRunning, ContainerStatus, PodSpec,
    };
    use kube::api::ObjectMeta;

    fn pod_with(restart_policy: Option<&str>, phase: Option<&str>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                restart_policy: restart_policy.map(str::to_string),
                ..Default::default()
            }),
            status: Some(PodStatus {
                phase: phase.map(str::to_string),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn provider_failure_phase_follows_restart_policy() {
        let status = provider_failed_status(&pod_with(Some("Never"), None), "quota");
        assert_eq!(status.phase.as_deref(), Some("Failed"));
        assert_eq!(status.reason.as_deref(), Some(REASON_PROVIDER_FAILED));
        assert_eq!(status.message.as_deref(), Some("quota"));

        let status = provider_failed_status(&pod_with(Some("OnFailure"), None), "quota");
        assert_eq!(status.phase.as_deref(), Some("Pending"));
        let status = provider_failed_status(&pod_with(None, None), "quota");
        assert_eq!(status.phase.as_deref(), Some("Pending"));
    }

    #[test]
    fn lost_pods_wait_for_the_grace_period() {
        let now = Utc::now();
        let mut pod = pod_with(None, Some("Pending"));
        pod.metadata.creation_timestamp = Some(Time(now - ChronoDuration::seconds(30)));
        assert!(!should_declare_lost(&pod, now));

        pod.metadata.creation_timestamp = Some(Time(now - ChronoDuration::seconds(61)));
        assert!(should_declare_lost(&pod, now));

        let mut running = pod_with(None, Some("Running"));
        running.metadata.creation_timestamp = Some(Time(now));
        assert!(should_declare_lost(&running, now));
    }

    #[test]
    fn lost_status_terminates_running_containers() {
        let now = Utc::now();
        let started = Time(now - ChronoDuration::minutes(5));
        let mut pod = pod_with(None, Some("Running"));
        pod.status.as_mut().unwrap().container_statuses = Some(vec![ContainerStatus {
            name: "app".to_string(),
            container_id: Some("mock://app".to_string()),
            ready: true,
            state: Some(ContainerState {
                running: Some(ContainerStateRunning {
                    started_at: Some(started.clone()),
                }),
                ..Default::default()
            }),
            ..Default::default()
        }]);

        let status = provider_lost_status(&pod, now);
        assert_eq!(status.phase.as_deref(), Some("Failed"));
        assert_eq!(status.reason.as_deref(), Some(REASON_NOT_FOUND));

        let cs = &status.container_statuses.unwrap()[0];
        let state = cs.state.as_ref().unwrap();
        assert!(state.running.is_none());
        let terminated = state.terminated.as_ref().unwrap();
        assert_eq!(terminated.exit_code, LOST_CONTAINER_EXIT_CODE);
        assert_eq!(terminated.started_at, Some(started));
        assert_eq!(terminated.container_id.as_deref(), Some("mock://app"));
        assert_eq!(terminated.finished_at, Some(Time(now)));
    }
}
