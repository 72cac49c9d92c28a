//! Write-through event sink
//!
//! Each recorded event becomes one core/v1 Event posted against the pod.
//! Failures are logged and dropped.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use k8s_openapi::api::core::v1::{Event, EventSource, ObjectReference, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::ResourceExt;
use tracing::{debug, warn};

use crate::adapters::control_plane::ControlPlane;

pub const COMPONENT: &str = "virtual-kubelet";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Normal => f.write_str("Normal"),
            EventType::Warning => f.write_str("Warning"),
        }
    }
}

/// Records pod events on behalf of the node
#[derive(Clone)]
pub struct EventRecorder {
    control_plane: Arc<dyn ControlPlane>,
    node_name: String,
}

impl EventRecorder {
    pub fn new(control_plane: Arc<dyn ControlPlane>, node_name: impl Into<String>) -> Self {
        Self {
            control_plane,
            node_name: node_name.into(),
        }
    }

    pub async fn record(&self, pod: &Pod, type_: EventType, reason: &str, message: impl Into<String>) {
        let event = self.build(pod, type_, reason, message.into());
        debug!(
            pod = %pod.name_any(),
            reason,
            "Recording {} event",
            type_
        );
        if let Err(e) = self.control_plane.create_event(&event).await {
            warn!(pod = %pod.name_any(), reason, error = %e, "Failed to record event");
        }
    }

    pub async fn normal(&self, pod: &Pod, reason: &str, message: impl Into<String>) {
        self.record(pod, EventType::Normal, reason, message).await
    }

    pub async fn warning(&self, pod: &Pod, reason: &str, message: impl Into<String>) {
        self.record(pod, EventType::Warning, reason, message).await
    }

    fn build(&self, pod: &Pod, type_: EventType, reason: &str, message: String) -> Event {
        let now = Utc::now();
        let namespace = pod.namespace().unwrap_or_else(|| "default".to_string());
        let nanos = now.timestamp_nanos_opt().unwrap_or_default();
        Event {
            metadata: ObjectMeta {
                name: Some(format!("{}.{:x}", pod.name_any(), nanos)),
                namespace: Some(namespace.clone()),
                ..Default::default()
            },
            involved_object: ObjectReference {
                api_version: Some("v1".to_string()),
                kind: Some("Pod".to_string()),
                name: Some(pod.name_any()),
                namespace: Some(namespace),
                uid: pod.uid(),
                resource_version: pod.resource_version(),
                ..Default::default()
            },
            reason: Some(reason.to_string()),
            message: Some(message),
            type_: Some(type_.to_string()),
            count: Some(1),
            first_timestamp: Some(Time(now)),
            last_timestamp: Some(Time(now)),
            source: Some(EventSource {
                component: Some(COMPONENT.to_string()),
                host: Some(self.node_name.clone()),
            }),
            reporting_component: Some(COMPONENT.to_string()),
            reporting_instance: Some(self.node_name.clone()),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::InMemoryControlPlane;

    fn pod() -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                namespace: Some("default".to_string()),
                uid: Some("uid-1".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn events_reference_the_pod() {
        let cp = Arc::new(InMemoryControlPlane::new());
        let recorder = EventRecorder::new(cp.clone(), "vk");
        recorder.warning(&pod(), "ProviderFailed", "boom").await;

        let events = cp.events();
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.reason.as_deref(), Some("ProviderFailed"));
        assert_eq!(event.type_.as_deref(), Some("Warning"));
        assert_eq!(event.involved_object.uid.as_deref(), Some("uid-1"));
        assert_eq!(event.metadata.namespace.as_deref(), Some("default"));
    }
}
