//! Adapters between the engine and the control plane

pub mod control_plane;
pub mod events;
pub mod node_builder;

pub use control_plane::{ControlPlane, KubeControlPlane};
pub use events::{EventRecorder, EventType};
