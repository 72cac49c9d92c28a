//! Prometheus metrics for the virtual kubelet
//!
//! Exposes counters for the sync loops plus `/metrics`, `/healthz` and `/readyz`.

pub mod prometheus;

pub use prometheus::*;
