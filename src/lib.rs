//! Virtual kubelet
//!
//! Registers a virtual node with the cluster and reconciles the pods bound
//! to it against a pluggable provider backend.

pub mod adapters;
pub mod config;
pub mod controllers;
pub mod engine;
pub mod error;
pub mod manager;
pub mod metrics;
pub mod provider;
pub mod queue;
pub mod reconcilers;
pub mod server;
#[doc(hidden)]
pub mod test_support;

pub use error::{Error, Result};
