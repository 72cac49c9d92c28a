//! Reconciliation logic shared by the controllers

pub mod env;
pub mod pod;
