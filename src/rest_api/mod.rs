//! REST API module
//!
//! Exposes liveness, readiness, Prometheus metrics and the status of the
//! last reconciliation cycle.

mod dto;
mod handlers;
mod server;

pub use server::{router, run_server};
