//! bigip-ctlr: keeps BIG-IP virtual servers, pools and health monitors in
//! sync with the services running on Marathon or Kubernetes.
//!
//! The controller observes the orchestrator, translates the topology into
//! declarative BIG-IP objects, diffs them against what it last applied and
//! executes the difference in dependency order.

pub mod bigip;
pub mod config;
pub mod controller;
pub mod error;
pub mod model;
pub mod observer;
pub mod store;

#[cfg(feature = "rest-api")]
pub mod rest_api;

#[cfg(test)]
pub(crate) mod testing;

pub use crate::error::{Error, Result};
