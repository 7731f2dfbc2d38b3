//! Response bodies of the REST API

use serde::Serialize;

use crate::controller::{CycleSummary, ObjectStatus};

/// Liveness response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadyResponse {
    pub ready: bool,
    pub last_cycle: Option<u64>,
    pub reason: Option<String>,
}

/// Last cycle and per-object phases
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub healthy: bool,
    pub ready: bool,
    pub last_cycle: Option<CycleSummary>,
    pub objects: Vec<ObjectStatus>,
    pub total_objects: usize,
}
