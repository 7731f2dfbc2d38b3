//! Normalized view of the orchestrator's application topology
//!
//! A [`TopologySnapshot`] is produced once per observation and never mutated
//! afterwards. Both the Marathon and the Kubernetes observers normalize into
//! these types, so everything downstream of the observer is orchestrator
//! agnostic.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Load balancing methods accepted by BIG-IP pools
pub const LB_METHODS: &[&str] = &[
    "dynamic-ratio-member",
    "least-connections-member",
    "observed-node",
    "ratio-least-connections-node",
    "round-robin",
    "dynamic-ratio-node",
    "least-connections-node",
    "predictive-member",
    "ratio-member",
    "weighted-least-connections-member",
    "fastest-app-response",
    "least-sessions",
    "predictive-node",
    "ratio-node",
    "weighted-least-connections-node",
    "fastest-node",
    "observed-member",
    "ratio-least-connections-member",
    "ratio-session",
];

pub const DEFAULT_LB_METHOD: &str = "round-robin";

/// Frontend protocol mode of a service
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Tcp,
    Http,
    Udp,
}

impl Mode {
    /// Parse a mode label case-insensitively
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "tcp" => Some(Mode::Tcp),
            "http" => Some(Mode::Http),
            "udp" => Some(Mode::Udp),
            _ => None,
        }
    }

    /// IP protocol used on the virtual server (`http` rides on tcp)
    pub fn ip_protocol(&self) -> &'static str {
        match self {
            Mode::Tcp | Mode::Http => "tcp",
            Mode::Udp => "udp",
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Tcp => write!(f, "tcp"),
            Mode::Http => write!(f, "http"),
            Mode::Udp => write!(f, "udp"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthProtocol {
    Http,
    Tcp,
}

impl HealthProtocol {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "http" => Some(HealthProtocol::Http),
            "tcp" => Some(HealthProtocol::Tcp),
            _ => None,
        }
    }
}

/// Where and how a service is exposed on the traffic manager
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Frontend {
    pub bind_addr: IpAddr,
    pub port: u16,
    pub mode: Mode,
    /// BIG-IP load balancing method, one of [`LB_METHODS`]
    pub balance: String,
    /// `Partition/name` of a client SSL profile; presence means TLS is required
    pub ssl_profile: Option<String>,
}

/// A single backend instance
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub address: IpAddr,
    pub port: u16,
    pub weight: u32,
    pub healthy: bool,
}

impl Endpoint {
    pub fn healthy(address: IpAddr, port: u16) -> Self {
        Self {
            address,
            port,
            weight: 1,
            healthy: true,
        }
    }

    /// `address:port`, the BIG-IP pool member name
    pub fn member_name(&self) -> String {
        match self.address {
            IpAddr::V4(v4) => format!("{}:{}", v4, self.port),
            // BIG-IP separates the port of IPv6 members with a dot
            IpAddr::V6(v6) => format!("{}.{}", v6, self.port),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheck {
    pub protocol: HealthProtocol,
    pub path: Option<String>,
    pub interval_secs: u32,
    pub timeout_secs: u32,
    pub max_consecutive_failures: u32,
}

/// Host/path routing rule; an empty rule matches everything
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteRule {
    pub host: Option<String>,
    pub path_prefix: Option<String>,
}

/// One routable service as reported by the orchestrator
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    /// Stable identity; declarative object names derive from it
    pub id: String,
    pub partition: String,
    pub frontend: Frontend,
    pub endpoints: Vec<Endpoint>,
    pub health_checks: Vec<HealthCheck>,
    pub routes: Vec<RouteRule>,
}

impl Service {
    pub fn healthy_endpoints(&self) -> impl Iterator<Item = &Endpoint> {
        self.endpoints.iter().filter(|e| e.healthy)
    }

    /// Sort endpoints and drop repeated `address:port` pairs.
    ///
    /// The first occurrence wins, except that a healthy duplicate replaces an
    /// unhealthy one.
    pub fn normalize(&mut self) {
        let mut by_member: BTreeMap<(IpAddr, u16), Endpoint> = BTreeMap::new();
        for endpoint in self.endpoints.drain(..) {
            let key = (endpoint.address, endpoint.port);
            match by_member.get(&key) {
                Some(existing) if existing.healthy || !endpoint.healthy => {}
                _ => {
                    by_member.insert(key, endpoint);
                }
            }
        }
        self.endpoints = by_member.into_values().collect();
    }

    /// Check the frontend values the way the labels are validated
    ///
    /// Returns one message per invalid field.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.frontend.port == 0 {
            problems.push(format!(
                "service {} has invalid port {}",
                self.id, self.frontend.port
            ));
        }
        if !LB_METHODS.contains(&self.frontend.balance.as_str()) {
            problems.push(format!(
                "service {} has invalid balance {}",
                self.id, self.frontend.balance
            ));
        }
        if self.partition.is_empty() {
            problems.push(format!("service {} has no partition", self.id));
        }
        problems
    }
}

/// Set of BIG-IP partitions this controller is responsible for
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionFilter {
    partitions: BTreeSet<String>,
}

impl PartitionFilter {
    pub fn new<I, S>(partitions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            partitions: partitions.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_wildcard(&self) -> bool {
        self.partitions.contains("*")
    }

    /// Whether a service in `partition` should be managed
    pub fn manages(&self, partition: &str) -> bool {
        if partition.is_empty() {
            return false;
        }
        self.is_wildcard() || self.partitions.contains(partition)
    }

    /// Explicit partition names (empty when only the wildcard is configured)
    pub fn explicit(&self) -> impl Iterator<Item = &String> {
        self.partitions.iter().filter(|p| p.as_str() != "*")
    }
}

/// Immutable application topology at one logical instant
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopologySnapshot {
    pub revision: u64,
    pub observed_at: DateTime<Utc>,
    services: BTreeMap<String, Service>,
}

impl TopologySnapshot {
    /// Build a snapshot from already-normalized services.
    ///
    /// Ids are expected to be unique; the observer drops repeats before
    /// building a snapshot.
    pub fn new(revision: u64, services: impl IntoIterator<Item = Service>) -> Self {
        Self {
            revision,
            observed_at: Utc::now(),
            services: services.into_iter().map(|s| (s.id.clone(), s)).collect(),
        }
    }

    pub fn services(&self) -> impl Iterator<Item = &Service> {
        self.services.values()
    }

    pub fn service(&self, id: &str) -> Option<&Service> {
        self.services.get(id)
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}
