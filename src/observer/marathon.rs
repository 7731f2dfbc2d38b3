//! Marathon orchestrator
//!
//! Services are declared through app labels:
//!
//! ```text
//! F5_PARTITION=mesos
//! F5_0_BIND_ADDR=10.128.10.240
//! F5_0_PORT=80
//! F5_0_MODE=http
//! F5_0_BALANCE=least-connections-member
//! F5_0_SSL_PROFILE=Common/clientssl
//! F5_0_HOST=shop.example.com
//! F5_0_PATH=/cart
//! ```
//!
//! Every port index with a bind address becomes one service, identified by
//! `<appId>_<bindAddr>_<port>`.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, error, warn};

use super::Orchestrator;
use crate::error::{Error, Result};
use crate::model::{
    Endpoint, Frontend, HealthCheck, HealthProtocol, Mode, RouteRule, Service, DEFAULT_LB_METHOD,
};

#[derive(Clone, Debug)]
pub struct MarathonSettings {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct AppsResponse {
    apps: Vec<App>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct App {
    id: String,
    #[serde(default)]
    labels: BTreeMap<String, String>,
    #[serde(default)]
    health_checks: Vec<AppHealthCheck>,
    #[serde(default)]
    tasks: Vec<Task>,
    #[serde(default)]
    port_definitions: Vec<PortDefinition>,
    #[serde(default)]
    ports: Vec<u16>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AppHealthCheck {
    #[serde(default = "default_health_protocol")]
    protocol: String,
    path: Option<String>,
    port_index: Option<usize>,
    #[serde(default = "default_interval")]
    interval_seconds: u32,
    #[serde(default = "default_timeout")]
    timeout_seconds: u32,
    #[serde(default = "default_max_failures")]
    max_consecutive_failures: u32,
}

// Marathon's own defaults for omitted health check fields
fn default_health_protocol() -> String {
    "HTTP".to_string()
}

fn default_interval() -> u32 {
    60
}

fn default_timeout() -> u32 {
    20
}

fn default_max_failures() -> u32 {
    3
}

#[derive(Debug, Deserialize)]
struct PortDefinition {
    port: u16,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Task {
    host: String,
    #[serde(default)]
    ports: Vec<u16>,
    #[serde(default)]
    health_check_results: Vec<HealthCheckResult>,
}

#[derive(Debug, Deserialize)]
struct HealthCheckResult {
    alive: bool,
}

/// A task endpoint before its host is resolved
#[derive(Debug, Clone, PartialEq, Eq)]
struct Target {
    host: String,
    port: u16,
    healthy: bool,
}

/// Service parsed from labels, endpoints still unresolved
#[derive(Debug)]
struct Draft {
    service: Service,
    targets: Vec<Target>,
}

pub struct MarathonOrchestrator {
    http_client: Client,
    base_url: String,
    username: Option<String>,
    password: Option<String>,
}

impl MarathonOrchestrator {
    pub fn new(settings: &MarathonSettings) -> Result<Self> {
        let http_client = Client::builder().timeout(settings.timeout).build()?;
        Ok(Self {
            http_client,
            base_url: settings.url.trim_end_matches('/').to_string(),
            username: settings.username.clone(),
            password: settings.password.clone(),
        })
    }

    async fn fetch_apps(&self) -> Result<Vec<App>> {
        let url = format!("{}/v2/apps?embed=apps.tasks", self.base_url);
        debug!("Fetching Marathon apps from {}", url);

        let mut request = self.http_client.get(&url);
        if let Some(username) = &self.username {
            request = request.basic_auth(username, self.password.as_ref());
        }
        let response = request
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::ObservationFailure(format!("GET {url}: {e}")))?;
        let body = response
            .text()
            .await
            .map_err(|e| Error::ObservationFailure(format!("reading {url}: {e}")))?;
        let apps: AppsResponse = serde_json::from_str(&body)
            .map_err(|e| Error::MalformedTopology(format!("Marathon apps: {e}")))?;
        Ok(apps.apps)
    }
}

#[async_trait]
impl Orchestrator for MarathonOrchestrator {
    fn name(&self) -> &'static str {
        "marathon"
    }

    async fn fetch_services(&self) -> Result<Vec<Service>> {
        let apps = self.fetch_apps().await?;
        let drafts: Vec<Draft> = apps.iter().flat_map(drafts_from_app).collect();

        let mut resolved: HashMap<String, Option<IpAddr>> = HashMap::new();
        let mut services = Vec::with_capacity(drafts.len());
        for draft in drafts {
            let mut service = draft.service;
            for target in draft.targets {
                let address = match resolved.get(&target.host) {
                    Some(address) => *address,
                    None => {
                        let address = resolve_host(&target.host).await;
                        resolved.insert(target.host.clone(), address);
                        address
                    }
                };
                match address {
                    Some(address) => service.endpoints.push(Endpoint {
                        address,
                        port: target.port,
                        weight: 1,
                        healthy: target.healthy,
                    }),
                    None => warn!(
                        "Skipping task on unresolvable host {} for service {}",
                        target.host, service.id
                    ),
                }
            }
            services.push(service);
        }
        Ok(services)
    }
}

async fn resolve_host(host: &str) -> Option<IpAddr> {
    if let Ok(address) = host.parse::<IpAddr>() {
        return Some(address);
    }
    match tokio::net::lookup_host((host, 0)).await {
        Ok(addrs) => {
            let addrs: Vec<IpAddr> = addrs.map(|a| a.ip()).collect();
            addrs
                .iter()
                .find(|a| a.is_ipv4())
                .or_else(|| addrs.first())
                .copied()
        }
        Err(e) => {
            debug!("Resolving {} failed: {}", host, e);
            None
        }
    }
}

/// Port indexes that carry at least one `F5_<i>_*` label
fn label_indexes(labels: &BTreeMap<String, String>) -> BTreeSet<usize> {
    labels
        .keys()
        .filter_map(|key| {
            let rest = key.strip_prefix("F5_")?;
            let (index, _) = rest.split_once('_')?;
            index.parse().ok()
        })
        .collect()
}

fn drafts_from_app(app: &App) -> Vec<Draft> {
    let Some(partition) = app.labels.get("F5_PARTITION") else {
        debug!("App {} has no F5_PARTITION label", app.id);
        return Vec::new();
    };

    label_indexes(&app.labels)
        .into_iter()
        .filter_map(|index| draft_for_index(app, partition, index))
        .collect()
}

fn draft_for_index(app: &App, partition: &str, index: usize) -> Option<Draft> {
    let label = |field: &str| app.labels.get(&format!("F5_{index}_{field}"));
    let invalid = |field: &str, value: &str| {
        error!(
            "Application label F5_{}_{} for {} contains an invalid value ({})",
            index, field, app.id, value
        );
    };

    let Some(bind) = label("BIND_ADDR") else {
        debug!("App {} port index {} has no bind address", app.id, index);
        return None;
    };
    let Ok(bind_addr) = bind.parse::<IpAddr>() else {
        invalid("BIND_ADDR", bind);
        return None;
    };

    let port = match label("PORT") {
        Some(raw) => match raw.parse::<u16>() {
            Ok(port) if port > 0 => port,
            _ => {
                invalid("PORT", raw);
                return None;
            }
        },
        None => {
            let port = app
                .port_definitions
                .get(index)
                .map(|d| d.port)
                .or_else(|| app.ports.get(index).copied())
                .unwrap_or(0);
            if port == 0 {
                invalid("PORT", "<unset>");
                return None;
            }
            port
        }
    };

    let mode = match label("MODE") {
        Some(raw) => match Mode::parse(raw) {
            Some(mode) => mode,
            None => {
                invalid("MODE", raw);
                return None;
            }
        },
        None => Mode::Tcp,
    };

    let balance = label("BALANCE")
        .cloned()
        .unwrap_or_else(|| DEFAULT_LB_METHOD.to_string());

    let host = label("HOST").cloned();
    let path_prefix = label("PATH").cloned();
    let routes = if host.is_some() || path_prefix.is_some() {
        vec![RouteRule { host, path_prefix }]
    } else {
        Vec::new()
    };

    let health_checks = app
        .health_checks
        .iter()
        .filter(|hc| hc.port_index.unwrap_or(0) == index)
        .filter_map(|hc| {
            let protocol = hc.protocol.trim_start_matches("MESOS_");
            match HealthProtocol::parse(protocol) {
                Some(protocol) => Some(HealthCheck {
                    protocol,
                    path: hc.path.clone(),
                    interval_secs: hc.interval_seconds,
                    timeout_secs: hc.timeout_seconds,
                    max_consecutive_failures: hc.max_consecutive_failures,
                }),
                None => {
                    warn!(
                        "Ignoring {} health check of app {}: protocol not supported",
                        hc.protocol, app.id
                    );
                    None
                }
            }
        })
        .collect();

    let targets = app
        .tasks
        .iter()
        .filter_map(|task| {
            let port = *task.ports.get(index)?;
            let healthy = app.health_checks.is_empty()
                || (!task.health_check_results.is_empty()
                    && task.health_check_results.iter().all(|r| r.alive));
            Some(Target {
                host: task.host.clone(),
                port,
                healthy,
            })
        })
        .collect();

    Some(Draft {
        service: Service {
            id: format!("{}_{}_{}", app.id.trim_start_matches('/'), bind_addr, port),
            partition: partition.to_string(),
            frontend: Frontend {
                bind_addr,
                port,
                mode,
                balance,
                ssl_profile: label("SSL_PROFILE").cloned(),
            },
            endpoints: Vec::new(),
            health_checks,
            routes,
        },
        targets,
    })
}
