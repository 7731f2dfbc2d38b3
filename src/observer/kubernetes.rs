//! Kubernetes orchestrator
//!
//! Virtual servers are declared by ConfigMaps labelled
//! `f5type=virtual-server` whose `data` key holds a JSON document:
//!
//! ```json
//! {"virtualServer": {
//!   "backend": {"serviceName": "web", "servicePort": 80, "healthMonitors": []},
//!   "frontend": {"partition": "k8s", "mode": "http", "balance": "round-robin",
//!                "virtualAddress": {"bindAddr": "10.128.10.240", "port": 80}}
//! }}
//! ```
//!
//! Pool members come from the Endpoints object of the referenced Service.

use std::net::IpAddr;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Endpoints, Service as KubeService};
use kube::api::{Api, ListParams};
use kube::{Client, ResourceExt};
use serde::Deserialize;
use tracing::{debug, error, warn};

use super::Orchestrator;
use crate::error::{Error, Result};
use crate::model::{
    Endpoint, Frontend, HealthCheck, HealthProtocol, Mode, RouteRule, Service, DEFAULT_LB_METHOD,
};

pub const VIRTUAL_SERVER_SELECTOR: &str = "f5type=virtual-server";
const DATA_KEY: &str = "data";

#[derive(Clone, Debug, Default)]
pub struct KubernetesSettings {
    /// Only watch this namespace; all namespaces when unset
    pub namespace: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VirtualServerDocument {
    virtual_server: VirtualServerConfig,
}

#[derive(Debug, Deserialize)]
struct VirtualServerConfig {
    backend: BackendConfig,
    frontend: FrontendConfig,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BackendConfig {
    service_name: String,
    service_port: u16,
    #[serde(default)]
    health_monitors: Vec<HealthMonitorConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HealthMonitorConfig {
    protocol: String,
    path: Option<String>,
    #[serde(default = "default_interval")]
    interval: u32,
    #[serde(default = "default_timeout")]
    timeout: u32,
}

fn default_interval() -> u32 {
    5
}

fn default_timeout() -> u32 {
    15
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FrontendConfig {
    partition: String,
    #[serde(default = "default_mode")]
    mode: String,
    #[serde(default = "default_balance")]
    balance: String,
    virtual_address: Option<VirtualAddress>,
    ssl_profile: Option<SslProfile>,
    #[serde(default)]
    routes: Vec<RouteConfig>,
}

fn default_mode() -> String {
    "tcp".to_string()
}

fn default_balance() -> String {
    DEFAULT_LB_METHOD.to_string()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VirtualAddress {
    bind_addr: String,
    port: u16,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SslProfile {
    f5_profile_name: String,
}

#[derive(Debug, Deserialize)]
struct RouteConfig {
    host: Option<String>,
    path: Option<String>,
}

pub struct KubernetesOrchestrator {
    client: Client,
    namespace: Option<String>,
}

impl KubernetesOrchestrator {
    /// Connect using the in-cluster or kubeconfig credentials
    pub async fn connect(settings: &KubernetesSettings) -> Result<Self> {
        let client = Client::try_default().await?;
        Ok(Self::with_client(client, settings))
    }

    pub fn with_client(client: Client, settings: &KubernetesSettings) -> Self {
        Self {
            client,
            namespace: settings.namespace.clone(),
        }
    }

    fn config_maps(&self) -> Api<ConfigMap> {
        match &self.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }
}

#[async_trait]
impl Orchestrator for KubernetesOrchestrator {
    fn name(&self) -> &'static str {
        "kubernetes"
    }

    async fn fetch_services(&self) -> Result<Vec<Service>> {
        let lp = ListParams::default().labels(VIRTUAL_SERVER_SELECTOR);
        let config_maps = self.config_maps().list(&lp).await?;
        debug!("Found {} virtual server ConfigMaps", config_maps.items.len());

        let mut services = Vec::new();
        for cm in &config_maps.items {
            let namespace = cm.namespace().unwrap_or_else(|| "default".to_string());
            let name = cm.name_any();
            let Some(data) = cm.data.as_ref().and_then(|d| d.get(DATA_KEY)) else {
                warn!("ConfigMap {}/{} has no '{}' key", namespace, name, DATA_KEY);
                continue;
            };
            let document = parse_document(&namespace, &name, data)?;

            let service_name = &document.virtual_server.backend.service_name;
            let kube_services: Api<KubeService> = Api::namespaced(self.client.clone(), &namespace);
            let endpoints: Api<Endpoints> = Api::namespaced(self.client.clone(), &namespace);
            let kube_service = kube_services.get_opt(service_name).await?;
            let endpoints = endpoints.get_opt(service_name).await?;

            if let Some(service) = service_from_document(
                &namespace,
                &name,
                document,
                kube_service.as_ref(),
                endpoints.as_ref(),
            ) {
                services.push(service);
            }
        }
        Ok(services)
    }
}

fn parse_document(namespace: &str, name: &str, data: &str) -> Result<VirtualServerDocument> {
    serde_json::from_str(data).map_err(|e| {
        Error::MalformedTopology(format!("ConfigMap {namespace}/{name}: {e}"))
    })
}

/// Build a service from a virtual server document and the cluster objects
/// it refers to. Returns `None` for documents without a virtual address or
/// with invalid frontend values.
fn service_from_document(
    namespace: &str,
    name: &str,
    document: VirtualServerDocument,
    kube_service: Option<&KubeService>,
    endpoints: Option<&Endpoints>,
) -> Option<Service> {
    let VirtualServerConfig { backend, frontend } = document.virtual_server;

    let Some(address) = frontend.virtual_address else {
        debug!("ConfigMap {}/{} has no virtual address", namespace, name);
        return None;
    };
    let Ok(bind_addr) = address.bind_addr.parse::<IpAddr>() else {
        error!(
            "ConfigMap {}/{} has invalid bind address {}",
            namespace, name, address.bind_addr
        );
        return None;
    };
    let Some(mode) = Mode::parse(&frontend.mode) else {
        error!(
            "ConfigMap {}/{} has invalid mode {}",
            namespace, name, frontend.mode
        );
        return None;
    };

    let health_checks = backend
        .health_monitors
        .iter()
        .filter_map(|hm| match HealthProtocol::parse(&hm.protocol) {
            Some(protocol) => Some(HealthCheck {
                protocol,
                path: hm.path.clone(),
                interval_secs: hm.interval,
                // one failure budget: the device timeout becomes timeout + 1
                timeout_secs: hm.timeout,
                max_consecutive_failures: 1,
            }),
            None => {
                warn!(
                    "Ignoring {} health monitor in ConfigMap {}/{}",
                    hm.protocol, namespace, name
                );
                None
            }
        })
        .collect();

    let routes = frontend
        .routes
        .into_iter()
        .map(|r| RouteRule {
            host: r.host,
            path_prefix: r.path,
        })
        .collect();

    Some(Service {
        id: format!(
            "{}_{}_{}",
            backend.service_name.trim_matches('/'),
            address.bind_addr,
            address.port
        ),
        partition: frontend.partition,
        frontend: Frontend {
            bind_addr,
            port: address.port,
            mode,
            balance: frontend.balance,
            ssl_profile: frontend.ssl_profile.map(|p| p.f5_profile_name),
        },
        endpoints: pool_endpoints(backend.service_port, kube_service, endpoints),
        health_checks,
        routes,
    })
}

/// Ready addresses become healthy members, not-ready ones unhealthy members
fn pool_endpoints(
    service_port: u16,
    kube_service: Option<&KubeService>,
    endpoints: Option<&Endpoints>,
) -> Vec<Endpoint> {
    let Some(endpoints) = endpoints else {
        return Vec::new();
    };
    // Endpoint ports are matched by the name of the Service port
    let port_name = kube_service
        .and_then(|s| s.spec.as_ref())
        .and_then(|spec| spec.ports.as_ref())
        .and_then(|ports| ports.iter().find(|p| p.port == i32::from(service_port)))
        .and_then(|p| p.name.clone());

    let mut members = Vec::new();
    for subset in endpoints.subsets.iter().flatten() {
        let ports = subset.ports.as_deref().unwrap_or_default();
        let port = match &port_name {
            Some(wanted) => ports.iter().find(|p| p.name.as_ref() == Some(wanted)),
            None if ports.len() == 1 => ports.first(),
            None => None,
        };
        let Some(port) = port.and_then(|p| u16::try_from(p.port).ok()) else {
            continue;
        };

        let ready = subset.addresses.iter().flatten().map(|a| (a, true));
        let not_ready = subset.not_ready_addresses.iter().flatten().map(|a| (a, false));
        for (address, healthy) in ready.chain(not_ready) {
            match address.ip.parse::<IpAddr>() {
                Ok(ip) => members.push(Endpoint {
                    address: ip,
                    port,
                    weight: 1,
                    healthy,
                }),
                Err(_) => warn!("Skipping endpoint with invalid address {}", address.ip),
            }
        }
    }
    members
}
