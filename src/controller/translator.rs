//! Topology snapshot to BIG-IP object translation
//!
//! [`translate`] is pure and deterministic: the same snapshot always yields
//! the same [`DesiredConfig`], which is what lets the diff engine compare
//! bodies structurally.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::model::{
    full_path, DesiredConfig, HealthCheck, HealthProtocol, MemberBody, Mode, MonitorBody,
    ObjectBody, ObjectKey, ObjectKind, PartitionFilter, PolicyBody, PolicyRule, PoolBody,
    ProfileRef, Service, TopologySnapshot, VirtualServerBody,
};

/// Knobs that change how a snapshot maps to objects
#[derive(Clone, Debug)]
pub struct TranslateOptions {
    pub partitions: PartitionFilter,
    /// Remove the whole route of a service with no healthy endpoints instead
    /// of keeping an empty pool
    pub drain_on_empty: bool,
}

impl Default for TranslateOptions {
    fn default() -> Self {
        Self {
            partitions: PartitionFilter::new(["*"]),
            drain_on_empty: false,
        }
    }
}

/// Object name derived from a service id
pub fn object_name(service_id: &str) -> String {
    service_id.trim_start_matches('/').replace('/', "_")
}

/// Monitor name for the `index`-th health check of a service.
///
/// BIG-IP monitor names share one namespace per partition across monitor
/// types, so the protocol is part of the name: a check that switches from
/// HTTP to TCP gets a new monitor instead of colliding with the old one.
pub fn monitor_name(object_name: &str, protocol: HealthProtocol, index: usize) -> String {
    let protocol = match protocol {
        HealthProtocol::Http => "http",
        HealthProtocol::Tcp => "tcp",
    };
    if index == 0 {
        format!("{object_name}_{protocol}")
    } else {
        format!("{object_name}_{protocol}_{index}")
    }
}

/// BIG-IP monitor timeout matching the orchestrator's failure budget
///
/// `(maxConsecutiveFailures - 1) * interval + timeout + 1`
pub fn monitor_timeout(check: &HealthCheck) -> u32 {
    check
        .max_consecutive_failures
        .saturating_sub(1)
        .saturating_mul(check.interval_secs)
        .saturating_add(check.timeout_secs)
        .saturating_add(1)
}

/// Request line sent by HTTP monitors; escapes are interpreted by BIG-IP
pub fn monitor_send_string(check: &HealthCheck) -> Option<String> {
    match check.protocol {
        HealthProtocol::Http => {
            let path = check.path.as_deref().unwrap_or("/");
            Some(format!("GET {path} HTTP/1.0\\r\\n\\r\\n"))
        }
        HealthProtocol::Tcp => None,
    }
}

/// Translate a snapshot into the full set of desired objects
pub fn translate(snapshot: &TopologySnapshot, options: &TranslateOptions) -> Result<DesiredConfig> {
    let mut desired = DesiredConfig::new();

    for service in snapshot.services() {
        check_service(service)?;

        if !options.partitions.manages(&service.partition) {
            debug!(
                "Skipping service {} in unmanaged partition '{}'",
                service.id, service.partition
            );
            continue;
        }

        if options.drain_on_empty && service.healthy_endpoints().next().is_none() {
            debug!(
                "Service {} has no healthy endpoints, draining its route",
                service.id
            );
            continue;
        }

        for (key, body) in translate_service(service) {
            if desired.insert(key.clone(), body).is_some() {
                return Err(Error::TranslationFailure(format!(
                    "object {key} is produced by more than one service"
                )));
            }
        }
    }

    Ok(desired)
}

fn check_service(service: &Service) -> Result<()> {
    let mut seen = BTreeSet::new();
    for endpoint in &service.endpoints {
        if !seen.insert((endpoint.address, endpoint.port)) {
            return Err(Error::TranslationFailure(format!(
                "service {} lists endpoint {} more than once",
                service.id,
                endpoint.member_name()
            )));
        }
    }
    if object_name(&service.id).is_empty() {
        return Err(Error::TranslationFailure(format!(
            "service id '{}' does not yield an object name",
            service.id
        )));
    }
    Ok(())
}

fn translate_service(service: &Service) -> Vec<(ObjectKey, ObjectBody)> {
    let name = object_name(&service.id);
    let partition = service.partition.as_str();
    let pool_path = full_path(partition, &name);
    let mut objects = Vec::new();

    let mut monitors = Vec::new();
    for (index, check) in service.health_checks.iter().enumerate() {
        let monitor_name = monitor_name(&name, check.protocol, index);
        let kind = match check.protocol {
            HealthProtocol::Http => ObjectKind::HttpMonitor,
            HealthProtocol::Tcp => ObjectKind::TcpMonitor,
        };
        monitors.push((kind, full_path(partition, &monitor_name)));
        objects.push((
            ObjectKey::new(kind, partition, monitor_name),
            ObjectBody::Monitor(MonitorBody {
                interval: check.interval_secs,
                timeout: monitor_timeout(check),
                send: monitor_send_string(check),
            }),
        ));
    }

    let members: BTreeMap<String, MemberBody> = service
        .healthy_endpoints()
        .map(|e| (e.member_name(), MemberBody { ratio: e.weight }))
        .collect();
    objects.push((
        ObjectKey::new(ObjectKind::Pool, partition, name.clone()),
        ObjectBody::Pool(PoolBody {
            load_balancing_mode: service.frontend.balance.clone(),
            monitors,
            members,
        }),
    ));

    let mut policies = Vec::new();
    if !service.routes.is_empty() {
        let rules = service
            .routes
            .iter()
            .enumerate()
            .map(|(index, route)| PolicyRule {
                name: format!("rule_{index}"),
                host: route.host.clone(),
                path_prefix: route.path_prefix.clone(),
                pool: pool_path.clone(),
            })
            .collect();
        policies.push(full_path(partition, &name));
        objects.push((
            ObjectKey::new(ObjectKind::Policy, partition, name.clone()),
            ObjectBody::Policy(PolicyBody { rules }),
        ));
    }

    let frontend = &service.frontend;
    let mut profiles = Vec::new();
    if let Some(ssl) = &frontend.ssl_profile {
        match ssl.split('/').collect::<Vec<_>>().as_slice() {
            [profile_partition, profile_name]
                if !profile_partition.is_empty() && !profile_name.is_empty() =>
            {
                profiles.push(ProfileRef {
                    partition: profile_partition.to_string(),
                    name: profile_name.to_string(),
                });
            }
            _ => warn!(
                "Could not parse partition and name from SSL profile '{}' of service {}",
                ssl, service.id
            ),
        }
    }
    match frontend.mode {
        Mode::Http => profiles.push(ProfileRef::common("http")),
        Mode::Tcp => profiles.push(ProfileRef::common("tcp")),
        Mode::Udp => {}
    }
    profiles.sort();

    objects.push((
        ObjectKey::new(ObjectKind::VirtualServer, partition, name),
        ObjectBody::VirtualServer(VirtualServerBody {
            destination: destination(partition, service),
            ip_protocol: frontend.mode.ip_protocol().to_string(),
            pool: pool_path,
            profiles,
            policies,
            snat_automap: true,
        }),
    ));

    objects
}

fn destination(partition: &str, service: &Service) -> String {
    match service.frontend.bind_addr {
        std::net::IpAddr::V4(v4) => format!("/{partition}/{v4}:{}", service.frontend.port),
        std::net::IpAddr::V6(v6) => format!("/{partition}/{v6}.{}", service.frontend.port),
    }
}
