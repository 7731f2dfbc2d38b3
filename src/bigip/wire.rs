//! Conversion between declarative objects and iControl REST JSON
//!
//! `from_wire` keeps only the fields that are part of desired state; device
//! assigned fields such as `selfLink`, `generation` or `fullPath` are dropped
//! so rebuilt records compare equal to translated ones.

use std::collections::BTreeMap;

use serde_json::{json, Value};

use crate::model::{
    full_path, split_full_path, MemberBody, MonitorBody, ObjectBody, ObjectKey, ObjectKind,
    PolicyBody, PolicyRule, PoolBody, ProfileRef, VirtualServerBody,
};

/// REST collection path below `/mgmt/tm/`
pub fn collection(kind: ObjectKind) -> &'static str {
    match kind {
        ObjectKind::HttpMonitor => "ltm/monitor/http",
        ObjectKind::TcpMonitor => "ltm/monitor/tcp",
        ObjectKind::Pool => "ltm/pool",
        ObjectKind::Policy => "ltm/policy",
        ObjectKind::VirtualServer => "ltm/virtual",
    }
}

/// iControl REST item path segment, `~Partition~name`
pub fn item_name(key: &ObjectKey) -> String {
    format!("~{}~{}", key.partition, key.name)
}

pub fn to_wire(key: &ObjectKey, body: &ObjectBody) -> Value {
    let mut value = match body {
        ObjectBody::Monitor(monitor) => {
            let mut v = json!({
                "interval": monitor.interval,
                "timeout": monitor.timeout,
            });
            if let Some(send) = &monitor.send {
                v["send"] = Value::String(send.clone());
            }
            v
        }
        ObjectBody::Pool(pool) => {
            let monitor = pool
                .monitors
                .iter()
                .map(|(_, path)| path.as_str())
                .collect::<Vec<_>>()
                .join(" and ");
            let members: Vec<Value> = pool
                .members
                .iter()
                .map(|(name, member)| {
                    json!({
                        "name": name,
                        "partition": key.partition,
                        "ratio": member.ratio,
                        "state": "user-up",
                        "session": "user-enabled",
                    })
                })
                .collect();
            json!({
                "loadBalancingMode": pool.load_balancing_mode,
                "monitor": monitor,
                "members": members,
            })
        }
        ObjectBody::Policy(policy) => {
            let rules: Vec<Value> = policy
                .rules
                .iter()
                .enumerate()
                .map(|(ordinal, rule)| policy_rule_to_wire(ordinal, rule))
                .collect();
            json!({
                "strategy": "/Common/first-match",
                "requires": ["http"],
                "controls": ["forwarding"],
                "legacy": true,
                "rules": rules,
            })
        }
        ObjectBody::VirtualServer(vs) => {
            let profiles: Vec<Value> = vs
                .profiles
                .iter()
                .map(|p| json!({"name": p.name, "partition": p.partition}))
                .collect();
            let policies: Vec<Value> = vs
                .policies
                .iter()
                .filter_map(|path| split_full_path(path))
                .map(|(partition, name)| json!({"name": name, "partition": partition}))
                .collect();
            let snat = if vs.snat_automap { "automap" } else { "none" };
            json!({
                "enabled": true,
                "destination": vs.destination,
                "ipProtocol": vs.ip_protocol,
                "pool": vs.pool,
                "sourceAddressTranslation": {"type": snat},
                "profiles": profiles,
                "policies": policies,
            })
        }
    };
    value["name"] = Value::String(key.name.clone());
    value["partition"] = Value::String(key.partition.clone());
    value
}

fn policy_rule_to_wire(ordinal: usize, rule: &PolicyRule) -> Value {
    let mut conditions = Vec::new();
    if let Some(host) = &rule.host {
        conditions.push(json!({
            "name": conditions.len().to_string(),
            "httpHost": true,
            "host": true,
            "equals": true,
            "request": true,
            "values": [host],
        }));
    }
    if let Some(path) = &rule.path_prefix {
        conditions.push(json!({
            "name": conditions.len().to_string(),
            "httpUri": true,
            "path": true,
            "startsWith": true,
            "request": true,
            "values": [path],
        }));
    }
    json!({
        "name": rule.name,
        "ordinal": ordinal,
        "conditions": conditions,
        "actions": [{
            "name": "0",
            "forward": true,
            "request": true,
            "select": true,
            "pool": rule.pool,
        }],
    })
}

/// Items of an expanded `*Reference` subcollection
fn reference_items<'a>(value: &'a Value, field: &str) -> &'a [Value] {
    value
        .get(field)
        .and_then(|r| r.get("items"))
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

fn str_field<'a>(value: &'a Value, field: &str) -> Option<&'a str> {
    value.get(field).and_then(Value::as_str)
}

fn u32_field(value: &Value, field: &str) -> Option<u32> {
    value
        .get(field)
        .and_then(Value::as_u64)
        .map(|v| u32::try_from(v).unwrap_or(u32::MAX))
}

/// Parse a device object into its key and desired-state body.
///
/// `monitor_kinds` maps monitor full paths to their kind so pool monitor
/// references can be typed; unknown monitors are assumed to be HTTP.
pub fn from_wire(
    kind: ObjectKind,
    value: &Value,
    monitor_kinds: &BTreeMap<String, ObjectKind>,
) -> Option<(ObjectKey, ObjectBody)> {
    let name = str_field(value, "name")?;
    let partition = str_field(value, "partition")?;
    let key = ObjectKey::new(kind, partition, name);

    let body = match kind {
        ObjectKind::HttpMonitor | ObjectKind::TcpMonitor => ObjectBody::Monitor(MonitorBody {
            interval: u32_field(value, "interval")?,
            timeout: u32_field(value, "timeout")?,
            send: str_field(value, "send")
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        }),
        ObjectKind::Pool => {
            let monitors = str_field(value, "monitor")
                .unwrap_or_default()
                .split(" and ")
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .map(|path| {
                    let kind = monitor_kinds
                        .get(path)
                        .copied()
                        .unwrap_or(ObjectKind::HttpMonitor);
                    (kind, path.to_string())
                })
                .collect();
            let members = reference_items(value, "membersReference")
                .iter()
                .filter_map(|m| {
                    let name = str_field(m, "name")?;
                    let ratio = u32_field(m, "ratio").unwrap_or(1);
                    Some((name.to_string(), MemberBody { ratio }))
                })
                .collect();
            ObjectBody::Pool(PoolBody {
                load_balancing_mode: str_field(value, "loadBalancingMode")
                    .unwrap_or("round-robin")
                    .to_string(),
                monitors,
                members,
            })
        }
        ObjectKind::Policy => {
            let mut rules: Vec<(u64, PolicyRule)> = reference_items(value, "rulesReference")
                .iter()
                .filter_map(|rule| {
                    let ordinal = rule.get("ordinal").and_then(Value::as_u64).unwrap_or(0);
                    Some((ordinal, policy_rule_from_wire(rule)?))
                })
                .collect();
            rules.sort_by_key(|(ordinal, _)| *ordinal);
            ObjectBody::Policy(PolicyBody {
                rules: rules.into_iter().map(|(_, rule)| rule).collect(),
            })
        }
        ObjectKind::VirtualServer => {
            let mut profiles: Vec<ProfileRef> = reference_items(value, "profilesReference")
                .iter()
                .filter_map(|p| {
                    Some(ProfileRef {
                        partition: str_field(p, "partition")?.to_string(),
                        name: str_field(p, "name")?.to_string(),
                    })
                })
                .collect();
            profiles.sort();
            let policies = reference_items(value, "policiesReference")
                .iter()
                .filter_map(|p| Some(full_path(str_field(p, "partition")?, str_field(p, "name")?)))
                .collect();
            let snat_automap = value
                .get("sourceAddressTranslation")
                .and_then(|s| str_field(s, "type"))
                == Some("automap");
            ObjectBody::VirtualServer(VirtualServerBody {
                destination: str_field(value, "destination")?.to_string(),
                ip_protocol: str_field(value, "ipProtocol").unwrap_or("tcp").to_string(),
                pool: str_field(value, "pool").unwrap_or_default().to_string(),
                profiles,
                policies,
                snat_automap,
            })
        }
    };
    Some((key, body))
}

fn policy_rule_from_wire(rule: &Value) -> Option<PolicyRule> {
    let mut host = None;
    let mut path_prefix = None;
    for condition in reference_items(rule, "conditionsReference") {
        let first_value = condition
            .get("values")
            .and_then(Value::as_array)
            .and_then(|v| v.first())
            .and_then(Value::as_str)
            .map(str::to_string);
        if condition.get("httpHost").and_then(Value::as_bool) == Some(true) {
            host = first_value;
        } else if condition.get("httpUri").and_then(Value::as_bool) == Some(true) {
            path_prefix = first_value;
        }
    }
    let pool = reference_items(rule, "actionsReference")
        .iter()
        .find_map(|a| str_field(a, "pool"))?
        .to_string();
    Some(PolicyRule {
        name: str_field(rule, "name")?.to_string(),
        host,
        path_prefix,
        pool,
    })
}
