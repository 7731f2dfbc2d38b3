//! Declarative BIG-IP objects
//!
//! Objects reference each other by full path (`/Partition/name`) rather than
//! by pointer. The reference graph is a DAG fixed per kind:
//!
//! ```text
//! VirtualServer -> Policy -> Pool -> Monitor
//! VirtualServer ----------> Pool
//! ```
//!
//! [`ObjectKind::rank`] encodes that order; the diff engine uses it to place
//! creates before their referrers and deletes after them.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ObjectKind {
    HttpMonitor,
    TcpMonitor,
    Pool,
    Policy,
    VirtualServer,
}

impl ObjectKind {
    /// Position in the dependency DAG; lower ranks are referenced by higher ones
    pub fn rank(&self) -> u8 {
        match self {
            ObjectKind::HttpMonitor | ObjectKind::TcpMonitor => 0,
            ObjectKind::Pool => 1,
            ObjectKind::Policy => 2,
            ObjectKind::VirtualServer => 3,
        }
    }

    /// Monitors of every type share one name space per partition
    pub fn is_monitor(&self) -> bool {
        matches!(self, ObjectKind::HttpMonitor | ObjectKind::TcpMonitor)
    }

    pub const ALL: [ObjectKind; 5] = [
        ObjectKind::HttpMonitor,
        ObjectKind::TcpMonitor,
        ObjectKind::Pool,
        ObjectKind::Policy,
        ObjectKind::VirtualServer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::HttpMonitor => "http_monitor",
            ObjectKind::TcpMonitor => "tcp_monitor",
            ObjectKind::Pool => "pool",
            ObjectKind::Policy => "policy",
            ObjectKind::VirtualServer => "virtual_server",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable identity of a declarative object on the traffic manager
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub kind: ObjectKind,
    pub partition: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(kind: ObjectKind, partition: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            partition: partition.into(),
            name: name.into(),
        }
    }

    /// `/Partition/name`, the form used for references
    pub fn full_path(&self) -> String {
        full_path(&self.partition, &self.name)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.full_path())
    }
}

pub fn full_path(partition: &str, name: &str) -> String {
    format!("/{partition}/{name}")
}

/// Split `/Partition/name` into its parts
pub fn split_full_path(path: &str) -> Option<(&str, &str)> {
    let rest = path.strip_prefix('/')?;
    let (partition, name) = rest.split_once('/')?;
    if partition.is_empty() || name.is_empty() {
        return None;
    }
    Some((partition, name))
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorBody {
    pub interval: u32,
    pub timeout: u32,
    /// Request string for HTTP monitors
    pub send: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberBody {
    pub ratio: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolBody {
    pub load_balancing_mode: String,
    /// Full paths of the attached monitors; all must pass
    pub monitors: Vec<(ObjectKind, String)>,
    /// Members keyed by `address:port`
    pub members: BTreeMap<String, MemberBody>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyRule {
    pub name: String,
    pub host: Option<String>,
    pub path_prefix: Option<String>,
    /// Full path of the pool traffic is forwarded to
    pub pool: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyBody {
    pub rules: Vec<PolicyRule>,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProfileRef {
    pub partition: String,
    pub name: String,
}

impl ProfileRef {
    pub fn common(name: &str) -> Self {
        Self {
            partition: "Common".to_string(),
            name: name.to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualServerBody {
    /// `/Partition/address:port`
    pub destination: String,
    pub ip_protocol: String,
    pub pool: String,
    /// Sorted so that comparison ignores device ordering
    pub profiles: Vec<ProfileRef>,
    pub policies: Vec<String>,
    pub snat_automap: bool,
}

/// Desired (or last applied) body of a declarative object
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ObjectBody {
    Monitor(MonitorBody),
    Pool(PoolBody),
    Policy(PolicyBody),
    VirtualServer(VirtualServerBody),
}

impl ObjectBody {
    /// Keys of the objects this body refers to
    pub fn references(&self) -> Vec<ObjectKey> {
        let mut refs: Vec<ObjectKey> = match self {
            ObjectBody::Monitor(_) => Vec::new(),
            ObjectBody::Pool(pool) => pool
                .monitors
                .iter()
                .filter_map(|(kind, path)| path_key(*kind, path))
                .collect(),
            ObjectBody::Policy(policy) => policy
                .rules
                .iter()
                .filter_map(|rule| path_key(ObjectKind::Pool, &rule.pool))
                .collect(),
            ObjectBody::VirtualServer(vs) => path_key(ObjectKind::Pool, &vs.pool)
                .into_iter()
                .chain(
                    vs.policies
                        .iter()
                        .filter_map(|p| path_key(ObjectKind::Policy, p)),
                )
                .collect(),
        };
        refs.sort();
        refs.dedup();
        refs
    }

    /// Whether the body shape fits the kind it is stored under
    pub fn matches_kind(&self, kind: ObjectKind) -> bool {
        matches!(
            (self, kind),
            (
                ObjectBody::Monitor(_),
                ObjectKind::HttpMonitor | ObjectKind::TcpMonitor
            ) | (ObjectBody::Pool(_), ObjectKind::Pool)
                | (ObjectBody::Policy(_), ObjectKind::Policy)
                | (ObjectBody::VirtualServer(_), ObjectKind::VirtualServer)
        )
    }
}

fn path_key(kind: ObjectKind, path: &str) -> Option<ObjectKey> {
    split_full_path(path).map(|(partition, name)| ObjectKey::new(kind, partition, name))
}

/// Translator output: every object that should exist, ordered by key
pub type DesiredConfig = BTreeMap<ObjectKey, ObjectBody>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rank_follows_reference_direction() {
        assert!(ObjectKind::HttpMonitor.rank() < ObjectKind::Pool.rank());
        assert!(ObjectKind::Pool.rank() < ObjectKind::Policy.rank());
        assert!(ObjectKind::Policy.rank() < ObjectKind::VirtualServer.rank());
        assert_eq!(ObjectKind::TcpMonitor.rank(), ObjectKind::HttpMonitor.rank());
    }

    #[test]
    fn test_split_full_path() {
        assert_eq!(split_full_path("/mesos/web"), Some(("mesos", "web")));
        assert_eq!(split_full_path("mesos/web"), None);
        assert_eq!(split_full_path("/mesos"), None);
        assert_eq!(split_full_path("//web"), None);
    }

    #[test]
    fn test_virtual_server_references() {
        let body = ObjectBody::VirtualServer(VirtualServerBody {
            destination: "/mesos/10.0.0.1:80".into(),
            ip_protocol: "tcp".into(),
            pool: "/mesos/web".into(),
            profiles: vec![ProfileRef::common("http")],
            policies: vec!["/mesos/web".into()],
            snat_automap: true,
        });

        assert_eq!(
            body.references(),
            vec![
                ObjectKey::new(ObjectKind::Pool, "mesos", "web"),
                ObjectKey::new(ObjectKind::Policy, "mesos", "web"),
            ]
        );
    }

    #[test]
    fn test_pool_references_monitors_by_kind() {
        let body = ObjectBody::Pool(PoolBody {
            load_balancing_mode: "round-robin".into(),
            monitors: vec![
                (ObjectKind::HttpMonitor, "/mesos/web".into()),
                (ObjectKind::TcpMonitor, "/mesos/web_1".into()),
            ],
            members: BTreeMap::new(),
        });

        let refs = body.references();
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].kind, ObjectKind::HttpMonitor);
        assert_eq!(refs[1].kind, ObjectKind::TcpMonitor);
        assert!(body.matches_kind(ObjectKind::Pool));
        assert!(!body.matches_kind(ObjectKind::HttpMonitor));
    }
}
