//! Data model shared by the observer, translator and diff engine

pub mod objects;
mod operation;
pub mod topology;

pub use objects::{
    full_path, split_full_path, DesiredConfig, MemberBody, MonitorBody, ObjectBody, ObjectKey,
    ObjectKind, PolicyBody, PolicyRule, PoolBody, ProfileRef, VirtualServerBody,
};
pub use operation::{Action, Operation};
pub use topology::{
    Endpoint, Frontend, HealthCheck, HealthProtocol, Mode, PartitionFilter, RouteRule, Service,
    TopologySnapshot, DEFAULT_LB_METHOD, LB_METHODS,
};
