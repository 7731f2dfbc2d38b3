//! iControl REST client

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::wire::{collection, from_wire, item_name, to_wire};
use super::{OperationError, TrafficManager};
use crate::error::{Error, Result};
use crate::model::{full_path, DesiredConfig, ObjectKind, Operation};

/// Connection settings for one BIG-IP device
#[derive(Clone, Debug)]
pub struct BigIpSettings {
    /// Management base URL, e.g. `https://10.190.25.80`
    pub url: String,
    pub username: String,
    pub password: String,
    /// Accept self-signed management certificates
    pub insecure: bool,
    pub timeout: Duration,
}

pub struct BigIpClient {
    http_client: Client,
    base_url: String,
    username: String,
    password: String,
}

impl BigIpClient {
    pub fn new(settings: &BigIpSettings) -> Result<Self> {
        if settings.url.trim().is_empty() {
            return Err(Error::ConfigError("BIG-IP URL must not be empty".into()));
        }
        let http_client = Client::builder()
            .timeout(settings.timeout)
            .danger_accept_invalid_certs(settings.insecure)
            .user_agent(concat!("bigip-ctlr/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http_client,
            base_url: settings.url.trim_end_matches('/').to_string(),
            username: settings.username.clone(),
            password: settings.password.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/mgmt/tm/{}", self.base_url, path)
    }

    fn authed(&self, request: RequestBuilder) -> RequestBuilder {
        request.basic_auth(&self.username, Some(&self.password))
    }

    async fn send(&self, request: RequestBuilder) -> std::result::Result<Response, OperationError> {
        let response = self
            .authed(request)
            .send()
            .await
            .map_err(|e| OperationError::Transient(e.to_string()))?;
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(classify(status, &body))
    }

    async fn get_json(&self, url: &str) -> std::result::Result<Value, OperationError> {
        debug!("GET {}", url);
        let response = self.send(self.http_client.get(url)).await?;
        response
            .json::<Value>()
            .await
            .map_err(|e| OperationError::Transient(format!("unreadable response: {e}")))
    }

    /// All items of `collection` in `partition`, subcollections expanded
    async fn list_collection(
        &self,
        collection: &str,
        partition: &str,
    ) -> std::result::Result<Vec<Value>, OperationError> {
        let url = format!(
            "{}?$filter=partition+eq+{}&expandSubcollections=true",
            self.url(collection),
            partition
        );
        let json = self.get_json(&url).await?;
        let items = json
            .get("items")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        // Older releases ignore $filter
        Ok(items
            .into_iter()
            .filter(|item| item.get("partition").and_then(Value::as_str) == Some(partition))
            .collect())
    }
}

/// Map a failed HTTP status onto the operation error taxonomy
fn classify(status: StatusCode, body: &str) -> OperationError {
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string());
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => OperationError::Unauthorized(message),
        StatusCode::NOT_FOUND => OperationError::NotFound,
        StatusCode::CONFLICT => OperationError::AlreadyExists,
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => {
            OperationError::Transient(format!("HTTP {}: {}", status.as_u16(), message))
        }
        s if s.is_server_error() => {
            OperationError::Transient(format!("HTTP {}: {}", s.as_u16(), message))
        }
        s => OperationError::Rejected {
            status: s.as_u16(),
            message,
        },
    }
}

/// Node name of a pool member: the address without the port
fn member_address(member: &Value) -> Option<String> {
    if let Some(address) = member.get("address").and_then(Value::as_str) {
        return Some(address.to_string());
    }
    let name = member.get("name").and_then(Value::as_str)?;
    // IPv4 members are `a.b.c.d:port`, IPv6 members `addr.port`
    let split = if name.contains("::") || name.matches(':').count() > 1 {
        name.rsplit_once('.')
    } else {
        name.rsplit_once(':')
    };
    split.map(|(address, _)| address.to_string())
}

#[async_trait]
impl TrafficManager for BigIpClient {
    async fn apply(&self, operation: &Operation) -> std::result::Result<(), OperationError> {
        let key = operation.key();
        let collection_url = self.url(collection(key.kind));
        let item_url = format!("{}/{}", collection_url, item_name(key));

        let request = match operation {
            Operation::Create { body, .. } => {
                self.http_client.post(&collection_url).json(&to_wire(key, body))
            }
            Operation::Update { body, .. } => {
                self.http_client.put(&item_url).json(&to_wire(key, body))
            }
            Operation::Delete { .. } => self.http_client.delete(&item_url),
        };

        debug!("{} {}", operation.action(), key);
        self.send(request).await?;
        Ok(())
    }

    async fn list_objects(&self, partition: &str) -> std::result::Result<DesiredConfig, OperationError> {
        let mut objects = DesiredConfig::new();
        let mut monitor_kinds = BTreeMap::new();

        // Monitors come first in ALL so pools can resolve monitor kinds
        for kind in ObjectKind::ALL {
            for item in self.list_collection(collection(kind), partition).await? {
                match from_wire(kind, &item, &monitor_kinds) {
                    Some((key, body)) => {
                        if kind.is_monitor() {
                            monitor_kinds.insert(key.full_path(), kind);
                        }
                        objects.insert(key, body);
                    }
                    None => warn!(
                        "Ignoring unparseable {} in partition {}: {}",
                        kind,
                        partition,
                        item.get("name").and_then(serde_json::Value::as_str).unwrap_or("<unnamed>")
                    ),
                }
            }
        }

        debug!("Listed {} objects in partition {}", objects.len(), partition);
        Ok(objects)
    }

    async fn list_partitions(&self) -> std::result::Result<Vec<String>, OperationError> {
        let json = self.get_json(&self.url("sys/folder")).await?;
        let mut partitions: Vec<String> = json
            .get("items")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|f| f.get("name").and_then(Value::as_str))
                    .filter(|name| *name != "/" && *name != "Common" && !name.ends_with(".app"))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        partitions.sort();
        partitions.dedup();
        Ok(partitions)
    }

    async fn collect_garbage(&self, partition: &str) -> std::result::Result<Vec<String>, OperationError> {
        let referenced: BTreeSet<String> = self
            .list_collection(collection(ObjectKind::Pool), partition)
            .await?
            .iter()
            .flat_map(|pool| {
                pool.get("membersReference")
                    .and_then(|r| r.get("items"))
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default()
            })
            .filter_map(|member| member_address(&member))
            .collect();

        let mut removed = Vec::new();
        for node in self.list_collection("ltm/node", partition).await? {
            let Some(name) = node.get("name").and_then(Value::as_str) else {
                continue;
            };
            let address = node.get("address").and_then(Value::as_str).unwrap_or(name);
            if referenced.contains(name) || referenced.contains(address) {
                continue;
            }
            let url = format!("{}/~{}~{}", self.url("ltm/node"), partition, name);
            match self.send(self.http_client.delete(&url)).await {
                Ok(_) | Err(OperationError::NotFound) => {
                    info!("Removed orphaned node {}", full_path(partition, name));
                    removed.push(name.to_string());
                }
                // Still referenced by something we do not manage
                Err(e @ OperationError::Rejected { .. }) => {
                    debug!("Keeping node {}: {}", full_path(partition, name), e)
                }
                Err(e) => return Err(e),
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MonitorBody, ObjectBody, ObjectKey};
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> BigIpClient {
        BigIpClient::new(&BigIpSettings {
            url: server.uri(),
            username: "admin".into(),
            password: "admin".into(),
            insecure: true,
            timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    fn monitor_create() -> Operation {
        Operation::Create {
            key: ObjectKey::new(ObjectKind::TcpMonitor, "mesos", "web"),
            body: ObjectBody::Monitor(MonitorBody {
                interval: 20,
                timeout: 61,
                send: None,
            }),
        }
    }

    #[test]
    fn test_classify_statuses() {
        assert!(matches!(
            classify(StatusCode::UNAUTHORIZED, ""),
            OperationError::Unauthorized(_)
        ));
        assert_eq!(classify(StatusCode::NOT_FOUND, ""), OperationError::NotFound);
        assert_eq!(classify(StatusCode::CONFLICT, ""), OperationError::AlreadyExists);
        assert!(classify(StatusCode::SERVICE_UNAVAILABLE, "").is_transient());
        assert!(classify(StatusCode::TOO_MANY_REQUESTS, "").is_transient());
        assert_eq!(
            classify(
                StatusCode::BAD_REQUEST,
                r#"{"code":400,"message":"invalid interval"}"#
            ),
            OperationError::Rejected {
                status: 400,
                message: "invalid interval".into()
            }
        );
    }

    #[test]
    fn test_member_address() {
        assert_eq!(
            member_address(&json!({"name": "10.0.0.1:80"})).as_deref(),
            Some("10.0.0.1")
        );
        assert_eq!(
            member_address(&json!({"name": "2001:db8::1.80"})).as_deref(),
            Some("2001:db8::1")
        );
        assert_eq!(
            member_address(&json!({"name": "x", "address": "10.0.0.2"})).as_deref(),
            Some("10.0.0.2")
        );
    }

    #[tokio::test]
    async fn test_create_posts_to_collection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/mgmt/tm/ltm/monitor/tcp"))
            .and(body_partial_json(json!({
                "name": "web",
                "partition": "mesos",
                "interval": 20,
                "timeout": 61
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"name": "web"})))
            .expect(1)
            .mount(&server)
            .await;

        client_for(&server).apply(&monitor_create()).await.unwrap();
    }

    #[tokio::test]
    async fn test_create_conflict_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/mgmt/tm/ltm/monitor/tcp"))
            .respond_with(ResponseTemplate::new(409).set_body_json(json!({
                "code": 409,
                "message": "01020066:3: The requested monitor (/mesos/web) already exists"
            })))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .apply(&monitor_create())
            .await
            .unwrap_err();
        assert_eq!(err, OperationError::AlreadyExists);
    }

    #[tokio::test]
    async fn test_delete_uses_item_path() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/mgmt/tm/ltm/virtual/~mesos~web_80"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let op = Operation::Delete {
            key: ObjectKey::new(ObjectKind::VirtualServer, "mesos", "web_80"),
        };
        let err = client_for(&server).apply(&op).await.unwrap_err();
        assert_eq!(err, OperationError::NotFound);
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/mgmt/tm/ltm/monitor/tcp/~mesos~web"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let op = Operation::Update {
            key: ObjectKey::new(ObjectKind::TcpMonitor, "mesos", "web"),
            body: ObjectBody::Monitor(MonitorBody {
                interval: 20,
                timeout: 61,
                send: None,
            }),
        };
        let err = client_for(&server).apply(&op).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_list_objects_resolves_monitor_kinds() {
        let server = MockServer::start().await;
        for collection in ["ltm/monitor/http", "ltm/policy", "ltm/virtual"] {
            Mock::given(method("GET"))
                .and(path(format!("/mgmt/tm/{collection}")))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({"items": []})))
                .mount(&server)
                .await;
        }
        Mock::given(method("GET"))
            .and(path("/mgmt/tm/ltm/monitor/tcp"))
            .and(query_param("expandSubcollections", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"items": [
                {"name": "web", "partition": "mesos", "interval": 20, "timeout": 61},
                {"name": "other", "partition": "Common", "interval": 5, "timeout": 16}
            ]})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/mgmt/tm/ltm/pool"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"items": [{
                "name": "web",
                "partition": "mesos",
                "loadBalancingMode": "round-robin",
                "monitor": "/mesos/web ",
                "membersReference": {"items": [{"name": "10.0.0.1:80", "ratio": 1}]}
            }]})))
            .mount(&server)
            .await;

        let objects = client_for(&server).list_objects("mesos").await.unwrap();
        assert_eq!(objects.len(), 2);
        let pool = &objects[&ObjectKey::new(ObjectKind::Pool, "mesos", "web")];
        let ObjectBody::Pool(pool) = pool else {
            panic!("expected pool body");
        };
        assert_eq!(
            pool.monitors,
            vec![(ObjectKind::TcpMonitor, "/mesos/web".to_string())]
        );
    }

    #[tokio::test]
    async fn test_list_partitions_skips_common() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/mgmt/tm/sys/folder"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"items": [
                {"name": "/", "fullPath": "/"},
                {"name": "Common", "fullPath": "/Common"},
                {"name": "mesos", "fullPath": "/mesos"},
                {"name": "web.app", "fullPath": "/mesos/web.app"},
                {"name": "k8s", "fullPath": "/k8s"}
            ]})))
            .mount(&server)
            .await;

        let partitions = client_for(&server).list_partitions().await.unwrap();
        assert_eq!(partitions, vec!["k8s".to_string(), "mesos".to_string()]);
    }

    #[tokio::test]
    async fn test_collect_garbage_removes_unreferenced_nodes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/mgmt/tm/ltm/pool"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"items": [{
                "name": "web",
                "partition": "mesos",
                "membersReference": {"items": [{"name": "10.0.0.1:80", "address": "10.0.0.1"}]}
            }]})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/mgmt/tm/ltm/node"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"items": [
                {"name": "10.0.0.1", "partition": "mesos", "address": "10.0.0.1"},
                {"name": "10.0.0.2", "partition": "mesos", "address": "10.0.0.2"}
            ]})))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/mgmt/tm/ltm/node/~mesos~10.0.0.2"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let removed = client_for(&server).collect_garbage("mesos").await.unwrap();
        assert_eq!(removed, vec!["10.0.0.2".to_string()]);
    }
}
