//! Controller configuration
//!
//! An optional TOML file provides defaults; command line flags and their
//! environment variables override it. [`ControllerConfig::resolve`] merges
//! both and validates the result.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::bigip::BigIpSettings;
use crate::controller::{BackoffPolicy, ControllerSettings, ReconcilerConfig, TranslateOptions};
use crate::error::{Error, Result};
use crate::model::PartitionFilter;
use crate::observer::{KubernetesSettings, MarathonSettings};

pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_LISTEN: &str = "0.0.0.0:8080";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrchestratorKind {
    Marathon,
    Kubernetes,
}

impl std::str::FromStr for OrchestratorKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "marathon" => Ok(OrchestratorKind::Marathon),
            "kubernetes" | "k8s" => Ok(OrchestratorKind::Kubernetes),
            other => Err(Error::ConfigError(format!(
                "unknown orchestrator '{other}', expected marathon or kubernetes"
            ))),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BigIpSection {
    pub url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub insecure: Option<bool>,
    pub timeout_secs: Option<u64>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OrchestratorSection {
    pub kind: Option<OrchestratorKind>,
    pub marathon_url: Option<String>,
    pub marathon_username: Option<String>,
    pub marathon_password: Option<String>,
    pub namespace: Option<String>,
    pub timeout_secs: Option<u64>,
}

/// Contents of the TOML config file; every field is optional
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub poll_interval_secs: Option<u64>,
    pub partitions: Option<Vec<String>>,
    pub drain_on_empty: Option<bool>,
    pub drift_check_every: Option<u64>,
    pub collect_garbage: Option<bool>,
    pub state_file: Option<PathBuf>,
    pub listen: Option<SocketAddr>,
    pub reconciler: Option<ReconcilerConfig>,
    pub observer_retry: Option<BackoffPolicy>,
    pub bigip: BigIpSection,
    pub orchestrator: OrchestratorSection,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            Error::ConfigError(format!("failed to read config file '{}': {e}", path.display()))
        })?;
        Ok(toml::from_str(&content)?)
    }
}

/// Values given on the command line or through the environment
#[derive(Clone, Debug, Default)]
pub struct Overrides {
    pub orchestrator: Option<OrchestratorKind>,
    pub marathon_url: Option<String>,
    pub marathon_username: Option<String>,
    pub marathon_password: Option<String>,
    pub namespace: Option<String>,
    pub bigip_url: Option<String>,
    pub bigip_username: Option<String>,
    pub bigip_password: Option<String>,
    pub bigip_insecure: Option<bool>,
    pub partitions: Vec<String>,
    pub poll_interval_secs: Option<u64>,
    pub worker_limit: Option<usize>,
    pub drain_on_empty: Option<bool>,
    pub drift_check_every: Option<u64>,
    pub state_file: Option<PathBuf>,
    pub listen: Option<SocketAddr>,
    pub dry_run: Option<bool>,
}

#[derive(Clone, Debug)]
pub enum OrchestratorConfig {
    Marathon(MarathonSettings),
    Kubernetes(KubernetesSettings),
}

/// Fully resolved configuration
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    pub poll_interval: Duration,
    pub orchestrator: OrchestratorConfig,
    pub observer_retry: BackoffPolicy,
    pub bigip: BigIpSettings,
    pub controller: ControllerSettings,
    /// Persist the applied record here; kept in memory when unset
    pub state_file: Option<PathBuf>,
    pub listen: SocketAddr,
}

fn required(value: Option<String>, name: &str) -> Result<String> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| Error::ConfigError(format!("{name} is required")))
}

impl ControllerConfig {
    pub fn resolve(file: FileConfig, cli: Overrides) -> Result<Self> {
        let poll_interval_secs = cli
            .poll_interval_secs
            .or(file.poll_interval_secs)
            .unwrap_or(DEFAULT_POLL_INTERVAL_SECS);

        let partitions = if cli.partitions.is_empty() {
            file.partitions.unwrap_or_default()
        } else {
            cli.partitions
        };

        let mut reconciler = file.reconciler.unwrap_or_default();
        if let Some(limit) = cli.worker_limit {
            reconciler.worker_limit = limit;
        }
        if let Some(dry_run) = cli.dry_run {
            reconciler.dry_run = dry_run;
        }

        let orchestrator_kind = cli
            .orchestrator
            .or(file.orchestrator.kind)
            .ok_or_else(|| Error::ConfigError("orchestrator is required".to_string()))?;
        let orchestrator_timeout = Duration::from_secs(
            file.orchestrator
                .timeout_secs
                .unwrap_or(DEFAULT_HTTP_TIMEOUT_SECS),
        );
        let orchestrator = match orchestrator_kind {
            OrchestratorKind::Marathon => OrchestratorConfig::Marathon(MarathonSettings {
                url: required(
                    cli.marathon_url.or(file.orchestrator.marathon_url),
                    "marathon url",
                )?,
                username: cli
                    .marathon_username
                    .or(file.orchestrator.marathon_username),
                password: cli
                    .marathon_password
                    .or(file.orchestrator.marathon_password),
                timeout: orchestrator_timeout,
            }),
            OrchestratorKind::Kubernetes => OrchestratorConfig::Kubernetes(KubernetesSettings {
                namespace: cli.namespace.or(file.orchestrator.namespace),
            }),
        };

        let bigip = BigIpSettings {
            url: required(cli.bigip_url.or(file.bigip.url), "bigip url")?,
            username: required(cli.bigip_username.or(file.bigip.username), "bigip username")?,
            password: required(cli.bigip_password.or(file.bigip.password), "bigip password")?,
            insecure: cli.bigip_insecure.or(file.bigip.insecure).unwrap_or(false),
            timeout: Duration::from_secs(
                file.bigip.timeout_secs.unwrap_or(DEFAULT_HTTP_TIMEOUT_SECS),
            ),
        };

        let listen = match cli.listen.or(file.listen) {
            Some(addr) => addr,
            None => DEFAULT_LISTEN
                .parse()
                .map_err(|e| Error::ConfigError(format!("invalid listen address: {e}")))?,
        };

        let config = Self {
            poll_interval: Duration::from_secs(poll_interval_secs),
            orchestrator,
            observer_retry: file.observer_retry.unwrap_or_default(),
            bigip,
            controller: ControllerSettings {
                translate: TranslateOptions {
                    partitions: PartitionFilter::new(partitions),
                    drain_on_empty: cli
                        .drain_on_empty
                        .or(file.drain_on_empty)
                        .unwrap_or(false),
                },
                reconciler,
                drift_check_every: cli
                    .drift_check_every
                    .or(file.drift_check_every)
                    .unwrap_or(0),
                collect_garbage: file.collect_garbage.unwrap_or(true),
            },
            state_file: cli.state_file.or(file.state_file),
            listen,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn partitions(&self) -> &PartitionFilter {
        &self.controller.translate.partitions
    }

    fn validate(&self) -> Result<()> {
        if self.partitions().explicit().next().is_none() && !self.partitions().is_wildcard() {
            return Err(Error::ConfigError(
                "at least one partition (or '*') must be managed".to_string(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(Error::ConfigError(
                "poll interval must be at least one second".to_string(),
            ));
        }
        if self.controller.reconciler.worker_limit == 0 {
            return Err(Error::ConfigError("worker limit must be positive".to_string()));
        }
        if self.controller.reconciler.retry.max_attempts == 0
            || self.observer_retry.max_attempts == 0
        {
            return Err(Error::ConfigError(
                "retry max_attempts must be positive".to_string(),
            ));
        }
        if !self.bigip.url.starts_with("http://") && !self.bigip.url.starts_with("https://") {
            return Err(Error::ConfigError(format!(
                "bigip url '{}' must start with http:// or https://",
                self.bigip.url
            )));
        }
        Ok(())
    }
}
