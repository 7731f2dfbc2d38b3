//! Error types for the controller

use thiserror::Error;

use crate::bigip::OperationError;

#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error while observing the cluster
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid config file: {0}")]
    ConfigFileError(#[from] toml::de::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Orchestrator could not be reached; the last good snapshot may be reused
    #[error("Observation failed: {0}")]
    ObservationFailure(String),

    /// Orchestrator answered but the data cannot be trusted
    #[error("Orchestrator returned malformed topology: {0}")]
    MalformedTopology(String),

    #[error("Translation failed: {0}")]
    TranslationFailure(String),

    #[error("Operation on {key} failed: {source}")]
    OperationFailure {
        key: String,
        #[source]
        source: OperationError,
    },

    /// Traffic manager call outside of a single operation (listing, rebuild)
    #[error("Traffic manager error: {0}")]
    TrafficManager(#[from] OperationError),

    /// The persisted applied state failed its integrity check
    #[error("State store corrupted: {0}")]
    StoreCorruption(String),

    #[error("State store error: {0}")]
    StoreError(String),
}

impl Error {
    /// Whether retrying the same call later can reasonably succeed
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::KubeError(kube::Error::Api(resp)) => resp.code >= 500 || resp.code == 429,
            Error::KubeError(_) | Error::HttpError(_) | Error::IoError(_) => true,
            Error::ObservationFailure(_) => true,
            Error::OperationFailure { source, .. } | Error::TrafficManager(source) => {
                source.is_transient()
            }
            _ => false,
        }
    }

    /// Short machine-friendly label, used for metrics and logs
    pub fn kind(&self) -> &'static str {
        match self {
            Error::KubeError(_) => "kube",
            Error::HttpError(_) => "http",
            Error::SerializationError(_) => "serialization",
            Error::IoError(_) => "io",
            Error::ConfigFileError(_) | Error::ConfigError(_) => "config",
            Error::ObservationFailure(_) => "observation",
            Error::MalformedTopology(_) => "malformed_topology",
            Error::TranslationFailure(_) => "translation",
            Error::OperationFailure { .. } => "operation",
            Error::TrafficManager(_) => "traffic_manager",
            Error::StoreCorruption(_) => "store_corruption",
            Error::StoreError(_) => "store",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
