//! Error types for the Maestro control plane

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Redis command or connection failure
    #[error("Redis error: {0}")]
    RedisError(#[from] redis::RedisError),

    /// HTTP request to the sink registry failed
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    /// JSON (de)serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// YAML rendering error for collector configs
    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// Invalid service configuration
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// A sink configuration failed validation
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// A ledger record already exists for this sink
    #[error("Deployment record already exists for sink {0}")]
    AlreadyExists(String),

    /// The sink registry could not be reached
    #[error("Sink registry unavailable: {0}")]
    RegistryUnavailable(String),

    /// The deployer could not be reached
    #[error("Deployer unavailable: {0}")]
    DeployerUnavailable(String),

    /// No exporter builder is registered for the backend kind
    #[error("Unsupported exporter backend: {0}")]
    UnsupportedBackend(String),

    /// The monitor task stopped with an error
    #[error("Monitor failed: {0}")]
    MonitorError(String),
}

impl Error {
    /// Whether retrying the failed operation could succeed without operator action
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::KubeError(_)
            | Error::RedisError(_)
            | Error::HttpError(_)
            | Error::RegistryUnavailable(_)
            | Error::DeployerUnavailable(_) => true,
            Error::SerializationError(_)
            | Error::YamlError(_)
            | Error::ConfigError(_)
            | Error::ValidationError(_)
            | Error::AlreadyExists(_)
            | Error::UnsupportedBackend(_)
            | Error::MonitorError(_) => false,
        }
    }

    /// Short label used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Error::KubeError(_) => "kube",
            Error::RedisError(_) => "redis",
            Error::HttpError(_) => "http",
            Error::SerializationError(_) => "serialization",
            Error::YamlError(_) => "yaml",
            Error::ConfigError(_) => "config",
            Error::ValidationError(_) => "validation",
            Error::AlreadyExists(_) => "already_exists",
            Error::RegistryUnavailable(_) => "registry",
            Error::DeployerUnavailable(_) => "deployer",
            Error::UnsupportedBackend(_) => "unsupported_backend",
            Error::MonitorError(_) => "monitor",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
