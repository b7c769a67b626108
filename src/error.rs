//! Error types for every collaborator the orchestrator talks to.
//!
//! Each external dependency gets its own small enum so the control loop can
//! branch on the failure domain (skip a project, retry an artifact next cycle,
//! back off the whole cycle). [`Error`] joins them for startup code paths,
//! where every failure is fatal.

use std::time::Duration;
use thiserror::Error;

/// Failures while reading the registry inventory.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry unavailable: {0}")]
    Unavailable(String),

    #[error("registry rejected credentials: {0}")]
    Auth(String),

    #[error("project not found: {0}")]
    ProjectNotFound(String),
}

/// Failures while scanning a single image.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("scan of {reference} timed out after {after:?}")]
    Timeout { reference: String, after: Duration },

    #[error("scan target unreachable: {0}")]
    TargetUnreachable(String),

    #[error("scan engine error: {0}")]
    Engine(String),
}

/// Failures talking to the dedup cache.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),
}

/// Failures handing a result to the job queue.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),
}

/// Configuration problems. Only ever raised at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting `{0}`")]
    Missing(&'static str),

    #[error("invalid value for `{key}`: {message}")]
    Invalid { key: String, message: String },

    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

impl ConfigError {
    pub(crate) fn invalid(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.into(),
            message: message.into(),
        }
    }
}

/// Crate-level error used on startup paths.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Scan(#[from] ScanError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Publish(#[from] PublishError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
