//! Error types for the SSP operator

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// The incremental watch feed failed
    #[error("Watch error: {0}")]
    WatchError(#[from] kube::runtime::watcher::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Invalid flags or environment
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Listing the CustomResourceDefinitions failed
    #[error("Failed to list CRDs: {0}")]
    CrdListError(String),

    /// A background task registered with the manager failed
    #[error("Runnable {name} failed: {message}")]
    RunnableError { name: String, message: String },

    /// Leadership was acquired and then lost
    #[error("Leader election lost")]
    LeadershipLost,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Whether retrying the failed operation may succeed
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Error::KubeError(_) | Error::WatchError(_) | Error::CrdListError(_)
        )
    }
}
