use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Optimistic-concurrency collision; retried immediately with a fresh read.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Dependency not ready: {0}")]
    DependencyNotReady(String),

    #[error("Execution failure: {0}")]
    Execution(String),

    #[error("Module compile error: {0}")]
    Compile(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Reconcile error: {0}")]
    Reconcile(String),
}

/// Short alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn reconcile(msg: impl Into<String>) -> Self {
        Self::Reconcile(msg.into())
    }
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
    pub fn compile(msg: impl Into<String>) -> Self {
        Self::Compile(msg.into())
    }

    /// True for errors that describe a transient store condition rather than
    /// a failure of the reconcile logic itself.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Conflict(_) | Self::NotFound(_) | Self::DependencyNotReady(_)
        )
    }
}
