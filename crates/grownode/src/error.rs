//! Error taxonomy shared by the runtime, the parameter store and the leaves.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, GrowError>;

#[derive(Error, Debug)]
pub enum GrowError {
    /// Bad or missing caller input.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Parameter lookup miss on an existing leaf.
    #[error("parameter '{param}' not found on leaf '{leaf}'")]
    NotFound { leaf: String, param: String },

    /// Write attempted on a read-only parameter.
    #[error("parameter '{param}' on leaf '{leaf}' is read-only")]
    AccessViolation { leaf: String, param: String },

    /// Bus or mailbox delivery failure.
    #[error("event not sent: {0}")]
    EventNotSent(String),

    #[error("leaf '{0}' not found")]
    LeafNotFound(String),

    #[error("leaf '{0}' could not be started")]
    LeafNotStarted(String),

    #[error("node not started: {0}")]
    NodeNotStarted(String),

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("store migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl GrowError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        GrowError::InvalidArgument(msg.into())
    }

    pub(crate) fn not_found(leaf: &str, param: &str) -> Self {
        GrowError::NotFound {
            leaf: leaf.to_string(),
            param: param.to_string(),
        }
    }

    /// Short stable label (snake_case) for logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            GrowError::InvalidArgument(_) => "invalid_argument",
            GrowError::NotFound { .. } => "not_found",
            GrowError::AccessViolation { .. } => "access_violation",
            GrowError::EventNotSent(_) => "event_not_sent",
            GrowError::LeafNotFound(_) => "leaf_not_found",
            GrowError::LeafNotStarted(_) => "leaf_not_started",
            GrowError::NodeNotStarted(_) => "node_not_started",
            GrowError::Store(_) => "store",
            GrowError::Migrate(_) => "store_migrate",
        }
    }
}
