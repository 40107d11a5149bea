//! Cluster coordination error types.
//!
//! Every variant maps to a stable error code and an HTTP status so the
//! admin surface can return `Err(ClusterError::NotFound { .. })` directly.
//! Store RPC failures arrive as `anyhow::Error` from the store traits and
//! are wrapped here with the operation that produced them.

use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Errors surfaced by the cluster coordination core.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// The store client could not be constructed.
    #[error("create client with endpoints {endpoints:?} failed: {source}")]
    Connection {
        endpoints: Vec<String>,
        #[source]
        source: anyhow::Error,
    },

    /// A resource was accessed before it was initialized.
    #[error("{resource} is not ready")]
    NotReady { resource: &'static str },

    /// A persisted value could not be parsed; the store holds garbage.
    #[error("corrupt value {value:?} at {key}: {reason}")]
    CorruptState {
        key: String,
        value: String,
        reason: String,
    },

    /// A write failed after the in-memory resource was already created.
    #[error("put {key} failed: {source}")]
    Persist {
        key: String,
        #[source]
        source: Box<ClusterError>,
    },

    /// Two on-disk identities collide in the store's member list.
    #[error(
        "identity conflict: local name {local_name} id {local_id:x}, \
         store name {store_name} id {store_id:x}"
    )]
    IdentityConflict {
        local_name: String,
        local_id: u64,
        store_name: String,
        store_id: u64,
    },

    /// The embedded server did not become ready in time.
    #[error("start server timeout after {timeout:?}")]
    ServerTimeout { timeout: Duration },

    /// The embedded server could not be launched at all.
    #[error("start server failed: {source}")]
    ServerStart {
        #[source]
        source: anyhow::Error,
    },

    /// A purge target or key has no record in the store.
    #[error("{key} not found")]
    NotFound { key: String },

    /// A store RPC failed.
    #[error("{op} failed: {source}")]
    Request {
        op: &'static str,
        #[source]
        source: anyhow::Error,
    },

    /// A store RPC did not complete within its deadline.
    #[error("{op} exceeded deadline of {timeout:?}")]
    Deadline { op: &'static str, timeout: Duration },

    /// The operation raced graceful shutdown.
    #[error("cluster is shutting down")]
    ShuttingDown,

    /// Invalid configuration.
    #[error("invalid configuration: {message}")]
    Config { message: String },

    /// The status document could not be serialized.
    #[error("encode status failed: {source}")]
    Encode {
        #[source]
        source: serde_yaml::Error,
    },
}

impl ClusterError {
    /// Wrap a store RPC failure with the name of the operation.
    pub fn request(op: &'static str, source: anyhow::Error) -> Self {
        ClusterError::Request { op, source }
    }

    /// Whether the error must stop the node instead of being retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ClusterError::IdentityConflict { .. })
    }

    /// Return the stable error code string.
    pub fn code(&self) -> &'static str {
        match self {
            ClusterError::Connection { .. } => "ConnectionError",
            ClusterError::NotReady { .. } => "NotReady",
            ClusterError::CorruptState { .. } => "CorruptState",
            ClusterError::Persist { .. } => "PersistError",
            ClusterError::IdentityConflict { .. } => "IdentityConflict",
            ClusterError::ServerTimeout { .. } => "ServerTimeout",
            ClusterError::ServerStart { .. } => "ServerStartFailed",
            ClusterError::NotFound { .. } => "NotFound",
            ClusterError::Request { .. } => "RequestFailed",
            ClusterError::Deadline { .. } => "DeadlineExceeded",
            ClusterError::ShuttingDown => "ShuttingDown",
            ClusterError::Config { .. } => "InvalidConfig",
            ClusterError::Encode { .. } => "EncodeError",
        }
    }

    /// Return the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ClusterError::Connection { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ClusterError::NotReady { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ClusterError::CorruptState { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ClusterError::Persist { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ClusterError::IdentityConflict { .. } => StatusCode::CONFLICT,
            ClusterError::ServerTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            ClusterError::ServerStart { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ClusterError::NotFound { .. } => StatusCode::NOT_FOUND,
            ClusterError::Request { .. } => StatusCode::BAD_GATEWAY,
            ClusterError::Deadline { .. } => StatusCode::GATEWAY_TIMEOUT,
            ClusterError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            ClusterError::Config { .. } => StatusCode::BAD_REQUEST,
            ClusterError::Encode { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ClusterError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = serde_json::json!({
            "code": self.code(),
            "message": self.to_string(),
        });
        (status, axum::Json(body)).into_response()
    }
}
