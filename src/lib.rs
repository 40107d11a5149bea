//! Gateway cluster library: coordination core of a gateway node.
//!
//! This crate manages a node's relationship with the consensus store: the
//! shared client connection, the node's lease and coordination session,
//! the embedded store server on writer nodes, the bootstrap, heartbeat and
//! defragmentation loops, graceful shutdown, and member purge.  An admin
//! HTTP surface and Prometheus metrics sit on top.

use std::sync::Arc;

pub mod cluster;
pub mod config;
pub mod errors;
pub mod metrics;
pub mod server;

use crate::cluster::Cluster;
use crate::config::Config;

/// Shared application state passed to all handlers via `axum::extract::State`.
pub struct AppState {
    /// Node configuration.
    pub config: Config,
    /// Cluster coordinator.
    pub cluster: Arc<Cluster>,
}
