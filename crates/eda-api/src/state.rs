//! Application state shared across all route handlers.

use std::sync::Arc;
use std::time::Instant;

use eda_activation::Orchestrator;
use eda_core::config::ServerConfig;

/// Shared application state.
///
/// All fields use `Arc` for cheap cloning across handler tasks.
#[derive(Clone)]
pub struct AppState {
    /// Lifecycle operations behind every activation route.
    pub orchestrator: Arc<Orchestrator>,
    /// Server settings (page size bounds).
    pub server: Arc<ServerConfig>,
    /// Server start time for uptime calculation.
    pub start_time: Instant,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>, server: ServerConfig) -> Self {
        Self {
            orchestrator,
            server: Arc::new(server),
            start_time: Instant::now(),
        }
    }
}
