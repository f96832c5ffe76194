//! EDA API crate - axum HTTP server and route handlers.
//!
//! Exposes the activation lifecycle (create, enable, disable, restart,
//! delete, retrieve, list) plus instance, log and heartbeat endpoints.

pub mod error;
pub mod handlers;
pub mod routes;
pub mod state;

pub use error::ApiError;
pub use routes::{create_router, start_server};
pub use state::AppState;
