//! Router setup with all API routes and middleware.

use std::net::SocketAddr;

use axum::extract::DefaultBodyLimit;
use axum::http::{header, Method};
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use eda_core::config::ServerConfig;
use eda_core::error::EdaError;

use crate::handlers;
use crate::state::AppState;

/// Create the axum Router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT]);

    let activation_routes = Router::new()
        .route(
            "/activations",
            get(handlers::list_activations).post(handlers::create_activation),
        )
        .route(
            "/activations/{id}",
            get(handlers::get_activation).delete(handlers::delete_activation),
        )
        .route("/activations/{id}/enable", post(handlers::enable_activation))
        .route("/activations/{id}/disable", post(handlers::disable_activation))
        .route("/activations/{id}/restart", post(handlers::restart_activation))
        .route(
            "/activations/{id}/instances",
            get(handlers::list_activation_instances),
        );

    let instance_routes = Router::new()
        .route("/activation-instances/{id}", get(handlers::get_instance))
        .route(
            "/activation-instances/{id}/logs",
            get(handlers::list_instance_logs),
        )
        .route(
            "/activation-instances/{id}/heartbeat",
            post(handlers::instance_heartbeat),
        );

    Router::new()
        .route("/health", get(handlers::health))
        .merge(activation_routes)
        .merge(instance_routes)
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serve the router on the configured address until `shutdown` resolves.
pub async fn start_server<F>(
    config: &ServerConfig,
    state: AppState,
    shutdown: F,
) -> Result<(), EdaError>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .map_err(|e| EdaError::Config(format!("Invalid listen address: {}", e)))?;

    let router = create_router(state);

    tracing::info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| EdaError::Api(format!("Failed to bind: {}", e)))?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| EdaError::Api(format!("Server error: {}", e)))?;

    Ok(())
}
