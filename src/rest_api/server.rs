//! Axum HTTP server for the REST API (spec §6.1).
//!
//! Router assembly mirrors the teacher's `rest_api/server.rs` almost
//! verbatim: a single `Router` built from route groups, a `TraceLayer` for
//! request logging, `with_state`, then `axum::serve` over a plain TCP
//! listener.

use std::net::SocketAddr;

use axum::middleware;
use axum::routing::{delete, get, post, put};
use axum::Router;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::AppState;
use crate::error::{Error, Result};

use super::{admin_handlers, handlers};

pub async fn run_server(state: AppState) -> Result<()> {
    let public_routes = Router::new()
        .route("/healthz", get(handlers::health))
        .route("/api/seed-complete", post(handlers::seed_complete));

    #[cfg(feature = "metrics")]
    let public_routes = public_routes.route("/metrics", get(handlers::metrics));

    let candidate_routes = Router::new()
        .route("/api/auth/me", get(handlers::me))
        .route("/api/gpu-types", get(handlers::gpu_types))
        .route("/api/vms", get(handlers::list_vms))
        .route("/api/vms/launch", post(handlers::launch_vm))
        .route("/api/vms/terminate", post(handlers::terminate_vm))
        .route("/api/vms/restart", post(handlers::restart_vm))
        .route("/api/filesystems", get(handlers::list_filesystems))
        .route("/api/launch-requests", get(handlers::list_launch_requests))
        .route("/api/launch-requests", post(handlers::submit_launch_request))
        .route("/api/launch-requests/cancel", post(handlers::cancel_launch_request))
        .layer(middleware::from_fn_with_state(state.clone(), crate::auth::require_candidate));

    let admin_routes = Router::new()
        .route("/api/admin/filesystems", delete(admin_handlers::delete_filesystem))
        .route("/api/admin/candidates", get(admin_handlers::list_candidates))
        .route("/api/admin/candidates", post(admin_handlers::add_candidate))
        .route("/api/admin/candidates", delete(admin_handlers::delete_candidate))
        .route("/api/admin/quota", post(admin_handlers::set_quota))
        .route("/api/admin/settings", get(admin_handlers::get_settings))
        .route("/api/admin/settings", put(admin_handlers::put_settings))
        .layer(middleware::from_fn(admin_handlers::require_admin))
        .layer(middleware::from_fn_with_state(state.clone(), crate::auth::require_candidate));

    let app = Router::new()
        .merge(public_routes)
        .merge(candidate_routes)
        .merge(admin_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let addr: SocketAddr = state
        .config
        .bind_addr
        .parse()
        .map_err(|e| Error::ConfigError(format!("invalid bind address: {e}")))?;
    info!("REST API server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::ConfigError(format!("failed to bind to {addr}: {e}")))?;

    axum::serve(listener, app)
        .await
        .map_err(|e| Error::ConfigError(format!("server error: {e}")))?;

    Ok(())
}
