// Bankgreen - HTTP API
// Public catalog queries plus token-guarded admin actions, served with Axum

mod handlers;
mod middleware;

use crate::config::Settings;
use crate::error::Result;
use axum::{
    middleware::from_fn_with_state,
    routing::{get, patch, post},
    Router,
};
use rusqlite::Connection;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use tower_http::trace::TraceLayer;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Mutex<Connection>>,
    pub settings: Arc<Settings>,
}

impl AppState {
    pub fn new(conn: Connection, settings: Settings) -> Self {
        AppState {
            db: Arc::new(Mutex::new(conn)),
            settings: Arc::new(settings),
        }
    }

    /// The connection stays usable after a panicking handler; SQLite
    /// transactions roll back on drop.
    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.db.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// API Response wrapper
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data,
            error: None,
        }
    }
}

pub(crate) type ApiResult<T> = Result<axum::Json<ApiResponse<T>>>;

pub fn build_router(state: AppState) -> Router {
    let admin = Router::new()
        .route("/records/bulk-delete", post(handlers::bulk_delete))
        .route("/records/bulk-unlink", post(handlers::bulk_unlink))
        .route("/records/:id", patch(handlers::update_record))
        .route("/records/:id/link", post(handlers::link))
        .route("/records/:id/unlink", post(handlers::unlink))
        .route("/records/:id/create-brand", post(handlers::create_brand_from_record))
        .route_layer(from_fn_with_state(state.clone(), middleware::require_admin));

    let api = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/meta", get(handlers::meta))
        .route("/stats", get(handlers::stats))
        .route("/brands", get(handlers::brands))
        .route("/brands/duplicates", get(handlers::duplicates))
        .route("/brands/:tag", get(handlers::brand_detail))
        .route("/datasources/:kind", get(handlers::datasources))
        .route("/datasources/:kind/:id", get(handlers::datasource_detail))
        .route("/datasources/:kind/:id/control", get(handlers::datasource_control))
        .route("/datasources/:kind/:id/suggestions", get(handlers::datasource_suggestions))
        .nest("/admin", admin);

    Router::new()
        .nest("/api", api)
        .layer(from_fn_with_state(state.clone(), middleware::cache_control))
        .layer(from_fn_with_state(state.clone(), middleware::check_allowed_host))
        .layer(middleware::cors_layer(state.settings.clone()))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
