//! Read-only HTTP view of the module registry.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};

use modhost_host::{ModuleInfo, ModuleRegistry};

async fn modules_handler(State(registry): State<Arc<ModuleRegistry>>) -> Json<Vec<ModuleInfo>> {
    Json(registry.list_modules())
}

async fn module_handler(
    State(registry): State<Arc<ModuleRegistry>>,
    Path(name): Path<String>,
) -> Result<Json<ModuleInfo>, StatusCode> {
    registry
        .list_modules()
        .into_iter()
        .find(|info| info.name == name)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

/// Build the diagnostics router over `registry`.
pub fn build_router(registry: Arc<ModuleRegistry>) -> Router {
    Router::new()
        .route("/api/v1/modules", get(modules_handler))
        .route("/api/v1/modules/{name}", get(module_handler))
        .with_state(registry)
}
