use axum::{
    extract::{FromRef, Json, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error};
use user_memory_schemas::ContextRequest;
use user_memory_store::{ApiKeyConfig, AuthUser, MemoryStore};

use crate::composer::Composer;

#[derive(Clone)]
pub struct ComposerState {
    pub composer: Arc<Composer>,
    pub store: Arc<MemoryStore>,
    pub auth: ApiKeyConfig,
}

impl FromRef<ComposerState> for Arc<MemoryStore> {
    fn from_ref(state: &ComposerState) -> Self {
        state.store.clone()
    }
}

impl FromRef<ComposerState> for ApiKeyConfig {
    fn from_ref(state: &ComposerState) -> Self {
        state.auth.clone()
    }
}

pub fn create_router(state: ComposerState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/v1/context", post(get_context))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "service": "user-memory-composer",
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn get_context(
    State(state): State<ComposerState>,
    AuthUser(user_id): AuthUser,
    Json(request): Json<ContextRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    debug!(
        user_id = %user_id,
        context_key = request.context_key.as_deref().unwrap_or("-"),
        budget = request.budget_tokens,
        "Context request"
    );

    let context = tokio::task::spawn_blocking(move || {
        state.composer.compose(&state.store, &user_id, &request)
    })
    .await
    .map_err(|e| {
        error!("Context assembly task failed: {}", e);
        (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })?;

    Ok(Json(context))
}
