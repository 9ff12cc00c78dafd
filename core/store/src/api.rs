//! REST surface of the memory store.

use axum::{
    extract::{FromRef, Json, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use user_memory_schemas::{
    generate_conversation_id, CompleteProjectRequest, ContextContribution, ContextKind,
    ConversationCreate, ConversationCreated, ConversationId, DomainExpertise, EmployeeFacts,
    EntryFilter, InboundMessage, MemoryCategory, MessageCreate, NewMemoryEntry, NotesRequest,
    ProjectUpdate, SummaryRequest, TeamInfo,
};

use crate::auth::{ApiKeyConfig, AuthUser};
use crate::database::MemoryStore;
use crate::error::MemoryError;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<MemoryStore>,
    pub ingest_tx: mpsc::UnboundedSender<InboundMessage>,
    pub auth: ApiKeyConfig,
}

impl FromRef<AppState> for Arc<MemoryStore> {
    fn from_ref(state: &AppState) -> Self {
        state.store.clone()
    }
}

impl FromRef<AppState> for ApiKeyConfig {
    fn from_ref(state: &AppState) -> Self {
        state.auth.clone()
    }
}

type ApiResult<T> = Result<T, (StatusCode, String)>;

/// Run a store call on the blocking pool. SQLite calls and per-user lock
/// waits never run on the async workers.
pub async fn blocking<T, F>(store: Arc<MemoryStore>, op: F) -> ApiResult<T>
where
    F: FnOnce(&MemoryStore) -> crate::error::Result<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(move || op(&store)).await {
        Ok(result) => result.map_err(error_response),
        Err(e) => {
            error!("Store task failed: {}", e);
            Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
        }
    }
}

/// Map a store error onto an HTTP status, logging it at a matching level.
pub fn error_response(err: MemoryError) -> (StatusCode, String) {
    let status = match err {
        MemoryError::NotFound(_) => StatusCode::NOT_FOUND,
        MemoryError::Validation(_) => StatusCode::BAD_REQUEST,
        MemoryError::StorageUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        MemoryError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        error!("Request failed: {}", err);
    } else {
        warn!("Request rejected: {}", err);
    }
    (status, err.to_string())
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route(
            "/memory",
            get(get_memory).post(record_entry).delete(erase_memory),
        )
        .route("/memory/entries", get(list_entries))
        .route("/memory/employee", post(update_employee))
        .route("/memory/team", post(update_team))
        .route("/memory/project", post(add_project))
        .route("/memory/project/complete", post(complete_project))
        .route("/memory/summary", post(add_summary))
        .route("/memory/expertise", post(update_expertise))
        .route("/memory/preferences", post(update_preferences))
        .route("/memory/notes", post(set_notes))
        // Conversation contexts
        .route("/memory/contexts", get(list_contexts))
        .route("/memory/contexts/:key", get(get_context))
        .route("/memory/contexts/:key/close", post(close_context))
        .route("/memory/contexts/:key/archive", post(archive_context))
        // Conversations
        .route("/conversations", post(create_conversation))
        .route("/conversations/:id/messages", post(post_message))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "service": "user-memory-store",
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

// ============================================================================
// User Memory
// ============================================================================

async fn get_memory(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> ApiResult<impl IntoResponse> {
    let memory = blocking(state.store, move |store| store.get_or_create(&user_id)).await?;
    Ok(Json(memory))
}

async fn erase_memory(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> ApiResult<impl IntoResponse> {
    let erasure = blocking(state.store, move |store| store.erase_user(&user_id)).await?;
    Ok(Json(serde_json::json!({
        "erased": true,
        "entries": erasure.entries,
        "contexts": erasure.contexts
    })))
}

async fn record_entry(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Json(entry): Json<NewMemoryEntry>,
) -> ApiResult<impl IntoResponse> {
    let recorded = blocking(state.store, move |store| {
        store.record_memory_entry(&user_id, &entry)
    })
    .await?;
    Ok(Json(recorded))
}

#[derive(Debug, Default, Deserialize)]
struct EntriesQuery {
    category: Option<String>,
    tag: Option<String>,
}

async fn list_entries(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Query(query): Query<EntriesQuery>,
) -> ApiResult<impl IntoResponse> {
    let category = match query.category.as_deref() {
        Some(raw) => Some(MemoryCategory::parse(raw).ok_or_else(|| {
            (
                StatusCode::BAD_REQUEST,
                format!("unknown category: {}", raw),
            )
        })?),
        None => None,
    };
    let filter = EntryFilter {
        category,
        tag: query.tag,
    };

    let entries = blocking(state.store, move |store| {
        store.list_memory_entries(&user_id, &filter)
    })
    .await?;
    Ok(Json(entries))
}

async fn update_employee(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Json(facts): Json<EmployeeFacts>,
) -> ApiResult<impl IntoResponse> {
    let memory = blocking(state.store, move |store| {
        store.upsert_employee_facts(&user_id, facts)
    })
    .await?;
    Ok(Json(memory))
}

async fn update_team(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Json(team): Json<TeamInfo>,
) -> ApiResult<impl IntoResponse> {
    let memory = blocking(state.store, move |store| store.upsert_team_info(&user_id, team)).await?;
    Ok(Json(memory))
}

async fn add_project(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Json(update): Json<ProjectUpdate>,
) -> ApiResult<impl IntoResponse> {
    let memory = blocking(state.store, move |store| {
        store.add_active_project(&user_id, &update)
    })
    .await?;
    Ok(Json(memory))
}

async fn complete_project(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Json(request): Json<CompleteProjectRequest>,
) -> ApiResult<impl IntoResponse> {
    let memory = blocking(state.store, move |store| {
        store.complete_project(&user_id, &request.name, request.outcome)
    })
    .await?;
    Ok(Json(memory))
}

async fn add_summary(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Json(request): Json<SummaryRequest>,
) -> ApiResult<impl IntoResponse> {
    let memory = blocking(state.store, move |store| {
        store.add_conversation_summary(&user_id, &request.topic, &request.resolution)
    })
    .await?;
    Ok(Json(memory))
}

async fn update_expertise(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Json(expertise): Json<DomainExpertise>,
) -> ApiResult<impl IntoResponse> {
    let memory = blocking(state.store, move |store| {
        store.update_domain_expertise(&user_id, expertise)
    })
    .await?;
    Ok(Json(memory))
}

async fn update_preferences(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Json(preferences): Json<BTreeMap<String, String>>,
) -> ApiResult<impl IntoResponse> {
    let memory = blocking(state.store, move |store| {
        store.update_tech_preferences(&user_id, preferences)
    })
    .await?;
    Ok(Json(memory))
}

async fn set_notes(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Json(request): Json<NotesRequest>,
) -> ApiResult<impl IntoResponse> {
    let memory = blocking(state.store, move |store| {
        store.set_custom_notes(&user_id, request.notes)
    })
    .await?;
    Ok(Json(memory))
}

// ============================================================================
// Conversation Contexts
// ============================================================================

async fn list_contexts(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> ApiResult<impl IntoResponse> {
    let contexts = blocking(state.store, move |store| store.list_contexts(&user_id)).await?;
    Ok(Json(contexts))
}

#[derive(Debug, Default, Deserialize)]
struct ContextQuery {
    kind: Option<ContextKind>,
    title: Option<String>,
}

async fn get_context(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(key): Path<String>,
    Query(query): Query<ContextQuery>,
) -> ApiResult<impl IntoResponse> {
    let context = blocking(state.store, move |store| {
        store.get_or_create_context(&user_id, &key, query.kind, query.title.as_deref())
    })
    .await?;
    Ok(Json(context))
}

async fn close_context(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(key): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let context = blocking(state.store, move |store| store.close_context(&user_id, &key)).await?;
    Ok(Json(context))
}

async fn archive_context(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(key): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let context =
        blocking(state.store, move |store| store.archive_context(&user_id, &key)).await?;
    Ok(Json(context))
}

// ============================================================================
// Conversations
// ============================================================================

async fn create_conversation(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    body: Option<Json<ConversationCreate>>,
) -> ApiResult<impl IntoResponse> {
    let request = body.map(|Json(request)| request).unwrap_or_default();
    let conversation_id = request
        .conversation_id
        .clone()
        .unwrap_or_else(generate_conversation_id);

    let context = {
        let user_id = user_id.clone();
        let conversation_id = conversation_id.clone();
        let request = request.clone();
        blocking(state.store, move |store| {
            store.record_conversation_started(&user_id)?;
            match request.context_key.as_deref() {
                Some(key) => {
                    store.get_or_create_context(
                        &user_id,
                        key,
                        request.context_kind,
                        request.title.as_deref(),
                    )?;
                    let context = store.append_to_context(
                        &user_id,
                        key,
                        &conversation_id,
                        ContextContribution::default(),
                    )?;
                    Ok(Some(context))
                }
                None => Ok(None),
            }
        })
        .await?
    };

    info!(
        user_id = %user_id,
        conversation_id = %conversation_id,
        context_key = request.context_key.as_deref().unwrap_or("-"),
        "Started conversation"
    );

    Ok((
        StatusCode::CREATED,
        Json(ConversationCreated {
            conversation_id,
            context,
        }),
    ))
}

/// Record the interaction and queue the message for fact extraction. Memory
/// failures are logged; they never fail the conversation turn.
async fn post_message(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(conversation_id): Path<String>,
    Json(body): Json<MessageCreate>,
) -> ApiResult<impl IntoResponse> {
    if body.content.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "message content must not be empty".to_string(),
        ));
    }

    // Failures are already logged by `blocking`.
    let recorded = {
        let user_id = user_id.clone();
        blocking(state.store.clone(), move |store| store.record_interaction(&user_id))
            .await
            .is_ok()
    };

    let conversation_id = ConversationId(conversation_id);
    let message = InboundMessage {
        user_id,
        conversation_id: conversation_id.clone(),
        content: body.content,
        context_key: body.context_key,
        received_at: Utc::now().to_rfc3339(),
    };
    let queued = match state.ingest_tx.send(message) {
        Ok(()) => true,
        Err(_) => {
            warn!(conversation_id = %conversation_id, "Ingestion worker unavailable");
            false
        }
    };

    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "conversation_id": conversation_id,
            "interaction_recorded": recorded,
            "queued": queued
        })),
    ))
}
