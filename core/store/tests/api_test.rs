use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use axum::Router;
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tokio::sync::mpsc;
use tower::ServiceExt;
use user_memory_schemas::{InboundMessage, UserId};
use user_memory_store::{
    create_router, ApiKeyConfig, AppState, MemoryLimits, MemoryStore, USER_ID_HEADER,
};

struct TestApp {
    _temp: NamedTempFile,
    store: Arc<MemoryStore>,
    router: Router,
    ingest_rx: mpsc::UnboundedReceiver<InboundMessage>,
}

fn test_app(api_key: Option<&str>) -> TestApp {
    let temp = NamedTempFile::new().unwrap();
    let store = Arc::new(MemoryStore::open(temp.path(), MemoryLimits::default()).unwrap());
    let (ingest_tx, ingest_rx) = mpsc::unbounded_channel();
    let router = create_router(AppState {
        store: store.clone(),
        ingest_tx,
        auth: ApiKeyConfig::new(api_key.map(str::to_string)),
    });
    TestApp {
        _temp: temp,
        store,
        router,
        ingest_rx,
    }
}

fn request(method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(USER_ID_HEADER, "emp-1");
    match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn send(app: &TestApp, request: Request<Body>) -> Response {
    app.router.clone().oneshot(request).await.unwrap()
}

async fn body_json(response: Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_health_needs_no_auth() {
    let app = test_app(Some("secret"));
    let response = send(
        &app,
        Request::builder().uri("/health").body(Body::empty()).unwrap(),
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn test_api_key_and_user_header_required() {
    let app = test_app(Some("secret"));

    let response = send(&app, request("GET", "/memory", None)).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let wrong = Request::builder()
        .uri("/memory")
        .header("authorization", "Bearer nope")
        .header(USER_ID_HEADER, "emp-1")
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&app, wrong).await.status(), StatusCode::UNAUTHORIZED);

    let no_user = Request::builder()
        .uri("/memory")
        .header("authorization", "Bearer secret")
        .body(Body::empty())
        .unwrap();
    let response = send(&app, no_user).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await["code"], "MISSING_USER_ID");

    let ok = Request::builder()
        .uri("/memory")
        .header("authorization", "Bearer secret")
        .header(USER_ID_HEADER, "emp-1")
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&app, ok).await.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_profile_updates_show_in_snapshot() {
    let app = test_app(None);

    let response = send(
        &app,
        request(
            "POST",
            "/memory/employee",
            Some(json!({"full_name": "John Smith", "badge": "B-7"})),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    send(
        &app,
        request("POST", "/memory/team", Some(json!({"team": "Data Conversion"}))),
    )
    .await;
    send(
        &app,
        request(
            "POST",
            "/memory/project",
            Some(json!({"name": "CA WC migration", "status": "blocked"})),
        ),
    )
    .await;
    send(
        &app,
        request(
            "POST",
            "/memory/expertise",
            Some(json!({"states_worked": ["CA", "NY"]})),
        ),
    )
    .await;

    let response = send(&app, request("GET", "/memory", None)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let memory = body_json(response).await;

    assert_eq!(memory["employee_facts"]["full_name"], "John Smith");
    assert_eq!(memory["employee_facts"]["badge"], "B-7");
    assert_eq!(memory["team_info"]["team"], "Data Conversion");
    assert_eq!(memory["active_projects"][0]["status"], "blocked");
    assert_eq!(memory["domain_expertise"]["states_worked"], json!(["CA", "NY"]));
}

#[tokio::test]
async fn test_error_statuses() {
    let app = test_app(None);

    let response = send(
        &app,
        request(
            "POST",
            "/memory/project/complete",
            Some(json!({"name": "ghost"})),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = send(
        &app,
        request(
            "POST",
            "/memory",
            Some(json!({"category": "note", "key": "k", "value": "v", "confidence": 101})),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = send(&app, request("GET", "/memory/entries?category=bogus", None)).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = send(&app, request("POST", "/memory/contexts/missing/close", None)).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_entries_round_trip() {
    let app = test_app(None);

    let response = send(
        &app,
        request(
            "POST",
            "/memory",
            Some(json!({"category": "note", "key": "parking", "value": "Level 3", "tags": ["office"]})),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let recorded = body_json(response).await;
    assert_eq!(recorded["write"], "inserted");
    assert_eq!(recorded["entry"]["confidence"], 100);

    let response = send(&app, request("GET", "/memory/entries?tag=office", None)).await;
    let entries = body_json(response).await;
    assert_eq!(entries.as_array().unwrap().len(), 1);
    assert_eq!(entries[0]["value"], "Level 3");
}

#[tokio::test]
async fn test_conversation_with_context_and_queued_message() {
    let mut app = test_app(None);

    let response = send(
        &app,
        request(
            "POST",
            "/conversations",
            Some(json!({"conversation_id": "conv_a", "context_key": "WC_MIGRATION_2024"})),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let created = body_json(response).await;
    assert_eq!(created["conversation_id"], "conv_a");
    assert_eq!(created["context"]["conversation_ids"], json!(["conv_a"]));
    assert_eq!(created["context"]["kind"], "project");

    let response = send(
        &app,
        request(
            "POST",
            "/conversations/conv_a/messages",
            Some(json!({"content": "I'm John from Data Conversion", "context_key": "WC_MIGRATION_2024"})),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(body_json(response).await["queued"], true);

    let queued = app.ingest_rx.recv().await.unwrap();
    assert_eq!(queued.conversation_id.0, "conv_a");
    assert_eq!(queued.context_key.as_deref(), Some("WC_MIGRATION_2024"));

    let memory = app.store.snapshot(&UserId::from("emp-1")).unwrap();
    assert_eq!(memory.stats.total_conversations, 1);
    assert_eq!(memory.stats.total_messages, 1);
}

#[tokio::test]
async fn test_context_routes() {
    let app = test_app(None);

    let response = send(
        &app,
        request("GET", "/memory/contexts/ISSUE-42?kind=issue&title=Rate%20bug", None),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let context = body_json(response).await;
    assert_eq!(context["kind"], "issue");
    assert_eq!(context["title"], "Rate bug");

    let response = send(&app, request("POST", "/memory/contexts/ISSUE-42/archive", None)).await;
    assert_eq!(body_json(response).await["status"], "archived");

    let response = send(&app, request("GET", "/memory/contexts", None)).await;
    assert_eq!(body_json(response).await.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_erase_removes_user() {
    let app = test_app(None);

    send(
        &app,
        request("POST", "/memory/summary", Some(json!({"topic": "Claims", "resolution": "ok"}))),
    )
    .await;

    let response = send(&app, request("DELETE", "/memory", None)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["erased"], true);
    assert!(!app.store.user_exists(&UserId::from("emp-1")).unwrap());
}
