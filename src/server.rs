//! HTTP/SSE surface: the streaming turn endpoint plus recovery routes.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_stream::stream;
use axum::extract::{Path, Query, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::config::Config;
use crate::core::engine::TurnEngine;
use crate::core::events::{TurnEvent, TurnEventKind};
use crate::models::{Attachment, Owner, ThreadItem, ThreadRecord};
use crate::reasoner::ChatReasoner;
use crate::session::{SessionError, ThreadSessionManager};
use crate::store::{FileStore, Store, StoreError};
use crate::tools::{BuildParlayTool, OddsBoardTool, StatLookupTool, ToolRegistry, WebSearchTool};

#[derive(Clone)]
pub struct AppState {
    store: Arc<dyn Store>,
    sessions: Arc<ThreadSessionManager>,
    service_key: Option<String>,
}

impl AppState {
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        sessions: Arc<ThreadSessionManager>,
        service_key: Option<String>,
    ) -> Self {
        Self {
            store,
            sessions,
            service_key,
        }
    }
}

#[derive(Debug, Deserialize)]
struct StartTurnRequest {
    thread_id: Option<String>,
    user_message: String,
}

#[derive(Debug, Deserialize)]
struct ItemsQuery {
    after_position: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct CreateAttachmentRequest {
    thread_id: Option<String>,
    content_kind: String,
    size_bytes: u64,
    locator: String,
}

#[derive(Debug, Serialize)]
struct ThreadDetailResponse {
    thread: ThreadRecord,
    items: Vec<ThreadItem>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
}

/// Boot the full stack from config and serve until shutdown.
pub async fn run_http_server(config: Config) -> Result<()> {
    let store: Arc<dyn Store> = Arc::new(FileStore::new(&config.data_dir)?);
    let client = reqwest::Client::new();
    let registry = Arc::new(
        ToolRegistry::builder()
            .register(Arc::new(WebSearchTool::new(
                client.clone(),
                config.tools.web_search_url.clone(),
            )))
            .register(Arc::new(StatLookupTool::new(
                client.clone(),
                config.tools.stats_url.clone(),
            )))
            .register(Arc::new(OddsBoardTool::new(
                client.clone(),
                config.tools.odds_url.clone(),
            )))
            .register(Arc::new(BuildParlayTool))
            .build(),
    );
    let reasoner = Arc::new(ChatReasoner::new(
        client,
        config.base_url.clone(),
        config.api_key.clone(),
        config.model.clone(),
        config.retry_policy(),
    ));
    let engine = Arc::new(TurnEngine::new(
        Arc::clone(&store),
        reasoner,
        registry,
        config.tool_timeout(),
    ));
    let sessions = Arc::new(ThreadSessionManager::new(engine, Arc::clone(&store)));

    let state = AppState::new(store, sessions, config.service_key.clone());
    let app = build_router(state, &config.cors_origins);

    let addr: SocketAddr = config
        .bind_addr()
        .parse()
        .with_context(|| format!("invalid bind address '{}'", config.bind_addr()))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "listening");
    axum::serve(listener, app)
        .await
        .map_err(|e| anyhow!("server error: {e}"))
}

pub fn build_router(state: AppState, cors_origins: &[String]) -> Router {
    Router::new()
        .route("/", get(root_info))
        .route("/health", get(health))
        .route("/v1/turns", post(start_turn))
        .route("/v1/turns/{thread_id}/cancel", post(cancel_turn))
        .route("/v1/threads", get(list_threads))
        .route("/v1/threads/{id}", get(get_thread).delete(delete_thread))
        .route("/v1/threads/{id}/events", get(stream_thread_events))
        .route("/v1/threads/{id}/items", get(list_items))
        .route("/v1/threads/{id}/attachments", get(list_attachments))
        .route("/v1/attachments", post(create_attachment))
        .layer(cors_layer(cors_origins))
        .with_state(state)
}

async fn root_info() -> Json<serde_json::Value> {
    Json(json!({
        "service": "parleylock",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": ["/health", "/v1/turns", "/v1/threads"],
    }))
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "parleylock",
    })
}

/// Resolve caller identity from `x-user-id` and an optional service bearer.
fn caller_identity(headers: &HeaderMap, service_key: Option<&str>) -> Result<Owner, ApiError> {
    let user_id = headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::unauthorized("x-user-id header is required"))?;

    let bearer = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    let is_service = matches!((bearer, service_key), (Some(token), Some(key)) if token == key);

    Ok(if is_service {
        Owner::service(user_id)
    } else {
        Owner::user(user_id)
    })
}

async fn start_turn(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<StartTurnRequest>,
) -> Result<Sse<impl futures_util::Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let owner = caller_identity(&headers, state.service_key.as_deref())?;
    if req.user_message.trim().is_empty() {
        return Err(ApiError::bad_request("user_message is required"));
    }

    let mut handle = state
        .sessions
        .start_turn(owner, req.thread_id, req.user_message)
        .await
        .map_err(map_session_err)?;

    let stream = stream! {
        while let Some(event) = handle.events.recv().await {
            let terminal = event.kind.is_terminal();
            yield Ok(sse_event(&event));
            if terminal {
                break;
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    ))
}

/// Reattach to the in-flight turn on a thread. The live feed only carries
/// events emitted after attachment; pair it with `/items?after_position=`
/// to backfill what was missed.
async fn stream_thread_events(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Sse<impl futures_util::Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let owner = caller_identity(&headers, state.service_key.as_deref())?;
    state
        .store
        .load_thread(&owner, &id)
        .await
        .map_err(map_store_err)?;

    // Subscribe before the activity check so the terminal event cannot slip
    // between the two.
    let rx = state.sessions.subscribe();
    if !state.sessions.has_active_turn(&id).await {
        return Err(ApiError::conflict(format!(
            "thread {id} has no active turn"
        )));
    }

    let stream = live_turn_events(Arc::clone(&state.sessions), id, rx);
    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    ))
}

/// Forward fanout events for one thread until its terminal event. A lagged
/// receiver may have dropped that terminal event, so a lag while the thread
/// is idle ends the stream instead of waiting on keepalives forever.
fn live_turn_events(
    sessions: Arc<ThreadSessionManager>,
    thread_id: String,
    mut rx: broadcast::Receiver<TurnEvent>,
) -> impl futures_util::Stream<Item = Result<SseEvent, Infallible>> {
    stream! {
        loop {
            match rx.recv().await {
                Ok(event) if event.thread_id == thread_id => {
                    let terminal = event.kind.is_terminal();
                    yield Ok(sse_event(&event));
                    if terminal {
                        break;
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    if !sessions.has_active_turn(&thread_id).await {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

async fn cancel_turn(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(thread_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let owner = caller_identity(&headers, state.service_key.as_deref())?;
    // Ownership check before touching the active map.
    state
        .store
        .load_thread(&owner, &thread_id)
        .await
        .map_err(map_store_err)?;
    if !state.sessions.cancel_turn(&thread_id).await {
        return Err(ApiError::conflict(format!(
            "thread {thread_id} has no active turn"
        )));
    }
    Ok(Json(json!({"cancelled": true, "thread_id": thread_id})))
}

async fn list_threads(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<ThreadRecord>>, ApiError> {
    let owner = caller_identity(&headers, state.service_key.as_deref())?;
    let threads = state
        .store
        .list_threads(&owner)
        .await
        .map_err(map_store_err)?;
    Ok(Json(threads))
}

async fn get_thread(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<ThreadDetailResponse>, ApiError> {
    let owner = caller_identity(&headers, state.service_key.as_deref())?;
    let thread = state
        .store
        .load_thread(&owner, &id)
        .await
        .map_err(map_store_err)?;
    let items = state
        .store
        .list_items(&owner, &id, None)
        .await
        .map_err(map_store_err)?;
    Ok(Json(ThreadDetailResponse { thread, items }))
}

async fn delete_thread(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let owner = caller_identity(&headers, state.service_key.as_deref())?;
    if state.sessions.has_active_turn(&id).await {
        return Err(ApiError::conflict(format!(
            "thread {id} has an active turn"
        )));
    }
    state
        .store
        .delete_thread(&owner, &id)
        .await
        .map_err(map_store_err)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_items(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<ItemsQuery>,
) -> Result<Json<Vec<ThreadItem>>, ApiError> {
    let owner = caller_identity(&headers, state.service_key.as_deref())?;
    let items = state
        .store
        .list_items(&owner, &id, query.after_position)
        .await
        .map_err(map_store_err)?;
    Ok(Json(items))
}

async fn list_attachments(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Vec<Attachment>>, ApiError> {
    let owner = caller_identity(&headers, state.service_key.as_deref())?;
    let attachments = state
        .store
        .list_attachments(&owner, &id)
        .await
        .map_err(map_store_err)?;
    Ok(Json(attachments))
}

async fn create_attachment(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateAttachmentRequest>,
) -> Result<(StatusCode, Json<Attachment>), ApiError> {
    let owner = caller_identity(&headers, state.service_key.as_deref())?;
    if req.content_kind.trim().is_empty() || req.locator.trim().is_empty() {
        return Err(ApiError::bad_request("content_kind and locator are required"));
    }
    let attachment = Attachment::new(
        &owner,
        req.thread_id,
        req.content_kind,
        req.size_bytes,
        req.locator,
    );
    state
        .store
        .create_attachment(&owner, &attachment)
        .await
        .map_err(map_store_err)?;
    Ok((StatusCode::CREATED, Json(attachment)))
}

fn sse_event(event: &TurnEvent) -> SseEvent {
    let name = match &event.kind {
        TurnEventKind::ItemCreated { .. } => "item_created",
        TurnEventKind::WidgetPatched { .. } => "widget_patched",
        TurnEventKind::ItemFinalized { .. } => "item_finalized",
        TurnEventKind::TurnError { .. } => "turn_error",
        TurnEventKind::TurnComplete { .. } => "turn_complete",
    };
    let data = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    SseEvent::default().event(name).data(data)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);
    if origins.is_empty() {
        layer.allow_origin(Any)
    } else {
        let parsed: Vec<HeaderValue> = origins
            .iter()
            .filter_map(|o| HeaderValue::from_str(o).ok())
            .collect();
        layer.allow_origin(parsed)
    }
}

fn map_store_err(err: StoreError) -> ApiError {
    match err {
        StoreError::NotFound(what) => ApiError::not_found(format!("{what} not found")),
        StoreError::PermissionDenied => ApiError {
            status: StatusCode::FORBIDDEN,
            message: "permission denied".to_string(),
        },
        other => ApiError::internal(other.to_string()),
    }
}

fn map_session_err(err: SessionError) -> ApiError {
    match err {
        SessionError::TurnInProgress => ApiError::conflict(err.to_string()),
        SessionError::Store(store) => map_store_err(store),
    }
}

#[derive(Debug, Clone)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn conflict(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({
                "error": {
                    "message": self.message,
                    "status": self.status.as_u16(),
                }
            })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reasoner::{Decision, ReasonerError, ScriptedReasoner, ToolCallRequest};
    use crate::tools::{ToolContext, ToolError, ToolResult, ToolSpec};
    use anyhow::{Context as _, bail};
    use async_trait::async_trait;
    use futures_util::StreamExt;
    use serde_json::Value;
    use tempfile::TempDir;

    struct StallStub;

    #[async_trait]
    impl ToolSpec for StallStub {
        fn name(&self) -> &str {
            "stall_stub"
        }

        fn description(&self) -> &str {
            "holds a turn open"
        }

        fn input_schema(&self) -> Value {
            json!({"type": "object"})
        }

        async fn execute(
            &self,
            _input: Value,
            _ctx: &ToolContext,
        ) -> Result<ToolResult, ToolError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(ToolResult::new(json!({}), "never"))
        }
    }

    async fn spawn_test_server(
        script: Vec<Result<Decision, ReasonerError>>,
    ) -> Result<(SocketAddr, TempDir, tokio::task::JoinHandle<()>)> {
        let dir = TempDir::new()?;
        let store: Arc<dyn Store> = Arc::new(FileStore::new(dir.path())?);
        let registry = Arc::new(
            ToolRegistry::builder()
                .register(Arc::new(BuildParlayTool))
                .register(Arc::new(StallStub))
                .build(),
        );
        let engine = Arc::new(TurnEngine::new(
            Arc::clone(&store),
            Arc::new(ScriptedReasoner::new(script)),
            registry,
            Duration::from_secs(3600),
        ));
        let sessions = Arc::new(ThreadSessionManager::new(engine, Arc::clone(&store)));
        let state = AppState::new(store, sessions, Some("svc-key".to_string()));
        let app = build_router(state, &[]);

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Ok((addr, dir, handle))
    }

    /// Read SSE frames until a terminal turn event arrives.
    async fn read_turn_events(resp: reqwest::Response) -> Result<Vec<(String, Value)>> {
        let mut stream = resp.bytes_stream();
        let mut buf = String::new();
        let mut events = Vec::new();
        loop {
            let chunk = tokio::time::timeout(Duration::from_secs(5), stream.next())
                .await
                .context("timed out waiting for SSE frame")?
                .context("SSE stream ended before a terminal event")??;
            buf.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(idx) = buf.find("\n\n") {
                let frame = buf[..idx].to_string();
                buf.drain(..idx + 2);
                let Some((name, payload)) = parse_sse_frame(&frame) else {
                    continue;
                };
                let terminal = name == "turn_complete" || name == "turn_error";
                events.push((name, payload));
                if terminal {
                    return Ok(events);
                }
            }
            if buf.len() > 256 * 1024 {
                bail!("SSE buffer exceeded 256KB without terminal event");
            }
        }
    }

    fn parse_sse_frame(frame: &str) -> Option<(String, Value)> {
        let mut name = None;
        let mut data_lines = Vec::new();
        for line in frame.lines() {
            if let Some(rest) = line.strip_prefix("event:") {
                name = Some(rest.trim().to_string());
            } else if let Some(rest) = line.strip_prefix("data:") {
                data_lines.push(rest.trim_start().to_string());
            }
        }
        let name = name?;
        let payload = serde_json::from_str(&data_lines.join("\n")).ok()?;
        Some((name, payload))
    }

    #[tokio::test]
    async fn health_works() -> Result<()> {
        let (addr, _dir, handle) = spawn_test_server(vec![]).await?;
        let health: Value = reqwest::Client::new()
            .get(format!("http://{addr}/health"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        assert_eq!(health["status"], "ok");
        handle.abort();
        Ok(())
    }

    #[tokio::test]
    async fn missing_user_header_is_unauthorized() -> Result<()> {
        let (addr, _dir, handle) = spawn_test_server(vec![]).await?;
        let resp = reqwest::Client::new()
            .post(format!("http://{addr}/v1/turns"))
            .json(&json!({"user_message": "hi"}))
            .send()
            .await?;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        handle.abort();
        Ok(())
    }

    #[tokio::test]
    async fn turn_streams_ordered_events_to_completion() -> Result<()> {
        let (addr, _dir, handle) = spawn_test_server(vec![
            Ok(Decision::ToolCalls(vec![ToolCallRequest {
                invocation_id: "inv_1".to_string(),
                tool: "build_parlay".to_string(),
                arguments: json!({"legs": [{"pick": "Heat ML", "odds": 120}], "stake": 10.0}),
            }])),
            Ok(Decision::Reply("One-leg parlay built.".to_string())),
        ])
        .await?;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("http://{addr}/v1/turns"))
            .header("x-user-id", "u1")
            .json(&json!({"user_message": "build me a parlay"}))
            .send()
            .await?
            .error_for_status()?;
        let events = read_turn_events(resp).await?;

        let names: Vec<&str> = events.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names.first(), Some(&"item_created"));
        assert_eq!(names.last(), Some(&"turn_complete"));
        assert!(names.contains(&"widget_patched"));
        assert!(names.contains(&"item_finalized"));

        let seqs: Vec<u64> = events
            .iter()
            .filter_map(|(_, p)| p["seq"].as_u64())
            .collect();
        assert!(seqs.windows(2).all(|w| w[0] < w[1]));

        // Recovery: the persisted timeline is readable afterwards.
        let thread_id = events[0].1["thread_id"].as_str().unwrap().to_string();
        let items: Vec<Value> = client
            .get(format!("http://{addr}/v1/threads/{thread_id}/items"))
            .header("x-user-id", "u1")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        assert!(items.len() >= 3);
        let after: Vec<Value> = client
            .get(format!(
                "http://{addr}/v1/threads/{thread_id}/items?after_position=1"
            ))
            .header("x-user-id", "u1")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        assert_eq!(after.len(), items.len() - 1);

        handle.abort();
        Ok(())
    }

    #[tokio::test]
    async fn busy_thread_conflicts_and_cancel_frees_it() -> Result<()> {
        let (addr, _dir, handle) = spawn_test_server(vec![Ok(Decision::ToolCalls(vec![
            ToolCallRequest {
                invocation_id: "inv_1".to_string(),
                tool: "stall_stub".to_string(),
                arguments: json!({}),
            },
        ]))])
        .await?;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("http://{addr}/v1/turns"))
            .header("x-user-id", "u1")
            .json(&json!({"user_message": "hang"}))
            .send()
            .await?
            .error_for_status()?;
        // First frame carries the thread id; the stream stays open after it.
        let mut stream = resp.bytes_stream();
        let chunk = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .context("no first frame")?
            .context("stream closed")??;
        let text = String::from_utf8_lossy(&chunk);
        let frame = text.split("\n\n").next().unwrap_or_default();
        let (_, payload) = parse_sse_frame(frame).context("unparseable frame")?;
        let thread_id = payload["thread_id"].as_str().unwrap().to_string();

        let conflict = client
            .post(format!("http://{addr}/v1/turns"))
            .header("x-user-id", "u1")
            .json(&json!({"thread_id": thread_id, "user_message": "again"}))
            .send()
            .await?;
        assert_eq!(conflict.status(), StatusCode::CONFLICT);

        let cancelled: Value = client
            .post(format!("http://{addr}/v1/turns/{thread_id}/cancel"))
            .header("x-user-id", "u1")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        assert_eq!(cancelled["cancelled"], true);

        handle.abort();
        Ok(())
    }

    async fn wait_idle(sessions: &ThreadSessionManager, thread_id: &str) {
        for _ in 0..200 {
            if !sessions.has_active_turn(thread_id).await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("turn on {thread_id} never went idle");
    }

    #[tokio::test]
    async fn lagged_live_feed_ends_instead_of_hanging() -> Result<()> {
        let dir = TempDir::new()?;
        let store: Arc<dyn Store> = Arc::new(FileStore::new(dir.path())?);
        let registry = Arc::new(ToolRegistry::builder().register(Arc::new(StallStub)).build());
        let engine = Arc::new(TurnEngine::new(
            Arc::clone(&store),
            Arc::new(ScriptedReasoner::new(vec![Ok(Decision::ToolCalls(vec![
                ToolCallRequest {
                    invocation_id: "inv_1".to_string(),
                    tool: "stall_stub".to_string(),
                    arguments: json!({}),
                },
            ]))])),
            registry,
            Duration::from_secs(3600),
        ));
        let sessions = Arc::new(ThreadSessionManager::new(engine, Arc::clone(&store)));
        let owner = Owner::user("u1");

        let handle = sessions
            .start_turn(owner.clone(), None, "hang".to_string())
            .await?;
        let rx = sessions.subscribe();
        assert!(sessions.cancel_turn(&handle.thread_id).await);
        wait_idle(&sessions, &handle.thread_id).await;

        // Push the fanout well past its buffer while the receiver sits
        // unread, dropping the cancelled turn's terminal event.
        for _ in 0..100 {
            let noise = sessions
                .start_turn(owner.clone(), None, "noise".to_string())
                .await?;
            wait_idle(&sessions, &noise.thread_id).await;
        }

        let feed = live_turn_events(Arc::clone(&sessions), handle.thread_id.clone(), rx);
        let mut feed = Box::pin(feed);
        let next = tokio::time::timeout(Duration::from_secs(5), feed.next())
            .await
            .context("lagged feed hung instead of ending")?;
        assert!(next.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn live_feed_reattaches_until_terminal() -> Result<()> {
        let (addr, _dir, handle) = spawn_test_server(vec![Ok(Decision::ToolCalls(vec![
            ToolCallRequest {
                invocation_id: "inv_1".to_string(),
                tool: "stall_stub".to_string(),
                arguments: json!({}),
            },
        ]))])
        .await?;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("http://{addr}/v1/turns"))
            .header("x-user-id", "u1")
            .json(&json!({"user_message": "hang"}))
            .send()
            .await?
            .error_for_status()?;
        let mut stream = resp.bytes_stream();
        let chunk = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .context("no first frame")?
            .context("stream closed")??;
        let text = String::from_utf8_lossy(&chunk);
        let frame = text.split("\n\n").next().unwrap_or_default();
        let (_, payload) = parse_sse_frame(frame).context("unparseable frame")?;
        let thread_id = payload["thread_id"].as_str().unwrap().to_string();

        // Second client reattaches while the tool is still running.
        let live = client
            .get(format!("http://{addr}/v1/threads/{thread_id}/events"))
            .header("x-user-id", "u1")
            .send()
            .await?
            .error_for_status()?;

        client
            .post(format!("http://{addr}/v1/turns/{thread_id}/cancel"))
            .header("x-user-id", "u1")
            .send()
            .await?
            .error_for_status()?;

        let events = read_turn_events(live).await?;
        assert_eq!(
            events.last().map(|(n, _)| n.as_str()),
            Some("turn_error")
        );

        // Once the turn is gone the live feed refuses to attach. The active
        // entry is cleared just after the terminal event, so poll briefly.
        let mut idle_status = StatusCode::OK;
        for _ in 0..100 {
            idle_status = client
                .get(format!("http://{addr}/v1/threads/{thread_id}/events"))
                .header("x-user-id", "u1")
                .send()
                .await?
                .status();
            if idle_status == StatusCode::CONFLICT {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(idle_status, StatusCode::CONFLICT);

        handle.abort();
        Ok(())
    }

    #[tokio::test]
    async fn owner_scoping_hides_threads_from_strangers() -> Result<()> {
        let (addr, _dir, handle) = spawn_test_server(vec![Ok(Decision::Reply(
            "done".to_string(),
        ))])
        .await?;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("http://{addr}/v1/turns"))
            .header("x-user-id", "u1")
            .json(&json!({"user_message": "mine"}))
            .send()
            .await?
            .error_for_status()?;
        let events = read_turn_events(resp).await?;
        let thread_id = events[0].1["thread_id"].as_str().unwrap().to_string();

        let stranger = client
            .get(format!("http://{addr}/v1/threads/{thread_id}"))
            .header("x-user-id", "u2")
            .send()
            .await?;
        assert_eq!(stranger.status(), StatusCode::FORBIDDEN);

        // Service bearer sees everything.
        let service = client
            .get(format!("http://{addr}/v1/threads/{thread_id}"))
            .header("x-user-id", "ops")
            .header("authorization", "Bearer svc-key")
            .send()
            .await?;
        assert_eq!(service.status(), StatusCode::OK);

        handle.abort();
        Ok(())
    }

    #[tokio::test]
    async fn delete_thread_then_not_found() -> Result<()> {
        let (addr, _dir, handle) =
            spawn_test_server(vec![Ok(Decision::Reply("done".to_string()))]).await?;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("http://{addr}/v1/turns"))
            .header("x-user-id", "u1")
            .json(&json!({"user_message": "short lived"}))
            .send()
            .await?
            .error_for_status()?;
        let events = read_turn_events(resp).await?;
        let thread_id = events[0].1["thread_id"].as_str().unwrap().to_string();

        let deleted = client
            .delete(format!("http://{addr}/v1/threads/{thread_id}"))
            .header("x-user-id", "u1")
            .send()
            .await?;
        assert_eq!(deleted.status(), StatusCode::NO_CONTENT);

        let gone = client
            .get(format!("http://{addr}/v1/threads/{thread_id}"))
            .header("x-user-id", "u1")
            .send()
            .await?;
        assert_eq!(gone.status(), StatusCode::NOT_FOUND);

        handle.abort();
        Ok(())
    }

    #[tokio::test]
    async fn attachments_round_trip() -> Result<()> {
        let (addr, _dir, handle) =
            spawn_test_server(vec![Ok(Decision::Reply("done".to_string()))]).await?;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("http://{addr}/v1/turns"))
            .header("x-user-id", "u1")
            .json(&json!({"user_message": "with attachment"}))
            .send()
            .await?
            .error_for_status()?;
        let events = read_turn_events(resp).await?;
        let thread_id = events[0].1["thread_id"].as_str().unwrap().to_string();

        let created: Value = client
            .post(format!("http://{addr}/v1/attachments"))
            .header("x-user-id", "u1")
            .json(&json!({
                "thread_id": thread_id,
                "content_kind": "image/png",
                "size_bytes": 2048,
                "locator": "blob://slip.png"
            }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        assert!(created["id"].as_str().unwrap().starts_with("att_"));

        let listed: Vec<Value> = client
            .get(format!("http://{addr}/v1/threads/{thread_id}/attachments"))
            .header("x-user-id", "u1")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        assert_eq!(listed.len(), 1);

        handle.abort();
        Ok(())
    }
}
