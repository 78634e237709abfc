//! HTTP server implementation using Axum.

use crate::autosave::{AutosaveContext, AutosaveData, Autosaver, EventSink};
use crate::error::Result;
use crate::proxy::ProxyRequest;
use crate::session::{Phase, SandboxSession, SessionSnapshot, SessionState};
use crate::state::{AppState, PreviewSession, Sessions, SESSION_TTL_SECS};
use crate::tree::TreeNode;
use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::Response,
    routing::{any, get},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::interval;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Cookie carrying the session token when no Authorization header is sent.
pub const SESSION_COOKIE: &str = "exambox_session";

#[derive(Deserialize)]
struct CreatePreviewRequest {
    tree: TreeNode,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreatePreviewResponse {
    session_id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PreviewInfo {
    id: String,
    phase: Phase,
    preview_url: String,
    loading: bool,
    age_secs: u64,
    idle_secs: u64,
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        // Backend proxy
        .route("/api/:endpoint", any(proxy_api))
        // Preview sessions
        .route("/previews", get(list_previews).post(create_preview))
        .route("/previews/:id", get(get_preview).delete(delete_preview))
        .route("/previews/:id/terminal", get(terminal_socket))
        // Autosave relay
        .route("/autosave", get(autosave_socket))
        // Health check
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the HTTP server on the given port with the provided state.
pub async fn run_server(port: u16, state: AppState) -> Result<()> {
    // Spawn cleanup task
    let sessions_clone = state.sessions.clone();
    tokio::spawn(async move {
        let mut interval = interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            cleanup_expired_sessions(&sessions_clone).await;
        }
    });

    let app = router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health() -> &'static str {
    "OK"
}

async fn proxy_api(
    State(state): State<AppState>,
    Path(endpoint): Path<String>,
    Query(query): Query<Vec<(String, String)>>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<Value>) {
    let req = ProxyRequest {
        segment: endpoint,
        query,
        token: session_token(&headers),
        body,
    };
    let (status, body) = state.proxy.forward(req).await;
    (status, Json(body))
}

/// Bearer token from the Authorization header, else the session cookie.
pub fn session_token(headers: &HeaderMap) -> Option<String> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty());
    if let Some(token) = bearer {
        return Some(token.to_string());
    }
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, value)| *name == SESSION_COOKIE && !value.is_empty())
        .map(|(_, value)| value.to_string())
}

async fn create_preview(
    State(state): State<AppState>,
    Json(req): Json<CreatePreviewRequest>,
) -> std::result::Result<Json<CreatePreviewResponse>, (StatusCode, String)> {
    req.tree
        .validate()
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;

    let session = Arc::new(SandboxSession::new(
        state.sandbox.clone(),
        state.commands.clone(),
        state.terminal_cap,
    ));
    let session_id = session.id().to_string();

    let task = tokio::spawn({
        let session = session.clone();
        let session_id = session_id.clone();
        let tree = req.tree;
        async move {
            match session.start(&tree).await {
                Ok(()) => info!("Preview {} finished", session_id),
                Err(e) => warn!("Preview {} failed: {}", session_id, e),
            }
        }
    });

    let preview = PreviewSession {
        id: session_id.clone(),
        session,
        task,
        created_at: Instant::now(),
        last_used: Instant::now(),
    };

    state.sessions.write().await.insert(session_id.clone(), preview);
    info!("Created preview: {}", session_id);

    Ok(Json(CreatePreviewResponse { session_id }))
}

async fn list_previews(State(state): State<AppState>) -> Json<Vec<PreviewInfo>> {
    let sessions = state.sessions.read().await;
    let now = Instant::now();
    let list: Vec<PreviewInfo> = sessions
        .values()
        .map(|p| {
            let snap = p.session.snapshot();
            PreviewInfo {
                id: p.id.clone(),
                phase: snap.phase,
                preview_url: snap.preview_url,
                loading: snap.loading,
                age_secs: now.duration_since(p.created_at).as_secs(),
                idle_secs: now.duration_since(p.last_used).as_secs(),
            }
        })
        .collect();
    Json(list)
}

async fn get_preview(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> std::result::Result<Json<SessionSnapshot>, StatusCode> {
    let mut sessions = state.sessions.write().await;
    let preview = sessions.get_mut(&id).ok_or(StatusCode::NOT_FOUND)?;
    preview.last_used = Instant::now();
    Ok(Json(preview.session.snapshot()))
}

/// Mark a preview as in use. False once it has been deleted or reaped.
async fn touch(sessions: &Sessions, id: &str) -> bool {
    match sessions.write().await.get_mut(id) {
        Some(preview) => {
            preview.last_used = Instant::now();
            true
        }
        None => false,
    }
}

async fn delete_preview(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> std::result::Result<StatusCode, StatusCode> {
    let mut sessions = state.sessions.write().await;
    if sessions.remove(&id).is_some() {
        info!("Deleted preview: {}", id);
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}

async fn terminal_socket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> std::result::Result<Response, StatusCode> {
    let rx = {
        let sessions = state.sessions.read().await;
        let preview = sessions.get(&id).ok_or(StatusCode::NOT_FOUND)?;
        preview.session.subscribe()
    };
    let sessions = state.sessions.clone();
    Ok(ws.on_upgrade(move |socket| stream_snapshots(socket, rx, sessions, id)))
}

/// Push a snapshot on connect and after every state change. Each push
/// counts as use of the preview.
async fn stream_snapshots(
    mut socket: WebSocket,
    mut rx: watch::Receiver<SessionState>,
    sessions: Sessions,
    id: String,
) {
    loop {
        if !touch(&sessions, &id).await {
            break;
        }
        let frame = serde_json::to_string(&rx.borrow_and_update().snapshot());
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Failed to encode snapshot");
                break;
            }
        };
        if socket.send(Message::Text(frame)).await.is_err() {
            break;
        }
        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => match incoming {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                Some(Ok(_)) => {}
            },
        }
    }
}

async fn autosave_socket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(context): Query<AutosaveContext>,
) -> std::result::Result<Response, StatusCode> {
    let sink = state
        .autosave
        .clone()
        .ok_or(StatusCode::SERVICE_UNAVAILABLE)?;
    let period = state.autosave_interval;
    Ok(ws.on_upgrade(move |socket| relay_autosave(socket, sink, context, period)))
}

/// Feed editing state received from the client into an [`Autosaver`] for
/// as long as the socket stays open.
async fn relay_autosave(
    mut socket: WebSocket,
    sink: Arc<dyn EventSink>,
    context: AutosaveContext,
    period: Duration,
) {
    info!(user_id = %context.user_id, sub_topic_id = %context.sub_topic_id, "Autosave relay opened");
    let (tx, rx) = watch::channel(None);
    let _autosaver = Autosaver::spawn(sink, context, rx, period);

    while let Some(Ok(message)) = socket.recv().await {
        match message {
            Message::Text(text) => match serde_json::from_str::<AutosaveData>(&text) {
                Ok(data) => {
                    let _ = tx.send(Some(data));
                }
                Err(e) => warn!(error = %e, "Ignoring malformed autosave frame"),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }
    info!("Autosave relay closed");
}

async fn cleanup_expired_sessions(sessions: &Sessions) {
    let mut sessions = sessions.write().await;
    let now = Instant::now();
    let ttl = Duration::from_secs(SESSION_TTL_SECS);

    let expired: Vec<String> = sessions
        .iter()
        .filter(|(_, p)| now.duration_since(p.last_used) > ttl)
        .map(|(id, _)| id.clone())
        .collect();

    for id in expired {
        if sessions.remove(&id).is_some() {
            info!("Cleaning up expired preview: {}", id);
        }
    }
}
