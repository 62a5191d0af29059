use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use fm_harness::rpc::error_codes;
use fm_harness::{InitializeResult, RpcRequest, RpcResponse, ToolContext, ToolRegistry};

use crate::context::ServerContext;
use crate::sessions::SessionManager;

/// Header carrying the transport session id on both channels.
pub const SESSION_HEADER: &str = "mcp-session-id";

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub struct HttpState {
    pub ctx: Arc<ServerContext>,
    pub registry: Arc<ToolRegistry>,
}

pub fn router(state: Arc<HttpState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/mcp", post(handle_rpc))
        .route("/mcp/sse", get(handle_sse))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

fn session_id_from(headers: &HeaderMap) -> Option<String> {
    headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "name": "foreman",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.ctx.uptime_secs(),
    }))
}

/// The POST half of the transport: one JSON-RPC request in, one response
/// out, with the session id echoed (or minted) in the response headers.
async fn handle_rpc(
    State(state): State<Arc<HttpState>>,
    headers: HeaderMap,
    Json(request): Json<RpcRequest>,
) -> impl IntoResponse {
    let session_id = session_id_from(&headers).unwrap_or_else(SessionManager::mint_session_id);
    if let Err(e) = state.ctx.sessions.ensure(&session_id).await {
        tracing::warn!(error = %e, "session bookkeeping failed");
    }

    let mut response_headers = HeaderMap::new();
    if let Ok(value) = session_id.parse() {
        response_headers.insert(SESSION_HEADER, value);
    }

    if request.is_notification() {
        // Notifications get no body, only acknowledgement.
        return (StatusCode::ACCEPTED, response_headers, Json(serde_json::Value::Null)).into_response();
    }

    let response = dispatch(&state, &session_id, request).await;
    (StatusCode::OK, response_headers, Json(serde_json::to_value(response).unwrap_or_default()))
        .into_response()
}

async fn dispatch(state: &Arc<HttpState>, session_id: &str, request: RpcRequest) -> RpcResponse {
    let id = request.id.clone();
    match request.method.as_str() {
        "initialize" => {
            let result = InitializeResult::for_server("foreman", env!("CARGO_PKG_VERSION"));
            RpcResponse::success(id, serde_json::to_value(result).unwrap_or_default())
        }
        "ping" => RpcResponse::success(id, serde_json::json!({})),
        "tools/list" => {
            let tools = state.registry.descriptors();
            RpcResponse::success(id, serde_json::json!({ "tools": tools }))
        }
        "tools/call" => {
            let params = request.params.unwrap_or_default();
            let Some(name) = params.get("name").and_then(|v| v.as_str()) else {
                return RpcResponse::failure(id, error_codes::INVALID_PARAMS, "missing tool name");
            };
            let args = params.get("arguments").cloned().unwrap_or(serde_json::json!({}));
            let ctx = tool_context(state, session_id, &args).await;
            let result = state.registry.call(name, args, ctx).await;
            match serde_json::to_value(&result) {
                Ok(value) => RpcResponse::success(id, value),
                Err(e) => RpcResponse::failure(id, error_codes::INTERNAL_ERROR, e.to_string()),
            }
        }
        other => RpcResponse::failure(
            id,
            error_codes::METHOD_NOT_FOUND,
            format!("unknown method '{other}'"),
        ),
    }
}

/// Resolve the caller's identity from the token argument (worker token or
/// admin token, whichever field the tool uses) and attach the session's
/// notification channel.
async fn tool_context(
    state: &Arc<HttpState>,
    session_id: &str,
    args: &serde_json::Value,
) -> ToolContext {
    let token = args
        .get("admin_token")
        .or_else(|| args.get("token"))
        .and_then(|v| v.as_str());

    let (is_admin, agent_id) = match token {
        Some(token) => {
            let is_admin = state.ctx.auth.is_admin(token);
            let agent_id = if is_admin {
                None
            } else {
                state.ctx.auth.agent_id_for(token).await.unwrap_or(None)
            };
            (is_admin, agent_id)
        }
        None => (false, None),
    };

    ToolContext {
        session_id: Some(session_id.to_string()),
        is_admin,
        agent_id,
        notifications: state.ctx.sessions.sender_for(session_id),
    }
}

// ---------------------------------------------------------------------------
// SSE channel
// ---------------------------------------------------------------------------

/// The GET half: a server-sent-events stream of JSON-RPC notifications.
/// Dropping the stream (client gone) marks the session disconnected and
/// arms the grace period.
async fn handle_sse(
    State(state): State<Arc<HttpState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let session_id = session_id_from(&headers).unwrap_or_else(SessionManager::mint_session_id);
    let receiver = match state.ctx.sessions.open_channel(&session_id).await {
        Ok(receiver) => receiver,
        Err(e) => {
            return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
        }
    };

    let stream = NotificationStream {
        inner: ReceiverStream::new(receiver),
        _guard: DisconnectGuard {
            sessions: state.ctx.sessions.clone(),
            session_id: session_id.clone(),
        },
    };

    let mut response = Sse::new(stream).keep_alive(KeepAlive::default()).into_response();
    if let Ok(value) = session_id.parse() {
        response.headers_mut().insert(SESSION_HEADER, value);
    }
    response
}

struct DisconnectGuard {
    sessions: Arc<SessionManager>,
    session_id: String,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        let sessions = self.sessions.clone();
        let session_id = std::mem::take(&mut self.session_id);
        tokio::spawn(async move {
            if let Err(e) = sessions.mark_disconnected(&session_id).await {
                tracing::warn!(error = %e, "failed to mark session disconnected");
            }
        });
    }
}

struct NotificationStream {
    inner: ReceiverStream<RpcRequest>,
    _guard: DisconnectGuard,
}

impl Stream for NotificationStream {
    type Item = Result<Event, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(request)) => {
                let data = serde_json::to_string(&request).unwrap_or_default();
                Poll::Ready(Some(Ok(Event::default().event("message").data(data))))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}
