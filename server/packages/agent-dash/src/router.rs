//! HTTP surface: health, the three WebSocket channels and scheduled runs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use agent_dash_error::{ProblemDetails, SandboxError};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use futures::{future, SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::Span;

use crate::chat::{ChatChannel, ChatEvent};
use crate::config::ServerConfig;
use crate::executor::AgentExecutor;
use crate::guard::{ActorKey, ConcurrencyGuard};
use crate::privilege::RunAsUser;
use crate::pty::{LaunchSpec, PtyInput, PtySession, PtySize};
use crate::scheduler::{run_scheduled, ScheduledRun, ScheduledTask};
use crate::terminal::{run_terminal_session, TerminalEvent};

#[derive(Debug)]
pub struct AppState {
    auth: AuthConfig,
    config: ServerConfig,
    executor: AgentExecutor,
    guard: Arc<ConcurrencyGuard>,
    chat: ChatChannel,
    run_as: Option<RunAsUser>,
}

impl AppState {
    pub fn new(auth: AuthConfig, config: ServerConfig) -> Self {
        let executor = AgentExecutor::new(config.executor_config());
        let guard = ConcurrencyGuard::new();
        let chat = ChatChannel::new(
            executor.clone(),
            guard.clone(),
            config.work_dir.clone(),
            config.chat_timeout,
        );
        let run_as = config.run_as_user();
        Self {
            auth,
            config,
            executor,
            guard,
            chat,
            run_as,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn guard(&self) -> &Arc<ConcurrencyGuard> {
        &self.guard
    }
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub token: Option<String>,
}

impl AuthConfig {
    pub fn disabled() -> Self {
        Self { token: None }
    }

    pub fn with_token(token: String) -> Self {
        Self { token: Some(token) }
    }
}

/// Authenticated user of a request.
#[derive(Debug, Clone)]
pub struct Identity(pub String);

pub fn build_router(state: AppState) -> Router {
    build_router_with_state(Arc::new(state)).0
}

pub fn build_router_with_state(shared: Arc<AppState>) -> (Router, Arc<AppState>) {
    let api_router = Router::new()
        .route("/health", get(get_health))
        .route("/pty/ws", get(pty_ws))
        .route("/terminal/ws", get(terminal_ws))
        .route("/chat/ws", get(chat_ws))
        .route("/tasks/:task_id/run", post(run_task))
        .route("/tasks/:task_id/cancel", post(cancel_task))
        .layer(axum::middleware::from_fn_with_state(
            shared.clone(),
            require_token,
        ))
        .with_state(shared.clone());

    let mut router = Router::new()
        .nest("/api", api_router)
        .fallback(not_found);

    let http_logging = match std::env::var("AGENT_DASH_LOG_HTTP") {
        Ok(value) if value == "0" || value.eq_ignore_ascii_case("false") => false,
        _ => true,
    };
    if http_logging {
        // Only the path is logged; the query may carry the access token.
        let trace_layer = TraceLayer::new_for_http()
            .make_span_with(|req: &Request<_>| {
                tracing::info_span!(
                    "http.request",
                    method = %req.method(),
                    path = %req.uri().path()
                )
            })
            .on_request(|_req: &Request<_>, span: &Span| {
                tracing::info!(parent: span, "request");
            })
            .on_response(|res: &Response<_>, latency: Duration, span: &Span| {
                tracing::info!(
                    parent: span,
                    status = %res.status(),
                    latency_ms = latency.as_millis()
                );
            });
        router = router.layer(trace_layer);
    }

    (router, shared)
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let problem: ProblemDetails = match &self {
            ApiError::Sandbox(err) => err.to_problem_details(),
        };
        let status =
            StatusCode::from_u16(problem.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(problem)).into_response()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelResponse {
    pub cancelled: bool,
}

async fn get_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn not_found(uri: axum::http::Uri) -> ApiError {
    SandboxError::NotFound {
        resource: uri.path().to_string(),
    }
    .into()
}

async fn require_token(
    State(state): State<Arc<AppState>>,
    mut req: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, ApiError> {
    if req.uri().path().ends_with("/health") {
        return Ok(next.run(req).await);
    }

    if let Some(expected) = &state.auth.token {
        let provided = extract_token(req.headers())
            .or_else(|| Query::<HashMap<String, String>>::try_from_uri(req.uri())
                .ok()
                .and_then(|Query(mut params)| params.remove("token")));
        if provided.as_deref() != Some(expected.as_str()) {
            tracing::info!(path = %req.uri().path(), "rejected unauthenticated request");
            return Err(SandboxError::TokenInvalid {
                message: Some("missing or invalid token".to_string()),
            }
            .into());
        }
    }

    req.extensions_mut()
        .insert(Identity(state.config.username.clone()));
    Ok(next.run(req).await)
}

fn extract_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?.trim();
    let (scheme, rest) = value.split_once(' ')?;
    match scheme.to_ascii_lowercase().as_str() {
        "bearer" | "token" => Some(rest.trim().to_string()),
        _ => None,
    }
}

/// Text frames of a client socket, ending at close or the first error.
fn text_frames<S>(stream: S) -> impl Stream<Item = String> + Unpin
where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    stream
        .take_while(|frame| future::ready(matches!(frame, Ok(message) if !matches!(message, Message::Close(_)))))
        .filter_map(|frame| {
            future::ready(match frame {
                Ok(Message::Text(text)) => Some(text),
                _ => None,
            })
        })
}

async fn pty_ws(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
) -> Response {
    ws.on_upgrade(move |socket| handle_pty_socket(socket, state, identity))
}

async fn handle_pty_socket(socket: WebSocket, state: Arc<AppState>, identity: Identity) {
    let (mut ws_sender, ws_receiver) = socket.split();
    let launch = LaunchSpec::interactive(
        &state.config.agent_binary,
        &state.config.shell,
        state.run_as.clone(),
    );
    let mut session = match PtySession::open(
        state.config.pty_backend,
        &launch,
        PtySize::DEFAULT,
        identity.0,
    ) {
        Ok(session) => session,
        Err(err) => {
            tracing::warn!(error = %err, "failed to open pty session");
            let _ = ws_sender
                .send(Message::Text(format!("\r\n{err}\r\n")))
                .await;
            return;
        }
    };

    let outbound = ws_sender.with(|bytes: Vec<u8>| future::ready(Ok::<_, axum::Error>(Message::Binary(bytes))));
    let inbound = ws_receiver
        .take_while(|frame| future::ready(matches!(frame, Ok(message) if !matches!(message, Message::Close(_)))))
        .filter_map(|frame| {
            future::ready(match frame {
                Ok(Message::Text(text)) => PtyInput::from_text(text),
                Ok(Message::Binary(data)) => Some(PtyInput::Data(data)),
                _ => None,
            })
        });
    session.run(outbound, inbound).await;
}

async fn terminal_ws(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Extension(_identity): Extension<Identity>,
) -> Response {
    let home = state.config.terminal_home.clone();
    ws.on_upgrade(move |socket| async move {
        let (ws_sender, ws_receiver) = socket.split();
        let outbound = ws_sender.with(|event: TerminalEvent| {
            future::ready(
                serde_json::to_string(&event)
                    .map(Message::Text)
                    .map_err(axum::Error::new),
            )
        });
        run_terminal_session(home, outbound, text_frames(ws_receiver)).await;
    })
}

async fn chat_ws(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        let (ws_sender, ws_receiver) = socket.split();
        let outbound = ws_sender.with(|event: ChatEvent| {
            future::ready(
                serde_json::to_string(&event)
                    .map(Message::Text)
                    .map_err(axum::Error::new),
            )
        });
        state
            .chat
            .run(&identity.0, outbound, text_frames(ws_receiver))
            .await;
    })
}

async fn run_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
    Json(task): Json<ScheduledTask>,
) -> Result<Json<ScheduledRun>, ApiError> {
    let run = run_scheduled(
        &state.executor,
        &state.guard,
        &task_id,
        task,
        state.config.scheduled_timeout,
    )
    .await?;
    Ok(Json(run))
}

async fn cancel_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Json<CancelResponse> {
    Json(CancelResponse {
        cancelled: state.guard.cancel(&ActorKey::scheduled(&task_id)),
    })
}
