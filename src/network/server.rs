//! Network Server
//!
//! Serves the replication protocol over HTTP. Each call is a POST of a
//! base64 bincode message; the command id and shared secret travel in
//! headers. Failures answer with a non-2xx status, the numeric error code
//! in a header and the error text as the body.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use super::secrets_match;
use crate::error::{Error, ErrorCode, Result};
use crate::replication::protocol::{COMMAND_HEADER, ERROR_CODE_HEADER, SECRET_HEADER};
use crate::replication::{Command, Endpoint, Message, SyncService};
use crate::state::HostRecord;
use crate::wal::entry::current_timestamp;

/// Window of the recent-activity counter on the status page
const RECENT_WINDOW_MS: u64 = 60_000;

/// Shared server state
struct ServerState {
    service: Arc<SyncService>,
    shared_secret: String,
}

/// HTTP server for inbound replication calls
pub struct ReplicationServer {
    bind_address: String,
    state: Arc<ServerState>,
}

/// JSON body of `GET /status`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub url: String,
    pub role: String,
    pub master_address: String,
    pub log_position: u64,
    pub record_counter: u64,
    pub push_target: Option<String>,
    /// Entries committed or applied during the last minute
    pub recent_entries: usize,
    pub hosts: Vec<HostRecord>,
}

impl ReplicationServer {
    pub fn new(bind_address: impl Into<String>, service: Arc<SyncService>, shared_secret: impl Into<String>) -> Self {
        Self {
            bind_address: bind_address.into(),
            state: Arc::new(ServerState {
                service,
                shared_secret: shared_secret.into(),
            }),
        }
    }

    /// Create the router
    pub fn router(&self) -> Router {
        Router::new()
            .route(Endpoint::Master.path(), post(handle_master))
            .route(Endpoint::Remote.path(), post(handle_remote))
            .route("/status", get(handle_status))
            .route("/health", get(handle_health))
            .layer(TraceLayer::new_for_http())
            .with_state(Arc::clone(&self.state))
    }

    /// Bind and serve until `shutdown` fires
    pub async fn start(&self, shutdown: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(&self.bind_address).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        tracing::info!("Replication endpoint listening on {}", listener.local_addr()?);

        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        tracing::info!("Replication endpoint stopped");
        Ok(())
    }
}

async fn handle_master(State(state): State<Arc<ServerState>>, headers: HeaderMap, body: Bytes) -> Response {
    dispatch(&state, Endpoint::Master, &headers, &body).await
}

async fn handle_remote(State(state): State<Arc<ServerState>>, headers: HeaderMap, body: Bytes) -> Response {
    dispatch(&state, Endpoint::Remote, &headers, &body).await
}

async fn dispatch(state: &ServerState, endpoint: Endpoint, headers: &HeaderMap, body: &[u8]) -> Response {
    match process(state, endpoint, headers, body).await {
        Ok(reply) => (StatusCode::OK, reply).into_response(),
        Err(e) => {
            tracing::debug!("Replication call on {} failed: {}", endpoint.path(), e);
            error_response(&e)
        }
    }
}

async fn process(state: &ServerState, endpoint: Endpoint, headers: &HeaderMap, body: &[u8]) -> Result<String> {
    let secret = header_str(headers, SECRET_HEADER).unwrap_or_default();
    if !secrets_match(secret, &state.shared_secret) {
        tracing::warn!("Rejected replication call with a bad shared secret");
        return Err(Error::Unauthorized);
    }

    let id = header_str(headers, COMMAND_HEADER)
        .ok_or_else(|| Error::Protocol("missing command header".into()))?
        .parse::<u32>()
        .map_err(|_| Error::Protocol("command header is not a number".into()))?;
    let command = Command::from_u32(id)?;

    if !endpoint.accepts(command) {
        return Err(Error::Protocol(format!(
            "{} is not served on {}",
            command,
            endpoint.path()
        )));
    }

    let body = std::str::from_utf8(body).map_err(|_| Error::Protocol("body is not text".into()))?;
    let message = Message::from_base64(body)?;
    if message.command() != command {
        return Err(Error::Protocol(format!(
            "command header says {} but body holds {}",
            command,
            message.command()
        )));
    }

    state.service.handle(message).await?.to_base64()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn error_response(e: &Error) -> Response {
    let code = e.code();
    let status = match code {
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::Protocol | ErrorCode::UnknownCommand => StatusCode::BAD_REQUEST,
        ErrorCode::NotMaster | ErrorCode::Consistency => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };

    let mut response = (status, e.to_string()).into_response();
    response
        .headers_mut()
        .insert(ERROR_CODE_HEADER, HeaderValue::from(code.as_u32()));
    response
}

async fn handle_status(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let ctx = state.service.context();
    let since = current_timestamp().saturating_sub(RECENT_WINDOW_MS);
    let recent_entries = state
        .service
        .log()
        .ids_since(since, 100_000)
        .map(|ids| ids.len())
        .unwrap_or_default();

    Json(StatusResponse {
        url: ctx.self_url().to_string(),
        role: ctx.role().to_string(),
        master_address: ctx.master_address().await,
        log_position: ctx.log_position(),
        record_counter: ctx.counters().primary(),
        push_target: ctx.follower_hint().await,
        recent_entries,
        hosts: state.service.membership().get_hosts().await,
    })
}

async fn handle_health(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let ctx = state.service.context();
    Json(serde_json::json!({
        "status": "healthy",
        "role": ctx.role().to_string(),
        "log_position": ctx.log_position(),
    }))
}
