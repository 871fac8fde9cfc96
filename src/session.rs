use std::{collections::HashMap, convert::Infallible, sync::Arc, time::Duration};

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::{
    sync::{mpsc, RwLock},
    time,
};
use tokio_stream::{wrappers::ReceiverStream, StreamExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    broker::BrokerError,
    config::SessionMode,
    rpc,
    AppState,
};

/// Server-held routing and credential state for one logical client
/// connection. Never persisted; the table entry lives exactly as long as
/// the stream's heartbeat ceiling.
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub identity: String,
    pub token: String,
    pub created_at: DateTime<Utc>,
}

pub type SessionStore = Arc<RwLock<HashMap<String, Session>>>;

/// Owned by the SSE stream; evicts the session entry once the stream is
/// dropped, whether the lifetime cap ended it or the client went away.
struct SessionGuard {
    sessions: SessionStore,
    session_id: String,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let sessions = self.sessions.clone();
        let session_id = std::mem::take(&mut self.session_id);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if sessions.write().await.remove(&session_id).is_some() {
                    debug!(session_id = %session_id, "Session evicted on stream close");
                }
            });
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub identity: Option<String>,
}

pub async fn healthz() -> impl IntoResponse {
    Json(json!({ "ok": true, "timestamp": Utc::now() }))
}

pub async fn open_stream_default(State(state): State<AppState>) -> axum::response::Response {
    let identity = state.config.default_identity.clone();
    open_stream(state, identity).await
}

pub async fn open_stream_for_identity(
    State(state): State<AppState>,
    Path(identity): Path<String>,
) -> axum::response::Response {
    open_stream(state, identity).await
}

/// Stream-open: authenticate the identity, advertise the control endpoint
/// as the first event, then hold the stream open with ping comments until
/// the heartbeat ceiling. The endpoint event is always written before any
/// heartbeat. Reconnection is entirely client-driven.
async fn open_stream(state: AppState, identity: String) -> axum::response::Response {
    let token = match state.broker.login(&identity).await {
        Ok(token) => token,
        Err(err) => return login_failure_response(&identity, err),
    };

    let session_id = Uuid::new_v4().to_string();
    let endpoint = endpoint_url(&state.config.public_base_url, &session_id, &identity);

    if state.config.session_mode == SessionMode::Shared {
        let session = Session {
            session_id: session_id.clone(),
            identity: identity.clone(),
            token,
            created_at: Utc::now(),
        };
        state.sessions.write().await.insert(session_id.clone(), session);
    }

    info!(session_id = %session_id, identity = %identity, "Session stream opened");

    // The hold-open channel never carries an event; dropping its sender
    // after the lifetime cap ends the stream.
    let (holdopen_tx, holdopen_rx) = mpsc::channel::<Result<Event, Infallible>>(1);
    let lifetime = Duration::from_secs(state.config.session_max_seconds);
    let expiring_id = session_id.clone();
    tokio::spawn(async move {
        let _tx = holdopen_tx;
        time::sleep(lifetime).await;
        debug!(session_id = %expiring_id, "Session reached heartbeat ceiling");
    });

    // Eviction rides on stream drop, so an early client disconnect frees
    // the table entry immediately instead of holding it for the full cap.
    let guard = SessionGuard {
        sessions: state.sessions.clone(),
        session_id: session_id.clone(),
    };
    let endpoint_event = Event::default().event("endpoint").data(endpoint);
    let stream = tokio_stream::once(Ok::<Event, Infallible>(endpoint_event))
        .chain(ReceiverStream::new(holdopen_rx))
        .map(move |event| {
            let _held = &guard;
            event
        });

    Sse::new(stream)
        .keep_alive(
            KeepAlive::new()
                .interval(Duration::from_secs(state.config.heartbeat_seconds))
                .text("ping"),
        )
        .into_response()
}

/// Control endpoint: one JSON-RPC request in, one JSON-RPC response out.
/// Independent of the stream's own state machine; concurrent POSTs on the
/// same session are not serialized against each other or the heartbeats.
pub async fn post_message(
    State(state): State<AppState>,
    Query(query): Query<MessageQuery>,
    body: Bytes,
) -> axum::response::Response {
    let token = match resolve_token(&state, &query).await {
        Ok(token) => token,
        Err(err) => {
            warn!(error = %err, "Message POST could not obtain a token");
            let id = extract_request_id(&body);
            return (
                StatusCode::OK,
                Json(rpc::auth_error(id, format!("Authentication failed: {err}"))),
            )
                .into_response();
        }
    };

    let response = rpc::handle_message(&state.registry, &state.dispatcher, &token, &body).await;
    (StatusCode::OK, Json(response)).into_response()
}

/// Shared mode reuses the token captured at stream-open when the session
/// is known and the token still verifies; a stale token is replaced with a
/// fresh login and the session entry updated, without disturbing calls
/// already in flight on the old token. Unknown session ids fall back to a
/// fresh login (sessions are not durable). Stateless mode always
/// re-derives the credential.
async fn resolve_token(state: &AppState, query: &MessageQuery) -> Result<String, BrokerError> {
    let identity = query
        .identity
        .clone()
        .unwrap_or_else(|| state.config.default_identity.clone());

    if state.config.session_mode == SessionMode::Shared {
        if let Some(session_id) = &query.session_id {
            let known = state.sessions.read().await.get(session_id).cloned();
            if let Some(session) = known {
                if state.broker.verify(&session.token).await.is_some() {
                    return Ok(session.token);
                }

                debug!(session_id = %session_id, "Session token failed verification, re-authenticating");
                let token = state.broker.login(&session.identity).await?;
                let mut sessions = state.sessions.write().await;
                if let Some(entry) = sessions.get_mut(session_id) {
                    entry.token = token.clone();
                }
                return Ok(token);
            }
            debug!(session_id = %session_id, "Unknown session id on POST, re-authenticating");
        }
    }

    state.broker.login(&identity).await
}

pub fn endpoint_url(public_base_url: &str, session_id: &str, identity: &str) -> String {
    format!(
        "{}/message?session_id={}&identity={}",
        public_base_url.trim_end_matches('/'),
        session_id,
        identity
    )
}

fn extract_request_id(body: &Bytes) -> Value {
    serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|v| v.get("id").cloned())
        .unwrap_or(Value::Null)
}

fn login_failure_response(identity: &str, err: BrokerError) -> axum::response::Response {
    let (status, code) = match &err {
        BrokerError::UnknownIdentity(_) => (StatusCode::NOT_FOUND, "UNKNOWN_IDENTITY"),
        BrokerError::LoginFailed { .. } => (StatusCode::UNAUTHORIZED, "LOGIN_FAILED"),
        BrokerError::Network(_) => (StatusCode::INTERNAL_SERVER_ERROR, "AUTH_UNAVAILABLE"),
    };

    warn!(identity = %identity, error = %err, "Stream-open login failed");

    (
        status,
        Json(json!({
            "error": {
                "code": code,
                "message": err.to_string(),
            }
        })),
    )
        .into_response()
}
