//! WebSocket upgrade endpoint for browser clients.
//!
//! The token arrives in the `token` query param, falling back to the
//! configured cookie.  An optional `project_id` narrows the session to one
//! project's events.  Authentication, filter validation and the capacity
//! check all happen before the protocol upgrade so failures surface as plain
//! HTTP status codes.

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum_extra::extract::CookieJar;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::info;
use uuid::Uuid;

use crate::hub::{OUTBOUND_QUEUE_CAPACITY, SessionHandle};
use crate::session;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct NotifyParams {
    token: Option<String>,
    project_id: Option<String>,
}

pub async fn ws_notifications_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<NotifyParams>,
    State(state): State<AppState>,
    jar: CookieJar,
) -> Response {
    let token = params.token.clone().or_else(|| {
        jar.get(&state.config.auth.cookie_name)
            .map(|cookie| cookie.value().to_owned())
    });
    let Some(token) = token else {
        return (StatusCode::UNAUTHORIZED, "missing token").into_response();
    };
    let user_id = match state.verifier.verify(&token) {
        Ok(user_id) => user_id,
        Err(e) => {
            info!(error = %e, "rejected upgrade: invalid token");
            return (StatusCode::UNAUTHORIZED, "invalid token").into_response();
        }
    };

    let project_filter = match params.project_id.as_deref() {
        // An empty param means no filter, same as an absent one.
        None | Some("") => None,
        Some(filter) if valid_project_filter(filter) => Some(filter.to_owned()),
        Some(filter) => {
            info!(user_id = %user_id, project_id = %filter, "rejected upgrade: malformed filter");
            return (StatusCode::BAD_REQUEST, "malformed project_id").into_response();
        }
    };

    if state.hub.at_capacity() {
        info!(user_id = %user_id, "rejected upgrade: connection limit reached");
        return (StatusCode::SERVICE_UNAVAILABLE, "connection limit reached").into_response();
    }

    ws.max_message_size(state.config.websocket.max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, state, user_id, project_filter))
}

async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    user_id: String,
    project_filter: Option<String>,
) {
    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
    let session_id = Uuid::new_v4();
    let handle = SessionHandle {
        id: session_id,
        user_id: user_id.clone(),
        project_filter,
        outbound: outbound_tx,
    };

    let shutdown = state.hub.shutdown_signal();
    state.hub.register(handle).await;
    info!(session_id = %session_id, user_id = %user_id, "client connected");

    session::run(
        socket,
        state.hub.clone(),
        session_id,
        user_id.clone(),
        outbound_rx,
        state.config.websocket.clone(),
        shutdown,
    )
    .await;
    info!(session_id = %session_id, user_id = %user_id, "client disconnected");
}

/// 1–50 characters of `[A-Za-z0-9_-]`.
fn valid_project_filter(filter: &str) -> bool {
    (1..=50).contains(&filter.len())
        && filter
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}
