//! The `/ws/status` endpoint: live job events for one anonymous user.

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use axum_extra::extract::cookie::{Cookie, CookieJar};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;

use super::server::AppState;
use crate::auth::{anon, beta};

/// Close code for an unauthenticated upgrade behind the beta gate.
const CLOSE_BETA_AUTH_REQUIRED: u16 = 4401;

/// Query parameters of the status socket.
#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    /// Owner id; clients pre-fetch this server-side. Falls back to the
    /// `anon_id` cookie.
    #[serde(default)]
    pub anon_id: Option<String>,
}

/// Upgrade handler.
pub async fn ws_status(
    ws: WebSocketUpgrade,
    Query(query): Query<StatusQuery>,
    State(state): State<AppState>,
    jar: CookieJar,
) -> Response {
    let user_id = query
        .anon_id
        .filter(|id| anon::is_valid_anon_id(id))
        .unwrap_or_else(|| anon::anon_id_from_jar(&jar));
    let authed = beta::is_request_authed(
        &state.config,
        jar.get(&state.config.beta_cookie_name).map(Cookie::value),
    );
    ws.on_upgrade(move |socket| handle_status_socket(socket, state, user_id, authed))
}

async fn handle_status_socket(socket: WebSocket, state: AppState, user_id: String, authed: bool) {
    let mut socket = socket;
    if !authed {
        tracing::info!(owner_id = %user_id, "status socket rejected by beta gate");
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: CLOSE_BETA_AUTH_REQUIRED,
                reason: "beta_auth_required".into(),
            })))
            .await;
        return;
    }

    let (connection_id, mut events) = state.hub.connect(&user_id);
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Some(text) => {
                        if sender.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    // Clients only ping; any payload is ignored.
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    state.hub.disconnect(&user_id, connection_id);
}
