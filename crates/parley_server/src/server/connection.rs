#![forbid(unsafe_code)]

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use parley_domain::UserId;
use parley_protocol::{ClientEvent, ServerEvent, UserPresenceUpdateEvent};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::server::auth;
use crate::server::room_hub::ConnId;
use crate::server::router::EventRouter;
use crate::server::state::AppState;
use crate::util::time::unix_ms_now;

/// Query parameters for the websocket upgrade.
#[derive(Debug, Clone, Deserialize)]
pub struct WsQuery {
	/// Bearer credential; absence or invalidity rejects the handshake
	/// before any event handler runs.
	pub token: Option<String>,
}

/// `GET /ws`: websocket upgrade for one client session.
pub async fn ws_handler(
	State(state): State<Arc<AppState>>,
	Query(query): Query<WsQuery>,
	ws: WebSocketUpgrade,
) -> Response {
	let Some(token) = query.token.as_deref().map(str::trim).filter(|t| !t.is_empty()) else {
		metrics::counter!("parley_server_handshakes_rejected_total").increment(1);
		return (StatusCode::UNAUTHORIZED, "missing auth token").into_response();
	};

	let user = match auth::authenticate(token, state.auth_hmac_secret.expose()) {
		Ok(user) => user,
		Err(e) => {
			warn!(error = %e, "handshake rejected: invalid auth token");
			metrics::counter!("parley_server_handshakes_rejected_total").increment(1);
			return (StatusCode::UNAUTHORIZED, "invalid auth token").into_response();
		}
	};

	let conn_id = state.next_conn_id();
	metrics::counter!("parley_server_connections_total").increment(1);

	ws.on_upgrade(move |socket| handle_socket(socket, conn_id, user, state))
}

/// Per-connection session loop. The user identity was bound at the
/// handshake and is never re-validated for the connection's lifetime.
pub async fn handle_socket(socket: WebSocket, conn_id: ConnId, user: UserId, state: Arc<AppState>) {
	struct ConnectionGaugeGuard;
	impl Drop for ConnectionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("parley_server_active_connections").decrement(1.0);
		}
	}

	metrics::gauge!("parley_server_active_connections").increment(1.0);
	let _conn_guard = ConnectionGaugeGuard;

	info!(conn_id, user = %user, "connection established");

	let mut outbound = state.hub.register_conn(conn_id, user.clone()).await;

	if state.presence.register(&user, conn_id).await == crate::server::presence::PresenceTransition::CameOnline {
		publish_presence(&state, &user, true).await;
	}

	let (mut ws_tx, mut ws_rx) = socket.split();

	loop {
		tokio::select! {
			event = outbound.recv() => {
				let Some(event) = event else {
					// Hub dropped our queue (connection pruned).
					break;
				};

				let text = match serde_json::to_string(&event) {
					Ok(text) => text,
					Err(e) => {
						warn!(conn_id, error = %e, "failed to encode outbound event");
						continue;
					}
				};

				metrics::counter!("parley_server_events_out_total").increment(1);
				if ws_tx.send(Message::Text(text.into())).await.is_err() {
					break;
				}
			}

			frame = ws_rx.next() => {
				match frame {
					Some(Ok(Message::Text(text))) => {
						metrics::counter!("parley_server_events_in_total").increment(1);
						handle_text_frame(&state.router, conn_id, &user, text.as_str()).await;
					}
					Some(Ok(Message::Close(_))) | None => break,
					Some(Err(e)) => {
						debug!(conn_id, error = %e, "websocket read failed");
						break;
					}
					// Pings are answered by the transport; binary frames are ignored.
					Some(Ok(_)) => {}
				}
			}
		}
	}

	state.hub.unregister_conn(conn_id).await;

	if state.presence.deregister(&user, conn_id).await == crate::server::presence::PresenceTransition::WentOffline {
		publish_presence(&state, &user, false).await;
	}

	info!(conn_id, user = %user, "connection closed");
}

/// Decode and dispatch one inbound text frame. A frame that is not a
/// known control message gets a scoped `error` event back to the sender
/// and the session stays open.
pub(crate) async fn handle_text_frame(router: &EventRouter, conn_id: ConnId, user: &UserId, text: &str) {
	match serde_json::from_str::<ClientEvent>(text) {
		Ok(event) => router.handle_event(conn_id, user, event).await,
		Err(e) => {
			debug!(conn_id, error = %e, "discarding malformed control message");
			metrics::counter!("parley_server_decode_errors_total").increment(1);
			router.emit_error(conn_id, "unrecognized control message".to_string()).await;
		}
	}
}

/// Drive one aggregate presence edge: attempt the persistence write
/// first so a REST read right after the event sees consistent state,
/// then broadcast to every connected client. Presence is advisory, so a
/// failed write is logged and the broadcast still goes out.
pub(crate) async fn publish_presence(state: &AppState, user: &UserId, is_online: bool) {
	let last_seen_at = unix_ms_now();

	if let Err(e) = state.directory.update_user_presence(user, is_online, last_seen_at).await {
		warn!(user = %user, is_online, error = %e, "failed to persist presence; broadcasting anyway");
	}

	metrics::counter!("parley_server_presence_transitions_total").increment(1);
	state
		.hub
		.emit_to_all(ServerEvent::UserPresenceUpdate(UserPresenceUpdateEvent {
			user_id: user.clone(),
			is_online,
			last_seen_at,
		}))
		.await;
}
