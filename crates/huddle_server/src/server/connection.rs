#![forbid(unsafe_code)]

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use huddle_domain::UserId;
use huddle_protocol::{ServerEvent, code, parse_client_frame};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::server::auth;
use crate::server::http::AppState;
use crate::server::registry::{ConnHandle, OutboundFrame, PresenceChange, encode_event};
use crate::util::time::unix_ms_now;

/// Per-connection server settings.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
	pub max_frame_bytes: usize,
	pub outbound_queue_capacity: usize,
}

impl Default for ConnectionSettings {
	fn default() -> Self {
		Self {
			max_frame_bytes: huddle_protocol::DEFAULT_MAX_FRAME_BYTES,
			outbound_queue_capacity: 1024,
		}
	}
}

#[derive(Debug, Deserialize)]
pub struct WsQuery {
	#[serde(default)]
	token: String,
}

/// `GET /ws?token=...` upgrade handler. The bearer token is verified
/// once at connect time, not per-frame.
pub async fn ws_handler(
	State(state): State<Arc<AppState>>,
	Query(query): Query<WsQuery>,
	ws: WebSocketUpgrade,
) -> Response {
	ws.on_upgrade(move |socket| handle_socket(state, query.token, socket))
}

async fn handle_socket(state: Arc<AppState>, token: String, mut socket: WebSocket) {
	metrics::counter!("huddle_server_connections_total").increment(1);

	let user_id = match auth::verify_token(token.trim(), state.auth_secret.expose()) {
		Ok(claims) => match UserId::new(claims.sub) {
			Ok(user_id) => user_id,
			Err(_) => {
				reject(&mut socket, "invalid auth token").await;
				return;
			}
		},
		Err(e) => {
			warn!(error = %e, "connection rejected: invalid token");
			reject(&mut socket, "invalid auth token").await;
			return;
		}
	};

	struct ConnectionGaugeGuard;
	impl Drop for ConnectionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("huddle_server_active_connections").decrement(1.0);
		}
	}

	metrics::gauge!("huddle_server_active_connections").increment(1.0);
	let _conn_guard = ConnectionGaugeGuard;

	let conn_id = state.next_conn_id();
	info!(conn_id, user_id = %user_id, "connection open");

	let (out_tx, mut out_rx) = mpsc::channel::<OutboundFrame>(state.conn_settings.outbound_queue_capacity);
	let handle = ConnHandle::new(conn_id, user_id.clone(), out_tx);

	let presence = state.registry.register(handle.clone()).await;
	if presence == PresenceChange::WentOnline
		&& let Err(e) = state.store.set_user_presence(&user_id, true, unix_ms_now()).await
	{
		warn!(conn_id, error = %e, "failed to persist online presence");
	}

	let (mut ws_tx, mut ws_rx) = socket.split();

	let writer_task = tokio::spawn(async move {
		while let Some(frame) = out_rx.recv().await {
			if ws_tx.send(Message::Text(frame.to_string().into())).await.is_err() {
				break;
			}
		}
	});

	while let Some(next) = ws_rx.next().await {
		let msg = match next {
			Ok(msg) => msg,
			Err(e) => {
				debug!(conn_id, error = %e, "socket read error");
				break;
			}
		};

		match msg {
			Message::Text(text) => handle_frame(&state, &handle, text.as_str()).await,
			Message::Binary(data) => match std::str::from_utf8(&data) {
				Ok(text) => handle_frame(&state, &handle, text).await,
				Err(_) => handle.send_event(&ServerEvent::error(code::BAD_JSON, "frame is not valid utf-8")),
			},
			Message::Close(_) => break,
			Message::Ping(_) | Message::Pong(_) => {}
		}
	}

	writer_task.abort();

	if let Some(outcome) = state.registry.unregister(conn_id).await {
		for room in &outcome.rooms {
			state.index.unsubscribe(room, conn_id).await;
		}

		if outcome.presence == PresenceChange::WentOffline
			&& let Err(e) = state.store.set_user_presence(&outcome.user_id, false, unix_ms_now()).await
		{
			warn!(conn_id, error = %e, "failed to persist offline presence");
		}
	}

	info!(conn_id, user_id = %user_id, "connection closed");
}

async fn handle_frame(state: &Arc<AppState>, handle: &ConnHandle, raw: &str) {
	metrics::counter!("huddle_server_frames_in_total").increment(1);

	match parse_client_frame(raw, state.conn_settings.max_frame_bytes) {
		Ok(frame) => state.dispatcher.dispatch(handle, frame).await,
		Err(e) => {
			metrics::counter!("huddle_server_frame_errors_total").increment(1);
			debug!(conn_id = handle.conn_id, error = %e, "bad inbound frame");
			handle.send_event(&ServerEvent::error(e.code(), e.to_string()));
		}
	}
}

async fn reject(socket: &mut WebSocket, message: &str) {
	metrics::counter!("huddle_server_auth_rejects_total").increment(1);
	if let Some(frame) = encode_event(&ServerEvent::error(code::INVALID_TOKEN, message)) {
		let _ = socket.send(Message::Text(frame.to_string().into())).await;
	}
	let _ = socket.send(Message::Close(None)).await;
}
