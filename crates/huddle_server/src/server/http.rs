#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;

use crate::server::connection::{ConnectionSettings, ws_handler};
use crate::server::dispatcher::CommandDispatcher;
use crate::server::registry::ConnectionRegistry;
use crate::server::room_index::RoomIndex;
use crate::server::store::ChatStore;
use crate::util::secret::SecretString;

/// Readiness flag flipped once startup completes.
#[derive(Clone, Default)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
}

impl HealthState {
	pub fn new() -> Self {
		Self {
			ready: Arc::new(AtomicBool::new(false)),
		}
	}

	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}
}

/// Shared per-process state handed to the axum router.
pub struct AppState {
	pub dispatcher: CommandDispatcher,
	pub registry: ConnectionRegistry,
	pub index: RoomIndex,
	pub store: Arc<dyn ChatStore>,
	pub auth_secret: SecretString,
	pub conn_settings: ConnectionSettings,
	pub health: HealthState,
	next_conn_id: AtomicU64,
}

impl AppState {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		dispatcher: CommandDispatcher,
		registry: ConnectionRegistry,
		index: RoomIndex,
		store: Arc<dyn ChatStore>,
		auth_secret: SecretString,
		conn_settings: ConnectionSettings,
		health: HealthState,
	) -> Self {
		Self {
			dispatcher,
			registry,
			index,
			store,
			auth_secret,
			conn_settings,
			health,
			next_conn_id: AtomicU64::new(0),
		}
	}

	pub fn next_conn_id(&self) -> u64 {
		self.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1
	}
}

/// The hub's HTTP surface: the WebSocket upgrade plus health probes.
pub fn build_router(state: Arc<AppState>) -> Router {
	Router::new()
		.route("/ws", get(ws_handler))
		.route("/healthz", get(healthz))
		.route("/readyz", get(readyz))
		.with_state(state)
}

async fn healthz() -> &'static str {
	"ok"
}

async fn readyz(State(state): State<Arc<AppState>>) -> (StatusCode, &'static str) {
	if state.health.is_ready() {
		(StatusCode::OK, "ready")
	} else {
		(StatusCode::SERVICE_UNAVAILABLE, "not-ready")
	}
}
