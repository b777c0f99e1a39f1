#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use huddle_domain::{RoomId, UserId};
use huddle_protocol::ServerEvent;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

/// Pre-serialized outbound frame, shared across recipients so a room
/// broadcast serializes exactly once.
pub type OutboundFrame = Arc<str>;

/// Serialize an event once for fan-out.
pub(crate) fn encode_event(event: &ServerEvent) -> Option<OutboundFrame> {
	match serde_json::to_string(event) {
		Ok(raw) => Some(OutboundFrame::from(raw)),
		Err(e) => {
			warn!(kind = event.kind(), error = %e, "failed to serialize event");
			None
		}
	}
}

/// Handle to one live authenticated connection. Cloned into the room
/// index; the receiving half lives with the connection's writer task.
#[derive(Debug, Clone)]
pub struct ConnHandle {
	pub conn_id: u64,
	pub user_id: UserId,
	tx: mpsc::Sender<OutboundFrame>,
}

impl ConnHandle {
	pub fn new(conn_id: u64, user_id: UserId, tx: mpsc::Sender<OutboundFrame>) -> Self {
		Self { conn_id, user_id, tx }
	}

	/// Queue one pre-serialized frame. A full or closed receiver means
	/// the frame is skipped for this connection only.
	pub fn try_send_raw(&self, frame: OutboundFrame) -> bool {
		match self.tx.try_send(frame) {
			Ok(()) => true,
			Err(mpsc::error::TrySendError::Full(_)) => {
				metrics::counter!("huddle_server_outbound_drops_total").increment(1);
				warn!(conn_id = self.conn_id, "outbound queue full; dropping frame");
				false
			}
			Err(mpsc::error::TrySendError::Closed(_)) => false,
		}
	}

	/// Serialize and queue one event for this connection alone.
	pub fn send_event(&self, event: &ServerEvent) {
		if let Some(frame) = encode_event(event) {
			self.try_send_raw(frame);
		}
	}

	pub fn is_closed(&self) -> bool {
		self.tx.is_closed()
	}
}

/// Presence transition produced by register/unregister. Only the 0→1
/// and 1→0 edges touch the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceChange {
	WentOnline,
	WentOffline,
	Unchanged,
}

/// Result of unregistering a connection.
#[derive(Debug)]
pub struct UnregisterOutcome {
	pub user_id: UserId,
	/// Rooms the connection was still joined to; the caller removes
	/// these from the room index.
	pub rooms: Vec<RoomId>,
	pub presence: PresenceChange,
}

/// Tracks live connections, their joined rooms, and per-user connection
/// counts. Purely derived state: safe to discard on crash and rebuilt
/// by clients rejoining.
#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
	inner: Arc<Mutex<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
	conns: HashMap<u64, ConnEntry>,
	conns_by_user: HashMap<UserId, HashSet<u64>>,
}

#[derive(Debug)]
struct ConnEntry {
	handle: ConnHandle,
	rooms: HashSet<RoomId>,
}

impl ConnectionRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Track a connection. Returns `WentOnline` on the user's 0→1
	/// connection transition.
	pub async fn register(&self, handle: ConnHandle) -> PresenceChange {
		let mut inner = self.inner.lock().await;
		let user_id = handle.user_id.clone();
		let conn_id = handle.conn_id;

		inner.conns.insert(
			conn_id,
			ConnEntry {
				handle,
				rooms: HashSet::new(),
			},
		);

		let conns = inner.conns_by_user.entry(user_id.clone()).or_default();
		conns.insert(conn_id);

		if conns.len() == 1 {
			debug!(conn_id, user_id = %user_id, "user went online");
			PresenceChange::WentOnline
		} else {
			PresenceChange::Unchanged
		}
	}

	/// Drop a connection. Returns the rooms it was joined to so the
	/// caller can clean up the room index, and `WentOffline` on the
	/// user's 1→0 transition.
	pub async fn unregister(&self, conn_id: u64) -> Option<UnregisterOutcome> {
		let mut inner = self.inner.lock().await;
		let entry = inner.conns.remove(&conn_id)?;
		let user_id = entry.handle.user_id.clone();

		let presence = match inner.conns_by_user.get_mut(&user_id) {
			Some(set) => {
				set.remove(&conn_id);
				if set.is_empty() {
					inner.conns_by_user.remove(&user_id);
					debug!(conn_id, user_id = %user_id, "user went offline");
					PresenceChange::WentOffline
				} else {
					PresenceChange::Unchanged
				}
			}
			None => PresenceChange::Unchanged,
		};

		Some(UnregisterOutcome {
			user_id,
			rooms: entry.rooms.into_iter().collect(),
			presence,
		})
	}

	/// Record a successful room join for broadcast-routing purposes.
	/// Never consulted as authorization.
	pub async fn note_joined(&self, conn_id: u64, room: RoomId) {
		let mut inner = self.inner.lock().await;
		if let Some(entry) = inner.conns.get_mut(&conn_id) {
			entry.rooms.insert(room);
		}
	}

	pub async fn note_left(&self, conn_id: u64, room: &RoomId) {
		let mut inner = self.inner.lock().await;
		if let Some(entry) = inner.conns.get_mut(&conn_id) {
			entry.rooms.remove(room);
		}
	}

	/// Whether this connection already tracks the room locally.
	pub async fn is_joined(&self, conn_id: u64, room: &RoomId) -> bool {
		let inner = self.inner.lock().await;
		inner.conns.get(&conn_id).map(|e| e.rooms.contains(room)).unwrap_or(false)
	}

	/// Remove a deleted room from every connection's joined set.
	pub async fn forget_room(&self, room: &RoomId) {
		let mut inner = self.inner.lock().await;
		for entry in inner.conns.values_mut() {
			entry.rooms.remove(room);
		}
	}

	/// Deliver a pre-serialized frame to every live connection of one
	/// user. Returns the number of queued deliveries.
	pub async fn deliver_to_user(&self, user_id: &UserId, frame: OutboundFrame) -> usize {
		let inner = self.inner.lock().await;

		let Some(conn_ids) = inner.conns_by_user.get(user_id) else {
			return 0;
		};
		let conn_ids: Vec<u64> = conn_ids.iter().copied().collect();

		let mut delivered = 0;
		for conn_id in conn_ids {
			let Some(entry) = inner.conns.get(&conn_id) else {
				continue;
			};
			if entry.handle.is_closed() {
				continue;
			}
			if entry.handle.try_send_raw(Arc::clone(&frame)) {
				delivered += 1;
			}
		}

		// Closed handles linger until their connection task unregisters;
		// deliveries simply skip them in the meantime.
		delivered
	}

	/// Number of live connections for a user (0 means offline).
	pub async fn user_connection_count(&self, user_id: &UserId) -> usize {
		let inner = self.inner.lock().await;
		inner.conns_by_user.get(user_id).map(|s| s.len()).unwrap_or(0)
	}
}
