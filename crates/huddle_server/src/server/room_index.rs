#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use huddle_domain::RoomId;
use huddle_protocol::ServerEvent;
use tokio::sync::Mutex;
use tracing::debug;

use crate::server::registry::{ConnHandle, encode_event};

/// Inverted index from room id to the connections subscribed to it.
/// Supports O(members) local broadcast. Like the registry this is
/// derived state only; membership truth lives in the store.
#[derive(Debug, Clone, Default)]
pub struct RoomIndex {
	inner: Arc<Mutex<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
	rooms: HashMap<RoomId, HashMap<u64, ConnHandle>>,
}

impl RoomIndex {
	pub fn new() -> Self {
		Self::default()
	}

	/// Subscribe a connection to a room. Subscribing twice is a no-op.
	pub async fn subscribe(&self, room: RoomId, handle: ConnHandle) {
		let mut inner = self.inner.lock().await;
		let entry = inner.rooms.entry(room.clone()).or_default();

		prune_closed(entry);

		if entry.insert(handle.conn_id, handle).is_none() {
			debug!(room = %room, subs = entry.len(), "room index: subscribed");
		}
	}

	/// Remove one connection's subscription.
	pub async fn unsubscribe(&self, room: &RoomId, conn_id: u64) {
		let mut inner = self.inner.lock().await;
		if let Some(entry) = inner.rooms.get_mut(room) {
			entry.remove(&conn_id);
			if entry.is_empty() {
				inner.rooms.remove(room);
			}
		}
	}

	/// Drop an entire room (the room was deleted).
	pub async fn remove_room(&self, room: &RoomId) {
		let mut inner = self.inner.lock().await;
		if inner.rooms.remove(room).is_some() {
			debug!(room = %room, "room index: room removed");
		}
	}

	/// Serialize the event once and queue it to every subscribed
	/// connection. A failed send on one connection never aborts
	/// delivery to the rest. Returns the number of queued deliveries.
	pub async fn broadcast_local(&self, room: &RoomId, event: &ServerEvent) -> usize {
		let Some(frame) = encode_event(event) else {
			return 0;
		};

		let mut inner = self.inner.lock().await;
		let Some(entry) = inner.rooms.get_mut(room) else {
			return 0;
		};

		prune_closed(entry);

		let mut delivered = 0;
		for handle in entry.values() {
			if handle.try_send_raw(Arc::clone(&frame)) {
				delivered += 1;
			}
		}

		if entry.is_empty() {
			inner.rooms.remove(room);
		}

		metrics::counter!("huddle_server_events_out_total").increment(delivered as u64);
		delivered
	}

	/// Snapshot of one room's live subscriber count.
	pub async fn subscriber_count(&self, room: &RoomId) -> usize {
		let inner = self.inner.lock().await;
		inner
			.rooms
			.get(room)
			.map(|e| e.values().filter(|h| !h.is_closed()).count())
			.unwrap_or(0)
	}
}

fn prune_closed(entry: &mut HashMap<u64, ConnHandle>) {
	entry.retain(|_, handle| !handle.is_closed());
}
