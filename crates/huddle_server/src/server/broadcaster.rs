#![forbid(unsafe_code)]

use std::sync::Arc;

use huddle_domain::{RoomId, UserId};
use huddle_protocol::{RelayFrame, ServerEvent};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::server::registry::{ConnectionRegistry, encode_event};
use crate::server::room_index::RoomIndex;
use crate::server::watchdog::JobWatchdog;

/// Single egress point for every mutation other participants must
/// observe: local fan-out plus a publish onto the cross-instance relay
/// channel. Route handlers never write to sockets directly.
#[derive(Debug, Clone)]
pub struct EventBroadcaster {
	registry: ConnectionRegistry,
	index: RoomIndex,
	relay_tx: mpsc::Sender<RelayFrame>,
	instance_id: Arc<String>,
	watchdog: JobWatchdog,
}

impl EventBroadcaster {
	pub fn new(
		registry: ConnectionRegistry,
		index: RoomIndex,
		relay_tx: mpsc::Sender<RelayFrame>,
		instance_id: String,
		watchdog: JobWatchdog,
	) -> Self {
		Self {
			registry,
			index,
			relay_tx,
			instance_id: Arc::new(instance_id),
			watchdog,
		}
	}

	/// Stable per-process id used as the relay origin tag.
	pub fn instance_id(&self) -> &str {
		&self.instance_id
	}

	/// Deliver to every local connection joined to `room` and publish
	/// for the other instances.
	pub async fn to_room(&self, room: &RoomId, event: ServerEvent) {
		self.index.broadcast_local(room, &event).await;
		self.publish(RelayFrame::room(room.as_str(), self.instance_id.as_str(), event));
	}

	/// Deliver to every local connection of `user` and publish for the
	/// other instances.
	pub async fn to_user(&self, user: &UserId, event: ServerEvent) {
		if let Some(frame) = encode_event(&event) {
			self.registry.deliver_to_user(user, frame).await;
		}
		self.publish(RelayFrame::user(user.as_str(), self.instance_id.as_str(), event));
	}

	fn publish(&self, frame: RelayFrame) {
		match self.relay_tx.try_send(frame) {
			Ok(()) => {
				metrics::counter!("huddle_server_relay_published_total").increment(1);
			}
			Err(mpsc::error::TrySendError::Full(frame)) => {
				metrics::counter!("huddle_server_relay_publish_drops_total").increment(1);
				warn!(kind = frame.event.kind(), "relay publish queue full; dropping frame");
			}
			Err(mpsc::error::TrySendError::Closed(_)) => {
				debug!("relay publish channel closed");
			}
		}
	}

	/// Apply one frame received from the shared pub/sub channel.
	pub async fn deliver_inbound(&self, frame: RelayFrame) {
		metrics::counter!("huddle_server_relay_received_total").increment(1);

		if frame.origin.as_deref() == Some(self.instance_id.as_str()) {
			// Our own echo: already delivered locally at publish time.
			metrics::counter!("huddle_server_relay_echoes_total").increment(1);
			return;
		}

		self.watchdog.observe(&frame).await;

		if let Some(target) = frame.target_user_id.as_deref() {
			let Ok(user) = UserId::new(target) else {
				debug!("relay frame with empty targetUserId dropped");
				return;
			};
			if let Some(raw) = encode_event(&frame.event) {
				self.registry.deliver_to_user(&user, raw).await;
			}
			return;
		}

		if let Some(room) = frame.room_id.as_deref() {
			let Ok(room) = RoomId::new(room) else {
				debug!("relay frame with empty roomId dropped");
				return;
			};

			let room_deleted = matches!(frame.event, ServerEvent::RoomDeleted(_));
			self.index.broadcast_local(&room, &frame.event).await;

			if room_deleted {
				self.index.remove_room(&room).await;
				self.registry.forget_room(&room).await;
			}
			return;
		}

		debug!(kind = frame.event.kind(), "relay frame without scope dropped");
	}
}
