#![forbid(unsafe_code)]

use huddle_domain::{RoomId, UserId};
use huddle_protocol::{RoomRefPayload, ServerEvent};
use tokio::sync::mpsc;

use crate::server::registry::{ConnHandle, OutboundFrame};
use crate::server::room_index::RoomIndex;

fn room(id: &str) -> RoomId {
	RoomId::new(id).expect("valid RoomId")
}

fn conn(conn_id: u64, user_id: &str) -> (ConnHandle, mpsc::Receiver<OutboundFrame>) {
	let (tx, rx) = mpsc::channel(16);
	(
		ConnHandle::new(conn_id, UserId::new(user_id).expect("valid UserId"), tx),
		rx,
	)
}

fn joined_event(id: &str) -> ServerEvent {
	ServerEvent::RoomJoined(RoomRefPayload {
		room_id: id.to_string(),
	})
}

#[tokio::test]
async fn broadcast_reaches_only_subscribed_connections() {
	let index = RoomIndex::new();

	let (c1, mut rx1) = conn(1, "u1");
	let (c2, mut rx2) = conn(2, "u2");

	index.subscribe(room("a"), c1).await;
	index.subscribe(room("b"), c2).await;

	let delivered = index.broadcast_local(&room("a"), &joined_event("a")).await;
	assert_eq!(delivered, 1);

	assert!(rx1.try_recv().is_ok());
	// u2 is a would-be member who never subscribed to room a.
	assert!(rx2.try_recv().is_err());
}

#[tokio::test]
async fn subscribe_is_idempotent() {
	let index = RoomIndex::new();

	let (c1, mut rx1) = conn(1, "u1");
	index.subscribe(room("a"), c1.clone()).await;
	index.subscribe(room("a"), c1).await;

	let delivered = index.broadcast_local(&room("a"), &joined_event("a")).await;
	assert_eq!(delivered, 1);
	assert!(rx1.try_recv().is_ok());
	assert!(rx1.try_recv().is_err());
}

#[tokio::test]
async fn broken_subscriber_does_not_abort_delivery_to_the_rest() {
	let index = RoomIndex::new();

	let (dead, dead_rx) = conn(1, "u1");
	let (live, mut live_rx) = conn(2, "u2");

	index.subscribe(room("a"), dead).await;
	index.subscribe(room("a"), live).await;
	drop(dead_rx);

	let delivered = index.broadcast_local(&room("a"), &joined_event("a")).await;
	assert_eq!(delivered, 1);
	assert!(live_rx.try_recv().is_ok());

	// The closed subscriber was pruned on the walk.
	assert_eq!(index.subscriber_count(&room("a")).await, 1);
}

#[tokio::test]
async fn unsubscribe_and_remove_room_stop_delivery() {
	let index = RoomIndex::new();

	let (c1, mut rx1) = conn(1, "u1");
	let (c2, mut rx2) = conn(2, "u2");
	index.subscribe(room("a"), c1).await;
	index.subscribe(room("a"), c2).await;

	index.unsubscribe(&room("a"), 1).await;
	index.broadcast_local(&room("a"), &joined_event("a")).await;
	assert!(rx1.try_recv().is_err());
	assert!(rx2.try_recv().is_ok());

	index.remove_room(&room("a")).await;
	assert_eq!(index.subscriber_count(&room("a")).await, 0);
	let delivered = index.broadcast_local(&room("a"), &joined_event("a")).await;
	assert_eq!(delivered, 0);
}

#[tokio::test]
async fn full_queue_skips_that_connection_only() {
	let index = RoomIndex::new();

	let (tx, mut rx_small) = mpsc::channel(1);
	let clogged = ConnHandle::new(1, UserId::new("u1").expect("valid UserId"), tx);
	let (live, mut live_rx) = conn(2, "u2");

	index.subscribe(room("a"), clogged).await;
	index.subscribe(room("a"), live).await;

	index.broadcast_local(&room("a"), &joined_event("a")).await;
	// Queue of one is now full; the second broadcast drops for the
	// clogged connection but still reaches the healthy one.
	let delivered = index.broadcast_local(&room("a"), &joined_event("a")).await;
	assert_eq!(delivered, 1);

	assert!(rx_small.try_recv().is_ok());
	assert!(rx_small.try_recv().is_err());
	assert!(live_rx.try_recv().is_ok());
	assert!(live_rx.try_recv().is_ok());
}
