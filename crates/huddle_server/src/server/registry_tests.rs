#![forbid(unsafe_code)]

use huddle_domain::{RoomId, UserId};
use tokio::sync::mpsc;

use crate::server::registry::{ConnHandle, ConnectionRegistry, OutboundFrame, PresenceChange};

fn user(id: &str) -> UserId {
	UserId::new(id).expect("valid UserId")
}

fn room(id: &str) -> RoomId {
	RoomId::new(id).expect("valid RoomId")
}

fn conn(conn_id: u64, user_id: &str) -> (ConnHandle, mpsc::Receiver<OutboundFrame>) {
	let (tx, rx) = mpsc::channel(16);
	(ConnHandle::new(conn_id, user(user_id), tx), rx)
}

#[tokio::test]
async fn presence_transitions_only_on_first_and_last_connection() {
	let registry = ConnectionRegistry::new();

	let (c1, _rx1) = conn(1, "u1");
	let (c2, _rx2) = conn(2, "u1");

	assert_eq!(registry.register(c1).await, PresenceChange::WentOnline);
	assert_eq!(registry.register(c2).await, PresenceChange::Unchanged);
	assert_eq!(registry.user_connection_count(&user("u1")).await, 2);

	let first = registry.unregister(1).await.expect("registered");
	assert_eq!(first.presence, PresenceChange::Unchanged);

	let last = registry.unregister(2).await.expect("registered");
	assert_eq!(last.presence, PresenceChange::WentOffline);
	assert_eq!(registry.user_connection_count(&user("u1")).await, 0);
}

#[tokio::test]
async fn unregister_reports_joined_rooms_for_cleanup() {
	let registry = ConnectionRegistry::new();

	let (c1, _rx) = conn(1, "u1");
	registry.register(c1).await;
	registry.note_joined(1, room("a")).await;
	registry.note_joined(1, room("b")).await;
	registry.note_left(1, &room("b")).await;

	assert!(registry.is_joined(1, &room("a")).await);
	assert!(!registry.is_joined(1, &room("b")).await);

	let outcome = registry.unregister(1).await.expect("registered");
	assert_eq!(outcome.rooms, vec![room("a")]);

	assert!(registry.unregister(1).await.is_none());
}

#[tokio::test]
async fn deliver_to_user_targets_only_that_users_connections() {
	let registry = ConnectionRegistry::new();

	let (c1, mut rx1) = conn(1, "u1");
	let (c2, mut rx2) = conn(2, "u1");
	let (c3, mut rx3) = conn(3, "u2");
	registry.register(c1).await;
	registry.register(c2).await;
	registry.register(c3).await;

	let frame = OutboundFrame::from(r#"{"type":"room.added","payload":{"roomId":"r1","title":"T"}}"#);
	let delivered = registry.deliver_to_user(&user("u1"), frame).await;

	assert_eq!(delivered, 2);
	assert!(rx1.try_recv().is_ok());
	assert!(rx2.try_recv().is_ok());
	assert!(rx3.try_recv().is_err());
}

#[tokio::test]
async fn forget_room_clears_every_connection() {
	let registry = ConnectionRegistry::new();

	let (c1, _rx1) = conn(1, "u1");
	let (c2, _rx2) = conn(2, "u2");
	registry.register(c1).await;
	registry.register(c2).await;
	registry.note_joined(1, room("a")).await;
	registry.note_joined(2, room("a")).await;

	registry.forget_room(&room("a")).await;

	assert!(!registry.is_joined(1, &room("a")).await);
	assert!(!registry.is_joined(2, &room("a")).await);
}
