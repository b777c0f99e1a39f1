#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use huddle_domain::{DELETED_MESSAGE_PLACEHOLDER, MemberRole, MessageId, RoomId, UserId};
use huddle_protocol::{ClientFrame, RelayFrame, ServerEvent};
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::server::broadcaster::EventBroadcaster;
use crate::server::dispatcher::{CommandDispatcher, DispatcherSettings};
use crate::server::jobs::{JobQueue, MemoryJobQueue};
use crate::server::registry::{ConnHandle, ConnectionRegistry, OutboundFrame};
use crate::server::room_index::RoomIndex;
use crate::server::store::{ChatStore, MemoryChatStore};
use crate::server::watchdog::JobWatchdog;

const INSTANCE: &str = "inst-test";

struct Fixture {
	store: Arc<MemoryChatStore>,
	jobs: Arc<MemoryJobQueue>,
	registry: ConnectionRegistry,
	index: RoomIndex,
	dispatcher: CommandDispatcher,
	watchdog: JobWatchdog,
	relay_rx: mpsc::Receiver<RelayFrame>,
}

fn fixture() -> Fixture {
	let store = Arc::new(MemoryChatStore::new());
	let jobs = Arc::new(MemoryJobQueue::new());
	let registry = ConnectionRegistry::new();
	let index = RoomIndex::new();
	let watchdog = JobWatchdog::new(Duration::from_secs(30));
	let (relay_tx, relay_rx) = mpsc::channel(64);

	let broadcaster = EventBroadcaster::new(
		registry.clone(),
		index.clone(),
		relay_tx,
		INSTANCE.to_string(),
		watchdog.clone(),
	);

	let dispatcher = CommandDispatcher::new(
		Arc::clone(&store) as Arc<dyn ChatStore>,
		registry.clone(),
		index.clone(),
		broadcaster,
		Arc::clone(&jobs) as Arc<dyn JobQueue>,
		watchdog.clone(),
		DispatcherSettings::default(),
	);

	Fixture {
		store,
		jobs,
		registry,
		index,
		dispatcher,
		watchdog,
		relay_rx,
	}
}

fn user(id: &str) -> UserId {
	UserId::new(id).expect("valid UserId")
}

fn room(id: &str) -> RoomId {
	RoomId::new(id).expect("valid RoomId")
}

async fn connect(fx: &Fixture, conn_id: u64, user_id: &str) -> (ConnHandle, mpsc::Receiver<OutboundFrame>) {
	let (tx, rx) = mpsc::channel(64);
	let handle = ConnHandle::new(conn_id, user(user_id), tx);
	fx.registry.register(handle.clone()).await;
	(handle, rx)
}

async fn join(fx: &Fixture, conn: &ConnHandle, rx: &mut mpsc::Receiver<OutboundFrame>, room_id: &str) {
	fx.dispatcher
		.dispatch(
			conn,
			ClientFrame::RoomJoin {
				room_id: room_id.to_string(),
			},
		)
		.await;
	match next_event(rx).await {
		ServerEvent::RoomJoined(p) => assert_eq!(p.room_id, room_id),
		other => panic!("expected room.joined, got: {other:?}"),
	}
}

async fn next_event(rx: &mut mpsc::Receiver<OutboundFrame>) -> ServerEvent {
	let raw = timeout(Duration::from_millis(250), rx.recv())
		.await
		.expect("expected an event within timeout")
		.expect("channel open");
	serde_json::from_str(&raw).expect("valid event json")
}

fn assert_error(event: ServerEvent, expected_code: &str) {
	match event {
		ServerEvent::Error(p) => assert_eq!(p.code.as_deref(), Some(expected_code)),
		other => panic!("expected error {expected_code}, got: {other:?}"),
	}
}

fn assert_no_event(rx: &mut mpsc::Receiver<OutboundFrame>) {
	assert!(rx.try_recv().is_err(), "expected no queued event");
}

#[tokio::test]
async fn join_without_membership_is_forbidden() {
	let fx = fixture();
	let (conn, mut rx) = connect(&fx, 1, "intruder").await;

	fx.dispatcher
		.dispatch(
			&conn,
			ClientFrame::RoomJoin {
				room_id: "r1".to_string(),
			},
		)
		.await;

	assert_error(next_event(&mut rx).await, "FORBIDDEN");
	assert_eq!(fx.index.subscriber_count(&room("r1")).await, 0);
}

#[tokio::test]
async fn send_fans_out_to_joined_members_and_echoes_temp_id() {
	let mut fx = fixture();
	fx.store.seed_room(room("r1"), "Standup", user("alice")).await;
	fx.store.seed_member(room("r1"), user("bob"), MemberRole::Member, 10).await;

	let (alice, mut alice_rx) = connect(&fx, 1, "alice").await;
	let (bob, mut bob_rx) = connect(&fx, 2, "bob").await;
	join(&fx, &alice, &mut alice_rx, "r1").await;
	join(&fx, &bob, &mut bob_rx, "r1").await;

	fx.dispatcher
		.dispatch(
			&alice,
			ClientFrame::MessageSend {
				room_id: "r1".to_string(),
				content: "hello".to_string(),
				client_temp_id: Some("tmp-1".to_string()),
			},
		)
		.await;

	for rx in [&mut alice_rx, &mut bob_rx] {
		match next_event(rx).await {
			ServerEvent::MessageNew(p) => {
				assert_eq!(p.message.content, "hello");
				assert_eq!(p.message.sender_user_id.as_deref(), Some("alice"));
				assert_eq!(p.client_temp_id.as_deref(), Some("tmp-1"));
			}
			other => panic!("expected message.new, got: {other:?}"),
		}
	}

	// The mutation is also published for the other instances.
	let frame = fx.relay_rx.try_recv().expect("relay frame published");
	assert_eq!(frame.room_id.as_deref(), Some("r1"));
	assert_eq!(frame.origin.as_deref(), Some(INSTANCE));
	assert_eq!(frame.event.kind(), "message.new");
}

#[tokio::test]
async fn send_without_membership_mutates_nothing() {
	let fx = fixture();
	fx.store.seed_room(room("r1"), "Standup", user("alice")).await;

	let (intruder, mut rx) = connect(&fx, 1, "intruder").await;
	fx.dispatcher
		.dispatch(
			&intruder,
			ClientFrame::MessageSend {
				room_id: "r1".to_string(),
				content: "sneaky".to_string(),
				client_temp_id: None,
			},
		)
		.await;

	assert_error(next_event(&mut rx).await, "NOT_IN_ROOM");
	assert_eq!(fx.index.subscriber_count(&room("r1")).await, 0);
}

#[tokio::test]
async fn send_auto_subscribes_a_member_who_never_joined() {
	let fx = fixture();
	fx.store.seed_room(room("r1"), "Standup", user("alice")).await;

	let (alice, mut rx) = connect(&fx, 1, "alice").await;
	fx.dispatcher
		.dispatch(
			&alice,
			ClientFrame::MessageSend {
				room_id: "r1".to_string(),
				content: "first".to_string(),
				client_temp_id: None,
			},
		)
		.await;

	// The membership re-check passed, so the socket was subscribed and
	// observes its own message.
	match next_event(&mut rx).await {
		ServerEvent::MessageNew(p) => assert_eq!(p.message.content, "first"),
		other => panic!("expected message.new, got: {other:?}"),
	}
	assert!(fx.registry.is_joined(1, &room("r1")).await);
}

#[tokio::test]
async fn delete_is_idempotent_and_broadcasts_both_times() {
	let fx = fixture();
	fx.store.seed_room(room("r1"), "Standup", user("alice")).await;

	let (alice, mut rx) = connect(&fx, 1, "alice").await;
	join(&fx, &alice, &mut rx, "r1").await;

	fx.dispatcher
		.dispatch(
			&alice,
			ClientFrame::MessageSend {
				room_id: "r1".to_string(),
				content: "oops".to_string(),
				client_temp_id: None,
			},
		)
		.await;
	let message_id = match next_event(&mut rx).await {
		ServerEvent::MessageNew(p) => p.message.id,
		other => panic!("expected message.new, got: {other:?}"),
	};

	for _ in 0..2 {
		fx.dispatcher
			.dispatch(
				&alice,
				ClientFrame::MessageDelete {
					room_id: "r1".to_string(),
					message_id: message_id.clone(),
				},
			)
			.await;
		match next_event(&mut rx).await {
			ServerEvent::MessageDeleted(p) => assert_eq!(p.message_id, message_id),
			other => panic!("expected message.deleted, got: {other:?}"),
		}
	}

	let stored = fx
		.store
		.find_message(&MessageId::new(message_id).expect("valid id"))
		.await
		.expect("store ok")
		.expect("message kept as a row");
	assert_eq!(stored.content, DELETED_MESSAGE_PLACEHOLDER);
}

#[tokio::test]
async fn only_the_author_may_edit_and_deleted_messages_stay_deleted() {
	let fx = fixture();
	fx.store.seed_room(room("r1"), "Standup", user("alice")).await;
	fx.store.seed_member(room("r1"), user("bob"), MemberRole::Member, 10).await;

	let (alice, mut alice_rx) = connect(&fx, 1, "alice").await;
	let (bob, mut bob_rx) = connect(&fx, 2, "bob").await;
	join(&fx, &alice, &mut alice_rx, "r1").await;
	join(&fx, &bob, &mut bob_rx, "r1").await;

	fx.dispatcher
		.dispatch(
			&alice,
			ClientFrame::MessageSend {
				room_id: "r1".to_string(),
				content: "draft".to_string(),
				client_temp_id: None,
			},
		)
		.await;
	let message_id = match next_event(&mut alice_rx).await {
		ServerEvent::MessageNew(p) => p.message.id,
		other => panic!("expected message.new, got: {other:?}"),
	};
	let _ = next_event(&mut bob_rx).await;

	// Another member is not the author.
	fx.dispatcher
		.dispatch(
			&bob,
			ClientFrame::MessageEdit {
				room_id: "r1".to_string(),
				message_id: message_id.clone(),
				content: "hijacked".to_string(),
			},
		)
		.await;
	assert_error(next_event(&mut bob_rx).await, "FORBIDDEN");

	// The author edits successfully.
	fx.dispatcher
		.dispatch(
			&alice,
			ClientFrame::MessageEdit {
				room_id: "r1".to_string(),
				message_id: message_id.clone(),
				content: "final".to_string(),
			},
		)
		.await;
	match next_event(&mut alice_rx).await {
		ServerEvent::MessageUpdated(dto) => assert_eq!(dto.content, "final"),
		other => panic!("expected message.updated, got: {other:?}"),
	}
	let _ = next_event(&mut bob_rx).await;

	// After a delete, edits are rejected.
	fx.dispatcher
		.dispatch(
			&alice,
			ClientFrame::MessageDelete {
				room_id: "r1".to_string(),
				message_id: message_id.clone(),
			},
		)
		.await;
	let _ = next_event(&mut alice_rx).await;
	let _ = next_event(&mut bob_rx).await;

	fx.dispatcher
		.dispatch(
			&alice,
			ClientFrame::MessageEdit {
				room_id: "r1".to_string(),
				message_id,
				content: "too late".to_string(),
			},
		)
		.await;
	assert_error(next_event(&mut alice_rx).await, "ALREADY_DELETED");
}

#[tokio::test]
async fn sole_owner_cannot_leave_their_room() {
	let fx = fixture();
	fx.store.seed_room(room("r1"), "Standup", user("alice")).await;

	let (alice, mut rx) = connect(&fx, 1, "alice").await;
	join(&fx, &alice, &mut rx, "r1").await;

	fx.dispatcher
		.dispatch(
			&alice,
			ClientFrame::RoomLeave {
				room_id: "r1".to_string(),
			},
		)
		.await;

	assert_error(next_event(&mut rx).await, "OWNER_CANNOT_LEAVE");
	let membership = fx
		.store
		.find_membership(&room("r1"), &user("alice"))
		.await
		.expect("store ok");
	assert!(membership.is_some(), "owner must still be a member");
}

#[tokio::test]
async fn owner_leaving_a_multi_member_room_promotes_the_longest_tenured_member() {
	let fx = fixture();
	fx.store.seed_room(room("r1"), "Standup", user("alice")).await;
	fx.store.seed_user(user("alice"), "Alice").await;
	fx.store.seed_member(room("r1"), user("carol"), MemberRole::Member, 200).await;
	fx.store.seed_member(room("r1"), user("bob"), MemberRole::Member, 100).await;

	let (alice, mut alice_rx) = connect(&fx, 1, "alice").await;
	let (bob, mut bob_rx) = connect(&fx, 2, "bob").await;
	join(&fx, &alice, &mut alice_rx, "r1").await;
	join(&fx, &bob, &mut bob_rx, "r1").await;

	fx.dispatcher
		.dispatch(
			&alice,
			ClientFrame::RoomLeave {
				room_id: "r1".to_string(),
			},
		)
		.await;

	// The remainder sees who left, with their name.
	match next_event(&mut bob_rx).await {
		ServerEvent::RoomMemberRemoved(p) => {
			assert_eq!(p.user_id, "alice");
			assert_eq!(p.display_name.as_deref(), Some("Alice"));
		}
		other => panic!("expected room.member.removed, got: {other:?}"),
	}

	// The leaver gets the sender-only acknowledgement.
	match next_event(&mut alice_rx).await {
		ServerEvent::RoomLeft(p) => assert_eq!(p.room_id, "r1"),
		other => panic!("expected room.left, got: {other:?}"),
	}

	assert!(
		fx.store
			.find_membership(&room("r1"), &user("alice"))
			.await
			.expect("store ok")
			.is_none()
	);

	// bob joined before carol, so bob takes ownership.
	let bob_membership = fx
		.store
		.find_membership(&room("r1"), &user("bob"))
		.await
		.expect("store ok")
		.expect("bob is a member");
	assert_eq!(bob_membership.role, MemberRole::Owner);

	let carol_membership = fx
		.store
		.find_membership(&room("r1"), &user("carol"))
		.await
		.expect("store ok")
		.expect("carol is a member");
	assert_eq!(carol_membership.role, MemberRole::Member);
}

#[tokio::test]
async fn last_member_leaving_deletes_the_room_and_its_messages() {
	let fx = fixture();
	fx.store.seed_room(room("r1"), "Standup", user("alice")).await;
	fx.store.seed_member(room("r1"), user("bob"), MemberRole::Member, 10).await;
	// Membership can change through other paths too; the owner row was
	// removed out-of-band, leaving bob as the sole plain member.
	fx.store
		.remove_member(&room("r1"), &user("alice"))
		.await
		.expect("store ok");

	let (bob, mut rx) = connect(&fx, 1, "bob").await;
	join(&fx, &bob, &mut rx, "r1").await;

	fx.dispatcher
		.dispatch(
			&bob,
			ClientFrame::MessageSend {
				room_id: "r1".to_string(),
				content: "last words".to_string(),
				client_temp_id: None,
			},
		)
		.await;
	let message_id = match next_event(&mut rx).await {
		ServerEvent::MessageNew(p) => p.message.id,
		other => panic!("expected message.new, got: {other:?}"),
	};

	fx.dispatcher
		.dispatch(
			&bob,
			ClientFrame::RoomLeave {
				room_id: "r1".to_string(),
			},
		)
		.await;
	match next_event(&mut rx).await {
		ServerEvent::RoomLeft(p) => assert_eq!(p.room_id, "r1"),
		other => panic!("expected room.left, got: {other:?}"),
	}

	assert!(fx.store.find_room(&room("r1")).await.expect("store ok").is_none());
	assert!(
		fx.store
			.find_message(&MessageId::new(message_id).expect("valid id"))
			.await
			.expect("store ok")
			.is_none(),
		"messages are deleted with the room"
	);
}

#[tokio::test]
async fn rename_is_owner_only_and_blank_titles_get_the_fallback() {
	let fx = fixture();
	fx.store.seed_room(room("r1"), "Standup", user("alice")).await;
	fx.store.seed_member(room("r1"), user("bob"), MemberRole::Member, 10).await;

	let (alice, mut alice_rx) = connect(&fx, 1, "alice").await;
	let (bob, mut bob_rx) = connect(&fx, 2, "bob").await;
	join(&fx, &alice, &mut alice_rx, "r1").await;
	join(&fx, &bob, &mut bob_rx, "r1").await;

	fx.dispatcher
		.dispatch(
			&bob,
			ClientFrame::RoomRename {
				room_id: "r1".to_string(),
				title: "Bob's Room".to_string(),
			},
		)
		.await;
	assert_error(next_event(&mut bob_rx).await, "OWNER_ONLY");

	fx.dispatcher
		.dispatch(
			&alice,
			ClientFrame::RoomRename {
				room_id: "r1".to_string(),
				title: "   ".to_string(),
			},
		)
		.await;
	match next_event(&mut alice_rx).await {
		ServerEvent::RoomUpdated(p) => assert_eq!(p.title, "New Room"),
		other => panic!("expected room.updated, got: {other:?}"),
	}
	match next_event(&mut bob_rx).await {
		ServerEvent::RoomUpdated(p) => assert_eq!(p.title, "New Room"),
		other => panic!("expected room.updated, got: {other:?}"),
	}
}

#[tokio::test]
async fn sole_owner_lifecycle_create_send_leave_delete() {
	let fx = fixture();
	fx.store.seed_room(room("standup"), "Standup", user("alice")).await;

	let (alice, mut rx) = connect(&fx, 1, "alice").await;
	join(&fx, &alice, &mut rx, "standup").await;

	fx.dispatcher
		.dispatch(
			&alice,
			ClientFrame::MessageSend {
				room_id: "standup".to_string(),
				content: "hello".to_string(),
				client_temp_id: None,
			},
		)
		.await;
	let message_id = match next_event(&mut rx).await {
		ServerEvent::MessageNew(p) => {
			assert_eq!(p.message.content, "hello");
			p.message.id
		}
		other => panic!("expected message.new, got: {other:?}"),
	};

	fx.dispatcher
		.dispatch(
			&alice,
			ClientFrame::RoomLeave {
				room_id: "standup".to_string(),
			},
		)
		.await;
	assert_error(next_event(&mut rx).await, "OWNER_CANNOT_LEAVE");

	fx.dispatcher
		.dispatch(
			&alice,
			ClientFrame::RoomDelete {
				room_id: "standup".to_string(),
			},
		)
		.await;
	match next_event(&mut rx).await {
		ServerEvent::RoomDeleted(p) => assert_eq!(p.room_id, "standup"),
		other => panic!("expected room.deleted, got: {other:?}"),
	}

	assert!(fx.store.find_room(&room("standup")).await.expect("store ok").is_none());
	assert!(
		fx.store
			.find_message(&MessageId::new(message_id).expect("valid id"))
			.await
			.expect("store ok")
			.is_none()
	);

	// The membership rows cascaded away, so further sends are rejected
	// by the authority.
	fx.dispatcher
		.dispatch(
			&alice,
			ClientFrame::MessageSend {
				room_id: "standup".to_string(),
				content: "anyone there?".to_string(),
				client_temp_id: None,
			},
		)
		.await;
	assert_error(next_event(&mut rx).await, "NOT_IN_ROOM");
}

#[tokio::test]
async fn rtc_signals_are_annotated_and_rebroadcast_without_persistence() {
	let fx = fixture();
	fx.store.seed_room(room("r1"), "Standup", user("alice")).await;
	fx.store.seed_member(room("r1"), user("bob"), MemberRole::Member, 10).await;

	let (alice, mut alice_rx) = connect(&fx, 1, "alice").await;
	let (bob, mut bob_rx) = connect(&fx, 2, "bob").await;
	join(&fx, &alice, &mut alice_rx, "r1").await;
	join(&fx, &bob, &mut bob_rx, "r1").await;

	fx.dispatcher
		.dispatch(
			&alice,
			ClientFrame::RtcOffer {
				room_id: "r1".to_string(),
				sdp: serde_json::json!({"type": "offer", "sdp": "v=0"}),
			},
		)
		.await;

	match next_event(&mut bob_rx).await {
		ServerEvent::RtcOffer(p) => {
			assert_eq!(p.from_user_id, "alice");
			assert_eq!(p.sdp["type"], "offer");
		}
		other => panic!("expected rtc.offer, got: {other:?}"),
	}

	let (intruder, mut intruder_rx) = connect(&fx, 3, "intruder").await;
	fx.dispatcher
		.dispatch(
			&intruder,
			ClientFrame::RtcHangup {
				room_id: "r1".to_string(),
			},
		)
		.await;
	assert_error(next_event(&mut intruder_rx).await, "NOT_IN_ROOM");
}

#[tokio::test]
async fn trigger_phrase_enqueues_an_agent_job_alongside_the_message() {
	let fx = fixture();
	fx.store.seed_room(room("r1"), "Standup", user("alice")).await;

	let (alice, mut rx) = connect(&fx, 1, "alice").await;
	join(&fx, &alice, &mut rx, "r1").await;

	fx.dispatcher
		.dispatch(
			&alice,
			ClientFrame::MessageSend {
				room_id: "r1".to_string(),
				content: "@jarvis summarize today".to_string(),
				client_temp_id: None,
			},
		)
		.await;

	let message_id = match next_event(&mut rx).await {
		ServerEvent::MessageNew(p) => p.message.id,
		other => panic!("expected message.new, got: {other:?}"),
	};

	let jobs = fx.jobs.drain().await;
	assert_eq!(jobs.len(), 1);
	assert_eq!(jobs[0].prompt, "summarize today");
	assert_eq!(jobs[0].room_id, "r1");
	assert_eq!(jobs[0].requested_by, "alice");
	assert_eq!(jobs[0].message_id.as_deref(), Some(message_id.as_str()));
	assert_eq!(fx.watchdog.pending_count().await, 1);
}

#[tokio::test]
async fn agent_request_is_fire_and_forget() {
	let fx = fixture();
	fx.store.seed_room(room("r1"), "Standup", user("alice")).await;

	let (alice, mut rx) = connect(&fx, 1, "alice").await;

	fx.dispatcher
		.dispatch(
			&alice,
			ClientFrame::AgentRequest {
				room_id: "r1".to_string(),
				prompt: "what changed today".to_string(),
				message_id: None,
				is_personal: true,
				request_id: Some("q-1".to_string()),
			},
		)
		.await;

	assert_no_event(&mut rx);

	let jobs = fx.jobs.drain().await;
	assert_eq!(jobs.len(), 1);
	assert!(jobs[0].personal);
	assert_eq!(jobs[0].request_id.as_deref(), Some("q-1"));
	assert_eq!(fx.watchdog.pending_count().await, 1);
}
