#![forbid(unsafe_code)]

use std::time::Duration;

use huddle_domain::{RoomId, UserId};
use huddle_protocol::{AgentJob, BotChunkPayload, MessageDto, RelayFrame, ServerEvent};
use tokio::sync::mpsc;

use crate::server::broadcaster::EventBroadcaster;
use crate::server::registry::{ConnHandle, ConnectionRegistry, OutboundFrame};
use crate::server::room_index::RoomIndex;
use crate::server::watchdog::JobWatchdog;

const TIMEOUT: Duration = Duration::from_secs(5);

struct Fixture {
	registry: ConnectionRegistry,
	index: RoomIndex,
	watchdog: JobWatchdog,
	broadcaster: EventBroadcaster,
}

fn fixture() -> Fixture {
	let registry = ConnectionRegistry::new();
	let index = RoomIndex::new();
	let watchdog = JobWatchdog::new(TIMEOUT);
	let (relay_tx, mut relay_rx) = mpsc::channel(64);
	// Timeout errors publish like any other event; drain them.
	tokio::spawn(async move { while relay_rx.recv().await.is_some() {} });

	let broadcaster = EventBroadcaster::new(
		registry.clone(),
		index.clone(),
		relay_tx,
		"inst-test".to_string(),
		watchdog.clone(),
	);

	Fixture {
		registry,
		index,
		watchdog,
		broadcaster,
	}
}

fn user(id: &str) -> UserId {
	UserId::new(id).expect("valid UserId")
}

fn room(id: &str) -> RoomId {
	RoomId::new(id).expect("valid RoomId")
}

async fn connect(fx: &Fixture, conn_id: u64, user_id: &str) -> (ConnHandle, mpsc::Receiver<OutboundFrame>) {
	let (tx, rx) = mpsc::channel(16);
	let handle = ConnHandle::new(conn_id, user(user_id), tx);
	fx.registry.register(handle.clone()).await;
	(handle, rx)
}

fn drain_error_code(rx: &mut mpsc::Receiver<OutboundFrame>) -> Option<String> {
	let raw = rx.try_recv().ok()?;
	match serde_json::from_str::<ServerEvent>(&raw).expect("valid event json") {
		ServerEvent::Error(p) => p.code,
		other => panic!("expected error event, got: {other:?}"),
	}
}

fn job(room_id: &str, request_id: Option<&str>, personal: bool) -> AgentJob {
	let mut job = AgentJob::new(room_id, "alice", "summarize");
	job.request_id = request_id.map(str::to_string);
	job.personal = personal;
	job
}

#[tokio::test(start_paused = true)]
async fn expired_room_job_emits_a_timeout_error_to_the_room() {
	let fx = fixture();

	let (handle, mut rx) = connect(&fx, 1, "alice").await;
	fx.index.subscribe(room("r1"), handle).await;

	let job = job("r1", None, false);
	fx.watchdog.register(&job, room("r1"), user("alice")).await;

	tokio::spawn(fx.watchdog.clone().run(fx.broadcaster.clone()));

	tokio::time::sleep(TIMEOUT + Duration::from_secs(2)).await;

	assert_eq!(drain_error_code(&mut rx).as_deref(), Some("AGENT_TIMEOUT"));
	assert_eq!(fx.watchdog.pending_count().await, 0);
}

#[tokio::test(start_paused = true)]
async fn expired_personal_job_targets_the_requesting_user() {
	let fx = fixture();

	let (_handle, mut rx) = connect(&fx, 1, "alice").await;

	let job = job("r1", Some("q-1"), true);
	fx.watchdog.register(&job, room("r1"), user("alice")).await;

	tokio::spawn(fx.watchdog.clone().run(fx.broadcaster.clone()));

	tokio::time::sleep(TIMEOUT + Duration::from_secs(2)).await;

	assert_eq!(drain_error_code(&mut rx).as_deref(), Some("AGENT_TIMEOUT"));
}

#[tokio::test(start_paused = true)]
async fn bot_done_clears_the_pending_job() {
	let fx = fixture();

	let (handle, mut rx) = connect(&fx, 1, "alice").await;
	fx.index.subscribe(room("r1"), handle).await;

	let job = job("r1", None, false);
	fx.watchdog.register(&job, room("r1"), user("alice")).await;

	let done = RelayFrame {
		room_id: Some("r1".to_string()),
		target_user_id: None,
		origin: None,
		event: ServerEvent::BotDone(MessageDto {
			id: "m1".to_string(),
			room_id: "r1".to_string(),
			sender_type: "bot".to_string(),
			sender_user_id: None,
			content: "answer".to_string(),
			created_at: 0,
		}),
	};
	fx.watchdog.observe(&done).await;
	assert_eq!(fx.watchdog.pending_count().await, 0);

	tokio::spawn(fx.watchdog.clone().run(fx.broadcaster.clone()));
	tokio::time::sleep(TIMEOUT + Duration::from_secs(2)).await;

	assert!(drain_error_code(&mut rx).is_none(), "no timeout after completion");
}

#[tokio::test(start_paused = true)]
async fn streaming_chunks_extend_the_deadline() {
	let fx = fixture();

	let (handle, mut rx) = connect(&fx, 1, "alice").await;
	fx.index.subscribe(room("r1"), handle).await;

	let job = job("r1", Some("q-9"), false);
	fx.watchdog.register(&job, room("r1"), user("alice")).await;

	tokio::spawn(fx.watchdog.clone().run(fx.broadcaster.clone()));

	// Just before expiry a chunk arrives and resets the clock.
	tokio::time::sleep(TIMEOUT - Duration::from_secs(1)).await;
	let chunk = RelayFrame {
		room_id: Some("r1".to_string()),
		target_user_id: None,
		origin: None,
		event: ServerEvent::BotStream(BotChunkPayload {
			request_id: "q-9".to_string(),
			room_id: "r1".to_string(),
			chunk: "partial".to_string(),
		}),
	};
	fx.watchdog.observe(&chunk).await;

	tokio::time::sleep(Duration::from_secs(3)).await;
	assert!(drain_error_code(&mut rx).is_none(), "deadline was extended");
	assert_eq!(fx.watchdog.pending_count().await, 1);

	tokio::time::sleep(TIMEOUT).await;
	assert_eq!(drain_error_code(&mut rx).as_deref(), Some("AGENT_TIMEOUT"));
}

#[tokio::test(start_paused = true)]
async fn personal_done_clears_by_request_id() {
	let fx = fixture();

	let (_handle, mut rx) = connect(&fx, 1, "alice").await;

	let job = job("r1", Some("q-2"), true);
	fx.watchdog.register(&job, room("r1"), user("alice")).await;

	let done = RelayFrame {
		room_id: None,
		target_user_id: Some("alice".to_string()),
		origin: None,
		event: ServerEvent::BotPersonalDone(huddle_protocol::BotPersonalDonePayload {
			request_id: "q-2".to_string(),
			content: "the answer".to_string(),
		}),
	};
	fx.watchdog.observe(&done).await;
	assert_eq!(fx.watchdog.pending_count().await, 0);

	tokio::spawn(fx.watchdog.clone().run(fx.broadcaster.clone()));
	tokio::time::sleep(TIMEOUT + Duration::from_secs(2)).await;
	assert!(drain_error_code(&mut rx).is_none());
}
