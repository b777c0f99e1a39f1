#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use huddle_domain::{RoomId, UserId};
use huddle_protocol::{AgentJob, RelayFrame, ServerEvent, code};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::server::broadcaster::EventBroadcaster;

/// Tracks enqueued agent jobs against a deadline so a hung worker never
/// leaves clients waiting without a terminal event. `bot.stream` chunks
/// extend the deadline; `bot.done` / `bot.personal.done` / `error`
/// frames clear it; expiry emits `error{code: AGENT_TIMEOUT}` through
/// the normal broadcast path.
#[derive(Debug, Clone)]
pub struct JobWatchdog {
	inner: Arc<Mutex<Inner>>,
	timeout: Duration,
}

#[derive(Debug, Default)]
struct Inner {
	pending: HashMap<String, PendingJob>,
}

#[derive(Debug)]
struct PendingJob {
	room_id: RoomId,
	requested_by: UserId,
	request_id: Option<String>,
	personal: bool,
	deadline: Instant,
}

impl JobWatchdog {
	pub fn new(timeout: Duration) -> Self {
		Self {
			inner: Arc::new(Mutex::new(Inner::default())),
			timeout,
		}
	}

	/// Start tracking an enqueued job.
	pub async fn register(&self, job: &AgentJob, room_id: RoomId, requested_by: UserId) {
		let mut inner = self.inner.lock().await;
		inner.pending.insert(
			job.job_id.clone(),
			PendingJob {
				room_id,
				requested_by,
				request_id: job.request_id.clone(),
				personal: job.personal,
				deadline: Instant::now() + self.timeout,
			},
		);
	}

	/// Apply an observed relay frame to the pending table.
	pub async fn observe(&self, frame: &RelayFrame) {
		let mut inner = self.inner.lock().await;
		if inner.pending.is_empty() {
			return;
		}

		match &frame.event {
			ServerEvent::BotStream(p) | ServerEvent::BotPersonalStream(p) => {
				let deadline = Instant::now() + self.timeout;
				for job in inner.pending.values_mut() {
					let by_request = job.request_id.as_deref() == Some(p.request_id.as_str());
					let by_room = job.request_id.is_none() && job.room_id.as_str() == p.room_id;
					if by_request || by_room {
						job.deadline = deadline;
					}
				}
			}
			ServerEvent::BotPersonalDone(p) => {
				clear_where(&mut inner.pending, |job| {
					job.personal && job.request_id.as_deref() == Some(p.request_id.as_str())
				});
			}
			ServerEvent::BotDone(dto) => {
				clear_oldest_for_room(&mut inner.pending, &dto.room_id);
			}
			ServerEvent::Error(_) => {
				if let Some(room) = frame.room_id.as_deref() {
					clear_oldest_for_room(&mut inner.pending, room);
				}
				if let Some(user) = frame.target_user_id.as_deref() {
					clear_where(&mut inner.pending, |job| {
						job.personal && job.requested_by.as_str() == user
					});
				}
			}
			_ => {}
		}
	}

	/// Number of tracked jobs (test hook).
	pub async fn pending_count(&self) -> usize {
		let inner = self.inner.lock().await;
		inner.pending.len()
	}

	/// Sweep loop; expired jobs emit a terminal timeout error.
	pub async fn run(self, broadcaster: EventBroadcaster) {
		let mut tick = tokio::time::interval(Duration::from_secs(1));
		tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

		loop {
			tick.tick().await;

			let now = Instant::now();
			let expired: Vec<PendingJob> = {
				let mut inner = self.inner.lock().await;
				let ids: Vec<String> = inner
					.pending
					.iter()
					.filter(|(_, job)| job.deadline <= now)
					.map(|(id, _)| id.clone())
					.collect();
				ids.into_iter().filter_map(|id| inner.pending.remove(&id)).collect()
			};

			for job in expired {
				metrics::counter!("huddle_server_agent_timeouts_total").increment(1);
				warn!(
					room = %job.room_id,
					requested_by = %job.requested_by,
					personal = job.personal,
					"agent job deadline expired"
				);

				let event = ServerEvent::error(code::AGENT_TIMEOUT, "agent request timed out");
				if job.personal {
					broadcaster.to_user(&job.requested_by, event).await;
				} else {
					broadcaster.to_room(&job.room_id, event).await;
				}
			}
		}
	}
}

fn clear_where(pending: &mut HashMap<String, PendingJob>, keep_out: impl Fn(&PendingJob) -> bool) {
	let before = pending.len();
	pending.retain(|_, job| !keep_out(job));
	if pending.len() != before {
		debug!(cleared = before - pending.len(), "agent jobs resolved");
	}
}

/// `bot.done` carries no request id, so the oldest pending room job is
/// the one it terminates.
fn clear_oldest_for_room(pending: &mut HashMap<String, PendingJob>, room: &str) {
	let oldest = pending
		.iter()
		.filter(|(_, job)| !job.personal && job.room_id.as_str() == room)
		.min_by_key(|(_, job)| job.deadline)
		.map(|(id, _)| id.clone());

	if let Some(id) = oldest {
		pending.remove(&id);
		debug!(room, "agent job resolved");
	}
}
