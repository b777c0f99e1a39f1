#![forbid(unsafe_code)]

use std::sync::Arc;

use huddle_domain::{
	DEFAULT_ROOM_TITLE, DELETED_MESSAGE_PLACEHOLDER, Membership, MessageId, RoomId, SenderType, is_agent_trigger,
	strip_agent_prefix,
};
use huddle_protocol::{
	AgentJob, ClientFrame, MessageDto, MessageNewPayload, MessageRefPayload, RoomMemberPayload, RoomRefPayload,
	RoomTitlePayload, RtcIcePayload, RtcPeerPayload, RtcSdpPayload, ServerEvent, code,
};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::server::broadcaster::EventBroadcaster;
use crate::server::jobs::JobQueue;
use crate::server::registry::{ConnHandle, ConnectionRegistry};
use crate::server::room_index::RoomIndex;
use crate::server::store::ChatStore;
use crate::server::watchdog::JobWatchdog;

/// Dispatcher settings.
#[derive(Debug, Clone)]
pub struct DispatcherSettings {
	/// Message prefix that addresses the agent bot.
	pub agent_trigger_prefix: String,
}

impl Default for DispatcherSettings {
	fn default() -> Self {
		Self {
			agent_trigger_prefix: "@jarvis".to_string(),
		}
	}
}

enum RtcSignal {
	Offer(Value),
	Answer(Value),
	Ice(Value),
	Hangup,
}

/// Validates, authorizes, and applies client commands.
///
/// The store is consulted before every state-changing action; a
/// connection's local joined set is only a broadcast-routing cache.
/// Authorization and state errors go to the offending sender alone and
/// never close the connection.
#[derive(Clone)]
pub struct CommandDispatcher {
	store: Arc<dyn ChatStore>,
	registry: ConnectionRegistry,
	index: RoomIndex,
	broadcaster: EventBroadcaster,
	jobs: Arc<dyn JobQueue>,
	watchdog: JobWatchdog,
	settings: DispatcherSettings,
}

impl CommandDispatcher {
	pub fn new(
		store: Arc<dyn ChatStore>,
		registry: ConnectionRegistry,
		index: RoomIndex,
		broadcaster: EventBroadcaster,
		jobs: Arc<dyn JobQueue>,
		watchdog: JobWatchdog,
		settings: DispatcherSettings,
	) -> Self {
		Self {
			store,
			registry,
			index,
			broadcaster,
			jobs,
			watchdog,
			settings,
		}
	}

	pub async fn dispatch(&self, conn: &ConnHandle, frame: ClientFrame) {
		metrics::counter!("huddle_server_commands_total").increment(1);
		debug!(conn_id = conn.conn_id, user_id = %conn.user_id, kind = frame.kind(), "dispatching command");

		match frame {
			ClientFrame::RoomJoin { room_id } => self.handle_join(conn, &room_id).await,
			ClientFrame::RoomLeave { room_id } => self.handle_leave(conn, &room_id).await,
			ClientFrame::MessageSend {
				room_id,
				content,
				client_temp_id,
			} => self.handle_send(conn, &room_id, &content, client_temp_id).await,
			ClientFrame::MessageEdit {
				room_id,
				message_id,
				content,
			} => self.handle_edit(conn, &room_id, &message_id, &content).await,
			ClientFrame::MessageDelete { room_id, message_id } => {
				self.handle_delete(conn, &room_id, &message_id).await
			}
			ClientFrame::RoomRename { room_id, title } => self.handle_rename(conn, &room_id, &title).await,
			ClientFrame::RoomDelete { room_id } => self.handle_delete_room(conn, &room_id).await,
			ClientFrame::AgentRequest {
				room_id,
				prompt,
				message_id,
				is_personal,
				request_id,
			} => {
				self.handle_agent_request(conn, &room_id, prompt, message_id, is_personal, request_id)
					.await
			}
			ClientFrame::RtcOffer { room_id, sdp } => self.handle_rtc(conn, &room_id, RtcSignal::Offer(sdp)).await,
			ClientFrame::RtcAnswer { room_id, sdp } => self.handle_rtc(conn, &room_id, RtcSignal::Answer(sdp)).await,
			ClientFrame::RtcIce { room_id, candidate } => {
				self.handle_rtc(conn, &room_id, RtcSignal::Ice(candidate)).await
			}
			ClientFrame::RtcHangup { room_id } => self.handle_rtc(conn, &room_id, RtcSignal::Hangup).await,
		}
	}

	fn parse_room(&self, conn: &ConnHandle, raw: &str) -> Option<RoomId> {
		match RoomId::new(raw) {
			Ok(room) => Some(room),
			Err(_) => {
				conn.send_event(&ServerEvent::error(code::BAD_MESSAGE, "roomId must be non-empty"));
				None
			}
		}
	}

	/// Ask the Membership Authority; a miss is reported to the sender
	/// alone with the command's error code.
	async fn require_membership(&self, conn: &ConnHandle, room: &RoomId, missing_code: &str) -> Option<Membership> {
		match self.store.find_membership(room, &conn.user_id).await {
			Ok(Some(membership)) => Some(membership),
			Ok(None) => {
				metrics::counter!("huddle_server_authz_rejects_total").increment(1);
				conn.send_event(&ServerEvent::error(missing_code, "not a member of this room"));
				None
			}
			Err(e) => {
				error!(conn_id = conn.conn_id, room = %room, error = %e, "membership lookup failed");
				conn.send_event(&ServerEvent::error(code::INTERNAL, "internal error"));
				None
			}
		}
	}

	async fn handle_join(&self, conn: &ConnHandle, room_id: &str) {
		let Some(room) = self.parse_room(conn, room_id) else {
			return;
		};
		if self.require_membership(conn, &room, code::FORBIDDEN).await.is_none() {
			return;
		}

		self.index.subscribe(room.clone(), conn.clone()).await;
		self.registry.note_joined(conn.conn_id, room.clone()).await;

		conn.send_event(&ServerEvent::RoomJoined(RoomRefPayload {
			room_id: room.as_str().to_string(),
		}));
		info!(conn_id = conn.conn_id, room = %room, "joined room");
	}

	async fn handle_leave(&self, conn: &ConnHandle, room_id: &str) {
		let Some(room) = self.parse_room(conn, room_id) else {
			return;
		};
		let Some(membership) = self.require_membership(conn, &room, code::FORBIDDEN).await else {
			return;
		};

		if membership.is_owner() {
			let count = match self.store.member_count(&room).await {
				Ok(c) => c,
				Err(e) => {
					error!(room = %room, error = %e, "member count failed");
					conn.send_event(&ServerEvent::error(code::INTERNAL, "internal error"));
					return;
				}
			};

			if count <= 1 {
				conn.send_event(&ServerEvent::error(
					code::OWNER_CANNOT_LEAVE,
					"the sole owner must delete the room instead",
				));
				return;
			}
		}

		if let Err(e) = self.store.remove_member(&room, &conn.user_id).await {
			error!(room = %room, error = %e, "remove membership failed");
			conn.send_event(&ServerEvent::error(code::INTERNAL, "internal error"));
			return;
		}

		self.index.unsubscribe(&room, conn.conn_id).await;
		self.registry.note_left(conn.conn_id, &room).await;

		if membership.is_owner() {
			// A room never stays ownerless: the longest-tenured member
			// takes over.
			match self.store.promote_earliest_member(&room).await {
				Ok(Some(promoted)) => {
					info!(room = %room, promoted = %promoted, "ownership transferred to longest-tenured member")
				}
				Ok(None) => warn!(room = %room, "owner left but no member remained to promote"),
				Err(e) => error!(room = %room, error = %e, "owner promotion failed"),
			}
		}

		let remaining = match self.store.member_count(&room).await {
			Ok(c) => c,
			Err(e) => {
				// Keep the room on uncertainty; deletion is unrecoverable.
				error!(room = %room, error = %e, "member count failed after leave");
				1
			}
		};

		if remaining == 0 {
			if let Err(e) = self.store.delete_room(&room).await {
				error!(room = %room, error = %e, "room delete after last leave failed");
			}
			self.index.remove_room(&room).await;
			self.registry.forget_room(&room).await;
			info!(room = %room, "room deleted after last member left");
		} else {
			let display_name = match self.store.display_name(&conn.user_id).await {
				Ok(name) => name,
				Err(e) => {
					warn!(user_id = %conn.user_id, error = %e, "display name lookup failed");
					None
				}
			};

			self.broadcaster
				.to_room(
					&room,
					ServerEvent::RoomMemberRemoved(RoomMemberPayload {
						room_id: room.as_str().to_string(),
						user_id: conn.user_id.as_str().to_string(),
						display_name,
					}),
				)
				.await;
		}

		conn.send_event(&ServerEvent::RoomLeft(RoomRefPayload {
			room_id: room.as_str().to_string(),
		}));
		info!(conn_id = conn.conn_id, room = %room, "left room");
	}

	async fn handle_send(&self, conn: &ConnHandle, room_id: &str, content: &str, client_temp_id: Option<String>) {
		let Some(room) = self.parse_room(conn, room_id) else {
			return;
		};
		if self.require_membership(conn, &room, code::NOT_IN_ROOM).await.is_none() {
			return;
		}

		// Confirmed member whose socket never sent room.join: subscribe
		// it so it observes the room from here on (auto-join).
		if !self.registry.is_joined(conn.conn_id, &room).await {
			self.index.subscribe(room.clone(), conn.clone()).await;
			self.registry.note_joined(conn.conn_id, room.clone()).await;
		}

		let record = match self
			.store
			.create_message(&room, SenderType::User, Some(&conn.user_id), content)
			.await
		{
			Ok(r) => r,
			Err(e) => {
				error!(room = %room, error = %e, "message persist failed");
				conn.send_event(&ServerEvent::error(code::INTERNAL, "failed to persist message"));
				return;
			}
		};

		self.broadcaster
			.to_room(
				&room,
				ServerEvent::MessageNew(MessageNewPayload {
					message: MessageDto::from(&record),
					client_temp_id,
				}),
			)
			.await;

		if is_agent_trigger(content, &self.settings.agent_trigger_prefix) {
			let prompt = strip_agent_prefix(content, &self.settings.agent_trigger_prefix);
			let mut job = AgentJob::new(room.as_str(), conn.user_id.as_str(), prompt);
			job.message_id = Some(record.id.as_str().to_string());
			self.enqueue_job(conn, job, room).await;
		}
	}

	async fn handle_edit(&self, conn: &ConnHandle, room_id: &str, message_id: &str, content: &str) {
		let Some(room) = self.parse_room(conn, room_id) else {
			return;
		};
		let Ok(message_id) = MessageId::new(message_id) else {
			conn.send_event(&ServerEvent::error(code::BAD_MESSAGE, "messageId must be non-empty"));
			return;
		};
		if self.require_membership(conn, &room, code::NOT_IN_ROOM).await.is_none() {
			return;
		}

		let Some(existing) = self.load_own_user_message(conn, &room, &message_id).await else {
			return;
		};
		if existing.is_deleted() {
			conn.send_event(&ServerEvent::error(code::ALREADY_DELETED, "message was deleted"));
			return;
		}

		match self.store.set_message_content(&message_id, content).await {
			Ok(Some(updated)) => {
				self.broadcaster
					.to_room(&room, ServerEvent::MessageUpdated(MessageDto::from(&updated)))
					.await;
			}
			Ok(None) => {
				conn.send_event(&ServerEvent::error(code::NOT_FOUND, "message not found"));
			}
			Err(e) => {
				error!(room = %room, error = %e, "message edit failed");
				conn.send_event(&ServerEvent::error(code::INTERNAL, "failed to edit message"));
			}
		}
	}

	async fn handle_delete(&self, conn: &ConnHandle, room_id: &str, message_id: &str) {
		let Some(room) = self.parse_room(conn, room_id) else {
			return;
		};
		let Ok(message_id) = MessageId::new(message_id) else {
			conn.send_event(&ServerEvent::error(code::BAD_MESSAGE, "messageId must be non-empty"));
			return;
		};
		if self.require_membership(conn, &room, code::NOT_IN_ROOM).await.is_none() {
			return;
		}

		let Some(existing) = self.load_own_user_message(conn, &room, &message_id).await else {
			return;
		};

		let deleted_event = ServerEvent::MessageDeleted(MessageRefPayload {
			room_id: room.as_str().to_string(),
			message_id: message_id.as_str().to_string(),
		});

		if existing.is_deleted() {
			// Idempotent: no second store write, but the room still
			// observes the deletion.
			self.broadcaster.to_room(&room, deleted_event).await;
			return;
		}

		match self
			.store
			.set_message_content(&message_id, DELETED_MESSAGE_PLACEHOLDER)
			.await
		{
			Ok(_) => {
				self.broadcaster.to_room(&room, deleted_event).await;
			}
			Err(e) => {
				error!(room = %room, error = %e, "message delete failed");
				conn.send_event(&ServerEvent::error(code::INTERNAL, "failed to delete message"));
			}
		}
	}

	/// Fetch a message and enforce it exists in `room` and the sender is
	/// its original user-author; bot/system messages are immutable here.
	async fn load_own_user_message(
		&self,
		conn: &ConnHandle,
		room: &RoomId,
		message_id: &MessageId,
	) -> Option<huddle_domain::MessageRecord> {
		let existing = match self.store.find_message(message_id).await {
			Ok(m) => m,
			Err(e) => {
				error!(room = %room, error = %e, "message lookup failed");
				conn.send_event(&ServerEvent::error(code::INTERNAL, "internal error"));
				return None;
			}
		};

		let Some(existing) = existing.filter(|m| m.room_id == *room) else {
			conn.send_event(&ServerEvent::error(code::NOT_FOUND, "message not found in this room"));
			return None;
		};

		if existing.sender_type != SenderType::User || existing.sender_user_id.as_ref() != Some(&conn.user_id) {
			conn.send_event(&ServerEvent::error(
				code::FORBIDDEN,
				"only the author may modify a message",
			));
			return None;
		}

		Some(existing)
	}

	async fn handle_rename(&self, conn: &ConnHandle, room_id: &str, title: &str) {
		let Some(room) = self.parse_room(conn, room_id) else {
			return;
		};
		let Some(membership) = self.require_membership(conn, &room, code::FORBIDDEN).await else {
			return;
		};
		if !membership.is_owner() {
			conn.send_event(&ServerEvent::error(code::OWNER_ONLY, "only the room owner may rename it"));
			return;
		}

		let title = title.trim();
		let title = if title.is_empty() { DEFAULT_ROOM_TITLE } else { title };

		match self.store.update_room_title(&room, title).await {
			Ok(Some(updated)) => {
				self.broadcaster
					.to_room(
						&room,
						ServerEvent::RoomUpdated(RoomTitlePayload {
							room_id: updated.id.as_str().to_string(),
							title: updated.title,
						}),
					)
					.await;
			}
			Ok(None) => {
				conn.send_event(&ServerEvent::error(code::NOT_FOUND, "room not found"));
			}
			Err(e) => {
				error!(room = %room, error = %e, "room rename failed");
				conn.send_event(&ServerEvent::error(code::INTERNAL, "failed to rename room"));
			}
		}
	}

	async fn handle_delete_room(&self, conn: &ConnHandle, room_id: &str) {
		let Some(room) = self.parse_room(conn, room_id) else {
			return;
		};
		let Some(membership) = self.require_membership(conn, &room, code::FORBIDDEN).await else {
			return;
		};
		if !membership.is_owner() {
			conn.send_event(&ServerEvent::error(code::OWNER_ONLY, "only the room owner may delete it"));
			return;
		}

		if let Err(e) = self.store.delete_room(&room).await {
			error!(room = %room, error = %e, "room delete failed");
			conn.send_event(&ServerEvent::error(code::INTERNAL, "failed to delete room"));
			return;
		}

		// Broadcast before purging the index, or nobody is left to tell.
		self.broadcaster
			.to_room(
				&room,
				ServerEvent::RoomDeleted(RoomRefPayload {
					room_id: room.as_str().to_string(),
				}),
			)
			.await;

		self.index.remove_room(&room).await;
		self.registry.forget_room(&room).await;
		info!(conn_id = conn.conn_id, room = %room, "room deleted");
	}

	async fn handle_agent_request(
		&self,
		conn: &ConnHandle,
		room_id: &str,
		prompt: String,
		message_id: Option<String>,
		is_personal: bool,
		request_id: Option<String>,
	) {
		let Some(room) = self.parse_room(conn, room_id) else {
			return;
		};
		if self.require_membership(conn, &room, code::NOT_IN_ROOM).await.is_none() {
			return;
		}

		let mut job = AgentJob::new(room.as_str(), conn.user_id.as_str(), prompt);
		job.message_id = message_id;
		job.request_id = request_id;
		job.personal = is_personal;
		self.enqueue_job(conn, job, room).await;
	}

	/// Fire-and-forget: the dispatcher returns once the job is queued;
	/// results arrive later through the broadcaster.
	async fn enqueue_job(&self, conn: &ConnHandle, job: AgentJob, room: RoomId) {
		match self.jobs.enqueue(job.clone()).await {
			Ok(job_id) => {
				self.watchdog.register(&job, room, conn.user_id.clone()).await;
				debug!(job_id = %job_id, "agent job enqueued");
			}
			Err(e) => {
				error!(room = %room, error = %e, "agent job enqueue failed");
				conn.send_event(&ServerEvent::error(code::INTERNAL, "failed to enqueue agent request"));
			}
		}
	}

	async fn handle_rtc(&self, conn: &ConnHandle, room_id: &str, signal: RtcSignal) {
		let Some(room) = self.parse_room(conn, room_id) else {
			return;
		};
		if self.require_membership(conn, &room, code::NOT_IN_ROOM).await.is_none() {
			return;
		}

		let room_str = room.as_str().to_string();
		let from_user_id = conn.user_id.as_str().to_string();

		// Signaling is not persisted; it is annotated with the sender
		// and rebroadcast as-is.
		let event = match signal {
			RtcSignal::Offer(sdp) => ServerEvent::RtcOffer(RtcSdpPayload {
				room_id: room_str,
				from_user_id,
				sdp,
			}),
			RtcSignal::Answer(sdp) => ServerEvent::RtcAnswer(RtcSdpPayload {
				room_id: room_str,
				from_user_id,
				sdp,
			}),
			RtcSignal::Ice(candidate) => ServerEvent::RtcIce(RtcIcePayload {
				room_id: room_str,
				from_user_id,
				candidate,
			}),
			RtcSignal::Hangup => ServerEvent::RtcHangup(RtcPeerPayload {
				room_id: room_str,
				from_user_id,
			}),
		};

		self.broadcaster.to_room(&room, event).await;
	}
}
