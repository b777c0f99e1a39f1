#![forbid(unsafe_code)]

use huddle_domain::MessageRecord;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Wire error codes carried in `error` event payloads.
pub mod code {
	pub const INVALID_TOKEN: &str = "INVALID_TOKEN";
	pub const BAD_JSON: &str = "BAD_JSON";
	pub const BAD_MESSAGE: &str = "BAD_MESSAGE";
	pub const FORBIDDEN: &str = "FORBIDDEN";
	pub const OWNER_ONLY: &str = "OWNER_ONLY";
	pub const NOT_IN_ROOM: &str = "NOT_IN_ROOM";
	pub const NOT_FOUND: &str = "NOT_FOUND";
	pub const ALREADY_DELETED: &str = "ALREADY_DELETED";
	pub const OWNER_CANNOT_LEAVE: &str = "OWNER_CANNOT_LEAVE";
	pub const AGENT_TIMEOUT: &str = "AGENT_TIMEOUT";
	pub const INTERNAL: &str = "INTERNAL";
}

/// Message row as exposed on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDto {
	pub id: String,
	pub room_id: String,
	pub sender_type: String,
	pub sender_user_id: Option<String>,
	pub content: String,
	pub created_at: i64,
}

impl From<&MessageRecord> for MessageDto {
	fn from(rec: &MessageRecord) -> Self {
		Self {
			id: rec.id.as_str().to_string(),
			room_id: rec.room_id.as_str().to_string(),
			sender_type: rec.sender_type.as_str().to_string(),
			sender_user_id: rec.sender_user_id.as_ref().map(|u| u.as_str().to_string()),
			content: rec.content.clone(),
			created_at: rec.created_at_unix_ms,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomRefPayload {
	pub room_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomTitlePayload {
	pub room_id: String,
	pub title: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomMemberPayload {
	pub room_id: String,
	pub user_id: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub display_name: Option<String>,
}

/// `message.new` payload: the persisted row plus the sender's optimistic
/// temp id echoed back for client-side reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageNewPayload {
	#[serde(flatten)]
	pub message: MessageDto,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub client_temp_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRefPayload {
	pub room_id: String,
	pub message_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BotChunkPayload {
	pub request_id: String,
	pub room_id: String,
	pub chunk: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BotPersonalDonePayload {
	pub request_id: String,
	pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtcSdpPayload {
	pub room_id: String,
	pub from_user_id: String,
	pub sdp: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtcIcePayload {
	pub room_id: String,
	pub from_user_id: String,
	pub candidate: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtcPeerPayload {
	pub room_id: String,
	pub from_user_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
	pub message: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub code: Option<String>,
}

/// Closed set of server→client events, serialized as `{type, payload}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ServerEvent {
	#[serde(rename = "room.joined")]
	RoomJoined(RoomRefPayload),

	#[serde(rename = "room.left")]
	RoomLeft(RoomRefPayload),

	#[serde(rename = "room.updated")]
	RoomUpdated(RoomTitlePayload),

	#[serde(rename = "room.deleted")]
	RoomDeleted(RoomRefPayload),

	#[serde(rename = "room.added")]
	RoomAdded(RoomTitlePayload),

	#[serde(rename = "room.member.added")]
	RoomMemberAdded(RoomMemberPayload),

	#[serde(rename = "room.member.removed")]
	RoomMemberRemoved(RoomMemberPayload),

	#[serde(rename = "message.new")]
	MessageNew(MessageNewPayload),

	#[serde(rename = "message.updated")]
	MessageUpdated(MessageDto),

	#[serde(rename = "message.deleted")]
	MessageDeleted(MessageRefPayload),

	#[serde(rename = "bot.stream")]
	BotStream(BotChunkPayload),

	#[serde(rename = "bot.done")]
	BotDone(MessageDto),

	#[serde(rename = "bot.personal.stream")]
	BotPersonalStream(BotChunkPayload),

	#[serde(rename = "bot.personal.done")]
	BotPersonalDone(BotPersonalDonePayload),

	#[serde(rename = "rtc.offer")]
	RtcOffer(RtcSdpPayload),

	#[serde(rename = "rtc.answer")]
	RtcAnswer(RtcSdpPayload),

	#[serde(rename = "rtc.ice")]
	RtcIce(RtcIcePayload),

	#[serde(rename = "rtc.hangup")]
	RtcHangup(RtcPeerPayload),

	#[serde(rename = "error")]
	Error(ErrorPayload),
}

impl ServerEvent {
	/// Build an `error` event with a machine code and human message.
	pub fn error(code: &str, message: impl Into<String>) -> Self {
		ServerEvent::Error(ErrorPayload {
			message: message.into(),
			code: Some(code.to_string()),
		})
	}

	/// Wire discriminator, mainly for logs and metrics labels.
	pub const fn kind(&self) -> &'static str {
		match self {
			ServerEvent::RoomJoined(_) => "room.joined",
			ServerEvent::RoomLeft(_) => "room.left",
			ServerEvent::RoomUpdated(_) => "room.updated",
			ServerEvent::RoomDeleted(_) => "room.deleted",
			ServerEvent::RoomAdded(_) => "room.added",
			ServerEvent::RoomMemberAdded(_) => "room.member.added",
			ServerEvent::RoomMemberRemoved(_) => "room.member.removed",
			ServerEvent::MessageNew(_) => "message.new",
			ServerEvent::MessageUpdated(_) => "message.updated",
			ServerEvent::MessageDeleted(_) => "message.deleted",
			ServerEvent::BotStream(_) => "bot.stream",
			ServerEvent::BotDone(_) => "bot.done",
			ServerEvent::BotPersonalStream(_) => "bot.personal.stream",
			ServerEvent::BotPersonalDone(_) => "bot.personal.done",
			ServerEvent::RtcOffer(_) => "rtc.offer",
			ServerEvent::RtcAnswer(_) => "rtc.answer",
			ServerEvent::RtcIce(_) => "rtc.ice",
			ServerEvent::RtcHangup(_) => "rtc.hangup",
			ServerEvent::Error(_) => "error",
		}
	}
}
