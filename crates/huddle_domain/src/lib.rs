#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Content stored in place of a deleted message (soft delete).
pub const DELETED_MESSAGE_PLACEHOLDER: &str = "(message deleted)";

/// Title applied when a rename request carries only whitespace.
pub const DEFAULT_ROOM_TITLE: &str = "New Room";

/// Errors for parsing identifiers and enum values from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("unknown role: {0}")]
	UnknownRole(String),
	#[error("unknown sender type: {0}")]
	UnknownSenderType(String),
}

/// Authenticated user identifier (store-assigned, opaque).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
	/// Create a non-empty `UserId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}
	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for UserId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for UserId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		UserId::new(s.to_string())
	}
}

/// Room identifier (store-assigned, opaque).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
	/// Create a non-empty `RoomId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}
	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for RoomId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for RoomId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		RoomId::new(s.to_string())
	}
}

/// Message identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
	/// Create a non-empty `MessageId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}

	/// Mint a fresh random message id.
	pub fn random() -> Self {
		Self(uuid::Uuid::new_v4().to_string())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for MessageId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for MessageId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		MessageId::new(s.to_string())
	}
}

/// Role a user holds within a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberRole {
	Owner,
	Member,
}

impl MemberRole {
	/// Stable string identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			MemberRole::Owner => "owner",
			MemberRole::Member => "member",
		}
	}
}

impl fmt::Display for MemberRole {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for MemberRole {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		match s.to_ascii_lowercase().as_str() {
			"owner" => Ok(MemberRole::Owner),
			"member" => Ok(MemberRole::Member),
			other => Err(ParseIdError::UnknownRole(other.to_string())),
		}
	}
}

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderType {
	User,
	Bot,
	System,
}

impl SenderType {
	/// Stable string identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			SenderType::User => "user",
			SenderType::Bot => "bot",
			SenderType::System => "system",
		}
	}
}

impl fmt::Display for SenderType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for SenderType {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		match s.to_ascii_lowercase().as_str() {
			"user" => Ok(SenderType::User),
			"bot" => Ok(SenderType::Bot),
			"system" => Ok(SenderType::System),
			other => Err(ParseIdError::UnknownSenderType(other.to_string())),
		}
	}
}

/// A user's membership row for one room: the unit of authorization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
	pub room_id: RoomId,
	pub user_id: UserId,
	pub role: MemberRole,
	pub joined_at_unix_ms: i64,
}

impl Membership {
	pub fn is_owner(&self) -> bool {
		self.role == MemberRole::Owner
	}
}

/// Durable room row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomRecord {
	pub id: RoomId,
	pub title: String,
	pub room_type: String,
	pub created_by: UserId,
	pub created_at_unix_ms: i64,
}

/// Durable message row. Deletes are soft: content is replaced by
/// [`DELETED_MESSAGE_PLACEHOLDER`] rather than removing the row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
	pub id: MessageId,
	pub room_id: RoomId,
	pub sender_type: SenderType,
	pub sender_user_id: Option<UserId>,
	pub content: String,
	pub created_at_unix_ms: i64,
}

impl MessageRecord {
	/// Whether this message has been soft-deleted.
	pub fn is_deleted(&self) -> bool {
		self.content == DELETED_MESSAGE_PLACEHOLDER
	}
}

/// Whether a message's text addresses the agent bot.
pub fn is_agent_trigger(text: &str, prefix: &str) -> bool {
	let t = text.trim();
	if t.is_empty() || prefix.is_empty() {
		return false;
	}
	t.starts_with(prefix)
}

/// Strip the agent trigger prefix, yielding the remaining prompt text.
pub fn strip_agent_prefix<'a>(text: &'a str, prefix: &str) -> &'a str {
	let t = text.trim();
	t.strip_prefix(prefix).map(str::trim_start).unwrap_or(t)
}
