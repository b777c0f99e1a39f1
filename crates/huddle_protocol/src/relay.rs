#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::server::ServerEvent;

/// Envelope published on the shared cross-instance pub/sub channel.
///
/// Exactly one of `room_id` / `target_user_id` scopes delivery. `origin`
/// is the publishing process's instance id; a receiver drops frames that
/// carry its own origin because those were already delivered locally at
/// publish time. Frames published by the background worker carry no
/// origin and are delivered by every instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayFrame {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub room_id: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub target_user_id: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub origin: Option<String>,
	#[serde(flatten)]
	pub event: ServerEvent,
}

impl RelayFrame {
	/// Room-scoped frame tagged with the local instance id.
	pub fn room(room_id: impl Into<String>, origin: impl Into<String>, event: ServerEvent) -> Self {
		Self {
			room_id: Some(room_id.into()),
			target_user_id: None,
			origin: Some(origin.into()),
			event,
		}
	}

	/// User-scoped frame tagged with the local instance id.
	pub fn user(target_user_id: impl Into<String>, origin: impl Into<String>, event: ServerEvent) -> Self {
		Self {
			room_id: None,
			target_user_id: Some(target_user_id.into()),
			origin: Some(origin.into()),
			event,
		}
	}
}

/// Parse one inbound pub/sub payload. Malformed payloads are dropped by
/// the relay loop; this only reports why.
pub fn parse_relay_frame(raw: &str) -> Result<RelayFrame, serde_json::Error> {
	serde_json::from_str(raw)
}

/// Asynchronous agent job handed to the worker queue. The dispatcher
/// returns immediately after enqueue; results come back as `bot.*` /
/// `error` relay frames, possibly from a different process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentJob {
	pub job_id: String,
	pub room_id: String,
	pub requested_by: String,
	pub prompt: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub message_id: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub request_id: Option<String>,
	#[serde(default)]
	pub personal: bool,
}

impl AgentJob {
	/// Mint a job with a fresh id.
	pub fn new(room_id: impl Into<String>, requested_by: impl Into<String>, prompt: impl Into<String>) -> Self {
		Self {
			job_id: uuid::Uuid::new_v4().to_string(),
			room_id: room_id.into(),
			requested_by: requested_by.into(),
			prompt: prompt.into(),
			message_id: None,
			request_id: None,
			personal: false,
		}
	}
}
