#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::server::code;

/// Default maximum inbound text frame size.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024; // 64 KiB

#[derive(Debug, Error)]
pub enum FrameError {
	#[error("frame exceeds maximum size: len={len} max={max}")]
	FrameTooLarge {
		len: usize,
		max: usize,
	},

	#[error("invalid json: {0}")]
	BadJson(#[source] serde_json::Error),

	#[error("unrecognized or malformed frame: {0}")]
	BadMessage(String),
}

impl FrameError {
	/// Wire error code reported back to the sender.
	pub const fn code(&self) -> &'static str {
		match self {
			FrameError::BadJson(_) => code::BAD_JSON,
			FrameError::FrameTooLarge { .. } | FrameError::BadMessage(_) => code::BAD_MESSAGE,
		}
	}
}

/// Closed set of client→server commands, discriminated by `type`.
///
/// Adding a variant without handling it in the dispatcher is a compile
/// error, not a silent fall-through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ClientFrame {
	#[serde(rename = "room.join")]
	RoomJoin { room_id: String },

	#[serde(rename = "room.leave")]
	RoomLeave { room_id: String },

	#[serde(rename = "message.send")]
	MessageSend {
		room_id: String,
		content: String,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		client_temp_id: Option<String>,
	},

	#[serde(rename = "message.edit")]
	MessageEdit {
		room_id: String,
		message_id: String,
		content: String,
	},

	#[serde(rename = "message.delete")]
	MessageDelete { room_id: String, message_id: String },

	#[serde(rename = "room.rename")]
	RoomRename { room_id: String, title: String },

	#[serde(rename = "room.delete")]
	RoomDelete { room_id: String },

	#[serde(rename = "jarvis.request")]
	AgentRequest {
		room_id: String,
		prompt: String,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		message_id: Option<String>,
		#[serde(default)]
		is_personal: bool,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		request_id: Option<String>,
	},

	#[serde(rename = "rtc.offer")]
	RtcOffer { room_id: String, sdp: Value },

	#[serde(rename = "rtc.answer")]
	RtcAnswer { room_id: String, sdp: Value },

	#[serde(rename = "rtc.ice")]
	RtcIce { room_id: String, candidate: Value },

	#[serde(rename = "rtc.hangup")]
	RtcHangup { room_id: String },
}

impl ClientFrame {
	/// Wire discriminator, mainly for logs and metrics labels.
	pub const fn kind(&self) -> &'static str {
		match self {
			ClientFrame::RoomJoin { .. } => "room.join",
			ClientFrame::RoomLeave { .. } => "room.leave",
			ClientFrame::MessageSend { .. } => "message.send",
			ClientFrame::MessageEdit { .. } => "message.edit",
			ClientFrame::MessageDelete { .. } => "message.delete",
			ClientFrame::RoomRename { .. } => "room.rename",
			ClientFrame::RoomDelete { .. } => "room.delete",
			ClientFrame::AgentRequest { .. } => "jarvis.request",
			ClientFrame::RtcOffer { .. } => "rtc.offer",
			ClientFrame::RtcAnswer { .. } => "rtc.answer",
			ClientFrame::RtcIce { .. } => "rtc.ice",
			ClientFrame::RtcHangup { .. } => "rtc.hangup",
		}
	}

	/// Field-level validation applied after shape deserialization.
	fn validate(&self) -> Result<(), String> {
		fn required(field: &'static str, v: &str) -> Result<(), String> {
			if v.trim().is_empty() {
				Err(format!("{field} must be non-empty"))
			} else {
				Ok(())
			}
		}

		match self {
			ClientFrame::RoomJoin { room_id }
			| ClientFrame::RoomLeave { room_id }
			| ClientFrame::RoomDelete { room_id }
			| ClientFrame::RtcHangup { room_id }
			| ClientFrame::RtcOffer { room_id, .. }
			| ClientFrame::RtcAnswer { room_id, .. }
			| ClientFrame::RtcIce { room_id, .. } => required("roomId", room_id),
			ClientFrame::MessageSend { room_id, content, .. } => {
				required("roomId", room_id)?;
				required("content", content)
			}
			ClientFrame::MessageEdit {
				room_id,
				message_id,
				content,
			} => {
				required("roomId", room_id)?;
				required("messageId", message_id)?;
				required("content", content)
			}
			ClientFrame::MessageDelete { room_id, message_id } => {
				required("roomId", room_id)?;
				required("messageId", message_id)
			}
			ClientFrame::RoomRename { room_id, title } => {
				required("roomId", room_id)?;
				required("title", title)
			}
			ClientFrame::AgentRequest { room_id, prompt, .. } => {
				required("roomId", room_id)?;
				required("prompt", prompt)
			}
		}
	}
}

/// Parse one inbound text frame.
///
/// Invalid JSON and unrecognized/malformed shapes map to distinct error
/// codes (`BAD_JSON` vs `BAD_MESSAGE`); both leave the connection open.
pub fn parse_client_frame(raw: &str, max_frame_bytes: usize) -> Result<ClientFrame, FrameError> {
	if raw.len() > max_frame_bytes {
		return Err(FrameError::FrameTooLarge {
			len: raw.len(),
			max: max_frame_bytes,
		});
	}

	let value: Value = serde_json::from_str(raw).map_err(FrameError::BadJson)?;
	let frame: ClientFrame = serde_json::from_value(value).map_err(|e| FrameError::BadMessage(e.to_string()))?;
	frame.validate().map_err(FrameError::BadMessage)?;
	Ok(frame)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_room_join() {
		let frame = parse_client_frame(r#"{"type":"room.join","roomId":"r1"}"#, DEFAULT_MAX_FRAME_BYTES).unwrap();
		assert_eq!(
			frame,
			ClientFrame::RoomJoin {
				room_id: "r1".to_string()
			}
		);
	}

	#[test]
	fn parses_send_with_temp_id() {
		let raw = r#"{"type":"message.send","roomId":"r1","content":"hi","clientTempId":"tmp-1"}"#;
		let frame = parse_client_frame(raw, DEFAULT_MAX_FRAME_BYTES).unwrap();
		match frame {
			ClientFrame::MessageSend {
				room_id,
				content,
				client_temp_id,
			} => {
				assert_eq!(room_id, "r1");
				assert_eq!(content, "hi");
				assert_eq!(client_temp_id.as_deref(), Some("tmp-1"));
			}
			other => panic!("unexpected frame: {other:?}"),
		}
	}

	#[test]
	fn parses_agent_request_defaults() {
		let raw = r#"{"type":"jarvis.request","roomId":"r1","prompt":"what changed today"}"#;
		let frame = parse_client_frame(raw, DEFAULT_MAX_FRAME_BYTES).unwrap();
		match frame {
			ClientFrame::AgentRequest {
				is_personal,
				message_id,
				request_id,
				..
			} => {
				assert!(!is_personal);
				assert!(message_id.is_none());
				assert!(request_id.is_none());
			}
			other => panic!("unexpected frame: {other:?}"),
		}
	}

	#[test]
	fn bad_json_is_distinguished_from_bad_shape() {
		let err = parse_client_frame("{not json", DEFAULT_MAX_FRAME_BYTES).unwrap_err();
		assert_eq!(err.code(), code::BAD_JSON);

		let err = parse_client_frame(r#"{"type":"room.explode","roomId":"r1"}"#, DEFAULT_MAX_FRAME_BYTES).unwrap_err();
		assert_eq!(err.code(), code::BAD_MESSAGE);

		let err = parse_client_frame(r#"{"type":"room.join"}"#, DEFAULT_MAX_FRAME_BYTES).unwrap_err();
		assert_eq!(err.code(), code::BAD_MESSAGE);
	}

	#[test]
	fn empty_content_is_rejected() {
		let err =
			parse_client_frame(r#"{"type":"message.send","roomId":"r1","content":"  "}"#, DEFAULT_MAX_FRAME_BYTES)
				.unwrap_err();
		assert_eq!(err.code(), code::BAD_MESSAGE);
	}

	#[test]
	fn oversized_frames_are_rejected() {
		let raw = format!(r#"{{"type":"message.send","roomId":"r1","content":"{}"}}"#, "x".repeat(64));
		let err = parse_client_frame(&raw, 32).unwrap_err();
		match err {
			FrameError::FrameTooLarge { len, max } => {
				assert!(len > max);
			}
			other => panic!("unexpected error: {other:?}"),
		}
	}

	#[test]
	fn rtc_payloads_carry_arbitrary_json() {
		let raw = r#"{"type":"rtc.ice","roomId":"r1","candidate":{"sdpMid":"0","candidate":"..."}}"#;
		let frame = parse_client_frame(raw, DEFAULT_MAX_FRAME_BYTES).unwrap();
		match frame {
			ClientFrame::RtcIce { candidate, .. } => {
				assert_eq!(candidate["sdpMid"], "0");
			}
			other => panic!("unexpected frame: {other:?}"),
		}
	}
}
