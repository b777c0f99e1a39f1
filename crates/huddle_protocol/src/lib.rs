#![forbid(unsafe_code)]

pub mod client;
pub mod relay;
pub mod server;

pub use client::{ClientFrame, DEFAULT_MAX_FRAME_BYTES, FrameError, parse_client_frame};
pub use relay::{AgentJob, RelayFrame, parse_relay_frame};
pub use server::{
	BotChunkPayload, BotPersonalDonePayload, ErrorPayload, MessageDto, MessageNewPayload, MessageRefPayload,
	RoomMemberPayload, RoomRefPayload, RoomTitlePayload, RtcIcePayload, RtcPeerPayload, RtcSdpPayload, ServerEvent, code,
};
