#![forbid(unsafe_code)]

use linkup_domain::{ErrorKind, GroupId, RoomId, UserId};
use serde::{Deserialize, Serialize};

/// Handshake payload; must be the first frame a client sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hello {
	/// Raw credential header value, `<Level> <token>`.
	pub authorization: String,

	#[serde(default)]
	pub client_name: String,
}

/// Handshake response once the credential has been accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Welcome {
	pub server_name: String,
	pub subject_id: UserId,
	pub server_time_unix_ms: i64,
	pub max_frame_bytes: u32,
}

/// Sender snapshot attached to relayed events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublicUser {
	pub id: UserId,
	pub username: String,
}

/// Frames sent by clients over the bidirectional connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientFrame {
	#[serde(rename = "hello")]
	Hello(Hello),

	#[serde(rename = "sendMessage", rename_all = "camelCase")]
	SendMessage {
		content: String,
		send_to: UserId,
	},

	#[serde(rename = "joinRoom", rename_all = "camelCase")]
	JoinRoom {
		room_id: RoomId,
	},

	#[serde(rename = "sendGroupMessage", rename_all = "camelCase")]
	SendGroupMessage {
		content: String,
		group_id: GroupId,
	},

	#[serde(rename = "setTyping", rename_all = "camelCase")]
	SetTyping {
		typing: bool,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		group_id: Option<GroupId>,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		send_to: Option<UserId>,
	},

	#[serde(rename = "ping", rename_all = "camelCase")]
	Ping {
		client_time_unix_ms: i64,
	},
}

/// Frames emitted by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerFrame {
	#[serde(rename = "welcome")]
	Welcome(Welcome),

	/// Delivery acknowledgment fanned out to the sender's own handles.
	#[serde(rename = "successMessage")]
	SuccessMessage {
		content: String,
	},

	#[serde(rename = "newMessage", rename_all = "camelCase")]
	NewMessage {
		content: String,
		from: PublicUser,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		group_id: Option<GroupId>,
	},

	#[serde(rename = "setTyping", rename_all = "camelCase")]
	SetTyping {
		typing: bool,
		user: PublicUser,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		group_id: Option<GroupId>,
	},

	#[serde(rename = "online_user", rename_all = "camelCase")]
	OnlineUser {
		user_id: UserId,
	},

	#[serde(rename = "offline_user", rename_all = "camelCase")]
	OfflineUser {
		user_id: UserId,
	},

	/// Scoped failure; never terminates the connection.
	#[serde(rename = "custom_error")]
	CustomError {
		kind: ErrorKind,
		message: String,
	},

	#[serde(rename = "pong", rename_all = "camelCase")]
	Pong {
		client_time_unix_ms: i64,
		server_time_unix_ms: i64,
	},
}

impl ServerFrame {
	/// Wire event name, useful for logs and metrics.
	pub const fn event_name(&self) -> &'static str {
		match self {
			ServerFrame::Welcome(_) => "welcome",
			ServerFrame::SuccessMessage { .. } => "successMessage",
			ServerFrame::NewMessage { .. } => "newMessage",
			ServerFrame::SetTyping { .. } => "setTyping",
			ServerFrame::OnlineUser { .. } => "online_user",
			ServerFrame::OfflineUser { .. } => "offline_user",
			ServerFrame::CustomError { .. } => "custom_error",
			ServerFrame::Pong { .. } => "pong",
		}
	}
}
