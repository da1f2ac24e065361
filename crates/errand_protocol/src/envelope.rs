#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use errand_domain::normalize::MAX_NESTING;
use errand_domain::{IdentityId, NormalizeError, Role, RoomId, RoomRef};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Default maximum size of one inbound text frame.
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 64 * 1024; // 64 KiB

/// Keys accepted as the id field of a structured room reference, in priority order.
const ROOM_OBJECT_ID_KEYS: [&str; 3] = ["id", "roomId", "room_id"];

#[derive(Debug, Error)]
pub enum ProtocolError {
	#[error("message exceeds maximum size: len={len} max={max}")]
	TooLarge {
		len: usize,
		max: usize,
	},

	#[error("json decode error: {0}")]
	Decode(#[source] serde_json::Error),

	#[error("json encode error: {0}")]
	Encode(#[source] serde_json::Error),
}

/// Envelope type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
	Message,
	TypingStart,
	TypingStop,
	JoinRoom,
	LeaveRoom,
	Ping,
	Pong,
	/// Hub-originated notice to staff listeners that a room gained its first member.
	RoomOpened,
}

impl EnvelopeKind {
	pub const fn as_str(self) -> &'static str {
		match self {
			EnvelopeKind::Message => "message",
			EnvelopeKind::TypingStart => "typing_start",
			EnvelopeKind::TypingStop => "typing_stop",
			EnvelopeKind::JoinRoom => "join_room",
			EnvelopeKind::LeaveRoom => "leave_room",
			EnvelopeKind::Ping => "ping",
			EnvelopeKind::Pong => "pong",
			EnvelopeKind::RoomOpened => "room_opened",
		}
	}

	/// Whether clients are allowed to send this type.
	pub const fn is_client_kind(self) -> bool {
		!matches!(self, EnvelopeKind::RoomOpened)
	}
}

impl fmt::Display for EnvelopeKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for EnvelopeKind {
	type Err = String;

	/// Accepts the snake_case names plus the dashed and short spellings older clients send.
	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
		match normalized.as_str() {
			"message" | "chat" | "chat_message" => Ok(EnvelopeKind::Message),
			"typing_start" | "typing" => Ok(EnvelopeKind::TypingStart),
			"typing_stop" => Ok(EnvelopeKind::TypingStop),
			"join_room" | "join" => Ok(EnvelopeKind::JoinRoom),
			"leave_room" | "leave" => Ok(EnvelopeKind::LeaveRoom),
			"ping" => Ok(EnvelopeKind::Ping),
			"pong" => Ok(EnvelopeKind::Pong),
			"room_opened" => Ok(EnvelopeKind::RoomOpened),
			_ => Err(s.to_string()),
		}
	}
}

/// Client envelope after decoding. `sender` and `timestamp` from the wire are discarded.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEnvelope {
	pub kind: EnvelopeKind,
	/// Raw room reference; converted with [`room_ref_from_value`] by the caller.
	pub room: Option<Value>,
	pub message: Option<String>,
	pub data: Option<Value>,
}

impl InboundEnvelope {
	/// Message text exactly as sent, unless it is missing or blank.
	pub fn text(&self) -> Option<&str> {
		self.message.as_deref().filter(|s| !s.trim().is_empty())
	}
}

/// Result of decoding one text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
	Envelope(InboundEnvelope),
	/// Well-formed JSON with a `type` this hub does not handle.
	Unknown(String),
}

#[derive(Debug, Deserialize)]
struct WireEnvelope {
	#[serde(rename = "type")]
	kind: String,
	#[serde(default)]
	room: Option<Value>,
	#[serde(default)]
	message: Option<String>,
	#[serde(default)]
	data: Option<Value>,
}

/// Decode one inbound text frame.
pub fn decode_envelope(text: &str, max_len: usize) -> Result<Decoded, ProtocolError> {
	if text.len() > max_len {
		return Err(ProtocolError::TooLarge {
			len: text.len(),
			max: max_len,
		});
	}

	let wire: WireEnvelope = serde_json::from_str(text).map_err(ProtocolError::Decode)?;

	let kind = match wire.kind.parse::<EnvelopeKind>() {
		Ok(kind) if kind.is_client_kind() => kind,
		_ => return Ok(Decoded::Unknown(wire.kind)),
	};

	Ok(Decoded::Envelope(InboundEnvelope {
		kind,
		room: wire.room,
		message: wire.message,
		data: wire.data,
	}))
}

/// Classify a dynamic JSON room reference.
pub fn room_ref_from_value(value: &Value) -> Result<RoomRef, NormalizeError> {
	room_ref_at(value, 0)
}

fn room_ref_at(value: &Value, depth: usize) -> Result<RoomRef, NormalizeError> {
	match value {
		Value::String(s) => RoomRef::from_text(s),
		Value::Number(n) => {
			if let Some(v) = n.as_u64() {
				Ok(RoomRef::Legacy(v))
			} else if let Some(v) = n.as_i64() {
				Err(NormalizeError::InvalidLegacyId(v as i128))
			} else {
				Err(NormalizeError::Unsupported("fractional number"))
			}
		}
		Value::Object(map) => {
			if depth >= MAX_NESTING {
				return Err(NormalizeError::TooDeep { max: MAX_NESTING });
			}

			let inner = ROOM_OBJECT_ID_KEYS
				.iter()
				.find_map(|k| map.get(*k).filter(|v| !v.is_null()))
				.ok_or(NormalizeError::MissingIdField)?;

			Ok(RoomRef::object(room_ref_at(inner, depth + 1)?))
		}
		Value::Null => Err(NormalizeError::Unsupported("null")),
		Value::Bool(_) => Err(NormalizeError::Unsupported("boolean")),
		Value::Array(_) => Err(NormalizeError::Unsupported("array")),
	}
}

/// Sender stamped by the hub from the originating session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderInfo {
	pub id: IdentityId,
	pub role: Role,
}

/// Envelope delivered to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundEnvelope {
	#[serde(rename = "type")]
	pub kind: EnvelopeKind,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub room: Option<RoomId>,

	pub sender: SenderInfo,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub message: Option<String>,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub data: Option<Value>,

	/// Hub dispatch time, unix milliseconds.
	pub timestamp: i64,
}

/// Encode an outbound envelope as a JSON text frame.
pub fn encode_envelope(env: &OutboundEnvelope) -> Result<String, ProtocolError> {
	serde_json::to_string(env).map_err(ProtocolError::Encode)
}
