#![forbid(unsafe_code)]

//! Room reference normalization.
//!
//! Clients reference rooms in several shapes: a well-known short name
//! (`support-chat`), a legacy integer key, a free-text label, an object
//! wrapping one of those, or the canonical id itself. [`normalize`] reduces
//! each of them to a [`RoomId`].
//!
//! Legacy ids are embedded in the low eight bytes of an otherwise zero UUID,
//! so `to_legacy(normalize(n)) == n`. Labels hash into a version-8 UUID,
//! which can never look like a legacy embedding.

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::RoomId;

/// Maximum object nesting accepted in a structured room reference.
pub const MAX_NESTING: usize = 4;

const LABEL_HASH_DOMAIN: &[u8] = b"errand-room-label:";

/// Errors returned when a room reference cannot be normalized.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NormalizeError {
	#[error("empty room reference")]
	Empty,
	#[error("legacy room id must be positive, got {0}")]
	InvalidLegacyId(i128),
	#[error("legacy room id out of range: {0}")]
	LegacyOutOfRange(String),
	#[error("invalid canonical room id: {0}")]
	InvalidCanonical(String),
	#[error("structured room reference has no id field")]
	MissingIdField,
	#[error("structured room reference nested deeper than {max}")]
	TooDeep { max: usize },
	#[error("unsupported room reference shape: {0}")]
	Unsupported(&'static str),
	#[error("room {0} has no legacy numeric id")]
	NotLegacy(RoomId),
}

/// Rooms with a fixed short name and legacy key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WellKnownRoom {
	SupportChat,
	OrderHelp,
	CustomQuotes,
	Payments,
}

impl WellKnownRoom {
	pub const ALL: [WellKnownRoom; 4] = [
		WellKnownRoom::SupportChat,
		WellKnownRoom::OrderHelp,
		WellKnownRoom::CustomQuotes,
		WellKnownRoom::Payments,
	];

	pub const fn short_name(self) -> &'static str {
		match self {
			WellKnownRoom::SupportChat => "support-chat",
			WellKnownRoom::OrderHelp => "order-help",
			WellKnownRoom::CustomQuotes => "custom-quotes",
			WellKnownRoom::Payments => "payments",
		}
	}

	pub const fn legacy_id(self) -> u64 {
		match self {
			WellKnownRoom::SupportChat => 1,
			WellKnownRoom::OrderHelp => 2,
			WellKnownRoom::CustomQuotes => 3,
			WellKnownRoom::Payments => 4,
		}
	}

	/// Case-insensitive lookup by short name.
	pub fn lookup(name: &str) -> Option<Self> {
		let name = name.trim();
		Self::ALL.into_iter().find(|r| r.short_name().eq_ignore_ascii_case(name))
	}

	pub fn room_id(self) -> RoomId {
		embed_legacy(self.legacy_id())
	}
}

/// A room reference as it arrived on the wire, classified by shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomRef {
	WellKnown(WellKnownRoom),
	Canonical(String),
	Legacy(u64),
	Label(String),
	/// Object carrying an explicit id field; the inner reference is the field value.
	Object(Box<RoomRef>),
}

impl RoomRef {
	/// Classify a textual reference.
	///
	/// Digit-only strings are legacy ids, since query parameters always arrive as text.
	pub fn from_text(raw: &str) -> Result<Self, NormalizeError> {
		let s = raw.trim();
		if s.is_empty() {
			return Err(NormalizeError::Empty);
		}

		if let Some(known) = WellKnownRoom::lookup(s) {
			return Ok(RoomRef::WellKnown(known));
		}

		if s.bytes().all(|b| b.is_ascii_digit()) {
			return s
				.parse::<u64>()
				.map(RoomRef::Legacy)
				.map_err(|_| NormalizeError::LegacyOutOfRange(s.to_string()));
		}

		if uuid::Uuid::try_parse(s).is_ok() {
			return Ok(RoomRef::Canonical(s.to_string()));
		}

		Ok(RoomRef::Label(s.to_string()))
	}

	/// Wrap a reference the way a `{"id": ...}` object carries it.
	pub fn object(inner: RoomRef) -> Self {
		RoomRef::Object(Box::new(inner))
	}
}

impl From<RoomId> for RoomRef {
	fn from(id: RoomId) -> Self {
		RoomRef::Canonical(id.to_string())
	}
}

/// Reduce any supported room reference to its canonical id.
pub fn normalize(raw: &RoomRef) -> Result<RoomId, NormalizeError> {
	normalize_at(raw, 0)
}

fn normalize_at(raw: &RoomRef, depth: usize) -> Result<RoomId, NormalizeError> {
	match raw {
		RoomRef::WellKnown(known) => Ok(known.room_id()),
		RoomRef::Canonical(s) => normalize_canonical(s),
		RoomRef::Legacy(n) => normalize_legacy(*n),
		RoomRef::Label(label) => normalize_label(label),
		RoomRef::Object(inner) => normalize_object(inner, depth),
	}
}

fn normalize_canonical(s: &str) -> Result<RoomId, NormalizeError> {
	uuid::Uuid::try_parse(s.trim())
		.map(RoomId::from_uuid)
		.map_err(|_| NormalizeError::InvalidCanonical(s.to_string()))
}

fn normalize_legacy(n: u64) -> Result<RoomId, NormalizeError> {
	if n == 0 {
		return Err(NormalizeError::InvalidLegacyId(0));
	}
	Ok(embed_legacy(n))
}

fn normalize_label(label: &str) -> Result<RoomId, NormalizeError> {
	let label = label.trim();
	if label.is_empty() {
		return Err(NormalizeError::Empty);
	}

	let mut hasher = Sha256::new();
	hasher.update(LABEL_HASH_DOMAIN);
	hasher.update(label.as_bytes());
	let digest = hasher.finalize();

	let mut bytes = [0u8; 16];
	bytes.copy_from_slice(&digest[..16]);
	bytes[6] = (bytes[6] & 0x0f) | 0x80;
	bytes[8] = (bytes[8] & 0x3f) | 0x80;

	Ok(RoomId::from_uuid(uuid::Uuid::from_bytes(bytes)))
}

fn normalize_object(inner: &RoomRef, depth: usize) -> Result<RoomId, NormalizeError> {
	let depth = depth + 1;
	if depth > MAX_NESTING {
		return Err(NormalizeError::TooDeep { max: MAX_NESTING });
	}
	normalize_at(inner, depth)
}

fn embed_legacy(n: u64) -> RoomId {
	let mut bytes = [0u8; 16];
	bytes[8..].copy_from_slice(&n.to_be_bytes());
	RoomId::from_uuid(uuid::Uuid::from_bytes(bytes))
}

/// Recover the legacy numeric id used by the durable store.
pub fn to_legacy(room: &RoomId) -> Result<u64, NormalizeError> {
	let bytes = room.as_uuid().as_bytes();
	if bytes[..8].iter().any(|b| *b != 0) {
		return Err(NormalizeError::NotLegacy(*room));
	}

	let mut low = [0u8; 8];
	low.copy_from_slice(&bytes[8..]);
	match u64::from_be_bytes(low) {
		0 => Err(NormalizeError::NotLegacy(*room)),
		n => Ok(n),
	}
}
