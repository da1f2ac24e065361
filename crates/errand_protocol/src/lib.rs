#![forbid(unsafe_code)]

pub mod envelope;

pub use envelope::{
	DEFAULT_MAX_MESSAGE_BYTES, Decoded, EnvelopeKind, InboundEnvelope, OutboundEnvelope, ProtocolError, SenderInfo,
	decode_envelope, encode_envelope, room_ref_from_value,
};
