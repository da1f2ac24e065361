use errand_domain::normalize::MAX_NESTING;
use errand_domain::{IdentityId, NormalizeError, Role, RoomRef, WellKnownRoom, normalize};
use errand_protocol::{
	DEFAULT_MAX_MESSAGE_BYTES, Decoded, EnvelopeKind, OutboundEnvelope, ProtocolError, SenderInfo, decode_envelope,
	encode_envelope, room_ref_from_value,
};
use proptest::prelude::*;
use serde_json::json;

fn decode_ok(text: &str) -> errand_protocol::InboundEnvelope {
	match decode_envelope(text, DEFAULT_MAX_MESSAGE_BYTES).expect("decode") {
		Decoded::Envelope(env) => env,
		other => panic!("expected envelope, got: {other:?}"),
	}
}

#[test]
fn decodes_chat_and_ignores_client_sender_and_timestamp() {
	let env = decode_ok(
		r#"{"type":"message","room":"support-chat","message":"hi","sender":{"id":"spoof","role":"staff"},"timestamp":1}"#,
	);

	assert_eq!(env.kind, EnvelopeKind::Message);
	assert_eq!(env.text(), Some("hi"));
	assert_eq!(env.room, Some(json!("support-chat")));
	assert!(env.data.is_none());
}

#[test]
fn null_room_is_absent() {
	let env = decode_ok(r#"{"type":"typing_start","room":null,"data":{"is_typing":true}}"#);
	assert_eq!(env.kind, EnvelopeKind::TypingStart);
	assert!(env.room.is_none());
	assert_eq!(env.data, Some(json!({"is_typing": true})));
}

#[test]
fn blank_message_has_no_text() {
	let env = decode_ok(r#"{"type":"message","message":"   "}"#);
	assert_eq!(env.text(), None);
}

#[test]
fn message_text_keeps_surrounding_whitespace() {
	let env = decode_ok(r#"{"type":"message","message":"  step 1\n    indented\n"}"#);
	assert_eq!(env.text(), Some("  step 1\n    indented\n"));
}

#[test]
fn unknown_type_is_not_an_error() {
	let decoded = decode_envelope(r#"{"type":"mark_read","room":1}"#, DEFAULT_MAX_MESSAGE_BYTES).expect("decode");
	assert_eq!(decoded, Decoded::Unknown("mark_read".to_string()));
}

#[test]
fn malformed_json_is_a_decode_error() {
	for text in ["not json", "{}", r#"{"type":5}"#, r#"{"type":"message","message":12}"#] {
		let err = decode_envelope(text, DEFAULT_MAX_MESSAGE_BYTES).unwrap_err();
		assert!(matches!(err, ProtocolError::Decode(_)), "{text}: {err:?}");
	}
}

#[test]
fn oversized_frame_rejected_before_parsing() {
	let text = format!(r#"{{"type":"message","message":"{}"}}"#, "a".repeat(128));
	let err = decode_envelope(&text, 64).unwrap_err();
	match err {
		ProtocolError::TooLarge { len, max } => {
			assert_eq!(max, 64);
			assert!(len > max);
		}
		other => panic!("unexpected error: {other:?}"),
	}
}

#[test]
fn room_values_classify_by_shape() {
	assert_eq!(
		room_ref_from_value(&json!("support-chat")).unwrap(),
		RoomRef::WellKnown(WellKnownRoom::SupportChat)
	);
	assert_eq!(room_ref_from_value(&json!(17)).unwrap(), RoomRef::Legacy(17));
	assert_eq!(room_ref_from_value(&json!("17")).unwrap(), RoomRef::Legacy(17));
	assert_eq!(
		room_ref_from_value(&json!({"roomId": 17})).unwrap(),
		RoomRef::object(RoomRef::Legacy(17))
	);
	assert_eq!(
		room_ref_from_value(&json!("late delivery")).unwrap(),
		RoomRef::Label("late delivery".to_string())
	);
}

#[test]
fn object_id_key_priority() {
	let r = room_ref_from_value(&json!({"room_id": 9, "id": 3})).unwrap();
	assert_eq!(r, RoomRef::object(RoomRef::Legacy(3)));

	let r = room_ref_from_value(&json!({"id": null, "room_id": 9})).unwrap();
	assert_eq!(r, RoomRef::object(RoomRef::Legacy(9)));
}

#[test]
fn unsupported_room_shapes_fail_typed() {
	assert_eq!(
		room_ref_from_value(&json!(true)),
		Err(NormalizeError::Unsupported("boolean"))
	);
	assert_eq!(room_ref_from_value(&json!([1])), Err(NormalizeError::Unsupported("array")));
	assert_eq!(
		room_ref_from_value(&json!(1.5)),
		Err(NormalizeError::Unsupported("fractional number"))
	);
	assert_eq!(room_ref_from_value(&json!(-3)), Err(NormalizeError::InvalidLegacyId(-3)));
	assert_eq!(room_ref_from_value(&json!({"name": "x"})), Err(NormalizeError::MissingIdField));
	assert_eq!(room_ref_from_value(&json!("")), Err(NormalizeError::Empty));
}

#[test]
fn nesting_limit_matches_normalizer() {
	let mut allowed = json!(5);
	for _ in 0..MAX_NESTING {
		allowed = json!({ "id": allowed });
	}
	let r = room_ref_from_value(&allowed).expect("within limit");
	assert_eq!(normalize(&r).unwrap(), normalize(&RoomRef::Legacy(5)).unwrap());

	let too_deep = json!({ "id": allowed });
	assert_eq!(
		room_ref_from_value(&too_deep),
		Err(NormalizeError::TooDeep { max: MAX_NESTING })
	);
}

#[test]
fn outbound_envelope_shape() {
	let room = normalize(&RoomRef::Legacy(1)).unwrap();
	let env = OutboundEnvelope {
		kind: EnvelopeKind::Message,
		room: Some(room),
		sender: SenderInfo {
			id: IdentityId::new("cust-1").unwrap(),
			role: Role::Customer,
		},
		message: Some("where is my order?".to_string()),
		data: None,
		timestamp: 1_700_000_000_000,
	};

	let text = encode_envelope(&env).expect("encode");
	let value: serde_json::Value = serde_json::from_str(&text).unwrap();
	assert_eq!(
		value,
		json!({
			"type": "message",
			"room": "00000000-0000-0000-0000-000000000001",
			"sender": {"id": "cust-1", "role": "customer"},
			"message": "where is my order?",
			"timestamp": 1_700_000_000_000i64,
		})
	);

	let back: OutboundEnvelope = serde_json::from_str(&text).unwrap();
	assert_eq!(back, env);
}

#[test]
fn global_envelope_omits_room() {
	let env = OutboundEnvelope {
		kind: EnvelopeKind::RoomOpened,
		room: None,
		sender: SenderInfo {
			id: IdentityId::new("system").unwrap(),
			role: Role::System,
		},
		message: None,
		data: None,
		timestamp: 0,
	};
	let text = encode_envelope(&env).unwrap();
	assert!(!text.contains("\"room\""));
	assert!(text.contains("\"type\":\"room_opened\""));
}

proptest! {
	#[test]
	fn wire_numbers_and_strings_agree(n in 1u64..) {
		let from_number = normalize(&room_ref_from_value(&json!(n)).unwrap()).unwrap();
		let from_string = normalize(&room_ref_from_value(&json!(n.to_string())).unwrap()).unwrap();
		let from_object = normalize(&room_ref_from_value(&json!({"id": n})).unwrap()).unwrap();
		prop_assert_eq!(from_number, from_string);
		prop_assert_eq!(from_number, from_object);
	}

	#[test]
	fn canonical_output_renormalizes_from_wire(label in "[a-z]{1,12}( [a-z]{1,12}){0,3}") {
		let id = normalize(&room_ref_from_value(&json!(label)).unwrap()).unwrap();
		let again = normalize(&room_ref_from_value(&json!(id.to_string())).unwrap()).unwrap();
		prop_assert_eq!(id, again);
	}
}
