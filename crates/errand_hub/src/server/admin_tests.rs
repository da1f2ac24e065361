#![forbid(unsafe_code)]

use bytes::Bytes;
use errand_domain::{Role, WellKnownRoom};
use http_body_util::{BodyExt, Full};
use hyper::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use hyper::{Method, Response, StatusCode};
use serde_json::Value;

use crate::server::admin::{AdminState, route_admin};
use crate::server::session::SessionSettings;
use crate::server::test_support::{TEST_SERVICE_TOKEN, TestHub, next_envelope, session, test_hub, token_for};

fn admin(hub: &TestHub) -> AdminState {
	AdminState::new(hub.dispatcher.clone(), hub.context.verifier.clone(), 16 * 1024)
}

fn bearer(token: &str) -> HeaderMap {
	let mut headers = HeaderMap::new();
	headers.insert(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {token}")).unwrap());
	headers
}

async fn body_text(resp: Response<Full<Bytes>>) -> String {
	let bytes = resp.into_body().collect().await.unwrap().to_bytes();
	String::from_utf8(bytes.to_vec()).unwrap()
}

async fn get(state: &AdminState, path: &str) -> Response<Full<Bytes>> {
	route_admin(&Method::GET, path, &HeaderMap::new(), Bytes::new(), state).await
}

async fn publish(state: &AdminState, headers: &HeaderMap, body: &str) -> Response<Full<Bytes>> {
	route_admin(&Method::POST, "/publish", headers, Bytes::from(body.to_string()), state).await
}

#[tokio::test]
async fn health_and_readiness() {
	let hub = test_hub(SessionSettings::default());
	let state = admin(&hub);

	assert_eq!(get(&state, "/healthz").await.status(), StatusCode::OK);
	assert_eq!(get(&state, "/readyz").await.status(), StatusCode::SERVICE_UNAVAILABLE);

	state.mark_ready();
	let resp = get(&state, "/readyz").await;
	assert_eq!(resp.status(), StatusCode::OK);
	assert_eq!(body_text(resp).await, "ready");

	assert_eq!(get(&state, "/nope").await.status(), StatusCode::NOT_FOUND);
	let resp = route_admin(&Method::DELETE, "/healthz", &HeaderMap::new(), Bytes::new(), &state).await;
	assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn rooms_lists_member_counts() {
	let hub = test_hub(SessionSettings::default());
	let state = admin(&hub);
	let support = WellKnownRoom::SupportChat.room_id();

	let (a, _rx_a) = session("cust-a", Role::Customer, 4);
	let (c, _rx_c) = session("agent-c", Role::Staff, 4);
	let (b, _rx_b) = session("agent-b", Role::Staff, 4);
	hub.registry.register(a, Some(support)).await.unwrap();
	hub.registry.register(c, Some(support)).await.unwrap();
	hub.registry.register(b, None).await.unwrap();

	let resp = get(&state, "/rooms").await;
	assert_eq!(resp.status(), StatusCode::OK);
	let json: Value = serde_json::from_str(&body_text(resp).await).unwrap();
	assert_eq!(json.as_object().map(|m| m.len()), Some(1));
	assert_eq!(json[support.to_string()], 2);
}

#[tokio::test]
async fn publish_requires_a_system_identity() {
	let hub = test_hub(SessionSettings::default());
	let state = admin(&hub);
	let body = r#"{"type":"message","room":"support-chat","message":"hi"}"#;

	let resp = publish(&state, &HeaderMap::new(), body).await;
	assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

	let customer = bearer(&token_for("cust-a", Role::Customer));
	assert_eq!(publish(&state, &customer, body).await.status(), StatusCode::UNAUTHORIZED);

	let staff = bearer(&token_for("agent-b", Role::Staff));
	assert_eq!(publish(&state, &staff, body).await.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn publish_rejects_bad_envelopes() {
	let hub = test_hub(SessionSettings::default());
	let state = admin(&hub);
	let auth = bearer(TEST_SERVICE_TOKEN);

	for body in [
		"not json",
		r#"{"type":"shout","room":1,"message":"x"}"#,
		r#"{"type":"typing_start","room":1}"#,
		r#"{"type":"message","message":"no room"}"#,
		r#"{"type":"message","room":0,"message":"x"}"#,
		r#"{"type":"message","room":1,"message":"   "}"#,
	] {
		let resp = publish(&state, &auth, body).await;
		assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "body: {body}");
	}
}

#[tokio::test]
async fn publish_fans_out_to_room_and_staff() {
	let hub = test_hub(SessionSettings::default());
	let state = admin(&hub);

	let (a, mut rx_a) = session("cust-a", Role::Customer, 4);
	let (b, mut rx_b) = session("agent-b", Role::Staff, 4);
	hub.registry
		.register(a, Some(WellKnownRoom::Payments.room_id()))
		.await
		.unwrap();
	hub.registry.register(b, None).await.unwrap();

	let resp = publish(
		&state,
		&bearer(TEST_SERVICE_TOKEN),
		r#"{"type":"message","room":{"room_id":"payments"},"message":"payment received"}"#,
	)
	.await;
	assert_eq!(resp.status(), StatusCode::ACCEPTED);
	let json: Value = serde_json::from_str(&body_text(resp).await).unwrap();
	assert_eq!(json["delivered"], 2);
	assert_eq!(json["dropped"], 0);

	let got = next_envelope(&mut rx_a).await;
	assert_eq!(got.message.as_deref(), Some("payment received"));
	assert_eq!(got.sender.role, Role::System);
	assert_eq!(next_envelope(&mut rx_b).await.room, Some(WellKnownRoom::Payments.room_id()));
}
