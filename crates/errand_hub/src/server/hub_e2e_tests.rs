#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::time::Duration;

use errand_domain::{Role, WellKnownRoom};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{Instant, timeout};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::server::handshake::{handle_connection, serve};
use crate::server::session::SessionSettings;
use crate::server::test_support::{TestHub, test_hub, token_for};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start() -> (TestHub, SocketAddr) {
	let hub = test_hub(SessionSettings::default());
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	tokio::spawn(serve(listener, hub.context.clone()));
	(hub, addr)
}

async fn connect(addr: SocketAddr, query: &str) -> Result<Client, WsError> {
	connect_async(format!("ws://{addr}/ws?{query}")).await.map(|(ws, _resp)| ws)
}

fn rejection_status(result: Result<Client, WsError>) -> StatusCode {
	match result {
		Err(WsError::Http(resp)) => resp.status(),
		Err(other) => panic!("expected http rejection, got {other}"),
		Ok(_) => panic!("expected handshake to be rejected"),
	}
}

async fn wait_for_sessions(hub: &TestHub, in_room: usize, staff_listeners: usize) {
	for _ in 0..200 {
		let counts = hub.registry.room_member_counts().await.unwrap();
		let members = counts.values().sum::<usize>();
		let listeners = hub.registry.global_listeners(Role::Staff).await.unwrap().len();
		if members == in_room && listeners == staff_listeners {
			return;
		}
		tokio::time::sleep(Duration::from_millis(5)).await;
	}
	panic!("sessions never registered");
}

async fn next_text(ws: &mut Client) -> Value {
	loop {
		let msg = timeout(Duration::from_secs(2), ws.next())
			.await
			.expect("frame within timeout")
			.expect("stream open")
			.expect("frame ok");
		if let Message::Text(text) = msg {
			return serde_json::from_str(text.as_str()).expect("json frame");
		}
	}
}

async fn assert_no_frame(ws: &mut Client) {
	if let Ok(Some(Ok(msg))) = timeout(Duration::from_millis(200), ws.next()).await {
		panic!("unexpected frame: {msg:?}");
	}
}

#[tokio::test]
async fn customer_message_reaches_staff_listener_over_websocket() {
	let (hub, addr) = start().await;

	let customer = token_for("cust-a", Role::Customer);
	let agent = token_for("agent-b", Role::Staff);

	let mut b = connect(addr, &format!("token={agent}")).await.unwrap();
	wait_for_sessions(&hub, 0, 1).await;
	let mut a = connect(addr, &format!("token={customer}&room=support-chat")).await.unwrap();
	wait_for_sessions(&hub, 1, 1).await;

	let opened = next_text(&mut b).await;
	assert_eq!(opened["type"], "room_opened");
	assert_eq!(opened["room"], WellKnownRoom::SupportChat.room_id().to_string());

	a.send(Message::text(r#"{"type":"message","message":"hello, anyone there?"}"#))
		.await
		.unwrap();

	let got = next_text(&mut b).await;
	assert_eq!(got["type"], "message");
	assert_eq!(got["message"], "hello, anyone there?");
	assert_eq!(got["sender"]["id"], "cust-a");
	assert_eq!(got["sender"]["role"], "customer");
	assert_eq!(hub.store.messages().len(), 1);

	assert_no_frame(&mut b).await;
	assert_no_frame(&mut a).await;

	a.send(Message::text(r#"{"type":"ping"}"#)).await.unwrap();
	assert_eq!(next_text(&mut a).await["type"], "pong");

	a.close(None).await.unwrap();
	wait_for_sessions(&hub, 0, 1).await;
}

#[tokio::test]
async fn bad_credentials_are_refused_before_upgrade() {
	let (hub, addr) = start().await;

	assert_eq!(rejection_status(connect(addr, "room=1").await), StatusCode::UNAUTHORIZED);
	assert_eq!(
		rejection_status(connect(addr, "token=v1.bogus.sig&room=1").await),
		StatusCode::UNAUTHORIZED
	);

	let token = token_for("cust-a", Role::Customer);
	assert_eq!(
		rejection_status(connect(addr, &format!("token={token}&room=0")).await),
		StatusCode::BAD_REQUEST
	);

	assert!(hub.registry.room_member_counts().await.unwrap().is_empty());
	assert!(hub.registry.global_listeners(Role::Customer).await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn stalled_upgrade_is_abandoned_after_handshake_timeout() {
	let hub = test_hub(SessionSettings::default());
	let limit = hub.context.settings.handshake_timeout;

	let (silent_io, _silent_peer) = tokio::io::duplex(1024);
	let start = Instant::now();
	timeout(limit + Duration::from_secs(1), handle_connection(1, silent_io, hub.context.clone()))
		.await
		.expect("silent peer released after the handshake timeout");
	assert!(start.elapsed() >= limit);

	let (trickle_io, mut trickle_peer) = tokio::io::duplex(1024);
	trickle_peer.write_all(b"GET /ws?token=x HTTP/1.1\r\nHost: hub\r\n").await.unwrap();
	let start = Instant::now();
	timeout(limit + Duration::from_secs(1), handle_connection(2, trickle_io, hub.context.clone()))
		.await
		.expect("partial request released after the handshake timeout");
	assert!(start.elapsed() >= limit);

	assert!(hub.registry.room_member_counts().await.unwrap().is_empty());
	assert!(hub.registry.global_listeners(Role::Customer).await.unwrap().is_empty());
	assert!(hub.registry.global_listeners(Role::Staff).await.unwrap().is_empty());
}
