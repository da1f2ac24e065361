#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use errand_domain::{NormalizeError, RoomId, RoomRef, normalize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_tungstenite::accept_hdr_async_with_config;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{HeaderMap, StatusCode, Uri, header};
use tracing::{debug, info, warn};

use crate::server::auth::{IdentityVerifier, VerifiedIdentity};
use crate::server::dispatch::Dispatcher;
use crate::server::session::{SessionHandle, SessionSettings, run_session};

const ACCEPT_BACKOFF_BASE: Duration = Duration::from_millis(10);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Shared dependencies for accepted connections.
pub struct HubContext {
	pub settings: SessionSettings,
	pub verifier: Arc<dyn IdentityVerifier>,
	pub dispatcher: Dispatcher,
}

/// Credential and room taken from the upgrade request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandshakeRequest {
	pub token: Option<String>,
	pub room: Option<String>,
}

impl HandshakeRequest {
	/// Query `token` wins over `Authorization: Bearer`.
	pub fn from_parts(uri: &Uri, headers: &HeaderMap) -> Self {
		let mut req = HandshakeRequest::default();

		if let Some(query) = uri.query() {
			for (k, v) in url::form_urlencoded::parse(query.as_bytes()) {
				match k.as_ref() {
					"token" if req.token.is_none() => req.token = Some(v.into_owned()),
					"room" if req.room.is_none() => req.room = Some(v.into_owned()),
					_ => {}
				}
			}
		}

		if req.token.is_none()
			&& let Some(value) = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok())
			&& let Some(bearer) = value.strip_prefix("Bearer ").or_else(|| value.strip_prefix("bearer "))
		{
			req.token = Some(bearer.trim().to_string());
		}

		req.token = req.token.filter(|t| !t.trim().is_empty());
		req.room = req.room.filter(|r| !r.trim().is_empty());
		req
	}
}

/// Why an upgrade was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeRejection {
	Unauthorized(String),
	BadRoom(NormalizeError),
}

impl HandshakeRejection {
	pub fn status(&self) -> StatusCode {
		match self {
			HandshakeRejection::Unauthorized(_) => StatusCode::UNAUTHORIZED,
			HandshakeRejection::BadRoom(_) => StatusCode::BAD_REQUEST,
		}
	}

	fn into_response(self) -> ErrorResponse {
		let body = match &self {
			HandshakeRejection::Unauthorized(_) => "unauthorized".to_string(),
			HandshakeRejection::BadRoom(e) => format!("invalid room: {e}"),
		};
		let mut resp = ErrorResponse::new(Some(body));
		*resp.status_mut() = self.status();
		resp
	}
}

/// Identity and initial room of an accepted upgrade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
	pub who: VerifiedIdentity,
	pub room: Option<RoomId>,
}

/// Verify the credential, then normalize the optional room.
pub fn admit(req: &HandshakeRequest, verifier: &dyn IdentityVerifier) -> Result<Admission, HandshakeRejection> {
	let token = req
		.token
		.as_deref()
		.ok_or_else(|| HandshakeRejection::Unauthorized("missing token".to_string()))?;

	let who = verifier
		.verify(token)
		.map_err(|e| HandshakeRejection::Unauthorized(format!("{e:#}")))?;

	let room = match req.room.as_deref() {
		Some(raw) => Some(
			RoomRef::from_text(raw)
				.and_then(|r| normalize(&r))
				.map_err(HandshakeRejection::BadRoom)?,
		),
		None => None,
	};

	Ok(Admission { who, room })
}

/// Accept websocket connections until the listener fails.
pub async fn serve(listener: TcpListener, hub: Arc<HubContext>) -> anyhow::Result<()> {
	let mut next_conn_id: u64 = 1;
	let mut accept_failures: u32 = 0;

	loop {
		let (stream, peer) = match listener.accept().await {
			Ok(accepted) => {
				accept_failures = 0;
				accepted
			}
			Err(e) => {
				accept_failures = accept_failures.saturating_add(1);
				let backoff = accept_backoff(accept_failures);
				warn!(error = %e, failures = accept_failures, ?backoff, "accept failed; backing off");
				tokio::time::sleep(backoff).await;
				continue;
			}
		};

		let conn_id = next_conn_id;
		next_conn_id += 1;
		metrics::counter!("errand_hub_connections_total").increment(1);
		debug!(conn_id, remote = %peer, "accepted tcp connection");

		let hub = Arc::clone(&hub);
		tokio::spawn(async move {
			handle_connection(conn_id, stream, hub).await;
		});
	}
}

/// Delay before retrying `accept` after consecutive failures, e.g. fd exhaustion.
fn accept_backoff(failures: u32) -> Duration {
	let exp = failures.saturating_sub(1).min(7);
	ACCEPT_BACKOFF_BASE.saturating_mul(1 << exp).min(ACCEPT_BACKOFF_MAX)
}

/// Run the upgrade handshake, then the session, for one connection.
pub async fn handle_connection<S>(conn_id: u64, stream: S, hub: Arc<HubContext>)
where
	S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
	let (admitted_tx, admitted_rx) = oneshot::channel::<Admission>();
	let verifier = Arc::clone(&hub.verifier);

	let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
		let parsed = HandshakeRequest::from_parts(req.uri(), req.headers());
		match admit(&parsed, verifier.as_ref()) {
			Ok(admission) => {
				let _ = admitted_tx.send(admission);
				Ok(resp)
			}
			Err(rejection) => {
				metrics::counter!("errand_hub_handshake_rejected_total").increment(1);
				info!(conn_id, status = %rejection.status(), reason = ?rejection, "handshake rejected");
				Err(rejection.into_response())
			}
		}
	};

	let ws_config = hub.settings.websocket_config();

	let upgrade = accept_hdr_async_with_config(stream, callback, Some(ws_config));
	let ws = match tokio::time::timeout(hub.settings.handshake_timeout, upgrade).await {
		Ok(Ok(ws)) => ws,
		Ok(Err(e)) => {
			debug!(conn_id, error = %e, "websocket handshake failed");
			return;
		}
		Err(_) => {
			metrics::counter!("errand_hub_handshake_rejected_total").increment(1);
			debug!(conn_id, timeout = ?hub.settings.handshake_timeout, "websocket handshake timed out");
			return;
		}
	};

	let Ok(admission) = admitted_rx.await else {
		warn!(conn_id, "handshake completed without an admission");
		return;
	};

	let (handle, outbox_rx) =
		SessionHandle::new(admission.who.identity, admission.who.role, hub.settings.outbox_capacity);
	debug!(conn_id, session_id = %handle.id(), "websocket upgraded");

	run_session(
		ws,
		handle,
		outbox_rx,
		admission.room,
		hub.dispatcher.clone(),
		hub.settings.clone(),
	)
	.await;
}
