#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use errand_domain::Role;
use errand_protocol::{Decoded, decode_envelope};
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Incoming;
use hyper::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::server::auth::IdentityVerifier;
use crate::server::dispatch::Dispatcher;

#[derive(Clone)]
pub struct AdminState {
	ready: Arc<AtomicBool>,
	dispatcher: Dispatcher,
	verifier: Arc<dyn IdentityVerifier>,
	max_body_bytes: usize,
}

impl AdminState {
	pub fn new(dispatcher: Dispatcher, verifier: Arc<dyn IdentityVerifier>, max_body_bytes: usize) -> Self {
		Self {
			ready: Arc::new(AtomicBool::new(false)),
			dispatcher,
			verifier,
			max_body_bytes,
		}
	}

	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}
}

pub fn spawn_admin_server(bind: SocketAddr, state: AdminState) {
	tokio::spawn(async move {
		if let Err(err) = run_admin_server(bind, state).await {
			warn!(error = %err, "admin server stopped");
		}
	});
}

async fn run_admin_server(bind: SocketAddr, state: AdminState) -> anyhow::Result<()> {
	let listener = TcpListener::bind(bind).await?;
	info!(%bind, "admin server listening");
	loop {
		let (stream, _addr) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let state = state.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| handle_admin(req, state.clone()));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				warn!(error = %err, "admin connection error");
			}
		});
	}
}

async fn handle_admin(req: Request<Incoming>, state: AdminState) -> Result<Response<Full<Bytes>>, hyper::Error> {
	let (parts, body) = req.into_parts();

	let body = if parts.method == Method::POST {
		match Limited::new(body, state.max_body_bytes).collect().await {
			Ok(collected) => collected.to_bytes(),
			Err(_) => return Ok(respond(StatusCode::PAYLOAD_TOO_LARGE, "body too large")),
		}
	} else {
		Bytes::new()
	};

	Ok(route_admin(&parts.method, parts.uri.path(), &parts.headers, body, &state).await)
}

pub(crate) async fn route_admin(
	method: &Method,
	path: &str,
	headers: &HeaderMap,
	body: Bytes,
	state: &AdminState,
) -> Response<Full<Bytes>> {
	match (method, path) {
		(&Method::GET, "/healthz") => respond(StatusCode::OK, "ok"),
		(&Method::GET, "/readyz") => {
			if state.is_ready() {
				respond(StatusCode::OK, "ready")
			} else {
				respond(StatusCode::SERVICE_UNAVAILABLE, "not-ready")
			}
		}
		(&Method::GET, "/rooms") => room_counts(state).await,
		(&Method::POST, "/publish") => publish(headers, body, state).await,
		(_, "/healthz" | "/readyz" | "/rooms" | "/publish") => respond(StatusCode::METHOD_NOT_ALLOWED, ""),
		_ => respond(StatusCode::NOT_FOUND, ""),
	}
}

async fn room_counts(state: &AdminState) -> Response<Full<Bytes>> {
	let counts = match state.dispatcher.registry().room_member_counts().await {
		Ok(counts) => counts,
		Err(e) => return respond(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
	};

	let sorted = counts
		.into_iter()
		.map(|(room, n)| (room.to_string(), n))
		.collect::<BTreeMap<_, _>>();

	match serde_json::to_vec(&sorted) {
		Ok(json) => respond_json(StatusCode::OK, json),
		Err(e) => respond(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
	}
}

async fn publish(headers: &HeaderMap, body: Bytes, state: &AdminState) -> Response<Full<Bytes>> {
	let token = headers
		.get(AUTHORIZATION)
		.and_then(|v| v.to_str().ok())
		.and_then(|v| v.strip_prefix("Bearer "))
		.map(str::trim)
		.unwrap_or_default();

	let publisher = match state.verifier.verify(token) {
		Ok(who) if who.role == Role::System => who,
		Ok(who) => {
			warn!(identity = %who.identity, role = %who.role, "admin publish refused for non-system identity");
			return respond(StatusCode::UNAUTHORIZED, "service token required");
		}
		Err(_) => return respond(StatusCode::UNAUTHORIZED, "unauthorized"),
	};

	let Ok(text) = std::str::from_utf8(&body) else {
		return respond(StatusCode::BAD_REQUEST, "body is not utf-8");
	};

	let env = match decode_envelope(text, state.max_body_bytes) {
		Ok(Decoded::Envelope(env)) => env,
		Ok(Decoded::Unknown(kind)) => {
			return respond(StatusCode::BAD_REQUEST, format!("unsupported envelope type: {kind}"));
		}
		Err(e) => return respond(StatusCode::BAD_REQUEST, e.to_string()),
	};

	match state.dispatcher.publish_system(&publisher, env).await {
		Ok(report) => {
			info!(delivered = report.delivered, dropped = report.dropped, "admin publish routed");
			let body = serde_json::json!({ "delivered": report.delivered, "dropped": report.dropped });
			respond_json(StatusCode::ACCEPTED, body.to_string().into_bytes())
		}
		Err(e) => respond(StatusCode::BAD_REQUEST, e.to_string()),
	}
}

fn respond(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
	let mut resp = Response::new(Full::new(body.into()));
	*resp.status_mut() = status;
	resp
}

fn respond_json(status: StatusCode, body: Vec<u8>) -> Response<Full<Bytes>> {
	let mut resp = respond(status, body);
	resp.headers_mut()
		.insert(CONTENT_TYPE, hyper::header::HeaderValue::from_static("application/json"));
	resp
}
