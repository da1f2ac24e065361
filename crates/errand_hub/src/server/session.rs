#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use errand_domain::{IdentityId, Role, RoomId, SessionId};
use errand_protocol::{OutboundEnvelope, encode_envelope};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::{debug, info, warn};

use crate::server::dispatch::Dispatcher;

const SOCKET_FRAME_HEADROOM: usize = 2;

/// Per-session limits and liveness timing.
#[derive(Debug, Clone)]
pub struct SessionSettings {
	/// Maximum number of queued outbound envelopes before the session is dropped.
	pub outbox_capacity: usize,
	/// Interval between liveness pings written by the hub.
	pub ping_interval: Duration,
	/// Reader deadline; reset by any inbound frame.
	pub read_deadline: Duration,
	/// Consecutive deadline expiries tolerated before draining.
	pub max_missed_pongs: u32,
	/// Deadline for one websocket write.
	pub write_timeout: Duration,
	/// Maximum inbound text frame size.
	pub max_message_bytes: usize,
	/// Deadline for the websocket upgrade after the TCP accept.
	pub handshake_timeout: Duration,
}

impl Default for SessionSettings {
	fn default() -> Self {
		Self {
			outbox_capacity: 256,
			ping_interval: Duration::from_secs(20),
			read_deadline: Duration::from_secs(30),
			max_missed_pongs: 2,
			write_timeout: Duration::from_secs(5),
			max_message_bytes: errand_protocol::DEFAULT_MAX_MESSAGE_BYTES,
			handshake_timeout: Duration::from_secs(10),
		}
	}
}

impl SessionSettings {
	/// Upper bound between the last inbound frame and the liveness teardown.
	pub fn liveness_window(&self) -> Duration {
		self.read_deadline.saturating_mul(self.max_missed_pongs.max(1))
	}

	/// Socket-level frame limit. Frames between `max_message_bytes` and this limit
	/// are dropped per envelope; larger ones end the session.
	pub fn socket_frame_limit(&self) -> usize {
		self.max_message_bytes.saturating_mul(SOCKET_FRAME_HEADROOM)
	}

	pub fn websocket_config(&self) -> WebSocketConfig {
		let limit = self.socket_frame_limit();
		WebSocketConfig::default()
			.max_message_size(Some(limit))
			.max_frame_size(Some(limit))
	}
}

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionPhase {
	Connecting,
	Active,
	Draining,
	Closed,
}

impl SessionPhase {
	/// Whether the session still accepts outbound envelopes.
	pub const fn is_open(self) -> bool {
		matches!(self, SessionPhase::Connecting | SessionPhase::Active)
	}
}

/// Why a session left the open phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainReason {
	PeerClosed,
	ReadError,
	WriteFailed,
	OutboxFull,
	LivenessTimeout,
	Unregistered,
	RegistryUnavailable,
}

impl DrainReason {
	pub const fn as_str(self) -> &'static str {
		match self {
			DrainReason::PeerClosed => "peer_closed",
			DrainReason::ReadError => "read_error",
			DrainReason::WriteFailed => "write_failed",
			DrainReason::OutboxFull => "outbox_full",
			DrainReason::LivenessTimeout => "liveness_timeout",
			DrainReason::Unregistered => "unregistered",
			DrainReason::RegistryUnavailable => "registry_unavailable",
		}
	}
}

/// Non-blocking enqueue failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
	Full,
	Closed,
}

/// Shared handle to one client session.
///
/// The registry and the router hold clones; only the session's own tasks
/// consume the outbox.
#[derive(Debug, Clone)]
pub struct SessionHandle {
	inner: Arc<SessionInner>,
}

#[derive(Debug)]
struct SessionInner {
	id: SessionId,
	identity: IdentityId,
	role: Role,
	outbox: mpsc::Sender<Arc<OutboundEnvelope>>,
	phase: watch::Sender<SessionPhase>,
}

/// Receiving half of a session outbox, consumed by the writer task.
pub type OutboxRx = mpsc::Receiver<Arc<OutboundEnvelope>>;

impl SessionHandle {
	/// Create a session in `Connecting` with a bounded outbox.
	pub fn new(identity: IdentityId, role: Role, outbox_capacity: usize) -> (Self, OutboxRx) {
		let (tx, rx) = mpsc::channel(outbox_capacity.max(1));
		let (phase, _) = watch::channel(SessionPhase::Connecting);
		let handle = Self {
			inner: Arc::new(SessionInner {
				id: SessionId::generate(),
				identity,
				role,
				outbox: tx,
				phase,
			}),
		};
		(handle, rx)
	}

	pub fn id(&self) -> &SessionId {
		&self.inner.id
	}

	pub fn identity(&self) -> &IdentityId {
		&self.inner.identity
	}

	pub fn role(&self) -> Role {
		self.inner.role
	}

	pub fn phase(&self) -> SessionPhase {
		*self.inner.phase.borrow()
	}

	pub fn subscribe_phase(&self) -> watch::Receiver<SessionPhase> {
		self.inner.phase.subscribe()
	}

	/// Enqueue without waiting.
	pub fn try_deliver(&self, env: Arc<OutboundEnvelope>) -> Result<(), DeliveryError> {
		if !self.phase().is_open() {
			return Err(DeliveryError::Closed);
		}

		match self.inner.outbox.try_send(env) {
			Ok(()) => Ok(()),
			Err(mpsc::error::TrySendError::Full(_)) => Err(DeliveryError::Full),
			Err(mpsc::error::TrySendError::Closed(_)) => Err(DeliveryError::Closed),
		}
	}

	/// Move to `Draining`. Returns `true` only for the call that made the transition.
	pub fn drain(&self, reason: DrainReason) -> bool {
		let transitioned = self.inner.phase.send_if_modified(|phase| {
			if phase.is_open() {
				*phase = SessionPhase::Draining;
				true
			} else {
				false
			}
		});

		if transitioned {
			debug!(session_id = %self.id(), reason = reason.as_str(), "session draining");
		}

		transitioned
	}

	pub(crate) fn mark_active(&self) {
		self.inner.phase.send_if_modified(|phase| {
			if *phase == SessionPhase::Connecting {
				*phase = SessionPhase::Active;
				true
			} else {
				false
			}
		});
	}

	pub(crate) fn mark_closed(&self) {
		self.inner.phase.send_replace(SessionPhase::Closed);
	}
}

/// Drive one accepted websocket until it closes.
///
/// Registers the session, runs the reader and writer tasks, and unregisters
/// once either side stops.
pub async fn run_session<S>(
	ws: WebSocketStream<S>,
	handle: SessionHandle,
	outbox_rx: OutboxRx,
	initial_room: Option<RoomId>,
	dispatcher: Dispatcher,
	settings: SessionSettings,
) where
	S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
	let registry = dispatcher.registry().clone();
	let session_id = handle.id().clone();

	let outcome = match registry.register(handle.clone(), initial_room).await {
		Ok(outcome) => outcome,
		Err(e) => {
			warn!(session_id = %session_id, error = %e, "registry unavailable; dropping session");
			handle.drain(DrainReason::RegistryUnavailable);
			handle.mark_closed();
			return;
		}
	};

	struct ActiveSessionGuard;
	impl Drop for ActiveSessionGuard {
		fn drop(&mut self) {
			metrics::gauge!("errand_hub_active_sessions").decrement(1.0);
		}
	}

	metrics::gauge!("errand_hub_active_sessions").increment(1.0);
	let _active_guard = ActiveSessionGuard;

	handle.mark_active();
	info!(
		session_id = %session_id,
		identity = %handle.identity(),
		role = %handle.role(),
		room = ?initial_room,
		"session active"
	);

	if outcome.room_created
		&& let Some(room) = initial_room
	{
		dispatcher.announce_room_opened(room, &handle).await;
	}

	let (sink, stream) = ws.split();

	let writer = tokio::spawn(write_loop(sink, outbox_rx, handle.clone(), settings.clone()));
	let reader = tokio::spawn(read_loop(stream, handle.clone(), initial_room, dispatcher, settings));

	let (read_res, write_res) = tokio::join!(reader, writer);
	if let Err(e) = read_res {
		warn!(session_id = %session_id, error = %e, "session reader task failed");
	}
	if let Err(e) = write_res {
		warn!(session_id = %session_id, error = %e, "session writer task failed");
	}

	handle.drain(DrainReason::PeerClosed);
	if let Err(e) = registry.unregister(&session_id).await {
		warn!(session_id = %session_id, error = %e, "unregister failed");
	}
	handle.mark_closed();

	info!(session_id = %session_id, "session closed");
}

async fn read_loop<S>(
	mut stream: SplitStream<WebSocketStream<S>>,
	handle: SessionHandle,
	initial_room: Option<RoomId>,
	dispatcher: Dispatcher,
	settings: SessionSettings,
) where
	S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
	let mut phase_rx = handle.subscribe_phase();
	let mut current_room = initial_room;
	let mut missed: u32 = 0;

	loop {
		let next = tokio::select! {
			biased;
			_ = phase_rx.wait_for(|p| !p.is_open()) => break,
			next = tokio::time::timeout(settings.read_deadline, stream.next()) => next,
		};

		let msg = match next {
			Err(_elapsed) => {
				missed += 1;
				debug!(session_id = %handle.id(), missed, "read deadline expired");
				if missed >= settings.max_missed_pongs.max(1) {
					metrics::counter!("errand_hub_liveness_timeouts_total").increment(1);
					info!(session_id = %handle.id(), missed, window = ?settings.liveness_window(), "liveness timeout");
					handle.drain(DrainReason::LivenessTimeout);
					break;
				}
				continue;
			}
			Ok(None) => {
				handle.drain(DrainReason::PeerClosed);
				break;
			}
			Ok(Some(Err(e))) => {
				debug!(session_id = %handle.id(), error = %e, "websocket read failed");
				handle.drain(DrainReason::ReadError);
				break;
			}
			Ok(Some(Ok(msg))) => msg,
		};

		missed = 0;

		match msg {
			Message::Text(text) => {
				dispatcher.handle_text(&handle, &mut current_room, text.as_str()).await;
			}
			Message::Binary(data) => {
				metrics::counter!("errand_hub_decode_errors_total").increment(1);
				warn!(session_id = %handle.id(), len = data.len(), "binary frame dropped");
			}
			Message::Close(frame) => {
				debug!(session_id = %handle.id(), ?frame, "peer sent close");
				handle.drain(DrainReason::PeerClosed);
				break;
			}
			Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
		}
	}
}

async fn write_loop<S>(
	mut sink: SplitSink<WebSocketStream<S>, Message>,
	mut outbox_rx: OutboxRx,
	handle: SessionHandle,
	settings: SessionSettings,
) where
	S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
	let mut phase_rx = handle.subscribe_phase();
	let mut ping = tokio::time::interval_at(Instant::now() + settings.ping_interval, settings.ping_interval);
	ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

	loop {
		let frame = tokio::select! {
			biased;
			_ = phase_rx.wait_for(|p| !p.is_open()) => break,
			item = outbox_rx.recv() => match item {
				Some(env) => match encode_envelope(&env) {
					Ok(text) => Message::text(text),
					Err(e) => {
						warn!(session_id = %handle.id(), kind = %env.kind, error = %e, "failed to encode envelope");
						continue;
					}
				},
				None => break,
			},
			_ = ping.tick() => Message::Ping(Default::default()),
		};

		if let Err(e) = write_frame(&mut sink, frame, settings.write_timeout).await {
			debug!(session_id = %handle.id(), error = %e, "websocket write failed");
			handle.drain(DrainReason::WriteFailed);
			break;
		}
	}

	outbox_rx.close();

	let _ = write_frame(&mut sink, Message::Close(None), settings.write_timeout).await;
}

async fn write_frame<S>(
	sink: &mut SplitSink<WebSocketStream<S>, Message>,
	frame: Message,
	write_timeout: Duration,
) -> Result<(), String>
where
	S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
	match tokio::time::timeout(write_timeout, sink.send(frame)).await {
		Ok(Ok(())) => Ok(()),
		Ok(Err(e)) => Err(e.to_string()),
		Err(_) => Err(format!("write timed out after {write_timeout:?}")),
	}
}
