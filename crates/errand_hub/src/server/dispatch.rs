#![forbid(unsafe_code)]

use std::sync::Arc;

use errand_domain::{NormalizeError, Role, RoomId, normalize};
use errand_protocol::{
	Decoded, EnvelopeKind, InboundEnvelope, OutboundEnvelope, SenderInfo, decode_envelope, room_ref_from_value,
};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::server::auth::VerifiedIdentity;
use crate::server::notify::Notifier;
use crate::server::registry::Registry;
use crate::server::router::{Audience, RouteReport, Router};
use crate::server::session::{DrainReason, SessionHandle};
use crate::server::store::{MessageStore, StoredMessage};
use crate::util::time::unix_ms_now;

/// Rejections for envelopes published over the admin surface.
#[derive(Debug, Error)]
pub enum PublishError {
	#[error("only message envelopes can be published, got {0}")]
	UnsupportedKind(EnvelopeKind),

	#[error("message has no room")]
	MissingRoom,

	#[error("invalid room: {0}")]
	Room(#[from] NormalizeError),

	#[error("message text is empty")]
	EmptyMessage,
}

/// Applies inbound envelopes to the registry and router.
#[derive(Clone)]
pub struct Dispatcher {
	inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
	router: Router,
	store: Arc<dyn MessageStore>,
	notifier: Notifier,
	max_message_bytes: usize,
}

impl Dispatcher {
	pub fn new(router: Router, store: Arc<dyn MessageStore>, notifier: Notifier, max_message_bytes: usize) -> Self {
		Self {
			inner: Arc::new(DispatcherInner {
				router,
				store,
				notifier,
				max_message_bytes,
			}),
		}
	}

	pub fn registry(&self) -> &Registry {
		self.inner.router.registry()
	}

	/// Decode and apply one text frame from `session`.
	pub async fn handle_text(&self, session: &SessionHandle, current_room: &mut Option<RoomId>, text: &str) {
		metrics::counter!("errand_hub_envelopes_in_total").increment(1);

		match decode_envelope(text, self.inner.max_message_bytes) {
			Ok(Decoded::Envelope(env)) => self.handle_envelope(session, current_room, env).await,
			Ok(Decoded::Unknown(kind)) => {
				debug!(session_id = %session.id(), kind = %kind, "ignoring unknown envelope type");
			}
			Err(e) => {
				metrics::counter!("errand_hub_decode_errors_total").increment(1);
				warn!(session_id = %session.id(), error = %e, "dropping undecodable frame");
			}
		}
	}

	pub async fn handle_envelope(&self, session: &SessionHandle, current_room: &mut Option<RoomId>, env: InboundEnvelope) {
		match env.kind {
			EnvelopeKind::Message => self.on_message(session, *current_room, env).await,
			EnvelopeKind::TypingStart | EnvelopeKind::TypingStop => self.on_typing(session, *current_room, env).await,
			EnvelopeKind::JoinRoom => self.on_join(session, current_room, env).await,
			EnvelopeKind::LeaveRoom => self.on_leave(session, current_room).await,
			EnvelopeKind::Ping => {
				let pong = stamp(session, EnvelopeKind::Pong, None, None, None);
				self.reply(session, pong);
			}
			EnvelopeKind::Pong | EnvelopeKind::RoomOpened => {}
		}
	}

	async fn on_message(&self, session: &SessionHandle, current_room: Option<RoomId>, env: InboundEnvelope) {
		let Some(text) = env.text().map(str::to_string) else {
			debug!(session_id = %session.id(), "dropping empty message");
			return;
		};
		let Some(room) = self.postable_room(session, current_room, env.room.as_ref()) else {
			return;
		};

		let out = stamp(session, EnvelopeKind::Message, Some(room), Some(text), env.data);
		self.deliver_chat(out, Some(session), true).await;
	}

	async fn on_typing(&self, session: &SessionHandle, current_room: Option<RoomId>, env: InboundEnvelope) {
		let Some(room) = self.postable_room(session, current_room, env.room.as_ref()) else {
			return;
		};

		let out = stamp(session, env.kind, Some(room), None, env.data);
		self.inner.router.route(out, Some(session.id())).await;
	}

	async fn on_join(&self, session: &SessionHandle, current_room: &mut Option<RoomId>, env: InboundEnvelope) {
		let Some(raw) = env.room.as_ref() else {
			warn!(session_id = %session.id(), "join_room without a room");
			return;
		};
		let Some(room) = self.normalize_logged(session, raw) else {
			return;
		};

		let outcome = match self.registry().join_room(session.id(), room).await {
			Ok(outcome) => outcome,
			Err(e) => {
				warn!(session_id = %session.id(), room = %room, error = %e, "join_room failed");
				return;
			}
		};

		*current_room = Some(room);

		let joined = stamp(session, EnvelopeKind::JoinRoom, Some(room), None, None);
		if outcome.unchanged {
			self.reply(session, joined);
			return;
		}

		if let Some(prev) = outcome.left {
			let left = stamp(session, EnvelopeKind::LeaveRoom, Some(prev), None, None);
			self.inner.router.route(left, None).await;
		}

		self.inner.router.route(joined, None).await;

		if outcome.room_created {
			self.announce_room_opened(room, session).await;
		}
	}

	async fn on_leave(&self, session: &SessionHandle, current_room: &mut Option<RoomId>) {
		match self.registry().leave_room(session.id()).await {
			Ok(Some(prev)) => {
				*current_room = None;
				let left = stamp(session, EnvelopeKind::LeaveRoom, Some(prev), None, None);
				self.reply(session, left.clone());
				self.inner.router.route(left, None).await;
			}
			Ok(None) => {
				*current_room = None;
				debug!(session_id = %session.id(), "leave_room while not in a room");
			}
			Err(e) => warn!(session_id = %session.id(), error = %e, "leave_room failed"),
		}
	}

	/// Tell staff global listeners that `room` gained its first member.
	pub async fn announce_room_opened(&self, room: RoomId, opener: &SessionHandle) {
		let opened = stamp(opener, EnvelopeKind::RoomOpened, Some(room), None, None);
		self.inner
			.router
			.route_to(Audience::GlobalListeners(Role::Staff), opened, None)
			.await;
	}

	/// Route a message that was already persisted by its originator.
	pub async fn publish_system(
		&self,
		publisher: &VerifiedIdentity,
		env: InboundEnvelope,
	) -> Result<RouteReport, PublishError> {
		if env.kind != EnvelopeKind::Message {
			return Err(PublishError::UnsupportedKind(env.kind));
		}
		let raw = env.room.as_ref().ok_or(PublishError::MissingRoom)?;
		let room = normalize(&room_ref_from_value(raw)?)?;
		let text = env.text().ok_or(PublishError::EmptyMessage)?.to_string();

		let out = OutboundEnvelope {
			kind: EnvelopeKind::Message,
			room: Some(room),
			sender: SenderInfo {
				id: publisher.identity.clone(),
				role: publisher.role,
			},
			message: Some(text),
			data: env.data,
			timestamp: unix_ms_now(),
		};

		Ok(self.deliver_chat(out, None, false).await)
	}

	/// Persist, fan out to the room and staff listeners, then notify offline counterparts.
	async fn deliver_chat(&self, out: OutboundEnvelope, sender: Option<&SessionHandle>, live: bool) -> RouteReport {
		let room = out.room;

		if live
			&& let Some(stored) = StoredMessage::from_envelope(&out)
			&& let Err(e) = self.inner.store.persist(&stored).await
		{
			metrics::counter!("errand_hub_store_errors_total").increment(1);
			warn!(room = ?room, error = %e, "failed to persist message; delivering live only");
		}

		let notify_env = live.then(|| out.clone());

		let report = match room {
			Some(room) => {
				self.inner
					.router
					.route_to(
						Audience::RoomAndListeners(room, Role::Staff),
						out,
						sender.map(SessionHandle::id),
					)
					.await
			}
			None => RouteReport::default(),
		};

		if let Some(env) = notify_env {
			self.inner.notifier.spawn_for_message(&env);
		}

		report
	}

	/// Room for a message or typing event: the explicit room if given, else the current one.
	/// Customers are confined to their current room.
	fn postable_room(&self, session: &SessionHandle, current: Option<RoomId>, raw: Option<&Value>) -> Option<RoomId> {
		let room = match raw {
			Some(raw) => self.normalize_logged(session, raw)?,
			None => match current {
				Some(room) => room,
				None => {
					debug!(session_id = %session.id(), "dropping room-scoped envelope: no room");
					return None;
				}
			},
		};

		if session.role() == Role::Customer && current != Some(room) {
			warn!(
				session_id = %session.id(),
				room = %room,
				current = ?current,
				"customer may only post into its current room"
			);
			return None;
		}

		Some(room)
	}

	fn normalize_logged(&self, session: &SessionHandle, raw: &Value) -> Option<RoomId> {
		match room_ref_from_value(raw).and_then(|r| normalize(&r)) {
			Ok(room) => Some(room),
			Err(e) => {
				metrics::counter!("errand_hub_normalize_errors_total").increment(1);
				warn!(session_id = %session.id(), raw = %raw, error = %e, "dropping envelope: bad room reference");
				None
			}
		}
	}

	fn reply(&self, session: &SessionHandle, env: OutboundEnvelope) {
		if session.try_deliver(Arc::new(env)).is_err() {
			session.drain(DrainReason::OutboxFull);
		}
	}
}

fn stamp(
	session: &SessionHandle,
	kind: EnvelopeKind,
	room: Option<RoomId>,
	message: Option<String>,
	data: Option<Value>,
) -> OutboundEnvelope {
	OutboundEnvelope {
		kind,
		room,
		sender: SenderInfo {
			id: session.identity().clone(),
			role: session.role(),
		},
		message,
		data,
		timestamp: unix_ms_now(),
	}
}
