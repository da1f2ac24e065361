#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::sync::Arc;

use errand_domain::{Role, RoomId, SessionId};
use errand_protocol::OutboundEnvelope;
use tracing::{debug, warn};

use crate::server::registry::{Registry, RegistryError};
use crate::server::session::{DeliveryError, DrainReason, SessionHandle};

/// Settings for the broadcast router.
#[derive(Debug, Clone, Default)]
pub struct RouterConfig {
	pub debug_log_events: bool,
}

/// Who receives a routed envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
	/// Current members of one room.
	Room(RoomId),
	/// Sessions of the given role that are not in any room.
	GlobalListeners(Role),
	/// Room members plus global listeners of the given role.
	RoomAndListeners(RoomId, Role),
}

impl Audience {
	/// Room-scoped envelopes go to members; unscoped ones go to staff global listeners.
	pub fn for_envelope(env: &OutboundEnvelope) -> Self {
		match env.room {
			Some(room) => Audience::Room(room),
			None => Audience::GlobalListeners(Role::Staff),
		}
	}
}

/// Outcome of one fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RouteReport {
	/// Sessions the envelope was enqueued for.
	pub delivered: usize,
	/// Sessions torn down because their outbox was full or closed.
	pub dropped: usize,
}

/// Fans envelopes out to session outboxes.
///
/// Enqueueing never waits: a session whose outbox is full is drained and
/// unregistered, and the fan-out continues with the next recipient.
#[derive(Debug, Clone)]
pub struct Router {
	registry: Registry,
	cfg: RouterConfig,
}

impl Router {
	pub fn new(registry: Registry, cfg: RouterConfig) -> Self {
		Self { registry, cfg }
	}

	pub fn registry(&self) -> &Registry {
		&self.registry
	}

	/// Route to the audience implied by `env.room`.
	pub async fn route(&self, env: OutboundEnvelope, exclude: Option<&SessionId>) -> RouteReport {
		let audience = Audience::for_envelope(&env);
		self.route_to(audience, env, exclude).await
	}

	/// Route to an explicit audience, skipping `exclude`.
	pub async fn route_to(&self, audience: Audience, env: OutboundEnvelope, exclude: Option<&SessionId>) -> RouteReport {
		let recipients = match self.resolve(audience).await {
			Ok(recipients) => recipients,
			Err(e) => {
				warn!(error = %e, kind = %env.kind, "router: registry unavailable; envelope dropped");
				return RouteReport::default();
			}
		};

		let (kind, room) = (env.kind, env.room);
		let report = self.fan_out(&recipients, Arc::new(env), exclude).await;

		if self.cfg.debug_log_events {
			debug!(
				kind = %kind,
				room = ?room,
				audience = ?audience,
				delivered = report.delivered,
				dropped = report.dropped,
				"router: routed envelope"
			);
		}

		report
	}

	async fn resolve(&self, audience: Audience) -> Result<Vec<SessionHandle>, RegistryError> {
		match audience {
			Audience::Room(room) => self.registry.members_of(room).await,
			Audience::GlobalListeners(role) => self.registry.global_listeners(role).await,
			Audience::RoomAndListeners(room, role) => {
				let mut recipients = self.registry.members_of(room).await?;
				recipients.extend(self.registry.global_listeners(role).await?);
				Ok(recipients)
			}
		}
	}

	async fn fan_out(
		&self,
		recipients: &[SessionHandle],
		env: Arc<OutboundEnvelope>,
		exclude: Option<&SessionId>,
	) -> RouteReport {
		let mut report = RouteReport::default();
		let mut seen = HashSet::with_capacity(recipients.len());
		let mut failed = Vec::new();

		for handle in recipients {
			if exclude == Some(handle.id()) || !seen.insert(handle.id()) {
				continue;
			}

			match handle.try_deliver(env.clone()) {
				Ok(()) => report.delivered += 1,
				Err(DeliveryError::Full) => {
					metrics::counter!("errand_hub_slow_consumer_disconnects_total").increment(1);
					warn!(
						session_id = %handle.id(),
						identity = %handle.identity(),
						"router: outbox full; disconnecting slow consumer"
					);
					handle.drain(DrainReason::OutboxFull);
					failed.push(handle.id().clone());
				}
				Err(DeliveryError::Closed) => {
					failed.push(handle.id().clone());
				}
			}
		}

		metrics::counter!("errand_hub_deliveries_total").increment(report.delivered as u64);

		for id in failed {
			report.dropped += 1;
			if let Err(e) = self.registry.unregister(&id).await {
				warn!(session_id = %id, error = %e, "router: unregister failed");
			}
		}

		report
	}
}
