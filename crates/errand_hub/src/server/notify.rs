#![forbid(unsafe_code)]

use std::sync::Arc;

use async_trait::async_trait;
use errand_domain::{IdentityId, Role, RoomId};
use errand_protocol::{OutboundEnvelope, SenderInfo};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::server::registry::Registry;

const PREVIEW_CHARS: usize = 80;

/// Offline notification for one recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
	pub recipient: IdentityId,
	pub room: RoomId,
	pub from: SenderInfo,
	pub preview: String,
}

/// Source of candidate recipients for offline notifications.
pub trait RecipientDirectory: Send + Sync {
	fn recipients(&self, role: Role, room: &RoomId) -> Vec<IdentityId>;
}

/// Directory with a fixed staff roster. Customers are not known to the hub.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
	staff: Vec<IdentityId>,
}

impl StaticDirectory {
	pub fn new(staff: Vec<IdentityId>) -> Self {
		Self { staff }
	}
}

impl RecipientDirectory for StaticDirectory {
	fn recipients(&self, role: Role, _room: &RoomId) -> Vec<IdentityId> {
		match role {
			Role::Staff => self.staff.clone(),
			Role::Customer | Role::System => Vec::new(),
		}
	}
}

#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
	async fn notify(&self, notification: &Notification) -> anyhow::Result<()>;
}

/// Dispatcher that records notifications in the log; delivery happens elsewhere.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogDispatcher;

#[async_trait]
impl NotificationDispatcher for LogDispatcher {
	async fn notify(&self, n: &Notification) -> anyhow::Result<()> {
		info!(
			recipient = %n.recipient,
			room = %n.room,
			from = %n.from.id,
			preview = %n.preview,
			"offline notification"
		);
		Ok(())
	}
}

/// Fire-and-forget offline notifications for routed chat messages.
#[derive(Clone)]
pub struct Notifier {
	enabled: bool,
	registry: Registry,
	directory: Arc<dyn RecipientDirectory>,
	dispatcher: Arc<dyn NotificationDispatcher>,
}

impl Notifier {
	pub fn new(
		registry: Registry,
		directory: Arc<dyn RecipientDirectory>,
		dispatcher: Arc<dyn NotificationDispatcher>,
	) -> Self {
		Self {
			enabled: true,
			registry,
			directory,
			dispatcher,
		}
	}

	pub fn disabled(registry: Registry) -> Self {
		Self {
			enabled: false,
			registry,
			directory: Arc::new(StaticDirectory::default()),
			dispatcher: Arc::new(LogDispatcher),
		}
	}

	/// Notify offline counterparts of the sender. Returns the spawned task, if any.
	pub fn spawn_for_message(&self, env: &OutboundEnvelope) -> Option<JoinHandle<usize>> {
		if !self.enabled {
			return None;
		}
		let room = env.room?;
		let text = env.message.as_deref()?;

		let counterpart = match env.sender.role {
			Role::Customer => Role::Staff,
			Role::Staff | Role::System => Role::Customer,
		};

		let candidates = self
			.directory
			.recipients(counterpart, &room)
			.into_iter()
			.filter(|id| *id != env.sender.id)
			.collect::<Vec<_>>();
		if candidates.is_empty() {
			return None;
		}

		let preview = text.chars().take(PREVIEW_CHARS).collect::<String>();
		let from = env.sender.clone();
		let registry = self.registry.clone();
		let dispatcher = Arc::clone(&self.dispatcher);

		Some(tokio::spawn(async move {
			let online = match registry.online_among(candidates.clone()).await {
				Ok(online) => online,
				Err(e) => {
					warn!(error = %e, "notify: registry unavailable; skipping");
					return 0;
				}
			};

			let mut sent = 0;
			for recipient in candidates.into_iter().filter(|id| !online.contains(id)) {
				let n = Notification {
					recipient,
					room,
					from: from.clone(),
					preview: preview.clone(),
				};
				match dispatcher.notify(&n).await {
					Ok(()) => sent += 1,
					Err(e) => warn!(recipient = %n.recipient, error = %e, "notify: dispatch failed"),
				}
			}

			debug!(room = %room, sent, "notify: done");
			sent
		}))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::server::registry::{RegistryConfig, spawn_registry};
	use crate::server::session::SessionHandle;
	use errand_domain::WellKnownRoom;
	use errand_protocol::EnvelopeKind;
	use std::sync::Mutex;

	#[derive(Default)]
	struct Recording(Mutex<Vec<Notification>>);

	#[async_trait]
	impl NotificationDispatcher for Recording {
		async fn notify(&self, n: &Notification) -> anyhow::Result<()> {
			self.0.lock().unwrap().push(n.clone());
			Ok(())
		}
	}

	fn id(s: &str) -> IdentityId {
		IdentityId::new(s).unwrap()
	}

	fn chat(from: &str, role: Role, room: RoomId, text: &str) -> OutboundEnvelope {
		OutboundEnvelope {
			kind: EnvelopeKind::Message,
			room: Some(room),
			sender: SenderInfo { id: id(from), role },
			message: Some(text.to_string()),
			data: None,
			timestamp: 0,
		}
	}

	#[tokio::test]
	async fn only_offline_staff_are_notified() {
		let registry = spawn_registry(RegistryConfig::default());
		let (online_agent, _rx) = SessionHandle::new(id("agent-online"), Role::Staff, 4);
		registry.register(online_agent, None).await.unwrap();

		let recorder = Arc::new(Recording::default());
		let notifier = Notifier::new(
			registry,
			Arc::new(StaticDirectory::new(vec![id("agent-online"), id("agent-away")])),
			recorder.clone(),
		);

		let room = WellKnownRoom::SupportChat.room_id();
		let task = notifier
			.spawn_for_message(&chat("cust-1", Role::Customer, room, "is anyone there?"))
			.expect("task spawned");
		assert_eq!(task.await.unwrap(), 1);

		let sent = recorder.0.lock().unwrap().clone();
		assert_eq!(sent.len(), 1);
		assert_eq!(sent[0].recipient, id("agent-away"));
		assert_eq!(sent[0].room, room);
		assert_eq!(sent[0].preview, "is anyone there?");
	}

	#[tokio::test]
	async fn staff_messages_have_no_static_recipients() {
		let registry = spawn_registry(RegistryConfig::default());
		let notifier = Notifier::new(
			registry,
			Arc::new(StaticDirectory::new(vec![id("agent-1")])),
			Arc::new(Recording::default()),
		);
		let room = WellKnownRoom::OrderHelp.room_id();
		assert!(notifier.spawn_for_message(&chat("agent-1", Role::Staff, room, "hi")).is_none());
	}

	#[tokio::test]
	async fn disabled_notifier_does_nothing() {
		let notifier = Notifier::disabled(spawn_registry(RegistryConfig::default()));
		let room = WellKnownRoom::SupportChat.room_id();
		assert!(notifier.spawn_for_message(&chat("cust-1", Role::Customer, room, "hi")).is_none());
	}
}
