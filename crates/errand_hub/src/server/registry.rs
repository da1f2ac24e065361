#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};

use errand_domain::{IdentityId, Role, RoomId, SessionId};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::server::session::{DrainReason, SessionHandle};

/// Configuration for the registry task.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
	/// Maximum number of queued commands before callers wait.
	pub command_queue_capacity: usize,

	pub debug_logs: bool,
}

impl Default for RegistryConfig {
	fn default() -> Self {
		Self {
			command_queue_capacity: 1024,
			debug_logs: false,
		}
	}
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
	#[error("session {0} is not registered")]
	NotRegistered(SessionId),

	#[error("registry task is not running")]
	Unavailable,
}

/// Result of registering a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegisterOutcome {
	/// False when the session id was already present.
	pub inserted: bool,
	/// True when the session's room had no members before.
	pub room_created: bool,
}

/// Result of moving a session into a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JoinOutcome {
	/// Room the session left to join, if any.
	pub left: Option<RoomId>,
	/// True when the target room had no members before.
	pub room_created: bool,
	/// True when the session was already in the target room.
	pub unchanged: bool,
}

/// A session removed from the registry.
#[derive(Debug, Clone)]
pub struct Unregistered {
	pub handle: SessionHandle,
	pub room: Option<RoomId>,
	/// True when the room became empty and was pruned.
	pub room_pruned: bool,
}

#[derive(Debug)]
struct SessionEntry {
	handle: SessionHandle,
	room: Option<RoomId>,
}

/// Session and room membership tables.
///
/// Every session is in at most one room. A session without a room is a global
/// listener. Rooms exist only while they have members.
#[derive(Debug, Default)]
pub struct RegistryState {
	sessions: HashMap<SessionId, SessionEntry>,
	rooms: HashMap<RoomId, HashSet<SessionId>>,
}

impl RegistryState {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn register(&mut self, handle: SessionHandle, room: Option<RoomId>) -> RegisterOutcome {
		let id = handle.id().clone();
		if self.sessions.contains_key(&id) {
			return RegisterOutcome::default();
		}

		let room_created = match room {
			Some(room) => self.insert_member(room, id.clone()),
			None => false,
		};

		self.sessions.insert(id, SessionEntry { handle, room });

		RegisterOutcome {
			inserted: true,
			room_created,
		}
	}

	pub fn unregister(&mut self, id: &SessionId) -> Option<Unregistered> {
		let entry = self.sessions.remove(id)?;

		let room_pruned = match entry.room {
			Some(room) => self.remove_member(&room, id),
			None => false,
		};

		Some(Unregistered {
			handle: entry.handle,
			room: entry.room,
			room_pruned,
		})
	}

	pub fn join_room(&mut self, id: &SessionId, room: RoomId) -> Result<JoinOutcome, RegistryError> {
		let current = self
			.sessions
			.get(id)
			.ok_or_else(|| RegistryError::NotRegistered(id.clone()))?
			.room;

		if current == Some(room) {
			return Ok(JoinOutcome {
				left: None,
				room_created: false,
				unchanged: true,
			});
		}

		if let Some(prev) = current {
			self.remove_member(&prev, id);
		}

		let room_created = self.insert_member(room, id.clone());
		if let Some(entry) = self.sessions.get_mut(id) {
			entry.room = Some(room);
		}

		Ok(JoinOutcome {
			left: current,
			room_created,
			unchanged: false,
		})
	}

	/// Clear the session's room, making it a global listener. Returns the room it left.
	pub fn leave_room(&mut self, id: &SessionId) -> Result<Option<RoomId>, RegistryError> {
		let entry = self
			.sessions
			.get_mut(id)
			.ok_or_else(|| RegistryError::NotRegistered(id.clone()))?;

		let Some(prev) = entry.room.take() else {
			return Ok(None);
		};

		self.remove_member(&prev, id);
		Ok(Some(prev))
	}

	pub fn members_of(&self, room: &RoomId) -> Vec<SessionHandle> {
		let Some(members) = self.rooms.get(room) else {
			return Vec::new();
		};

		members
			.iter()
			.filter_map(|id| self.sessions.get(id))
			.map(|entry| entry.handle.clone())
			.collect()
	}

	/// Sessions with the given role and no current room.
	pub fn global_listeners(&self, role: Role) -> Vec<SessionHandle> {
		self.sessions
			.values()
			.filter(|entry| entry.room.is_none() && entry.handle.role() == role)
			.map(|entry| entry.handle.clone())
			.collect()
	}

	pub fn room_of(&self, id: &SessionId) -> Option<RoomId> {
		self.sessions.get(id).and_then(|entry| entry.room)
	}

	pub fn room_member_counts(&self) -> HashMap<RoomId, usize> {
		self.rooms.iter().map(|(room, members)| (*room, members.len())).collect()
	}

	/// Which of `candidates` have at least one registered session.
	pub fn online_among(&self, candidates: &[IdentityId]) -> HashSet<IdentityId> {
		let wanted = candidates.iter().collect::<HashSet<_>>();
		self.sessions
			.values()
			.map(|entry| entry.handle.identity())
			.filter(|identity| wanted.contains(identity))
			.cloned()
			.collect()
	}

	pub fn session_count(&self) -> usize {
		self.sessions.len()
	}

	pub fn room_count(&self) -> usize {
		self.rooms.len()
	}

	/// Returns true when the room was created by this insert.
	fn insert_member(&mut self, room: RoomId, id: SessionId) -> bool {
		let members = self.rooms.entry(room).or_default();
		let created = members.is_empty();
		members.insert(id);
		created
	}

	/// Returns true when the room became empty and was removed.
	fn remove_member(&mut self, room: &RoomId, id: &SessionId) -> bool {
		let Some(members) = self.rooms.get_mut(room) else {
			return false;
		};

		members.remove(id);
		if members.is_empty() {
			self.rooms.remove(room);
			return true;
		}

		false
	}

	/// Check the membership tables agree with each other.
	#[cfg(test)]
	pub(crate) fn check_invariants(&self) -> Result<(), String> {
		for (room, members) in &self.rooms {
			if members.is_empty() {
				return Err(format!("room {room} is empty but still present"));
			}
			for id in members {
				match self.sessions.get(id) {
					Some(entry) if entry.room == Some(*room) => {}
					Some(entry) => {
						return Err(format!("session {id} listed in {room} but records {:?}", entry.room));
					}
					None => return Err(format!("room {room} lists unknown session {id}")),
				}
			}
		}

		for (id, entry) in &self.sessions {
			if let Some(room) = entry.room
				&& !self.rooms.get(&room).is_some_and(|m| m.contains(id))
			{
				return Err(format!("session {id} records {room} but is not a member"));
			}
		}

		Ok(())
	}
}

enum RegistryCmd {
	Register {
		handle: SessionHandle,
		room: Option<RoomId>,
		reply: oneshot::Sender<RegisterOutcome>,
	},
	Unregister {
		id: SessionId,
		reply: oneshot::Sender<Option<Unregistered>>,
	},
	JoinRoom {
		id: SessionId,
		room: RoomId,
		reply: oneshot::Sender<Result<JoinOutcome, RegistryError>>,
	},
	LeaveRoom {
		id: SessionId,
		reply: oneshot::Sender<Result<Option<RoomId>, RegistryError>>,
	},
	MembersOf {
		room: RoomId,
		reply: oneshot::Sender<Vec<SessionHandle>>,
	},
	GlobalListeners {
		role: Role,
		reply: oneshot::Sender<Vec<SessionHandle>>,
	},
	RoomOf {
		id: SessionId,
		reply: oneshot::Sender<Option<RoomId>>,
	},
	RoomCounts {
		reply: oneshot::Sender<HashMap<RoomId, usize>>,
	},
	OnlineAmong {
		candidates: Vec<IdentityId>,
		reply: oneshot::Sender<HashSet<IdentityId>>,
	},
}

/// Handle to the registry task.
///
/// The task is the only owner of [`RegistryState`]; every read and write is a
/// command answered over a oneshot channel.
#[derive(Debug, Clone)]
pub struct Registry {
	tx: mpsc::Sender<RegistryCmd>,
}

impl std::fmt::Debug for RegistryCmd {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let name = match self {
			RegistryCmd::Register { .. } => "Register",
			RegistryCmd::Unregister { .. } => "Unregister",
			RegistryCmd::JoinRoom { .. } => "JoinRoom",
			RegistryCmd::LeaveRoom { .. } => "LeaveRoom",
			RegistryCmd::MembersOf { .. } => "MembersOf",
			RegistryCmd::GlobalListeners { .. } => "GlobalListeners",
			RegistryCmd::RoomOf { .. } => "RoomOf",
			RegistryCmd::RoomCounts { .. } => "RoomCounts",
			RegistryCmd::OnlineAmong { .. } => "OnlineAmong",
		};
		f.write_str(name)
	}
}

/// Spawn the registry task on the current runtime.
pub fn spawn_registry(cfg: RegistryConfig) -> Registry {
	let (tx, rx) = mpsc::channel(cfg.command_queue_capacity.max(1));
	tokio::spawn(run_registry(rx, cfg));
	Registry { tx }
}

async fn run_registry(mut rx: mpsc::Receiver<RegistryCmd>, cfg: RegistryConfig) {
	let mut state = RegistryState::new();

	while let Some(cmd) = rx.recv().await {
		match cmd {
			RegistryCmd::Register { handle, room, reply } => {
				let session_id = handle.id().clone();
				let outcome = state.register(handle, room);
				if cfg.debug_logs {
					debug!(
						session_id = %session_id,
						room = ?room,
						inserted = outcome.inserted,
						room_created = outcome.room_created,
						sessions = state.session_count(),
						"registry: register"
					);
				}
				let _ = reply.send(outcome);
			}
			RegistryCmd::Unregister { id, reply } => {
				let removed = state.unregister(&id);
				if let Some(removed) = &removed {
					removed.handle.drain(DrainReason::Unregistered);
					if cfg.debug_logs {
						debug!(
							session_id = %id,
							room = ?removed.room,
							room_pruned = removed.room_pruned,
							sessions = state.session_count(),
							rooms = state.room_count(),
							"registry: unregister"
						);
					}
				}
				let _ = reply.send(removed);
			}
			RegistryCmd::JoinRoom { id, room, reply } => {
				let res = state.join_room(&id, room);
				if cfg.debug_logs {
					debug!(session_id = %id, room = %room, result = ?res, "registry: join");
				}
				let _ = reply.send(res);
			}
			RegistryCmd::LeaveRoom { id, reply } => {
				let _ = reply.send(state.leave_room(&id));
			}
			RegistryCmd::MembersOf { room, reply } => {
				let _ = reply.send(state.members_of(&room));
			}
			RegistryCmd::GlobalListeners { role, reply } => {
				let _ = reply.send(state.global_listeners(role));
			}
			RegistryCmd::RoomOf { id, reply } => {
				let _ = reply.send(state.room_of(&id));
			}
			RegistryCmd::RoomCounts { reply } => {
				let _ = reply.send(state.room_member_counts());
			}
			RegistryCmd::OnlineAmong { candidates, reply } => {
				let _ = reply.send(state.online_among(&candidates));
			}
		}
	}

	debug!("registry: command channel closed");
}

impl Registry {
	async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> RegistryCmd) -> Result<T, RegistryError> {
		let (reply, rx) = oneshot::channel();
		self.tx.send(make(reply)).await.map_err(|_| RegistryError::Unavailable)?;
		rx.await.map_err(|_| RegistryError::Unavailable)
	}

	/// Add a session. Registering an id twice is a no-op.
	pub async fn register(&self, handle: SessionHandle, room: Option<RoomId>) -> Result<RegisterOutcome, RegistryError> {
		self.request(|reply| RegistryCmd::Register { handle, room, reply })
			.await
	}

	/// Remove a session and move it to `Draining`. Unknown ids are a no-op.
	pub async fn unregister(&self, id: &SessionId) -> Result<Option<Unregistered>, RegistryError> {
		let id = id.clone();
		self.request(|reply| RegistryCmd::Unregister { id, reply }).await
	}

	pub async fn join_room(&self, id: &SessionId, room: RoomId) -> Result<JoinOutcome, RegistryError> {
		let id = id.clone();
		self.request(|reply| RegistryCmd::JoinRoom { id, room, reply }).await?
	}

	pub async fn leave_room(&self, id: &SessionId) -> Result<Option<RoomId>, RegistryError> {
		let id = id.clone();
		self.request(|reply| RegistryCmd::LeaveRoom { id, reply }).await?
	}

	pub async fn members_of(&self, room: RoomId) -> Result<Vec<SessionHandle>, RegistryError> {
		self.request(|reply| RegistryCmd::MembersOf { room, reply }).await
	}

	pub async fn global_listeners(&self, role: Role) -> Result<Vec<SessionHandle>, RegistryError> {
		self.request(|reply| RegistryCmd::GlobalListeners { role, reply })
			.await
	}

	#[allow(dead_code)]
	pub async fn room_of(&self, id: &SessionId) -> Result<Option<RoomId>, RegistryError> {
		let id = id.clone();
		self.request(|reply| RegistryCmd::RoomOf { id, reply }).await
	}

	pub async fn room_member_counts(&self) -> Result<HashMap<RoomId, usize>, RegistryError> {
		self.request(|reply| RegistryCmd::RoomCounts { reply }).await
	}

	pub async fn online_among(&self, candidates: Vec<IdentityId>) -> Result<HashSet<IdentityId>, RegistryError> {
		self.request(|reply| RegistryCmd::OnlineAmong { candidates, reply })
			.await
	}
}
