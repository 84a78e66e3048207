#![forbid(unsafe_code)]

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use parley_domain::{RoomKey, UserId};
use parley_protocol::{OnlineUser, ServerEvent};
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

/// Transport-assigned connection identifier, unique per session.
pub type ConnId = u64;

/// Tracks which live connections are in which broadcast room and fans
/// events out to them.
///
/// Each connection owns one bounded outbound queue. Delivery is
/// at-most-once best-effort: a full queue drops the event (clients
/// reconcile via the REST layer), a closed queue prunes the connection.
#[derive(Debug, Clone)]
pub struct RoomHub {
	inner: Arc<Mutex<Inner>>,
	cfg: RoomHubConfig,
}

/// Configuration for `RoomHub`.
#[derive(Debug, Clone)]
pub struct RoomHubConfig {
	/// Maximum number of queued outbound events per connection.
	pub subscriber_queue_capacity: usize,

	pub debug_logs: bool,
}

impl Default for RoomHubConfig {
	fn default() -> Self {
		Self {
			subscriber_queue_capacity: 1024,
			debug_logs: false,
		}
	}
}

impl RoomHub {
	pub fn new(cfg: RoomHubConfig) -> Self {
		Self {
			inner: Arc::new(Mutex::new(Inner::default())),
			cfg,
		}
	}

	/// Register a connection and return its outbound event stream.
	///
	/// The connection implicitly joins its owner's `user:<id>` room for
	/// its whole lifetime; that join is not client-requested.
	pub async fn register_conn(&self, conn_id: ConnId, user: UserId) -> mpsc::Receiver<ServerEvent> {
		let (tx, rx) = mpsc::channel(self.cfg.subscriber_queue_capacity);

		let mut inner = self.inner.lock().await;
		let user_room = RoomKey::User(user.clone());
		inner.conns.insert(
			conn_id,
			ConnEntry {
				user,
				tx,
				rooms: HashSet::from([user_room.clone()]),
			},
		);
		inner.rooms.entry(user_room).or_default().insert(conn_id);

		if self.cfg.debug_logs {
			debug!(conn_id, conns = inner.conns.len(), "room hub: connection registered");
		}

		rx
	}

	/// Remove a connection from the hub and from every room it joined.
	pub async fn unregister_conn(&self, conn_id: ConnId) {
		let mut inner = self.inner.lock().await;
		inner.remove_conn(conn_id);

		if self.cfg.debug_logs {
			debug!(conn_id, conns = inner.conns.len(), "room hub: connection unregistered");
		}
	}

	/// Add a connection to a room. Joining an already-joined room is
	/// idempotent; returns whether the membership set changed.
	pub async fn join_room(&self, conn_id: ConnId, room: RoomKey) -> bool {
		let mut inner = self.inner.lock().await;
		let Some(entry) = inner.conns.get_mut(&conn_id) else {
			return false;
		};

		if !entry.rooms.insert(room.clone()) {
			return false;
		}

		inner.rooms.entry(room.clone()).or_default().insert(conn_id);

		if self.cfg.debug_logs {
			debug!(conn_id, room = %room, "room hub: joined");
		}

		true
	}

	/// Remove a connection from a room. Leaving a room never joined is a
	/// silent no-op.
	pub async fn leave_room(&self, conn_id: ConnId, room: &RoomKey) {
		let mut inner = self.inner.lock().await;
		if let Some(entry) = inner.conns.get_mut(&conn_id)
			&& !entry.rooms.remove(room)
		{
			return;
		}

		if let Some(members) = inner.rooms.get_mut(room) {
			members.remove(&conn_id);
			if members.is_empty() {
				inner.rooms.remove(room);
			}
		}

		if self.cfg.debug_logs {
			debug!(conn_id, room = %room, "room hub: left");
		}
	}

	/// Whether a connection is currently in a room.
	pub async fn is_member(&self, conn_id: ConnId, room: &RoomKey) -> bool {
		let inner = self.inner.lock().await;
		inner
			.conns
			.get(&conn_id)
			.map(|entry| entry.rooms.contains(room))
			.unwrap_or(false)
	}

	/// Emit an event to every connection in a room.
	pub async fn emit_to_room(&self, room: &RoomKey, event: ServerEvent) {
		let mut inner = self.inner.lock().await;
		let targets: Vec<ConnId> = inner.rooms.get(room).map(|m| m.iter().copied().collect()).unwrap_or_default();
		inner.deliver(&targets, event, self.cfg.debug_logs);
	}

	/// Emit an event to every connection in a room except the sender.
	pub async fn emit_to_room_except(&self, room: &RoomKey, except: ConnId, event: ServerEvent) {
		let mut inner = self.inner.lock().await;
		let targets: Vec<ConnId> = inner
			.rooms
			.get(room)
			.map(|m| m.iter().copied().filter(|c| *c != except).collect())
			.unwrap_or_default();
		inner.deliver(&targets, event, self.cfg.debug_logs);
	}

	/// Emit an event to a single connection.
	pub async fn emit_to_conn(&self, conn_id: ConnId, event: ServerEvent) {
		let mut inner = self.inner.lock().await;
		inner.deliver(&[conn_id], event, self.cfg.debug_logs);
	}

	/// Emit an event to every connection of a user, across devices.
	pub async fn emit_to_user(&self, user: &UserId, event: ServerEvent) {
		self.emit_to_room(&RoomKey::User(user.clone()), event).await;
	}

	/// Emit an event to every live connection.
	pub async fn emit_to_all(&self, event: ServerEvent) {
		let mut inner = self.inner.lock().await;
		let targets: Vec<ConnId> = inner.conns.keys().copied().collect();
		inner.deliver(&targets, event, self.cfg.debug_logs);
	}

	/// Rooms a connection currently belongs to.
	pub async fn rooms_for_conn(&self, conn_id: ConnId) -> HashSet<RoomKey> {
		let inner = self.inner.lock().await;
		inner.conns.get(&conn_id).map(|entry| entry.rooms.clone()).unwrap_or_default()
	}

	/// Get a snapshot of member counts per room.
	pub async fn room_member_counts(&self) -> HashMap<RoomKey, usize> {
		let inner = self.inner.lock().await;
		inner.rooms.iter().map(|(k, v)| (k.clone(), v.len())).collect()
	}

	/// Aggregate per-user diagnostics snapshot for `get-online-users`.
	pub async fn online_users_snapshot(&self) -> Vec<OnlineUser> {
		let inner = self.inner.lock().await;

		let mut by_user: HashMap<UserId, (u32, BTreeSet<String>)> = HashMap::new();
		for entry in inner.conns.values() {
			let (count, rooms) = by_user.entry(entry.user.clone()).or_default();
			*count += 1;
			rooms.extend(entry.rooms.iter().map(|r| r.to_string()));
		}

		let mut users: Vec<OnlineUser> = by_user
			.into_iter()
			.map(|(user_id, (connection_count, rooms))| OnlineUser {
				user_id,
				connection_count,
				rooms: rooms.into_iter().collect(),
			})
			.collect();
		users.sort_by(|a, b| a.user_id.as_str().cmp(b.user_id.as_str()));
		users
	}
}

#[derive(Debug, Default)]
struct Inner {
	conns: HashMap<ConnId, ConnEntry>,
	rooms: HashMap<RoomKey, HashSet<ConnId>>,
}

#[derive(Debug)]
struct ConnEntry {
	user: UserId,
	tx: mpsc::Sender<ServerEvent>,
	rooms: HashSet<RoomKey>,
}

impl Inner {
	fn remove_conn(&mut self, conn_id: ConnId) {
		let Some(entry) = self.conns.remove(&conn_id) else {
			return;
		};

		for room in entry.rooms {
			if let Some(members) = self.rooms.get_mut(&room) {
				members.remove(&conn_id);
				if members.is_empty() {
					self.rooms.remove(&room);
				}
			}
		}
	}

	/// Deliver one event to the given connections, pruning any whose
	/// receiver has gone away.
	fn deliver(&mut self, targets: &[ConnId], event: ServerEvent, debug_logs: bool) {
		let mut closed: Vec<ConnId> = Vec::new();
		let mut dropped: u64 = 0;

		for conn_id in targets {
			let Some(entry) = self.conns.get(conn_id) else {
				continue;
			};

			match entry.tx.try_send(event.clone()) {
				Ok(()) => {}
				Err(mpsc::error::TrySendError::Full(_)) => {
					dropped += 1;
				}
				Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*conn_id),
			}
		}

		for conn_id in closed {
			self.remove_conn(conn_id);
		}

		if dropped > 0 {
			metrics::counter!("parley_server_events_dropped_total").increment(dropped);
			if debug_logs {
				debug!(dropped, "room hub: dropped events due to full subscriber queues");
			}
		}
	}
}
