#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parley_domain::UserId;
use tokio::sync::Mutex;

use crate::server::room_hub::ConnId;

/// Process-wide table of connected identities.
///
/// A user is online iff their active-connection set is non-empty. Adding
/// or removing a connection and checking for the online/offline edge
/// happen under one lock, so two simultaneous first (or last)
/// connections for the same user cannot both observe a transition.
///
/// The table is purely in-memory and rebuilt from scratch on restart;
/// the durable last-seen timestamp lives on the external user entity.
#[derive(Debug, Clone, Default)]
pub struct PresenceTracker {
	inner: Arc<Mutex<HashMap<UserId, HashSet<ConnId>>>>,
}

/// Aggregate presence edge produced by a register/deregister call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceTransition {
	/// First connection for the user: OFFLINE -> ONLINE.
	CameOnline,
	/// Last connection for the user closed: ONLINE -> OFFLINE.
	WentOffline,
	/// The user's aggregate state did not change.
	Unchanged,
}

impl PresenceTracker {
	pub fn new() -> Self {
		Self::default()
	}

	/// Record a new connection for a user.
	pub async fn register(&self, user: &UserId, conn_id: ConnId) -> PresenceTransition {
		let mut table = self.inner.lock().await;
		let conns = table.entry(user.clone()).or_default();
		let was_empty = conns.is_empty();
		conns.insert(conn_id);

		if was_empty {
			PresenceTransition::CameOnline
		} else {
			PresenceTransition::Unchanged
		}
	}

	/// Record a closed connection for a user. The presence record is
	/// removed entirely when its last connection goes away.
	pub async fn deregister(&self, user: &UserId, conn_id: ConnId) -> PresenceTransition {
		let mut table = self.inner.lock().await;
		let Some(conns) = table.get_mut(user) else {
			return PresenceTransition::Unchanged;
		};

		if !conns.remove(&conn_id) {
			return PresenceTransition::Unchanged;
		}

		if conns.is_empty() {
			table.remove(user);
			PresenceTransition::WentOffline
		} else {
			PresenceTransition::Unchanged
		}
	}

	pub async fn is_online(&self, user: &UserId) -> bool {
		let table = self.inner.lock().await;
		table.get(user).map(|c| !c.is_empty()).unwrap_or(false)
	}

	/// Number of active connections for a user.
	pub async fn connection_count(&self, user: &UserId) -> usize {
		let table = self.inner.lock().await;
		table.get(user).map(|c| c.len()).unwrap_or(0)
	}

	/// Number of distinct online users.
	pub async fn online_user_count(&self) -> usize {
		let table = self.inner.lock().await;
		table.len()
	}
}
