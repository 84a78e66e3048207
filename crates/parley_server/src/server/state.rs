#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::server::broadcast::Broadcaster;
use crate::server::directory::Directory;
use crate::server::health::HealthState;
use crate::server::presence::PresenceTracker;
use crate::server::room_hub::{ConnId, RoomHub};
use crate::server::router::EventRouter;
use crate::util::secret::SecretString;

/// Shared server state, built once at startup and injected into every
/// handler. No component reaches for ambient globals.
pub struct AppState {
	pub hub: RoomHub,
	pub presence: PresenceTracker,
	pub directory: Arc<dyn Directory>,
	pub router: EventRouter,
	/// Handed to the external HTTP write path at startup.
	pub broadcaster: Broadcaster,
	pub health: HealthState,
	pub auth_hmac_secret: SecretString,

	next_conn_id: AtomicU64,
}

impl AppState {
	pub fn new(
		hub: RoomHub,
		presence: PresenceTracker,
		directory: Arc<dyn Directory>,
		router: EventRouter,
		broadcaster: Broadcaster,
		health: HealthState,
		auth_hmac_secret: SecretString,
	) -> Self {
		Self {
			hub,
			presence,
			directory,
			router,
			broadcaster,
			health,
			auth_hmac_secret,
			next_conn_id: AtomicU64::new(1),
		}
	}

	/// Allocate a transport connection id, unique for the process lifetime.
	pub fn next_conn_id(&self) -> ConnId {
		self.next_conn_id.fetch_add(1, Ordering::Relaxed)
	}
}
