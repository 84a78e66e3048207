#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use parley_domain::{ChannelId, ConversationId, ConversationRef, MessageId, RoomKey, UserId};
use parley_protocol::{ChannelRequest, ClientEvent, ConversationTarget, DmRequest, MessageReadRequest, ServerEvent};
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::server::broadcast::Broadcaster;
use crate::server::connection::{handle_text_frame, publish_presence};
use crate::server::directory::Directory;
use crate::server::health::HealthState;
use crate::server::presence::PresenceTracker;
use crate::server::room_hub::{RoomHub, RoomHubConfig};
use crate::server::router::EventRouter;
use crate::server::state::AppState;
use crate::util::secret::SecretString;

/// In-memory membership directory for router tests.
#[derive(Default)]
struct FakeDirectory {
	channel_members: HashSet<(String, String)>,
	conversation_members: HashSet<(String, String)>,
	fail_lookups: bool,
	fail_presence_writes: bool,
}

impl FakeDirectory {
	fn new() -> Self {
		Self::default()
	}

	fn failing() -> Self {
		Self {
			fail_lookups: true,
			..Self::default()
		}
	}

	fn failing_presence_writes() -> Self {
		Self {
			fail_presence_writes: true,
			..Self::default()
		}
	}

	fn with_channel_member(mut self, user: &str, channel: &str) -> Self {
		self.channel_members.insert((user.to_string(), channel.to_string()));
		self
	}

	fn with_conversation_member(mut self, user: &str, conversation: &str) -> Self {
		self.conversation_members.insert((user.to_string(), conversation.to_string()));
		self
	}
}

#[async_trait]
impl Directory for FakeDirectory {
	async fn is_channel_member(&self, user: &UserId, channel: &ChannelId) -> anyhow::Result<bool> {
		if self.fail_lookups {
			bail!("directory unavailable");
		}
		Ok(self
			.channel_members
			.contains(&(user.as_str().to_string(), channel.as_str().to_string())))
	}

	async fn is_conversation_member(&self, user: &UserId, conversation: &ConversationId) -> anyhow::Result<bool> {
		if self.fail_lookups {
			bail!("directory unavailable");
		}
		Ok(self
			.conversation_members
			.contains(&(user.as_str().to_string(), conversation.as_str().to_string())))
	}

	async fn update_user_presence(&self, _user: &UserId, _is_online: bool, _last_seen_ms: i64) -> anyhow::Result<()> {
		if self.fail_presence_writes {
			bail!("presence write failed");
		}
		Ok(())
	}
}

fn setup(directory: FakeDirectory) -> (EventRouter, RoomHub) {
	let hub = RoomHub::new(RoomHubConfig {
		subscriber_queue_capacity: 16,
		debug_logs: false,
	});
	let router = EventRouter::new(hub.clone(), Arc::new(directory), false);
	(router, hub)
}

fn app_state(directory: FakeDirectory) -> (AppState, RoomHub) {
	let hub = RoomHub::new(RoomHubConfig {
		subscriber_queue_capacity: 16,
		debug_logs: false,
	});
	let directory: Arc<dyn Directory> = Arc::new(directory);
	let router = EventRouter::new(hub.clone(), Arc::clone(&directory), false);
	let state = AppState::new(
		hub.clone(),
		PresenceTracker::new(),
		directory,
		router,
		Broadcaster::new(hub.clone()),
		HealthState::new(),
		SecretString::new("test-secret"),
	);
	(state, hub)
}

fn user(id: &str) -> UserId {
	UserId::new(id).expect("valid UserId")
}

fn join_channel(id: &str) -> ClientEvent {
	ClientEvent::JoinChannel(ChannelRequest {
		channel_id: ChannelId::new(id).expect("valid ChannelId"),
	})
}

fn join_dm(id: &str) -> ClientEvent {
	ClientEvent::JoinDm(DmRequest {
		conversation_id: ConversationId::new(id).expect("valid ConversationId"),
	})
}

fn channel_room(id: &str) -> RoomKey {
	RoomKey::Channel(ChannelId::new(id).expect("valid ChannelId"))
}

fn dm_room(id: &str) -> RoomKey {
	RoomKey::Dm(ConversationId::new(id).expect("valid ConversationId"))
}

async fn expect_event(rx: &mut mpsc::Receiver<ServerEvent>) -> ServerEvent {
	timeout(Duration::from_millis(250), rx.recv())
		.await
		.expect("expected to receive within timeout")
		.expect("channel open")
}

async fn expect_no_event(rx: &mut mpsc::Receiver<ServerEvent>) {
	let got = timeout(Duration::from_millis(50), rx.recv()).await;
	assert!(got.is_err(), "unexpectedly received an event: {got:?}");
}

#[tokio::test]
async fn member_joins_succeed_and_nonmember_joins_get_a_scoped_error() {
	let (router, hub) = setup(FakeDirectory::new().with_channel_member("u1", "c1"));
	let alice = user("u1");
	let mut rx = hub.register_conn(1, alice.clone()).await;

	router.handle_event(1, &alice, join_channel("c1")).await;
	expect_no_event(&mut rx).await;
	assert!(hub.is_member(1, &channel_room("c1")).await);

	router.handle_event(1, &alice, join_channel("c2")).await;
	match expect_event(&mut rx).await {
		ServerEvent::Error(e) => assert!(e.message.contains("c2"), "error should name the channel: {}", e.message),
		other => panic!("expected Error, got: {other:?}"),
	}
	assert!(!hub.is_member(1, &channel_room("c2")).await);

	// The refusal did not close the session: other rooms still work.
	router.handle_event(1, &alice, join_channel("c1")).await;
	expect_no_event(&mut rx).await;
}

#[tokio::test]
async fn self_space_join_requires_the_embedded_identity() {
	let (router, hub) = setup(FakeDirectory::new());
	let alice = user("u1");
	let bob = user("u2");

	let mut rx_alice = hub.register_conn(1, alice.clone()).await;
	let mut rx_bob = hub.register_conn(2, bob.clone()).await;

	// Authorized regardless of membership tables.
	router.handle_event(1, &alice, join_dm("self-u1")).await;
	expect_no_event(&mut rx_alice).await;
	assert!(hub.is_member(1, &dm_room("self-u1")).await);

	router.handle_event(2, &bob, join_dm("self-u1")).await;
	match expect_event(&mut rx_bob).await {
		ServerEvent::Error(e) => assert!(e.message.contains("self-u1")),
		other => panic!("expected Error, got: {other:?}"),
	}
	assert!(!hub.is_member(2, &dm_room("self-u1")).await);
}

#[tokio::test]
async fn dm_join_checks_conversation_membership() {
	let (router, hub) = setup(FakeDirectory::new().with_conversation_member("u1", "d1"));
	let alice = user("u1");
	let mut rx = hub.register_conn(1, alice.clone()).await;

	router.handle_event(1, &alice, join_dm("d1")).await;
	expect_no_event(&mut rx).await;
	assert!(hub.is_member(1, &dm_room("d1")).await);

	router.handle_event(1, &alice, join_dm("d2")).await;
	match expect_event(&mut rx).await {
		ServerEvent::Error(e) => assert!(e.message.contains("d2")),
		other => panic!("expected Error, got: {other:?}"),
	}
}

#[tokio::test]
async fn leave_is_unconditional_and_silent() {
	let (router, hub) = setup(FakeDirectory::new().with_channel_member("u1", "c1"));
	let alice = user("u1");
	let mut rx = hub.register_conn(1, alice.clone()).await;

	router.handle_event(1, &alice, join_channel("c1")).await;
	router
		.handle_event(
			1,
			&alice,
			ClientEvent::LeaveChannel(ChannelRequest {
				channel_id: ChannelId::new("c1").unwrap(),
			}),
		)
		.await;
	assert!(!hub.is_member(1, &channel_room("c1")).await);

	// Leaving a room never joined: no error, no event.
	router
		.handle_event(
			1,
			&alice,
			ClientEvent::LeaveChannel(ChannelRequest {
				channel_id: ChannelId::new("c9").unwrap(),
			}),
		)
		.await;
	expect_no_event(&mut rx).await;
}

#[tokio::test]
async fn typing_is_relayed_to_peers_but_not_the_sender() {
	let (router, hub) = setup(
		FakeDirectory::new()
			.with_channel_member("u1", "c1")
			.with_channel_member("u2", "c1"),
	);
	let alice = user("u1");
	let bob = user("u2");

	let mut rx_alice = hub.register_conn(1, alice.clone()).await;
	let mut rx_bob = hub.register_conn(2, bob.clone()).await;

	router.handle_event(1, &alice, join_channel("c1")).await;
	router.handle_event(2, &bob, join_channel("c1")).await;

	let target = ConversationTarget::channel(ChannelId::new("c1").unwrap());
	router.handle_event(1, &alice, ClientEvent::TypingStart(target.clone())).await;

	match expect_event(&mut rx_bob).await {
		ServerEvent::UserTyping(ev) => {
			assert_eq!(ev.user_id, alice);
			assert!(ev.is_typing);
			assert_eq!(ev.target, target);
		}
		other => panic!("expected UserTyping, got: {other:?}"),
	}
	expect_no_event(&mut rx_alice).await;

	router.handle_event(1, &alice, ClientEvent::TypingStop(target)).await;
	match expect_event(&mut rx_bob).await {
		ServerEvent::UserTyping(ev) => assert!(!ev.is_typing),
		other => panic!("expected UserTyping, got: {other:?}"),
	}
}

#[tokio::test]
async fn typing_without_a_target_reports_an_error() {
	let (router, hub) = setup(FakeDirectory::new());
	let alice = user("u1");
	let mut rx = hub.register_conn(1, alice.clone()).await;

	router
		.handle_event(1, &alice, ClientEvent::TypingStart(ConversationTarget::default()))
		.await;

	match expect_event(&mut rx).await {
		ServerEvent::Error(_) => {}
		other => panic!("expected Error, got: {other:?}"),
	}
}

#[tokio::test]
async fn read_receipts_are_relayed_to_peers() {
	let (router, hub) = setup(
		FakeDirectory::new()
			.with_channel_member("u1", "c1")
			.with_channel_member("u2", "c1"),
	);
	let alice = user("u1");
	let bob = user("u2");

	let mut rx_alice = hub.register_conn(1, alice.clone()).await;
	let mut rx_bob = hub.register_conn(2, bob.clone()).await;

	router.handle_event(1, &alice, join_channel("c1")).await;
	router.handle_event(2, &bob, join_channel("c1")).await;

	let read = ClientEvent::MessageRead(MessageReadRequest {
		message_ids: vec![MessageId::new("m1").unwrap(), MessageId::new("m2").unwrap()],
		target: ConversationTarget::channel(ChannelId::new("c1").unwrap()),
	});
	router.handle_event(2, &bob, read).await;

	match expect_event(&mut rx_alice).await {
		ServerEvent::MessageReadByUser(ev) => {
			assert_eq!(ev.user_id, bob);
			assert_eq!(ev.message_ids.len(), 2);
		}
		other => panic!("expected MessageReadByUser, got: {other:?}"),
	}
	expect_no_event(&mut rx_bob).await;
}

#[tokio::test]
async fn online_users_snapshot_goes_to_the_requester_only() {
	let (router, hub) = setup(FakeDirectory::new().with_channel_member("u1", "c1"));
	let alice = user("u1");
	let bob = user("u2");

	let mut rx_alice = hub.register_conn(1, alice.clone()).await;
	let mut rx_bob = hub.register_conn(2, bob.clone()).await;

	router.handle_event(1, &alice, join_channel("c1")).await;
	router.handle_event(2, &bob, ClientEvent::GetOnlineUsers).await;

	match expect_event(&mut rx_bob).await {
		ServerEvent::OnlineUsers(users) => {
			assert_eq!(users.len(), 2);
			let alice_entry = users.iter().find(|u| u.user_id == alice).expect("alice present");
			assert_eq!(alice_entry.connection_count, 1);
			assert!(alice_entry.rooms.contains(&"channel:c1".to_string()));
			assert!(alice_entry.rooms.contains(&"user:u1".to_string()));
		}
		other => panic!("expected OnlineUsers, got: {other:?}"),
	}
	expect_no_event(&mut rx_alice).await;
}

#[tokio::test]
async fn directory_failures_are_reported_and_not_fatal() {
	let (router, hub) = setup(FakeDirectory::failing());
	let alice = user("u1");
	let mut rx = hub.register_conn(1, alice.clone()).await;

	router.handle_event(1, &alice, join_channel("c1")).await;
	match expect_event(&mut rx).await {
		ServerEvent::Error(_) => {}
		other => panic!("expected Error, got: {other:?}"),
	}
	assert!(!hub.is_member(1, &channel_room("c1")).await);

	// The session keeps working for operations that need no lookup.
	router.handle_event(1, &alice, ClientEvent::GetOnlineUsers).await;
	match expect_event(&mut rx).await {
		ServerEvent::OnlineUsers(users) => assert_eq!(users.len(), 1),
		other => panic!("expected OnlineUsers, got: {other:?}"),
	}
}

#[tokio::test]
async fn unread_counts_reach_every_device_of_the_recipient_only() {
	let (_router, hub) = setup(FakeDirectory::new());
	let alice = user("u1");
	let bob = user("u2");

	let mut rx_alice = hub.register_conn(1, alice.clone()).await;
	let mut rx_bob_desktop = hub.register_conn(2, bob.clone()).await;
	let mut rx_bob_phone = hub.register_conn(3, bob.clone()).await;

	let broadcaster = Broadcaster::new(hub.clone());
	let conversation = ConversationRef::Channel(ChannelId::new("c1").unwrap());
	broadcaster.broadcast_unread_count_update(&bob, &conversation, 3).await;

	for rx in [&mut rx_bob_desktop, &mut rx_bob_phone] {
		match expect_event(rx).await {
			ServerEvent::UnreadCountUpdate(ev) => {
				assert_eq!(ev.unread_count, 3);
				assert_eq!(ev.target.channel_id.as_ref().map(|c| c.as_str()), Some("c1"));
			}
			other => panic!("expected UnreadCountUpdate, got: {other:?}"),
		}
	}
	expect_no_event(&mut rx_alice).await;
}

#[tokio::test]
async fn persisted_changes_fan_out_to_the_conversation_room() {
	let (router, hub) = setup(
		FakeDirectory::new()
			.with_channel_member("u1", "c1")
			.with_channel_member("u2", "c1"),
	);
	let alice = user("u1");
	let bob = user("u2");
	let outsider = user("u3");

	let mut rx_alice = hub.register_conn(1, alice.clone()).await;
	let mut rx_bob = hub.register_conn(2, bob.clone()).await;
	let mut rx_outsider = hub.register_conn(3, outsider.clone()).await;

	router.handle_event(1, &alice, join_channel("c1")).await;
	router.handle_event(2, &bob, join_channel("c1")).await;

	let broadcaster = Broadcaster::new(hub.clone());
	let conversation = ConversationRef::Channel(ChannelId::new("c1").unwrap());
	let message = serde_json::json!({ "id": "m1", "text": "hello" });
	broadcaster.broadcast_new_message(message.clone(), &conversation).await;

	for rx in [&mut rx_alice, &mut rx_bob] {
		match expect_event(rx).await {
			ServerEvent::NewMessage(env) => assert_eq!(env.message, message),
			other => panic!("expected NewMessage, got: {other:?}"),
		}
	}
	expect_no_event(&mut rx_outsider).await;

	broadcaster
		.broadcast_message_delete(MessageId::new("m1").unwrap(), alice.clone(), &conversation, 1_700_000_000_000)
		.await;

	match expect_event(&mut rx_bob).await {
		ServerEvent::MessageDeleted(ev) => {
			assert_eq!(ev.message_id.as_str(), "m1");
			assert_eq!(ev.user_id, alice);
			assert_eq!(ev.deleted_at, 1_700_000_000_000);
		}
		other => panic!("expected MessageDeleted, got: {other:?}"),
	}
}

#[tokio::test]
async fn presence_broadcast_goes_out_even_when_the_write_fails() {
	let (state, hub) = app_state(FakeDirectory::failing_presence_writes());
	let alice = user("u1");
	let bob = user("u2");

	let mut rx_alice = hub.register_conn(1, alice.clone()).await;
	let mut rx_bob = hub.register_conn(2, bob.clone()).await;

	publish_presence(&state, &alice, true).await;

	// Presence is advisory: the failed write is logged and every live
	// connection still sees the edge.
	for rx in [&mut rx_alice, &mut rx_bob] {
		match expect_event(rx).await {
			ServerEvent::UserPresenceUpdate(ev) => {
				assert_eq!(ev.user_id, alice);
				assert!(ev.is_online);
				assert!(ev.last_seen_at > 0);
			}
			other => panic!("expected UserPresenceUpdate, got: {other:?}"),
		}
	}

	publish_presence(&state, &alice, false).await;
	match expect_event(&mut rx_bob).await {
		ServerEvent::UserPresenceUpdate(ev) => assert!(!ev.is_online),
		other => panic!("expected UserPresenceUpdate, got: {other:?}"),
	}
}

#[tokio::test]
async fn malformed_frames_get_a_scoped_error_and_the_session_continues() {
	let (router, hub) = setup(FakeDirectory::new().with_channel_member("u1", "c1"));
	let alice = user("u1");
	let bob = user("u2");

	let mut rx_alice = hub.register_conn(1, alice.clone()).await;
	let mut rx_bob = hub.register_conn(2, bob.clone()).await;

	handle_text_frame(&router, 1, &alice, "{not even json").await;

	// Exactly one error event, to the sender only.
	match expect_event(&mut rx_alice).await {
		ServerEvent::Error(_) => {}
		other => panic!("expected Error, got: {other:?}"),
	}
	expect_no_event(&mut rx_alice).await;
	expect_no_event(&mut rx_bob).await;

	// The session keeps accepting well-formed frames afterwards.
	handle_text_frame(&router, 1, &alice, r#"{"event":"join-channel","data":{"channelId":"c1"}}"#).await;
	expect_no_event(&mut rx_alice).await;
	assert!(hub.is_member(1, &channel_room("c1")).await);
}
