#![forbid(unsafe_code)]

use parley_domain::{ConversationRef, MessageId, UserId};
use parley_protocol::{
	ActiveConversationsEvent, ConversationTarget, MessageDeletedEvent, MessageEnvelope, MessagesClearedEvent,
	ReactionUpdatedEvent, ServerEvent, UnreadCountUpdateEvent,
};
use tracing::debug;

use crate::server::room_hub::RoomHub;

/// Push-only surface the external HTTP write path uses to notify live
/// connections of persisted changes it already committed.
///
/// No business logic and no persistence happen here; delivery is
/// best-effort and independent of the write path's success. The handle
/// is obtained once at startup and passed to the write handlers
/// explicitly rather than through ambient global state.
#[derive(Debug, Clone)]
pub struct Broadcaster {
	hub: RoomHub,
}

impl Broadcaster {
	pub fn new(hub: RoomHub) -> Self {
		Self { hub }
	}

	/// A newly persisted message, pushed to its conversation room.
	pub async fn broadcast_new_message(&self, message: serde_json::Value, conversation: &ConversationRef) {
		self.to_conversation(conversation, "new_message", |target| {
			ServerEvent::NewMessage(MessageEnvelope { message, target })
		})
		.await;
	}

	/// An edited message, pushed to its conversation room.
	pub async fn broadcast_message_update(&self, message: serde_json::Value, conversation: &ConversationRef) {
		self.to_conversation(conversation, "message_update", |target| {
			ServerEvent::MessageUpdated(MessageEnvelope { message, target })
		})
		.await;
	}

	/// A deleted message. The payload carries enough for clients to drop
	/// local state without a re-fetch.
	pub async fn broadcast_message_delete(
		&self,
		message_id: MessageId,
		owner: UserId,
		conversation: &ConversationRef,
		deleted_at_ms: i64,
	) {
		self.to_conversation(conversation, "message_delete", |target| {
			ServerEvent::MessageDeleted(MessageDeletedEvent {
				message_id,
				user_id: owner,
				target,
				deleted_at: deleted_at_ms,
			})
		})
		.await;
	}

	/// Reaction state change on a message, pushed to its conversation room.
	pub async fn broadcast_reaction_update(
		&self,
		message_id: MessageId,
		reactions: serde_json::Value,
		conversation: &ConversationRef,
	) {
		self.to_conversation(conversation, "reaction_update", |target| {
			ServerEvent::ReactionUpdated(ReactionUpdatedEvent {
				message_id,
				reactions,
				target,
			})
		})
		.await;
	}

	/// A new thread reply, pushed to the parent conversation room.
	pub async fn broadcast_thread_reply_created(&self, message: serde_json::Value, conversation: &ConversationRef) {
		self.to_conversation(conversation, "thread_reply_created", |target| {
			ServerEvent::ThreadReplyCreated(MessageEnvelope { message, target })
		})
		.await;
	}

	/// All messages of a conversation cleared.
	pub async fn broadcast_messages_cleared(&self, conversation: &ConversationRef, cleared_by: UserId, cleared_at_ms: i64) {
		self.to_conversation(conversation, "messages_cleared", |target| {
			ServerEvent::MessagesCleared(MessagesClearedEvent {
				target,
				cleared_by,
				cleared_at: cleared_at_ms,
			})
		})
		.await;
	}

	/// Per-recipient unread counter, pushed to the user's private room
	/// only, never to the shared conversation room.
	pub async fn broadcast_unread_count_update(&self, user: &UserId, conversation: &ConversationRef, unread_count: u64) {
		metrics::counter!("parley_server_broadcasts_total", "kind" => "unread_count_update").increment(1);
		debug!(user = %user, "broadcast: unread-count-update");

		let event = ServerEvent::UnreadCountUpdate(UnreadCountUpdateEvent {
			target: ConversationTarget::from_ref(conversation),
			unread_count,
		});
		self.hub.emit_to_user(user, event).await;
	}

	/// Refreshed conversation list for one user, pushed to their private
	/// room across all devices.
	pub async fn broadcast_active_conversations_update(&self, user: &UserId, conversations: serde_json::Value) {
		metrics::counter!("parley_server_broadcasts_total", "kind" => "active_conversations_update").increment(1);
		debug!(user = %user, "broadcast: active-conversations-update");

		let event = ServerEvent::ActiveConversationsUpdate(ActiveConversationsEvent { conversations });
		self.hub.emit_to_user(user, event).await;
	}

	async fn to_conversation(
		&self,
		conversation: &ConversationRef,
		kind: &'static str,
		build: impl FnOnce(ConversationTarget) -> ServerEvent,
	) {
		metrics::counter!("parley_server_broadcasts_total", "kind" => kind).increment(1);
		let room = conversation.room();
		debug!(room = %room, kind, "broadcast to conversation room");

		let event = build(ConversationTarget::from_ref(conversation));
		self.hub.emit_to_room(&room, event).await;
	}
}
