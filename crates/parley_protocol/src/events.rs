#![forbid(unsafe_code)]

use parley_domain::{ChannelId, ConversationId, ConversationRef, MessageId, UserId};
use serde::{Deserialize, Serialize};

/// Inbound control messages (client → server), one variant per event name.
///
/// Wire form is adjacently tagged JSON:
/// `{"event":"join-channel","data":{"channelId":"c1"}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
	JoinChannel(ChannelRequest),
	LeaveChannel(ChannelRequest),
	JoinDm(DmRequest),
	LeaveDm(DmRequest),
	TypingStart(ConversationTarget),
	TypingStop(ConversationTarget),
	MessageRead(MessageReadRequest),
	GetOnlineUsers,
}

/// Outbound events (server → client), one variant per event name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
	Error(ErrorEvent),
	UserTyping(UserTypingEvent),
	MessageReadByUser(MessageReadByUserEvent),
	OnlineUsers(Vec<OnlineUser>),
	UserPresenceUpdate(UserPresenceUpdateEvent),
	NewMessage(MessageEnvelope),
	MessageUpdated(MessageEnvelope),
	MessageDeleted(MessageDeletedEvent),
	ReactionUpdated(ReactionUpdatedEvent),
	ThreadReplyCreated(MessageEnvelope),
	MessagesCleared(MessagesClearedEvent),
	UnreadCountUpdate(UnreadCountUpdateEvent),
	ActiveConversationsUpdate(ActiveConversationsEvent),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelRequest {
	pub channel_id: ChannelId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DmRequest {
	pub conversation_id: ConversationId,
}

/// Names the conversation an event applies to; exactly one side is
/// expected to be set. When both are present the channel wins.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationTarget {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub channel_id: Option<ChannelId>,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub dm_conversation_id: Option<ConversationId>,
}

impl ConversationTarget {
	pub fn channel(id: ChannelId) -> Self {
		Self {
			channel_id: Some(id),
			dm_conversation_id: None,
		}
	}

	pub fn dm(id: ConversationId) -> Self {
		Self {
			channel_id: None,
			dm_conversation_id: Some(id),
		}
	}

	pub fn from_ref(conversation: &ConversationRef) -> Self {
		match conversation {
			ConversationRef::Channel(id) => Self::channel(id.clone()),
			ConversationRef::Dm(id) => Self::dm(id.clone()),
		}
	}

	/// Resolve to a conversation reference, if either side is set.
	pub fn conversation(&self) -> Option<ConversationRef> {
		if let Some(id) = &self.channel_id {
			return Some(ConversationRef::Channel(id.clone()));
		}
		self.dm_conversation_id.clone().map(ConversationRef::Dm)
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageReadRequest {
	pub message_ids: Vec<MessageId>,

	#[serde(flatten)]
	pub target: ConversationTarget,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEvent {
	pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserTypingEvent {
	pub user_id: UserId,

	#[serde(flatten)]
	pub target: ConversationTarget,

	pub is_typing: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageReadByUserEvent {
	pub user_id: UserId,
	pub message_ids: Vec<MessageId>,

	#[serde(flatten)]
	pub target: ConversationTarget,
}

/// Diagnostics snapshot entry returned by `get-online-users`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnlineUser {
	pub user_id: UserId,
	pub connection_count: u32,
	pub rooms: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPresenceUpdateEvent {
	pub user_id: UserId,
	pub is_online: bool,
	/// Unix milliseconds.
	pub last_seen_at: i64,
}

/// Carrier for a persisted message entity owned by the external layer.
///
/// The message body is opaque to this subsystem and travels as raw JSON;
/// the routing fields are typed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEnvelope {
	pub message: serde_json::Value,

	#[serde(flatten)]
	pub target: ConversationTarget,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDeletedEvent {
	pub message_id: MessageId,
	/// Owner of the deleted message.
	pub user_id: UserId,

	#[serde(flatten)]
	pub target: ConversationTarget,

	/// Unix milliseconds.
	pub deleted_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionUpdatedEvent {
	pub message_id: MessageId,
	/// Full reaction state for the message, owned by the external layer.
	pub reactions: serde_json::Value,

	#[serde(flatten)]
	pub target: ConversationTarget,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagesClearedEvent {
	#[serde(flatten)]
	pub target: ConversationTarget,

	pub cleared_by: UserId,
	/// Unix milliseconds.
	pub cleared_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnreadCountUpdateEvent {
	#[serde(flatten)]
	pub target: ConversationTarget,

	pub unread_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveConversationsEvent {
	/// Per-recipient conversation list, owned by the external layer.
	pub conversations: serde_json::Value,
}
