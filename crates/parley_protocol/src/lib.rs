#![forbid(unsafe_code)]

pub mod events;

pub use events::{
	ActiveConversationsEvent, ChannelRequest, ClientEvent, ConversationTarget, DmRequest, ErrorEvent,
	MessageDeletedEvent, MessageEnvelope, MessageReadByUserEvent, MessageReadRequest, MessagesClearedEvent, OnlineUser,
	ReactionUpdatedEvent, ServerEvent, UnreadCountUpdateEvent, UserPresenceUpdateEvent, UserTypingEvent,
};
