#![forbid(unsafe_code)]

use std::sync::Arc;

use parley_domain::{RoomKey, UserId};
use parley_protocol::{
	ChannelRequest, ClientEvent, ConversationTarget, DmRequest, ErrorEvent, MessageReadByUserEvent, MessageReadRequest,
	ServerEvent, UserTypingEvent,
};
use tracing::{debug, warn};

use crate::server::directory::Directory;
use crate::server::room_hub::{ConnId, RoomHub};

/// Dispatches inbound control messages for one connection against the
/// membership directory and the room hub.
///
/// Every handler is fault-isolated: an authorization refusal or a
/// directory lookup failure becomes a scoped `error` event back to the
/// originating connection and never tears down the session.
#[derive(Clone)]
pub struct EventRouter {
	hub: RoomHub,
	directory: Arc<dyn Directory>,
	debug_logs: bool,
}

impl EventRouter {
	pub fn new(hub: RoomHub, directory: Arc<dyn Directory>, debug_logs: bool) -> Self {
		Self {
			hub,
			directory,
			debug_logs,
		}
	}

	pub fn hub(&self) -> &RoomHub {
		&self.hub
	}

	/// Process one control message. Never fails; failures are reported to
	/// the sender only.
	pub async fn handle_event(&self, conn_id: ConnId, user: &UserId, event: ClientEvent) {
		if self.debug_logs {
			debug!(conn_id, user = %user, event = event_name(&event), "routing control message");
		}
		metrics::counter!("parley_server_control_events_total", "event" => event_name(&event)).increment(1);

		let name = event_name(&event);
		let result = match event {
			ClientEvent::JoinChannel(req) => self.join_channel(conn_id, user, req).await,
			ClientEvent::LeaveChannel(req) => {
				self.hub.leave_room(conn_id, &RoomKey::Channel(req.channel_id)).await;
				Ok(())
			}
			ClientEvent::JoinDm(req) => self.join_dm(conn_id, user, req).await,
			ClientEvent::LeaveDm(req) => {
				self.hub.leave_room(conn_id, &RoomKey::Dm(req.conversation_id)).await;
				Ok(())
			}
			ClientEvent::TypingStart(target) => self.relay_typing(conn_id, user, target, true).await,
			ClientEvent::TypingStop(target) => self.relay_typing(conn_id, user, target, false).await,
			ClientEvent::MessageRead(req) => self.relay_message_read(conn_id, user, req).await,
			ClientEvent::GetOnlineUsers => {
				let snapshot = self.hub.online_users_snapshot().await;
				self.hub.emit_to_conn(conn_id, ServerEvent::OnlineUsers(snapshot)).await;
				Ok(())
			}
		};

		if let Err(e) = result {
			warn!(conn_id, user = %user, event = name, error = %e, "control message handler failed");
			metrics::counter!("parley_server_control_event_errors_total").increment(1);
			self.emit_error(conn_id, format!("failed to process {name}")).await;
		}
	}

	async fn join_channel(&self, conn_id: ConnId, user: &UserId, req: ChannelRequest) -> anyhow::Result<()> {
		let channel = req.channel_id;

		// Re-checked on every request: membership can change while the
		// connection stays open.
		if !self.directory.is_channel_member(user, &channel).await? {
			metrics::counter!("parley_server_joins_denied_total").increment(1);
			self.emit_error(conn_id, format!("not authorized to join channel {channel}")).await;
			return Ok(());
		}

		self.hub.join_room(conn_id, RoomKey::Channel(channel)).await;
		Ok(())
	}

	async fn join_dm(&self, conn_id: ConnId, user: &UserId, req: DmRequest) -> anyhow::Result<()> {
		let conversation = req.conversation_id;

		// A self-space id authorizes itself: only its embedded owner may
		// join, regardless of what the membership tables say.
		let authorized = match conversation.self_space_owner() {
			Some(owner) => owner == *user,
			None => self.directory.is_conversation_member(user, &conversation).await?,
		};

		if !authorized {
			metrics::counter!("parley_server_joins_denied_total").increment(1);
			self.emit_error(conn_id, format!("not authorized to join conversation {conversation}"))
				.await;
			return Ok(());
		}

		self.hub.join_room(conn_id, RoomKey::Dm(conversation)).await;
		Ok(())
	}

	async fn relay_typing(
		&self,
		conn_id: ConnId,
		user: &UserId,
		target: ConversationTarget,
		is_typing: bool,
	) -> anyhow::Result<()> {
		let Some(conversation) = target.conversation() else {
			self.emit_error(conn_id, "typing event names no conversation".to_string()).await;
			return Ok(());
		};

		let event = ServerEvent::UserTyping(UserTypingEvent {
			user_id: user.clone(),
			target: ConversationTarget::from_ref(&conversation),
			is_typing,
		});

		// Instantaneous relay to everyone else in the room; no typing
		// state is held server-side and no TTL is enforced here.
		self.hub.emit_to_room_except(&conversation.room(), conn_id, event).await;
		Ok(())
	}

	async fn relay_message_read(&self, conn_id: ConnId, user: &UserId, req: MessageReadRequest) -> anyhow::Result<()> {
		let Some(conversation) = req.target.conversation() else {
			self.emit_error(conn_id, "read receipt names no conversation".to_string()).await;
			return Ok(());
		};

		// Purely informational relay; the durable read position is
		// written by the external HTTP read-receipt endpoint.
		let event = ServerEvent::MessageReadByUser(MessageReadByUserEvent {
			user_id: user.clone(),
			message_ids: req.message_ids,
			target: ConversationTarget::from_ref(&conversation),
		});

		self.hub.emit_to_room_except(&conversation.room(), conn_id, event).await;
		Ok(())
	}

	pub(crate) async fn emit_error(&self, conn_id: ConnId, message: String) {
		self.hub.emit_to_conn(conn_id, ServerEvent::Error(ErrorEvent { message })).await;
	}
}

fn event_name(event: &ClientEvent) -> &'static str {
	match event {
		ClientEvent::JoinChannel(_) => "join-channel",
		ClientEvent::LeaveChannel(_) => "leave-channel",
		ClientEvent::JoinDm(_) => "join-dm",
		ClientEvent::LeaveDm(_) => "leave-dm",
		ClientEvent::TypingStart(_) => "typing-start",
		ClientEvent::TypingStop(_) => "typing-stop",
		ClientEvent::MessageRead(_) => "message-read",
		ClientEvent::GetOnlineUsers => "get-online-users",
	}
}
