#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("unknown room kind: {0}")]
	UnknownKind(String),
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

/// Opaque user identity, assigned by the external persistence layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
	/// Create a non-empty `UserId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}
	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for UserId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for UserId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		UserId::new(s.to_string())
	}
}

/// Opaque channel identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
	/// Create a non-empty `ChannelId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for ChannelId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for ChannelId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		ChannelId::new(s.to_string())
	}
}

/// Opaque DM conversation identifier.
///
/// A conversation id of the form `self-<userId>` is a self-space: a
/// DM-shaped conversation a user has with themself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
	/// Prefix that marks a self-space conversation id.
	pub const SELF_SPACE_PREFIX: &'static str = "self-";

	/// Create a non-empty `ConversationId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}

	/// If this id is a self-space id, return the embedded owner identity.
	pub fn self_space_owner(&self) -> Option<UserId> {
		let rest = self.0.strip_prefix(Self::SELF_SPACE_PREFIX)?;
		UserId::new(rest).ok()
	}
}

impl fmt::Display for ConversationId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for ConversationId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		ConversationId::new(s.to_string())
	}
}

/// Opaque message identifier, assigned by the external persistence layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
	/// Create a non-empty `MessageId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for MessageId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for MessageId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		MessageId::new(s.to_string())
	}
}

/// Reference to the conversation a persisted change belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConversationRef {
	Channel(ChannelId),
	Dm(ConversationId),
}

impl ConversationRef {
	/// The broadcast room this conversation maps to.
	pub fn room(&self) -> RoomKey {
		match self {
			ConversationRef::Channel(id) => RoomKey::Channel(id.clone()),
			ConversationRef::Dm(id) => RoomKey::Dm(id.clone()),
		}
	}
}

/// A named broadcast group of live connections.
///
/// Rooms have no storage of their own; membership is derived from which
/// connections have joined them. `User` rooms are joined implicitly by
/// every connection belonging to that user.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RoomKey {
	Channel(ChannelId),
	Dm(ConversationId),
	User(UserId),
}

impl RoomKey {
	/// Parse a `channel:<id>`, `dm:<id>` or `user:<id>` room name.
	pub fn parse(s: &str) -> Result<Self, ParseIdError> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		let (kind, id) = s
			.split_once(':')
			.ok_or_else(|| ParseIdError::InvalidFormat("expected kind:id".into()))?;

		match kind {
			"channel" => Ok(RoomKey::Channel(ChannelId::new(id)?)),
			"dm" => Ok(RoomKey::Dm(ConversationId::new(id)?)),
			"user" => Ok(RoomKey::User(UserId::new(id)?)),
			other => Err(ParseIdError::UnknownKind(other.to_string())),
		}
	}
}

impl fmt::Display for RoomKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			RoomKey::Channel(id) => write!(f, "channel:{id}"),
			RoomKey::Dm(id) => write!(f, "dm:{id}"),
			RoomKey::User(id) => write!(f, "user:{id}"),
		}
	}
}

impl FromStr for RoomKey {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		RoomKey::parse(s)
	}
}
