#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Content a tombstoned message is replaced with.
pub const DELETED_MARKER: &str = "[deleted]";

/// Sender id used for synthetic system messages.
pub const SYSTEM_SENDER: &str = "system";

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
}

/// Opaque, externally issued user identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
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

	/// Sender id carried by synthetic system messages.
	pub fn system() -> Self {
		Self(SYSTEM_SENDER.to_string())
	}

	pub fn is_system(&self) -> bool {
		self.0 == SYSTEM_SENDER
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}

	/// Last four characters of the id, used for placeholder display names.
	pub fn short_tag(&self) -> &str {
		// Char-wise, not byte-wise: ids are opaque and may be non-ASCII.
		let start = self.0.char_indices().rev().nth(3).map_or(0, |(i, _)| i);
		&self.0[start..]
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

/// Deterministic identifier for a two-party conversation.
///
/// Derived from the unordered pair of participants: ids sorted
/// lexicographically and joined with `-`, so `for_pair(a, b) ==
/// for_pair(b, a)`. Also constructible from a raw persisted
/// `room_identifier` value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
	const SEPARATOR: char = '-';

	/// Create a `RoomId` from a persisted identifier.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}

	/// Derive the room id for a pair of users. Pure and commutative.
	pub fn for_pair(a: &UserId, b: &UserId) -> Self {
		let (lo, hi) = if a.as_str() <= b.as_str() { (a, b) } else { (b, a) };
		Self(format!("{}{}{}", lo.as_str(), Self::SEPARATOR, hi.as_str()))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for RoomId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for RoomId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		RoomId::new(s.to_string())
	}
}

/// Client-generated idempotency key for a single message send.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
	/// Create a non-empty `ClientId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}

	/// Generate a fresh random client id.
	pub fn generate() -> Self {
		Self(uuid::Uuid::new_v4().to_string())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for ClientId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// Store-assigned message identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub i64);

impl fmt::Display for MessageId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// A single emoji reaction by a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
	pub emoji: String,
	pub user: UserId,
}

/// A chat message.
///
/// `id` stays `None` until the store assigns one. Deletion is a tombstone:
/// `deleted` flips on and `content` is replaced with [`DELETED_MARKER`];
/// the row is never removed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
	pub id: Option<MessageId>,
	pub room: RoomId,
	pub sender: UserId,
	pub recipient: UserId,
	pub content: String,
	pub timestamp: DateTime<Utc>,
	pub client_id: Option<ClientId>,
	#[serde(default)]
	pub deleted: bool,
	#[serde(default)]
	pub edited: bool,
	#[serde(default)]
	pub reply_to: Option<MessageId>,
	#[serde(default)]
	pub reactions: Vec<Reaction>,
}

impl Message {
	/// Build a fresh, unpersisted message timestamped now.
	pub fn new(room: RoomId, sender: UserId, recipient: UserId, content: impl Into<String>, client_id: Option<ClientId>) -> Self {
		Self {
			id: None,
			room,
			sender,
			recipient,
			content: content.into(),
			timestamp: Utc::now(),
			client_id,
			deleted: false,
			edited: false,
			reply_to: None,
			reactions: Vec::new(),
		}
	}

	/// Synthetic system message shown when a match connects.
	pub fn system(room: RoomId, recipient: UserId, content: impl Into<String>) -> Self {
		Self::new(room, UserId::system(), recipient, content, None)
	}

	/// Apply the soft-delete tombstone in place.
	pub fn apply_tombstone(&mut self) {
		self.content = DELETED_MARKER.to_string();
		self.deleted = true;
	}

	/// Apply an edit in place.
	pub fn apply_edit(&mut self, content: impl Into<String>) {
		self.content = content.into();
		self.edited = true;
	}
}

/// Profile fields surfaced next to a chat partner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileSummary {
	pub display_name: String,
	pub avatar: String,
	pub age: Option<u32>,
	pub location: Option<String>,
	pub gender: Option<String>,
}

impl ProfileSummary {
	/// Placeholder profile used when the real one cannot be fetched.
	pub fn placeholder(user: &UserId) -> Self {
		let display_name = format!("User {}", user.short_tag());
		let avatar = Self::generated_avatar(&display_name);
		Self {
			display_name,
			avatar,
			age: None,
			location: None,
			gender: None,
		}
	}

	/// Generated avatar URL for profiles without a picture.
	pub fn generated_avatar(name: &str) -> String {
		format!("https://ui-avatars.com/api/?name={name}&background=random")
	}
}

/// One user's view of a two-party conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chat {
	pub room: RoomId,
	pub partner: UserId,
	pub profile: ProfileSummary,
	pub messages: Vec<Message>,
	pub last_message: Option<Message>,
	pub unread: u32,
}

impl Chat {
	/// Empty chat for a partner.
	pub fn new(room: RoomId, partner: UserId, profile: ProfileSummary) -> Self {
		Self {
			room,
			partner,
			profile,
			messages: Vec::new(),
			last_message: None,
			unread: 0,
		}
	}

	/// Append a message and advance `last_message`.
	pub fn push(&mut self, msg: Message) {
		self.last_message = Some(msg.clone());
		self.messages.push(msg);
	}

	/// Timestamp used for most-recent-first chat ordering.
	pub fn last_activity(&self) -> Option<DateTime<Utc>> {
		self.last_message.as_ref().map(|m| m.timestamp)
	}
}

/// Matchmaking handshake states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
	Waiting,
	Pending,
	Connected,
	Rejected,
}

impl MatchStatus {
	pub const fn as_str(self) -> &'static str {
		match self {
			MatchStatus::Waiting => "waiting",
			MatchStatus::Pending => "pending",
			MatchStatus::Connected => "connected",
			MatchStatus::Rejected => "rejected",
		}
	}
}

impl fmt::Display for MatchStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}
