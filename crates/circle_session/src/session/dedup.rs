#![forbid(unsafe_code)]

use circle_domain::{Chat, Message};

/// Idempotency key for a message: its client id, when present.
///
/// A missing or blank client id yields `None`, meaning "not deduplicable":
/// such a message is always applied rather than being collapsed into a
/// shared empty key with every other keyless message.
pub fn dedup_key(msg: &Message) -> Option<&str> {
	msg.client_id.as_ref().map(|c| c.as_str()).filter(|s| !s.trim().is_empty())
}

/// Whether any message already held by `chat` carries `key`.
pub fn seen(chat: &Chat, key: &str) -> bool {
	chat.messages.iter().any(|m| dedup_key(m) == Some(key))
}

/// Guard consulted by both the optimistic-send and inbound-apply paths
/// before mutating session state. This is the sole defense against the
/// sender's own echo and against network-level redelivery.
pub fn already_applied(chat: &Chat, msg: &Message) -> bool {
	match dedup_key(msg) {
		Some(key) => seen(chat, key),
		None => false,
	}
}

/// Buffer-level variant of [`seen`] for the active-message buffer.
pub fn in_buffer(buffer: &[Message], msg: &Message) -> bool {
	let Some(key) = dedup_key(msg) else {
		return false;
	};
	buffer.iter().any(|m| dedup_key(m) == Some(key))
}
