#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use circle_domain::{ClientId, MatchStatus, ProfileSummary, RoomId, UserId};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Candidate carried by a match status push. The profile may be absent;
/// the engine enriches it before surfacing the candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchCandidate {
	pub user: UserId,
	#[serde(default)]
	pub profile: Option<ProfileSummary>,
}

/// Inbound push events consumed by a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload")]
pub enum PushEvent {
	/// A direct message relayed from another connected user.
	#[serde(rename = "privateMessage", rename_all = "camelCase")]
	PrivateMessage {
		sender: UserId,
		content: String,
		#[serde(default)]
		timestamp: Option<DateTime<Utc>>,
		#[serde(default)]
		client_id: Option<ClientId>,
	},

	/// Matchmaking handshake progress.
	#[serde(rename = "randomMatchStatus", rename_all = "camelCase")]
	MatchStatusChanged {
		status: MatchStatus,
		#[serde(default)]
		room: Option<RoomId>,
		#[serde(default)]
		matched_user: Option<MatchCandidate>,
	},
}

/// Outbound events a session emits toward the push transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload")]
pub enum ClientEvent {
	#[serde(rename = "privateMessage", rename_all = "camelCase")]
	PrivateMessage {
		recipient: UserId,
		content: String,
		room: RoomId,
		client_id: ClientId,
	},

	#[serde(rename = "findRandomMatch")]
	FindMatch,

	#[serde(rename = "randomMatchAccept", rename_all = "camelCase")]
	AcceptMatch { room: RoomId },

	#[serde(rename = "randomMatchReject", rename_all = "camelCase")]
	RejectMatch { room: RoomId },
}

/// Abstract push transport addressing one connected user.
///
/// Delivery is best-effort: events for users that are not currently
/// connected are dropped silently, with the durable store as the fallback
/// path. Ordering is only guaranteed within a single sender→recipient
/// stream (one queue per connection).
#[async_trait::async_trait]
pub trait DeliveryChannel: Send + Sync {
	/// Register `user` as addressable and return their inbound stream.
	///
	/// Re-joining replaces any previous connection for the same user.
	async fn join(&self, user: &UserId) -> mpsc::Receiver<PushEvent>;

	/// Fire-and-forget emit of an outbound event on behalf of `sender`.
	async fn emit(&self, sender: &UserId, event: ClientEvent);

	/// Deregister `user`; safe to call repeatedly.
	async fn disconnect(&self, user: &UserId);
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn push_event_wire_names() {
		let ev = PushEvent::PrivateMessage {
			sender: "u1".parse().unwrap(),
			content: "hi".to_string(),
			timestamp: None,
			client_id: None,
		};
		let json = serde_json::to_value(&ev).expect("serialize");
		assert_eq!(json["event"], "privateMessage");
		assert_eq!(json["payload"]["sender"], "u1");
	}

	#[test]
	fn client_event_wire_names() {
		let ev = ClientEvent::AcceptMatch {
			room: "a-b".parse().unwrap(),
		};
		let json = serde_json::to_value(&ev).expect("serialize");
		assert_eq!(json["event"], "randomMatchAccept");

		let find = serde_json::to_value(ClientEvent::FindMatch).expect("serialize");
		assert_eq!(find["event"], "findRandomMatch");
	}

	#[test]
	fn match_status_roundtrip() {
		let ev = PushEvent::MatchStatusChanged {
			status: MatchStatus::Pending,
			room: Some("a-b".parse().unwrap()),
			matched_user: Some(MatchCandidate {
				user: "b".parse().unwrap(),
				profile: None,
			}),
		};
		let json = serde_json::to_string(&ev).expect("serialize");
		let back: PushEvent = serde_json::from_str(&json).expect("deserialize");
		assert_eq!(back, ev);
	}
}
