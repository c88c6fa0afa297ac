#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use circle_domain::{MatchStatus, RoomId, UserId};
use tokio::sync::{Mutex, RwLock, mpsc};
use tracing::debug;

use crate::channel::{ClientEvent, DeliveryChannel, MatchCandidate, PushEvent};

/// Default capacity of a user's inbound push queue.
pub const DEFAULT_INBOUND_QUEUE_CAPACITY: usize = 256;

/// Process-wide map of online user id → connection handle.
///
/// The only structure mutated by multiple connection handlers concurrently;
/// registration is idempotent per connection (last writer wins, one live
/// session per user) and deregistration is safe to repeat.
#[derive(Debug, Clone)]
pub struct SessionRegistry {
	inner: Arc<RwLock<HashMap<UserId, mpsc::Sender<PushEvent>>>>,
	queue_capacity: usize,
}

impl SessionRegistry {
	pub fn new(queue_capacity: usize) -> Self {
		Self {
			inner: Arc::new(RwLock::new(HashMap::new())),
			queue_capacity,
		}
	}

	/// Register `user` as online, returning their inbound stream.
	/// Replaces any previous connection for the same user.
	pub async fn register(&self, user: &UserId) -> mpsc::Receiver<PushEvent> {
		let (tx, rx) = mpsc::channel(self.queue_capacity);

		let mut map = self.inner.write().await;
		if map.insert(user.clone(), tx).is_some() {
			debug!(user = %user, "session registry: replaced existing connection");
		}
		metrics::gauge!("circle_sessions_connected").set(map.len() as f64);

		rx
	}

	/// Remove `user`; a no-op when already gone.
	pub async fn deregister(&self, user: &UserId) {
		let mut map = self.inner.write().await;
		if map.remove(user).is_some() {
			debug!(user = %user, "session registry: deregistered");
		}
		metrics::gauge!("circle_sessions_connected").set(map.len() as f64);
	}

	pub async fn is_online(&self, user: &UserId) -> bool {
		self.inner.read().await.contains_key(user)
	}

	/// Fire-and-forget push to one user. Returns whether the event was
	/// enqueued; offline recipients and saturated queues drop silently
	/// (the durable store is the fallback path).
	pub async fn push(&self, recipient: &UserId, event: PushEvent) -> bool {
		let map = self.inner.read().await;
		let Some(tx) = map.get(recipient) else {
			debug!(user = %recipient, "push skipped: recipient offline");
			metrics::counter!("circle_push_dropped_total").increment(1);
			return false;
		};

		match tx.try_send(event) {
			Ok(()) => {
				metrics::counter!("circle_push_delivered_total").increment(1);
				true
			}
			Err(mpsc::error::TrySendError::Full(_)) => {
				debug!(user = %recipient, "push dropped: inbound queue full");
				metrics::counter!("circle_push_dropped_total").increment(1);
				false
			}
			Err(mpsc::error::TrySendError::Closed(_)) => {
				debug!(user = %recipient, "push dropped: connection closed");
				metrics::counter!("circle_push_dropped_total").increment(1);
				false
			}
		}
	}
}

/// In-process [`DeliveryChannel`] over a [`SessionRegistry`], with an
/// embedded matchmaker broker. Relays direct messages to the recipient's
/// inbound queue and answers matchmaking signals.
#[derive(Clone)]
pub struct LocalChannel {
	registry: SessionRegistry,
	matchmaker: Matchmaker,
}

impl LocalChannel {
	pub fn new(registry: SessionRegistry) -> Self {
		let matchmaker = Matchmaker::new(registry.clone());
		Self { registry, matchmaker }
	}

	pub fn registry(&self) -> &SessionRegistry {
		&self.registry
	}
}

#[async_trait::async_trait]
impl DeliveryChannel for LocalChannel {
	async fn join(&self, user: &UserId) -> mpsc::Receiver<PushEvent> {
		self.registry.register(user).await
	}

	async fn emit(&self, sender: &UserId, event: ClientEvent) {
		match event {
			ClientEvent::PrivateMessage {
				recipient,
				content,
				room: _,
				client_id,
			} => {
				// The recipient re-derives the room from the pair; only the
				// sender identity, content and idempotency key travel.
				let push = PushEvent::PrivateMessage {
					sender: sender.clone(),
					content,
					timestamp: None,
					client_id: Some(client_id),
				};
				self.registry.push(&recipient, push).await;
			}
			ClientEvent::FindMatch => self.matchmaker.enqueue(sender).await,
			ClientEvent::AcceptMatch { room } => self.matchmaker.accept(sender, &room).await,
			ClientEvent::RejectMatch { room } => self.matchmaker.reject(sender, &room).await,
		}
	}

	async fn disconnect(&self, user: &UserId) {
		self.matchmaker.remove(user).await;
		self.registry.deregister(user).await;
	}
}

/// FIFO pairing broker for random matches.
///
/// Pairs two waiting users, hands both a pending status with a provisional
/// room, tracks mutual accepts, and relays rejections to the peer.
#[derive(Clone)]
pub struct Matchmaker {
	registry: SessionRegistry,
	inner: Arc<Mutex<MatchmakerState>>,
}

#[derive(Debug, Default)]
struct MatchmakerState {
	waiting: VecDeque<UserId>,
	pending: HashMap<RoomId, PendingMatch>,
}

#[derive(Debug)]
struct PendingMatch {
	a: UserId,
	b: UserId,
	accepted: HashSet<UserId>,
}

impl PendingMatch {
	fn peer_of(&self, user: &UserId) -> Option<&UserId> {
		if &self.a == user {
			Some(&self.b)
		} else if &self.b == user {
			Some(&self.a)
		} else {
			None
		}
	}
}

impl Matchmaker {
	pub fn new(registry: SessionRegistry) -> Self {
		Self {
			registry,
			inner: Arc::new(Mutex::new(MatchmakerState::default())),
		}
	}

	/// Queue `user` for pairing; pairs immediately when someone is waiting.
	pub async fn enqueue(&self, user: &UserId) {
		let paired = {
			let mut st = self.inner.lock().await;
			// Already queued or already holding a pending match: one
			// in-flight handshake per user.
			if st.waiting.contains(user) || st.pending.values().any(|p| p.peer_of(user).is_some()) {
				return;
			}

			match st.waiting.pop_front() {
				Some(peer) => {
					let room = RoomId::for_pair(user, &peer);
					st.pending.insert(
						room.clone(),
						PendingMatch {
							a: user.clone(),
							b: peer.clone(),
							accepted: HashSet::new(),
						},
					);
					Some((peer, room))
				}
				None => {
					st.waiting.push_back(user.clone());
					None
				}
			}
		};

		let Some((peer, room)) = paired else {
			debug!(user = %user, "matchmaker: waiting for a peer");
			return;
		};

		debug!(user = %user, peer = %peer, room = %room, "matchmaker: paired");
		metrics::counter!("circle_matches_paired_total").increment(1);

		self.push_status(user, MatchStatus::Pending, &room, Some(&peer)).await;
		self.push_status(&peer, MatchStatus::Pending, &room, Some(user)).await;
	}

	/// Record an accept; once both sides accepted, push connected to both.
	pub async fn accept(&self, user: &UserId, room: &RoomId) {
		let both = {
			let mut st = self.inner.lock().await;
			let Some(pending) = st.pending.get_mut(room) else {
				return;
			};
			if pending.peer_of(user).is_none() {
				return;
			}
			pending.accepted.insert(user.clone());
			if pending.accepted.len() == 2 {
				st.pending.remove(room).map(|p| (p.a, p.b))
			} else {
				None
			}
		};

		if let Some((a, b)) = both {
			debug!(room = %room, "matchmaker: mutual accept");
			self.push_status(&a, MatchStatus::Connected, room, Some(&b)).await;
			self.push_status(&b, MatchStatus::Connected, room, Some(&a)).await;
		}
	}

	/// Drop the pending match and notify the peer.
	pub async fn reject(&self, user: &UserId, room: &RoomId) {
		let peer = {
			let mut st = self.inner.lock().await;
			match st.pending.get(room).and_then(|p| p.peer_of(user).cloned()) {
				Some(peer) => {
					st.pending.remove(room);
					Some(peer)
				}
				None => None,
			}
		};

		if let Some(peer) = peer {
			debug!(user = %user, peer = %peer, room = %room, "matchmaker: rejected");
			self.push_status(&peer, MatchStatus::Rejected, room, None).await;
		}
	}

	/// Remove `user` from the queue and abandon their pending match, if
	/// any, notifying the abandoned peer.
	pub async fn remove(&self, user: &UserId) {
		let abandoned = {
			let mut st = self.inner.lock().await;
			st.waiting.retain(|u| u != user);

			let room = st
				.pending
				.iter()
				.find(|(_, p)| p.peer_of(user).is_some())
				.map(|(room, _)| room.clone());
			room.and_then(|room| {
				st.pending
					.remove(&room)
					.and_then(|p| p.peer_of(user).cloned().map(|peer| (peer, room)))
			})
		};

		if let Some((peer, room)) = abandoned {
			self.push_status(&peer, MatchStatus::Rejected, &room, None).await;
		}
	}

	async fn push_status(&self, to: &UserId, status: MatchStatus, room: &RoomId, candidate: Option<&UserId>) {
		let event = PushEvent::MatchStatusChanged {
			status,
			room: Some(room.clone()),
			matched_user: candidate.map(|user| MatchCandidate {
				user: user.clone(),
				profile: None,
			}),
		};
		self.registry.push(to, event).await;
	}
}
