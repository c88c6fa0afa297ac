#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use circle_domain::{Chat, ClientId, Message, MessageId, ProfileSummary, Reaction, RoomId, UserId};
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use crate::channel::{ClientEvent, DeliveryChannel, MatchCandidate, PushEvent};
use crate::config::SessionConfig;
use crate::session::dedup;
use crate::session::match_engine::{MatchEngine, MatchSnapshot, MatchTransition, MatchedUser};
use crate::store::{MessagePatch, MessageStore, StoreError, ensure_room};

/// Content of the synthetic system message created when a match connects.
pub const CONNECTED_MESSAGE: &str = "You are now connected!";

/// Session operation errors. Most paths degrade instead of failing; only
/// durable-store problems on explicitly persisted operations surface here.
#[derive(Debug, Error)]
pub enum SessionError {
	#[error("store error: {0}")]
	Store(#[from] StoreError),
}

/// Notifications emitted to session subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionUpdate {
	ChatListChanged,
	ActiveChatChanged,
	MatchChanged,
}

/// One logged-in user's live view: chat list, active room, and message
/// buffer, mediating between the push channel and the durable store.
///
/// Cheap to clone; all clones share state. Each session is a single
/// logical actor: callers hand it events from one inbound stream (see
/// [`spawn_pump`]) plus user-initiated calls, and every mutation is
/// serialized behind the state lock.
#[derive(Clone)]
pub struct ChatSession {
	user: UserId,
	cfg: SessionConfig,
	store: Arc<dyn MessageStore>,
	channel: Arc<dyn DeliveryChannel>,
	state: Arc<Mutex<SessionState>>,
	subscribers: Arc<Mutex<Vec<mpsc::Sender<SessionUpdate>>>>,
	match_engine: MatchEngine,
}

#[derive(Debug, Default)]
struct SessionState {
	chats: Vec<Chat>,
	active: Option<RoomId>,

	/// Messages of the active chat, kept as its own buffer.
	active_messages: Vec<Message>,
}

/// Drives a session from its inbound push stream until the channel
/// closes. Events are drained in arrival order; dedup happens at drain
/// time so interleavings with local sends are observed correctly.
pub fn spawn_pump(session: ChatSession, mut inbound: mpsc::Receiver<PushEvent>) -> tokio::task::JoinHandle<()> {
	tokio::spawn(async move {
		while let Some(event) = inbound.recv().await {
			session.handle_push(event).await;
		}
		debug!(user = %session.user, "inbound push stream closed; pump exiting");
	})
}

impl ChatSession {
	pub fn new(user: UserId, cfg: SessionConfig, store: Arc<dyn MessageStore>, channel: Arc<dyn DeliveryChannel>) -> Self {
		let match_engine = MatchEngine::new(user.clone(), channel.clone(), store.clone());
		Self {
			user,
			cfg,
			store,
			channel,
			state: Arc::new(Mutex::new(SessionState::default())),
			subscribers: Arc::new(Mutex::new(Vec::new())),
			match_engine,
		}
	}

	pub fn user(&self) -> &UserId {
		&self.user
	}

	/// Subscribe to session updates. Queues are bounded and lossy;
	/// subscribers read current state through the accessors.
	pub async fn subscribe(&self) -> mpsc::Receiver<SessionUpdate> {
		let (tx, rx) = mpsc::channel(self.cfg.update_queue_capacity);
		self.subscribers.lock().await.push(tx);
		rx
	}

	/// Load persisted chats and register on the push channel, returning
	/// the inbound stream to pump. Tolerates a brand-new user (empty
	/// store) and partial profile failures (placeholder profiles).
	pub async fn start(&self) -> Result<mpsc::Receiver<PushEvent>, SessionError> {
		let messages = self.store.messages_for_user(&self.user).await?;

		let mut by_room: HashMap<RoomId, Vec<Message>> = HashMap::new();
		for msg in messages {
			by_room.entry(msg.room.clone()).or_default().push(msg);
		}

		let mut chats = Vec::with_capacity(by_room.len());
		for (room, msgs) in by_room {
			let Some(partner) = partner_of(&self.user, &msgs) else {
				warn!(room = %room, "skipping room with no identifiable partner");
				continue;
			};

			let profile = self.profile_or_placeholder(&partner).await;
			let mut chat = Chat::new(room, partner, profile);
			chat.last_message = msgs.last().cloned();
			chat.messages = msgs;
			chats.push(chat);
		}

		// Most recent conversation on top.
		chats.sort_by(|a, b| b.last_activity().cmp(&a.last_activity()));

		{
			let mut st = self.state.lock().await;
			let st = &mut *st;
			st.chats = chats;
			if st.active.is_none()
				&& let Some(first) = st.chats.first()
			{
				st.active = Some(first.room.clone());
				st.active_messages = first.messages.clone();
			}
		}

		info!(user = %self.user, "session started");
		self.notify(SessionUpdate::ChatListChanged).await;
		self.notify(SessionUpdate::ActiveChatChanged).await;

		Ok(self.channel.join(&self.user).await)
	}

	/// Make `room` the active chat and clear its unread count.
	pub async fn select(&self, room: &RoomId) -> bool {
		{
			let mut st = self.state.lock().await;
			let Some(chat) = st.chats.iter_mut().find(|c| &c.room == room) else {
				warn!(room = %room, "select ignored: unknown room");
				return false;
			};

			chat.unread = 0;
			let messages = chat.messages.clone();
			st.active = Some(room.clone());
			st.active_messages = messages;
		}

		self.notify(SessionUpdate::ChatListChanged).await;
		self.notify(SessionUpdate::ActiveChatChanged).await;
		true
	}

	/// Send a message into the active chat: optimistic local apply, push
	/// to the partner, then durable write. Returns `None` (and does
	/// nothing) when no chat is active.
	///
	/// A failed durable write keeps the optimistic copy visible; the
	/// message the user saw leave must not vanish on a persistence error.
	pub async fn send(&self, text: &str) -> Option<Message> {
		let (room, partner) = {
			let st = self.state.lock().await;
			let Some(room) = st.active.clone() else {
				warn!(user = %self.user, "send ignored: no active chat");
				return None;
			};
			let partner = st.chats.iter().find(|c| c.room == room).map(|c| c.partner.clone())?;
			(room, partner)
		};

		let client_id = ClientId::generate();
		let mut msg = Message::new(room.clone(), self.user.clone(), partner.clone(), text, Some(client_id.clone()));

		{
			let mut st = self.state.lock().await;
			let is_active = st.active.as_ref() == Some(&room);
			if let Some(chat) = st.chats.iter_mut().find(|c| c.room == room)
				&& !dedup::already_applied(chat, &msg)
			{
				chat.push(msg.clone());
			}
			if is_active && !dedup::in_buffer(&st.active_messages, &msg) {
				st.active_messages.push(msg.clone());
			}
		}
		self.notify(SessionUpdate::ChatListChanged).await;
		self.notify(SessionUpdate::ActiveChatChanged).await;

		self.channel
			.emit(
				&self.user,
				ClientEvent::PrivateMessage {
					recipient: partner,
					content: text.to_string(),
					room,
					client_id: client_id.clone(),
				},
			)
			.await;

		match self.store.insert_message(&msg).await {
			Ok(persisted) => {
				if let Some(id) = persisted.id {
					self.backfill_id(&client_id, id).await;
					msg.id = Some(id);
				}
			}
			Err(e) => {
				warn!(user = %self.user, error = %e, "message persistence failed; keeping optimistic copy");
			}
		}

		Some(msg)
	}

	/// Apply one inbound push event.
	pub async fn handle_push(&self, event: PushEvent) {
		match event {
			PushEvent::PrivateMessage {
				sender,
				content,
				timestamp,
				client_id,
			} => self.apply_incoming(sender, content, timestamp, client_id).await,
			PushEvent::MatchStatusChanged {
				status,
				room,
				matched_user,
			} => self.handle_match_status(status, room, matched_user).await,
		}
	}

	async fn apply_incoming(
		&self,
		sender: UserId,
		content: String,
		timestamp: Option<chrono::DateTime<chrono::Utc>>,
		client_id: Option<ClientId>,
	) {
		if sender == self.user {
			debug!(user = %self.user, "own echo ignored");
			return;
		}

		let room = RoomId::for_pair(&self.user, &sender);

		// Create-if-absent; the unique identifier arbitrates the race with
		// the peer doing the same. Store trouble must not lose the message.
		if let Err(e) = ensure_room(self.store.as_ref(), &room, &self.user, &sender).await {
			warn!(room = %room, error = %e, "ensure room failed; applying message locally anyway");
		}

		let mut msg = Message::new(room.clone(), sender.clone(), self.user.clone(), content, client_id);
		if let Some(ts) = timestamp {
			msg.timestamp = ts;
		}
		// Keyless wire messages get a fresh key so later redeliveries of
		// locally held copies stay deduplicable.
		if msg.client_id.is_none() {
			msg.client_id = Some(ClientId::generate());
		}

		let known = {
			let st = self.state.lock().await;
			st.chats.iter().any(|c| c.room == room)
		};
		let profile = if known {
			None
		} else {
			Some(self.profile_or_placeholder(&sender).await)
		};

		{
			let mut st = self.state.lock().await;
			let is_active = st.active.as_ref() == Some(&room);

			let idx = match st.chats.iter().position(|c| c.room == room) {
				Some(idx) => idx,
				None => {
					let profile = profile.unwrap_or_else(|| ProfileSummary::placeholder(&sender));
					st.chats.insert(0, Chat::new(room.clone(), sender.clone(), profile));
					0
				}
			};

			let chat = &mut st.chats[idx];
			if dedup::already_applied(chat, &msg) {
				debug!(room = %room, "duplicate push suppressed");
				return;
			}

			chat.push(msg.clone());
			if is_active {
				chat.unread = 0;
				if !dedup::in_buffer(&st.active_messages, &msg) {
					st.active_messages.push(msg);
				}
			} else {
				chat.unread += 1;
			}
		}

		self.notify(SessionUpdate::ChatListChanged).await;
		self.notify(SessionUpdate::ActiveChatChanged).await;
	}

	/// Tombstone a message: persist first, then mirror the flag into every
	/// local holder in one lock acquisition.
	pub async fn delete(&self, id: MessageId) -> Result<(), SessionError> {
		self.store.update_message(id, MessagePatch::tombstone()).await?;
		self.mutate_message(id, |m| m.apply_tombstone()).await;
		Ok(())
	}

	/// Alias of [`ChatSession::delete`] from the sender's perspective.
	pub async fn unsend(&self, id: MessageId) -> Result<(), SessionError> {
		self.delete(id).await
	}

	pub async fn edit(&self, id: MessageId, new_content: &str) -> Result<(), SessionError> {
		self.store.update_message(id, MessagePatch::edit(new_content)).await?;
		let content = new_content.to_string();
		self.mutate_message(id, move |m| m.apply_edit(content.clone())).await;
		Ok(())
	}

	/// Append a reaction and persist the full updated list. Append-only:
	/// repeat reactions from the same user accumulate.
	pub async fn react(&self, id: MessageId, emoji: &str) -> Result<(), SessionError> {
		let mut reactions = {
			let st = self.state.lock().await;
			let Some(current) = find_message(&st, id).map(|m| m.reactions.clone()) else {
				warn!(message = %id, "react ignored: unknown message");
				return Ok(());
			};
			current
		};

		reactions.push(Reaction {
			emoji: emoji.to_string(),
			user: self.user.clone(),
		});

		self.store
			.update_message(id, MessagePatch::with_reactions(reactions.clone()))
			.await?;
		self.mutate_message(id, move |m| m.reactions = reactions.clone()).await;
		Ok(())
	}

	// Matchmaking surface; state machine details live in `MatchEngine`.

	pub async fn start_match(&self) {
		self.match_engine.start().await;
		self.notify(SessionUpdate::MatchChanged).await;
	}

	/// Accept the pending candidate and arm the bounded wait: once
	/// `match_accept_timeout` elapses without peer confirmation the match
	/// is treated as connected on this side.
	pub async fn accept_match(&self) {
		let Some(epoch) = self.match_engine.accept().await else {
			return;
		};
		self.notify(SessionUpdate::MatchChanged).await;

		let session = self.clone();
		let wait = self.cfg.match_accept_timeout;
		tokio::spawn(async move {
			tokio::time::sleep(wait).await;
			if session.match_engine.connect_after_wait(epoch).await {
				session.finish_connected().await;
			}
		});
	}

	/// Decline the candidate; the engine auto-retries a new match.
	pub async fn reject_match(&self) {
		self.match_engine.reject().await;
		self.notify(SessionUpdate::MatchChanged).await;
	}

	/// Abort matching (popup closed), releasing any held candidate.
	pub async fn cancel_match(&self) {
		self.match_engine.cancel().await;
		self.notify(SessionUpdate::MatchChanged).await;
	}

	async fn handle_match_status(&self, status: circle_domain::MatchStatus, room: Option<RoomId>, candidate: Option<MatchCandidate>) {
		let transition = self.match_engine.handle_status(status, room, candidate).await;
		if transition != MatchTransition::None {
			self.notify(SessionUpdate::MatchChanged).await;
		}
		if transition == MatchTransition::Connected {
			self.finish_connected().await;
		}
	}

	/// Materialize the connected match as a chat: ensure the room exists,
	/// seed it with the system message, and make it active. The unread
	/// count stays 1 until the user explicitly selects the chat.
	async fn finish_connected(&self) {
		let Some(matched) = self.match_engine.take_connected().await else {
			return;
		};

		let room = RoomId::for_pair(&self.user, &matched.user);
		if let Err(e) = ensure_room(self.store.as_ref(), &room, &self.user, &matched.user).await {
			warn!(room = %room, error = %e, "ensure room failed for connected match");
		}

		let MatchedUser { user: partner, profile } = matched;
		let mut chat = Chat::new(room.clone(), partner, profile);
		chat.push(Message::system(room.clone(), self.user.clone(), CONNECTED_MESSAGE));
		chat.unread = 1;

		{
			let mut st = self.state.lock().await;
			if st.chats.iter().all(|c| c.room != room) {
				st.chats.insert(0, chat);
			}
			let messages = st
				.chats
				.iter()
				.find(|c| c.room == room)
				.map(|c| c.messages.clone())
				.unwrap_or_default();
			st.active = Some(room.clone());
			st.active_messages = messages;
		}

		info!(user = %self.user, room = %room, "match connected");
		metrics::counter!("circle_matches_connected_total").increment(1);

		self.notify(SessionUpdate::ChatListChanged).await;
		self.notify(SessionUpdate::ActiveChatChanged).await;
		self.notify(SessionUpdate::MatchChanged).await;
	}

	// Accessors; all return clones and never expose the lock.

	pub async fn chats(&self) -> Vec<Chat> {
		self.state.lock().await.chats.clone()
	}

	pub async fn active_room(&self) -> Option<RoomId> {
		self.state.lock().await.active.clone()
	}

	pub async fn active_messages(&self) -> Vec<Message> {
		self.state.lock().await.active_messages.clone()
	}

	pub async fn unread_for(&self, room: &RoomId) -> Option<u32> {
		let st = self.state.lock().await;
		st.chats.iter().find(|c| &c.room == room).map(|c| c.unread)
	}

	pub async fn match_snapshot(&self) -> MatchSnapshot {
		self.match_engine.snapshot().await
	}

	/// Mirror a mutation into every holder of the message (chat buffers,
	/// chat-list `last_message` copies, the active buffer) under one lock
	/// acquisition, so readers never observe a partial update.
	async fn mutate_message(&self, id: MessageId, f: impl Fn(&mut Message)) {
		{
			let mut st = self.state.lock().await;
			for chat in st.chats.iter_mut() {
				for msg in chat.messages.iter_mut().filter(|m| m.id == Some(id)) {
					f(msg);
				}
				if let Some(last) = chat.last_message.as_mut()
					&& last.id == Some(id)
				{
					f(last);
				}
			}
			for msg in st.active_messages.iter_mut().filter(|m| m.id == Some(id)) {
				f(msg);
			}
		}

		self.notify(SessionUpdate::ChatListChanged).await;
		self.notify(SessionUpdate::ActiveChatChanged).await;
	}

	/// After a successful insert, stamp the store-assigned id onto the
	/// optimistic copies so edit/delete can target them without a reload.
	async fn backfill_id(&self, client_id: &ClientId, id: MessageId) {
		let mut st = self.state.lock().await;
		let matches_key = |m: &Message| m.client_id.as_ref() == Some(client_id);
		for chat in st.chats.iter_mut() {
			for msg in chat.messages.iter_mut().filter(|m| matches_key(m)) {
				msg.id = Some(id);
			}
			if let Some(last) = chat.last_message.as_mut()
				&& matches_key(last)
			{
				last.id = Some(id);
			}
		}
		for msg in st.active_messages.iter_mut().filter(|m| matches_key(m)) {
			msg.id = Some(id);
		}
	}

	async fn profile_or_placeholder(&self, user: &UserId) -> ProfileSummary {
		match self.store.profile_summary(user).await {
			Ok(Some(profile)) => profile,
			Ok(None) => ProfileSummary::placeholder(user),
			Err(e) => {
				warn!(user = %user, error = %e, "profile lookup failed; using placeholder");
				ProfileSummary::placeholder(user)
			}
		}
	}

	async fn notify(&self, update: SessionUpdate) {
		let mut subs = self.subscribers.lock().await;
		subs.retain(|s| !s.is_closed());
		for sub in subs.iter() {
			if sub.try_send(update).is_err() {
				debug!(user = %self.user, ?update, "subscriber queue full; update dropped");
			}
		}
	}
}

/// The chat partner for a group of messages: the first non-system sender
/// other than `user`, falling back to a recipient other than `user`.
fn partner_of(user: &UserId, msgs: &[Message]) -> Option<UserId> {
	msgs.iter()
		.find_map(|m| {
			if m.sender != *user && !m.sender.is_system() {
				Some(m.sender.clone())
			} else {
				None
			}
		})
		.or_else(|| msgs.iter().find_map(|m| (m.recipient != *user).then(|| m.recipient.clone())))
}

fn find_message(st: &SessionState, id: MessageId) -> Option<&Message> {
	st.active_messages
		.iter()
		.find(|m| m.id == Some(id))
		.or_else(|| st.chats.iter().flat_map(|c| c.messages.iter()).find(|m| m.id == Some(id)))
}
