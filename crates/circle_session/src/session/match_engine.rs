#![forbid(unsafe_code)]

use std::sync::Arc;

use circle_domain::{MatchStatus, ProfileSummary, RoomId, UserId};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::channel::{ClientEvent, DeliveryChannel, MatchCandidate};
use crate::store::MessageStore;

/// A candidate with its enriched profile, ready to surface.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchedUser {
	pub user: UserId,
	pub profile: ProfileSummary,
}

/// Read-only view of the engine state.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchSnapshot {
	pub status: Option<MatchStatus>,
	pub matched: Option<MatchedUser>,
	pub room: Option<RoomId>,
	pub accepted: bool,
}

/// Outcome of feeding a status push into the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchTransition {
	None,
	Searching,
	CandidatePending,
	Rejected,
	Connected,
}

/// State machine for anonymous pairing: waiting → pending →
/// connected/rejected, scoped to a single user's session.
///
/// Mutual-accept resolution is deliberately weak: after a local accept the
/// caller arms a bounded wait ([`MatchEngine::connect_after_wait`]) and the
/// engine connects unilaterally when it elapses, whether or not the peer
/// confirmed. A peer-confirmed connected push short-circuits the wait.
#[derive(Clone)]
pub struct MatchEngine {
	user: UserId,
	channel: Arc<dyn DeliveryChannel>,
	store: Arc<dyn MessageStore>,
	inner: Arc<Mutex<MatchInner>>,
}

#[derive(Debug, Default)]
struct MatchInner {
	status: Option<MatchStatus>,
	matched: Option<MatchedUser>,
	room: Option<RoomId>,
	accepted: bool,

	/// Bumped on every reset; stale accept timers check it before firing.
	epoch: u64,
}

impl MatchEngine {
	pub fn new(user: UserId, channel: Arc<dyn DeliveryChannel>, store: Arc<dyn MessageStore>) -> Self {
		Self {
			user,
			channel,
			store,
			inner: Arc::new(Mutex::new(MatchInner::default())),
		}
	}

	pub async fn snapshot(&self) -> MatchSnapshot {
		let inner = self.inner.lock().await;
		MatchSnapshot {
			status: inner.status,
			matched: inner.matched.clone(),
			room: inner.room.clone(),
			accepted: inner.accepted,
		}
	}

	/// Request a match: clear prior candidate state and broadcast.
	pub async fn start(&self) {
		{
			let mut inner = self.inner.lock().await;
			inner.epoch += 1;
			inner.status = Some(MatchStatus::Waiting);
			inner.matched = None;
			inner.room = None;
			inner.accepted = false;
		}

		debug!(user = %self.user, "match: searching");
		self.channel.emit(&self.user, ClientEvent::FindMatch).await;
	}

	/// Feed an inbound status push into the state machine.
	pub async fn handle_status(
		&self,
		status: MatchStatus,
		room: Option<RoomId>,
		candidate: Option<MatchCandidate>,
	) -> MatchTransition {
		match status {
			MatchStatus::Waiting => {
				let mut inner = self.inner.lock().await;
				if inner.status.is_none() {
					debug!(user = %self.user, "match: waiting status with no match in progress ignored");
					return MatchTransition::None;
				}
				inner.status = Some(MatchStatus::Waiting);
				MatchTransition::Searching
			}
			MatchStatus::Pending => {
				let Some(candidate) = candidate else {
					debug!(user = %self.user, "match: pending status without candidate ignored");
					return MatchTransition::None;
				};

				// Enrich before surfacing so the caller never sees a bare id.
				let profile = match candidate.profile {
					Some(p) => p,
					None => self.profile_or_placeholder(&candidate.user).await,
				};

				let mut inner = self.inner.lock().await;
				if inner.status.is_none() {
					debug!(user = %self.user, "match: pending status with no match in progress ignored");
					return MatchTransition::None;
				}

				inner.status = Some(MatchStatus::Pending);
				inner.room = room.or_else(|| Some(RoomId::for_pair(&self.user, &candidate.user)));
				inner.matched = Some(MatchedUser {
					user: candidate.user,
					profile,
				});
				MatchTransition::CandidatePending
			}
			MatchStatus::Connected => {
				let mut inner = self.inner.lock().await;
				if inner.matched.is_none() {
					// A connected push can carry the candidate when the local
					// pending push was lost.
					let Some(c) = candidate else {
						return MatchTransition::None;
					};
					let profile = c.profile.unwrap_or_else(|| ProfileSummary::placeholder(&c.user));
					inner.matched = Some(MatchedUser { user: c.user, profile });
				}
				if let Some(r) = room {
					inner.room = Some(r);
				}
				inner.status = Some(MatchStatus::Connected);
				MatchTransition::Connected
			}
			MatchStatus::Rejected => {
				let mut inner = self.inner.lock().await;
				inner.status = Some(MatchStatus::Rejected);
				inner.accepted = false;
				MatchTransition::Rejected
			}
		}
	}

	/// Accept the pending candidate. Idempotent: only the first call from
	/// `pending` emits a signal and returns an epoch for the bounded wait.
	pub async fn accept(&self) -> Option<u64> {
		let (room, epoch) = {
			let mut inner = self.inner.lock().await;
			if inner.status != Some(MatchStatus::Pending) || inner.accepted || inner.matched.is_none() {
				debug!(user = %self.user, status = ?inner.status, "match: accept ignored");
				return None;
			}
			let room = inner.room.clone()?;
			inner.accepted = true;
			(room, inner.epoch)
		};

		self.channel.emit(&self.user, ClientEvent::AcceptMatch { room }).await;
		Some(epoch)
	}

	/// Bounded-wait resolution: transition pending→connected unilaterally,
	/// provided the engine is still on the same attempt and accepted.
	pub async fn connect_after_wait(&self, epoch: u64) -> bool {
		let mut inner = self.inner.lock().await;
		if inner.epoch != epoch || inner.status != Some(MatchStatus::Pending) || !inner.accepted {
			return false;
		}

		warn!(user = %self.user, "match: no peer confirmation within the accept window; connecting unilaterally");
		inner.status = Some(MatchStatus::Connected);
		true
	}

	/// Consume a connected outcome and reset the engine to none.
	pub async fn take_connected(&self) -> Option<MatchedUser> {
		let mut inner = self.inner.lock().await;
		if inner.status != Some(MatchStatus::Connected) {
			return None;
		}

		let matched = inner.matched.take();
		inner.status = None;
		inner.room = None;
		inner.accepted = false;
		inner.epoch += 1;
		matched
	}

	/// Decline the candidate and immediately re-queue for a new match.
	pub async fn reject(&self) {
		if let Some(room) = self.clear_candidate().await {
			self.channel.emit(&self.user, ClientEvent::RejectMatch { room }).await;
		}
		self.start().await;
	}

	/// Abort matching entirely (popup closed). Emits a reject signal when a
	/// candidate was already held so the peer is not left pending forever.
	pub async fn cancel(&self) {
		let room = self.clear_candidate().await;
		{
			let mut inner = self.inner.lock().await;
			inner.status = None;
		}
		if let Some(room) = room {
			self.channel.emit(&self.user, ClientEvent::RejectMatch { room }).await;
		}
		debug!(user = %self.user, "match: cancelled");
	}

	async fn clear_candidate(&self) -> Option<RoomId> {
		let mut inner = self.inner.lock().await;
		inner.epoch += 1;
		inner.accepted = false;
		let room = if inner.matched.is_some() { inner.room.take() } else { None };
		inner.matched = None;
		inner.room = None;
		room
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
}
