#![forbid(unsafe_code)]

//! Real-time chat session core: presence-based delivery, chat-room
//! identity, random-match handshakes, and reconciliation between an
//! ephemeral push channel and a durable message store.
//!
//! This crate is a library-level component meant to be embedded behind a
//! connection-accepting server; it carries no transport or UI surface of
//! its own.

pub mod channel;
pub mod config;
pub mod session;
pub mod store;
pub mod util;

pub use channel::{ClientEvent, DeliveryChannel, MatchCandidate, PushEvent};
pub use config::{PersistenceSettings, SessionConfig};
pub use session::chat_session::{CONNECTED_MESSAGE, ChatSession, SessionError, SessionUpdate, spawn_pump};
pub use session::match_engine::{MatchEngine, MatchSnapshot, MatchedUser};
pub use session::registry::{LocalChannel, SessionRegistry};
pub use store::{MessageStore, Room, StoreError, ensure_room};
