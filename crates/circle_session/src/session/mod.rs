#![forbid(unsafe_code)]

pub mod chat_session;
pub mod dedup;
pub mod match_engine;
pub mod registry;

#[cfg(test)]
mod chat_session_tests;
