#![forbid(unsafe_code)]

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use tracing::info;

use crate::session::registry::DEFAULT_INBOUND_QUEUE_CAPACITY;

/// Default bounded wait after a local accept before unilaterally treating a
/// pending match as connected. See [`SessionConfig::match_accept_timeout`].
pub const DEFAULT_MATCH_ACCEPT_TIMEOUT: Duration = Duration::from_secs(5);

/// Session core configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
	/// Bounded wait applied after a local accept with no peer confirmation.
	///
	/// The engine connects unilaterally once the wait elapses, so a peer
	/// that never accepted can still be surfaced as connected on this side.
	pub match_accept_timeout: Duration,

	/// Capacity of a user's inbound push queue.
	pub inbound_queue_capacity: usize,

	/// Capacity of each session-update subscriber queue.
	pub update_queue_capacity: usize,

	pub persistence: PersistenceSettings,
}

/// Persistence settings for the durable message store.
#[derive(Debug, Clone, Default)]
pub struct PersistenceSettings {
	/// Database URL (sqlite:). Absent means the in-memory store.
	pub database_url: Option<String>,
}

impl Default for SessionConfig {
	fn default() -> Self {
		Self {
			match_accept_timeout: DEFAULT_MATCH_ACCEPT_TIMEOUT,
			inbound_queue_capacity: DEFAULT_INBOUND_QUEUE_CAPACITY,
			update_queue_capacity: 64,
			persistence: PersistenceSettings::default(),
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	match_accept_timeout_ms: Option<u64>,
	inbound_queue_capacity: Option<usize>,
	update_queue_capacity: Option<usize>,

	#[serde(default)]
	persistence: FilePersistenceSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	database_url: Option<String>,
}

/// Load the session config from a TOML file and env overrides.
pub fn load_config_from_path(path: &Path) -> anyhow::Result<SessionConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = SessionConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

impl SessionConfig {
	fn from_file(file: FileConfig) -> Self {
		let defaults = Self::default();
		Self {
			match_accept_timeout: file
				.match_accept_timeout_ms
				.map(Duration::from_millis)
				.unwrap_or(defaults.match_accept_timeout),
			inbound_queue_capacity: file.inbound_queue_capacity.unwrap_or(defaults.inbound_queue_capacity),
			update_queue_capacity: file.update_queue_capacity.unwrap_or(defaults.update_queue_capacity),
			persistence: PersistenceSettings {
				database_url: file.persistence.database_url.filter(|s| !s.trim().is_empty()),
			},
		}
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut SessionConfig) {
	if let Ok(v) = std::env::var("CIRCLE_MATCH_ACCEPT_TIMEOUT_MS")
		&& let Ok(ms) = v.trim().parse::<u64>()
	{
		cfg.match_accept_timeout = Duration::from_millis(ms);
		info!(ms, "session config: match_accept_timeout overridden by env");
	}

	if let Ok(v) = std::env::var("CIRCLE_INBOUND_QUEUE_CAPACITY")
		&& let Ok(capacity) = v.trim().parse::<usize>()
	{
		cfg.inbound_queue_capacity = capacity;
		info!(capacity, "session config: inbound_queue_capacity overridden by env");
	}

	if let Ok(v) = std::env::var("CIRCLE_UPDATE_QUEUE_CAPACITY")
		&& let Ok(capacity) = v.trim().parse::<usize>()
	{
		cfg.update_queue_capacity = capacity;
		info!(capacity, "session config: update_queue_capacity overridden by env");
	}

	if let Ok(v) = std::env::var("CIRCLE_DATABASE_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.persistence.database_url = Some(v);
			info!("persistence: database_url overridden by env");
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_when_file_is_empty() {
		let cfg = SessionConfig::from_file(FileConfig::default());
		assert_eq!(cfg.match_accept_timeout, DEFAULT_MATCH_ACCEPT_TIMEOUT);
		assert_eq!(cfg.inbound_queue_capacity, 256);
		assert!(cfg.persistence.database_url.is_none());
	}

	#[test]
	fn parses_file_values() {
		let file: FileConfig = toml::from_str(
			r#"
			match_accept_timeout_ms = 1500
			inbound_queue_capacity = 32

			[persistence]
			database_url = "sqlite::memory:"
			"#,
		)
		.expect("parse toml");

		let cfg = SessionConfig::from_file(file);
		assert_eq!(cfg.match_accept_timeout, Duration::from_millis(1500));
		assert_eq!(cfg.inbound_queue_capacity, 32);
		assert_eq!(cfg.update_queue_capacity, 64);
		assert_eq!(cfg.persistence.database_url.as_deref(), Some("sqlite::memory:"));
	}

	#[test]
	fn blank_database_url_is_dropped() {
		let file: FileConfig = toml::from_str("[persistence]\ndatabase_url = \"  \"\n").expect("parse toml");
		let cfg = SessionConfig::from_file(file);
		assert!(cfg.persistence.database_url.is_none());
	}
}
