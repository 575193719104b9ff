use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for the substrate. Defaults follow the documented contract:
/// pools scale between 1 and 5 bridges, idle learning starts at 60 s, peers
/// are swept every 10 s, and connect timeouts are disabled.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
	pub backend_min_pool: usize,
	pub backend_max_pool: usize,
	#[serde(with = "duration_ms")]
	pub backend_idle_timeout: Duration,
	#[serde(with = "duration_ms")]
	pub peer_cleanup_interval: Duration,
	#[serde(with = "duration_ms")]
	pub peer_timeout: Duration,
	/// Zero disables the connect timeout.
	#[serde(with = "duration_ms")]
	pub connect_timeout: Duration,
	pub read_buffer_size: usize,
	pub write_buffer_size: usize,
}

impl Default for Config {
	fn default() -> Self {
		Config {
			backend_min_pool: 1,
			backend_max_pool: 5,
			backend_idle_timeout: Duration::from_millis(60_000),
			peer_cleanup_interval: Duration::from_secs(10),
			peer_timeout: Duration::from_secs(15),
			connect_timeout: Duration::ZERO,
			read_buffer_size: 16 * 1024,
			write_buffer_size: 64 * 1024,
		}
	}
}

impl Config {
	/// Defaults overridden by `STRAND_*` environment variables, millisecond
	/// values for the durations.
	pub fn from_env() -> Config {
		let mut cfg = Config::default();
		if let Some(v) = parse_var::<usize>("STRAND_BACKEND_MIN_POOL") {
			cfg.backend_min_pool = v;
		}
		if let Some(v) = parse_var::<usize>("STRAND_BACKEND_MAX_POOL") {
			cfg.backend_max_pool = v;
		}
		if let Some(v) = parse_var::<u64>("STRAND_BACKEND_IDLE_TIMEOUT_MS") {
			cfg.backend_idle_timeout = Duration::from_millis(v);
		}
		if let Some(v) = parse_var::<u64>("STRAND_PEER_CLEANUP_INTERVAL_MS") {
			cfg.peer_cleanup_interval = Duration::from_millis(v);
		}
		if let Some(v) = parse_var::<u64>("STRAND_PEER_TIMEOUT_MS") {
			cfg.peer_timeout = Duration::from_millis(v);
		}
		if let Some(v) = parse_var::<u64>("STRAND_CONNECT_TIMEOUT_MS") {
			cfg.connect_timeout = Duration::from_millis(v);
		}
		if let Some(v) = parse_var::<usize>("STRAND_READ_BUFFER_SIZE") {
			cfg.read_buffer_size = v;
		}
		if let Some(v) = parse_var::<usize>("STRAND_WRITE_BUFFER_SIZE") {
			cfg.write_buffer_size = v;
		}
		cfg
	}
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Option<T> {
	let raw = std::env::var(name).ok()?;
	match raw.parse() {
		Ok(v) => Some(v),
		Err(_) => {
			tracing::warn!(%name, %raw, "ignoring unparseable environment override");
			None
		},
	}
}

mod duration_ms {
	use std::time::Duration;

	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
		s.serialize_u64(d.as_millis() as u64)
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
		Ok(Duration::from_millis(u64::deserialize(d)?))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_match_contract() {
		let cfg = Config::default();
		assert_eq!(cfg.backend_min_pool, 1);
		assert_eq!(cfg.backend_max_pool, 5);
		assert_eq!(cfg.backend_idle_timeout, Duration::from_millis(60_000));
		assert_eq!(cfg.peer_cleanup_interval, Duration::from_secs(10));
		assert_eq!(cfg.connect_timeout, Duration::ZERO);
	}

	#[test]
	fn roundtrips_through_serde() {
		let cfg = Config::default();
		let json = serde_json::to_string(&cfg).unwrap();
		let back: Config = serde_json::from_str(&json).unwrap();
		assert_eq!(back.backend_max_pool, cfg.backend_max_pool);
		assert_eq!(back.backend_idle_timeout, cfg.backend_idle_timeout);
	}
}
