#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use tracing::{info, warn};

use crate::util::secret::SecretString;

/// Default config path: `~/.huddle/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".huddle").join("config.toml"))
}

/// Load the server config from TOML and env overrides.
#[allow(dead_code)]
pub fn load_server_config() -> anyhow::Result<ServerConfig> {
	let path = default_config_path()?;
	load_server_config_from_path(&path)
}

/// Same as `load_server_config` but with an explicit config path.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

/// Server config (v1).
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub store: StoreSettings,
	pub redis: RedisSettings,
	pub agent: AgentSettings,
}

/// Listener and connection settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// WebSocket/HTTP bind address (host:port).
	pub bind: String,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// HMAC secret for stateless bearer tokens.
	pub auth_hmac_secret: Option<SecretString>,
	/// Maximum inbound text frame size in bytes.
	pub max_frame_bytes: usize,
	/// Per-connection outbound queue capacity.
	pub outbound_queue_capacity: usize,
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			bind: "127.0.0.1:8080".to_string(),
			metrics_bind: None,
			auth_hmac_secret: None,
			max_frame_bytes: huddle_protocol::DEFAULT_MAX_FRAME_BYTES,
			outbound_queue_capacity: 1024,
		}
	}
}

/// Persistent store settings.
#[derive(Debug, Clone, Default)]
pub struct StoreSettings {
	/// Postgres URL. When absent the server runs on the in-memory store
	/// (dev only: membership does not survive a restart).
	pub database_url: Option<String>,
}

/// Redis relay and job queue settings.
#[derive(Debug, Clone)]
pub struct RedisSettings {
	/// Redis URL. When absent the relay is disabled and the instance
	/// runs single-node.
	pub url: Option<String>,
	/// Shared pub/sub channel for cross-instance events.
	pub pubsub_channel: String,
	/// List key the background worker consumes agent jobs from.
	pub queue_name: String,
	/// Capacity of the outbound publish queue.
	pub publish_queue_capacity: usize,
	/// Subscriber reconnect backoff bounds.
	pub reconnect_min_delay: Duration,
	pub reconnect_max_delay: Duration,
}

impl Default for RedisSettings {
	fn default() -> Self {
		Self {
			url: None,
			pubsub_channel: "huddle_room_events".to_string(),
			queue_name: "huddle_agent_jobs".to_string(),
			publish_queue_capacity: 1024,
			reconnect_min_delay: Duration::from_millis(200),
			reconnect_max_delay: Duration::from_secs(10),
		}
	}
}

/// Agent bot settings.
#[derive(Debug, Clone)]
pub struct AgentSettings {
	/// Message prefix that addresses the agent bot.
	pub trigger_prefix: String,
	/// Deadline after which a pending agent job times out.
	pub job_timeout: Duration,
}

impl Default for AgentSettings {
	fn default() -> Self {
		Self {
			trigger_prefix: "@jarvis".to_string(),
			job_timeout: Duration::from_secs(120),
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	store: FileStoreSettings,

	#[serde(default)]
	redis: FileRedisSettings,

	#[serde(default)]
	agent: FileAgentSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	bind: Option<String>,
	metrics_bind: Option<String>,
	auth_hmac_secret: Option<String>,
	max_frame_bytes: Option<usize>,
	outbound_queue_capacity: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileStoreSettings {
	database_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileRedisSettings {
	url: Option<String>,
	pubsub_channel: Option<String>,
	queue_name: Option<String>,
	publish_queue_capacity: Option<usize>,
	reconnect_min_delay_ms: Option<u64>,
	reconnect_max_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileAgentSettings {
	trigger_prefix: Option<String>,
	job_timeout_secs: Option<u64>,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let defaults = ServerSettings::default();
		let redis_defaults = RedisSettings::default();
		let agent_defaults = AgentSettings::default();

		Self {
			server: ServerSettings {
				bind: file
					.server
					.bind
					.filter(|s| !s.trim().is_empty())
					.unwrap_or(defaults.bind),
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
				auth_hmac_secret: file
					.server
					.auth_hmac_secret
					.filter(|s| !s.trim().is_empty())
					.map(SecretString::new),
				max_frame_bytes: file.server.max_frame_bytes.unwrap_or(defaults.max_frame_bytes),
				outbound_queue_capacity: file
					.server
					.outbound_queue_capacity
					.unwrap_or(defaults.outbound_queue_capacity),
			},
			store: StoreSettings {
				database_url: file.store.database_url.filter(|s| !s.trim().is_empty()),
			},
			redis: RedisSettings {
				url: file.redis.url.filter(|s| !s.trim().is_empty()),
				pubsub_channel: file
					.redis
					.pubsub_channel
					.filter(|s| !s.trim().is_empty())
					.unwrap_or(redis_defaults.pubsub_channel),
				queue_name: file
					.redis
					.queue_name
					.filter(|s| !s.trim().is_empty())
					.unwrap_or(redis_defaults.queue_name),
				publish_queue_capacity: file
					.redis
					.publish_queue_capacity
					.unwrap_or(redis_defaults.publish_queue_capacity),
				reconnect_min_delay: file
					.redis
					.reconnect_min_delay_ms
					.map(Duration::from_millis)
					.unwrap_or(redis_defaults.reconnect_min_delay),
				reconnect_max_delay: file
					.redis
					.reconnect_max_delay_ms
					.map(Duration::from_millis)
					.unwrap_or(redis_defaults.reconnect_max_delay),
			},
			agent: AgentSettings {
				trigger_prefix: file
					.agent
					.trigger_prefix
					.filter(|s| !s.trim().is_empty())
					.unwrap_or(agent_defaults.trigger_prefix),
				job_timeout: file
					.agent
					.job_timeout_secs
					.filter(|v| *v > 0)
					.map(Duration::from_secs)
					.unwrap_or(agent_defaults.job_timeout),
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

fn apply_env_overrides(cfg: &mut ServerConfig) {
	if let Ok(v) = std::env::var("HUDDLE_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.bind = v;
			info!("server config: bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("HUDDLE_METRICS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.metrics_bind = Some(v);
			info!("server config: metrics_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("HUDDLE_AUTH_HMAC_SECRET") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.auth_hmac_secret = Some(SecretString::new(v));
			info!("server auth: auth_hmac_secret overridden by env");
		}
	}

	if let Ok(v) = std::env::var("HUDDLE_MAX_FRAME_BYTES")
		&& let Ok(bytes) = v.trim().parse::<usize>()
	{
		cfg.server.max_frame_bytes = bytes;
		info!(bytes, "server config: max_frame_bytes overridden by env");
	}

	if let Ok(v) = std::env::var("HUDDLE_DATABASE_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.store.database_url = Some(v);
			info!("store config: database_url overridden by env");
		}
	}

	if let Ok(v) = std::env::var("HUDDLE_REDIS_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.redis.url = Some(v);
			info!("redis config: url overridden by env");
		}
	}

	if let Ok(v) = std::env::var("HUDDLE_PUBSUB_CHANNEL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.redis.pubsub_channel = v;
			info!("redis config: pubsub_channel overridden by env");
		}
	}

	if let Ok(v) = std::env::var("HUDDLE_QUEUE_NAME") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.redis.queue_name = v;
			info!("redis config: queue_name overridden by env");
		}
	}

	if let Ok(v) = std::env::var("HUDDLE_AGENT_TRIGGER_PREFIX") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.agent.trigger_prefix = v;
			info!("agent config: trigger_prefix overridden by env");
		}
	}

	if let Ok(v) = std::env::var("HUDDLE_AGENT_JOB_TIMEOUT_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
		&& secs > 0
	{
		cfg.agent.job_timeout = Duration::from_secs(secs);
		info!(secs, "agent config: job_timeout overridden by env");
	}

	if cfg.server.auth_hmac_secret.is_none() {
		warn!("server auth: no auth_hmac_secret configured; all connections will be rejected");
	}

	if cfg.redis.reconnect_min_delay > cfg.redis.reconnect_max_delay {
		let min = cfg.redis.reconnect_min_delay;
		let max = cfg.redis.reconnect_max_delay;
		warn!(
			min_ms = min.as_millis() as u64,
			max_ms = max.as_millis() as u64,
			"redis config: reconnect_min_delay > reconnect_max_delay; swapping"
		);
		cfg.redis.reconnect_min_delay = max;
		cfg.redis.reconnect_max_delay = min;
	}
}
