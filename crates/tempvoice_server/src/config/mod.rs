#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use tempvoice_domain::RoomId;
use tempvoice_platform::SecretString;
use tracing::{info, warn};

pub const DEFAULT_TRIGGER_ROOM_NAME: &str = "Create Voice Channel";

/// Upper bound for configured cooldowns and the rename wait (one week).
const MAX_WAIT_SECS: u64 = 7 * 86_400;

fn bounded_secs(secs: u64) -> Duration {
	Duration::from_secs(secs.min(MAX_WAIT_SECS))
}

/// Default config path: `~/.tempvoice/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".tempvoice").join("config.toml"))
}

/// Load the bot config from TOML at `path`, then apply env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());

	Ok(cfg)
}

/// Bot config.
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub discord: DiscordSettings,
	pub lifecycle: LifecycleSettings,
	pub server: ServerSettings,
}

/// Discord connection settings.
#[derive(Debug, Clone, Default)]
pub struct DiscordSettings {
	/// Bot token. Required.
	pub token: Option<SecretString>,
	/// REST base URL override.
	pub api_base_url: Option<String>,
	/// Gateway URL override.
	pub gateway_url: Option<String>,
	pub reconnect_min_delay: Option<Duration>,
	pub reconnect_max_delay: Option<Duration>,
}

/// Channel lifecycle tuning.
#[derive(Debug, Clone)]
pub struct LifecycleSettings {
	/// Name of the room that triggers creation (exact match).
	pub trigger_room_name: String,
	/// Text room mirrored audit lines go to; mirroring is off when unset.
	pub audit_sink_room: Option<RoomId>,
	/// Per-user rate limit on rename/lock/unlock.
	pub cooldown: Duration,
	/// Per-user hold between channel creations.
	pub cooldown_hold: Duration,
	/// How long a panel rename waits for the new name.
	pub rename_timeout: Duration,
	/// Attempts for retryable platform calls.
	pub max_retries: u32,
	pub retry_base_delay: Duration,
}

impl Default for LifecycleSettings {
	fn default() -> Self {
		Self {
			trigger_room_name: DEFAULT_TRIGGER_ROOM_NAME.to_string(),
			audit_sink_room: None,
			cooldown: Duration::from_secs(5),
			cooldown_hold: Duration::from_secs(15),
			rename_timeout: Duration::from_secs(60),
			max_retries: 3,
			retry_base_delay: Duration::from_millis(500),
		}
	}
}

/// Process-level settings.
#[derive(Debug, Clone, Default)]
pub struct ServerSettings {
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	discord: FileDiscordSettings,

	#[serde(default)]
	lifecycle: FileLifecycleSettings,

	#[serde(default)]
	server: FileServerSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileDiscordSettings {
	token: Option<String>,
	api_base_url: Option<String>,
	gateway_url: Option<String>,
	reconnect_min_delay_ms: Option<u64>,
	reconnect_max_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileLifecycleSettings {
	trigger_room_name: Option<String>,
	audit_sink_room: Option<RoomId>,
	cooldown_secs: Option<u64>,
	cooldown_hold_secs: Option<u64>,
	rename_timeout_secs: Option<u64>,
	max_retries: Option<u32>,
	retry_base_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	metrics_bind: Option<String>,
	health_bind: Option<String>,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let defaults = LifecycleSettings::default();

		let lifecycle = LifecycleSettings {
			trigger_room_name: file
				.lifecycle
				.trigger_room_name
				.filter(|s| !s.trim().is_empty())
				.unwrap_or(defaults.trigger_room_name),
			audit_sink_room: file.lifecycle.audit_sink_room.or(defaults.audit_sink_room),
			cooldown: file.lifecycle.cooldown_secs.map(bounded_secs).unwrap_or(defaults.cooldown),
			cooldown_hold: file
				.lifecycle
				.cooldown_hold_secs
				.map(bounded_secs)
				.unwrap_or(defaults.cooldown_hold),
			rename_timeout: file
				.lifecycle
				.rename_timeout_secs
				.filter(|v| *v > 0)
				.map(bounded_secs)
				.unwrap_or(defaults.rename_timeout),
			max_retries: file.lifecycle.max_retries.filter(|v| *v > 0).unwrap_or(defaults.max_retries),
			retry_base_delay: file
				.lifecycle
				.retry_base_delay_ms
				.map(Duration::from_millis)
				.unwrap_or(defaults.retry_base_delay),
		};

		Self {
			discord: DiscordSettings {
				token: file.discord.token.filter(|s| !s.trim().is_empty()).map(SecretString::new),
				api_base_url: file.discord.api_base_url.filter(|s| !s.trim().is_empty()),
				gateway_url: file.discord.gateway_url.filter(|s| !s.trim().is_empty()),
				reconnect_min_delay: file.discord.reconnect_min_delay_ms.map(Duration::from_millis),
				reconnect_max_delay: file.discord.reconnect_max_delay_ms.map(Duration::from_millis),
			},
			lifecycle,
			server: ServerSettings {
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
				health_bind: file.server.health_bind.filter(|s| !s.trim().is_empty()),
			},
		}
	}

	/// Bot token, or a startup error naming where to put it.
	pub fn require_token(&self) -> anyhow::Result<SecretString> {
		self.discord.token.clone().ok_or_else(|| {
			anyhow!("no discord token configured (set TEMPVOICE_DISCORD_TOKEN or discord.token in the config file)")
		})
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

fn non_empty(v: Option<String>) -> Option<String> {
	v.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn apply_env_overrides(cfg: &mut ServerConfig, env: impl Fn(&str) -> Option<String>) {
	let token = ["TEMPVOICE_DISCORD_TOKEN", "DISCORD_TOKEN", "discord_token"]
		.into_iter()
		.find_map(|key| non_empty(env(key)).map(|v| (key, v)));
	if let Some((key, v)) = token {
		cfg.discord.token = Some(SecretString::new(v));
		info!(env = key, "discord config: token overridden by env");
	}

	if let Some(v) = non_empty(env("TEMPVOICE_DISCORD_API_BASE_URL")) {
		cfg.discord.api_base_url = Some(v);
		info!("discord config: api_base_url overridden by env");
	}

	if let Some(v) = non_empty(env("TEMPVOICE_DISCORD_GATEWAY_URL")) {
		cfg.discord.gateway_url = Some(v);
		info!("discord config: gateway_url overridden by env");
	}

	if let Some(v) = non_empty(env("TEMPVOICE_TRIGGER_ROOM_NAME")) {
		info!(name = %v, "lifecycle config: trigger_room_name overridden by env");
		cfg.lifecycle.trigger_room_name = v;
	}

	if let Some(v) = non_empty(env("TEMPVOICE_AUDIT_SINK_ROOM")) {
		match v.parse::<RoomId>() {
			Ok(room) => {
				cfg.lifecycle.audit_sink_room = Some(room);
				info!(%room, "lifecycle config: audit_sink_room overridden by env");
			}
			Err(e) => warn!(error = %e, "lifecycle config: ignoring invalid TEMPVOICE_AUDIT_SINK_ROOM"),
		}
	}

	if let Some(v) = env("TEMPVOICE_COOLDOWN_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
	{
		cfg.lifecycle.cooldown = bounded_secs(secs);
		info!(secs, "lifecycle config: cooldown overridden by env");
	}

	if let Some(v) = env("TEMPVOICE_COOLDOWN_HOLD_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
	{
		cfg.lifecycle.cooldown_hold = bounded_secs(secs);
		info!(secs, "lifecycle config: cooldown_hold overridden by env");
	}

	if let Some(v) = env("TEMPVOICE_RENAME_TIMEOUT_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
		&& secs > 0
	{
		cfg.lifecycle.rename_timeout = bounded_secs(secs);
		info!(secs, "lifecycle config: rename_timeout overridden by env");
	}

	if let Some(v) = env("TEMPVOICE_MAX_RETRIES")
		&& let Ok(attempts) = v.trim().parse::<u32>()
		&& attempts > 0
	{
		cfg.lifecycle.max_retries = attempts;
		info!(attempts, "lifecycle config: max_retries overridden by env");
	}

	if let Some(v) = non_empty(env("TEMPVOICE_METRICS_BIND")) {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = non_empty(env("TEMPVOICE_HEALTH_BIND")) {
		cfg.server.health_bind = Some(v);
		info!("server config: health_bind overridden by env");
	}

	if let (Some(min), Some(max)) = (cfg.discord.reconnect_min_delay, cfg.discord.reconnect_max_delay)
		&& min > max
	{
		warn!(
			min_ms = min.as_millis(),
			max_ms = max.as_millis(),
			"discord config: reconnect_min_delay > reconnect_max_delay; swapping"
		);
		cfg.discord.reconnect_min_delay = Some(max);
		cfg.discord.reconnect_max_delay = Some(min);
	}
}
