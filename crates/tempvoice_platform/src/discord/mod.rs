#![forbid(unsafe_code)]

mod cache;
mod gateway;
mod model;
mod rest;

#[cfg(test)]
mod tests;

use std::sync::Arc;
use std::time::Duration;

pub use cache::DiscordCache;
pub use gateway::DiscordGateway;
pub use rest::DiscordRest;

use crate::SecretString;

pub const DEFAULT_API_BASE_URL: &str = "https://discord.com/api/v10";
pub const DEFAULT_GATEWAY_URL: &str = "wss://gateway.discord.gg/?v=10&encoding=json";

/// `CONNECT` bit of a permission overwrite.
pub const PERMISSION_CONNECT: u64 = 1 << 20;

pub const INTENT_GUILDS: u64 = 1 << 0;
pub const INTENT_GUILD_VOICE_STATES: u64 = 1 << 7;
pub const INTENT_GUILD_MESSAGES: u64 = 1 << 9;
pub const INTENT_DIRECT_MESSAGES: u64 = 1 << 12;
pub const INTENT_MESSAGE_CONTENT: u64 = 1 << 15;

pub const DEFAULT_INTENTS: u64 =
	INTENT_GUILDS | INTENT_GUILD_VOICE_STATES | INTENT_GUILD_MESSAGES | INTENT_DIRECT_MESSAGES | INTENT_MESSAGE_CONTENT;

/// Discord client configuration.
#[derive(Debug, Clone)]
pub struct DiscordConfig {
	pub token: SecretString,
	pub api_base_url: String,
	pub gateway_url: String,
	pub intents: u64,
	pub request_timeout: Duration,
	pub reconnect_min_delay: Duration,
	pub reconnect_max_delay: Duration,
}

impl DiscordConfig {
	pub fn new(token: SecretString) -> Self {
		Self {
			token,
			api_base_url: DEFAULT_API_BASE_URL.to_string(),
			gateway_url: DEFAULT_GATEWAY_URL.to_string(),
			intents: DEFAULT_INTENTS,
			request_timeout: Duration::from_secs(10),
			reconnect_min_delay: Duration::from_secs(1),
			reconnect_max_delay: Duration::from_secs(60),
		}
	}
}

/// Build a REST client and gateway adapter sharing one presence cache.
pub fn connect(cfg: DiscordConfig) -> anyhow::Result<(DiscordRest, DiscordGateway)> {
	let cache = Arc::new(DiscordCache::default());
	let rest = DiscordRest::new(&cfg, Arc::clone(&cache))?;
	let gateway = DiscordGateway::new(cfg, cache);
	Ok((rest, gateway))
}
