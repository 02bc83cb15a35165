#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use tempvoice_domain::{ParseIdError, RoomId, RoomName, UserId};
use tempvoice_platform::{
	CommandInvocation, CommandOptionSpec, CommandSpec, ControlCommand, Delivery, InteractionRef, MessageEvent, PanelAction,
	PanelPress, PlatformError, VoicePlatform,
};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::server::access::AccessController;
use crate::server::cooldown::CooldownGuard;
use crate::server::pending::{PendingRename, PendingRenames};
use crate::server::retry::RetryPolicy;
use crate::util::time::deadline_after;

/// Why a control request was refused. `Display` is the text shown to the requester.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ControlError {
	#[error("You must be in your temporary voice channel.")]
	NotInVoice,
	#[error("You can only manage temporary channels.")]
	NotManaged,
	#[error("You must be in this temporary voice channel to manage it.")]
	NotInChannel,
	#[error("⏳ Slow down! Try again in {}s.", .remaining.as_secs().max(1))]
	RateLimited { remaining: Duration },
	#[error("❌ Invalid channel name: {0}.")]
	InvalidName(ParseIdError),
	#[error("❌ The request failed: {0}.")]
	Platform(PlatformError),
}

/// Slash commands registered on ready.
pub fn command_specs() -> Vec<CommandSpec> {
	vec![
		CommandSpec {
			name: "rename",
			description: "Rename your temporary voice channel.",
			options: vec![CommandOptionSpec {
				name: "new_name",
				description: "New channel name",
				required: true,
			}],
		},
		CommandSpec {
			name: "lock",
			description: "Lock your temporary voice channel.",
			options: Vec::new(),
		},
		CommandSpec {
			name: "unlock",
			description: "Unlock your temporary voice channel.",
			options: Vec::new(),
		},
	]
}

#[derive(Debug, Clone)]
pub struct ControlSettings {
	/// Per-user rate limit on control actions.
	pub cooldown: Duration,
	/// How long a panel rename waits for the follow-up message.
	pub rename_timeout: Duration,
	pub retry: RetryPolicy,
}

impl Default for ControlSettings {
	fn default() -> Self {
		Self {
			cooldown: Duration::from_secs(5),
			rename_timeout: Duration::from_secs(60),
			retry: RetryPolicy::default(),
		}
	}
}

/// Rename/lock/unlock, reachable through slash commands and the DM control panel.
pub struct ControlSurface {
	platform: Arc<dyn VoicePlatform>,
	access: Arc<AccessController>,
	pending: PendingRenames,
	rate: CooldownGuard,
	settings: ControlSettings,
}

impl ControlSurface {
	pub fn new(platform: Arc<dyn VoicePlatform>, access: Arc<AccessController>, settings: ControlSettings) -> Self {
		Self {
			platform,
			access,
			pending: PendingRenames::new(),
			rate: CooldownGuard::new(settings.cooldown),
			settings,
		}
	}

	pub fn pending(&self) -> &PendingRenames {
		&self.pending
	}

	/// Drop inert rate-limit entries.
	pub fn purge_rate_limits(&self) -> usize {
		self.rate.purge_expired()
	}

	fn check_rate(&self, user: UserId) -> Result<(), ControlError> {
		if self.rate.permit(user) {
			return Ok(());
		}
		let remaining = self.rate.remaining(user).unwrap_or(self.rate.hold());
		Err(ControlError::RateLimited { remaining })
	}

	async fn reply(&self, interaction: &InteractionRef, content: &str) {
		if let Err(e) = self.platform.respond_to_interaction(interaction, content).await {
			warn!(interaction = %interaction.id, error = %e, "failed to answer interaction");
		}
	}

	async fn notify(&self, user: UserId, content: &str) -> Delivery {
		let delivery = Delivery::from(self.platform.send_direct_message(user, content, None).await);
		if let Delivery::Failed(e) = &delivery {
			metrics::counter!("tempvoice_dm_delivery_failed_total").increment(1);
			debug!(%user, error = %e, "direct message not delivered");
		}
		delivery
	}

	/// Rename after validating the name and re-checking membership.
	pub async fn rename(&self, requester: UserId, room: RoomId, raw: &str) -> Result<RoomName, ControlError> {
		let name = RoomName::new(raw).map_err(ControlError::InvalidName)?;
		self.access.authorize(requester, room)?;
		self.settings
			.retry
			.run("rename_room", || self.platform.rename_room(room, &name))
			.await
			.map_err(ControlError::Platform)?;
		info!(%room, %requester, name = %name, "channel renamed");
		Ok(name)
	}

	async fn run_command(&self, inv: &CommandInvocation) -> Result<String, ControlError> {
		let community = inv.community.ok_or(ControlError::NotInVoice)?;
		let requester = inv.member.id;
		self.check_rate(requester)?;

		let room = self
			.platform
			.current_room(community, requester)
			.ok_or(ControlError::NotInVoice)?;

		match &inv.command {
			ControlCommand::Rename { new_name } => {
				let name = self.rename(requester, room, new_name).await?;
				Ok(format!("✅ Renamed to **{name}**."))
			}
			ControlCommand::Lock => {
				self.access.lock(requester, room).await?;
				Ok("🔒 Channel locked.".to_string())
			}
			ControlCommand::Unlock => {
				self.access.unlock(requester, room).await?;
				Ok("🔓 Channel unlocked.".to_string())
			}
		}
	}

	/// Slash command entry point; always answers privately.
	pub async fn on_command(&self, inv: &CommandInvocation) -> Result<String, ControlError> {
		let res = self.run_command(inv).await;
		let text = match &res {
			Ok(text) => text.clone(),
			Err(e) => e.to_string(),
		};
		debug!(command = inv.command.name(), user = %inv.member.id, ok = res.is_ok(), "command handled");
		self.reply(&inv.interaction, &text).await;
		res
	}

	async fn run_panel(self: &Arc<Self>, press: &PanelPress) -> Result<String, ControlError> {
		let requester = press.member.id;
		self.check_rate(requester)?;

		match press.action {
			PanelAction::Rename => {
				self.access.authorize(requester, press.room)?;
				self.begin_rename(requester, press.room);
				Ok(format!(
					"Send the new channel name as a direct message within {}s:",
					self.settings.rename_timeout.as_secs()
				))
			}
			PanelAction::Lock => {
				self.access.lock(requester, press.room).await?;
				Ok("🔒 Channel locked.".to_string())
			}
			PanelAction::Unlock => {
				self.access.unlock(requester, press.room).await?;
				Ok("🔓 Channel unlocked.".to_string())
			}
		}
	}

	/// Control panel entry point; always answers privately.
	pub async fn on_panel(self: &Arc<Self>, press: &PanelPress) -> Result<String, ControlError> {
		let res = self.run_panel(press).await;
		let text = match &res {
			Ok(text) => text.clone(),
			Err(e) => e.to_string(),
		};
		debug!(action = press.action.as_str(), user = %press.member.id, ok = res.is_ok(), "panel press handled");
		self.reply(&press.interaction, &text).await;
		res
	}

	fn begin_rename(self: &Arc<Self>, user: UserId, room: RoomId) {
		let request_id = Uuid::new_v4();
		let deadline = deadline_after(Instant::now(), self.settings.rename_timeout);

		let this = Arc::clone(self);
		let timer = tokio::spawn(async move {
			tokio::time::sleep_until(deadline).await;
			this.expire_rename(user, request_id).await;
		});

		let pending = PendingRename::new(request_id, room, deadline).with_timeout(timer);
		if let Some(previous) = self.pending.insert(user, pending) {
			debug!(%user, %previous, "replaced pending rename");
		}
	}

	async fn expire_rename(&self, user: UserId, request_id: Uuid) {
		let Some(room) = self.pending.take_expired(user, request_id) else {
			return;
		};
		info!(%user, %room, "pending rename expired");
		self.notify(user, "⌛ Rename request expired; the channel name was not changed.")
			.await;
	}

	/// Feed a direct message to a pending rename. Returns whether it was consumed.
	pub async fn on_direct_message(&self, ev: &MessageEvent) -> bool {
		if !ev.is_direct() || ev.author.bot {
			return false;
		}
		let Some(room) = self.pending.take(ev.author.id) else {
			return false;
		};

		let text = match self.rename(ev.author.id, room, &ev.content).await {
			Ok(name) => format!("✅ Renamed to **{name}**."),
			Err(e) => e.to_string(),
		};
		self.notify(ev.author.id, &text).await;
		true
	}

	/// Cancel rename waits for a channel that is going away.
	pub async fn on_room_deleted(&self, room: RoomId) {
		for user in self.pending.cancel_room(room) {
			info!(%user, %room, "pending rename cancelled by channel deletion");
			self.notify(user, "Your temporary channel was deleted, so the pending rename was cancelled.")
				.await;
		}
	}
}
