#![forbid(unsafe_code)]

pub mod discord;

#[cfg(any(test, feature = "test-util"))]
pub mod memory;

use std::fmt;
use std::time::{Duration, SystemTime};

use tempvoice_domain::{ApplicationId, CommunityId, MessageId, RoleId, RoomId, RoomName, UserId};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Server → gateway control message.
#[derive(Debug)]
pub enum GatewayControl {
	/// Drop the current session and reconnect (resuming when possible).
	Reconnect,

	/// Request a graceful shutdown.
	Shutdown,
}

/// Platform member reference, as seen in a community.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberRef {
	pub id: UserId,
	/// Community nickname, falling back to global display name, then username.
	pub display_name: String,
	pub bot: bool,
}

impl MemberRef {
	pub fn new(id: UserId, display_name: impl Into<String>) -> Self {
		Self {
			id,
			display_name: display_name.into(),
			bot: false,
		}
	}
}

/// Room snapshot carried on events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomRef {
	pub id: RoomId,
	pub community: CommunityId,
	pub name: String,
	/// Parent category, if any.
	pub category: Option<RoomId>,
	pub position: i32,
}

/// Community the bot is part of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommunityRef {
	pub id: CommunityId,
	pub name: String,
}

/// Invite link reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InviteRef {
	pub code: String,
}

impl InviteRef {
	pub fn url(&self) -> String {
		format!("https://discord.gg/{}", self.code)
	}
}

/// Message reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRef {
	pub id: MessageId,
	pub room: RoomId,
	/// `None` for direct messages.
	pub community: Option<CommunityId>,
}

/// Handle used to answer an interaction privately.
#[derive(Debug, Clone)]
pub struct InteractionRef {
	pub id: String,
	pub token: SecretString,
}

/// Logical control operations requested through slash commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
	Rename { new_name: String },
	Lock,
	Unlock,
}

impl ControlCommand {
	pub fn name(&self) -> &'static str {
		match self {
			Self::Rename { .. } => "rename",
			Self::Lock => "lock",
			Self::Unlock => "unlock",
		}
	}
}

/// Buttons on the control panel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PanelAction {
	Rename,
	Lock,
	Unlock,
}

impl PanelAction {
	const PREFIX: &'static str = "tempvoice";

	pub const ALL: [PanelAction; 3] = [PanelAction::Rename, PanelAction::Lock, PanelAction::Unlock];

	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Rename => "rename",
			Self::Lock => "lock",
			Self::Unlock => "unlock",
		}
	}

	pub const fn label(self) -> &'static str {
		match self {
			Self::Rename => "Rename",
			Self::Lock => "Lock",
			Self::Unlock => "Unlock",
		}
	}

	/// Component id bound to a room: `tempvoice:<action>:<room>`.
	pub fn custom_id(self, room: RoomId) -> String {
		format!("{}:{}:{}", Self::PREFIX, self.as_str(), room)
	}

	/// Parse a component id produced by [`PanelAction::custom_id`].
	pub fn parse_custom_id(s: &str) -> Option<(PanelAction, RoomId)> {
		let mut parts = s.splitn(3, ':');
		if parts.next()? != Self::PREFIX {
			return None;
		}
		let action = match parts.next()? {
			"rename" => PanelAction::Rename,
			"lock" => PanelAction::Lock,
			"unlock" => PanelAction::Unlock,
			_ => return None,
		};
		let room = parts.next()?.parse().ok()?;
		Some((action, room))
	}
}

/// Control panel attached to the invitation direct message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlPanel {
	pub room: RoomId,
}

/// Slash command definition for registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
	pub name: &'static str,
	pub description: &'static str,
	pub options: Vec<CommandOptionSpec>,
}

/// String option on a slash command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOptionSpec {
	pub name: &'static str,
	pub description: &'static str,
	pub required: bool,
}

/// Room creation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateRoomRequest {
	pub community: CommunityId,
	pub name: RoomName,
	pub category: Option<RoomId>,
	pub position: i32,
}

/// Gateway session details reported on ready.
#[derive(Debug, Clone)]
pub struct ReadyInfo {
	pub user: UserId,
	pub application: Option<ApplicationId>,
	pub session_id: String,
}

/// Voice presence transition for one member.
#[derive(Debug, Clone)]
pub struct PresenceChange {
	pub community: CommunityId,
	pub member: MemberRef,
	pub previous: Option<RoomRef>,
	pub current: Option<RoomRef>,
	pub time: SystemTime,
}

/// Posted or edited message.
#[derive(Debug, Clone)]
pub struct MessageEvent {
	pub message: MessageRef,
	pub author: MemberRef,
	pub content: String,
	pub time: SystemTime,
}

impl MessageEvent {
	pub fn is_direct(&self) -> bool {
		self.message.community.is_none()
	}
}

/// Slash command invocation.
#[derive(Debug, Clone)]
pub struct CommandInvocation {
	pub interaction: InteractionRef,
	pub community: Option<CommunityId>,
	pub member: MemberRef,
	pub command: ControlCommand,
}

/// Control panel button press.
#[derive(Debug, Clone)]
pub struct PanelPress {
	pub interaction: InteractionRef,
	pub member: MemberRef,
	pub room: RoomId,
	pub action: PanelAction,
}

/// Platform → server notification, normalized.
#[derive(Debug, Clone)]
pub enum PlatformEvent {
	Ready(ReadyInfo),
	PresenceChanged(Box<PresenceChange>),
	MessagePosted(Box<MessageEvent>),
	MessageChanged(Box<MessageEvent>),
	MessageRemoved(MessageRef),
	Command(Box<CommandInvocation>),
	PanelPressed(Box<PanelPress>),
	RoomDeleted(RoomRef),
	Disconnected { detail: String },
}

impl PlatformEvent {
	/// Short event kind, for logs and metrics labels.
	pub fn kind(&self) -> &'static str {
		match self {
			Self::Ready(_) => "ready",
			Self::PresenceChanged(_) => "presence_changed",
			Self::MessagePosted(_) => "message_posted",
			Self::MessageChanged(_) => "message_changed",
			Self::MessageRemoved(_) => "message_removed",
			Self::Command(_) => "command",
			Self::PanelPressed(_) => "panel_pressed",
			Self::RoomDeleted(_) => "room_deleted",
			Self::Disconnected { .. } => "disconnected",
		}
	}
}

/// Outbound call failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlatformError {
	#[error("rate limited (retry after {retry_after:?})")]
	RateLimited { retry_after: Option<Duration> },
	#[error("request timed out")]
	Timeout,
	#[error("platform unavailable: {0}")]
	Unavailable(String),
	#[error("forbidden: {0}")]
	Forbidden(String),
	#[error("not found: {0}")]
	NotFound(String),
	#[error("rejected: {0}")]
	Rejected(String),
}

impl PlatformError {
	/// Rate limits, timeouts and outages may succeed on retry.
	pub fn is_transient(&self) -> bool {
		matches!(self, Self::RateLimited { .. } | Self::Timeout | Self::Unavailable(_))
	}

	pub fn retry_after(&self) -> Option<Duration> {
		match self {
			Self::RateLimited { retry_after } => *retry_after,
			_ => None,
		}
	}

	pub fn is_not_found(&self) -> bool {
		matches!(self, Self::NotFound(_))
	}
}

/// Outcome of a best-effort direct message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
	Delivered,
	Failed(PlatformError),
}

impl Delivery {
	pub fn is_delivered(&self) -> bool {
		matches!(self, Self::Delivered)
	}
}

impl From<Result<(), PlatformError>> for Delivery {
	fn from(res: Result<(), PlatformError>) -> Self {
		match res {
			Ok(()) => Self::Delivered,
			Err(e) => Self::Failed(e),
		}
	}
}

/// Outbound platform operations plus reads of the gateway-maintained presence cache.
#[async_trait::async_trait]
pub trait VoicePlatform: Send + Sync + 'static {
	async fn create_voice_room(&self, request: CreateRoomRequest) -> Result<RoomRef, PlatformError>;

	async fn move_user(&self, community: CommunityId, user: UserId, room: RoomId) -> Result<(), PlatformError>;

	async fn delete_room(&self, room: RoomId) -> Result<(), PlatformError>;

	async fn set_room_access(&self, room: RoomId, role: RoleId, connect_allowed: bool) -> Result<(), PlatformError>;

	async fn rename_room(&self, room: RoomId, name: &RoomName) -> Result<(), PlatformError>;

	async fn send_direct_message(
		&self,
		user: UserId,
		content: &str,
		controls: Option<&ControlPanel>,
	) -> Result<(), PlatformError>;

	async fn send_to_room(&self, room: RoomId, content: &str) -> Result<(), PlatformError>;

	/// Private (ephemeral) reply to a command or button press.
	async fn respond_to_interaction(&self, interaction: &InteractionRef, content: &str) -> Result<(), PlatformError>;

	async fn list_communities(&self) -> Result<Vec<CommunityRef>, PlatformError>;

	async fn list_invites(&self, community: CommunityId) -> Result<Vec<InviteRef>, PlatformError>;

	/// Room suitable for creating an invite in, if the community has one.
	async fn default_invite_room(&self, community: CommunityId) -> Result<Option<RoomId>, PlatformError>;

	async fn create_invite(&self, room: RoomId) -> Result<InviteRef, PlatformError>;

	async fn register_commands(&self, application: ApplicationId, specs: &[CommandSpec]) -> Result<(), PlatformError>;

	/// Current number of members in a voice room.
	fn occupant_count(&self, room: RoomId) -> usize;

	/// Voice room the user currently sits in within a community.
	fn current_room(&self, community: CommunityId, user: UserId) -> Option<RoomId>;

	/// Role every member of the community holds.
	fn default_access_role(&self, community: CommunityId) -> RoleId;
}

/// Helper types for wiring gateways.
pub type GatewayControlTx = mpsc::Sender<GatewayControl>;
pub type GatewayControlRx = mpsc::Receiver<GatewayControl>;
pub type PlatformEventTx = mpsc::Sender<PlatformEvent>;
pub type PlatformEventRx = mpsc::Receiver<PlatformEvent>;

/// Trait representing a runnable inbound event source.
#[async_trait::async_trait]
pub trait GatewayAdapter: Send + Sync + 'static {
	fn name(&self) -> &'static str;

	/// Run until shutdown or fatal error.
	async fn run(self: Box<Self>, control_rx: GatewayControlRx, events_tx: PlatformEventTx) -> anyhow::Result<()>;
}

/// Build a standard bounded channel pair.
pub fn bounded_gateway_channels(
	control_capacity: usize,
	events_capacity: usize,
) -> (GatewayControlTx, GatewayControlRx, PlatformEventTx, PlatformEventRx) {
	let (control_tx, control_rx) = mpsc::channel(control_capacity);
	let (events_tx, events_rx) = mpsc::channel(events_capacity);
	(control_tx, control_rx, events_tx, events_rx)
}

/// Generate an opaque session id.
pub fn new_session_id() -> String {
	Uuid::new_v4().to_string()
}

/// Wrapper that redacts in logs.
#[derive(Clone)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}

	pub fn is_empty(&self) -> bool {
		self.0.trim().is_empty()
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}
