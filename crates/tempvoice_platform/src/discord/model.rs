#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use tempvoice_domain::{ApplicationId, CommunityId, MessageId, RoomId, UserId};

pub(crate) const OP_DISPATCH: u8 = 0;
pub(crate) const OP_HEARTBEAT: u8 = 1;
pub(crate) const OP_IDENTIFY: u8 = 2;
pub(crate) const OP_RESUME: u8 = 6;
pub(crate) const OP_RECONNECT: u8 = 7;
pub(crate) const OP_INVALID_SESSION: u8 = 9;
pub(crate) const OP_HELLO: u8 = 10;
pub(crate) const OP_HEARTBEAT_ACK: u8 = 11;

pub(crate) const CHANNEL_TYPE_TEXT: u8 = 0;
pub(crate) const CHANNEL_TYPE_VOICE: u8 = 2;

pub(crate) const INTERACTION_APPLICATION_COMMAND: u8 = 2;
pub(crate) const INTERACTION_MESSAGE_COMPONENT: u8 = 3;

/// Every gateway frame: `{op, d, s, t}`.
#[derive(Debug, Deserialize)]
pub(crate) struct GatewayFrame {
	pub(crate) op: u8,
	#[serde(default)]
	pub(crate) d: serde_json::Value,
	#[serde(default)]
	pub(crate) s: Option<u64>,
	#[serde(default)]
	pub(crate) t: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Hello {
	pub(crate) heartbeat_interval: u64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Ready {
	pub(crate) session_id: String,
	#[serde(default)]
	pub(crate) resume_gateway_url: Option<String>,
	pub(crate) user: DiscordUser,
	#[serde(default)]
	pub(crate) application: Option<PartialApplication>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PartialApplication {
	pub(crate) id: ApplicationId,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct DiscordUser {
	pub(crate) id: UserId,
	#[serde(default)]
	pub(crate) username: String,
	#[serde(default)]
	pub(crate) global_name: Option<String>,
	#[serde(default)]
	pub(crate) bot: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct GuildMember {
	#[serde(default)]
	pub(crate) user: Option<DiscordUser>,
	#[serde(default)]
	pub(crate) nick: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct GuildCreate {
	pub(crate) id: CommunityId,
	#[serde(default)]
	pub(crate) name: Option<String>,
	#[serde(default)]
	pub(crate) unavailable: bool,
	#[serde(default)]
	pub(crate) channels: Vec<Channel>,
	#[serde(default)]
	pub(crate) voice_states: Vec<VoiceState>,
	#[serde(default)]
	pub(crate) system_channel_id: Option<RoomId>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct GuildDelete {
	pub(crate) id: CommunityId,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct Channel {
	pub(crate) id: RoomId,
	#[serde(rename = "type")]
	pub(crate) kind: u8,
	#[serde(default)]
	pub(crate) guild_id: Option<CommunityId>,
	#[serde(default)]
	pub(crate) name: Option<String>,
	#[serde(default)]
	pub(crate) parent_id: Option<RoomId>,
	#[serde(default)]
	pub(crate) position: Option<i32>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct VoiceState {
	#[serde(default)]
	pub(crate) guild_id: Option<CommunityId>,
	pub(crate) user_id: UserId,
	#[serde(default)]
	pub(crate) channel_id: Option<RoomId>,
	#[serde(default)]
	pub(crate) member: Option<GuildMember>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Message {
	pub(crate) id: MessageId,
	pub(crate) channel_id: RoomId,
	#[serde(default)]
	pub(crate) guild_id: Option<CommunityId>,
	#[serde(default)]
	pub(crate) author: Option<DiscordUser>,
	#[serde(default)]
	pub(crate) member: Option<GuildMember>,
	#[serde(default)]
	pub(crate) content: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct MessageDelete {
	pub(crate) id: MessageId,
	pub(crate) channel_id: RoomId,
	#[serde(default)]
	pub(crate) guild_id: Option<CommunityId>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Interaction {
	pub(crate) id: String,
	pub(crate) token: String,
	#[serde(rename = "type")]
	pub(crate) kind: u8,
	#[serde(default)]
	pub(crate) guild_id: Option<CommunityId>,
	#[serde(default)]
	pub(crate) member: Option<GuildMember>,
	#[serde(default)]
	pub(crate) user: Option<DiscordUser>,
	#[serde(default)]
	pub(crate) data: Option<InteractionData>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct InteractionData {
	#[serde(default)]
	pub(crate) name: Option<String>,
	#[serde(default)]
	pub(crate) custom_id: Option<String>,
	#[serde(default)]
	pub(crate) options: Vec<InteractionOption>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct InteractionOption {
	pub(crate) name: String,
	#[serde(default)]
	pub(crate) value: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PartialGuild {
	pub(crate) id: CommunityId,
	#[serde(default)]
	pub(crate) name: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Invite {
	pub(crate) code: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct DmChannel {
	pub(crate) id: RoomId,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RateLimitBody {
	#[serde(default)]
	pub(crate) retry_after: Option<f64>,
}

#[derive(Debug, Serialize)]
pub(crate) struct CreateChannelBody<'a> {
	pub(crate) name: &'a str,
	#[serde(rename = "type")]
	pub(crate) kind: u8,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub(crate) parent_id: Option<RoomId>,
	pub(crate) position: i32,
}

#[derive(Debug, Serialize)]
pub(crate) struct ModifyMemberBody {
	pub(crate) channel_id: RoomId,
}

#[derive(Debug, Serialize)]
pub(crate) struct ModifyChannelBody<'a> {
	pub(crate) name: &'a str,
}

/// Role overwrite; `allow`/`deny` are stringified bitsets.
#[derive(Debug, Serialize)]
pub(crate) struct PermissionOverwriteBody {
	#[serde(rename = "type")]
	pub(crate) kind: u8,
	pub(crate) allow: String,
	pub(crate) deny: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct CreateDmBody {
	pub(crate) recipient_id: UserId,
}

#[derive(Debug, Serialize)]
pub(crate) struct CreateMessageBody<'a> {
	pub(crate) content: &'a str,
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub(crate) components: Vec<ActionRow>,
}

#[derive(Debug, Serialize)]
pub(crate) struct ActionRow {
	#[serde(rename = "type")]
	pub(crate) kind: u8,
	pub(crate) components: Vec<Button>,
}

#[derive(Debug, Serialize)]
pub(crate) struct Button {
	#[serde(rename = "type")]
	pub(crate) kind: u8,
	pub(crate) style: u8,
	pub(crate) label: &'static str,
	pub(crate) custom_id: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct InteractionResponseBody<'a> {
	#[serde(rename = "type")]
	pub(crate) kind: u8,
	pub(crate) data: InteractionResponseData<'a>,
}

#[derive(Debug, Serialize)]
pub(crate) struct InteractionResponseData<'a> {
	pub(crate) content: &'a str,
	pub(crate) flags: u64,
}

#[derive(Debug, Serialize)]
pub(crate) struct CreateInviteBody {
	pub(crate) max_age: u32,
	pub(crate) unique: bool,
}

#[derive(Debug, Serialize)]
pub(crate) struct ApplicationCommandBody<'a> {
	pub(crate) name: &'a str,
	pub(crate) description: &'a str,
	#[serde(rename = "type")]
	pub(crate) kind: u8,
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub(crate) options: Vec<ApplicationCommandOptionBody<'a>>,
}

#[derive(Debug, Serialize)]
pub(crate) struct ApplicationCommandOptionBody<'a> {
	#[serde(rename = "type")]
	pub(crate) kind: u8,
	pub(crate) name: &'a str,
	pub(crate) description: &'a str,
	pub(crate) required: bool,
}
