#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, HeaderMap, RETRY_AFTER};
use serde::de::DeserializeOwned;
use tempvoice_domain::{ApplicationId, CommunityId, RoleId, RoomId, RoomName, UserId};
use tracing::debug;

use super::cache::DiscordCache;
use super::model::{
	ActionRow, ApplicationCommandBody, ApplicationCommandOptionBody, Button, CHANNEL_TYPE_VOICE, Channel, CreateChannelBody,
	CreateDmBody, CreateInviteBody, CreateMessageBody, DmChannel, InteractionResponseBody, InteractionResponseData, Invite,
	ModifyChannelBody, ModifyMemberBody, PartialGuild, PermissionOverwriteBody, RateLimitBody,
};
use super::{DiscordConfig, PERMISSION_CONNECT};
use crate::{
	CommandSpec, CommunityRef, ControlPanel, CreateRoomRequest, InteractionRef, InviteRef, PanelAction, PlatformError, RoomRef,
	SecretString, VoicePlatform,
};

/// Discord caps message content at 2000 characters.
const MAX_MESSAGE_CHARS: usize = 2000;

const FLAG_EPHEMERAL: u64 = 1 << 6;
const INTERACTION_CALLBACK_CHANNEL_MESSAGE: u8 = 4;
const COMPONENT_ACTION_ROW: u8 = 1;
const COMPONENT_BUTTON: u8 = 2;
const OVERWRITE_TYPE_ROLE: u8 = 0;
const COMMAND_TYPE_CHAT_INPUT: u8 = 1;
const OPTION_TYPE_STRING: u8 = 3;

fn button_style(action: PanelAction) -> u8 {
	match action {
		PanelAction::Rename => 1,
		PanelAction::Lock => 4,
		PanelAction::Unlock => 3,
	}
}

pub(crate) fn retry_after_from_headers(headers: &HeaderMap) -> Option<Duration> {
	let v = headers.get(RETRY_AFTER)?.to_str().ok()?;
	let secs = v.trim().parse::<f64>().ok()?;
	if secs.is_finite() && secs >= 0.0 {
		Some(Duration::from_secs_f64(secs))
	} else {
		None
	}
}

/// Map a non-success HTTP response to the platform error taxonomy.
pub(crate) fn classify_status(
	status: StatusCode,
	header_retry_after: Option<Duration>,
	body: &str,
	label: &str,
) -> PlatformError {
	let detail = format!("{label}: status={status} body={}", body.trim());

	if status == StatusCode::TOO_MANY_REQUESTS {
		let retry_after = header_retry_after.or_else(|| {
			serde_json::from_str::<RateLimitBody>(body)
				.ok()
				.and_then(|b| b.retry_after)
				.filter(|s| s.is_finite() && *s >= 0.0)
				.map(Duration::from_secs_f64)
		});
		return PlatformError::RateLimited { retry_after };
	}

	match status {
		StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => PlatformError::Forbidden(detail),
		StatusCode::NOT_FOUND => PlatformError::NotFound(detail),
		StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => PlatformError::Timeout,
		s if s.is_server_error() => PlatformError::Unavailable(detail),
		_ => PlatformError::Rejected(detail),
	}
}

fn clamp_content(content: &str) -> String {
	if content.chars().count() <= MAX_MESSAGE_CHARS {
		return content.to_string();
	}
	let mut out: String = content.chars().take(MAX_MESSAGE_CHARS - 1).collect();
	out.push('…');
	out
}

/// REST side of the Discord integration.
#[derive(Clone, Debug)]
pub struct DiscordRest {
	http: reqwest::Client,
	base_url: String,
	token: SecretString,
	cache: Arc<DiscordCache>,
}

impl DiscordRest {
	pub(crate) fn new(cfg: &DiscordConfig, cache: Arc<DiscordCache>) -> anyhow::Result<Self> {
		let http = reqwest::Client::builder()
			.timeout(cfg.request_timeout)
			.user_agent(concat!("DiscordBot (tempvoice, ", env!("CARGO_PKG_VERSION"), ")"))
			.build()
			.context("build discord http client")?;

		Ok(Self {
			http,
			base_url: cfg.api_base_url.trim_end_matches('/').to_string(),
			token: cfg.token.clone(),
			cache,
		})
	}

	fn url(&self, path: &str) -> String {
		format!("{}{}", self.base_url, path)
	}

	async fn send(&self, req: reqwest::RequestBuilder, label: &'static str) -> Result<reqwest::Response, PlatformError> {
		let resp = req
			.header(AUTHORIZATION, format!("Bot {}", self.token.expose()))
			.send()
			.await
			.map_err(|e| {
				if e.is_timeout() {
					PlatformError::Timeout
				} else {
					PlatformError::Unavailable(format!("{label}: {e}"))
				}
			})?;

		let status = resp.status();
		if status.is_success() {
			return Ok(resp);
		}

		let retry_after = retry_after_from_headers(resp.headers());
		let body = resp.text().await.unwrap_or_default();
		let err = classify_status(status, retry_after, &body, label);
		debug!(%status, label, error = %err, "discord request failed");
		metrics::counter!("tempvoice_platform_request_errors_total").increment(1);
		Err(err)
	}

	async fn send_json<T: DeserializeOwned>(
		&self,
		req: reqwest::RequestBuilder,
		label: &'static str,
	) -> Result<T, PlatformError> {
		let resp = self.send(req, label).await?;
		resp.json::<T>()
			.await
			.map_err(|e| PlatformError::Rejected(format!("{label}: decode response: {e}")))
	}

	async fn post_message(&self, room: RoomId, content: &str, controls: Option<&ControlPanel>) -> Result<(), PlatformError> {
		let content = clamp_content(content);
		let components = match controls {
			Some(panel) => vec![ActionRow {
				kind: COMPONENT_ACTION_ROW,
				components: PanelAction::ALL
					.iter()
					.map(|action| Button {
						kind: COMPONENT_BUTTON,
						style: button_style(*action),
						label: action.label(),
						custom_id: action.custom_id(panel.room),
					})
					.collect(),
			}],
			None => Vec::new(),
		};
		let body = CreateMessageBody {
			content: &content,
			components,
		};
		self.send(
			self.http.post(self.url(&format!("/channels/{room}/messages"))).json(&body),
			"POST /channels/{id}/messages",
		)
		.await?;
		Ok(())
	}
}

#[async_trait::async_trait]
impl VoicePlatform for DiscordRest {
	async fn create_voice_room(&self, request: CreateRoomRequest) -> Result<RoomRef, PlatformError> {
		let body = CreateChannelBody {
			name: request.name.as_str(),
			kind: CHANNEL_TYPE_VOICE,
			parent_id: request.category,
			position: request.position,
		};
		let ch: Channel = self
			.send_json(
				self.http
					.post(self.url(&format!("/guilds/{}/channels", request.community)))
					.json(&body),
				"POST /guilds/{id}/channels",
			)
			.await?;

		self.cache.upsert_channel(&Channel {
			guild_id: Some(request.community),
			..ch.clone()
		});

		Ok(RoomRef {
			id: ch.id,
			community: request.community,
			name: ch.name.unwrap_or_else(|| request.name.into_string()),
			category: ch.parent_id,
			position: ch.position.unwrap_or(request.position),
		})
	}

	async fn move_user(&self, community: CommunityId, user: UserId, room: RoomId) -> Result<(), PlatformError> {
		let body = ModifyMemberBody { channel_id: room };
		self.send(
			self.http
				.patch(self.url(&format!("/guilds/{community}/members/{user}")))
				.json(&body),
			"PATCH /guilds/{id}/members/{id}",
		)
		.await?;
		Ok(())
	}

	async fn delete_room(&self, room: RoomId) -> Result<(), PlatformError> {
		self.send(self.http.delete(self.url(&format!("/channels/{room}"))), "DELETE /channels/{id}")
			.await?;
		Ok(())
	}

	async fn set_room_access(&self, room: RoomId, role: RoleId, connect_allowed: bool) -> Result<(), PlatformError> {
		let (allow, deny) = if connect_allowed {
			(PERMISSION_CONNECT, 0)
		} else {
			(0, PERMISSION_CONNECT)
		};
		let body = PermissionOverwriteBody {
			kind: OVERWRITE_TYPE_ROLE,
			allow: allow.to_string(),
			deny: deny.to_string(),
		};
		self.send(
			self.http
				.put(self.url(&format!("/channels/{room}/permissions/{role}")))
				.json(&body),
			"PUT /channels/{id}/permissions/{id}",
		)
		.await?;
		Ok(())
	}

	async fn rename_room(&self, room: RoomId, name: &RoomName) -> Result<(), PlatformError> {
		let body = ModifyChannelBody { name: name.as_str() };
		self.send(
			self.http.patch(self.url(&format!("/channels/{room}"))).json(&body),
			"PATCH /channels/{id}",
		)
		.await?;
		Ok(())
	}

	async fn send_direct_message(
		&self,
		user: UserId,
		content: &str,
		controls: Option<&ControlPanel>,
	) -> Result<(), PlatformError> {
		let dm: DmChannel = self
			.send_json(
				self.http
					.post(self.url("/users/@me/channels"))
					.json(&CreateDmBody { recipient_id: user }),
				"POST /users/@me/channels",
			)
			.await?;
		self.post_message(dm.id, content, controls).await
	}

	async fn send_to_room(&self, room: RoomId, content: &str) -> Result<(), PlatformError> {
		self.post_message(room, content, None).await
	}

	async fn respond_to_interaction(&self, interaction: &InteractionRef, content: &str) -> Result<(), PlatformError> {
		let content = clamp_content(content);
		let body = InteractionResponseBody {
			kind: INTERACTION_CALLBACK_CHANNEL_MESSAGE,
			data: InteractionResponseData {
				content: &content,
				flags: FLAG_EPHEMERAL,
			},
		};
		self.send(
			self.http
				.post(self.url(&format!(
					"/interactions/{}/{}/callback",
					interaction.id,
					interaction.token.expose()
				)))
				.json(&body),
			"POST /interactions/{id}/{token}/callback",
		)
		.await?;
		Ok(())
	}

	async fn list_communities(&self) -> Result<Vec<CommunityRef>, PlatformError> {
		let guilds: Vec<PartialGuild> = self
			.send_json(self.http.get(self.url("/users/@me/guilds")), "GET /users/@me/guilds")
			.await?;
		Ok(guilds
			.into_iter()
			.map(|g| CommunityRef {
				id: g.id,
				name: g.name,
			})
			.collect())
	}

	async fn list_invites(&self, community: CommunityId) -> Result<Vec<InviteRef>, PlatformError> {
		let invites: Vec<Invite> = self
			.send_json(
				self.http.get(self.url(&format!("/guilds/{community}/invites"))),
				"GET /guilds/{id}/invites",
			)
			.await?;
		Ok(invites.into_iter().map(|i| InviteRef { code: i.code }).collect())
	}

	async fn default_invite_room(&self, community: CommunityId) -> Result<Option<RoomId>, PlatformError> {
		Ok(self.cache.invite_room(community))
	}

	async fn create_invite(&self, room: RoomId) -> Result<InviteRef, PlatformError> {
		let invite: Invite = self
			.send_json(
				self.http
					.post(self.url(&format!("/channels/{room}/invites")))
					.json(&CreateInviteBody {
						max_age: 0,
						unique: false,
					}),
				"POST /channels/{id}/invites",
			)
			.await?;
		Ok(InviteRef { code: invite.code })
	}

	async fn register_commands(&self, application: ApplicationId, specs: &[CommandSpec]) -> Result<(), PlatformError> {
		let body: Vec<ApplicationCommandBody<'_>> = specs
			.iter()
			.map(|spec| ApplicationCommandBody {
				name: spec.name,
				description: spec.description,
				kind: COMMAND_TYPE_CHAT_INPUT,
				options: spec
					.options
					.iter()
					.map(|opt| ApplicationCommandOptionBody {
						kind: OPTION_TYPE_STRING,
						name: opt.name,
						description: opt.description,
						required: opt.required,
					})
					.collect(),
			})
			.collect();

		self.send(
			self.http
				.put(self.url(&format!("/applications/{application}/commands")))
				.json(&body),
			"PUT /applications/{id}/commands",
		)
		.await?;
		Ok(())
	}

	fn occupant_count(&self, room: RoomId) -> usize {
		self.cache.occupant_count(room)
	}

	fn current_room(&self, community: CommunityId, user: UserId) -> Option<RoomId> {
		self.cache.current_room(community, user)
	}

	fn default_access_role(&self, community: CommunityId) -> RoleId {
		// @everyone shares the guild's id.
		RoleId::new(community.get())
	}
}
