#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, anyhow};
use futures_util::{SinkExt, StreamExt};
use tempvoice_domain::UserId;
use tokio::time::{Instant, sleep, timeout};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};
use url::Url;

use super::DiscordConfig;
use super::cache::DiscordCache;
use super::model::{
	Channel, DiscordUser, GatewayFrame, GuildCreate, GuildDelete, GuildMember, Hello, INTERACTION_APPLICATION_COMMAND,
	INTERACTION_MESSAGE_COMPONENT, Interaction, Message as DiscordMessage, MessageDelete, OP_DISPATCH, OP_HEARTBEAT,
	OP_HEARTBEAT_ACK, OP_HELLO, OP_IDENTIFY, OP_INVALID_SESSION, OP_RECONNECT, OP_RESUME, Ready, VoiceState,
};
use crate::{
	CommandInvocation, ControlCommand, GatewayAdapter, GatewayControl, GatewayControlRx, InteractionRef, MemberRef,
	MessageEvent, MessageRef, PanelAction, PanelPress, PlatformEvent, PlatformEventTx, PresenceChange, ReadyInfo, RoomRef,
	SecretString, new_session_id,
};

pub(crate) type GatewayWs =
	tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Close codes after which reconnecting cannot help.
const FATAL_CLOSE_CODES: [u16; 5] = [4004, 4010, 4011, 4013, 4014];

/// Close codes that invalidate the session (identify again instead of resuming).
const SESSION_CLOSE_CODES: [u16; 2] = [4007, 4009];

/// Close code after which reconnecting cannot help.
#[derive(Debug, thiserror::Error)]
#[error("gateway closed with fatal code {0}")]
struct FatalClose(u16);

#[derive(Debug, Clone)]
struct SessionState {
	session_id: String,
	resume_url: Option<String>,
}

/// Why the inner loop ended.
enum LoopExit {
	Shutdown,
	Reconnect,
}

/// Discord gateway adapter: keeps the shared cache current and emits normalized events.
pub struct DiscordGateway {
	cfg: DiscordConfig,
	cache: Arc<DiscordCache>,
	session: Option<SessionState>,
	seq: Option<u64>,
}

pub(crate) fn member_ref(user: &DiscordUser, member: Option<&GuildMember>) -> MemberRef {
	let display_name = member
		.and_then(|m| m.nick.clone())
		.filter(|n| !n.trim().is_empty())
		.or_else(|| user.global_name.clone().filter(|n| !n.trim().is_empty()))
		.unwrap_or_else(|| user.username.clone());
	MemberRef {
		id: user.id,
		display_name,
		bot: user.bot,
	}
}

fn fallback_member(user_id: UserId) -> MemberRef {
	MemberRef {
		id: user_id,
		display_name: user_id.to_string(),
		bot: false,
	}
}

fn decode_message(msg: DiscordMessage, now: SystemTime) -> Option<MessageEvent> {
	let author = msg.author.as_ref()?;
	let author = member_ref(author, msg.member.as_ref());
	Some(MessageEvent {
		message: MessageRef {
			id: msg.id,
			room: msg.channel_id,
			community: msg.guild_id,
		},
		author,
		content: msg.content?,
		time: now,
	})
}

fn decode_interaction(ix: Interaction) -> Option<PlatformEvent> {
	let user = ix
		.member
		.as_ref()
		.and_then(|m| m.user.clone())
		.or_else(|| ix.user.clone())?;
	let member = member_ref(&user, ix.member.as_ref());
	let interaction = InteractionRef {
		id: ix.id,
		token: SecretString::new(ix.token),
	};
	let data = ix.data?;

	match ix.kind {
		INTERACTION_APPLICATION_COMMAND => {
			let command = match data.name.as_deref()? {
				"rename" => {
					let new_name = data
						.options
						.iter()
						.find(|o| o.name == "new_name")
						.and_then(|o| o.value.as_ref())
						.and_then(|v| v.as_str())
						.unwrap_or_default()
						.to_string();
					ControlCommand::Rename { new_name }
				}
				"lock" => ControlCommand::Lock,
				"unlock" => ControlCommand::Unlock,
				_ => return None,
			};
			Some(PlatformEvent::Command(Box::new(CommandInvocation {
				interaction,
				community: ix.guild_id,
				member,
				command,
			})))
		}
		INTERACTION_MESSAGE_COMPONENT => {
			let (action, room) = PanelAction::parse_custom_id(data.custom_id.as_deref()?)?;
			Some(PlatformEvent::PanelPressed(Box::new(PanelPress {
				interaction,
				member,
				room,
				action,
			})))
		}
		_ => None,
	}
}

/// Apply one dispatch to the cache and translate it into platform events.
pub(crate) fn decode_dispatch(
	cache: &DiscordCache,
	event: &str,
	data: serde_json::Value,
	now: SystemTime,
) -> anyhow::Result<Vec<PlatformEvent>> {
	let mut out = Vec::new();

	match event {
		"READY" => {
			let ready: Ready = serde_json::from_value(data).context("decode READY")?;
			cache.set_self_user(ready.user.id);
			out.push(PlatformEvent::Ready(ReadyInfo {
				user: ready.user.id,
				application: ready.application.map(|a| a.id),
				session_id: ready.session_id,
			}));
		}
		"GUILD_CREATE" => {
			let guild: GuildCreate = serde_json::from_value(data).context("decode GUILD_CREATE")?;
			if !guild.unavailable {
				cache.upsert_guild(&guild);
			}
		}
		"GUILD_DELETE" => {
			let guild: GuildDelete = serde_json::from_value(data).context("decode GUILD_DELETE")?;
			cache.remove_guild(guild.id);
		}
		"CHANNEL_CREATE" | "CHANNEL_UPDATE" => {
			let ch: Channel = serde_json::from_value(data).with_context(|| format!("decode {event}"))?;
			cache.upsert_channel(&ch);
		}
		"CHANNEL_DELETE" => {
			let ch: Channel = serde_json::from_value(data).context("decode CHANNEL_DELETE")?;
			let room = cache.remove_channel(ch.id).or_else(|| {
				ch.guild_id.map(|community| RoomRef {
					id: ch.id,
					community,
					name: ch.name.clone().unwrap_or_default(),
					category: ch.parent_id,
					position: ch.position.unwrap_or(0),
				})
			});
			if let Some(room) = room {
				out.push(PlatformEvent::RoomDeleted(room));
			}
		}
		"VOICE_STATE_UPDATE" => {
			let vs: VoiceState = serde_json::from_value(data).context("decode VOICE_STATE_UPDATE")?;
			if let Some(transition) = cache.apply_voice_state(&vs) {
				let member = vs
					.member
					.as_ref()
					.and_then(|m| m.user.as_ref().map(|u| member_ref(u, Some(m))))
					.unwrap_or_else(|| fallback_member(vs.user_id));
				out.push(PlatformEvent::PresenceChanged(Box::new(PresenceChange {
					community: transition.community,
					member,
					previous: transition.previous,
					current: transition.current,
					time: now,
				})));
			}
		}
		"MESSAGE_CREATE" => {
			let msg: DiscordMessage = serde_json::from_value(data).context("decode MESSAGE_CREATE")?;
			if let Some(ev) = decode_message(msg, now) {
				out.push(PlatformEvent::MessagePosted(Box::new(ev)));
			}
		}
		"MESSAGE_UPDATE" => {
			let msg: DiscordMessage = serde_json::from_value(data).context("decode MESSAGE_UPDATE")?;
			// Embed-only updates carry no content.
			if let Some(ev) = decode_message(msg, now) {
				out.push(PlatformEvent::MessageChanged(Box::new(ev)));
			}
		}
		"MESSAGE_DELETE" => {
			let del: MessageDelete = serde_json::from_value(data).context("decode MESSAGE_DELETE")?;
			out.push(PlatformEvent::MessageRemoved(MessageRef {
				id: del.id,
				room: del.channel_id,
				community: del.guild_id,
			}));
		}
		"INTERACTION_CREATE" => {
			let ix: Interaction = serde_json::from_value(data).context("decode INTERACTION_CREATE")?;
			if let Some(ev) = decode_interaction(ix) {
				out.push(ev);
			}
		}
		_ => {}
	}

	Ok(out)
}

impl DiscordGateway {
	pub(crate) fn new(cfg: DiscordConfig, cache: Arc<DiscordCache>) -> Self {
		Self {
			cfg,
			cache,
			session: None,
			seq: None,
		}
	}

	pub(crate) fn backoff_delay(attempt: u32, min: Duration, max: Duration) -> Duration {
		let pow = attempt.min(16);
		let ms = min.as_millis().saturating_mul(1u128 << pow);
		let d = Duration::from_millis(ms.min(u64::MAX as u128) as u64);
		d.min(max).max(min)
	}

	fn connect_url(&self) -> anyhow::Result<Url> {
		let raw = match self.session.as_ref().and_then(|s| s.resume_url.as_deref()) {
			Some(resume) => format!("{}/?v=10&encoding=json", resume.trim_end_matches('/')),
			None => self.cfg.gateway_url.clone(),
		};
		Url::parse(&raw).with_context(|| format!("parse gateway url {raw}"))
	}

	fn identify_frame(&self) -> String {
		serde_json::json!({
			"op": OP_IDENTIFY,
			"d": {
				"token": self.cfg.token.expose(),
				"intents": self.cfg.intents,
				"properties": {
					"os": std::env::consts::OS,
					"browser": "tempvoice",
					"device": "tempvoice",
				},
			},
		})
		.to_string()
	}

	fn resume_frame(&self, session: &SessionState) -> String {
		serde_json::json!({
			"op": OP_RESUME,
			"d": {
				"token": self.cfg.token.expose(),
				"session_id": session.session_id,
				"seq": self.seq,
			},
		})
		.to_string()
	}

	fn heartbeat_frame(&self) -> String {
		serde_json::json!({ "op": OP_HEARTBEAT, "d": self.seq }).to_string()
	}

	async fn read_hello(ws: &mut GatewayWs) -> anyhow::Result<Hello> {
		loop {
			let msg = ws
				.next()
				.await
				.ok_or_else(|| anyhow!("gateway closed before hello"))?
				.context("read gateway hello")?;
			if let Message::Text(t) = msg {
				let frame: GatewayFrame = serde_json::from_str(&t).context("decode gateway frame")?;
				if frame.op == OP_HELLO {
					return serde_json::from_value(frame.d).context("decode hello");
				}
			}
		}
	}

	async fn emit(events_tx: &PlatformEventTx, ev: PlatformEvent) -> bool {
		metrics::counter!("tempvoice_gateway_events_total").increment(1);
		events_tx.send(ev).await.is_ok()
	}

	/// Handle one text frame. `Ok(Some(exit))` ends the session loop.
	async fn handle_frame(
		&mut self,
		text: &str,
		ws: &mut GatewayWs,
		awaiting_ack: &mut bool,
		events_tx: &PlatformEventTx,
	) -> anyhow::Result<Option<LoopExit>> {
		let frame: GatewayFrame = serde_json::from_str(text).context("decode gateway frame")?;
		if let Some(s) = frame.s {
			self.seq = Some(s);
		}

		match frame.op {
			OP_DISPATCH => {
				let Some(event) = frame.t.as_deref() else {
					return Ok(None);
				};

				if event == "READY"
					&& let Ok(ready) = serde_json::from_value::<Ready>(frame.d.clone())
				{
					self.session = Some(SessionState {
						session_id: ready.session_id.clone(),
						resume_url: ready.resume_gateway_url.clone(),
					});
					info!(user = %ready.user.id, "discord gateway ready");
				} else if event == "RESUMED" {
					info!("discord gateway session resumed");
				}

				match decode_dispatch(&self.cache, event, frame.d, SystemTime::now()) {
					Ok(events) => {
						for ev in events {
							if !Self::emit(events_tx, ev).await {
								return Ok(Some(LoopExit::Shutdown));
							}
						}
					}
					Err(e) => warn!(event, error = %e, "dropping undecodable dispatch"),
				}
			}
			OP_HEARTBEAT => {
				ws.send(Message::Text(self.heartbeat_frame().into()))
					.await
					.context("send requested heartbeat")?;
			}
			OP_HEARTBEAT_ACK => {
				*awaiting_ack = false;
			}
			OP_RECONNECT => {
				info!("gateway requested reconnect");
				return Ok(Some(LoopExit::Reconnect));
			}
			OP_INVALID_SESSION => {
				let resumable = frame.d.as_bool().unwrap_or(false);
				if !resumable {
					self.session = None;
					self.seq = None;
				}
				warn!(resumable, "gateway invalidated session");
				sleep(Duration::from_secs(2)).await;
				return Ok(Some(LoopExit::Reconnect));
			}
			other => debug!(op = other, "ignoring gateway opcode"),
		}

		Ok(None)
	}

	async fn run_session(
		&mut self,
		ws: &mut GatewayWs,
		hello: Hello,
		control_rx: &mut GatewayControlRx,
		events_tx: &PlatformEventTx,
	) -> anyhow::Result<LoopExit> {
		let handshake = match self.session.clone() {
			Some(session) => self.resume_frame(&session),
			None => self.identify_frame(),
		};
		ws.send(Message::Text(handshake.into()))
			.await
			.context("send identify/resume")?;

		let period = Duration::from_millis(hello.heartbeat_interval.max(1));
		let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
		let mut awaiting_ack = false;

		loop {
			tokio::select! {
				cmd = control_rx.recv() => {
					match cmd {
						None | Some(GatewayControl::Shutdown) => {
							info!("discord gateway received Shutdown");
							let _ = ws.close(None).await;
							return Ok(LoopExit::Shutdown);
						}
						Some(GatewayControl::Reconnect) => {
							let _ = ws.close(None).await;
							return Ok(LoopExit::Reconnect);
						}
					}
				}

				_ = heartbeat.tick() => {
					if awaiting_ack {
						warn!("no heartbeat ack since last beat; reconnecting");
						return Ok(LoopExit::Reconnect);
					}
					ws.send(Message::Text(self.heartbeat_frame().into())).await.context("send heartbeat")?;
					awaiting_ack = true;
				}

				msg = ws.next() => {
					let Some(msg) = msg else {
						return Ok(LoopExit::Reconnect);
					};
					match msg.context("gateway read")? {
						Message::Text(t) => {
							if let Some(exit) = self.handle_frame(&t, ws, &mut awaiting_ack, events_tx).await? {
								return Ok(exit);
							}
						}
						Message::Close(frame) => {
							let code = frame.as_ref().map(|f| u16::from(f.code)).unwrap_or(1000);
							if FATAL_CLOSE_CODES.contains(&code) {
								return Err(FatalClose(code).into());
							}
							if SESSION_CLOSE_CODES.contains(&code) {
								self.session = None;
								self.seq = None;
							}
							info!(code, "gateway closed connection");
							return Ok(LoopExit::Reconnect);
						}
						_ => {}
					}
				}
			}
		}
	}

	async fn run_loop(mut self, mut control_rx: GatewayControlRx, events_tx: PlatformEventTx) -> anyhow::Result<()> {
		let adapter_session_id = new_session_id();
		info!(%adapter_session_id, "discord gateway starting");

		let mut reconnect_attempt: u32 = 0;

		loop {
			if reconnect_attempt > 0 {
				let delay =
					Self::backoff_delay(reconnect_attempt, self.cfg.reconnect_min_delay, self.cfg.reconnect_max_delay);
				info!(attempt = reconnect_attempt, delay_ms = delay.as_millis() as u64, "reconnecting to gateway");
				tokio::select! {
					_ = sleep(delay) => {}
					cmd = control_rx.recv() => {
						if matches!(cmd, None | Some(GatewayControl::Shutdown)) {
							return Ok(());
						}
					}
				}
			}

			let url = match self.connect_url() {
				Ok(u) => u,
				Err(e) => {
					warn!(error = %e, "invalid gateway url; falling back to default");
					self.session = None;
					reconnect_attempt = reconnect_attempt.saturating_add(1);
					continue;
				}
			};

			let mut ws: GatewayWs = match tokio_tungstenite::connect_async(url.as_str()).await {
				Ok((ws, _resp)) => ws,
				Err(e) => {
					warn!(error = %e, "failed to connect to gateway");
					reconnect_attempt = reconnect_attempt.saturating_add(1);
					continue;
				}
			};

			let hello = match timeout(Duration::from_secs(30), Self::read_hello(&mut ws)).await {
				Ok(Ok(h)) => h,
				Ok(Err(e)) => {
					warn!(error = %e, "failed to read gateway hello");
					reconnect_attempt = reconnect_attempt.saturating_add(1);
					continue;
				}
				Err(_) => {
					warn!("timed out waiting for gateway hello");
					reconnect_attempt = reconnect_attempt.saturating_add(1);
					continue;
				}
			};

			reconnect_attempt = 0;
			metrics::gauge!("tempvoice_gateway_connected").set(1.0);

			let exit = self.run_session(&mut ws, hello, &mut control_rx, &events_tx).await;
			metrics::gauge!("tempvoice_gateway_connected").set(0.0);

			match exit {
				Ok(LoopExit::Shutdown) => return Ok(()),
				Ok(LoopExit::Reconnect) => {
					reconnect_attempt = 1;
					let _ = events_tx
						.send(PlatformEvent::Disconnected {
							detail: "gateway reconnecting".to_string(),
						})
						.await;
				}
				Err(e) => {
					let detail = e.to_string();
					let _ = events_tx.send(PlatformEvent::Disconnected { detail: detail.clone() }).await;
					if e.downcast_ref::<FatalClose>().is_some() {
						return Err(e);
					}
					warn!(error = %detail, "gateway session failed");
					reconnect_attempt = reconnect_attempt.saturating_add(1);
				}
			}
		}
	}
}

#[async_trait::async_trait]
impl GatewayAdapter for DiscordGateway {
	fn name(&self) -> &'static str {
		"discord"
	}

	async fn run(self: Box<Self>, control_rx: GatewayControlRx, events_tx: PlatformEventTx) -> anyhow::Result<()> {
		let this = *self;
		this.run_loop(control_rx, events_tx).await
	}
}
