#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::SystemTime;

use tempvoice_domain::{CommunityId, RoomId, UserId};
use tempvoice_platform::{CommunityRef, InviteRef, MessageRef, PlatformError, PlatformEvent, VoicePlatform};
use tracing::{debug, info};

use crate::util::time::clock_utc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditKind {
	JoinVoice,
	LeaveVoice,
	MoveVoice,
	MessageSent,
	MessageEdited,
	MessageDeleted,
	Started,
}

/// What an audit line is about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditSubject {
	Room { id: RoomId, name: String },
	Move { from: String, to: String },
	Message(MessageRef),
	Process,
}

/// One mirrored activity line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEvent {
	pub kind: AuditKind,
	pub actor: Option<(UserId, String)>,
	pub subject: AuditSubject,
	pub payload: String,
	pub time: SystemTime,
}

impl AuditEvent {
	/// Map a platform event to an audit line; `None` for events that are not mirrored.
	pub fn from_platform(ev: &PlatformEvent, sink: Option<RoomId>) -> Option<Self> {
		match ev {
			PlatformEvent::PresenceChanged(change) => {
				let actor = Some((change.member.id, change.member.display_name.clone()));
				let (kind, subject) = match (&change.previous, &change.current) {
					(None, Some(to)) => (
						AuditKind::JoinVoice,
						AuditSubject::Room {
							id: to.id,
							name: to.name.clone(),
						},
					),
					(Some(from), None) => (
						AuditKind::LeaveVoice,
						AuditSubject::Room {
							id: from.id,
							name: from.name.clone(),
						},
					),
					(Some(from), Some(to)) => (
						AuditKind::MoveVoice,
						AuditSubject::Move {
							from: from.name.clone(),
							to: to.name.clone(),
						},
					),
					(None, None) => return None,
				};
				Some(Self {
					kind,
					actor,
					subject,
					payload: String::new(),
					time: change.time,
				})
			}
			PlatformEvent::MessagePosted(m) | PlatformEvent::MessageChanged(m) => {
				if m.is_direct() || m.author.bot || Some(m.message.room) == sink {
					return None;
				}
				let kind = if matches!(ev, PlatformEvent::MessagePosted(_)) {
					AuditKind::MessageSent
				} else {
					AuditKind::MessageEdited
				};
				Some(Self {
					kind,
					actor: Some((m.author.id, m.author.display_name.clone())),
					subject: AuditSubject::Message(m.message.clone()),
					payload: m.content.clone(),
					time: m.time,
				})
			}
			PlatformEvent::MessageRemoved(r) => {
				if r.community.is_none() || Some(r.room) == sink {
					return None;
				}
				Some(Self {
					kind: AuditKind::MessageDeleted,
					actor: None,
					subject: AuditSubject::Message(r.clone()),
					payload: String::new(),
					time: SystemTime::now(),
				})
			}
			PlatformEvent::Ready(_) => Some(Self {
				kind: AuditKind::Started,
				actor: None,
				subject: AuditSubject::Process,
				payload: String::new(),
				time: SystemTime::now(),
			}),
			_ => None,
		}
	}

	pub fn render(&self) -> String {
		let who = self.actor.as_ref().map(|(_, name)| name.as_str()).unwrap_or("Someone");
		let body = match (&self.kind, &self.subject) {
			(AuditKind::JoinVoice, AuditSubject::Room { name, .. }) => format!("🔊 **{who}** joined **{name}**"),
			(AuditKind::LeaveVoice, AuditSubject::Room { name, .. }) => format!("🔇 **{who}** left **{name}**"),
			(AuditKind::MoveVoice, AuditSubject::Move { from, to }) => {
				format!("🔀 **{who}** moved from **{from}** to **{to}**")
			}
			(AuditKind::MessageSent, AuditSubject::Message(m)) => {
				format!("💬 **{who}** in <#{}>: {}", m.room, self.payload)
			}
			(AuditKind::MessageEdited, AuditSubject::Message(m)) => {
				format!("✏️ **{who}** edited a message in <#{}>: {}", m.room, self.payload)
			}
			(AuditKind::MessageDeleted, AuditSubject::Message(m)) => {
				format!("🗑️ Message {} was deleted in <#{}>", m.id, m.room)
			}
			(AuditKind::Started, _) => "✅ tempvoice started".to_string(),
			(kind, _) => format!("{kind:?}"),
		};
		format!("`[{}]` {body}", clock_utc(self.time))
	}
}

/// Best-effort mirror of activity into one sink room.
pub struct AuditLogger {
	platform: Arc<dyn VoicePlatform>,
	sink: Option<RoomId>,
}

impl AuditLogger {
	pub fn new(platform: Arc<dyn VoicePlatform>, sink: Option<RoomId>) -> Self {
		Self { platform, sink }
	}

	pub fn sink(&self) -> Option<RoomId> {
		self.sink
	}

	/// Mirror `ev` without waiting for the send.
	pub fn observe(&self, ev: &PlatformEvent) {
		let Some(sink) = self.sink else {
			return;
		};
		let Some(audit) = AuditEvent::from_platform(ev, Some(sink)) else {
			return;
		};
		let line = audit.render();
		let platform = Arc::clone(&self.platform);
		tokio::spawn(async move {
			if let Err(e) = platform.send_to_room(sink, &line).await {
				debug!(%sink, error = %e, "audit line dropped");
			}
		});
	}

	/// Invite per community, or an inline error string.
	async fn invite_for(&self, community: CommunityId) -> Result<InviteRef, PlatformError> {
		if let Some(invite) = self.platform.list_invites(community).await?.into_iter().next() {
			return Ok(invite);
		}
		let room = self
			.platform
			.default_invite_room(community)
			.await?
			.ok_or_else(|| PlatformError::NotFound("no channel to create an invite in".to_string()))?;
		self.platform.create_invite(room).await
	}

	/// Build the startup report: one line per community.
	pub async fn startup_report(&self) -> String {
		let communities: Vec<CommunityRef> = match self.platform.list_communities().await {
			Ok(list) => list,
			Err(e) => return format!("✅ Started. Could not list communities: {e}"),
		};

		let mut report = format!("✅ Started in {} communities:", communities.len());
		for community in communities {
			let line = match self.invite_for(community.id).await {
				Ok(invite) => format!("\n- {}: {}", community.name, invite.url()),
				Err(e) => format!("\n- {}: (no invite: {e})", community.name),
			};
			report.push_str(&line);
		}
		report
	}

	/// Log the startup report and mirror it to the sink.
	pub async fn announce_startup(&self) {
		let report = self.startup_report().await;
		info!(report = %report, "startup report");
		if let Some(sink) = self.sink
			&& let Err(e) = self.platform.send_to_room(sink, &report).await
		{
			debug!(%sink, error = %e, "startup report not mirrored");
		}
	}
}

#[cfg(test)]
mod tests {
	use std::time::{Duration, UNIX_EPOCH};

	use tempvoice_domain::MessageId;
	use tempvoice_platform::memory::{MemoryOp, MemoryPlatform};
	use tempvoice_platform::{MemberRef, MessageEvent, PresenceChange, RoomRef};

	use super::*;

	const GUILD: CommunityId = CommunityId::new(1);
	const SINK: RoomId = RoomId::new(500);

	fn room(id: u64, name: &str) -> RoomRef {
		RoomRef {
			id: RoomId::new(id),
			community: GUILD,
			name: name.to_string(),
			category: None,
			position: 0,
		}
	}

	fn presence(previous: Option<RoomRef>, current: Option<RoomRef>) -> PlatformEvent {
		PlatformEvent::PresenceChanged(Box::new(PresenceChange {
			community: GUILD,
			member: MemberRef::new(UserId::new(7), "Alice"),
			previous,
			current,
			time: UNIX_EPOCH + Duration::from_secs(3600),
		}))
	}

	fn message(room: RoomId, community: Option<CommunityId>, bot: bool) -> PlatformEvent {
		let mut author = MemberRef::new(UserId::new(7), "Alice");
		author.bot = bot;
		PlatformEvent::MessagePosted(Box::new(MessageEvent {
			message: MessageRef {
				id: MessageId::new(9),
				room,
				community,
			},
			author,
			content: "hello".to_string(),
			time: UNIX_EPOCH,
		}))
	}

	#[test]
	fn voice_transitions_map_to_kinds() {
		let join = AuditEvent::from_platform(&presence(None, Some(room(1, "Lobby"))), None).expect("join");
		assert_eq!(join.kind, AuditKind::JoinVoice);
		assert_eq!(join.render(), "`[01:00:00]` 🔊 **Alice** joined **Lobby**");

		let mv = AuditEvent::from_platform(&presence(Some(room(1, "Lobby")), Some(room(2, "Games"))), None)
			.expect("move");
		assert_eq!(mv.kind, AuditKind::MoveVoice);
		assert!(mv.render().ends_with("moved from **Lobby** to **Games**"));

		let leave = AuditEvent::from_platform(&presence(Some(room(2, "Games")), None), None).expect("leave");
		assert_eq!(leave.kind, AuditKind::LeaveVoice);
	}

	#[test]
	fn sink_bot_and_direct_messages_are_not_mirrored() {
		assert!(AuditEvent::from_platform(&message(SINK, Some(GUILD), false), Some(SINK)).is_none());
		assert!(AuditEvent::from_platform(&message(RoomId::new(3), Some(GUILD), true), Some(SINK)).is_none());
		assert!(AuditEvent::from_platform(&message(RoomId::new(3), None, false), Some(SINK)).is_none());

		let sent = AuditEvent::from_platform(&message(RoomId::new(3), Some(GUILD), false), Some(SINK)).expect("sent");
		assert_eq!(sent.kind, AuditKind::MessageSent);
		assert!(sent.render().ends_with("💬 **Alice** in <#3>: hello"));
	}

	#[tokio::test]
	async fn observe_without_sink_sends_nothing() {
		let platform = Arc::new(MemoryPlatform::new());
		let logger = AuditLogger::new(platform.clone(), None);
		logger.observe(&presence(None, Some(room(1, "Lobby"))));
		tokio::task::yield_now().await;
		assert!(platform.calls().is_empty());
	}

	#[tokio::test]
	async fn sink_failure_is_swallowed() {
		let platform = Arc::new(MemoryPlatform::new());
		platform.fail_next(MemoryOp::SendToRoom, PlatformError::Forbidden("missing access".into()));
		let logger = AuditLogger::new(platform.clone(), Some(SINK));
		logger.observe(&presence(None, Some(room(1, "Lobby"))));
		logger.observe(&presence(Some(room(1, "Lobby")), None));

		for _ in 0..10 {
			if platform.room_messages(SINK).len() == 2 {
				break;
			}
			tokio::task::yield_now().await;
		}
		assert_eq!(platform.room_messages(SINK).len(), 2, "both attempts were made");
	}

	#[tokio::test]
	async fn startup_report_substitutes_errors_per_community() {
		let platform = Arc::new(MemoryPlatform::new());
		let with_invite = CommunityId::new(10);
		let creatable = CommunityId::new(11);
		let broken = CommunityId::new(12);
		let empty = CommunityId::new(13);

		// Communities are walked in insertion order, so Gamma's listing is the first one.
		platform.add_community(broken, "Gamma");
		platform.add_community(with_invite, "Alpha");
		platform.add_community(creatable, "Beta");
		platform.add_community(empty, "Delta");
		platform.fail_next(MemoryOp::ListInvites, PlatformError::Forbidden("missing access".into()));

		platform.add_invite(with_invite, "alpha");
		let general = platform.add_room(creatable, "general").id;
		platform.set_invite_room(creatable, general);

		let logger = AuditLogger::new(platform.clone(), Some(SINK));
		let report = logger.startup_report().await;

		assert!(report.starts_with("✅ Started in 4 communities:"), "{report}");
		assert!(report.contains("- Alpha: https://discord.gg/alpha"), "{report}");
		assert!(report.contains("- Beta: https://discord.gg/inv"), "{report}");
		assert!(report.contains("- Gamma: (no invite: forbidden: missing access)"), "{report}");
		assert!(report.contains("- Delta: (no invite: not found: no channel to create an invite in)"), "{report}");
	}
}
