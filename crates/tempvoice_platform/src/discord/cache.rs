#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use tempvoice_domain::{CommunityId, RoomId, UserId};

use super::model::{CHANNEL_TYPE_TEXT, Channel, GuildCreate, VoiceState};
use crate::RoomRef;

/// Gateway-fed view of guild channels and voice presence.
///
/// Written only by the gateway task; the REST client reads it for occupancy and
/// membership checks.
#[derive(Debug, Default)]
pub struct DiscordCache {
	inner: RwLock<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
	self_user: Option<UserId>,
	guilds: HashMap<CommunityId, GuildEntry>,
	channels: HashMap<RoomId, ChannelEntry>,
	voice: HashMap<(CommunityId, UserId), RoomId>,
	occupants: HashMap<RoomId, HashSet<UserId>>,
}

#[derive(Debug, Clone)]
struct GuildEntry {
	name: String,
	system_channel: Option<RoomId>,
}

#[derive(Debug, Clone)]
struct ChannelEntry {
	guild: CommunityId,
	kind: u8,
	name: String,
	parent: Option<RoomId>,
	position: i32,
}

/// Voice transition computed from a voice state update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct VoiceTransition {
	pub(crate) community: CommunityId,
	pub(crate) previous: Option<RoomRef>,
	pub(crate) current: Option<RoomRef>,
}

impl Inner {
	fn room_ref(&self, id: RoomId, fallback_guild: CommunityId) -> RoomRef {
		match self.channels.get(&id) {
			Some(ch) => RoomRef {
				id,
				community: ch.guild,
				name: ch.name.clone(),
				category: ch.parent,
				position: ch.position,
			},
			None => RoomRef {
				id,
				community: fallback_guild,
				name: String::new(),
				category: None,
				position: 0,
			},
		}
	}

	fn leave_voice(&mut self, guild: CommunityId, user: UserId) -> Option<RoomId> {
		let prev = self.voice.remove(&(guild, user))?;
		if let Some(set) = self.occupants.get_mut(&prev) {
			set.remove(&user);
			if set.is_empty() {
				self.occupants.remove(&prev);
			}
		}
		Some(prev)
	}

	fn join_voice(&mut self, guild: CommunityId, user: UserId, room: RoomId) {
		self.voice.insert((guild, user), room);
		self.occupants.entry(room).or_default().insert(user);
	}
}

impl DiscordCache {
	pub fn set_self_user(&self, user: UserId) {
		self.inner.write().self_user = Some(user);
	}

	pub fn self_user(&self) -> Option<UserId> {
		self.inner.read().self_user
	}

	/// Replace everything known about a guild with a fresh snapshot.
	pub(crate) fn upsert_guild(&self, guild: &GuildCreate) {
		let mut inner = self.inner.write();
		Self::drop_guild_locked(&mut inner, guild.id);

		inner.guilds.insert(
			guild.id,
			GuildEntry {
				name: guild.name.clone().unwrap_or_default(),
				system_channel: guild.system_channel_id,
			},
		);

		for ch in &guild.channels {
			inner.channels.insert(
				ch.id,
				ChannelEntry {
					guild: guild.id,
					kind: ch.kind,
					name: ch.name.clone().unwrap_or_default(),
					parent: ch.parent_id,
					position: ch.position.unwrap_or(0),
				},
			);
		}

		for vs in &guild.voice_states {
			if let Some(room) = vs.channel_id {
				inner.join_voice(guild.id, vs.user_id, room);
			}
		}
	}

	pub(crate) fn remove_guild(&self, guild: CommunityId) {
		let mut inner = self.inner.write();
		Self::drop_guild_locked(&mut inner, guild);
	}

	fn drop_guild_locked(inner: &mut Inner, guild: CommunityId) {
		inner.guilds.remove(&guild);
		inner.channels.retain(|_, ch| ch.guild != guild);
		let stale: Vec<UserId> = inner.voice.keys().filter(|(g, _)| *g == guild).map(|(_, u)| *u).collect();
		for user in stale {
			inner.leave_voice(guild, user);
		}
	}

	pub(crate) fn upsert_channel(&self, ch: &Channel) {
		let Some(guild) = ch.guild_id else {
			return;
		};
		self.inner.write().channels.insert(
			ch.id,
			ChannelEntry {
				guild,
				kind: ch.kind,
				name: ch.name.clone().unwrap_or_default(),
				parent: ch.parent_id,
				position: ch.position.unwrap_or(0),
			},
		);
	}

	/// Forget a channel; returns its last snapshot.
	pub(crate) fn remove_channel(&self, id: RoomId) -> Option<RoomRef> {
		let mut inner = self.inner.write();
		let entry = inner.channels.get(&id)?.clone();
		let room = inner.room_ref(id, entry.guild);
		inner.channels.remove(&id);
		if let Some(users) = inner.occupants.remove(&id) {
			for user in users {
				inner.voice.remove(&(entry.guild, user));
			}
		}
		Some(room)
	}

	/// Apply a voice state update. Returns `None` when the member stayed in the same room
	/// (mute/deafen/stream toggles).
	pub(crate) fn apply_voice_state(&self, vs: &VoiceState) -> Option<VoiceTransition> {
		let guild = vs.guild_id?;
		let mut inner = self.inner.write();

		let before = inner.voice.get(&(guild, vs.user_id)).copied();
		if before == vs.channel_id {
			return None;
		}

		inner.leave_voice(guild, vs.user_id);
		if let Some(room) = vs.channel_id {
			inner.join_voice(guild, vs.user_id, room);
		}

		Some(VoiceTransition {
			community: guild,
			previous: before.map(|id| inner.room_ref(id, guild)),
			current: vs.channel_id.map(|id| inner.room_ref(id, guild)),
		})
	}

	pub fn room_ref(&self, id: RoomId) -> Option<RoomRef> {
		let inner = self.inner.read();
		let guild = inner.channels.get(&id)?.guild;
		Some(inner.room_ref(id, guild))
	}

	pub fn occupant_count(&self, room: RoomId) -> usize {
		self.inner.read().occupants.get(&room).map(HashSet::len).unwrap_or(0)
	}

	pub fn current_room(&self, guild: CommunityId, user: UserId) -> Option<RoomId> {
		self.inner.read().voice.get(&(guild, user)).copied()
	}

	pub fn guild_name(&self, guild: CommunityId) -> Option<String> {
		self.inner.read().guilds.get(&guild).map(|g| g.name.clone())
	}

	/// System channel, else the top-most text channel.
	pub fn invite_room(&self, guild: CommunityId) -> Option<RoomId> {
		let inner = self.inner.read();
		if let Some(system) = inner.guilds.get(&guild).and_then(|g| g.system_channel) {
			return Some(system);
		}
		inner
			.channels
			.iter()
			.filter(|(_, ch)| ch.guild == guild && ch.kind == CHANNEL_TYPE_TEXT)
			.min_by_key(|(id, ch)| (ch.position, **id))
			.map(|(id, _)| *id)
	}
}
