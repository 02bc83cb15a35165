#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use tempvoice_domain::{CommunityId, RoomId, RoomName};
use tempvoice_platform::{ControlPanel, CreateRoomRequest, Delivery, MemberRef, PlatformError, RoomRef, VoicePlatform};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::DEFAULT_TRIGGER_ROOM_NAME;
use crate::server::control::ControlSurface;
use crate::server::cooldown::CooldownGuard;
use crate::server::registry::{ChannelRegistry, ChannelState, EphemeralChannel};
use crate::server::retry::RetryPolicy;

/// Voice presence in the router's vocabulary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoiceEvent {
	Join {
		community: CommunityId,
		member: MemberRef,
		room: RoomRef,
	},
	Leave {
		community: CommunityId,
		member: MemberRef,
		room: RoomRef,
	},
	Move {
		community: CommunityId,
		member: MemberRef,
		from: RoomRef,
		to: RoomRef,
	},
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
	#[error("creation on cooldown for another {0:?}")]
	CooldownActive(Duration),
	#[error("room creation failed: {0}")]
	Create(PlatformError),
	#[error("moving the creator failed: {0}")]
	Move(PlatformError),
}

/// What a leave did to the room it left.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaveOutcome {
	/// Room is not one of ours.
	NotManaged,
	StillOccupied,
	/// Another handler owns the deletion.
	NotClaimed,
	/// Emptied while still provisioning; the creation path collects it once live.
	Deferred,
	Deleted,
	/// Deletion failed permanently; the channel is live again.
	Failed(PlatformError),
}

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
	pub trigger_room_name: String,
	/// Hold between creations for one user.
	pub creation_hold: Duration,
	pub retry: RetryPolicy,
}

impl Default for LifecycleConfig {
	fn default() -> Self {
		Self {
			trigger_room_name: DEFAULT_TRIGGER_ROOM_NAME.to_string(),
			creation_hold: Duration::from_secs(15),
			retry: RetryPolicy::default(),
		}
	}
}

/// Creates a channel when someone enters the trigger room and deletes it once it empties.
pub struct LifecycleController {
	platform: Arc<dyn VoicePlatform>,
	registry: Arc<ChannelRegistry>,
	control: Arc<ControlSurface>,
	creation: CooldownGuard,
	cfg: LifecycleConfig,
}

impl LifecycleController {
	pub fn new(
		platform: Arc<dyn VoicePlatform>,
		registry: Arc<ChannelRegistry>,
		control: Arc<ControlSurface>,
		cfg: LifecycleConfig,
	) -> Self {
		Self {
			platform,
			registry,
			control,
			creation: CooldownGuard::new(cfg.creation_hold),
			cfg,
		}
	}

	pub fn purge_cooldowns(&self) -> usize {
		self.creation.purge_expired()
	}

	pub async fn handle(&self, event: VoiceEvent) {
		match event {
			VoiceEvent::Join { community, member, room } => {
				let _ = self.on_join_trigger(community, &member, &room).await;
			}
			VoiceEvent::Leave { room, .. } => {
				self.on_leave(room.id).await;
			}
			VoiceEvent::Move {
				community,
				member,
				from,
				to,
			} => {
				self.on_leave(from.id).await;
				let _ = self.on_join_trigger(community, &member, &to).await;
			}
		}
	}

	async fn tell(&self, member: &MemberRef, content: &str) {
		if let Delivery::Failed(e) = Delivery::from(self.platform.send_direct_message(member.id, content, None).await) {
			metrics::counter!("tempvoice_dm_delivery_failed_total").increment(1);
			debug!(user = %member.id, error = %e, "notice not delivered");
		}
	}

	/// `Ok(None)` when `room` is not the trigger room.
	pub async fn on_join_trigger(
		&self,
		community: CommunityId,
		member: &MemberRef,
		room: &RoomRef,
	) -> Result<Option<RoomId>, LifecycleError> {
		if room.name != self.cfg.trigger_room_name {
			return Ok(None);
		}

		if !self.creation.permit(member.id) {
			let remaining = self.creation.remaining(member.id).unwrap_or(self.creation.hold());
			metrics::counter!("tempvoice_creation_rejected_total", "reason" => "cooldown").increment(1);
			info!(user = %member.id, remaining_ms = remaining.as_millis() as u64, "creation denied by cooldown");
			self.tell(
				member,
				&format!(
					"⏳ Please wait {}s before creating another channel.",
					remaining.as_secs().max(1)
				),
			)
			.await;
			return Err(LifecycleError::CooldownActive(remaining));
		}

		let name = RoomName::for_owner(&member.display_name);
		let request = CreateRoomRequest {
			community,
			name: name.clone(),
			category: room.category,
			position: room.position,
		};

		let created = match self.platform.create_voice_room(request).await {
			Ok(created) => created,
			Err(e) => {
				self.creation.release(member.id);
				metrics::counter!("tempvoice_creation_rejected_total", "reason" => "platform").increment(1);
				warn!(user = %member.id, error = %e, "room creation failed");
				self.tell(member, &format!("❌ Could not create your channel: {e}.")).await;
				return Err(LifecycleError::Create(e));
			}
		};

		self.registry.register(EphemeralChannel::provisioning(
			created.id,
			community,
			member.id,
			room.category,
			room.position,
		));

		let moved = self
			.cfg
			.retry
			.run("move_user", || self.platform.move_user(community, member.id, created.id))
			.await;
		if let Err(e) = moved {
			warn!(user = %member.id, room = %created.id, error = %e, "moving creator failed; removing room");
			self.registry.unregister(created.id);
			self.creation.release(member.id);
			if let Err(del) = self.cfg.retry.run("delete_room", || self.platform.delete_room(created.id)).await
				&& !del.is_not_found()
			{
				warn!(room = %created.id, error = %del, "failed to remove orphaned room");
			}
			self.tell(member, &format!("❌ Could not move you into your channel: {e}.")).await;
			return Err(LifecycleError::Move(e));
		}

		let vacated = self.registry.activate(created.id).unwrap_or(false);
		self.creation.arm(member.id);
		metrics::counter!("tempvoice_channels_created_total").increment(1);
		info!(user = %member.id, room = %created.id, name = %name, "channel created");

		let panel = ControlPanel { room: created.id };
		let invitation = format!(
			"🎛 **Your Voice Channel Controls**\nYou can manage **{name}** using the buttons below:"
		);
		let delivery = Delivery::from(
			self.platform
				.send_direct_message(member.id, &invitation, Some(&panel))
				.await,
		);
		if let Delivery::Failed(e) = delivery {
			metrics::counter!("tempvoice_dm_delivery_failed_total").increment(1);
			warn!(user = %member.id, error = %e, "could not deliver control panel (DMs closed?)");
		}

		// Occupancy alone is not enough here: the move may not be visible in presence yet.
		if vacated && self.platform.occupant_count(created.id) == 0 {
			debug!(room = %created.id, "creator left before the channel went live");
			self.collect(created.id).await;
		}

		Ok(Some(created.id))
	}

	/// Delete `room` if it is ours and now empty.
	pub async fn on_leave(&self, room: RoomId) -> LeaveOutcome {
		if !self.registry.contains(room) {
			return LeaveOutcome::NotManaged;
		}
		if self.platform.occupant_count(room) > 0 {
			return LeaveOutcome::StillOccupied;
		}
		if self.registry.mark_vacated(room) {
			return LeaveOutcome::Deferred;
		}
		self.collect(room).await
	}

	async fn collect(&self, room: RoomId) -> LeaveOutcome {
		if !self
			.registry
			.transition(room, ChannelState::Active, ChannelState::PendingDeletion)
		{
			return LeaveOutcome::NotClaimed;
		}

		self.control.on_room_deleted(room).await;

		let res = self
			.cfg
			.retry
			.run_while(
				"delete_room",
				|| self.registry.contains(room),
				|| self.platform.delete_room(room),
			)
			.await;

		match res {
			Ok(()) => {}
			Err(e) if e.is_not_found() => {
				debug!(%room, "room already gone");
			}
			Err(e) => {
				if self
					.registry
					.transition(room, ChannelState::PendingDeletion, ChannelState::Active)
				{
					warn!(%room, error = %e, "room deletion failed; channel stays live");
				}
				return LeaveOutcome::Failed(e);
			}
		}

		if let Some(channel) = self.registry.unregister(room) {
			let lived = channel.created_at.elapsed().unwrap_or_default();
			metrics::counter!("tempvoice_channels_deleted_total").increment(1);
			info!(%room, creator = %channel.creator, lived_secs = lived.as_secs(), "empty channel deleted");
		}
		LeaveOutcome::Deleted
	}

	/// A managed room was deleted by someone else.
	pub async fn on_room_deleted(&self, room: RoomId) {
		if self.registry.unregister(room).is_some() {
			info!(%room, "managed channel deleted externally");
			self.control.on_room_deleted(room).await;
		}
	}
}
