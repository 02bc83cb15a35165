#![forbid(unsafe_code)]

use std::sync::Arc;

use tempvoice_domain::{RoomId, UserId};
use tempvoice_platform::VoicePlatform;
use tracing::info;

use crate::server::control::ControlError;
use crate::server::registry::{ChannelRegistry, ChannelState, EphemeralChannel, LockState};
use crate::server::retry::RetryPolicy;

/// Flips the connect permission of the community's default role on managed channels.
pub struct AccessController {
	platform: Arc<dyn VoicePlatform>,
	registry: Arc<ChannelRegistry>,
	retry: RetryPolicy,
}

impl AccessController {
	pub fn new(platform: Arc<dyn VoicePlatform>, registry: Arc<ChannelRegistry>, retry: RetryPolicy) -> Self {
		Self {
			platform,
			registry,
			retry,
		}
	}

	/// The channel must be managed and live, and the requester must be sitting in it.
	pub fn authorize(&self, requester: UserId, room: RoomId) -> Result<EphemeralChannel, ControlError> {
		let channel = self.registry.get(room).ok_or(ControlError::NotManaged)?;
		if channel.state == ChannelState::PendingDeletion {
			return Err(ControlError::NotManaged);
		}
		if self.platform.current_room(channel.community, requester) != Some(room) {
			return Err(ControlError::NotInChannel);
		}
		Ok(channel)
	}

	pub async fn lock(&self, requester: UserId, room: RoomId) -> Result<(), ControlError> {
		self.apply(requester, room, LockState::Locked).await
	}

	pub async fn unlock(&self, requester: UserId, room: RoomId) -> Result<(), ControlError> {
		self.apply(requester, room, LockState::Unlocked).await
	}

	async fn apply(&self, requester: UserId, room: RoomId, lock: LockState) -> Result<(), ControlError> {
		let channel = self.authorize(requester, room)?;
		let role = self.platform.default_access_role(channel.community);
		let connect_allowed = lock == LockState::Unlocked;

		self.retry
			.run("set_room_access", || self.platform.set_room_access(room, role, connect_allowed))
			.await
			.map_err(ControlError::Platform)?;

		self.registry.set_lock(room, lock);
		info!(%room, %requester, ?lock, "channel access updated");
		Ok(())
	}
}
