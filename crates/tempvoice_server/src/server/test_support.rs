#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tempvoice_domain::{CommunityId, MessageId, RoomId, UserId};
use tempvoice_platform::memory::MemoryPlatform;
use tempvoice_platform::{InteractionRef, MemberRef, MessageEvent, MessageRef, RoomRef, SecretString};

use crate::config::DEFAULT_TRIGGER_ROOM_NAME;
use crate::server::access::AccessController;
use crate::server::control::{ControlSettings, ControlSurface};
use crate::server::lifecycle::{LifecycleConfig, LifecycleController};
use crate::server::registry::ChannelRegistry;
use crate::server::retry::RetryPolicy;

pub const GUILD: CommunityId = CommunityId::new(1);
pub const ALICE: UserId = UserId::new(7);
pub const BOB: UserId = UserId::new(8);

pub struct Harness {
	pub platform: Arc<MemoryPlatform>,
	pub registry: Arc<ChannelRegistry>,
	pub control: Arc<ControlSurface>,
	pub lifecycle: Arc<LifecycleController>,
	pub trigger: RoomRef,
}

impl Harness {
	pub fn new() -> Self {
		let platform = Arc::new(MemoryPlatform::new());
		platform.add_community(GUILD, "Guild");
		let trigger = platform.add_room(GUILD, DEFAULT_TRIGGER_ROOM_NAME);

		let retry = RetryPolicy::new(3, Duration::from_millis(10));
		let registry = Arc::new(ChannelRegistry::new());
		let access = Arc::new(AccessController::new(platform.clone(), Arc::clone(&registry), retry));
		let control = Arc::new(ControlSurface::new(
			platform.clone(),
			access,
			ControlSettings {
				retry,
				..ControlSettings::default()
			},
		));
		let lifecycle = Arc::new(LifecycleController::new(
			platform.clone(),
			Arc::clone(&registry),
			Arc::clone(&control),
			LifecycleConfig {
				retry,
				..LifecycleConfig::default()
			},
		));

		Self {
			platform,
			registry,
			control,
			lifecycle,
			trigger,
		}
	}

	/// Drop `user` into the trigger room and run the join handler.
	pub async fn create_for(&self, user: UserId, display: &str) -> RoomId {
		self.platform.place_user(GUILD, user, self.trigger.id);
		self.lifecycle
			.on_join_trigger(GUILD, &MemberRef::new(user, display), &self.trigger)
			.await
			.expect("creation succeeds")
			.expect("trigger room matched")
	}

	pub fn room_ref(&self, room: RoomId) -> RoomRef {
		self.platform.room(room).expect("room exists")
	}

	pub fn room_name(&self, room: RoomId) -> String {
		self.room_ref(room).name
	}
}

pub fn interaction(id: &str) -> InteractionRef {
	InteractionRef {
		id: id.to_string(),
		token: SecretString::new("token"),
	}
}

pub fn direct_message(from: UserId, content: &str) -> MessageEvent {
	MessageEvent {
		message: MessageRef {
			id: MessageId::new(42),
			room: RoomId::new(900),
			community: None,
		},
		author: MemberRef::new(from, "someone"),
		content: content.to_string(),
		time: SystemTime::now(),
	}
}

/// Let spawned tasks run to their next await point.
pub async fn settle() {
	for _ in 0..8 {
		tokio::task::yield_now().await;
	}
}
