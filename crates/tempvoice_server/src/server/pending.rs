#![forbid(unsafe_code)]

use dashmap::DashMap;
use tempvoice_domain::{RoomId, UserId};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

/// Panel rename waiting for the user's follow-up message.
#[derive(Debug)]
pub struct PendingRename {
	pub request_id: Uuid,
	pub room: RoomId,
	pub deadline: Instant,
	timeout: Option<JoinHandle<()>>,
}

impl PendingRename {
	pub fn new(request_id: Uuid, room: RoomId, deadline: Instant) -> Self {
		Self {
			request_id,
			room,
			deadline,
			timeout: None,
		}
	}

	pub fn with_timeout(mut self, handle: JoinHandle<()>) -> Self {
		self.timeout = Some(handle);
		self
	}

	fn cancel_timer(&mut self) {
		if let Some(handle) = self.timeout.take() {
			handle.abort();
		}
	}
}

/// At most one pending rename per user.
#[derive(Debug, Default)]
pub struct PendingRenames {
	entries: DashMap<UserId, PendingRename>,
}

impl PendingRenames {
	pub fn new() -> Self {
		Self::default()
	}

	/// Record a wait, replacing (and cancelling) any earlier one for the user.
	/// Returns the room of the replaced wait.
	pub fn insert(&self, user: UserId, pending: PendingRename) -> Option<RoomId> {
		let mut previous = self.entries.insert(user, pending)?;
		previous.cancel_timer();
		Some(previous.room)
	}

	/// Claim the user's wait because their answer arrived.
	pub fn take(&self, user: UserId) -> Option<RoomId> {
		let (_, mut pending) = self.entries.remove(&user)?;
		pending.cancel_timer();
		Some(pending.room)
	}

	/// Claim the wait only if it is still the one identified by `request_id`.
	/// Called from the wait's own timer, so the timer is left alone.
	pub fn take_expired(&self, user: UserId, request_id: Uuid) -> Option<RoomId> {
		self.entries
			.remove_if(&user, |_, p| p.request_id == request_id)
			.map(|(_, p)| p.room)
	}

	/// Drop every wait targeting `room`; returns the affected users.
	pub fn cancel_room(&self, room: RoomId) -> Vec<UserId> {
		let users: Vec<UserId> = self
			.entries
			.iter()
			.filter(|e| e.value().room == room)
			.map(|e| *e.key())
			.collect();

		users
			.into_iter()
			.filter(|user| match self.entries.remove_if(user, |_, p| p.room == room) {
				Some((_, mut pending)) => {
					pending.cancel_timer();
					true
				}
				None => false,
			})
			.collect()
	}

	pub fn room_for(&self, user: UserId) -> Option<RoomId> {
		self.entries.get(&user).map(|p| p.room)
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}
}
