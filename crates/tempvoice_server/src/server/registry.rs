#![forbid(unsafe_code)]

use std::time::SystemTime;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tempvoice_domain::{CommunityId, RoomId, UserId};

/// Lifecycle of a managed channel. Removal from the registry is the terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
	Provisioning,
	Active,
	PendingDeletion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockState {
	#[default]
	Unlocked,
	Locked,
}

/// Channel created by the lifecycle controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EphemeralChannel {
	pub id: RoomId,
	pub community: CommunityId,
	pub creator: UserId,
	pub created_at: SystemTime,
	/// Placement copied from the trigger room.
	pub category: Option<RoomId>,
	pub position: i32,
	pub lock: LockState,
	pub state: ChannelState,
	/// A leave emptied the room before it went live.
	pub vacated: bool,
}

impl EphemeralChannel {
	pub fn provisioning(
		id: RoomId,
		community: CommunityId,
		creator: UserId,
		category: Option<RoomId>,
		position: i32,
	) -> Self {
		Self {
			id,
			community,
			creator,
			created_at: SystemTime::now(),
			category,
			position,
			lock: LockState::Unlocked,
			state: ChannelState::Provisioning,
			vacated: false,
		}
	}
}

/// Live managed channels. Callers get snapshots, never references into the map.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
	channels: DashMap<RoomId, EphemeralChannel>,
}

impl ChannelRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	fn publish_gauge(&self) {
		metrics::gauge!("tempvoice_live_channels").set(self.channels.len() as f64);
	}

	/// Returns false (and changes nothing) if the id is already registered.
	pub fn register(&self, channel: EphemeralChannel) -> bool {
		let inserted = match self.channels.entry(channel.id) {
			Entry::Occupied(_) => false,
			Entry::Vacant(e) => {
				e.insert(channel);
				true
			}
		};
		if inserted {
			self.publish_gauge();
		}
		inserted
	}

	/// Remove and return the channel; absent ids are a no-op.
	pub fn unregister(&self, id: RoomId) -> Option<EphemeralChannel> {
		let removed = self.channels.remove(&id).map(|(_, c)| c);
		if removed.is_some() {
			self.publish_gauge();
		}
		removed
	}

	pub fn contains(&self, id: RoomId) -> bool {
		self.channels.contains_key(&id)
	}

	pub fn get(&self, id: RoomId) -> Option<EphemeralChannel> {
		self.channels.get(&id).map(|c| c.value().clone())
	}

	/// Compare-and-set on the lifecycle state.
	pub fn transition(&self, id: RoomId, from: ChannelState, to: ChannelState) -> bool {
		match self.channels.get_mut(&id) {
			Some(mut c) if c.state == from => {
				c.state = to;
				true
			}
			_ => false,
		}
	}

	/// Note an emptying leave on a provisioning channel. False once the channel is live.
	pub fn mark_vacated(&self, id: RoomId) -> bool {
		match self.channels.get_mut(&id) {
			Some(mut c) if c.state == ChannelState::Provisioning => {
				c.vacated = true;
				true
			}
			_ => false,
		}
	}

	/// `Provisioning -> Active`, returning whether a leave emptied the room meanwhile.
	/// `None` if the channel is gone or already past provisioning.
	pub fn activate(&self, id: RoomId) -> Option<bool> {
		match self.channels.get_mut(&id) {
			Some(mut c) if c.state == ChannelState::Provisioning => {
				c.state = ChannelState::Active;
				Some(std::mem::take(&mut c.vacated))
			}
			_ => None,
		}
	}

	pub fn set_lock(&self, id: RoomId, lock: LockState) -> bool {
		match self.channels.get_mut(&id) {
			Some(mut c) => {
				c.lock = lock;
				true
			}
			None => false,
		}
	}

	pub fn len(&self) -> usize {
		self.channels.len()
	}

	pub fn is_empty(&self) -> bool {
		self.channels.is_empty()
	}
}

#[cfg(test)]
mod tests {
	use std::collections::HashSet;
	use std::sync::Arc;
	use std::sync::atomic::{AtomicUsize, Ordering};

	use proptest::prelude::*;

	use super::*;

	fn channel(id: u64) -> EphemeralChannel {
		EphemeralChannel::provisioning(RoomId::new(id), CommunityId::new(1), UserId::new(id + 100), None, 0)
	}

	#[test]
	fn register_is_first_writer_wins() {
		let registry = ChannelRegistry::new();
		assert!(registry.register(channel(5)));
		let mut other = channel(5);
		other.creator = UserId::new(999);
		assert!(!registry.register(other));
		assert_eq!(registry.get(RoomId::new(5)).map(|c| c.creator), Some(UserId::new(105)));
	}

	#[test]
	fn transitions_are_compare_and_set() {
		let registry = ChannelRegistry::new();
		registry.register(channel(5));
		let id = RoomId::new(5);

		assert!(!registry.transition(id, ChannelState::Active, ChannelState::PendingDeletion));
		assert!(registry.transition(id, ChannelState::Provisioning, ChannelState::Active));
		assert!(registry.transition(id, ChannelState::Active, ChannelState::PendingDeletion));
		assert!(!registry.transition(id, ChannelState::Active, ChannelState::PendingDeletion));
		assert!(!registry.transition(RoomId::new(6), ChannelState::Active, ChannelState::PendingDeletion));
	}

	#[test]
	fn vacancy_is_only_recorded_while_provisioning() {
		let registry = ChannelRegistry::new();
		let id = RoomId::new(5);
		assert!(!registry.mark_vacated(id));

		registry.register(channel(5));
		assert_eq!(registry.activate(id), Some(false));
		assert_eq!(registry.activate(id), None);
		assert!(!registry.mark_vacated(id), "live channels are collected directly");

		registry.register(channel(6));
		let id = RoomId::new(6);
		assert!(registry.mark_vacated(id));
		assert_eq!(registry.activate(id), Some(true));
		assert_eq!(registry.get(id).map(|c| (c.state, c.vacated)), Some((ChannelState::Active, false)));
	}

	#[test]
	fn snapshots_do_not_alias() {
		let registry = ChannelRegistry::new();
		registry.register(channel(5));
		let mut snapshot = registry.get(RoomId::new(5)).expect("registered");
		snapshot.lock = LockState::Locked;
		assert_eq!(registry.get(RoomId::new(5)).map(|c| c.lock), Some(LockState::Unlocked));

		assert!(registry.set_lock(RoomId::new(5), LockState::Locked));
		assert_eq!(registry.get(RoomId::new(5)).map(|c| c.lock), Some(LockState::Locked));
		assert!(!registry.set_lock(RoomId::new(6), LockState::Locked));
	}

	#[test]
	fn concurrent_claims_have_exactly_one_winner() {
		let registry = Arc::new(ChannelRegistry::new());
		registry.register(channel(5));
		registry.transition(RoomId::new(5), ChannelState::Provisioning, ChannelState::Active);

		let winners = Arc::new(AtomicUsize::new(0));
		let handles: Vec<_> = (0..16)
			.map(|_| {
				let registry = Arc::clone(&registry);
				let winners = Arc::clone(&winners);
				std::thread::spawn(move || {
					if registry.transition(RoomId::new(5), ChannelState::Active, ChannelState::PendingDeletion)
						&& registry.unregister(RoomId::new(5)).is_some()
					{
						winners.fetch_add(1, Ordering::SeqCst);
					}
				})
			})
			.collect();
		for h in handles {
			h.join().expect("thread");
		}
		assert_eq!(winners.load(Ordering::SeqCst), 1);
		assert!(registry.is_empty());
	}

	proptest! {
		#[test]
		fn membership_matches_model(ops in proptest::collection::vec((any::<bool>(), 0u64..8), 0..64)) {
			let registry = ChannelRegistry::new();
			let mut model = HashSet::new();
			for (register, id) in ops {
				if register {
					prop_assert_eq!(registry.register(channel(id)), model.insert(id));
				} else {
					prop_assert_eq!(registry.unregister(RoomId::new(id)).is_some(), model.remove(&id));
				}
				prop_assert_eq!(registry.len(), model.len());
				prop_assert_eq!(registry.contains(RoomId::new(id)), model.contains(&id));
			}
		}
	}
}
