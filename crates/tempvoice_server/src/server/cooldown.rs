#![forbid(unsafe_code)]

use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tempvoice_domain::UserId;
use tokio::time::Instant;

use crate::util::time::deadline_after;

/// Per-user hold: while a user's entry is unexpired, further attempts are denied.
///
/// Used twice: with the long hold it gates channel creation, with the short one it
/// rate-limits control actions.
#[derive(Debug)]
pub struct CooldownGuard {
	hold: Duration,
	entries: DashMap<UserId, Instant>,
}

impl CooldownGuard {
	pub fn new(hold: Duration) -> Self {
		Self {
			hold,
			entries: DashMap::new(),
		}
	}

	pub fn hold(&self) -> Duration {
		self.hold
	}

	/// Reserve the user's slot. Denials leave the map untouched.
	pub fn permit(&self, user: UserId) -> bool {
		let now = Instant::now();
		match self.entries.entry(user) {
			Entry::Occupied(mut e) => {
				if *e.get() > now {
					return false;
				}
				e.insert(deadline_after(now, self.hold));
				true
			}
			Entry::Vacant(e) => {
				e.insert(deadline_after(now, self.hold));
				true
			}
		}
	}

	/// Restart the hold from now.
	pub fn arm(&self, user: UserId) {
		self.entries.insert(user, deadline_after(Instant::now(), self.hold));
	}

	/// Drop a reservation that did not lead anywhere.
	pub fn release(&self, user: UserId) {
		self.entries.remove(&user);
	}

	/// Time left before the user may try again.
	pub fn remaining(&self, user: UserId) -> Option<Duration> {
		let now = Instant::now();
		self.entries
			.get(&user)
			.map(|e| *e.value())
			.filter(|expiry| *expiry > now)
			.map(|expiry| expiry - now)
	}

	/// Remove inert entries; returns how many were dropped.
	pub fn purge_expired(&self) -> usize {
		let now = Instant::now();
		let before = self.entries.len();
		self.entries.retain(|_, expiry| *expiry > now);
		before.saturating_sub(self.entries.len())
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}
}
