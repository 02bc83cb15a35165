#![forbid(unsafe_code)]

//! In-process platform double used by the server tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tempvoice_domain::{ApplicationId, CommunityId, RoleId, RoomId, RoomName, UserId};

use crate::{
	CommandSpec, CommunityRef, ControlPanel, CreateRoomRequest, InteractionRef, InviteRef, PlatformError, RoomRef,
	VoicePlatform,
};

/// Operation selector for failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryOp {
	CreateRoom,
	MoveUser,
	DeleteRoom,
	SetAccess,
	RenameRoom,
	DirectMessage,
	SendToRoom,
	Respond,
	ListCommunities,
	ListInvites,
	CreateInvite,
	RegisterCommands,
}

/// Recorded outbound call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryCall {
	CreateRoom { community: CommunityId, name: String },
	MoveUser { community: CommunityId, user: UserId, room: RoomId },
	DeleteRoom(RoomId),
	SetAccess { room: RoomId, role: RoleId, connect_allowed: bool },
	RenameRoom { room: RoomId, name: String },
	DirectMessage { user: UserId, content: String, panel: Option<RoomId> },
	SendToRoom { room: RoomId, content: String },
	Respond { interaction: String, content: String },
	CreateInvite(RoomId),
	RegisterCommands { application: ApplicationId, count: usize },
}

#[derive(Debug, Default)]
struct State {
	rooms: HashMap<RoomId, RoomRef>,
	access: HashMap<(RoomId, RoleId), bool>,
	voice: HashMap<(CommunityId, UserId), RoomId>,
	communities: Vec<CommunityRef>,
	invites: HashMap<CommunityId, Vec<InviteRef>>,
	invite_rooms: HashMap<CommunityId, RoomId>,
	failures: HashMap<MemoryOp, VecDeque<PlatformError>>,
	closed_dms: HashSet<UserId>,
	calls: Vec<MemoryCall>,
	created: Vec<RoomId>,
	create_latency: Option<Duration>,
	move_latency: Option<Duration>,
	delete_latency: Option<Duration>,
	defer_moves: bool,
	deferred_moves: Vec<(CommunityId, UserId, RoomId)>,
}

/// Platform double keeping rooms, presence and every outbound call in memory.
#[derive(Debug)]
pub struct MemoryPlatform {
	state: Mutex<State>,
	next_id: AtomicU64,
}

impl Default for MemoryPlatform {
	fn default() -> Self {
		Self::new()
	}
}

impl MemoryPlatform {
	pub fn new() -> Self {
		Self {
			state: Mutex::new(State::default()),
			next_id: AtomicU64::new(10_000),
		}
	}

	fn mint_id(&self) -> u64 {
		self.next_id.fetch_add(1, Ordering::Relaxed)
	}

	pub fn add_community(&self, id: CommunityId, name: &str) {
		self.state.lock().communities.push(CommunityRef {
			id,
			name: name.to_string(),
		});
	}

	/// Register an existing room (e.g. the trigger room).
	pub fn add_room(&self, community: CommunityId, name: &str) -> RoomRef {
		let room = RoomRef {
			id: RoomId::new(self.mint_id()),
			community,
			name: name.to_string(),
			category: None,
			position: 0,
		};
		self.state.lock().rooms.insert(room.id, room.clone());
		room
	}

	pub fn add_invite(&self, community: CommunityId, code: &str) {
		self.state.lock().invites.entry(community).or_default().push(InviteRef { code: code.to_string() });
	}

	pub fn set_invite_room(&self, community: CommunityId, room: RoomId) {
		self.state.lock().invite_rooms.insert(community, room);
	}

	/// Put a user into a room without emitting anything.
	pub fn place_user(&self, community: CommunityId, user: UserId, room: RoomId) {
		self.state.lock().voice.insert((community, user), room);
	}

	pub fn remove_user(&self, community: CommunityId, user: UserId) {
		self.state.lock().voice.remove(&(community, user));
	}

	/// Make the next call of `op` fail with `err`. Stacks in FIFO order.
	pub fn fail_next(&self, op: MemoryOp, err: PlatformError) {
		self.state.lock().failures.entry(op).or_default().push_back(err);
	}

	pub fn close_dms(&self, user: UserId) {
		self.state.lock().closed_dms.insert(user);
	}

	pub fn set_create_latency(&self, latency: Duration) {
		self.state.lock().create_latency = Some(latency);
	}

	/// Delay the move response after presence has already changed.
	pub fn set_move_latency(&self, latency: Duration) {
		self.state.lock().move_latency = Some(latency);
	}

	/// Acknowledge moves without updating presence until [`Self::apply_deferred_moves`].
	pub fn defer_moves(&self, defer: bool) {
		self.state.lock().defer_moves = defer;
	}

	pub fn apply_deferred_moves(&self) {
		let mut state = self.state.lock();
		let moves = std::mem::take(&mut state.deferred_moves);
		for (community, user, room) in moves {
			if state.rooms.contains_key(&room) {
				state.voice.insert((community, user), room);
			}
		}
	}

	pub fn set_delete_latency(&self, latency: Duration) {
		self.state.lock().delete_latency = Some(latency);
	}

	pub fn calls(&self) -> Vec<MemoryCall> {
		self.state.lock().calls.clone()
	}

	pub fn room(&self, id: RoomId) -> Option<RoomRef> {
		self.state.lock().rooms.get(&id).cloned()
	}

	pub fn room_exists(&self, id: RoomId) -> bool {
		self.state.lock().rooms.contains_key(&id)
	}

	/// Rooms created through the platform, oldest first.
	pub fn created_rooms(&self) -> Vec<RoomId> {
		self.state.lock().created.clone()
	}

	pub fn create_calls(&self) -> usize {
		self.count_calls(|c| matches!(c, MemoryCall::CreateRoom { .. }))
	}

	pub fn delete_calls(&self, room: RoomId) -> usize {
		self.count_calls(|c| *c == MemoryCall::DeleteRoom(room))
	}

	pub fn count_calls(&self, pred: impl Fn(&MemoryCall) -> bool) -> usize {
		self.state.lock().calls.iter().filter(|c| pred(c)).count()
	}

	/// `Some(allowed)` when an overwrite exists for the role.
	pub fn connect_allowed(&self, room: RoomId, role: RoleId) -> Option<bool> {
		self.state.lock().access.get(&(room, role)).copied()
	}

	/// Effective connect permission: no overwrite means allowed.
	pub fn can_connect(&self, room: RoomId, role: RoleId) -> bool {
		self.connect_allowed(room, role).unwrap_or(true)
	}

	pub fn direct_messages(&self, user: UserId) -> Vec<(String, Option<RoomId>)> {
		self.state
			.lock()
			.calls
			.iter()
			.filter_map(|c| match c {
				MemoryCall::DirectMessage { user: u, content, panel } if *u == user => Some((content.clone(), *panel)),
				_ => None,
			})
			.collect()
	}

	pub fn room_messages(&self, room: RoomId) -> Vec<String> {
		self.state
			.lock()
			.calls
			.iter()
			.filter_map(|c| match c {
				MemoryCall::SendToRoom { room: r, content } if *r == room => Some(content.clone()),
				_ => None,
			})
			.collect()
	}

	pub fn interaction_replies(&self) -> Vec<(String, String)> {
		self.state
			.lock()
			.calls
			.iter()
			.filter_map(|c| match c {
				MemoryCall::Respond { interaction, content } => Some((interaction.clone(), content.clone())),
				_ => None,
			})
			.collect()
	}

	/// Record the call and pop an injected failure, if any.
	fn begin(&self, op: MemoryOp, call: MemoryCall) -> Result<(), PlatformError> {
		let mut state = self.state.lock();
		state.calls.push(call);
		match state.failures.get_mut(&op).and_then(VecDeque::pop_front) {
			Some(err) => Err(err),
			None => Ok(()),
		}
	}
}

#[async_trait::async_trait]
impl VoicePlatform for MemoryPlatform {
	async fn create_voice_room(&self, request: CreateRoomRequest) -> Result<RoomRef, PlatformError> {
		self.begin(
			MemoryOp::CreateRoom,
			MemoryCall::CreateRoom {
				community: request.community,
				name: request.name.as_str().to_string(),
			},
		)?;

		let latency = self.state.lock().create_latency;
		if let Some(latency) = latency {
			tokio::time::sleep(latency).await;
		}

		let room = RoomRef {
			id: RoomId::new(self.mint_id()),
			community: request.community,
			name: request.name.into_string(),
			category: request.category,
			position: request.position,
		};
		let mut state = self.state.lock();
		state.rooms.insert(room.id, room.clone());
		state.created.push(room.id);
		Ok(room)
	}

	async fn move_user(&self, community: CommunityId, user: UserId, room: RoomId) -> Result<(), PlatformError> {
		self.begin(MemoryOp::MoveUser, MemoryCall::MoveUser { community, user, room })?;
		let latency = {
			let mut state = self.state.lock();
			if !state.rooms.contains_key(&room) {
				return Err(PlatformError::NotFound(format!("unknown room {room}")));
			}
			if !state.voice.contains_key(&(community, user)) {
				return Err(PlatformError::Rejected("target user is not connected to voice".to_string()));
			}
			if state.defer_moves {
				state.deferred_moves.push((community, user, room));
			} else {
				state.voice.insert((community, user), room);
			}
			state.move_latency
		};
		if let Some(latency) = latency {
			tokio::time::sleep(latency).await;
		}
		Ok(())
	}

	async fn delete_room(&self, room: RoomId) -> Result<(), PlatformError> {
		self.begin(MemoryOp::DeleteRoom, MemoryCall::DeleteRoom(room))?;

		let latency = self.state.lock().delete_latency;
		if let Some(latency) = latency {
			tokio::time::sleep(latency).await;
		}

		let mut state = self.state.lock();
		if state.rooms.remove(&room).is_none() {
			return Err(PlatformError::NotFound(format!("unknown room {room}")));
		}
		state.voice.retain(|_, r| *r != room);
		state.access.retain(|(r, _), _| *r != room);
		Ok(())
	}

	async fn set_room_access(&self, room: RoomId, role: RoleId, connect_allowed: bool) -> Result<(), PlatformError> {
		self.begin(
			MemoryOp::SetAccess,
			MemoryCall::SetAccess {
				room,
				role,
				connect_allowed,
			},
		)?;
		let mut state = self.state.lock();
		if !state.rooms.contains_key(&room) {
			return Err(PlatformError::NotFound(format!("unknown room {room}")));
		}
		state.access.insert((room, role), connect_allowed);
		Ok(())
	}

	async fn rename_room(&self, room: RoomId, name: &RoomName) -> Result<(), PlatformError> {
		self.begin(
			MemoryOp::RenameRoom,
			MemoryCall::RenameRoom {
				room,
				name: name.as_str().to_string(),
			},
		)?;
		let mut state = self.state.lock();
		match state.rooms.get_mut(&room) {
			Some(r) => {
				r.name = name.as_str().to_string();
				Ok(())
			}
			None => Err(PlatformError::NotFound(format!("unknown room {room}"))),
		}
	}

	async fn send_direct_message(
		&self,
		user: UserId,
		content: &str,
		controls: Option<&ControlPanel>,
	) -> Result<(), PlatformError> {
		self.begin(
			MemoryOp::DirectMessage,
			MemoryCall::DirectMessage {
				user,
				content: content.to_string(),
				panel: controls.map(|c| c.room),
			},
		)?;
		if self.state.lock().closed_dms.contains(&user) {
			return Err(PlatformError::Forbidden("cannot send messages to this user".to_string()));
		}
		Ok(())
	}

	async fn send_to_room(&self, room: RoomId, content: &str) -> Result<(), PlatformError> {
		self.begin(
			MemoryOp::SendToRoom,
			MemoryCall::SendToRoom {
				room,
				content: content.to_string(),
			},
		)
	}

	async fn respond_to_interaction(&self, interaction: &InteractionRef, content: &str) -> Result<(), PlatformError> {
		self.begin(
			MemoryOp::Respond,
			MemoryCall::Respond {
				interaction: interaction.id.clone(),
				content: content.to_string(),
			},
		)
	}

	async fn list_communities(&self) -> Result<Vec<CommunityRef>, PlatformError> {
		let mut state = self.state.lock();
		if let Some(err) = state.failures.get_mut(&MemoryOp::ListCommunities).and_then(VecDeque::pop_front) {
			return Err(err);
		}
		Ok(state.communities.clone())
	}

	async fn list_invites(&self, community: CommunityId) -> Result<Vec<InviteRef>, PlatformError> {
		let mut state = self.state.lock();
		if let Some(err) = state.failures.get_mut(&MemoryOp::ListInvites).and_then(VecDeque::pop_front) {
			return Err(err);
		}
		Ok(state.invites.get(&community).cloned().unwrap_or_default())
	}

	async fn default_invite_room(&self, community: CommunityId) -> Result<Option<RoomId>, PlatformError> {
		Ok(self.state.lock().invite_rooms.get(&community).copied())
	}

	async fn create_invite(&self, room: RoomId) -> Result<InviteRef, PlatformError> {
		self.begin(MemoryOp::CreateInvite, MemoryCall::CreateInvite(room))?;
		Ok(InviteRef {
			code: format!("inv{}", self.mint_id()),
		})
	}

	async fn register_commands(&self, application: ApplicationId, specs: &[CommandSpec]) -> Result<(), PlatformError> {
		self.begin(
			MemoryOp::RegisterCommands,
			MemoryCall::RegisterCommands {
				application,
				count: specs.len(),
			},
		)
	}

	fn occupant_count(&self, room: RoomId) -> usize {
		self.state.lock().voice.values().filter(|r| **r == room).count()
	}

	fn current_room(&self, community: CommunityId, user: UserId) -> Option<RoomId> {
		self.state.lock().voice.get(&(community, user)).copied()
	}

	fn default_access_role(&self, community: CommunityId) -> RoleId {
		RoleId::new(community.get())
	}
}
