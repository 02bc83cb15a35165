#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tempvoice_domain::{ApplicationId, RoomId, UserId};
use tempvoice_platform::memory::MemoryCall;
use tempvoice_platform::{
	MemberRef, PanelAction, PanelPress, PlatformEvent, PresenceChange, ReadyInfo, RoomRef, VoicePlatform,
	bounded_gateway_channels,
};

use crate::server::audit::AuditLogger;
use crate::server::health::HealthState;
use crate::server::lifecycle::VoiceEvent;
use crate::server::router::{EventRouter, normalize, spawn_event_router};
use crate::server::test_support::{ALICE, GUILD, Harness, direct_message, interaction, settle};

fn change(previous: Option<RoomRef>, current: Option<RoomRef>) -> PresenceChange {
	PresenceChange {
		community: GUILD,
		member: MemberRef::new(ALICE, "Alice"),
		previous,
		current,
		time: SystemTime::now(),
	}
}

fn room(id: u64) -> RoomRef {
	RoomRef {
		id: RoomId::new(id),
		community: GUILD,
		name: format!("room-{id}"),
		category: None,
		position: 0,
	}
}

fn router(h: &Harness, sink: Option<RoomId>) -> (EventRouter, HealthState) {
	let health = HealthState::new(Arc::clone(&h.registry));
	let router = EventRouter::new(
		h.platform.clone(),
		Arc::clone(&h.lifecycle),
		Arc::clone(&h.control),
		Arc::new(AuditLogger::new(h.platform.clone(), sink)),
		health.clone(),
	);
	(router, health)
}

#[test]
fn normalize_maps_transitions() {
	assert!(matches!(normalize(&change(None, Some(room(1)))), Some(VoiceEvent::Join { .. })));
	assert!(matches!(normalize(&change(Some(room(1)), None)), Some(VoiceEvent::Leave { .. })));
	match normalize(&change(Some(room(1)), Some(room(2)))) {
		Some(VoiceEvent::Move { from, to, .. }) => {
			assert_eq!(from.id, RoomId::new(1));
			assert_eq!(to.id, RoomId::new(2));
		}
		other => panic!("expected move, got {other:?}"),
	}
}

#[test]
fn same_room_and_empty_updates_are_dropped() {
	assert_eq!(normalize(&change(Some(room(1)), Some(room(1)))), None);
	assert_eq!(normalize(&change(None, None)), None);
}

#[tokio::test(start_paused = true)]
async fn presence_join_creates_and_leave_collects() {
	let h = Harness::new();
	let (router, _) = router(&h, None);

	h.platform.place_user(GUILD, ALICE, h.trigger.id);
	router
		.dispatch(PlatformEvent::PresenceChanged(Box::new(change(None, Some(h.trigger.clone())))))
		.await;
	assert_eq!(h.registry.len(), 1);
	let created = h.platform.created_rooms()[0];

	h.platform.remove_user(GUILD, ALICE);
	router
		.dispatch(PlatformEvent::PresenceChanged(Box::new(change(Some(h.room_ref(created)), None))))
		.await;
	assert!(h.registry.is_empty());
	assert!(!h.platform.room_exists(created));
}

#[tokio::test(start_paused = true)]
async fn ready_registers_commands_and_reports() {
	let h = Harness::new();
	let sink = h.platform.add_room(GUILD, "log").id;
	let (router, health) = router(&h, Some(sink));
	assert!(!health.is_ready());

	router
		.dispatch(PlatformEvent::Ready(ReadyInfo {
			user: UserId::new(1000),
			application: Some(ApplicationId::new(1000)),
			session_id: "s".to_string(),
		}))
		.await;
	settle().await;

	assert!(health.is_ready());
	assert_eq!(
		h.platform.count_calls(|c| matches!(c, MemoryCall::RegisterCommands { count: 3, .. })),
		1
	);
	let mirrored = h.platform.room_messages(sink);
	assert!(mirrored.iter().any(|m| m.starts_with("✅ Started in 1 communities:")), "{mirrored:?}");

	router
		.dispatch(PlatformEvent::Disconnected {
			detail: "close 1006".to_string(),
		})
		.await;
	assert!(!health.is_ready());

	// A resumed session sends no Ready; ordinary traffic restores readiness.
	router
		.dispatch(PlatformEvent::PresenceChanged(Box::new(change(Some(room(1)), Some(room(1))))))
		.await;
	assert!(health.is_ready());
}

#[tokio::test(start_paused = true)]
async fn direct_messages_reach_pending_renames() {
	let h = Harness::new();
	let (router, _) = router(&h, None);
	let room = h.create_for(ALICE, "Alice").await;
	h.control
		.on_panel(&PanelPress {
			interaction: interaction("p"),
			member: MemberRef::new(ALICE, "Alice"),
			room,
			action: PanelAction::Rename,
		})
		.await
		.expect("prompt");

	router
		.dispatch(PlatformEvent::MessagePosted(Box::new(direct_message(ALICE, "Via Router"))))
		.await;
	assert_eq!(h.room_name(room), "Via Router");
}

#[tokio::test(start_paused = true)]
async fn external_room_deletion_unregisters() {
	let h = Harness::new();
	let (router, _) = router(&h, None);
	let room = h.create_for(ALICE, "Alice").await;

	router.dispatch(PlatformEvent::RoomDeleted(h.room_ref(room))).await;
	assert!(h.registry.is_empty());
	assert_eq!(h.platform.delete_calls(room), 0);
}

#[tokio::test(start_paused = true)]
async fn spawned_router_drains_the_event_channel() {
	let h = Harness::new();
	let (router, _) = router(&h, None);
	let (_control_tx, _control_rx, events_tx, events_rx) = bounded_gateway_channels(4, 16);
	let task = spawn_event_router(Arc::new(router), events_rx);

	h.platform.place_user(GUILD, ALICE, h.trigger.id);
	events_tx
		.send(PlatformEvent::PresenceChanged(Box::new(change(None, Some(h.trigger.clone())))))
		.await
		.expect("send");
	drop(events_tx);

	tokio::time::timeout(Duration::from_secs(5), task)
		.await
		.expect("router exits when the channel closes")
		.expect("router task");
	settle().await;

	assert_eq!(h.registry.len(), 1);
	assert!(h.platform.current_room(GUILD, ALICE).is_some());
}
