#![forbid(unsafe_code)]

use std::time::{Duration, SystemTime};

use proptest::prelude::*;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, HeaderValue, RETRY_AFTER};
use serde_json::json;
use tempvoice_domain::{CommunityId, RoomId, UserId};

use super::cache::DiscordCache;
use super::gateway::{DiscordGateway, decode_dispatch};
use super::rest::{classify_status, retry_after_from_headers};
use crate::{ControlCommand, PanelAction, PlatformError, PlatformEvent};

const GUILD: u64 = 100;
const LOBBY: u64 = 200;
const GENERAL: u64 = 201;
const SYSTEM: u64 = 202;

fn seeded_cache() -> DiscordCache {
	let cache = DiscordCache::default();
	let events = decode_dispatch(
		&cache,
		"GUILD_CREATE",
		json!({
			"id": GUILD.to_string(),
			"name": "Test Guild",
			"channels": [
				{ "id": LOBBY.to_string(), "type": 2, "name": "Join to create", "parent_id": "300", "position": 4 },
				{ "id": GENERAL.to_string(), "type": 0, "name": "general", "position": 1 },
			],
			"voice_states": [
				{ "user_id": "7", "channel_id": LOBBY.to_string() },
			],
		}),
		SystemTime::now(),
	)
	.expect("guild create decodes");
	assert!(events.is_empty());
	cache
}

fn voice_update(user: u64, channel: Option<u64>) -> serde_json::Value {
	json!({
		"guild_id": GUILD.to_string(),
		"user_id": user.to_string(),
		"channel_id": channel.map(|c| c.to_string()),
		"member": {
			"nick": null,
			"user": { "id": user.to_string(), "username": "alice", "global_name": "Alice" },
		},
	})
}

#[test]
fn guild_snapshot_seeds_occupancy() {
	let cache = seeded_cache();
	assert_eq!(cache.occupant_count(RoomId::new(LOBBY)), 1);
	assert_eq!(
		cache.current_room(CommunityId::new(GUILD), UserId::new(7)),
		Some(RoomId::new(LOBBY))
	);
	assert_eq!(cache.guild_name(CommunityId::new(GUILD)).as_deref(), Some("Test Guild"));
}

#[test]
fn voice_join_emits_presence_with_room_snapshot() {
	let cache = seeded_cache();
	let events = decode_dispatch(&cache, "VOICE_STATE_UPDATE", voice_update(8, Some(LOBBY)), SystemTime::now())
		.expect("voice state decodes");

	let [PlatformEvent::PresenceChanged(change)] = events.as_slice() else {
		panic!("expected a single presence change, got {events:?}");
	};
	assert!(change.previous.is_none());
	let current = change.current.as_ref().expect("joined a room");
	assert_eq!(current.id, RoomId::new(LOBBY));
	assert_eq!(current.name, "Join to create");
	assert_eq!(current.category, Some(RoomId::new(300)));
	assert_eq!(current.position, 4);
	assert_eq!(change.member.display_name, "Alice");
	assert_eq!(cache.occupant_count(RoomId::new(LOBBY)), 2);
}

#[test]
fn same_room_voice_update_is_suppressed() {
	let cache = seeded_cache();
	let events = decode_dispatch(&cache, "VOICE_STATE_UPDATE", voice_update(7, Some(LOBBY)), SystemTime::now())
		.expect("voice state decodes");
	assert!(events.is_empty(), "mute toggles must not look like moves");
}

#[test]
fn voice_leave_updates_occupancy() {
	let cache = seeded_cache();
	let events = decode_dispatch(&cache, "VOICE_STATE_UPDATE", voice_update(7, None), SystemTime::now())
		.expect("voice state decodes");

	let [PlatformEvent::PresenceChanged(change)] = events.as_slice() else {
		panic!("expected a presence change");
	};
	assert_eq!(change.previous.as_ref().map(|r| r.id), Some(RoomId::new(LOBBY)));
	assert!(change.current.is_none());
	assert_eq!(cache.occupant_count(RoomId::new(LOBBY)), 0);
}

#[test]
fn nickname_wins_over_global_name() {
	let cache = seeded_cache();
	let mut payload = voice_update(9, Some(LOBBY));
	payload["member"]["nick"] = json!("Captain");
	let events = decode_dispatch(&cache, "VOICE_STATE_UPDATE", payload, SystemTime::now()).expect("decodes");
	let [PlatformEvent::PresenceChanged(change)] = events.as_slice() else {
		panic!("expected a presence change");
	};
	assert_eq!(change.member.display_name, "Captain");
}

#[test]
fn channel_delete_reports_last_snapshot_and_clears_presence() {
	let cache = seeded_cache();
	let events = decode_dispatch(
		&cache,
		"CHANNEL_DELETE",
		json!({ "id": LOBBY.to_string(), "type": 2, "guild_id": GUILD.to_string() }),
		SystemTime::now(),
	)
	.expect("channel delete decodes");

	let [PlatformEvent::RoomDeleted(room)] = events.as_slice() else {
		panic!("expected room deleted");
	};
	assert_eq!(room.name, "Join to create");
	assert_eq!(cache.occupant_count(RoomId::new(LOBBY)), 0);
	assert_eq!(cache.current_room(CommunityId::new(GUILD), UserId::new(7)), None);
}

#[test]
fn invite_room_prefers_system_channel() {
	let cache = seeded_cache();
	assert_eq!(cache.invite_room(CommunityId::new(GUILD)), Some(RoomId::new(GENERAL)));

	decode_dispatch(
		&cache,
		"GUILD_CREATE",
		json!({
			"id": GUILD.to_string(),
			"name": "Test Guild",
			"system_channel_id": SYSTEM.to_string(),
			"channels": [],
		}),
		SystemTime::now(),
	)
	.expect("decodes");
	assert_eq!(cache.invite_room(CommunityId::new(GUILD)), Some(RoomId::new(SYSTEM)));
}

#[test]
fn ready_records_self_user() {
	let cache = DiscordCache::default();
	let events = decode_dispatch(
		&cache,
		"READY",
		json!({
			"session_id": "abc",
			"resume_gateway_url": "wss://resume.example",
			"user": { "id": "55", "username": "tempvoice", "bot": true },
			"application": { "id": "66" },
		}),
		SystemTime::now(),
	)
	.expect("ready decodes");

	let [PlatformEvent::Ready(info)] = events.as_slice() else {
		panic!("expected ready");
	};
	assert_eq!(info.session_id, "abc");
	assert_eq!(info.application.map(|a| a.get()), Some(66));
	assert_eq!(cache.self_user(), Some(UserId::new(55)));
}

#[test]
fn guild_and_direct_messages_are_distinguished() {
	let cache = DiscordCache::default();
	let guild_msg = decode_dispatch(
		&cache,
		"MESSAGE_CREATE",
		json!({
			"id": "1", "channel_id": "2", "guild_id": "3", "content": "hi",
			"author": { "id": "4", "username": "bob" },
		}),
		SystemTime::now(),
	)
	.expect("decodes");
	let [PlatformEvent::MessagePosted(ev)] = guild_msg.as_slice() else {
		panic!("expected posted message");
	};
	assert!(!ev.is_direct());
	assert_eq!(ev.author.display_name, "bob");

	let dm = decode_dispatch(
		&cache,
		"MESSAGE_CREATE",
		json!({ "id": "1", "channel_id": "2", "content": "psst", "author": { "id": "4", "username": "bob" } }),
		SystemTime::now(),
	)
	.expect("decodes");
	let [PlatformEvent::MessagePosted(ev)] = dm.as_slice() else {
		panic!("expected posted message");
	};
	assert!(ev.is_direct());
}

#[test]
fn content_less_message_update_is_dropped() {
	let cache = DiscordCache::default();
	let events = decode_dispatch(
		&cache,
		"MESSAGE_UPDATE",
		json!({ "id": "1", "channel_id": "2", "guild_id": "3", "author": { "id": "4", "username": "bob" } }),
		SystemTime::now(),
	)
	.expect("decodes");
	assert!(events.is_empty());
}

#[test]
fn rename_command_carries_new_name() {
	let cache = DiscordCache::default();
	let events = decode_dispatch(
		&cache,
		"INTERACTION_CREATE",
		json!({
			"id": "900", "token": "tok", "type": 2, "guild_id": GUILD.to_string(),
			"member": { "user": { "id": "7", "username": "alice" } },
			"data": { "name": "rename", "options": [{ "name": "new_name", "value": "Chill zone" }] },
		}),
		SystemTime::now(),
	)
	.expect("decodes");

	let [PlatformEvent::Command(inv)] = events.as_slice() else {
		panic!("expected command");
	};
	assert_eq!(
		inv.command,
		ControlCommand::Rename {
			new_name: "Chill zone".to_string()
		}
	);
	assert_eq!(inv.member.id, UserId::new(7));
	assert_eq!(inv.interaction.token.expose(), "tok");
}

#[test]
fn panel_press_is_decoded_from_dm_component() {
	let cache = DiscordCache::default();
	let events = decode_dispatch(
		&cache,
		"INTERACTION_CREATE",
		json!({
			"id": "901", "token": "tok", "type": 3,
			"user": { "id": "7", "username": "alice" },
			"data": { "custom_id": PanelAction::Unlock.custom_id(RoomId::new(42)) },
		}),
		SystemTime::now(),
	)
	.expect("decodes");

	let [PlatformEvent::PanelPressed(press)] = events.as_slice() else {
		panic!("expected panel press");
	};
	assert_eq!(press.action, PanelAction::Unlock);
	assert_eq!(press.room, RoomId::new(42));
}

#[test]
fn unknown_commands_and_dispatches_are_ignored() {
	let cache = DiscordCache::default();
	let events = decode_dispatch(
		&cache,
		"INTERACTION_CREATE",
		json!({
			"id": "1", "token": "t", "type": 2,
			"user": { "id": "7", "username": "alice" },
			"data": { "name": "kick" },
		}),
		SystemTime::now(),
	)
	.expect("decodes");
	assert!(events.is_empty());

	let events = decode_dispatch(&cache, "TYPING_START", json!({}), SystemTime::now()).expect("ignored");
	assert!(events.is_empty());
}

#[test]
fn malformed_dispatch_is_an_error() {
	let cache = DiscordCache::default();
	assert!(decode_dispatch(&cache, "VOICE_STATE_UPDATE", json!({ "guild_id": 5 }), SystemTime::now()).is_err());
}

#[test]
fn status_mapping() {
	assert_eq!(
		classify_status(StatusCode::TOO_MANY_REQUESTS, None, r#"{"retry_after": 1.5}"#, "x"),
		PlatformError::RateLimited {
			retry_after: Some(Duration::from_millis(1500))
		}
	);
	assert_eq!(
		classify_status(
			StatusCode::TOO_MANY_REQUESTS,
			Some(Duration::from_secs(3)),
			r#"{"retry_after": 1.5}"#,
			"x"
		)
		.retry_after(),
		Some(Duration::from_secs(3))
	);
	assert!(classify_status(StatusCode::NOT_FOUND, None, "", "x").is_not_found());
	assert!(matches!(
		classify_status(StatusCode::FORBIDDEN, None, "", "x"),
		PlatformError::Forbidden(_)
	));
	assert_eq!(
		classify_status(StatusCode::GATEWAY_TIMEOUT, None, "", "x"),
		PlatformError::Timeout
	);
	assert!(classify_status(StatusCode::BAD_GATEWAY, None, "", "x").is_transient());
	assert!(matches!(
		classify_status(StatusCode::BAD_REQUEST, None, "", "x"),
		PlatformError::Rejected(_)
	));
}

#[test]
fn retry_after_header_parsing() {
	let mut headers = HeaderMap::new();
	assert_eq!(retry_after_from_headers(&headers), None);
	headers.insert(RETRY_AFTER, HeaderValue::from_static("2"));
	assert_eq!(retry_after_from_headers(&headers), Some(Duration::from_secs(2)));
	headers.insert(RETRY_AFTER, HeaderValue::from_static("soon"));
	assert_eq!(retry_after_from_headers(&headers), None);
}

proptest! {
	#[test]
	fn reconnect_backoff_stays_in_bounds(attempt in 0u32..64, min_ms in 1u64..5_000, extra_ms in 0u64..120_000) {
		let min = Duration::from_millis(min_ms);
		let max = min + Duration::from_millis(extra_ms);
		let d = DiscordGateway::backoff_delay(attempt, min, max);
		prop_assert!(d >= min);
		prop_assert!(d <= max);
	}

	#[test]
	fn occupancy_matches_last_voice_state(moves in proptest::collection::vec((1u64..6, proptest::option::of(0u64..3)), 0..40)) {
		let cache = DiscordCache::default();
		let mut expected = std::collections::HashMap::new();
		for (user, room) in moves {
			let room = room.map(|r| LOBBY + r);
			let _ = decode_dispatch(&cache, "VOICE_STATE_UPDATE", voice_update(user, room), SystemTime::now());
			match room {
				Some(r) => { expected.insert(user, r); }
				None => { expected.remove(&user); }
			}
		}
		for r in 0..3u64 {
			let want = expected.values().filter(|v| **v == LOBBY + r).count();
			prop_assert_eq!(cache.occupant_count(RoomId::new(LOBBY + r)), want);
		}
	}
}
