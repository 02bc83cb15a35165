#![forbid(unsafe_code)]

use std::sync::Arc;

use tempvoice_platform::{
	GatewayAdapter, GatewayControlRx, PlatformEvent, PlatformEventRx, PlatformEventTx, PresenceChange, ReadyInfo,
	VoicePlatform,
};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::server::audit::AuditLogger;
use crate::server::control::{ControlSurface, command_specs};
use crate::server::health::HealthState;
use crate::server::lifecycle::{LifecycleController, VoiceEvent};

/// Map a presence transition to Join, Leave or Move. Same-room updates (mute, deafen) map to nothing.
pub fn normalize(change: &PresenceChange) -> Option<VoiceEvent> {
	let community = change.community;
	let member = change.member.clone();
	match (&change.previous, &change.current) {
		(None, Some(room)) => Some(VoiceEvent::Join {
			community,
			member,
			room: room.clone(),
		}),
		(Some(room), None) => Some(VoiceEvent::Leave {
			community,
			member,
			room: room.clone(),
		}),
		(Some(from), Some(to)) if from.id != to.id => Some(VoiceEvent::Move {
			community,
			member,
			from: from.clone(),
			to: to.clone(),
		}),
		_ => None,
	}
}

/// Fans platform notifications out to the core components.
pub struct EventRouter {
	platform: Arc<dyn VoicePlatform>,
	lifecycle: Arc<LifecycleController>,
	control: Arc<ControlSurface>,
	audit: Arc<AuditLogger>,
	health: HealthState,
}

impl EventRouter {
	pub fn new(
		platform: Arc<dyn VoicePlatform>,
		lifecycle: Arc<LifecycleController>,
		control: Arc<ControlSurface>,
		audit: Arc<AuditLogger>,
		health: HealthState,
	) -> Self {
		Self {
			platform,
			lifecycle,
			control,
			audit,
			health,
		}
	}

	/// Handle one notification to completion.
	pub async fn dispatch(&self, ev: PlatformEvent) {
		metrics::counter!("tempvoice_events_total", "kind" => ev.kind()).increment(1);
		self.audit.observe(&ev);
		if !matches!(ev, PlatformEvent::Disconnected { .. }) {
			self.health.mark_connected();
		}

		match ev {
			PlatformEvent::Ready(ready) => self.on_ready(ready).await,
			PlatformEvent::PresenceChanged(change) => {
				if let Some(voice) = normalize(&change) {
					self.lifecycle.handle(voice).await;
				}
			}
			PlatformEvent::MessagePosted(msg) => {
				if msg.is_direct() {
					self.control.on_direct_message(&msg).await;
				}
			}
			PlatformEvent::MessageChanged(_) | PlatformEvent::MessageRemoved(_) => {}
			PlatformEvent::Command(inv) => {
				let _ = self.control.on_command(&inv).await;
			}
			PlatformEvent::PanelPressed(press) => {
				let _ = self.control.on_panel(&press).await;
			}
			PlatformEvent::RoomDeleted(room) => self.lifecycle.on_room_deleted(room.id).await,
			PlatformEvent::Disconnected { detail } => {
				warn!(%detail, "gateway disconnected");
				self.health.mark_disconnected();
			}
		}
	}

	async fn on_ready(&self, ready: ReadyInfo) {
		info!(user = %ready.user, session = %ready.session_id, "gateway ready");
		self.health.mark_ready();

		match ready.application {
			Some(application) => {
				let specs = command_specs();
				match self.platform.register_commands(application, &specs).await {
					Ok(()) => info!(count = specs.len(), "slash commands registered"),
					Err(e) => warn!(error = %e, "slash command registration failed"),
				}
			}
			None => debug!("no application id on ready; skipping command registration"),
		}

		self.audit.announce_startup().await;
	}
}

/// Drain the gateway event channel, one task per notification.
pub fn spawn_event_router(router: Arc<EventRouter>, mut events_rx: PlatformEventRx) -> JoinHandle<()> {
	tokio::spawn(async move {
		info!("event router started");
		while let Some(ev) = events_rx.recv().await {
			let router = Arc::clone(&router);
			tokio::spawn(async move {
				router.dispatch(ev).await;
			});
		}
		info!("event router exiting (gateway event channel closed)");
	})
}

/// Run a gateway adapter in the background.
pub fn spawn_gateway(
	adapter: Box<dyn GatewayAdapter>,
	control_rx: GatewayControlRx,
	events_tx: PlatformEventTx,
) -> JoinHandle<()> {
	let name = adapter.name();
	tokio::spawn(async move {
		match adapter.run(control_rx, events_tx).await {
			Ok(()) => info!(gateway = name, "gateway task finished"),
			Err(e) => warn!(gateway = name, error = %e, "gateway task exited with error"),
		}
	})
}
