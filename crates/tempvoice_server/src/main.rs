#![forbid(unsafe_code)]

mod config;
mod server;
mod util;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tempvoice_platform::discord::{self, DiscordConfig};
use tempvoice_platform::{GatewayControl, VoicePlatform, bounded_gateway_channels};
use tracing::{debug, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::ServerConfig;
use crate::server::access::AccessController;
use crate::server::audit::AuditLogger;
use crate::server::control::{ControlSettings, ControlSurface};
use crate::server::health::{HealthState, spawn_health_server};
use crate::server::lifecycle::{LifecycleConfig, LifecycleController};
use crate::server::registry::ChannelRegistry;
use crate::server::retry::RetryPolicy;
use crate::server::router::{EventRouter, spawn_event_router, spawn_gateway};

const GATEWAY_CONTROL_CAPACITY: usize = 16;
const GATEWAY_EVENTS_CAPACITY: usize = 4_096;
const COOLDOWN_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: tempvoice_server [--config path]\n\
\n\
Options:\n\
\t--config  Config file (default: ~/.tempvoice/config.toml)\n\
\t--help    Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> Option<PathBuf> {
	let mut config_path = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--config" | "-c" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--config must be non-empty");
					usage_and_exit();
				}
				config_path = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	config_path
}

fn init_rustls_crypto_provider() {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tempvoice_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("tempvoice_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

fn discord_config(cfg: &ServerConfig) -> anyhow::Result<DiscordConfig> {
	let mut discord_cfg = DiscordConfig::new(cfg.require_token()?);
	if let Some(url) = cfg.discord.api_base_url.clone() {
		discord_cfg.api_base_url = url;
	}
	if let Some(url) = cfg.discord.gateway_url.clone() {
		discord_cfg.gateway_url = url;
	}
	if let Some(min) = cfg.discord.reconnect_min_delay {
		discord_cfg.reconnect_min_delay = min;
	}
	if let Some(max) = cfg.discord.reconnect_max_delay {
		discord_cfg.reconnect_max_delay = max;
	}
	Ok(discord_cfg)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_rustls_crypto_provider();
	init_tracing();

	let config_path = match parse_args() {
		Some(path) => path,
		None => crate::config::default_config_path()?,
	};
	let server_cfg = crate::config::load_server_config_from_path(&config_path)
		.with_context(|| format!("load config from {}", config_path.display()))?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let (rest, gateway) = discord::connect(discord_config(&server_cfg)?).context("set up discord client")?;
	let platform: Arc<dyn VoicePlatform> = Arc::new(rest);

	let lifecycle_cfg = &server_cfg.lifecycle;
	let retry = RetryPolicy::new(lifecycle_cfg.max_retries, lifecycle_cfg.retry_base_delay);
	let registry = Arc::new(ChannelRegistry::new());

	let health_state = HealthState::new(Arc::clone(&registry));
	if let Some(bind) = server_cfg.server.health_bind.as_deref() {
		match bind.parse::<std::net::SocketAddr>() {
			Ok(addr) => spawn_health_server(addr, health_state.clone()),
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	let access = Arc::new(AccessController::new(
		Arc::clone(&platform),
		Arc::clone(&registry),
		retry,
	));
	let control = Arc::new(ControlSurface::new(
		Arc::clone(&platform),
		access,
		ControlSettings {
			cooldown: lifecycle_cfg.cooldown,
			rename_timeout: lifecycle_cfg.rename_timeout,
			retry,
		},
	));
	let lifecycle = Arc::new(LifecycleController::new(
		Arc::clone(&platform),
		Arc::clone(&registry),
		Arc::clone(&control),
		LifecycleConfig {
			trigger_room_name: lifecycle_cfg.trigger_room_name.clone(),
			creation_hold: lifecycle_cfg.cooldown_hold,
			retry,
		},
	));
	let audit = Arc::new(AuditLogger::new(Arc::clone(&platform), lifecycle_cfg.audit_sink_room));
	if audit.sink().is_none() {
		info!("no audit sink room configured; activity mirroring disabled");
	}

	let router = Arc::new(EventRouter::new(
		Arc::clone(&platform),
		Arc::clone(&lifecycle),
		Arc::clone(&control),
		audit,
		health_state,
	));

	let (control_tx, control_rx, events_tx, events_rx) =
		bounded_gateway_channels(GATEWAY_CONTROL_CAPACITY, GATEWAY_EVENTS_CAPACITY);
	let gateway_task = spawn_gateway(Box::new(gateway), control_rx, events_tx);
	let _router_task = spawn_event_router(router, events_rx);

	{
		let lifecycle = Arc::clone(&lifecycle);
		let control = Arc::clone(&control);
		tokio::spawn(async move {
			let mut ticker = tokio::time::interval(COOLDOWN_SWEEP_INTERVAL);
			loop {
				ticker.tick().await;
				let creation = lifecycle.purge_cooldowns();
				let actions = control.purge_rate_limits();
				if creation + actions > 0 {
					debug!(creation, actions, "purged expired cooldowns");
				}
			}
		});
	}

	info!(
		trigger = %lifecycle_cfg.trigger_room_name,
		"tempvoice_server running; waiting for gateway ready"
	);

	tokio::select! {
		res = tokio::signal::ctrl_c() => {
			res.context("listen for ctrl-c")?;
			info!("shutdown requested");
			if control_tx.send(GatewayControl::Shutdown).await.is_err() {
				debug!("gateway already stopped");
			}
			if tokio::time::timeout(Duration::from_secs(5), gateway_task).await.is_err() {
				warn!("gateway did not stop within 5s");
			}
		}
		_ = control_tx.closed() => {
			warn!("gateway stopped; exiting");
		}
	}

	info!(live_channels = registry.len(), "tempvoice_server exiting");
	Ok(())
}

