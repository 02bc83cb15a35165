#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::server::registry::ChannelRegistry;
use crate::util::time::unix_ms_now;

#[derive(Clone)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
	connected: Arc<AtomicBool>,
	registry: Arc<ChannelRegistry>,
	started_at_unix_ms: i64,
}

#[derive(Debug, Serialize)]
struct Stats {
	live_channels: usize,
	ready: bool,
	gateway_connected: bool,
	started_at_unix_ms: i64,
}

impl HealthState {
	pub fn new(registry: Arc<ChannelRegistry>) -> Self {
		Self {
			ready: Arc::new(AtomicBool::new(false)),
			connected: Arc::new(AtomicBool::new(false)),
			registry,
			started_at_unix_ms: unix_ms_now(),
		}
	}

	/// Gateway session is up and commands are registered.
	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
		self.connected.store(true, Ordering::Relaxed);
	}

	/// Any gateway traffic means the session is up again (including after a resume).
	pub fn mark_connected(&self) {
		self.connected.store(true, Ordering::Relaxed);
	}

	pub fn mark_disconnected(&self) {
		self.connected.store(false, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed) && self.connected.load(Ordering::Relaxed)
	}

	fn stats(&self) -> Stats {
		Stats {
			live_channels: self.registry.len(),
			ready: self.ready.load(Ordering::Relaxed),
			gateway_connected: self.connected.load(Ordering::Relaxed),
			started_at_unix_ms: self.started_at_unix_ms,
		}
	}
}

pub fn spawn_health_server(bind: SocketAddr, state: HealthState) {
	tokio::spawn(async move {
		if let Err(err) = run_health_server(bind, state).await {
			warn!(error = %err, "health server stopped");
		}
	});
}

async fn run_health_server(bind: SocketAddr, state: HealthState) -> anyhow::Result<()> {
	let listener = TcpListener::bind(bind).await?;
	info!(%bind, "health endpoint listening");
	loop {
		let (stream, _addr) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let state = state.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| handle_health(req, state.clone()));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				warn!(error = %err, "health connection error");
			}
		});
	}
}

async fn handle_health(req: Request<Incoming>, state: HealthState) -> Result<Response<Full<Bytes>>, hyper::Error> {
	Ok(route(req.method(), req.uri().path(), &state))
}

fn respond(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
	let mut resp = Response::new(Full::new(body.into()));
	*resp.status_mut() = status;
	resp
}

fn route(method: &Method, path: &str, state: &HealthState) -> Response<Full<Bytes>> {
	if method != Method::GET {
		return respond(StatusCode::METHOD_NOT_ALLOWED, Bytes::new());
	}

	match path {
		"/healthz" => respond(StatusCode::OK, Bytes::from_static(b"ok")),
		"/readyz" => {
			if state.is_ready() {
				respond(StatusCode::OK, Bytes::from_static(b"ready"))
			} else {
				respond(StatusCode::SERVICE_UNAVAILABLE, Bytes::from_static(b"not-ready"))
			}
		}
		"/stats" => match serde_json::to_vec(&state.stats()) {
			Ok(body) => {
				let mut resp = respond(StatusCode::OK, body);
				resp.headers_mut()
					.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
				resp
			}
			Err(e) => respond(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
		},
		_ => respond(StatusCode::NOT_FOUND, Bytes::new()),
	}
}

#[cfg(test)]
mod tests {
	use http_body_util::BodyExt;
	use tempvoice_domain::{CommunityId, RoomId, UserId};

	use super::*;
	use crate::server::registry::EphemeralChannel;

	async fn body_of(resp: Response<Full<Bytes>>) -> Bytes {
		match resp.into_body().collect().await {
			Ok(collected) => collected.to_bytes(),
			Err(never) => match never {},
		}
	}

	#[tokio::test]
	async fn readiness_follows_gateway_state() {
		let state = HealthState::new(Arc::new(ChannelRegistry::new()));
		assert_eq!(route(&Method::GET, "/healthz", &state).status(), StatusCode::OK);
		assert_eq!(route(&Method::GET, "/readyz", &state).status(), StatusCode::SERVICE_UNAVAILABLE);

		state.mark_ready();
		assert_eq!(route(&Method::GET, "/readyz", &state).status(), StatusCode::OK);

		state.mark_disconnected();
		assert_eq!(route(&Method::GET, "/readyz", &state).status(), StatusCode::SERVICE_UNAVAILABLE);

		assert_eq!(route(&Method::POST, "/healthz", &state).status(), StatusCode::METHOD_NOT_ALLOWED);
		assert_eq!(route(&Method::GET, "/nope", &state).status(), StatusCode::NOT_FOUND);
	}

	#[tokio::test]
	async fn stats_report_live_channels() {
		let registry = Arc::new(ChannelRegistry::new());
		registry.register(EphemeralChannel::provisioning(
			RoomId::new(5),
			CommunityId::new(1),
			UserId::new(2),
			None,
			0,
		));
		let state = HealthState::new(registry);

		let resp = route(&Method::GET, "/stats", &state);
		assert_eq!(resp.status(), StatusCode::OK);
		let json: serde_json::Value = serde_json::from_slice(&body_of(resp).await).expect("json");
		assert_eq!(json["live_channels"], 1);
		assert_eq!(json["ready"], false);
	}
}
