//! The proxy: one per client host. Routes each request frame to a load
//! balancer for the named service and relays replies back by identity; it
//! keeps no per-request state of its own.

pub mod pool;
pub mod services;

use fabric_core::prelude::*;
use fabric_core::readiness::Ready;
use fabric_core::signal::Shutdown;
use tokio::sync::mpsc;

use crate::config::ProxyConfig;
use crate::coord::CoordClient;
use crate::envelope::Envelope;
use crate::thrift::{self, ErrorEncoder};
use crate::transport::Router;
use self::services::ServiceStore;

const REPLY_QUEUE: usize = 1024;

enum Event {
	Frontend(Option<Envelope>),
	Backend(Option<Envelope>),
	Signal,
}

pub struct Proxy {
	frontend: Router,
	services: Arc<ServiceStore>,
	replies: mpsc::Receiver<Envelope>,
	errors: Arc<dyn ErrorEncoder>,
}

impl Proxy {
	pub async fn bind(
		cfg: ProxyConfig,
		store: Arc<dyn CoordClient>,
		errors: Arc<dyn ErrorEncoder>,
	) -> anyhow::Result<Proxy> {
		use anyhow::Context as _;
		let frontend = Router::bind(&cfg.frontend)
			.await
			.with_context(|| format!("bind frontend {}", cfg.frontend))?;
		let (reply_tx, replies) = mpsc::channel(REPLY_QUEUE);
		let services = ServiceStore::new(store, &cfg.product, reply_tx);
		info!(frontend = %frontend.endpoint(), product = %cfg.product, "proxy bound");
		Ok(Proxy {
			frontend,
			services,
			replies,
			errors,
		})
	}

	pub fn endpoint(&self) -> String {
		self.frontend.endpoint()
	}

	pub fn services(&self) -> &Arc<ServiceStore> {
		&self.services
	}

	pub async fn run(self, mut shutdown: Shutdown) -> anyhow::Result<()> {
		let Proxy {
			mut frontend,
			services,
			mut replies,
			errors,
		} = self;

		let ready = Ready::new();
		tokio::spawn(services::run_discovery(
			services.clone(),
			ready.register_task("service discovery"),
		));
		tokio::spawn(services::run_purge(services.clone()));

		loop {
			let event = tokio::select! {
				env = frontend.recv() => Event::Frontend(env),
				env = replies.recv() => Event::Backend(env),
				_ = shutdown.recv() => Event::Signal,
			};
			match event {
				Event::Frontend(Some(env)) => {
					handle_request(env, &services, &frontend, errors.as_ref());
				},
				Event::Backend(Some(env)) => {
					let env = env.trim_leading_empty();
					if env.len() == 1 {
						// Reserved backend control channel; nothing consumes
						// it yet.
						debug!("dropping single-frame backend control message");
					} else if !env.is_empty() {
						frontend.send(env);
					}
				},
				Event::Frontend(None) | Event::Backend(None) => {
					error!("socket closed, stopping proxy");
					break;
				},
				Event::Signal => {
					info!("shutting down proxy");
					break;
				},
			}
		}
		services.shutdown();
		Ok(())
	}
}

/// Routes one client request: look the service up, round-robin a backend,
/// forward. Failures with a known reply path answer with a synthesized
/// error payload rather than dropping silently.
fn handle_request(
	env: Envelope,
	services: &ServiceStore,
	frontend: &Router,
	errors: &dyn ErrorEncoder,
) {
	let Some((client_id, rest)) = env.split_head() else {
		debug!("dropping empty request envelope");
		return;
	};
	let Some((service_frame, payload)) = rest.split_head() else {
		debug!(client = ?client_id, "dropping request without service frame");
		return;
	};
	let service = String::from_utf8_lossy(&service_frame).into_owned();

	let Some(backend) = services.get(&service) else {
		debug!(service = %service, "service not found");
		let seq = payload.last().map(|f| thrift::seq_id(f)).unwrap_or(0);
		reply_error(frontend, client_id, payload, errors.service_not_found(&service, seq));
		return;
	};
	match backend.pool.next_socket() {
		Some(socket) => {
			trace!(service = %service, addr = %socket.addr(), "forwarding request");
			let mut frames = Vec::with_capacity(payload.len() + 3);
			frames.push(Bytes::new());
			frames.push(client_id);
			frames.push(Bytes::new());
			frames.extend(payload.into_frames());
			socket.send(Envelope::new(frames));
		},
		None => {
			debug!(service = %service, "no live backend");
			let seq = payload.last().map(|f| thrift::seq_id(f)).unwrap_or(0);
			reply_error(frontend, client_id, payload, errors.worker_not_found(&service, seq));
		},
	}
}

/// `<client_id, "", payload[..-1], error>`: the error payload replaces the
/// request body, any intermediate routing frames are preserved.
fn reply_error(frontend: &Router, client_id: Bytes, payload: Envelope, error: Bytes) {
	let body = payload.into_frames();
	let mut frames = Vec::with_capacity(body.len() + 2);
	frames.push(client_id);
	frames.push(Bytes::new());
	if body.len() > 1 {
		frames.extend(body[..body.len() - 1].iter().cloned());
	}
	frames.push(error);
	frontend.send(Envelope::new(frames));
}
