//! The load balancer: one per worker host per service. Frontend faces
//! proxies, backend faces local workers; the worker queue decides who gets
//! the next request.

pub mod queue;
pub mod registration;

use std::sync::RwLock;

use fabric_core::prelude::*;
use fabric_core::readiness::Ready;
use fabric_core::signal::Shutdown;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;

use crate::config::LbConfig;
use crate::coord::{CoordClient, EndpointInfo, Paths, lb_identity};
use crate::envelope::{self, Envelope, Opcode};
use crate::thrift::{self, ErrorEncoder};
use crate::transport::Router;
use self::queue::{HEARTBEAT_INTERVAL, WorkerQueue};

/// How long a draining balancer keeps relaying before it exits; refreshed
/// by any data traffic.
const DRAIN_GRACE: Duration = Duration::from_secs(3);

#[derive(Clone, Copy)]
enum DrainState {
	Running,
	Draining { deadline: Instant },
}

enum Event {
	Backend(Option<Envelope>),
	Frontend(Option<Envelope>),
	Tick,
	Signal,
}

pub struct LoadBalancer {
	cfg: LbConfig,
	frontend: Router,
	backend: Router,
	store: Arc<dyn CoordClient>,
	errors: Arc<dyn ErrorEncoder>,
	paths: Paths,
	identity: String,
	endpoint: EndpointInfo,
	alive: Arc<RwLock<bool>>,
}

impl LoadBalancer {
	pub async fn bind(
		cfg: LbConfig,
		store: Arc<dyn CoordClient>,
		errors: Arc<dyn ErrorEncoder>,
	) -> anyhow::Result<LoadBalancer> {
		use anyhow::Context as _;
		let frontend = Router::bind(&cfg.frontend)
			.await
			.with_context(|| format!("bind frontend {}", cfg.frontend))?;
		let backend = Router::bind(&cfg.backend)
			.await
			.with_context(|| format!("bind backend {}", cfg.backend))?;
		// Publish the addresses actually bound, so port 0 works.
		let endpoint = EndpointInfo {
			frontend: frontend.endpoint(),
			backend: backend.endpoint(),
		};
		let identity = lb_identity(&endpoint.frontend);
		let paths = Paths::new(&cfg.product);
		info!(
			service = %cfg.service,
			frontend = %endpoint.frontend,
			backend = %endpoint.backend,
			"load balancer bound"
		);
		Ok(LoadBalancer {
			cfg,
			frontend,
			backend,
			store,
			errors,
			paths,
			identity,
			endpoint,
			alive: Arc::new(RwLock::new(true)),
		})
	}

	pub fn frontend_endpoint(&self) -> &str {
		&self.endpoint.frontend
	}

	pub fn backend_endpoint(&self) -> &str {
		&self.endpoint.backend
	}

	pub async fn run(self, mut shutdown: Shutdown) -> anyhow::Result<()> {
		let LoadBalancer {
			cfg,
			mut frontend,
			mut backend,
			store,
			errors,
			paths,
			identity,
			endpoint,
			alive,
		} = self;

		let ready = Ready::new();
		let registered = ready.register_task("registration");
		registration::register(store.as_ref(), &paths, &cfg.service, &identity, &endpoint).await?;
		drop(registered);

		let reg_token = CancellationToken::new();
		tokio::spawn(registration::run(
			store.clone(),
			paths.clone(),
			cfg.service.clone(),
			identity.clone(),
			endpoint.clone(),
			alive.clone(),
			reg_token.clone(),
		));

		let mut queue = WorkerQueue::new();
		let mut heartbeat = interval(HEARTBEAT_INTERVAL);
		heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
		let mut drain = DrainState::Running;

		loop {
			let running = matches!(drain, DrainState::Running);
			let event = tokio::select! {
				env = backend.recv() => Event::Backend(env),
				env = frontend.recv() => Event::Frontend(env),
				_ = heartbeat.tick() => Event::Tick,
				_ = shutdown.recv(), if running => Event::Signal,
			};
			match event {
				Event::Backend(Some(env)) => {
					if handle_backend(env, &mut queue, &frontend) {
						extend_drain(&mut drain);
					}
				},
				Event::Frontend(Some(env)) => {
					handle_frontend(env, &mut queue, &backend, &frontend, &cfg.service, errors.as_ref());
					extend_drain(&mut drain);
				},
				Event::Backend(None) | Event::Frontend(None) => {
					error!("socket closed, stopping load balancer");
					break;
				},
				Event::Tick => {
					let now = Instant::now();
					for worker in queue.queued() {
						if worker.deadline() > now {
							backend.send(Envelope::wrap(
								worker.identity().clone(),
								Envelope::new(vec![envelope::heartbeat_frame()]),
							));
						}
					}
					queue.purge_expired();
					if let DrainState::Draining { deadline } = drain {
						if now > deadline {
							info!("drained, exiting");
							break;
						}
					}
				},
				Event::Signal => {
					info!("deregistering and draining");
					let node = paths.endpoint(&cfg.service, &identity);
					if let Err(e) = store.delete(&node).await {
						warn!(err = %e, "deregistration failed");
					}
					*alive.write().expect("alive lock") = false;
					reg_token.cancel();
					drain = DrainState::Draining {
						deadline: Instant::now() + DRAIN_GRACE,
					};
				},
			}
		}
		reg_token.cancel();
		Ok(())
	}
}

fn extend_drain(drain: &mut DrainState) {
	if let DrainState::Draining { deadline } = drain {
		*deadline = Instant::now() + DRAIN_GRACE;
	}
}

/// A backend envelope is either a single-frame worker control message or a
/// reply to relay to the frontend. Returns whether it counted as data
/// traffic.
fn handle_backend(env: Envelope, queue: &mut WorkerQueue, frontend: &Router) -> bool {
	let Some((worker_id, rest)) = env.split_head() else {
		debug!("dropping empty backend envelope");
		return false;
	};
	if rest.len() == 1 {
		let frame = &rest.frames()[0];
		match envelope::parse_control(frame) {
			Some(control) => match control.opcode {
				Opcode::Ready => queue.update(&worker_id, control.capacity, true),
				Opcode::Heartbeat => queue.update(&worker_id, control.capacity, false),
				Opcode::Stop => queue.update(&worker_id, -1, true),
			},
			None => {
				if !frame.is_empty() {
					error!(opcode = frame[0], "unexpected control message");
				}
			},
		}
		return false;
	}
	// Reply traffic: the worker just freed one slot.
	queue.update(&worker_id, 0, false);
	frontend.send(rest);
	true
}

/// A frontend envelope is a proxy request: hand it to the best worker, or
/// answer with a synthesized error when none is live.
fn handle_frontend(
	env: Envelope,
	queue: &mut WorkerQueue,
	backend: &Router,
	frontend: &Router,
	service: &str,
	errors: &dyn ErrorEncoder,
) {
	let env = env.trim_leading_empty();
	if env.is_empty() {
		debug!("dropping empty frontend envelope");
		return;
	}
	match queue.next_worker() {
		Some(worker) => {
			trace!(worker = ?worker, "dispatching request");
			backend.send(Envelope::wrap(worker, env));
		},
		None => {
			debug!(service = %service, "no worker available");
			let seq = env.last().map(|f| thrift::seq_id(f)).unwrap_or(0);
			let mut frames = env.into_frames();
			frames.pop();
			frames.push(errors.worker_not_found(service, seq));
			frontend.send(Envelope::new(frames));
		},
	}
}
