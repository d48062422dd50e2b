//! Service discovery: the proxy's view of the coordination store.
//!
//! One task watches the services directory and creates a service record per
//! child; each record gets its own endpoint watcher feeding the socket
//! pool, plus a shared 1 Hz ticker that ages out drained sockets.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use fabric_core::prelude::*;
use fabric_core::readiness::BlockReady;
use itertools::Itertools;
use tokio::sync::mpsc;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;

use crate::coord::{CoordClient, CoordEvent, EndpointInfo, Paths};
use crate::envelope::Envelope;
use crate::proxy::pool::BackendPool;

const RETRY_DELAY: Duration = Duration::from_secs(1);
const PURGE_INTERVAL: Duration = Duration::from_secs(1);

pub struct BackService {
	pub name: String,
	pub pool: BackendPool,
}

/// All services this proxy knows about. Entries are created on first
/// observation in the store, revived in place by later registrations, and
/// never destroyed.
pub struct ServiceStore {
	services: RwLock<HashMap<String, Arc<BackService>>>,
	store: Arc<dyn CoordClient>,
	paths: Paths,
	replies: mpsc::Sender<Envelope>,
	token: CancellationToken,
}

impl ServiceStore {
	pub fn new(
		store: Arc<dyn CoordClient>,
		product: &str,
		replies: mpsc::Sender<Envelope>,
	) -> Arc<ServiceStore> {
		Arc::new(ServiceStore {
			services: RwLock::new(HashMap::new()),
			store,
			paths: Paths::new(product),
			replies,
			token: CancellationToken::new(),
		})
	}

	pub fn get(&self, name: &str) -> Option<Arc<BackService>> {
		self.services.read().expect("services lock").get(name).cloned()
	}

	pub fn names(&self) -> Vec<String> {
		self
			.services
			.read()
			.expect("services lock")
			.keys()
			.cloned()
			.collect()
	}

	pub fn shutdown(&self) {
		self.token.cancel();
	}

	fn ensure_service(self: &Arc<Self>, name: &str) {
		let mut services = self.services.write().expect("services lock");
		if services.contains_key(name) {
			return;
		}
		info!(service = %name, "discovered service");
		let service = Arc::new(BackService {
			name: name.to_string(),
			pool: BackendPool::new(self.replies.clone()),
		});
		services.insert(name.to_string(), service.clone());
		tokio::spawn(watch_service(self.clone(), service));
	}
}

/// Watches the services directory, creating a record (and endpoint watcher)
/// for every service that appears. Holds the readiness block until the
/// first listing lands.
pub async fn run_discovery(store: Arc<ServiceStore>, ready: BlockReady) {
	let path = store.paths.services();
	if let Err(e) = store.store.ensure_dir(&path).await {
		error!(%path, err = %e, "creating services directory failed");
	}
	let mut ready = Some(ready);
	loop {
		match store.store.watch_children(&path).await {
			Ok((children, mut events)) => {
				for name in children.iter().sorted() {
					store.ensure_service(name);
				}
				ready.take();
				let event = tokio::select! {
					_ = store.token.cancelled() => break,
					event = events.recv() => event,
				};
				if let Some(CoordEvent::SessionExpired | CoordEvent::WatchLost) = event {
					debug!(%path, "services watch lost, re-listing");
				}
			},
			Err(e) => {
				warn!(%path, err = %e, "listing services failed");
				tokio::select! {
					_ = store.token.cancelled() => break,
					_ = tokio::time::sleep(RETRY_DELAY) => {},
				}
			},
		}
	}
	debug!("service discovery stopped");
}

/// Per-service endpoint watcher: lists the members, reads each endpoint
/// body and reconciles the socket pool with the frontend address set.
async fn watch_service(store: Arc<ServiceStore>, service: Arc<BackService>) {
	let path = store.paths.service(&service.name);
	loop {
		match store.store.watch_children(&path).await {
			Ok((children, mut events)) => {
				let mut addrs = HashSet::new();
				for child in &children {
					let node = store.paths.endpoint(&service.name, child);
					match store.store.get_data(&node).await {
						Ok(Some(body)) => match serde_json::from_slice::<EndpointInfo>(&body) {
							Ok(info) => {
								trace!(service = %service.name, addr = %info.frontend, "endpoint");
								addrs.insert(info.frontend);
							},
							Err(e) => {
								warn!(service = %service.name, node = %child, err = %e, "bad endpoint body")
							},
						},
						// Deleted between listing and read; the next event
						// reconciles.
						Ok(None) => {},
						Err(e) => warn!(service = %service.name, node = %child, err = %e, "endpoint read failed"),
					}
				}
				service.pool.update_endpoints(&addrs);
				let event = tokio::select! {
					_ = store.token.cancelled() => break,
					event = events.recv() => event,
				};
				if let Some(CoordEvent::SessionExpired | CoordEvent::WatchLost) = event {
					debug!(service = %service.name, "endpoint watch lost, re-listing");
				}
			},
			Err(e) => {
				warn!(service = %service.name, err = %e, "listing endpoints failed");
				tokio::select! {
					_ = store.token.cancelled() => break,
					_ = tokio::time::sleep(RETRY_DELAY) => {},
				}
			},
		}
	}
	debug!(service = %service.name, "endpoint watcher stopped");
}

/// Ages out drained sockets across every service at 1 Hz.
pub async fn run_purge(store: Arc<ServiceStore>) {
	let mut tick = interval(PURGE_INTERVAL);
	tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
	loop {
		tokio::select! {
			_ = store.token.cancelled() => break,
			_ = tick.tick() => {},
		}
		let services: Vec<Arc<BackService>> = {
			let services = store.services.read().expect("services lock");
			services.values().cloned().collect()
		};
		for service in services {
			service.pool.purge();
		}
	}
}
