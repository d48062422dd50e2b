//! The coordination store: a hierarchical key-value store with ephemeral
//! nodes and one-shot change watches, holding service membership.
//!
//! The store itself is a seam. [`CoordClient`] captures exactly the
//! operations the fabric needs; [`memory::MemoryCoord`] is the in-process
//! implementation used by tests and single-host deployments, and a
//! networked client can implement the same trait without touching the
//! watcher loops.

pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use fabric_core::prelude::*;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::coord::memory::MemoryCoord;

pub const SESSION_TIMEOUT_DEFAULT: Duration = Duration::from_secs(30);

/// Events delivered on a watch. Watches are one-shot, ZooKeeper style: the
/// caller re-installs after every event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CoordEvent {
	ChildrenChanged,
	NodeChanged,
	/// The session owning this client's ephemeral nodes expired; they are
	/// gone and must be re-created.
	SessionExpired,
	/// The store stopped serving this watch without an event.
	WatchLost,
}

pub type WatchStream = mpsc::Receiver<CoordEvent>;

#[derive(Debug, thiserror::Error)]
pub enum CoordError {
	#[error("node not found: {0}")]
	NotFound(String),
	#[error("node already exists: {0}")]
	AlreadyExists(String),
	#[error("coordination store unavailable: {0}")]
	Unavailable(String),
}

#[async_trait]
pub trait CoordClient: Send + Sync {
	/// Creates the directory node (and any missing parents) if absent.
	async fn ensure_dir(&self, path: &str) -> Result<(), CoordError>;
	/// Creates an ephemeral node bound to this client's session.
	async fn create_ephemeral(&self, path: &str, data: Bytes) -> Result<(), CoordError>;
	/// Idempotent: deleting an absent node is not an error.
	async fn delete(&self, path: &str) -> Result<(), CoordError>;
	async fn get_data(&self, path: &str) -> Result<Option<Bytes>, CoordError>;
	/// Lists children and installs a one-shot watch for membership changes.
	async fn watch_children(&self, path: &str) -> Result<(Vec<String>, WatchStream), CoordError>;
	/// Installs a one-shot watch on a single node.
	async fn watch_node(&self, path: &str) -> Result<WatchStream, CoordError>;
}

/// Body of a load balancer's membership node.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct EndpointInfo {
	pub frontend: String,
	pub backend: String,
}

/// Path layout under one product.
#[derive(Clone, Debug)]
pub struct Paths {
	product: String,
}

impl Paths {
	pub fn new(product: &str) -> Paths {
		Paths {
			product: product.to_string(),
		}
	}

	pub fn services(&self) -> String {
		format!("/{}/services", self.product)
	}

	pub fn service(&self, service: &str) -> String {
		format!("/{}/services/{}", self.product, service)
	}

	pub fn endpoint(&self, service: &str, lb_identity: &str) -> String {
		format!("/{}/services/{}/{}", self.product, service, lb_identity)
	}
}

/// Derives the membership node name from a frontend endpoint:
/// `tcp://127.0.0.1:5555` becomes `tcp_127_0_0_1_5555`.
pub fn lb_identity(frontend_endpoint: &str) -> String {
	frontend_endpoint
		.replace('.', "_")
		.replace(':', "_")
		.replace("//", "")
}

static LOCAL_STORE: Lazy<MemoryCoord> = Lazy::new(MemoryCoord::new);

/// Opens a client session against the store named by `addr`.
///
/// Only the process-local `memory://` store ships here; a networked
/// deployment provides its own [`CoordClient`].
pub fn connect(addr: &str) -> anyhow::Result<Arc<dyn CoordClient>> {
	if addr.starts_with("memory://") || addr == "memory" {
		return Ok(Arc::new(LOCAL_STORE.client()));
	}
	anyhow::bail!("unsupported coordination store address: {addr}")
}
