//! Process-local coordination store with real session and watch semantics:
//! ephemeral nodes die with the session that created them, watches are
//! one-shot, and expiry is injectable so recovery paths can be exercised.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use fabric_core::prelude::*;
use tokio::sync::mpsc;

use super::{CoordClient, CoordError, CoordEvent, WatchStream};

const WATCH_QUEUE: usize = 4;

#[derive(Debug)]
struct Node {
	data: Bytes,
	/// Owning session for ephemeral nodes; `None` for persistent ones.
	session: Option<u64>,
}

#[derive(Debug)]
struct Watcher {
	session: u64,
	tx: mpsc::Sender<CoordEvent>,
}

#[derive(Debug, Default)]
struct State {
	nodes: BTreeMap<String, Node>,
	child_watches: HashMap<String, Vec<Watcher>>,
	node_watches: HashMap<String, Vec<Watcher>>,
	next_session: u64,
}

/// The store. Hand out per-process-component sessions with [`client`].
///
/// [`client`]: MemoryCoord::client
#[derive(Debug, Default)]
pub struct MemoryCoord {
	state: Arc<Mutex<State>>,
}

impl MemoryCoord {
	pub fn new() -> MemoryCoord {
		MemoryCoord::default()
	}

	pub fn client(&self) -> MemoryClient {
		let mut state = self.state.lock().expect("coord state lock");
		state.next_session += 1;
		MemoryClient {
			state: self.state.clone(),
			session: state.next_session,
		}
	}

	/// Expires a session: its ephemeral nodes vanish and every watch it
	/// holds fires `SessionExpired`. Drives the recovery paths in tests.
	pub fn expire_session(&self, session: u64) {
		let mut state = self.state.lock().expect("coord state lock");
		// The expiring session hears SessionExpired before its nodes vanish;
		// everyone else observes the deletions.
		state.fire_session_watches(session);
		let ephemeral: Vec<String> = state
			.nodes
			.iter()
			.filter(|(_, node)| node.session == Some(session))
			.map(|(path, _)| path.clone())
			.collect();
		for path in ephemeral {
			state.nodes.remove(&path);
			state.notify_node(&path, CoordEvent::NodeChanged);
			if let Some(parent) = parent_of(&path) {
				state.notify_children(&parent, CoordEvent::ChildrenChanged);
			}
		}
	}
}

impl State {
	fn notify_children(&mut self, path: &str, event: CoordEvent) {
		if let Some(watchers) = self.child_watches.remove(path) {
			for w in watchers {
				let _ = w.tx.try_send(event);
			}
		}
	}

	fn notify_node(&mut self, path: &str, event: CoordEvent) {
		if let Some(watchers) = self.node_watches.remove(path) {
			for w in watchers {
				let _ = w.tx.try_send(event);
			}
		}
	}

	fn fire_session_watches(&mut self, session: u64) {
		for watches in [&mut self.child_watches, &mut self.node_watches] {
			for watchers in watches.values_mut() {
				watchers.retain(|w| {
					if w.session == session {
						let _ = w.tx.try_send(CoordEvent::SessionExpired);
						false
					} else {
						true
					}
				});
			}
		}
	}

	fn create(&mut self, path: &str, data: Bytes, session: Option<u64>) {
		self.nodes.insert(path.to_string(), Node { data, session });
		if let Some(parent) = parent_of(path) {
			self.notify_children(&parent, CoordEvent::ChildrenChanged);
		}
	}

	fn children_of(&self, path: &str) -> Vec<String> {
		let prefix = format!("{}/", path.trim_end_matches('/'));
		self
			.nodes
			.range(prefix.clone()..)
			.take_while(|(p, _)| p.starts_with(&prefix))
			.filter_map(|(p, _)| {
				let rest = &p[prefix.len()..];
				if rest.is_empty() || rest.contains('/') {
					None
				} else {
					Some(rest.to_string())
				}
			})
			.collect()
	}
}

fn parent_of(path: &str) -> Option<String> {
	let trimmed = path.trim_end_matches('/');
	let idx = trimmed.rfind('/')?;
	if idx == 0 {
		Some("/".to_string())
	} else {
		Some(trimmed[..idx].to_string())
	}
}

/// One session against a [`MemoryCoord`].
#[derive(Clone, Debug)]
pub struct MemoryClient {
	state: Arc<Mutex<State>>,
	session: u64,
}

impl MemoryClient {
	pub fn session_id(&self) -> u64 {
		self.session
	}
}

#[async_trait]
impl CoordClient for MemoryClient {
	async fn ensure_dir(&self, path: &str) -> Result<(), CoordError> {
		let mut state = self.state.lock().expect("coord state lock");
		let mut cur = String::new();
		for part in path.split('/').filter(|p| !p.is_empty()) {
			cur.push('/');
			cur.push_str(part);
			if !state.nodes.contains_key(&cur) {
				state.create(&cur, Bytes::new(), None);
			}
		}
		Ok(())
	}

	async fn create_ephemeral(&self, path: &str, data: Bytes) -> Result<(), CoordError> {
		let mut state = self.state.lock().expect("coord state lock");
		match state.nodes.get(path) {
			Some(node) if node.session != Some(self.session) => {
				return Err(CoordError::AlreadyExists(path.to_string()));
			},
			_ => {},
		}
		if let Some(parent) = parent_of(path) {
			if parent != "/" && !state.nodes.contains_key(&parent) {
				return Err(CoordError::NotFound(parent));
			}
		}
		state.create(path, data, Some(self.session));
		state.notify_node(path, CoordEvent::NodeChanged);
		Ok(())
	}

	async fn delete(&self, path: &str) -> Result<(), CoordError> {
		let mut state = self.state.lock().expect("coord state lock");
		if state.nodes.remove(path).is_some() {
			state.notify_node(path, CoordEvent::NodeChanged);
			if let Some(parent) = parent_of(path) {
				state.notify_children(&parent, CoordEvent::ChildrenChanged);
			}
		}
		Ok(())
	}

	async fn get_data(&self, path: &str) -> Result<Option<Bytes>, CoordError> {
		let state = self.state.lock().expect("coord state lock");
		Ok(state.nodes.get(path).map(|n| n.data.clone()))
	}

	async fn watch_children(&self, path: &str) -> Result<(Vec<String>, WatchStream), CoordError> {
		let mut state = self.state.lock().expect("coord state lock");
		if !state.nodes.contains_key(path) {
			return Err(CoordError::NotFound(path.to_string()));
		}
		let children = state.children_of(path);
		let (tx, rx) = mpsc::channel(WATCH_QUEUE);
		state
			.child_watches
			.entry(path.to_string())
			.or_default()
			.push(Watcher {
				session: self.session,
				tx,
			});
		Ok((children, rx))
	}

	async fn watch_node(&self, path: &str) -> Result<WatchStream, CoordError> {
		let mut state = self.state.lock().expect("coord state lock");
		let (tx, rx) = mpsc::channel(WATCH_QUEUE);
		state
			.node_watches
			.entry(path.to_string())
			.or_default()
			.push(Watcher {
				session: self.session,
				tx,
			});
		Ok(rx)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn b(s: &str) -> Bytes {
		Bytes::copy_from_slice(s.as_bytes())
	}

	#[tokio::test]
	async fn children_listing_is_direct_only() {
		let store = MemoryCoord::new();
		let client = store.client();
		client.ensure_dir("/p/services/echo").await.unwrap();
		client
			.create_ephemeral("/p/services/echo/a", b("1"))
			.await
			.unwrap();
		client
			.create_ephemeral("/p/services/echo/b", b("2"))
			.await
			.unwrap();
		let (children, _watch) = client.watch_children("/p/services").await.unwrap();
		assert_eq!(children, vec!["echo".to_string()]);
		let (children, _watch) = client.watch_children("/p/services/echo").await.unwrap();
		assert_eq!(children, vec!["a".to_string(), "b".to_string()]);
	}

	#[tokio::test]
	async fn child_watch_fires_once_on_create() {
		let store = MemoryCoord::new();
		let client = store.client();
		client.ensure_dir("/p/services/echo").await.unwrap();
		let (_, mut watch) = client.watch_children("/p/services/echo").await.unwrap();
		client
			.create_ephemeral("/p/services/echo/a", b("1"))
			.await
			.unwrap();
		assert_eq!(watch.recv().await, Some(CoordEvent::ChildrenChanged));
		// one-shot: a second create does not reach the same watch
		client
			.create_ephemeral("/p/services/echo/b", b("2"))
			.await
			.unwrap();
		assert_eq!(watch.recv().await, None);
	}

	#[tokio::test]
	async fn session_expiry_drops_ephemerals_and_notifies() {
		let store = MemoryCoord::new();
		let owner = store.client();
		let observer = store.client();
		owner.ensure_dir("/p/services/echo").await.unwrap();
		owner
			.create_ephemeral("/p/services/echo/a", b("1"))
			.await
			.unwrap();
		let mut owner_watch = owner.watch_node("/p/services/echo/a").await.unwrap();
		let (children, mut observer_watch) =
			observer.watch_children("/p/services/echo").await.unwrap();
		assert_eq!(children, vec!["a".to_string()]);

		store.expire_session(owner.session_id());

		assert_eq!(owner_watch.recv().await, Some(CoordEvent::SessionExpired));
		assert_eq!(
			observer_watch.recv().await,
			Some(CoordEvent::ChildrenChanged)
		);
		assert_eq!(observer.get_data("/p/services/echo/a").await.unwrap(), None);
	}

	#[tokio::test]
	async fn delete_is_idempotent() {
		let store = MemoryCoord::new();
		let client = store.client();
		client.ensure_dir("/p").await.unwrap();
		client.create_ephemeral("/p/a", b("1")).await.unwrap();
		client.delete("/p/a").await.unwrap();
		client.delete("/p/a").await.unwrap();
	}

	#[tokio::test]
	async fn foreign_ephemeral_cannot_be_overwritten() {
		let store = MemoryCoord::new();
		let a = store.client();
		let b_client = store.client();
		a.ensure_dir("/p").await.unwrap();
		a.create_ephemeral("/p/x", b("1")).await.unwrap();
		let err = b_client.create_ephemeral("/p/x", b("2")).await.unwrap_err();
		assert!(matches!(err, CoordError::AlreadyExists(_)));
		// the owner may refresh its own node
		a.create_ephemeral("/p/x", b("3")).await.unwrap();
	}
}
