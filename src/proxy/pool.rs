//! Per-service backend socket pool.
//!
//! One vector, partitioned in place: `[0, active)` serves round-robin
//! traffic, `[active, len)` is the draining suffix awaiting its grace
//! period. Each entry tracks its own position so both transitions are O(1)
//! swaps.

use std::collections::HashSet;
use std::sync::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};

use fabric_core::prelude::*;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::envelope::Envelope;
use crate::transport::{Dealer, dealer};

/// How long an offline socket lingers before its transport is closed.
pub const OFFLINE_GRACE: Duration = Duration::from_secs(5);

struct BackendSocket {
	addr: String,
	index: usize,
	marked_offline_at: Option<Instant>,
	transport: Dealer,
}

#[derive(Default)]
struct Sockets {
	sockets: Vec<BackendSocket>,
	active: usize,
}

impl Sockets {
	fn swap(&mut self, i: usize, j: usize) {
		if i != j {
			self.sockets.swap(i, j);
		}
		self.sockets[i].index = i;
		self.sockets[j].index = j;
	}

	/// Appends `addr` and swaps it into the active prefix. A no-op when the
	/// address is already active; a draining duplicate gets a fresh entry
	/// and the old one ages out.
	fn add(&mut self, addr: &str, replies: &mpsc::Sender<Envelope>) -> bool {
		if self.sockets[..self.active].iter().any(|s| s.addr == addr) {
			return false;
		}
		let transport = Dealer::connect(addr, dealer::next_socket_identity(), replies.clone());
		self.sockets.push(BackendSocket {
			addr: addr.to_string(),
			index: self.sockets.len(),
			marked_offline_at: None,
			transport,
		});
		let tail = self.sockets.len() - 1;
		self.swap(self.active, tail);
		self.active += 1;
		true
	}

	fn mark_offline(&mut self, i: usize) {
		debug_assert!(i < self.active);
		self.sockets[i].marked_offline_at = Some(Instant::now());
		self.swap(i, self.active - 1);
		self.active -= 1;
	}
}

pub struct BackendPool {
	inner: RwLock<Sockets>,
	cursor: AtomicUsize,
	replies: mpsc::Sender<Envelope>,
}

impl BackendPool {
	/// `replies` is where every backend transport delivers its inbound
	/// envelopes; the proxy dispatch loop polls it.
	pub fn new(replies: mpsc::Sender<Envelope>) -> BackendPool {
		BackendPool {
			inner: RwLock::new(Sockets::default()),
			cursor: AtomicUsize::new(0),
			replies,
		}
	}

	/// Reconciles the active prefix with a fresh membership set: absent
	/// addresses come online, active addresses not in the set start
	/// draining.
	pub fn update_endpoints(&self, addrs: &HashSet<String>) {
		let mut inner = self.inner.write().expect("pool lock");
		for addr in addrs {
			if inner.add(addr, &self.replies) {
				info!(addr = %addr, "backend online");
			}
		}
		let mut i = 0;
		while i < inner.active {
			if addrs.contains(&inner.sockets[i].addr) {
				i += 1;
			} else {
				info!(addr = %inner.sockets[i].addr, "backend offline, draining");
				inner.mark_offline(i);
			}
		}
	}

	/// Evicts draining sockets past their grace period and closes their
	/// transports.
	pub fn purge(&self) {
		let mut inner = self.inner.write().expect("pool lock");
		if inner.active == inner.sockets.len() {
			return;
		}
		let now = Instant::now();
		let mut i = inner.active;
		while i < inner.sockets.len() {
			let expired = inner.sockets[i]
				.marked_offline_at
				.is_some_and(|at| now.duration_since(at) > OFFLINE_GRACE);
			if expired {
				let last = inner.sockets.len() - 1;
				inner.swap(i, last);
				let socket = inner.sockets.pop().expect("draining suffix not empty");
				info!(addr = %socket.addr, "purging drained backend");
				socket.transport.close();
			} else {
				i += 1;
			}
		}
	}

	/// Round-robin pick over the active prefix. The cursor race is benign:
	/// any value modulo `active` is a valid pick.
	pub fn next_socket(&self) -> Option<Dealer> {
		let inner = self.inner.read().expect("pool lock");
		if inner.active == 0 {
			return None;
		}
		let cursor = self.cursor.fetch_add(1, Ordering::Relaxed);
		Some(inner.sockets[cursor % inner.active].transport.clone())
	}

	pub fn active_addrs(&self) -> Vec<String> {
		let inner = self.inner.read().expect("pool lock");
		inner.sockets[..inner.active]
			.iter()
			.map(|s| s.addr.clone())
			.collect()
	}

	pub fn len(&self) -> usize {
		self.inner.read().expect("pool lock").sockets.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	#[cfg(test)]
	fn assert_partition(&self) {
		let inner = self.inner.read().expect("pool lock");
		for (i, socket) in inner.sockets.iter().enumerate() {
			assert_eq!(socket.index, i, "index out of sync at {i}");
			if i < inner.active {
				assert!(socket.marked_offline_at.is_none());
			} else {
				assert!(socket.marked_offline_at.is_some());
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use tokio::time::advance;

	use super::*;

	fn pool() -> BackendPool {
		let (tx, _rx) = mpsc::channel(16);
		BackendPool::new(tx)
	}

	fn set(addrs: &[&str]) -> HashSet<String> {
		addrs.iter().map(|a| a.to_string()).collect()
	}

	#[tokio::test(start_paused = true)]
	async fn round_robin_over_active_sockets() {
		let pool = pool();
		pool.update_endpoints(&set(&["tcp://10.0.0.1:1", "tcp://10.0.0.2:1"]));
		pool.assert_partition();

		let picks: Vec<String> = (0..3)
			.map(|_| pool.next_socket().unwrap().addr().to_string())
			.collect();
		assert_eq!(picks[0], picks[2]);
		assert_ne!(picks[0], picks[1]);
	}

	#[tokio::test(start_paused = true)]
	async fn removed_address_drains_and_purges() {
		let pool = pool();
		pool.update_endpoints(&set(&["tcp://10.0.0.1:1", "tcp://10.0.0.2:1"]));
		pool.update_endpoints(&set(&["tcp://10.0.0.1:1"]));
		pool.assert_partition();

		// the draining socket is never picked again
		for _ in 0..4 {
			assert_eq!(pool.next_socket().unwrap().addr(), "tcp://10.0.0.1:1");
		}
		assert_eq!(pool.len(), 2);

		// within the grace period the entry survives a purge
		advance(Duration::from_secs(2)).await;
		pool.purge();
		assert_eq!(pool.len(), 2);

		advance(Duration::from_secs(4)).await;
		pool.purge();
		pool.assert_partition();
		assert_eq!(pool.len(), 1);
		assert_eq!(pool.active_addrs(), vec!["tcp://10.0.0.1:1".to_string()]);
	}

	#[tokio::test(start_paused = true)]
	async fn update_is_idempotent_for_active_addresses() {
		let pool = pool();
		pool.update_endpoints(&set(&["tcp://10.0.0.1:1"]));
		pool.update_endpoints(&set(&["tcp://10.0.0.1:1"]));
		assert_eq!(pool.len(), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn revived_address_gets_a_fresh_socket() {
		let pool = pool();
		pool.update_endpoints(&set(&["tcp://10.0.0.1:1"]));
		pool.update_endpoints(&set(&[]));
		pool.update_endpoints(&set(&["tcp://10.0.0.1:1"]));
		pool.assert_partition();
		// one active revival plus one draining original
		assert_eq!(pool.len(), 2);
		assert_eq!(pool.active_addrs(), vec!["tcp://10.0.0.1:1".to_string()]);

		advance(Duration::from_secs(6)).await;
		pool.purge();
		assert_eq!(pool.len(), 1);
		assert!(pool.next_socket().is_some());
	}

	#[tokio::test(start_paused = true)]
	async fn mixed_updates_keep_active_prefix_exact() {
		let pool = pool();
		let rounds: &[&[&str]] = &[
			&["tcp://a:1", "tcp://b:1", "tcp://c:1"],
			&["tcp://b:1", "tcp://d:1"],
			&["tcp://d:1"],
			&["tcp://a:1", "tcp://d:1", "tcp://e:1"],
		];
		for round in rounds {
			pool.update_endpoints(&set(round));
			pool.assert_partition();
			let mut active = pool.active_addrs();
			active.sort();
			let mut expected: Vec<String> = round.iter().map(|a| a.to_string()).collect();
			expected.sort();
			assert_eq!(active, expected);
		}
	}

	#[tokio::test(start_paused = true)]
	async fn no_active_sockets_yields_none() {
		let pool = pool();
		assert!(pool.next_socket().is_none());
		pool.update_endpoints(&set(&["tcp://a:1"]));
		pool.update_endpoints(&set(&[]));
		assert!(pool.next_socket().is_none());
	}
}
