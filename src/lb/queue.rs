//! The worker queue: a max-heap over advertised capacity with
//! heartbeat-driven expiry.
//!
//! Entries carry their heap position so priority changes are O(log n)
//! index-targeted fixes rather than rebuilds; an entry removed from the
//! heap keeps its map slot (sentinel index) until it stops or expires.

use std::collections::HashMap;

use fabric_core::prelude::*;
use tokio::time::Instant;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);
pub const HEARTBEAT_LIVENESS: u32 = 3;

const INVALID_INDEX: usize = usize::MAX;

/// How long a worker stays live without a heartbeat.
pub fn liveness_window() -> Duration {
	HEARTBEAT_INTERVAL * HEARTBEAT_LIVENESS
}

#[derive(Debug)]
pub struct WorkerEntry {
	identity: Bytes,
	capacity: i32,
	deadline: Instant,
	heap_index: usize,
}

impl WorkerEntry {
	pub fn identity(&self) -> &Bytes {
		&self.identity
	}

	pub fn capacity(&self) -> i32 {
		self.capacity
	}

	pub fn deadline(&self) -> Instant {
		self.deadline
	}
}

#[derive(Debug, Default)]
pub struct WorkerQueue {
	heap: Vec<Bytes>,
	entries: HashMap<Bytes, WorkerEntry>,
}

impl WorkerQueue {
	pub fn new() -> WorkerQueue {
		WorkerQueue::default()
	}

	pub fn len(&self) -> usize {
		self.heap.len()
	}

	pub fn is_empty(&self) -> bool {
		self.heap.is_empty()
	}

	pub fn capacity_of(&self, identity: &[u8]) -> Option<i32> {
		self.entries.get(identity).map(|e| e.capacity)
	}

	/// Workers currently in the queue, heap order.
	pub fn queued(&self) -> impl Iterator<Item = &WorkerEntry> {
		self.heap.iter().filter_map(|id| self.entries.get(id))
	}

	/// Applies a control update for `identity`.
	///
	/// `power < 0` takes the worker offline, `power == 0` credits one freed
	/// slot, `power > 0` is a fresh capacity advertisement. `force` is true
	/// for READY/STOP and false for HEARTBEAT; an unknown worker is only
	/// created on a forced, non-negative update.
	pub fn update(&mut self, identity: &Bytes, power: i32, force: bool) {
		let deadline = Instant::now() + liveness_window();
		if !self.entries.contains_key(identity) {
			if power < 0 || !force {
				return;
			}
			self.entries.insert(
				identity.clone(),
				WorkerEntry {
					identity: identity.clone(),
					capacity: power,
					deadline,
					heap_index: INVALID_INDEX,
				},
			);
			self.push(identity.clone());
			return;
		}

		let entry = self
			.entries
			.get_mut(identity)
			.expect("entry checked present");
		entry.deadline = deadline;
		if power < 0 {
			self.remove_entry(identity);
			return;
		}
		if power == 0 {
			entry.capacity += 1;
		} else {
			entry.capacity = power;
		}
		let index = entry.heap_index;
		if index == INVALID_INDEX {
			self.push(identity.clone());
		} else {
			self.fix(index);
		}
	}

	/// Picks the worker with the most remaining capacity, charges it one
	/// slot and re-heapifies. Expired or detached entries at the top are
	/// discarded along the way.
	pub fn next_worker(&mut self) -> Option<Bytes> {
		let now = Instant::now();
		while let Some(top) = self.heap.first().cloned() {
			let live = self
				.entries
				.get(&top)
				.is_some_and(|e| e.heap_index != INVALID_INDEX && e.deadline > now);
			if !live {
				debug!(worker = ?top, "discarding dead worker from queue");
				self.remove_at(0);
				continue;
			}
			self
				.entries
				.get_mut(&top)
				.expect("entry checked present")
				.capacity -= 1;
			self.sift_down(0);
			return Some(top);
		}
		None
	}

	/// Drops every worker whose deadline has passed, in or out of the heap.
	pub fn purge_expired(&mut self) {
		let now = Instant::now();
		let expired: Vec<Bytes> = self
			.entries
			.values()
			.filter(|e| e.deadline <= now)
			.map(|e| e.identity.clone())
			.collect();
		if expired.is_empty() {
			return;
		}
		for identity in &expired {
			info!(worker = ?identity, "purging expired worker");
			self.remove_entry(identity);
		}
		debug!(live = self.heap.len(), "workers remaining");
	}

	// Max-heap ordering: capacity first, identity bytes as the fixed
	// tie-break.
	fn higher(&self, a: &Bytes, b: &Bytes) -> bool {
		let ea = &self.entries[a];
		let eb = &self.entries[b];
		match ea.capacity.cmp(&eb.capacity) {
			std::cmp::Ordering::Greater => true,
			std::cmp::Ordering::Less => false,
			std::cmp::Ordering::Equal => a < b,
		}
	}

	fn higher_at(&self, a: usize, b: usize) -> bool {
		self.higher(&self.heap[a], &self.heap[b])
	}

	fn set_index(&mut self, i: usize) {
		let id = self.heap[i].clone();
		if let Some(e) = self.entries.get_mut(&id) {
			e.heap_index = i;
		}
	}

	fn swap(&mut self, i: usize, j: usize) {
		self.heap.swap(i, j);
		self.set_index(i);
		self.set_index(j);
	}

	fn push(&mut self, identity: Bytes) {
		self.heap.push(identity);
		let i = self.heap.len() - 1;
		self.set_index(i);
		self.sift_up(i);
	}

	fn sift_up(&mut self, mut i: usize) {
		while i > 0 {
			let parent = (i - 1) / 2;
			if !self.higher_at(i, parent) {
				break;
			}
			self.swap(i, parent);
			i = parent;
		}
	}

	fn sift_down(&mut self, mut i: usize) {
		loop {
			let left = 2 * i + 1;
			let right = left + 1;
			let mut best = i;
			if left < self.heap.len() && self.higher_at(left, best) {
				best = left;
			}
			if right < self.heap.len() && self.higher_at(right, best) {
				best = right;
			}
			if best == i {
				return;
			}
			self.swap(i, best);
			i = best;
		}
	}

	fn fix(&mut self, i: usize) {
		if i >= self.heap.len() {
			return;
		}
		self.sift_up(i);
		self.sift_down(i);
	}

	fn remove_at(&mut self, i: usize) {
		let last = self.heap.len() - 1;
		let removed = self.heap[i].clone();
		if i != last {
			self.swap(i, last);
		}
		self.heap.pop();
		if let Some(e) = self.entries.get_mut(&removed) {
			e.heap_index = INVALID_INDEX;
		}
		if i < self.heap.len() {
			self.fix(i);
		}
	}

	fn remove_entry(&mut self, identity: &Bytes) {
		let Some(entry) = self.entries.remove(identity) else {
			return;
		};
		if entry.heap_index != INVALID_INDEX {
			self.remove_at(entry.heap_index);
		}
	}

	#[cfg(test)]
	fn assert_heap(&self) {
		for (i, id) in self.heap.iter().enumerate() {
			assert_eq!(
				self.entries[id].heap_index, i,
				"heap index out of sync for {id:?}"
			);
			if i > 0 {
				let parent = (i - 1) / 2;
				assert!(
					!self.higher_at(i, parent),
					"heap property violated between {i} and {parent}"
				);
			}
		}
	}
}
