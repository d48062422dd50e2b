use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use once_cell::sync::Lazy;
use tracing::info;

static PROCESS_START: Lazy<Instant> = Lazy::new(Instant::now);

/// Ready tracks whether the process has finished starting up.
#[derive(Clone, Debug, Default)]
pub struct Ready(Arc<Mutex<HashSet<String>>>);

impl Ready {
	pub fn new() -> Ready {
		Lazy::force(&PROCESS_START);
		Ready(Default::default())
	}

	/// register_task adds a named dependency that must complete (drop) before
	/// the process is considered ready.
	pub fn register_task(&self, name: &str) -> BlockReady {
		self
			.0
			.lock()
			.expect("readiness lock")
			.insert(name.to_string());
		BlockReady {
			parent: self.to_owned(),
			name: name.to_string(),
		}
	}

	pub fn pending(&self) -> HashSet<String> {
		self.0.lock().expect("readiness lock").clone()
	}
}

/// BlockReady blocks readiness until it is dropped.
pub struct BlockReady {
	parent: Ready,
	name: String,
}

impl Drop for BlockReady {
	fn drop(&mut self) {
		let mut pending = self.parent.0.lock().expect("readiness lock");
		let removed = pending.remove(&self.name);
		debug_assert!(removed);
		let left = pending.len();
		let dur = PROCESS_START.elapsed();
		if left == 0 {
			info!("task '{}' complete ({dur:?}), marking process ready", self.name);
		} else {
			info!(
				"task '{}' complete ({dur:?}), still awaiting {left} tasks",
				self.name
			);
		}
	}
}
