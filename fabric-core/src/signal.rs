use tokio::sync::mpsc;

/// Process-wide shutdown coordination.
///
/// A `Shutdown` completes its `recv` once a termination signal arrives or a
/// [`ShutdownTrigger`] fires. A second termination signal bypasses draining
/// and exits the process immediately.
pub struct Shutdown {
	shutdown_tx: mpsc::Sender<()>,
	shutdown_rx: mpsc::Receiver<()>,
}

impl Shutdown {
	pub fn new() -> Self {
		let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
		imp::spawn_watcher(shutdown_tx.clone());
		Shutdown {
			shutdown_tx,
			shutdown_rx,
		}
	}

	/// Returns a handle that can trigger the shutdown without an OS signal.
	pub fn trigger(&self) -> ShutdownTrigger {
		ShutdownTrigger {
			shutdown_tx: self.shutdown_tx.clone(),
		}
	}

	/// Completes when shutdown has been requested.
	pub async fn recv(&mut self) {
		let _ = self.shutdown_rx.recv().await;
	}
}

impl Default for Shutdown {
	fn default() -> Self {
		Self::new()
	}
}

#[derive(Clone, Debug)]
pub struct ShutdownTrigger {
	shutdown_tx: mpsc::Sender<()>,
}

impl ShutdownTrigger {
	pub async fn shutdown_now(&self) {
		let _ = self.shutdown_tx.send(()).await;
	}
}

#[cfg(unix)]
mod imp {
	use std::process;

	use tokio::signal::unix::{SignalKind, signal};
	use tokio::sync::mpsc::Sender;
	use tracing::{info, warn};

	pub(super) fn spawn_watcher(tx: Sender<()>) {
		tokio::spawn(async move {
			let mut term = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
			let mut int = signal(SignalKind::interrupt()).expect("failed to register SIGINT handler");
			tokio::select! {
				_ = term.recv() => info!("received SIGTERM, starting shutdown"),
				_ = int.recv() => info!("received SIGINT, starting shutdown"),
			}
			let _ = tx.send(()).await;
			tokio::select! {
				_ = term.recv() => {},
				_ = int.recv() => {},
			}
			warn!("received second termination signal, exiting immediately");
			process::exit(1);
		});
	}
}

#[cfg(not(unix))]
mod imp {
	use tokio::sync::mpsc::Sender;
	use tracing::info;

	pub(super) fn spawn_watcher(tx: Sender<()>) {
		tokio::spawn(async move {
			tokio::signal::ctrl_c()
				.await
				.expect("failed to register signal handler");
			info!("received signal, starting shutdown");
			let _ = tx.send(()).await;
		});
	}
}
