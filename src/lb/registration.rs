//! Self-registration: the load balancer's ephemeral membership node, kept
//! alive across coordination-store session loss.

use std::sync::RwLock;

use fabric_core::prelude::*;
use tokio_util::sync::CancellationToken;

use crate::coord::{CoordClient, CoordEvent, EndpointInfo, Paths};

/// Creates (or refreshes) the membership node, creating the service
/// directory on the way.
pub async fn register(
	store: &dyn CoordClient,
	paths: &Paths,
	service: &str,
	identity: &str,
	info: &EndpointInfo,
) -> anyhow::Result<()> {
	store.ensure_dir(&paths.service(service)).await?;
	let body = serde_json::to_vec(info)?;
	store
		.create_ephemeral(&paths.endpoint(service, identity), body.into())
		.await?;
	info!(service = %service, node = %identity, "registered load balancer endpoint");
	Ok(())
}

/// Watches the membership node and re-creates it whenever the session
/// expires or the watch is lost. Runs until `alive` goes false or the token
/// fires.
pub async fn run(
	store: Arc<dyn CoordClient>,
	paths: Paths,
	service: String,
	identity: String,
	info: EndpointInfo,
	alive: Arc<RwLock<bool>>,
	token: CancellationToken,
) {
	let path = paths.endpoint(&service, &identity);
	loop {
		if !*alive.read().expect("alive lock") {
			break;
		}
		match store.watch_node(&path).await {
			Ok(mut events) => {
				let event = tokio::select! {
					_ = token.cancelled() => break,
					event = events.recv() => event,
				};
				match event {
					Some(CoordEvent::SessionExpired) | Some(CoordEvent::WatchLost) => {
						info!(%path, "coordination session lost, re-registering");
						if let Err(e) = store.delete(&path).await {
							warn!(%path, err = %e, "stale node delete failed");
						}
						if let Err(e) =
							register(store.as_ref(), &paths, &service, &identity, &info).await
						{
							warn!(%path, err = %e, "re-registration failed");
						}
					},
					// Node data changes and dropped watches just re-install.
					Some(_) | None => {},
				}
			},
			Err(e) => {
				warn!(%path, err = %e, "watch on membership node failed");
				tokio::select! {
					_ = token.cancelled() => break,
					_ = tokio::time::sleep(Duration::from_secs(1)) => {},
				}
			},
		}
	}
	debug!(%path, "registration watcher stopped");
}
