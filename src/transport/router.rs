use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use fabric_core::prelude::*;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::envelope::Envelope;
use crate::transport::codec::{CodecError, EnvelopeCodec};
use crate::transport::host_port;

const PEER_QUEUE: usize = 1024;

static CONN_SEQ: AtomicU64 = AtomicU64::new(0);

struct Peer {
	conn: u64,
	tx: mpsc::Sender<Envelope>,
}

/// The bound side of the transport. Each accepted peer announces an identity
/// greeting; afterwards every envelope it sends arrives with that identity
/// prepended, and envelopes whose leading frame names the identity are
/// routed back to it. Unroutable envelopes are dropped.
pub struct Router {
	local_addr: SocketAddr,
	inbound: mpsc::Receiver<Envelope>,
	peers: Arc<Mutex<HashMap<Bytes, Peer>>>,
	token: CancellationToken,
}

impl Router {
	pub async fn bind(endpoint: &str) -> anyhow::Result<Router> {
		let listener = TcpListener::bind(host_port(endpoint)).await?;
		let local_addr = listener.local_addr()?;
		let (in_tx, inbound) = mpsc::channel(PEER_QUEUE);
		let peers = Arc::new(Mutex::new(HashMap::new()));
		let token = CancellationToken::new();
		tokio::spawn(accept_loop(listener, in_tx, peers.clone(), token.clone()));
		debug!(addr = %local_addr, "router bound");
		Ok(Router {
			local_addr,
			inbound,
			peers,
			token,
		})
	}

	pub fn local_addr(&self) -> SocketAddr {
		self.local_addr
	}

	/// The bound address as an endpoint string, e.g. `tcp://127.0.0.1:5555`.
	pub fn endpoint(&self) -> String {
		format!("tcp://{}", self.local_addr)
	}

	/// Next inbound envelope, peer identity already prepended. `None` once
	/// the router has shut down.
	pub async fn recv(&mut self) -> Option<Envelope> {
		self.inbound.recv().await
	}

	/// Routes an envelope to the peer named by its leading frame. The frame
	/// is consumed; the peer never sees it. Sends are non-blocking: an
	/// unknown destination or a full peer queue drops the envelope.
	pub fn send(&self, env: Envelope) {
		let mut frames = env.into_frames();
		if frames.is_empty() {
			return;
		}
		let dest = frames.remove(0);
		let tx = {
			let peers = self.peers.lock().expect("router peers lock");
			peers.get(&dest).map(|p| p.tx.clone())
		};
		match tx {
			None => debug!(peer = ?dest, "dropping envelope for unknown peer"),
			Some(tx) => {
				if tx.try_send(Envelope::new(frames)).is_err() {
					warn!(peer = ?dest, "peer send queue full, dropping envelope");
				}
			},
		}
	}
}

impl Drop for Router {
	fn drop(&mut self) {
		self.token.cancel();
	}
}

async fn accept_loop(
	listener: TcpListener,
	in_tx: mpsc::Sender<Envelope>,
	peers: Arc<Mutex<HashMap<Bytes, Peer>>>,
	token: CancellationToken,
) {
	loop {
		let accepted = tokio::select! {
			_ = token.cancelled() => break,
			accepted = listener.accept() => accepted,
		};
		match accepted {
			Ok((stream, remote)) => {
				tokio::spawn(peer_task(
					stream,
					remote,
					in_tx.clone(),
					peers.clone(),
					token.clone(),
				));
			},
			Err(e) => error!(err = %e, "accept failed"),
		}
	}
}

enum PeerEvent {
	Cancel,
	In(Option<Result<Envelope, CodecError>>),
	Out(Option<Envelope>),
}

async fn peer_task(
	stream: TcpStream,
	remote: SocketAddr,
	in_tx: mpsc::Sender<Envelope>,
	peers: Arc<Mutex<HashMap<Bytes, Peer>>>,
	token: CancellationToken,
) {
	if let Err(e) = stream.set_nodelay(true) {
		debug!(err = %e, "set_nodelay failed");
	}
	let mut framed = Framed::new(stream, EnvelopeCodec::default());

	let conn = CONN_SEQ.fetch_add(1, Ordering::Relaxed);
	let greeting = tokio::select! {
		_ = token.cancelled() => return,
		greeting = framed.next() => greeting,
	};
	let identity = match greeting {
		Some(Ok(env)) => env
			.into_frames()
			.into_iter()
			.next()
			.filter(|f| !f.is_empty())
			.unwrap_or_else(|| Bytes::from(format!("peer-{conn}"))),
		Some(Err(e)) => {
			error!(addr = %remote, err = %e, "bad greeting");
			return;
		},
		None => return,
	};

	let (out_tx, mut out_rx) = mpsc::channel(PEER_QUEUE);
	{
		// A reconnecting peer replaces its previous registration; the stale
		// task notices its queue closing and exits.
		let mut peers = peers.lock().expect("router peers lock");
		peers.insert(identity.clone(), Peer { conn, tx: out_tx });
	}
	debug!(peer = ?identity, addr = %remote, "peer connected");

	loop {
		let ev = tokio::select! {
			_ = token.cancelled() => PeerEvent::Cancel,
			inbound = framed.next() => PeerEvent::In(inbound),
			outbound = out_rx.recv() => PeerEvent::Out(outbound),
		};
		match ev {
			PeerEvent::Cancel | PeerEvent::Out(None) => break,
			PeerEvent::Out(Some(env)) => {
				if let Err(e) = framed.send(env).await {
					error!(peer = ?identity, err = %e, "send failed");
					break;
				}
			},
			PeerEvent::In(Some(Ok(mut env))) => {
				env.push_front(identity.clone());
				if in_tx.send(env).await.is_err() {
					break;
				}
			},
			PeerEvent::In(Some(Err(e))) => {
				error!(peer = ?identity, err = %e, "receive failed");
				break;
			},
			PeerEvent::In(None) => break,
		}
	}

	let mut peers = peers.lock().expect("router peers lock");
	if peers.get(&identity).map(|p| p.conn) == Some(conn) {
		peers.remove(&identity);
	}
	debug!(peer = ?identity, "peer disconnected");
}
