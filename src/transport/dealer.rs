use std::sync::atomic::{AtomicU64, Ordering};

use fabric_core::prelude::*;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::envelope::Envelope;
use crate::transport::codec::{CodecError, EnvelopeCodec};
use crate::transport::host_port;

const SEND_QUEUE: usize = 1024;

static SOCKET_SEQ: AtomicU64 = AtomicU64::new(0);

/// The identity a proxy stamps on each backend transport it opens.
pub fn next_socket_identity() -> Bytes {
	let seq = SOCKET_SEQ.fetch_add(1, Ordering::Relaxed) + 1;
	Bytes::from(format!("proxy-{}-{}", std::process::id(), seq))
}

/// The connecting side of the transport. The TCP connection is established
/// lazily on the first send; inbound envelopes are forwarded into the poll
/// channel supplied at construction. On a transport error the connection is
/// torn down and the next send redials.
#[derive(Clone)]
pub struct Dealer {
	addr: Arc<str>,
	identity: Bytes,
	out_tx: mpsc::Sender<Envelope>,
	token: CancellationToken,
}

impl Dealer {
	pub fn connect(addr: &str, identity: Bytes, inbound: mpsc::Sender<Envelope>) -> Dealer {
		let (out_tx, out_rx) = mpsc::channel(SEND_QUEUE);
		let token = CancellationToken::new();
		tokio::spawn(conn_task(
			addr.to_string(),
			identity.clone(),
			out_rx,
			inbound,
			token.clone(),
		));
		Dealer {
			addr: addr.into(),
			identity,
			out_tx,
			token,
		}
	}

	pub fn addr(&self) -> &str {
		&self.addr
	}

	pub fn identity(&self) -> &Bytes {
		&self.identity
	}

	/// Queues an envelope for delivery. Non-blocking; a full queue or a
	/// closed transport drops the envelope.
	pub fn send(&self, env: Envelope) {
		if self.out_tx.try_send(env).is_err() {
			warn!(addr = %self.addr, "backend send queue full or closed, dropping envelope");
		}
	}

	pub fn close(&self) {
		self.token.cancel();
	}
}

enum ConnEvent {
	Cancel,
	In(Option<Result<Envelope, CodecError>>),
	Out(Option<Envelope>),
}

async fn conn_task(
	addr: String,
	identity: Bytes,
	mut out_rx: mpsc::Receiver<Envelope>,
	inbound: mpsc::Sender<Envelope>,
	token: CancellationToken,
) {
	'outer: loop {
		// Idle until there is something to send; the connection is created
		// on demand.
		let first = tokio::select! {
			_ = token.cancelled() => break,
			env = out_rx.recv() => match env {
				Some(env) => env,
				None => break,
			},
		};
		let mut framed = match dial(&addr).await {
			Ok(framed) => framed,
			Err(e) => {
				error!(addr = %addr, err = %e, "connect failed");
				continue;
			},
		};
		let greeting = Envelope::new(vec![identity.clone()]);
		if framed.send(greeting).await.is_err() || framed.send(first).await.is_err() {
			error!(addr = %addr, "send failed during connect");
			continue;
		}
		debug!(addr = %addr, id = ?identity, "backend transport connected");

		loop {
			let ev = tokio::select! {
				_ = token.cancelled() => ConnEvent::Cancel,
				inbound = framed.next() => ConnEvent::In(inbound),
				outbound = out_rx.recv() => ConnEvent::Out(outbound),
			};
			match ev {
				ConnEvent::Cancel | ConnEvent::Out(None) => break 'outer,
				ConnEvent::Out(Some(env)) => {
					if let Err(e) = framed.send(env).await {
						error!(addr = %addr, err = %e, "send failed");
						continue 'outer;
					}
				},
				ConnEvent::In(Some(Ok(env))) => {
					if inbound.send(env).await.is_err() {
						break 'outer;
					}
				},
				ConnEvent::In(Some(Err(e))) => {
					error!(addr = %addr, err = %e, "receive failed");
					continue 'outer;
				},
				ConnEvent::In(None) => {
					warn!(addr = %addr, "backend closed connection");
					continue 'outer;
				},
			}
		}
	}
	debug!(addr = %addr, "backend transport closed");
}

async fn dial(addr: &str) -> anyhow::Result<Framed<TcpStream, EnvelopeCodec>> {
	let stream = TcpStream::connect(host_port(addr)).await?;
	stream.set_nodelay(true)?;
	Ok(Framed::new(stream, EnvelopeCodec::default()))
}
