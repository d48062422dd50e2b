#![allow(dead_code)]

use bytes::{BufMut, Bytes, BytesMut};
use rpcfabric::envelope::{self, Envelope};
use rpcfabric::transport::Dealer;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;

pub fn b(s: &str) -> Bytes {
	Bytes::copy_from_slice(s.as_bytes())
}

/// A minimal strict-encoded Thrift CALL header, enough for seq-id parsing.
pub fn thrift_call(name: &str, seq_id: i32) -> Bytes {
	let mut buf = BytesMut::new();
	buf.put_u32(0x8001_0000 | 1);
	buf.put_i32(name.len() as i32);
	buf.put_slice(name.as_bytes());
	buf.put_i32(seq_id);
	buf.freeze()
}

/// A worker process as the load balancer sees one: a dealer on the backend
/// endpoint speaking READY/HEARTBEAT/STOP plus reply envelopes.
pub struct TestWorker {
	dealer: Dealer,
	inbound: mpsc::Receiver<Envelope>,
}

impl TestWorker {
	pub fn connect(endpoint: &str, identity: &str) -> TestWorker {
		let (tx, inbound) = mpsc::channel(64);
		let dealer = Dealer::connect(endpoint, b(identity), tx);
		TestWorker { dealer, inbound }
	}

	pub fn ready(&self, capacity: u8) {
		self
			.dealer
			.send(Envelope::new(vec![Bytes::new(), envelope::ready_frame(capacity)]));
	}

	pub fn heartbeat(&self) {
		self
			.dealer
			.send(Envelope::new(vec![Bytes::new(), envelope::heartbeat_frame()]));
	}

	pub fn stop(&self) {
		self
			.dealer
			.send(Envelope::new(vec![Bytes::new(), envelope::stop_frame()]));
	}

	/// Serves one request: waits past control traffic, then echoes the
	/// payload back through the routing prefix with `prefix` prepended to
	/// the body.
	pub async fn echo_one(&mut self, prefix: &str) {
		loop {
			let env = tokio::time::timeout(Duration::from_secs(5), self.inbound.recv())
				.await
				.expect("worker timed out waiting for a request")
				.expect("worker transport closed");
			let trimmed = env.trim_leading_empty();
			if trimmed.len() <= 1 {
				// heartbeat from the balancer
				continue;
			}
			let mut frames = trimmed.into_frames();
			let payload = frames.pop().expect("request has a payload");
			let mut reply = Vec::with_capacity(frames.len() + 2);
			reply.push(Bytes::new());
			reply.extend(frames);
			let mut body = BytesMut::new();
			body.put_slice(prefix.as_bytes());
			body.put_slice(&payload);
			reply.push(body.freeze());
			self.dealer.send(Envelope::new(reply));
			return;
		}
	}
}

/// A client (or an upstream proxy) as a router sees one: a dealer that
/// sends `<"", head..., "", payload>` envelopes and receives trimmed
/// replies.
pub struct TestPeer {
	dealer: Dealer,
	inbound: mpsc::Receiver<Envelope>,
}

impl TestPeer {
	pub fn connect(endpoint: &str, identity: &str) -> TestPeer {
		let (tx, inbound) = mpsc::channel(64);
		let dealer = Dealer::connect(endpoint, b(identity), tx);
		TestPeer { dealer, inbound }
	}

	pub fn send(&self, env: Envelope) {
		self.dealer.send(env);
	}

	/// Client request to a proxy frontend: `<"", service, "", payload>`.
	pub fn call(&self, service: &str, payload: Bytes) {
		self.send(Envelope::new(vec![
			Bytes::new(),
			b(service),
			Bytes::new(),
			payload,
		]));
	}

	/// Proxy-shaped request to a balancer frontend: `<"", client, "", payload>`.
	pub fn forward(&self, client: &str, payload: Bytes) {
		self.send(Envelope::new(vec![
			Bytes::new(),
			b(client),
			Bytes::new(),
			payload,
		]));
	}

	pub async fn recv(&mut self) -> Envelope {
		tokio::time::timeout(Duration::from_secs(5), self.inbound.recv())
			.await
			.expect("timed out waiting for a reply")
			.expect("transport closed")
	}
}

/// Polls an async condition until it holds or the wait times out.
pub async fn wait_until<F, Fut>(what: &str, mut cond: F)
where
	F: FnMut() -> Fut,
	Fut: Future<Output = bool>,
{
	for _ in 0..200 {
		if cond().await {
			return;
		}
		sleep(Duration::from_millis(25)).await;
	}
	panic!("timed out waiting for {what}");
}
