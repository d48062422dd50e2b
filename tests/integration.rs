mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use fabric_core::signal::Shutdown;
use rpcfabric::config::{LbConfig, ProxyConfig};
use rpcfabric::coord::memory::MemoryCoord;
use rpcfabric::coord::{CoordClient, EndpointInfo, Paths, lb_identity};
use rpcfabric::envelope::Envelope;
use rpcfabric::thrift::{self, BinaryErrorEncoder};
use rpcfabric::transport::Router;
use rpcfabric::{LoadBalancer, Proxy};
use tokio::task::JoinHandle;

use common::{TestPeer, TestWorker, b, thrift_call, wait_until};

const SESSION_TIMEOUT: Duration = Duration::from_secs(30);

fn lb_config(service: &str) -> LbConfig {
	LbConfig {
		product: "testprod".to_string(),
		coord: "memory://test".to_string(),
		service: service.to_string(),
		frontend: "tcp://127.0.0.1:0".to_string(),
		backend: "tcp://127.0.0.1:0".to_string(),
		session_timeout: SESSION_TIMEOUT,
	}
}

fn proxy_config() -> ProxyConfig {
	ProxyConfig {
		product: "testprod".to_string(),
		coord: "memory://test".to_string(),
		frontend: "tcp://127.0.0.1:0".to_string(),
		session_timeout: SESSION_TIMEOUT,
	}
}

struct LbHandle {
	frontend: String,
	backend: String,
	trigger: fabric_core::signal::ShutdownTrigger,
	task: JoinHandle<anyhow::Result<()>>,
}

async fn start_lb(store: &MemoryCoord, service: &str) -> LbHandle {
	let client = store.client();
	let lb = LoadBalancer::bind(
		lb_config(service),
		Arc::new(client),
		Arc::new(BinaryErrorEncoder),
	)
	.await
	.expect("bind load balancer");
	let frontend = lb.frontend_endpoint().to_string();
	let backend = lb.backend_endpoint().to_string();
	let shutdown = Shutdown::new();
	let trigger = shutdown.trigger();
	let task = tokio::spawn(lb.run(shutdown));
	LbHandle {
		frontend,
		backend,
		trigger,
		task,
	}
}

async fn start_proxy(store: &MemoryCoord) -> (String, Arc<rpcfabric::proxy::services::ServiceStore>) {
	let client = store.client();
	let proxy = Proxy::bind(
		proxy_config(),
		Arc::new(client),
		Arc::new(BinaryErrorEncoder),
	)
	.await
	.expect("bind proxy");
	let endpoint = proxy.endpoint();
	let services = proxy.services().clone();
	tokio::spawn(proxy.run(Shutdown::new()));
	(endpoint, services)
}

#[tokio::test]
async fn router_round_trips_envelopes_by_identity() {
	let mut router = Router::bind("tcp://127.0.0.1:0").await.unwrap();
	let endpoint = router.endpoint();

	let mut peer = TestPeer::connect(&endpoint, "peer-a");
	peer.send(Envelope::new(vec![Bytes::new(), b("hello")]));

	let env = router.recv().await.unwrap();
	assert_eq!(env.frames()[0], b("peer-a"));

	// route a reply back by identity
	router.send(Envelope::new(vec![b("peer-a"), Bytes::new(), b("world")]));
	let reply = peer.recv().await;
	assert_eq!(
		reply.trim_leading_empty().frames(),
		&[b("world")]
	);
}

#[tokio::test]
async fn lb_registers_dispatches_and_relays() {
	let store = MemoryCoord::new();
	let lb = start_lb(&store, "echo").await;

	// the membership node is up, with the bound addresses as its body
	let paths = Paths::new("testprod");
	let node = paths.endpoint("echo", &lb_identity(&lb.frontend));
	let observer = store.client();
	let body = observer.get_data(&node).await.unwrap().expect("node exists");
	let info: EndpointInfo = serde_json::from_slice(&body).unwrap();
	assert_eq!(info.frontend, lb.frontend);
	assert_eq!(info.backend, lb.backend);

	let mut worker = TestWorker::connect(&lb.backend, "w1");
	worker.ready(4);

	let mut upstream = TestPeer::connect(&lb.frontend, "proxy-test-1");
	// small wait so READY lands before the request
	tokio::time::sleep(Duration::from_millis(100)).await;
	upstream.forward("c1", b("ping"));
	worker.echo_one("pong:").await;

	let reply = upstream.recv().await.trim_leading_empty();
	// <client_id, "", payload>
	assert_eq!(reply.frames()[0], b("c1"));
	assert_eq!(reply.last().unwrap(), &b("pong:ping"));

	lb.trigger.shutdown_now().await;
}

#[tokio::test]
async fn lb_synthesizes_worker_not_found() {
	let store = MemoryCoord::new();
	let lb = start_lb(&store, "echo").await;

	let mut upstream = TestPeer::connect(&lb.frontend, "proxy-test-2");
	upstream.forward("c1", thrift_call("echo", 31));

	let reply = upstream.recv().await.trim_leading_empty();
	assert_eq!(reply.frames()[0], b("c1"));
	let header = thrift::read_message_begin(reply.last().unwrap()).unwrap();
	assert_eq!(header.message_type, thrift::MSG_EXCEPTION);
	assert_eq!(header.name, "echo");
	assert_eq!(header.seq_id, 31);

	lb.trigger.shutdown_now().await;
}

#[tokio::test]
async fn stopped_worker_is_skipped() {
	let store = MemoryCoord::new();
	let lb = start_lb(&store, "echo").await;

	let worker = TestWorker::connect(&lb.backend, "w1");
	worker.ready(4);
	tokio::time::sleep(Duration::from_millis(100)).await;
	worker.stop();
	tokio::time::sleep(Duration::from_millis(100)).await;

	let mut upstream = TestPeer::connect(&lb.frontend, "proxy-test-3");
	upstream.forward("c1", thrift_call("echo", 1));
	let reply = upstream.recv().await.trim_leading_empty();
	let header = thrift::read_message_begin(reply.last().unwrap()).unwrap();
	assert_eq!(header.message_type, thrift::MSG_EXCEPTION);

	lb.trigger.shutdown_now().await;
}

#[tokio::test]
async fn proxy_answers_service_not_found() {
	let store = MemoryCoord::new();
	let (endpoint, _services) = start_proxy(&store).await;

	let mut client = TestPeer::connect(&endpoint, "c1");
	client.call("nosuch", thrift_call("nosuch", 77));

	let reply = client.recv().await.trim_leading_empty();
	let header = thrift::read_message_begin(reply.last().unwrap()).unwrap();
	assert_eq!(header.message_type, thrift::MSG_EXCEPTION);
	assert_eq!(header.name, "nosuch");
	assert_eq!(header.seq_id, 77);
}

#[tokio::test]
async fn proxy_round_robins_across_balancers() {
	let store = MemoryCoord::new();
	let registrar = store.client();
	let paths = Paths::new("testprod");

	// two stand-in balancer frontends
	let mut lb_a = Router::bind("tcp://127.0.0.1:0").await.unwrap();
	let mut lb_b = Router::bind("tcp://127.0.0.1:0").await.unwrap();
	registrar.ensure_dir(&paths.service("echo")).await.unwrap();
	for router in [&lb_a, &lb_b] {
		let info = EndpointInfo {
			frontend: router.endpoint(),
			backend: "tcp://127.0.0.1:1".to_string(),
		};
		registrar
			.create_ephemeral(
				&paths.endpoint("echo", &lb_identity(&router.endpoint())),
				serde_json::to_vec(&info).unwrap().into(),
			)
			.await
			.unwrap();
	}

	let (endpoint, services) = start_proxy(&store).await;
	wait_until("both balancers active", || async {
		services
			.get("echo")
			.map(|svc| svc.pool.active_addrs().len() == 2)
			.unwrap_or(false)
	})
	.await;

	let client = TestPeer::connect(&endpoint, "c1");
	let mut order = Vec::new();
	for seq in 0..3 {
		// one request in flight at a time, so arrival order is dispatch order
		client.call("echo", thrift_call("echo", seq));
		tokio::select! {
			env = lb_a.recv() => { env.unwrap(); order.push("a"); },
			env = lb_b.recv() => { env.unwrap(); order.push("b"); },
			_ = tokio::time::sleep(Duration::from_secs(5)) => panic!("request did not arrive"),
		}
	}
	// strict alternation: third request returns to the first balancer
	assert_ne!(order[0], order[1]);
	assert_eq!(order[0], order[2]);
}

#[tokio::test]
async fn proxy_drains_removed_balancers() {
	let store = MemoryCoord::new();
	let registrar = store.client();
	let paths = Paths::new("testprod");
	registrar.ensure_dir(&paths.service("echo")).await.unwrap();

	let mut addrs = Vec::new();
	for i in 0..2 {
		let frontend = format!("tcp://127.0.0.1:{}", 40000 + i);
		let info = EndpointInfo {
			frontend: frontend.clone(),
			backend: "tcp://127.0.0.1:1".to_string(),
		};
		registrar
			.create_ephemeral(
				&paths.endpoint("echo", &lb_identity(&frontend)),
				serde_json::to_vec(&info).unwrap().into(),
			)
			.await
			.unwrap();
		addrs.push(frontend);
	}

	let (_endpoint, services) = start_proxy(&store).await;
	wait_until("both balancers active", || async {
		services
			.get("echo")
			.map(|svc| svc.pool.active_addrs().len() == 2)
			.unwrap_or(false)
	})
	.await;

	// one balancer disappears from the store
	registrar
		.delete(&paths.endpoint("echo", &lb_identity(&addrs[1])))
		.await
		.unwrap();

	wait_until("removed balancer drains", || async {
		let svc = services.get("echo").unwrap();
		svc.pool.active_addrs() == vec![addrs[0].clone()]
	})
	.await;
	// the drained socket lingers for its grace period
	let svc = services.get("echo").unwrap();
	assert_eq!(svc.pool.len(), 2);
}

#[tokio::test]
async fn end_to_end_through_proxy_and_lb() {
	let store = MemoryCoord::new();
	let lb = start_lb(&store, "echo").await;

	let mut worker = TestWorker::connect(&lb.backend, "w1");
	worker.ready(4);

	let (endpoint, services) = start_proxy(&store).await;
	wait_until("balancer discovered", || async {
		services
			.get("echo")
			.map(|svc| !svc.pool.active_addrs().is_empty())
			.unwrap_or(false)
	})
	.await;

	let mut client = TestPeer::connect(&endpoint, "c1");
	tokio::time::sleep(Duration::from_millis(100)).await;
	client.call("echo", b("ping"));
	worker.echo_one("pong:").await;

	let reply = client.recv().await.trim_leading_empty();
	assert_eq!(reply.frames(), &[b("pong:ping")]);

	lb.trigger.shutdown_now().await;
}

#[tokio::test]
async fn lb_drains_gracefully_on_shutdown() {
	let store = MemoryCoord::new();
	let lb = start_lb(&store, "echo").await;
	let paths = Paths::new("testprod");
	let node = paths.endpoint("echo", &lb_identity(&lb.frontend));
	let observer = store.client();

	let mut worker = TestWorker::connect(&lb.backend, "w1");
	worker.ready(4);
	let mut upstream = TestPeer::connect(&lb.frontend, "proxy-test-4");
	tokio::time::sleep(Duration::from_millis(100)).await;

	lb.trigger.shutdown_now().await;
	wait_until("membership node deleted", || async {
		observer.get_data(&node).await.unwrap().is_none()
	})
	.await;

	// one more request inside the drain window still gets served
	upstream.forward("c1", b("ping"));
	worker.echo_one("pong:").await;
	let reply = upstream.recv().await.trim_leading_empty();
	assert_eq!(reply.last().unwrap(), &b("pong:ping"));

	// after three quiet seconds the balancer exits cleanly
	let result = tokio::time::timeout(Duration::from_secs(10), lb.task)
		.await
		.expect("balancer did not exit")
		.expect("balancer task panicked");
	assert!(result.is_ok());
}

#[tokio::test]
async fn registration_recovers_from_session_expiry() {
	let store = MemoryCoord::new();
	let client = store.client();
	let session = client.session_id();
	let lb = LoadBalancer::bind(
		lb_config("echo"),
		Arc::new(client),
		Arc::new(BinaryErrorEncoder),
	)
	.await
	.unwrap();
	let frontend = lb.frontend_endpoint().to_string();
	tokio::spawn(lb.run(Shutdown::new()));

	let paths = Paths::new("testprod");
	let node = paths.endpoint("echo", &lb_identity(&frontend));
	let observer = store.client();
	wait_until("initial registration", || async {
		observer.get_data(&node).await.unwrap().is_some()
	})
	.await;

	store.expire_session(session);
	wait_until("re-registration after expiry", || async {
		observer.get_data(&node).await.unwrap().is_some()
	})
	.await;
}

#[tokio::test]
async fn discovered_addresses_form_a_set() {
	// duplicate frontends across nodes collapse into one active socket
	let store = MemoryCoord::new();
	let registrar = store.client();
	let paths = Paths::new("testprod");
	registrar.ensure_dir(&paths.service("echo")).await.unwrap();
	let info = EndpointInfo {
		frontend: "tcp://127.0.0.1:41000".to_string(),
		backend: "tcp://127.0.0.1:1".to_string(),
	};
	for node in ["node_a", "node_b"] {
		registrar
			.create_ephemeral(
				&paths.endpoint("echo", node),
				serde_json::to_vec(&info).unwrap().into(),
			)
			.await
			.unwrap();
	}

	let (_endpoint, services) = start_proxy(&store).await;
	wait_until("endpoints reconciled", || async {
		services
			.get("echo")
			.map(|svc| !svc.pool.active_addrs().is_empty())
			.unwrap_or(false)
	})
	.await;
	let svc = services.get("echo").unwrap();
	let active: HashSet<String> = svc.pool.active_addrs().into_iter().collect();
	assert_eq!(active.len(), 1);
	assert_eq!(svc.pool.len(), 1);
}
