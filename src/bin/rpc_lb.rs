use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use fabric_core::signal::Shutdown;
use rpcfabric::config::{LbConfig, RawConfig};
use rpcfabric::thrift::BinaryErrorEncoder;
use rpcfabric::{LoadBalancer, coord, telemetry};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "rpc-lb", version, about = "Per-service load balancer for the RPC fabric")]
struct Args {
	/// Config file (YAML)
	#[arg(short = 'c', long, value_name = "file")]
	config: Option<PathBuf>,

	/// Product name, e.g. online_medical
	#[arg(long)]
	product: Option<String>,

	/// Coordination store address
	#[arg(long, value_name = "address")]
	coord: Option<String>,

	/// Service this balancer serves
	#[arg(long)]
	service: Option<String>,

	/// Frontend endpoint facing proxies, e.g. tcp://127.0.0.1:5555
	#[arg(long, value_name = "endpoint")]
	frontend: Option<String>,

	/// Backend endpoint facing workers, e.g. tcp://127.0.0.1:5556
	#[arg(long, value_name = "endpoint")]
	backend: Option<String>,

	/// Log file; stderr when unset
	#[arg(short = 'L', long = "log-file", value_name = "file")]
	log_file: Option<PathBuf>,

	/// Log level: error, warn, info, debug, trace
	#[arg(long, value_name = "level")]
	log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let args = Args::parse();
	let raw = match &args.config {
		Some(path) => RawConfig::load(path)?,
		None => RawConfig::default(),
	};
	let level = args
		.log_level
		.clone()
		.or_else(|| raw.log_level.clone())
		.unwrap_or_else(|| "info".to_string());
	let log_file = args.log_file.clone().or_else(|| raw.log_file.clone());
	let _guard = telemetry::init(&level, log_file.as_deref())?;

	let cfg = LbConfig::resolve(
		raw,
		args.product,
		args.coord,
		args.service,
		args.frontend,
		args.backend,
	)?;
	info!(service = %cfg.service, product = %cfg.product, "starting load balancer");

	let store = coord::connect(&cfg.coord)?;
	let shutdown = Shutdown::new();
	let lb = LoadBalancer::bind(cfg, store, Arc::new(BinaryErrorEncoder)).await?;
	lb.run(shutdown).await
}
