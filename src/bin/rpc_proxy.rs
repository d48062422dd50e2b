use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use fabric_core::signal::Shutdown;
use rpcfabric::config::{ProxyConfig, RawConfig};
use rpcfabric::thrift::BinaryErrorEncoder;
use rpcfabric::{Proxy, coord, telemetry};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "rpc-proxy", version, about = "Per-host request proxy for the RPC fabric")]
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

	/// Frontend endpoint facing clients, e.g. tcp://127.0.0.1:5550
	#[arg(long, value_name = "endpoint")]
	frontend: Option<String>,

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

	let cfg = ProxyConfig::resolve(raw, args.product, args.coord, args.frontend)?;
	info!(product = %cfg.product, "starting proxy");

	let store = coord::connect(&cfg.coord)?;
	let shutdown = Shutdown::new();
	let proxy = Proxy::bind(cfg, store, Arc::new(BinaryErrorEncoder)).await?;
	proxy.run(shutdown).await
}
