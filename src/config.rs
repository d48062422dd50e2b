//! Configuration: a YAML file merged with command-line overrides, validated
//! into per-binary configs. Missing required fields are startup-fatal.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use fabric_core::prelude::*;
use serde::Deserialize;

use crate::coord::SESSION_TIMEOUT_DEFAULT;

/// The raw config file. All keys optional; the command line wins.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RawConfig {
	pub product: Option<String>,
	pub coord: Option<String>,
	pub coord_session_timeout: Option<u64>,
	pub service: Option<String>,
	pub front_host: Option<String>,
	pub front_port: Option<String>,
	pub ip_prefix: Option<String>,
	pub back_addr: Option<String>,
	pub proxy_addr: Option<String>,
	pub log_level: Option<String>,
	pub log_file: Option<PathBuf>,
}

impl RawConfig {
	pub fn load(path: &Path) -> anyhow::Result<RawConfig> {
		let contents = fs::read_to_string(path)
			.with_context(|| format!("reading config {}", path.display()))?;
		serde_yaml::from_str(&contents)
			.with_context(|| format!("parsing config {}", path.display()))
	}
}

#[derive(Clone, Debug)]
pub struct ProxyConfig {
	pub product: String,
	pub coord: String,
	pub frontend: String,
	pub session_timeout: Duration,
}

impl ProxyConfig {
	pub fn resolve(
		raw: RawConfig,
		product: Option<String>,
		coord: Option<String>,
		frontend: Option<String>,
	) -> anyhow::Result<ProxyConfig> {
		Ok(ProxyConfig {
			product: required("product", product.or(raw.product))?,
			coord: required("coordination store address", coord.or(raw.coord))?,
			frontend: required("proxy address", frontend.or(raw.proxy_addr))?,
			session_timeout: session_timeout(raw.coord_session_timeout),
		})
	}
}

#[derive(Clone, Debug)]
pub struct LbConfig {
	pub product: String,
	pub coord: String,
	pub service: String,
	pub frontend: String,
	pub backend: String,
	pub session_timeout: Duration,
}

impl LbConfig {
	pub fn resolve(
		raw: RawConfig,
		product: Option<String>,
		coord: Option<String>,
		service: Option<String>,
		frontend: Option<String>,
		backend: Option<String>,
	) -> anyhow::Result<LbConfig> {
		let frontend = match frontend {
			Some(frontend) => frontend,
			None => frontend_from_parts(&raw)?,
		};
		Ok(LbConfig {
			product: required("product", product.or(raw.product))?,
			coord: required("coordination store address", coord.or(raw.coord))?,
			service: required("service", service.or(raw.service))?,
			frontend,
			backend: required("backend address", backend.or(raw.back_addr))?,
			session_timeout: session_timeout(raw.coord_session_timeout),
		})
	}
}

fn required(what: &str, value: Option<String>) -> anyhow::Result<String> {
	value
		.filter(|v| !v.trim().is_empty())
		.map(|v| v.trim().to_string())
		.with_context(|| format!("{what} is required"))
}

fn session_timeout(secs: Option<u64>) -> Duration {
	secs.map(Duration::from_secs).unwrap_or(SESSION_TIMEOUT_DEFAULT)
}

/// Assembles the frontend endpoint from `front_host`/`front_port`, falling
/// back to interface discovery by `ip_prefix` when no host is configured.
fn frontend_from_parts(raw: &RawConfig) -> anyhow::Result<String> {
	let host = match raw.front_host.as_deref().filter(|h| !h.is_empty()) {
		Some(host) => host.to_string(),
		None => {
			let prefix = raw
				.ip_prefix
				.as_deref()
				.filter(|p| !p.is_empty())
				.context("frontend address is required (set front_host or ip_prefix)")?;
			host_with_prefix(prefix)
				.with_context(|| format!("no interface address starts with {prefix}"))?
		},
	};
	let port = raw
		.front_port
		.as_deref()
		.filter(|p| !p.is_empty())
		.context("front_port is required")?;
	Ok(format!("tcp://{host}:{port}"))
}

/// First interface address with the given prefix, e.g. `10.0.` on a
/// multi-homed host.
pub fn host_with_prefix(prefix: &str) -> Option<String> {
	let interfaces = local_ip_address::list_afinet_netifas().ok()?;
	interfaces
		.into_iter()
		.map(|(_, ip)| ip.to_string())
		.find(|ip| ip.starts_with(prefix))
}
