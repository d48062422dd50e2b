//! Two-tier RPC routing fabric: a per-host proxy dispatching requests to
//! per-service load balancers, which schedule over live workers by
//! advertised capacity. Membership converges through a coordination store
//! with ephemeral nodes and change watches.

pub mod config;
pub mod coord;
pub mod envelope;
pub mod lb;
pub mod proxy;
pub mod telemetry;
pub mod thrift;
pub mod transport;

pub use config::{LbConfig, ProxyConfig, RawConfig};
pub use envelope::Envelope;
pub use lb::LoadBalancer;
pub use proxy::Proxy;
