pub use std::fmt::{Debug, Display};
pub use std::net::SocketAddr;
pub use std::sync::Arc;
pub use std::time::Duration;

pub use bytes::Bytes;
pub use tracing::{debug, error, info, trace, warn};
