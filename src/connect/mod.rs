//! Connection establishment through proxies

pub mod interface;
mod layers;
mod http_proxy;
mod timeouts;

pub use http_proxy::{HttpProxyConnectJob, JobStatus};
pub use layers::{TunnelLayer, build_tunnel_layers};
pub use timeouts::ConnectTimeoutConfig;
