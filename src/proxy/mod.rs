//! Proxy configuration model
//!
//! Value types for proxy servers and chains, the PAC/URI string codecs, and
//! the retry bookkeeping used when falling back across a proxy list.

mod chain;
mod codec;
mod list;
mod retry;
mod server;

pub use chain::{DEFAULT_IP_PROTECTION_CHAIN_ID, ProxyChain};
pub use list::ProxyList;
pub use retry::{ProxyRetryInfo, ProxyRetryMap};
pub use server::{HostPortPair, ProxyScheme, ProxyServer, canonicalize_host};
