//! Proxy connection establishment and transport racing
//!
//! Given a destination and a candidate proxy configuration, this crate
//! establishes a usable stream to the origin: it models proxy servers and
//! chains (with PAC and URI codecs), drives CONNECT tunnels through one or
//! more HTTP(S) proxy hops, races the main TCP+TLS path against QUIC
//! alternatives, falls back across proxy chains on retriable failures, and
//! keeps the session-wide bookkeeping (broken alternative services, bad
//! proxy chains, server RTT stats) that makes those decisions sticky.
//!
//! Everything outside that scope (DNS, TLS, H2/QUIC session internals,
//! auth UI) is injected through the traits in [`connect::interface`].

pub mod config;
pub mod connect;
pub mod error;
pub mod factory;
pub mod proxy;
pub mod session;

pub use config::FactoryConfig;
pub use connect::interface::{
    AuthChallenge, AuthCredentials, Connection, H2_QUIC_TUNNEL_PRIORITY, HttpStream, IoStream,
    NegotiatedProtocol, QuicVersion, RequestPriority, SchemeHostPort,
};
pub use connect::{ConnectTimeoutConfig, HttpProxyConnectJob, JobStatus};
pub use error::{LoadState, NetError, Result, can_fallback_to_next_proxy};
pub use factory::{JobController, JobKind, StreamOutcome};
pub use proxy::{HostPortPair, ProxyChain, ProxyList, ProxyRetryMap, ProxyScheme, ProxyServer};
pub use session::{
    AlternateProtocol, AlternativeService, AlternativeServiceInfo, HttpServerProperties,
    NetworkAnonymizationKey, ServerNetworkStats, SessionContext,
};
