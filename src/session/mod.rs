//! Session-wide shared state and collaborator wiring

mod properties;

use std::sync::Arc;

pub use properties::{
    AlternateProtocol, AlternativeService, AlternativeServiceInfo, BROKEN_ALTERNATIVE_SERVICE_DELAY,
    HttpServerProperties, NetworkAnonymizationKey, ServerNetworkStats,
};

use crate::config::FactoryConfig;
use crate::connect::interface::{
    HostResolver, ProxyAuthController, ProxyDelegate, QuicSessionPool, SpdySessionPool,
    TlsConnector, TransportConnector,
};
use crate::proxy::ProxyRetryMap;

/// Everything a job or controller reaches for that outlives a single
/// request. One per session, shared by `Arc`.
pub struct SessionContext {
    pub config: FactoryConfig,
    pub properties: Arc<HttpServerProperties>,
    pub retry_map: Arc<ProxyRetryMap>,
    pub resolver: Arc<dyn HostResolver>,
    pub transport: Arc<dyn TransportConnector>,
    pub tls: Arc<dyn TlsConnector>,
    pub spdy_pool: Arc<dyn SpdySessionPool>,
    pub quic_pool: Arc<dyn QuicSessionPool>,
    pub proxy_delegate: Arc<dyn ProxyDelegate>,
    pub auth_controller: Arc<dyn ProxyAuthController>,
}
