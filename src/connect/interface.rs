//! Collaborator seams for connection establishment
//!
//! Everything outside this subsystem's scope (name resolution, transport
//! connects, TLS, pooled H2/QUIC sessions, proxy policy, auth) is injected
//! through the narrow traits here. Each returns a boxed future so mocks and
//! production implementations are interchangeable behind `Arc<dyn _>`.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use futures_util::future::BoxFuture;
use http::{HeaderMap, StatusCode};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{NetError, Result};
use crate::proxy::{HostPortPair, ProxyChain, ProxyServer};
use crate::session::NetworkAnonymizationKey;

/// Bidirectional byte stream handed between tunnel layers. Blanket-implemented
/// so any suitable transport can be boxed into an [`IoStream`].
pub trait Connection: AsyncRead + AsyncWrite + fmt::Debug + Send + Sync + Unpin {}

impl<T: AsyncRead + AsyncWrite + fmt::Debug + Send + Sync + Unpin> Connection for T {}

/// Type-erased bidirectional byte stream handed between tunnel layers.
pub type IoStream = Box<dyn Connection>;

/// Request priority, lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum RequestPriority {
    Idle = 0,
    Lowest = 1,
    Low = 2,
    Medium = 3,
    Highest = 4,
}

/// Priority used for CONNECT streams multiplexed over an H2 or QUIC proxy
/// session, regardless of the requesting job's own priority. Tunnels carry
/// many requests, so they always ride at the top.
pub const H2_QUIC_TUNNEL_PRIORITY: RequestPriority = RequestPriority::Highest;

impl RequestPriority {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => RequestPriority::Idle,
            1 => RequestPriority::Lowest,
            2 => RequestPriority::Low,
            3 => RequestPriority::Medium,
            _ => RequestPriority::Highest,
        }
    }
}

/// Priority cell shared between a job and its in-flight host resolution, so
/// reprioritizing the job reaches work already underway.
#[derive(Debug, Clone)]
pub struct SharedPriority(Arc<AtomicU8>);

impl SharedPriority {
    pub fn new(priority: RequestPriority) -> Self {
        Self(Arc::new(AtomicU8::new(priority as u8)))
    }

    pub fn get(&self) -> RequestPriority {
        RequestPriority::from_u8(self.0.load(Ordering::Relaxed))
    }

    pub fn set(&self, priority: RequestPriority) {
        self.0.store(priority as u8, Ordering::Relaxed);
    }
}

/// Application protocol negotiated on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiatedProtocol {
    Http1,
    Http2,
    Http3,
}

/// QUIC versions this stack can speak or see advertised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuicVersion {
    Draft29,
    Rfc9000,
    Rfc9369,
}

/// Request destination: origin scheme plus host:port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SchemeHostPort {
    https: bool,
    host_port: HostPortPair,
}

impl SchemeHostPort {
    pub fn new(https: bool, host: impl Into<String>, port: u16) -> Self {
        Self {
            https,
            host_port: HostPortPair::new(host, port),
        }
    }

    pub fn is_https(&self) -> bool {
        self.https
    }

    pub fn host(&self) -> &str {
        self.host_port.host()
    }

    pub fn port(&self) -> u16 {
        self.host_port.port()
    }

    pub fn host_port_pair(&self) -> &HostPortPair {
        &self.host_port
    }

    /// Default port for the origin scheme (443 for https, 80 for http).
    pub fn default_port(&self) -> u16 {
        if self.https { 443 } else { 80 }
    }
}

impl fmt::Display for SchemeHostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.https { "https" } else { "http" };
        write!(f, "{scheme}://{}", self.host_port)
    }
}

/// Key identifying a poolable H2 session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SpdySessionKey {
    pub host_port: HostPortPair,
    pub proxy_chain: ProxyChain,
    pub network_anonymization_key: NetworkAnonymizationKey,
}

/// Key identifying a poolable QUIC session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QuicSessionKey {
    pub host_port: HostPortPair,
    pub network_anonymization_key: NetworkAnonymizationKey,
}

/// A usable connection handed back to the request, tagged with the protocol
/// that will speak on it. Pooled H2/QUIC sessions carry no raw stream here;
/// the caller reaches them through the owning pool by key.
pub struct HttpStream {
    pub protocol: NegotiatedProtocol,
    pub io: Option<IoStream>,
}

impl HttpStream {
    pub fn http1(io: IoStream) -> Self {
        Self {
            protocol: NegotiatedProtocol::Http1,
            io: Some(io),
        }
    }

    pub fn pooled(protocol: NegotiatedProtocol) -> Self {
        Self { protocol, io: None }
    }
}

impl fmt::Debug for HttpStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpStream")
            .field("protocol", &self.protocol)
            .field("io", &self.io.as_ref().map(|_| "..."))
            .finish()
    }
}

/// Result of a DNS lookup. ALPN values come from HTTPS records when the
/// resolver queried them.
#[derive(Debug, Clone, Default)]
pub struct ResolvedEndpoints {
    pub addresses: Vec<SocketAddr>,
    pub alpns: Vec<String>,
}

pub trait HostResolver: Send + Sync {
    /// Resolve `host`, observing `priority` for as long as the lookup runs.
    fn resolve(
        &self,
        host: &str,
        priority: SharedPriority,
    ) -> BoxFuture<'static, Result<ResolvedEndpoints>>;
}

pub trait TransportConnector: Send + Sync {
    fn connect(&self, addresses: Vec<SocketAddr>) -> BoxFuture<'static, Result<IoStream>>;
}

/// Outcome of a TLS handshake.
pub struct TlsOutcome {
    pub stream: IoStream,
    pub negotiated: NegotiatedProtocol,
}

pub trait TlsConnector: Send + Sync {
    /// Run a TLS handshake over `stream` for `host`, offering `alpn`.
    fn handshake(
        &self,
        stream: IoStream,
        host: String,
        alpn: Vec<NegotiatedProtocol>,
    ) -> BoxFuture<'static, Result<TlsOutcome>>;
}

/// One CONNECT exchange outcome over an H2 proxy session.
pub struct H2TunnelResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    /// Present only for a 200 response.
    pub stream: Option<IoStream>,
}

pub trait SpdySessionPool: Send + Sync {
    /// Whether a live pooled session exists for `key`.
    fn has_available_session(&self, key: &SpdySessionKey) -> bool;

    /// Issue a CONNECT for `target` over the session for `key`, creating the
    /// session from `underlying` when one does not exist yet. A connection
    /// torn down mid-response surfaces as `ConnectionClosed`.
    fn request_tunnel(
        &self,
        key: &SpdySessionKey,
        underlying: Option<IoStream>,
        target: HostPortPair,
        priority: RequestPriority,
        extra_headers: HeaderMap,
    ) -> BoxFuture<'static, Result<H2TunnelResponse>>;
}

/// Outcome of a QUIC session attempt, with the default-network marker the
/// controller needs for brokenness bookkeeping.
pub struct QuicSessionOutcome {
    pub result: Result<HttpStream>,
    /// True when the attempt failed on the default network before any
    /// fallback network succeeded.
    pub failed_on_default_network: bool,
}

pub trait QuicSessionPool: Send + Sync {
    fn has_available_session(&self, key: &QuicSessionKey) -> bool;

    fn connect(
        &self,
        key: &QuicSessionKey,
        version: QuicVersion,
        priority: RequestPriority,
    ) -> BoxFuture<'static, QuicSessionOutcome>;
}

/// Policy hooks observed while building proxy tunnels and falling back
/// across chains.
pub trait ProxyDelegate: Send + Sync {
    /// Extra headers to append to the CONNECT request for hop `hop_index`.
    fn on_before_tunnel_request(&self, _chain: &ProxyChain, _hop_index: usize) -> HeaderMap {
        HeaderMap::new()
    }

    /// Observes every CONNECT response's headers, one call per round
    /// including auth retries. An error fails the tunnel with that code.
    fn on_tunnel_headers_received(
        &self,
        _chain: &ProxyChain,
        _hop_index: usize,
        _status: StatusCode,
        _headers: &HeaderMap,
    ) -> Result<()> {
        Ok(())
    }

    /// Called when a chain is abandoned for `error` before retrying on the
    /// next candidate. Client certs cached for secure hops of `bad_chain`
    /// should be dropped here.
    fn on_fallback(&self, _bad_chain: &ProxyChain, _error: NetError) {}

    /// Called when QUIC was advertised for `origin` but every QUIC
    /// alternative is currently marked broken.
    fn on_quic_broken(&self, _origin: &SchemeHostPort) {}
}

/// A 407 challenge from a proxy hop.
#[derive(Debug, Clone)]
pub struct AuthChallenge {
    pub proxy: ProxyServer,
    pub scheme: String,
    pub realm: String,
}

/// Credentials for answering a proxy auth challenge.
#[derive(Debug, Clone)]
pub struct AuthCredentials {
    pub username: String,
    pub password: String,
}

impl AuthCredentials {
    /// `Basic` authorization value for these credentials.
    pub fn basic_token(&self) -> String {
        use base64::Engine as _;
        let raw = format!("{}:{}", self.username, self.password);
        format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode(raw)
        )
    }
}

pub trait ProxyAuthController: Send + Sync {
    /// Resolve credentials for `challenge`. `None` means no credentials are
    /// available and the job fails with `ProxyAuthRequested`.
    fn on_auth_challenge(
        &self,
        challenge: AuthChallenge,
    ) -> BoxFuture<'static, Option<AuthCredentials>>;
}
