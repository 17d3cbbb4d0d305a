//! Scripted collaborators and session wiring for integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use http::{HeaderMap, StatusCode};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;

use raceline::config::FactoryConfig;
use raceline::connect::interface::{
    AuthChallenge, AuthCredentials, H2TunnelResponse, HostResolver, IoStream, NegotiatedProtocol,
    ProxyAuthController, ProxyDelegate, QuicSessionKey, QuicSessionOutcome, QuicSessionPool,
    QuicVersion, RequestPriority, ResolvedEndpoints, SchemeHostPort, SharedPriority,
    SpdySessionKey, SpdySessionPool, TlsConnector, TlsOutcome, TransportConnector,
};
use raceline::error::NetError;
use raceline::proxy::{HostPortPair, ProxyChain, ProxyRetryMap};
use raceline::session::{HttpServerProperties, SessionContext};
use raceline::HttpStream;

// ---------------------------------------------------------------- resolver

pub struct MockResolver {
    results: Mutex<HashMap<String, Result<ResolvedEndpoints, NetError>>>,
    delay: Mutex<Option<Duration>>,
    pub queries: Mutex<Vec<String>>,
    pub priority_handles: Mutex<Vec<SharedPriority>>,
}

impl MockResolver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            results: Mutex::new(HashMap::new()),
            delay: Mutex::new(None),
            queries: Mutex::new(Vec::new()),
            priority_handles: Mutex::new(Vec::new()),
        })
    }

    pub fn set_result(&self, host: &str, result: Result<ResolvedEndpoints, NetError>) {
        self.results.lock().unwrap().insert(host.to_string(), result);
    }

    pub fn set_alpns(&self, host: &str, alpns: &[&str]) {
        self.set_result(
            host,
            Ok(ResolvedEndpoints {
                addresses: vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)],
                alpns: alpns.iter().map(|s| s.to_string()).collect(),
            }),
        );
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }
}

impl HostResolver for MockResolver {
    fn resolve(
        &self,
        host: &str,
        priority: SharedPriority,
    ) -> BoxFuture<'static, Result<ResolvedEndpoints, NetError>> {
        self.queries.lock().unwrap().push(host.to_string());
        self.priority_handles.lock().unwrap().push(priority);
        let result = self
            .results
            .lock()
            .unwrap()
            .get(host)
            .cloned()
            .unwrap_or_else(|| {
                Ok(ResolvedEndpoints {
                    addresses: vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)],
                    alpns: Vec::new(),
                })
            });
        let delay = *self.delay.lock().unwrap();
        Box::pin(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            result
        })
    }
}

// --------------------------------------------------------------- transport

#[derive(Clone, Copy, Debug)]
pub enum TransportAction {
    Succeed,
    DelayThenSucceed(Duration),
    Fail(NetError),
    DelayThenFail(Duration, NetError),
    Hang,
}

pub struct MockTransport {
    actions: Mutex<VecDeque<TransportAction>>,
    server_ends: mpsc::UnboundedSender<DuplexStream>,
    pub connects: Mutex<Vec<Vec<SocketAddr>>>,
}

impl MockTransport {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<DuplexStream>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                actions: Mutex::new(VecDeque::new()),
                server_ends: tx,
                connects: Mutex::new(Vec::new()),
            }),
            rx,
        )
    }

    pub fn push_action(&self, action: TransportAction) {
        self.actions.lock().unwrap().push_back(action);
    }

    pub fn connect_count(&self) -> usize {
        self.connects.lock().unwrap().len()
    }
}

impl TransportConnector for MockTransport {
    fn connect(
        &self,
        addresses: Vec<SocketAddr>,
    ) -> BoxFuture<'static, Result<IoStream, NetError>> {
        self.connects.lock().unwrap().push(addresses);
        let action = self
            .actions
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(TransportAction::Succeed);
        let sender = self.server_ends.clone();
        Box::pin(async move {
            let succeed = |sender: mpsc::UnboundedSender<DuplexStream>| {
                let (client, server) = tokio::io::duplex(64 * 1024);
                let _ = sender.send(server);
                Ok(Box::new(client) as IoStream)
            };
            match action {
                TransportAction::Succeed => succeed(sender),
                TransportAction::DelayThenSucceed(delay) => {
                    tokio::time::sleep(delay).await;
                    succeed(sender)
                }
                TransportAction::Fail(error) => Err(error),
                TransportAction::DelayThenFail(delay, error) => {
                    tokio::time::sleep(delay).await;
                    Err(error)
                }
                TransportAction::Hang => std::future::pending().await,
            }
        })
    }
}

// --------------------------------------------------------------------- tls

pub struct MockTls {
    actions: Mutex<VecDeque<Result<NegotiatedProtocol, NetError>>>,
    pub handshakes: Mutex<Vec<String>>,
}

impl MockTls {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            actions: Mutex::new(VecDeque::new()),
            handshakes: Mutex::new(Vec::new()),
        })
    }

    /// Next handshake outcome; unscripted handshakes negotiate HTTP/1.1.
    pub fn push_outcome(&self, outcome: Result<NegotiatedProtocol, NetError>) {
        self.actions.lock().unwrap().push_back(outcome);
    }
}

impl TlsConnector for MockTls {
    fn handshake(
        &self,
        stream: IoStream,
        host: String,
        _alpn: Vec<NegotiatedProtocol>,
    ) -> BoxFuture<'static, Result<TlsOutcome, NetError>> {
        self.handshakes.lock().unwrap().push(host);
        let outcome = self
            .actions
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(NegotiatedProtocol::Http1));
        Box::pin(async move {
            let negotiated = outcome?;
            Ok(TlsOutcome { stream, negotiated })
        })
    }
}

// -------------------------------------------------------------- spdy pool

pub struct H2TunnelScript {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

pub struct MockSpdyPool {
    available: Mutex<HashSet<SpdySessionKey>>,
    scripts: Mutex<VecDeque<Result<H2TunnelScript, NetError>>>,
    pub requests: Mutex<Vec<(HostPortPair, RequestPriority, HeaderMap)>>,
}

impl MockSpdyPool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            available: Mutex::new(HashSet::new()),
            scripts: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn add_available(&self, key: SpdySessionKey) {
        self.available.lock().unwrap().insert(key);
    }

    pub fn push_tunnel(&self, script: Result<H2TunnelScript, NetError>) {
        self.scripts.lock().unwrap().push_back(script);
    }
}

impl SpdySessionPool for MockSpdyPool {
    fn has_available_session(&self, key: &SpdySessionKey) -> bool {
        self.available.lock().unwrap().contains(key)
    }

    fn request_tunnel(
        &self,
        _key: &SpdySessionKey,
        _underlying: Option<IoStream>,
        target: HostPortPair,
        priority: RequestPriority,
        extra_headers: HeaderMap,
    ) -> BoxFuture<'static, Result<H2TunnelResponse, NetError>> {
        self.requests
            .lock()
            .unwrap()
            .push((target, priority, extra_headers));
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(NetError::ConnectionClosed));
        Box::pin(async move {
            let script = script?;
            let stream = if script.status == StatusCode::OK {
                let (client, _server) = tokio::io::duplex(64 * 1024);
                Some(Box::new(client) as IoStream)
            } else {
                None
            };
            Ok(H2TunnelResponse {
                status: script.status,
                headers: script.headers,
                stream,
            })
        })
    }
}

// -------------------------------------------------------------- quic pool

#[derive(Clone, Copy, Debug)]
pub struct QuicScript {
    pub delay: Duration,
    pub error: Option<NetError>,
    pub failed_on_default_network: bool,
}

impl QuicScript {
    pub fn succeed() -> Self {
        Self {
            delay: Duration::ZERO,
            error: None,
            failed_on_default_network: false,
        }
    }

    pub fn fail(error: NetError) -> Self {
        Self {
            delay: Duration::ZERO,
            error: Some(error),
            failed_on_default_network: true,
        }
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn on_non_default_network(mut self) -> Self {
        self.failed_on_default_network = false;
        self
    }

    /// Success reached only after the attempt failed on the default network.
    pub fn succeed_after_network_fallback() -> Self {
        Self {
            delay: Duration::ZERO,
            error: None,
            failed_on_default_network: true,
        }
    }
}

pub struct MockQuicPool {
    scripts: Mutex<VecDeque<QuicScript>>,
    scripts_by_host: Mutex<HashMap<String, VecDeque<QuicScript>>>,
    hang_when_empty: Mutex<bool>,
    pub connects: Mutex<Vec<(HostPortPair, QuicVersion, RequestPriority)>>,
}

impl MockQuicPool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(VecDeque::new()),
            scripts_by_host: Mutex::new(HashMap::new()),
            hang_when_empty: Mutex::new(false),
            connects: Mutex::new(Vec::new()),
        })
    }

    pub fn push(&self, script: QuicScript) {
        self.scripts.lock().unwrap().push_back(script);
    }

    /// Script the next attempt against a specific endpoint host; wins over
    /// the shared queue. Keeps concurrent jobs deterministic.
    pub fn push_for(&self, host: &str, script: QuicScript) {
        self.scripts_by_host
            .lock()
            .unwrap()
            .entry(host.to_string())
            .or_default()
            .push_back(script);
    }

    pub fn hang_when_empty(&self) {
        *self.hang_when_empty.lock().unwrap() = true;
    }

    pub fn connect_count(&self) -> usize {
        self.connects.lock().unwrap().len()
    }
}

impl QuicSessionPool for MockQuicPool {
    fn has_available_session(&self, _key: &QuicSessionKey) -> bool {
        false
    }

    fn connect(
        &self,
        key: &QuicSessionKey,
        version: QuicVersion,
        priority: RequestPriority,
    ) -> BoxFuture<'static, QuicSessionOutcome> {
        self.connects
            .lock()
            .unwrap()
            .push((key.host_port.clone(), version, priority));
        let script = self
            .scripts_by_host
            .lock()
            .unwrap()
            .get_mut(key.host_port.host())
            .and_then(VecDeque::pop_front)
            .or_else(|| self.scripts.lock().unwrap().pop_front());
        let hang = *self.hang_when_empty.lock().unwrap();
        Box::pin(async move {
            let script = match script {
                Some(script) => script,
                None if hang => std::future::pending().await,
                None => QuicScript::fail(NetError::QuicProtocolError),
            };
            tokio::time::sleep(script.delay).await;
            QuicSessionOutcome {
                result: match script.error {
                    None => Ok(HttpStream::pooled(NegotiatedProtocol::Http3)),
                    Some(error) => Err(error),
                },
                failed_on_default_network: script.failed_on_default_network,
            }
        })
    }
}

// ---------------------------------------------------------------- delegate

#[derive(Default)]
pub struct RecordingDelegate {
    pub extra_headers: Mutex<HeaderMap>,
    pub tunnel_headers: Mutex<Vec<(usize, StatusCode)>>,
    pub fallbacks: Mutex<Vec<(ProxyChain, NetError)>>,
    pub quic_broken: Mutex<Vec<String>>,
}

impl RecordingDelegate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl ProxyDelegate for RecordingDelegate {
    fn on_before_tunnel_request(&self, _chain: &ProxyChain, _hop_index: usize) -> HeaderMap {
        self.extra_headers.lock().unwrap().clone()
    }

    fn on_tunnel_headers_received(
        &self,
        _chain: &ProxyChain,
        hop_index: usize,
        status: StatusCode,
        _headers: &HeaderMap,
    ) -> Result<(), NetError> {
        self.tunnel_headers.lock().unwrap().push((hop_index, status));
        Ok(())
    }

    fn on_fallback(&self, bad_chain: &ProxyChain, error: NetError) {
        self.fallbacks.lock().unwrap().push((bad_chain.clone(), error));
    }

    fn on_quic_broken(&self, origin: &SchemeHostPort) {
        self.quic_broken.lock().unwrap().push(origin.to_string());
    }
}

// -------------------------------------------------------------------- auth

pub struct MockAuth {
    credentials: Mutex<VecDeque<Option<AuthCredentials>>>,
    delay: Mutex<Option<Duration>>,
    pub challenges: Mutex<Vec<AuthChallenge>>,
}

impl MockAuth {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            credentials: Mutex::new(VecDeque::new()),
            delay: Mutex::new(None),
            challenges: Mutex::new(Vec::new()),
        })
    }

    pub fn push_credentials(&self, creds: Option<AuthCredentials>) {
        self.credentials.lock().unwrap().push_back(creds);
    }

    /// Simulates the user taking `delay` to answer the challenge.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }
}

impl ProxyAuthController for MockAuth {
    fn on_auth_challenge(
        &self,
        challenge: AuthChallenge,
    ) -> BoxFuture<'static, Option<AuthCredentials>> {
        self.challenges.lock().unwrap().push(challenge);
        let creds = self.credentials.lock().unwrap().pop_front().flatten();
        let delay = *self.delay.lock().unwrap();
        Box::pin(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            creds
        })
    }
}

// ----------------------------------------------------------------- harness

pub struct Harness {
    pub session: Arc<SessionContext>,
    pub resolver: Arc<MockResolver>,
    pub transport: Arc<MockTransport>,
    pub tls: Arc<MockTls>,
    pub spdy: Arc<MockSpdyPool>,
    pub quic: Arc<MockQuicPool>,
    pub delegate: Arc<RecordingDelegate>,
    pub auth: Arc<MockAuth>,
    pub accepted: mpsc::UnboundedReceiver<DuplexStream>,
}

pub fn harness() -> Harness {
    harness_with(FactoryConfig::default())
}

pub fn harness_with(config: FactoryConfig) -> Harness {
    let resolver = MockResolver::new();
    let (transport, accepted) = MockTransport::new();
    let tls = MockTls::new();
    let spdy = MockSpdyPool::new();
    let quic = MockQuicPool::new();
    let delegate = RecordingDelegate::new();
    let auth = MockAuth::new();
    let session = Arc::new(SessionContext {
        config,
        properties: Arc::new(HttpServerProperties::new()),
        retry_map: Arc::new(ProxyRetryMap::new()),
        resolver: resolver.clone(),
        transport: transport.clone(),
        tls: tls.clone(),
        spdy_pool: spdy.clone(),
        quic_pool: quic.clone(),
        proxy_delegate: delegate.clone(),
        auth_controller: auth.clone(),
    });
    Harness {
        session,
        resolver,
        transport,
        tls,
        spdy,
        quic,
        delegate,
        auth,
        accepted,
    }
}

/// Act as the proxy on `server`: for each scripted response, read one
/// request head then write the response. Returns the request heads seen.
pub async fn run_proxy_script(mut server: DuplexStream, responses: Vec<String>) -> Vec<String> {
    let mut requests = Vec::new();
    for response in responses {
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            let n = server.read(&mut byte).await.expect("proxy read");
            if n == 0 {
                return requests;
            }
            buf.push(byte[0]);
            if buf.ends_with(b"\r\n\r\n") {
                break;
            }
        }
        requests.push(String::from_utf8_lossy(&buf).into_owned());
        server.write_all(response.as_bytes()).await.expect("proxy write");
    }
    requests
}
