//! CONNECT tunnel establishment through HTTP(S) proxy chains
//!
//! [`HttpProxyConnectJob`] brings up one connection through a proxy chain:
//! resolve and reach the first hop, TLS where the hop is secure, then one
//! CONNECT exchange per layer until the origin is reachable, handling 407
//! challenges along the way. The job produces exactly one terminal outcome
//! and never retries internally except to answer an auth challenge.
//!
//! Timeout structure: the connect phase (resolve + transport + first-hop
//! TLS) runs under the adaptive timeout from
//! [`ConnectTimeoutConfig::connect_timeout`]; each CONNECT exchange runs
//! under the fixed tunnel budget. Waiting for auth credentials counts
//! against neither.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Duration;

use bytes::BytesMut;
use http::header::{CONNECTION, CONTENT_LENGTH, PROXY_AUTHENTICATE};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::connect::interface::{
    AuthChallenge, AuthCredentials, H2_QUIC_TUNNEL_PRIORITY, IoStream, NegotiatedProtocol,
    RequestPriority, SharedPriority, SpdySessionKey,
};
use crate::connect::layers::{TunnelLayer, build_tunnel_layers};
use crate::error::{LoadState, NetError, Result};
use crate::proxy::{HostPortPair, ProxyChain};
use crate::session::SessionContext;

const MAX_RESPONSE_HEADER_BYTES: usize = 16 * 1024;

/// Progress shared between a running job and its owner.
#[derive(Debug)]
pub struct JobStatus {
    load_state: AtomicU8,
    has_established_connection: AtomicBool,
}

impl JobStatus {
    pub fn new() -> Self {
        Self {
            load_state: AtomicU8::new(load_state_to_u8(LoadState::Idle)),
            has_established_connection: AtomicBool::new(false),
        }
    }

    pub fn load_state(&self) -> LoadState {
        load_state_from_u8(self.load_state.load(Ordering::Relaxed))
    }

    fn set_load_state(&self, state: LoadState) {
        self.load_state
            .store(load_state_to_u8(state), Ordering::Relaxed);
    }

    /// True once a transport connection to the first hop is fully up,
    /// through TLS for secure hops. Drives race bookkeeping upstream.
    pub fn has_established_connection(&self) -> bool {
        self.has_established_connection.load(Ordering::Relaxed)
    }

    pub(crate) fn set_established(&self) {
        self.has_established_connection.store(true, Ordering::Relaxed);
    }
}

impl Default for JobStatus {
    fn default() -> Self {
        Self::new()
    }
}

fn load_state_to_u8(state: LoadState) -> u8 {
    match state {
        LoadState::Idle => 0,
        LoadState::ResolvingHost => 1,
        LoadState::Connecting => 2,
        LoadState::SslHandshake => 3,
        LoadState::EstablishingProxyTunnel => 4,
    }
}

fn load_state_from_u8(raw: u8) -> LoadState {
    match raw {
        1 => LoadState::ResolvingHost,
        2 => LoadState::Connecting,
        3 => LoadState::SslHandshake,
        4 => LoadState::EstablishingProxyTunnel,
        _ => LoadState::Idle,
    }
}

/// Why one full pass over the layers stopped early.
enum Restart {
    /// Auth credentials arrived but the proxy closed the connection; the
    /// whole physical connection must be rebuilt.
    FromScratch,
}

pub struct HttpProxyConnectJob {
    session: Arc<SessionContext>,
    chain: ProxyChain,
    origin: HostPortPair,
    priority: SharedPriority,
    status: Arc<JobStatus>,
    /// Smoothed HTTP RTT estimate feeding the adaptive connect timeout.
    rtt_estimate: Option<Duration>,
    /// When false, the CONNECT exchange is skipped and the raw first-hop
    /// connection is returned as-is.
    tunnel: bool,
}

impl HttpProxyConnectJob {
    pub fn new(
        session: Arc<SessionContext>,
        chain: ProxyChain,
        origin: HostPortPair,
        priority: RequestPriority,
        rtt_estimate: Option<Duration>,
    ) -> Self {
        Self::with_status(
            session,
            chain,
            origin,
            SharedPriority::new(priority),
            rtt_estimate,
            Arc::new(JobStatus::new()),
        )
    }

    /// Construct with an externally shared priority cell and status, so an
    /// owning job can observe progress and reprioritize mid-flight.
    pub fn with_status(
        session: Arc<SessionContext>,
        chain: ProxyChain,
        origin: HostPortPair,
        priority: SharedPriority,
        rtt_estimate: Option<Duration>,
        status: Arc<JobStatus>,
    ) -> Self {
        Self {
            session,
            chain,
            origin,
            priority,
            status,
            rtt_estimate,
            tunnel: true,
        }
    }

    /// Skip the CONNECT exchange and yield the raw first-hop connection.
    /// Used for plain-http requests through a single HTTP(S) proxy, where
    /// the request line itself names the origin and no tunnel is needed.
    pub fn without_tunnel(mut self) -> Self {
        self.tunnel = false;
        self
    }

    pub fn status(&self) -> Arc<JobStatus> {
        self.status.clone()
    }

    /// Handle for reprioritizing the job, reaching in-flight resolution.
    pub fn priority_handle(&self) -> SharedPriority {
        self.priority.clone()
    }

    /// Drive the tunnel to completion, yielding a stream to the origin (or
    /// to the first hop for a direct chain, where no tunnel is needed).
    pub async fn connect(self) -> Result<IoStream> {
        let layers = build_tunnel_layers(&self.chain, &self.origin)?;
        let mut credentials: HashMap<usize, AuthCredentials> = HashMap::new();
        loop {
            match self.attempt(&layers, &mut credentials).await? {
                Ok(stream) => return Ok(stream),
                Err(Restart::FromScratch) => {
                    tracing::debug!(
                        target: "raceline::connect",
                        chain = %self.chain,
                        "restarting tunnel with credentials on a fresh connection"
                    );
                }
            }
        }
    }

    /// One full pass: physical bring-up of hop 0 plus a CONNECT per layer.
    /// The inner result distinguishes success from a restartable auth round.
    async fn attempt(
        &self,
        layers: &[TunnelLayer],
        credentials: &mut HashMap<usize, AuthCredentials>,
    ) -> Result<std::result::Result<IoStream, Restart>> {
        let first_hop_secure = layers.first().is_some_and(|l| l.server.is_secure());
        let connect_timeout = self
            .session
            .config
            .timeouts
            .connect_timeout(first_hop_secure, self.rtt_estimate);

        let bring_up = self.bring_up_first_hop(layers);
        let (mut stream, mut negotiated) = tokio::time::timeout(connect_timeout, bring_up)
            .await
            .map_err(|_| {
                tracing::warn!(
                    target: "raceline::connect",
                    chain = %self.chain,
                    timeout_ms = connect_timeout.as_millis() as u64,
                    "connect phase timed out"
                );
                NetError::TimedOut
            })??;
        self.status.set_established();

        if !self.tunnel {
            self.status.set_load_state(LoadState::Idle);
            return Ok(Ok(stream));
        }

        for (index, layer) in layers.iter().enumerate() {
            self.status
                .set_load_state(LoadState::EstablishingProxyTunnel);
            stream = match self
                .establish_layer(stream, layer, negotiated, credentials)
                .await?
            {
                Ok(stream) => stream,
                Err(restart) => return Ok(Err(restart)),
            };
            // The stream is now a raw pipe to this layer's target. Bring up
            // TLS for the next hop before speaking to it.
            negotiated = NegotiatedProtocol::Http1;
            if let Some(next) = layers.get(index + 1) {
                if next.server.is_secure() {
                    self.status.set_load_state(LoadState::SslHandshake);
                    let outcome = self
                        .session
                        .tls
                        .handshake(
                            stream,
                            next.server.host_port_pair().host().to_string(),
                            vec![NegotiatedProtocol::Http2, NegotiatedProtocol::Http1],
                        )
                        .await?;
                    stream = outcome.stream;
                    negotiated = outcome.negotiated;
                }
            }
        }
        self.status.set_load_state(LoadState::Idle);
        Ok(Ok(stream))
    }

    /// Resolve, connect, and (for a secure hop) handshake with hop 0. For a
    /// direct chain this reaches the origin itself.
    async fn bring_up_first_hop(
        &self,
        layers: &[TunnelLayer],
    ) -> Result<(IoStream, NegotiatedProtocol)> {
        let endpoint = match layers.first() {
            Some(layer) => layer.server.host_port_pair().clone(),
            None => self.origin.clone(),
        };

        self.status.set_load_state(LoadState::ResolvingHost);
        let resolved = self
            .session
            .resolver
            .resolve(endpoint.host(), self.priority.clone())
            .await?;

        self.status.set_load_state(LoadState::Connecting);
        let addresses: Vec<_> = resolved
            .addresses
            .iter()
            .map(|addr| std::net::SocketAddr::new(addr.ip(), endpoint.port()))
            .collect();
        let stream = self.session.transport.connect(addresses).await?;

        let secure = layers.first().is_some_and(|l| l.server.is_secure());
        if !secure {
            return Ok((stream, NegotiatedProtocol::Http1));
        }
        self.status.set_load_state(LoadState::SslHandshake);
        let outcome = self
            .session
            .tls
            .handshake(
                stream,
                endpoint.host().to_string(),
                vec![NegotiatedProtocol::Http2, NegotiatedProtocol::Http1],
            )
            .await?;
        Ok((outcome.stream, outcome.negotiated))
    }

    /// One layer's CONNECT, looping over auth challenges while the socket
    /// can be reused.
    async fn establish_layer(
        &self,
        mut stream: IoStream,
        layer: &TunnelLayer,
        negotiated: NegotiatedProtocol,
        credentials: &mut HashMap<usize, AuthCredentials>,
    ) -> Result<std::result::Result<IoStream, Restart>> {
        if negotiated == NegotiatedProtocol::Http2 {
            return self.establish_layer_h2(stream, layer, credentials).await;
        }
        loop {
            let round = tokio::time::timeout(
                self.session.config.timeouts.tunnel,
                self.connect_round_h1(&mut stream, layer, credentials.get(&layer.hop_index)),
            )
            .await
            .map_err(|_| NetError::TimedOut)?;
            let (status, headers) = round?;

            self.session.proxy_delegate.on_tunnel_headers_received(
                &self.chain,
                layer.hop_index,
                status,
                &headers,
            )?;

            match self.interpret_response(layer, status, &headers).await? {
                TunnelVerdict::Established => return Ok(Ok(stream)),
                TunnelVerdict::RetryWithCredentials(creds) => {
                    let reusable = response_allows_socket_reuse(&headers);
                    credentials.insert(layer.hop_index, creds);
                    if !reusable {
                        return Ok(Err(Restart::FromScratch));
                    }
                    // Same socket, fresh CONNECT with Proxy-Authorization.
                }
            }
        }
    }

    /// CONNECT through an H2 proxy session. The stream rides a pooled
    /// session, so an auth retry is just another request on the session.
    async fn establish_layer_h2(
        &self,
        stream: IoStream,
        layer: &TunnelLayer,
        credentials: &mut HashMap<usize, AuthCredentials>,
    ) -> Result<std::result::Result<IoStream, Restart>> {
        let mut underlying = Some(stream);
        let prefix = ProxyChain::new(self.chain.servers()[..layer.hop_index].to_vec());
        let key = SpdySessionKey {
            host_port: layer.server.host_port_pair().clone(),
            proxy_chain: prefix,
            network_anonymization_key: Default::default(),
        };
        loop {
            let mut extra = self
                .session
                .proxy_delegate
                .on_before_tunnel_request(&self.chain, layer.hop_index);
            if let Some(creds) = credentials.get(&layer.hop_index) {
                if let Ok(value) = HeaderValue::from_str(&creds.basic_token()) {
                    extra.insert(http::header::PROXY_AUTHORIZATION, value);
                }
            }
            let response = tokio::time::timeout(
                self.session.config.timeouts.tunnel,
                self.session.spdy_pool.request_tunnel(
                    &key,
                    underlying.take(),
                    layer.connect_target.clone(),
                    H2_QUIC_TUNNEL_PRIORITY,
                    extra,
                ),
            )
            .await
            .map_err(|_| NetError::TimedOut)??;

            self.session.proxy_delegate.on_tunnel_headers_received(
                &self.chain,
                layer.hop_index,
                response.status,
                &response.headers,
            )?;

            match self
                .interpret_response(layer, response.status, &response.headers)
                .await?
            {
                TunnelVerdict::Established => {
                    return match response.stream {
                        Some(stream) => Ok(Ok(stream)),
                        None => Err(NetError::TunnelConnectionFailed),
                    };
                }
                TunnelVerdict::RetryWithCredentials(creds) => {
                    credentials.insert(layer.hop_index, creds);
                }
            }
        }
    }

    /// Write one CONNECT request and read the response head.
    async fn connect_round_h1(
        &self,
        stream: &mut IoStream,
        layer: &TunnelLayer,
        credentials: Option<&AuthCredentials>,
    ) -> Result<(StatusCode, HeaderMap)> {
        let request = self.build_connect_request(layer, credentials);
        stream
            .write_all(request.as_bytes())
            .await
            .map_err(|e| NetError::from_io(&e))?;
        read_response_head(stream).await
    }

    fn build_connect_request(
        &self,
        layer: &TunnelLayer,
        credentials: Option<&AuthCredentials>,
    ) -> String {
        let target = layer.connect_target.to_string_form();
        let mut request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
        request.push_str("Proxy-Connection: keep-alive\r\n");
        if let Some(agent) = &self.session.config.user_agent {
            request.push_str(&format!("User-Agent: {agent}\r\n"));
        }
        let extra = self
            .session
            .proxy_delegate
            .on_before_tunnel_request(&self.chain, layer.hop_index);
        for (name, value) in extra.iter() {
            request.push_str(&format!(
                "{}: {}\r\n",
                name,
                String::from_utf8_lossy(value.as_bytes())
            ));
        }
        if let Some(creds) = credentials {
            request.push_str(&format!("Proxy-Authorization: {}\r\n", creds.basic_token()));
        }
        request.push_str("\r\n");
        request
    }

    /// Map a CONNECT response status to the tunnel outcome. Only 200 opens
    /// the tunnel; 407 enters the auth sub-protocol; redirects are never
    /// followed.
    async fn interpret_response(
        &self,
        layer: &TunnelLayer,
        status: StatusCode,
        headers: &HeaderMap,
    ) -> Result<TunnelVerdict> {
        if status == StatusCode::OK {
            return Ok(TunnelVerdict::Established);
        }
        if status.is_informational() {
            return Err(NetError::TunnelConnectionFailed);
        }
        if status == StatusCode::PROXY_AUTHENTICATION_REQUIRED {
            let challenge = parse_auth_challenge(&layer.server, headers);
            tracing::debug!(
                target: "raceline::connect",
                proxy = %layer.server.host_port_pair(),
                scheme = %challenge.scheme,
                "proxy auth challenge"
            );
            // Credential lookup is unbounded; the tunnel timeout restarts
            // on the next round.
            return match self
                .session
                .auth_controller
                .on_auth_challenge(challenge)
                .await
            {
                Some(creds) => Ok(TunnelVerdict::RetryWithCredentials(creds)),
                None => Err(NetError::ProxyAuthRequested),
            };
        }
        tracing::warn!(
            target: "raceline::connect",
            proxy = %layer.server.host_port_pair(),
            status = status.as_u16(),
            "tunnel refused"
        );
        Err(NetError::TunnelConnectionFailed)
    }
}

enum TunnelVerdict {
    Established,
    RetryWithCredentials(AuthCredentials),
}

/// Read a full response head (through CRLFCRLF) and parse it. EOF before
/// any byte is `EmptyResponse`; EOF mid-headers is
/// `ResponseHeadersTruncated`.
async fn read_response_head(stream: &mut IoStream) -> Result<(StatusCode, HeaderMap)> {
    let mut buf = BytesMut::with_capacity(1024);
    loop {
        if let Some(end) = find_head_end(&buf) {
            return parse_response_head(&buf[..end]);
        }
        if buf.len() > MAX_RESPONSE_HEADER_BYTES {
            return Err(NetError::TunnelConnectionFailed);
        }
        let n = stream
            .read_buf(&mut buf)
            .await
            .map_err(|e| NetError::from_io(&e))?;
        if n == 0 {
            return Err(if buf.is_empty() {
                NetError::EmptyResponse
            } else {
                NetError::ResponseHeadersTruncated
            });
        }
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_response_head(head: &[u8]) -> Result<(StatusCode, HeaderMap)> {
    let text = std::str::from_utf8(head).map_err(|_| NetError::TunnelConnectionFailed)?;
    let mut lines = text.split("\r\n");
    let status_line = lines.next().ok_or(NetError::TunnelConnectionFailed)?;
    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().ok_or(NetError::TunnelConnectionFailed)?;
    if !version.starts_with("HTTP/1.") {
        return Err(NetError::TunnelConnectionFailed);
    }
    let status = parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or(NetError::TunnelConnectionFailed)?;

    let mut headers = HeaderMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or(NetError::TunnelConnectionFailed)?;
        let name =
            HeaderName::from_bytes(name.trim().as_bytes()).map_err(|_| NetError::TunnelConnectionFailed)?;
        let value =
            HeaderValue::from_str(value.trim()).map_err(|_| NetError::TunnelConnectionFailed)?;
        headers.append(name, value);
    }
    Ok((status, headers))
}

/// Whether a non-200 CONNECT response leaves the socket usable for another
/// round: no close directive and an explicitly empty body.
fn response_allows_socket_reuse(headers: &HeaderMap) -> bool {
    let close = headers
        .get_all(CONNECTION)
        .iter()
        .chain(headers.get_all("proxy-connection"))
        .any(|v| {
            v.to_str()
                .map(|s| s.eq_ignore_ascii_case("close"))
                .unwrap_or(true)
        });
    if close {
        return false;
    }
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        == Some(0)
}

/// Pull scheme and realm out of the first Proxy-Authenticate header.
fn parse_auth_challenge(server: &crate::proxy::ProxyServer, headers: &HeaderMap) -> AuthChallenge {
    let raw = headers
        .get(PROXY_AUTHENTICATE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let (scheme, params) = match raw.split_once(' ') {
        Some((scheme, rest)) => (scheme, rest),
        None => (raw, ""),
    };
    let realm = params
        .split(',')
        .filter_map(|param| param.trim().split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("realm"))
        .map(|(_, value)| value.trim().trim_matches('"').to_string())
        .unwrap_or_default();
    AuthChallenge {
        proxy: server.clone(),
        scheme: scheme.to_string(),
        realm,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_response_head() {
        let head = b"HTTP/1.1 200 Connection Established\r\nVia: proxy\r\n";
        let (status, headers) = parse_response_head(head).unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers.get("via").unwrap(), "proxy");

        assert!(parse_response_head(b"SPDY/3 200 OK\r\n").is_err());
        assert!(parse_response_head(b"HTTP/1.1 bogus\r\n").is_err());
        assert!(parse_response_head(b"HTTP/1.1 200 OK\r\nno-colon-line\r\n").is_err());
    }

    #[test]
    fn socket_reuse_requires_keepalive_and_empty_body() {
        let parse = |raw: &[u8]| parse_response_head(raw).unwrap().1;

        let headers = parse(b"HTTP/1.1 407 Auth\r\nContent-Length: 0\r\n");
        assert!(response_allows_socket_reuse(&headers));

        let headers = parse(b"HTTP/1.1 407 Auth\r\nContent-Length: 5\r\n");
        assert!(!response_allows_socket_reuse(&headers));

        let headers = parse(b"HTTP/1.1 407 Auth\r\n");
        assert!(!response_allows_socket_reuse(&headers));

        let headers =
            parse(b"HTTP/1.1 407 Auth\r\nContent-Length: 0\r\nProxy-Connection: close\r\n");
        assert!(!response_allows_socket_reuse(&headers));

        let headers = parse(b"HTTP/1.1 407 Auth\r\nContent-Length: 0\r\nConnection: close\r\n");
        assert!(!response_allows_socket_reuse(&headers));
    }

    #[test]
    fn auth_challenge_parsing() {
        let server = crate::proxy::ProxyServer::from_uri("http://foopy:70", crate::proxy::ProxyScheme::Http);
        let (_, headers) = parse_response_head(
            b"HTTP/1.1 407 Auth\r\nProxy-Authenticate: Basic realm=\"MyRealm1\"\r\n",
        )
        .unwrap();
        let challenge = parse_auth_challenge(&server, &headers);
        assert_eq!(challenge.scheme, "Basic");
        assert_eq!(challenge.realm, "MyRealm1");
    }

    #[test]
    fn load_state_round_trips_through_status() {
        let status = JobStatus::new();
        assert_eq!(status.load_state(), LoadState::Idle);
        status.set_load_state(LoadState::SslHandshake);
        assert_eq!(status.load_state(), LoadState::SslHandshake);
        assert!(!status.has_established_connection());
        status.set_established();
        assert!(status.has_established_connection());
    }
}
