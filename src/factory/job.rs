//! Individual stream-establishment jobs
//!
//! A [`Job`] is one attempt to produce a usable stream for a request: the
//! main TCP+TLS path (direct or tunneled through the proxy chain), an
//! alternative QUIC path from an advertised alternative service, or a
//! DNS-ALPN-discovered H3 path. The controller owns up to three at once and
//! races them; a job itself never retries and reports one terminal outcome.

use std::sync::Arc;

use crate::connect::interface::{
    HttpStream, NegotiatedProtocol, QuicSessionKey, QuicVersion, RequestPriority, SchemeHostPort,
    SharedPriority, SpdySessionKey,
};
use crate::connect::{HttpProxyConnectJob, JobStatus};
use crate::error::{NetError, Result};
use crate::proxy::ProxyChain;
use crate::session::{AlternativeService, NetworkAnonymizationKey, SessionContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    Main,
    Alternative,
    DnsAlpnH3,
}

/// Terminal result of one job, with the default-network marker needed for
/// brokenness bookkeeping.
pub struct JobOutcome {
    pub kind: JobKind,
    pub result: Result<HttpStream>,
    pub failed_on_default_network: bool,
}

pub struct Job {
    session: Arc<SessionContext>,
    kind: JobKind,
    origin: SchemeHostPort,
    proxy_chain: ProxyChain,
    /// The advertised endpoint, for Alternative jobs.
    alternative: Option<AlternativeService>,
    quic_version: Option<QuicVersion>,
    network_anonymization_key: NetworkAnonymizationKey,
    priority: SharedPriority,
    status: Arc<JobStatus>,
}

impl Job {
    pub fn main(
        session: Arc<SessionContext>,
        origin: SchemeHostPort,
        proxy_chain: ProxyChain,
        network_anonymization_key: NetworkAnonymizationKey,
        priority: RequestPriority,
    ) -> Self {
        Self {
            session,
            kind: JobKind::Main,
            origin,
            proxy_chain,
            alternative: None,
            quic_version: None,
            network_anonymization_key,
            priority: SharedPriority::new(priority),
            status: Arc::new(JobStatus::new()),
        }
    }

    pub fn alternative(
        session: Arc<SessionContext>,
        origin: SchemeHostPort,
        service: AlternativeService,
        quic_version: QuicVersion,
        network_anonymization_key: NetworkAnonymizationKey,
        priority: RequestPriority,
    ) -> Self {
        Self {
            session,
            kind: JobKind::Alternative,
            origin,
            proxy_chain: ProxyChain::direct(),
            alternative: Some(service),
            quic_version: Some(quic_version),
            network_anonymization_key,
            priority: SharedPriority::new(priority),
            status: Arc::new(JobStatus::new()),
        }
    }

    pub fn dns_alpn_h3(
        session: Arc<SessionContext>,
        origin: SchemeHostPort,
        quic_version: QuicVersion,
        network_anonymization_key: NetworkAnonymizationKey,
        priority: RequestPriority,
    ) -> Self {
        Self {
            session,
            kind: JobKind::DnsAlpnH3,
            origin,
            proxy_chain: ProxyChain::direct(),
            alternative: None,
            quic_version: Some(quic_version),
            network_anonymization_key,
            priority: SharedPriority::new(priority),
            status: Arc::new(JobStatus::new()),
        }
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn status(&self) -> Arc<JobStatus> {
        self.status.clone()
    }

    pub fn priority_handle(&self) -> SharedPriority {
        self.priority.clone()
    }

    /// The key a pooled H2 session for this job's target would live under.
    pub fn spdy_session_key(&self) -> SpdySessionKey {
        SpdySessionKey {
            host_port: self.origin.host_port_pair().clone(),
            proxy_chain: self.proxy_chain.clone(),
            network_anonymization_key: self.network_anonymization_key.clone(),
        }
    }

    /// Drive this job to its terminal outcome.
    pub async fn run(self) -> JobOutcome {
        let kind = self.kind;
        tracing::debug!(
            target: "raceline::factory",
            ?kind,
            origin = %self.origin,
            chain = %self.proxy_chain,
            "job starting"
        );
        let (result, failed_on_default_network) = match kind {
            JobKind::Main => (self.run_main().await, false),
            JobKind::Alternative => self.run_quic_alternative().await,
            JobKind::DnsAlpnH3 => self.run_dns_alpn().await,
        };
        match &result {
            Ok(stream) => tracing::debug!(
                target: "raceline::factory",
                ?kind,
                protocol = ?stream.protocol,
                "job produced a stream"
            ),
            Err(error) => tracing::debug!(
                target: "raceline::factory",
                ?kind,
                %error,
                "job failed"
            ),
        }
        JobOutcome {
            kind,
            result,
            failed_on_default_network,
        }
    }

    async fn run_main(&self) -> Result<HttpStream> {
        if self.origin.is_https()
            && self
                .session
                .spdy_pool
                .has_available_session(&self.spdy_session_key())
        {
            self.status.set_established();
            return Ok(HttpStream::pooled(NegotiatedProtocol::Http2));
        }

        // The origin's smoothed RTT doubles as the HTTP RTT estimate feeding
        // the adaptive connect timeout.
        let rtt_estimate = self
            .session
            .properties
            .server_network_stats(self.origin.host(), self.origin.port())
            .map(|stats| stats.srtt);

        let mut connect_job = HttpProxyConnectJob::with_status(
            self.session.clone(),
            self.proxy_chain.clone(),
            self.origin.host_port_pair().clone(),
            self.priority.clone(),
            rtt_estimate,
            self.status.clone(),
        );
        // A plain-http request through a single HTTP(S) proxy is written to
        // the proxy directly; only https origins need a tunnel.
        if !self.origin.is_https() && self.proxy_chain.is_get_to_proxy_allowed() {
            connect_job = connect_job.without_tunnel();
        }
        let stream = connect_job.connect().await?;

        if !self.origin.is_https() {
            return Ok(HttpStream::http1(stream));
        }
        let outcome = self
            .session
            .tls
            .handshake(
                stream,
                self.origin.host().to_string(),
                vec![NegotiatedProtocol::Http2, NegotiatedProtocol::Http1],
            )
            .await?;
        if outcome.negotiated == NegotiatedProtocol::Http2 {
            self.session
                .properties
                .set_supports_h2(self.origin.host(), self.origin.port());
        }
        Ok(HttpStream {
            protocol: outcome.negotiated,
            io: Some(outcome.stream),
        })
    }

    async fn run_quic_alternative(&self) -> (Result<HttpStream>, bool) {
        let (service, version) = match (&self.alternative, self.quic_version) {
            (Some(service), Some(version)) => (service, version),
            _ => return (Err(NetError::Unexpected), false),
        };
        let key = QuicSessionKey {
            host_port: service.host_port_pair(),
            network_anonymization_key: self.network_anonymization_key.clone(),
        };
        let outcome = self
            .session
            .quic_pool
            .connect(&key, version, self.priority.get())
            .await;
        if outcome.result.is_ok() {
            self.status.set_established();
        }
        (outcome.result, outcome.failed_on_default_network)
    }

    /// Resolve the origin's HTTPS record; only dial QUIC when the record
    /// advertises an ALPN we can speak.
    async fn run_dns_alpn(&self) -> (Result<HttpStream>, bool) {
        let resolved = match self
            .session
            .resolver
            .resolve(self.origin.host(), self.priority.clone())
            .await
        {
            Ok(resolved) => resolved,
            Err(error) => return (Err(error), false),
        };
        if !resolved.alpns.iter().any(|alpn| alpn == "h3") {
            return (Err(NetError::DnsNoMatchingSupportedAlpn), false);
        }
        let Some(version) = self.quic_version else {
            return (Err(NetError::DnsNoMatchingSupportedAlpn), false);
        };
        let key = QuicSessionKey {
            host_port: self.origin.host_port_pair().clone(),
            network_anonymization_key: self.network_anonymization_key.clone(),
        };
        let outcome = self
            .session
            .quic_pool
            .connect(&key, version, self.priority.get())
            .await;
        if outcome.result.is_ok() {
            self.status.set_established();
        }
        (outcome.result, outcome.failed_on_default_network)
    }
}
