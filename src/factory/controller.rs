//! Job racing, alternative-service selection, and proxy fallback
//!
//! [`JobController`] owns one logical request's jobs. It decides which jobs
//! to create for the current proxy chain, applies the main-job delay, races
//! the jobs, hands the first ready stream to the caller, performs
//! alternative-service brokenness bookkeeping for the losers, and walks the
//! proxy list on retriable failures.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

use crate::connect::interface::{
    HttpStream, QuicVersion, RequestPriority, SchemeHostPort, SpdySessionKey,
};
use crate::error::{NetError, Result, can_fallback_to_next_proxy};
use crate::factory::job::{Job, JobKind, JobOutcome};
use crate::proxy::{ProxyChain, ProxyList};
use crate::session::{
    AlternateProtocol, AlternativeService, NetworkAnonymizationKey, SessionContext,
};

/// The winning stream plus where it came from.
#[derive(Debug)]
pub struct StreamOutcome {
    pub stream: HttpStream,
    pub winner: JobKind,
    pub proxy_chain: ProxyChain,
}

/// What alternative-service selection concluded for an origin.
struct AltSelection {
    selected: Option<(AlternativeService, QuicVersion)>,
    /// QUIC was advertised but every QUIC alternative is currently broken.
    all_quic_broken: bool,
}

pub struct JobController {
    session: Arc<SessionContext>,
    origin: SchemeHostPort,
    network_anonymization_key: NetworkAnonymizationKey,
    priority: RequestPriority,
}

impl JobController {
    pub fn new(
        session: Arc<SessionContext>,
        origin: SchemeHostPort,
        network_anonymization_key: NetworkAnonymizationKey,
        priority: RequestPriority,
    ) -> Self {
        Self {
            session,
            origin,
            network_anonymization_key,
            priority,
        }
    }

    /// Establish a stream, falling back across `proxy_list` on retriable
    /// failures. The caller sees one terminal outcome; intermediate chain
    /// failures are absorbed unless the list is exhausted.
    pub async fn run(&self, proxy_list: &mut ProxyList) -> Result<StreamOutcome> {
        proxy_list.deprioritize_bad(&self.session.retry_map);
        let mut last_error = NetError::NoSupportedProxies;
        while let Some(chain) = proxy_list.current().cloned() {
            match self.race_over_chain(chain.clone()).await {
                Ok(outcome) => return Ok(outcome),
                Err(error) => {
                    last_error = error;
                    if !can_fallback_to_next_proxy(&chain, error) {
                        return Err(error);
                    }
                    tracing::info!(
                        target: "raceline::factory",
                        chain = %chain,
                        %error,
                        "retrying on next proxy chain"
                    );
                    self.session.proxy_delegate.on_fallback(&chain, error);
                    proxy_list.fallback(
                        error,
                        &self.session.retry_map,
                        self.session.config.proxy_retry_delay,
                    );
                }
            }
        }
        Err(last_error)
    }

    /// Race main / alternative / DNS-ALPN jobs over one proxy chain.
    async fn race_over_chain(&self, chain: ProxyChain) -> Result<StreamOutcome> {
        let going_direct = chain.is_direct();
        let quic_possible = self.quic_possible() && going_direct;

        let selection = if quic_possible {
            self.select_alternative()
        } else {
            AltSelection {
                selected: None,
                all_quic_broken: false,
            }
        };
        if selection.all_quic_broken {
            self.session.proxy_delegate.on_quic_broken(&self.origin);
        }

        let alt_service = selection.selected.as_ref().map(|(svc, _)| svc.clone());
        let alt_job = selection.selected.map(|(service, version)| {
            Job::alternative(
                self.session.clone(),
                self.origin.clone(),
                service,
                version,
                self.network_anonymization_key.clone(),
                self.priority,
            )
        });

        let dns_service = self.dns_alt_service();
        let dns_job = if quic_possible
            && self.session.config.enable_dns_alpn_h3
            && !self.alt_covers_origin(alt_service.as_ref())
            && !self.session.properties.is_alternative_service_broken(
                &dns_service,
                &self.network_anonymization_key,
            ) {
            Some(Job::dns_alpn_h3(
                self.session.clone(),
                self.origin.clone(),
                self.first_supported_version(),
                self.network_anonymization_key.clone(),
                self.priority,
            ))
        } else {
            None
        };

        let main_job = Job::main(
            self.session.clone(),
            self.origin.clone(),
            chain.clone(),
            self.network_anonymization_key.clone(),
            self.priority,
        );
        let main_key = main_job.spdy_session_key();

        let delay = if alt_job.is_some() || dns_job.is_some() {
            let consulted = alt_service.as_ref().unwrap_or(&dns_service);
            self.main_job_delay(consulted, alt_service.is_some(), &main_key)
        } else {
            None
        };

        self.race(chain, main_job, alt_job, dns_job, alt_service, dns_service, delay)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn race(
        &self,
        chain: ProxyChain,
        main_job: Job,
        alt_job: Option<Job>,
        dns_job: Option<Job>,
        alt_service: Option<AlternativeService>,
        dns_service: AlternativeService,
        delay: Option<Duration>,
    ) -> Result<StreamOutcome> {
        let resume = Arc::new(Notify::new());
        let main_fut = {
            let resume = resume.clone();
            async move {
                if let Some(delay) = delay {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {
                            tracing::debug!(
                                target: "raceline::factory",
                                delay_ms = delay.as_millis() as u64,
                                "main job delay elapsed"
                            );
                        }
                        _ = resume.notified() => {
                            tracing::debug!(
                                target: "raceline::factory",
                                "main job resumed before its delay elapsed"
                            );
                        }
                    }
                }
                main_job.run().await
            }
        };
        tokio::pin!(main_fut);
        let mut alt_fut = alt_job.map(|job| Box::pin(job.run()));
        let mut dns_fut = dns_job.map(|job| Box::pin(job.run()));

        let mut main_alive = true;
        let mut main_error: Option<NetError> = None;
        let mut alt_failure: Option<(NetError, bool)> = None;
        let mut dns_failure: Option<(NetError, bool)> = None;

        loop {
            tokio::select! {
                outcome = &mut main_fut, if main_alive => {
                    main_alive = false;
                    match outcome.result {
                        Ok(stream) => {
                            self.record_loser_brokenness(
                                alt_service.as_ref(),
                                alt_failure,
                                &dns_service,
                                dns_failure,
                            );
                            self.orphan_dns_job(dns_fut.take(), dns_service.clone());
                            return Ok(StreamOutcome {
                                stream,
                                winner: JobKind::Main,
                                proxy_chain: chain,
                            });
                        }
                        Err(error) => {
                            main_error = Some(error);
                            if alt_fut.is_none() && dns_fut.is_none() {
                                return Err(error);
                            }
                        }
                    }
                }
                outcome = conditional(&mut alt_fut) => {
                    alt_fut = None;
                    match outcome.result {
                        Ok(stream) => {
                            if let Some(service) = &alt_service {
                                if outcome.failed_on_default_network {
                                    self.session
                                        .properties
                                        .mark_alternative_service_broken_until_default_network_changes(
                                            service,
                                            &self.network_anonymization_key,
                                        );
                                } else {
                                    self.session.properties.confirm_alternative_service(
                                        service,
                                        &self.network_anonymization_key,
                                    );
                                }
                            }
                            self.orphan_dns_job(dns_fut.take(), dns_service.clone());
                            return Ok(StreamOutcome {
                                stream,
                                winner: JobKind::Alternative,
                                proxy_chain: chain,
                            });
                        }
                        Err(error) => {
                            alt_failure = Some((error, outcome.failed_on_default_network));
                            // A pending delayed main resumes right away.
                            resume.notify_one();
                            if !main_alive && dns_fut.is_none() {
                                return Err(main_error.unwrap_or(error));
                            }
                        }
                    }
                }
                outcome = conditional(&mut dns_fut) => {
                    dns_fut = None;
                    match outcome.result {
                        Ok(stream) => {
                            if outcome.failed_on_default_network {
                                self.session
                                    .properties
                                    .mark_alternative_service_broken_until_default_network_changes(
                                        &dns_service,
                                        &self.network_anonymization_key,
                                    );
                            } else {
                                self.session.properties.confirm_alternative_service(
                                    &dns_service,
                                    &self.network_anonymization_key,
                                );
                            }
                            return Ok(StreamOutcome {
                                stream,
                                winner: JobKind::DnsAlpnH3,
                                proxy_chain: chain,
                            });
                        }
                        Err(error) => {
                            dns_failure = Some((error, outcome.failed_on_default_network));
                            resume.notify_one();
                            if !main_alive && alt_fut.is_none() {
                                return Err(main_error.unwrap_or(error));
                            }
                        }
                    }
                }
            }
        }
    }

    /// Brokenness records for jobs that lost to a successful main job.
    /// Nothing is recorded when the main job also failed; a failure both
    /// ways says nothing about the alternative specifically.
    fn record_loser_brokenness(
        &self,
        alt_service: Option<&AlternativeService>,
        alt_failure: Option<(NetError, bool)>,
        dns_service: &AlternativeService,
        dns_failure: Option<(NetError, bool)>,
    ) {
        if let (Some(service), Some((error, on_default_network))) = (alt_service, alt_failure) {
            if on_default_network && !self.is_ignorable_failure(error, service) {
                self.session
                    .properties
                    .mark_alternative_service_broken(service, &self.network_anonymization_key);
            }
        }
        if let Some((error, on_default_network)) = dns_failure {
            // The DNS-discovered path never earns the permanent mark, and a
            // no-matching-ALPN answer is not a failure of the service.
            if on_default_network
                && error != NetError::DnsNoMatchingSupportedAlpn
                && !self.is_ignorable_failure(error, dns_service)
            {
                self.session
                    .properties
                    .mark_alternative_service_broken_until_default_network_changes(
                        dns_service,
                        &self.network_anonymization_key,
                    );
            }
        }
    }

    /// Errors that say nothing about the alternative service itself.
    fn is_ignorable_failure(&self, error: NetError, service: &AlternativeService) -> bool {
        match error {
            NetError::NetworkChanged | NetError::InternetDisconnected => true,
            // A resolution failure for a different host than the origin does
            // not implicate the origin's alternative.
            NetError::NameNotResolved => service.host != self.origin.host(),
            _ => false,
        }
    }

    /// Let a losing DNS-ALPN job run to completion detached; its outcome
    /// still feeds brokenness bookkeeping.
    fn orphan_dns_job(
        &self,
        fut: Option<std::pin::Pin<Box<impl std::future::Future<Output = JobOutcome> + Send + 'static>>>,
        dns_service: AlternativeService,
    ) {
        let Some(fut) = fut else { return };
        tracing::debug!(
            target: "raceline::factory",
            origin = %self.origin,
            "orphaning dns-alpn job"
        );
        let session = self.session.clone();
        let key = self.network_anonymization_key.clone();
        let origin_host = self.origin.host().to_string();
        tokio::spawn(async move {
            let outcome = fut.await;
            if let Err(error) = outcome.result {
                let ignorable = matches!(
                    error,
                    NetError::NetworkChanged | NetError::InternetDisconnected
                ) || (error == NetError::NameNotResolved && dns_service.host != origin_host);
                if outcome.failed_on_default_network
                    && error != NetError::DnsNoMatchingSupportedAlpn
                    && !ignorable
                {
                    session
                        .properties
                        .mark_alternative_service_broken_until_default_network_changes(
                            &dns_service,
                            &key,
                        );
                }
            }
        });
    }

    fn quic_possible(&self) -> bool {
        let config = &self.session.config;
        config.enable_quic
            && !config.supported_quic_versions.is_empty()
            && self.origin.is_https()
            && config.quic_allowed_for_host(self.origin.host())
    }

    fn first_supported_version(&self) -> QuicVersion {
        // quic_possible() guards against an empty list.
        self.session.config.supported_quic_versions[0]
    }

    /// Pick the alternative service to race: first unexpired, unbroken H3
    /// advertisement that clears the restricted-port rule and has a version
    /// we speak.
    fn select_alternative(&self) -> AltSelection {
        if !self.session.config.enable_alternative_services {
            return AltSelection {
                selected: None,
                all_quic_broken: false,
            };
        }
        let infos = self.session.properties.alternative_service_infos(
            self.origin.host(),
            self.origin.port(),
            &self.network_anonymization_key,
        );
        let mut quic_advertised = false;
        let mut quic_usable = false;
        let mut selected = None;
        for info in infos {
            if info.service.protocol != AlternateProtocol::Http3 {
                continue;
            }
            quic_advertised = true;
            if self
                .session
                .properties
                .is_alternative_service_broken(&info.service, &self.network_anonymization_key)
            {
                continue;
            }
            quic_usable = true;
            // An alternative on an unrestricted port must not be followed
            // from a restricted-port origin.
            if self.origin.port() < 1024 && info.service.port >= 1024 {
                continue;
            }
            let Some(version) = self.compatible_version(&info.advertised_versions) else {
                continue;
            };
            if selected.is_none() {
                selected = Some((info.service, version));
            }
        }
        AltSelection {
            selected,
            all_quic_broken: quic_advertised && !quic_usable,
        }
    }

    /// First advertised version we support; an empty advertisement accepts
    /// our first supported version.
    fn compatible_version(&self, advertised: &[QuicVersion]) -> Option<QuicVersion> {
        let supported = &self.session.config.supported_quic_versions;
        if advertised.is_empty() {
            return supported.first().copied();
        }
        advertised.iter().copied().find(|v| supported.contains(v))
    }

    /// The synthetic alternative-service identity the DNS-ALPN path is
    /// tracked under.
    fn dns_alt_service(&self) -> AlternativeService {
        AlternativeService::new(
            AlternateProtocol::Http3,
            self.origin.host(),
            self.origin.port(),
        )
    }

    fn alt_covers_origin(&self, alt_service: Option<&AlternativeService>) -> bool {
        alt_service
            .is_some_and(|svc| svc.host == self.origin.host() && svc.port == self.origin.port())
    }

    /// How long to hold the main job back, or `None` to start immediately.
    fn main_job_delay(
        &self,
        consulted: &AlternativeService,
        explicitly_advertised: bool,
        main_key: &SpdySessionKey,
    ) -> Option<Duration> {
        // QUIC that recently failed and was not since confirmed gets no
        // head start.
        if self
            .session
            .properties
            .was_alternative_service_recently_broken(consulted, &self.network_anonymization_key)
        {
            return None;
        }
        // A pooled session lets the main job finish without a handshake;
        // only an explicitly advertised alternative outranks that.
        if !explicitly_advertised && self.session.spdy_pool.has_available_session(main_key) {
            return None;
        }
        let config = &self.session.config;
        let delay = match self
            .session
            .properties
            .server_network_stats(self.origin.host(), self.origin.port())
        {
            Some(stats) => stats
                .srtt
                .mul_f64(config.srtt_multiplier)
                .min(config.max_main_job_delay),
            None => config.main_job_delay,
        };
        Some(delay)
    }

    /// Pre-warm up to `num_streams` connections over `chain` without a
    /// request attached.
    pub async fn preconnect(&self, num_streams: usize, chain: ProxyChain) -> Result<()> {
        let host = self.origin.host().to_string();
        let port = self.origin.port();
        let supports_h2 = self.session.properties.supports_h2(&host, port);
        // One multiplexed connection serves any number of streams.
        let wanted = if supports_h2 { 1 } else { num_streams.max(1) };

        let mut registered = false;
        if supports_h2 {
            let throttled = self.session.properties.begin_h2_preconnect(&host, port);
            if throttled {
                tracing::debug!(
                    target: "raceline::factory",
                    origin = %self.origin,
                    "preconnect throttled behind an in-flight H2 preconnect"
                );
                tokio::time::sleep(self.session.config.h2_preconnect_throttle).await;
                let key = SpdySessionKey {
                    host_port: self.origin.host_port_pair().clone(),
                    proxy_chain: chain.clone(),
                    network_anonymization_key: self.network_anonymization_key.clone(),
                };
                if self.session.spdy_pool.has_available_session(&key) {
                    return Ok(());
                }
            } else {
                registered = true;
            }
        }

        let result = self.preconnect_streams(wanted, chain).await;
        if registered {
            self.session.properties.end_h2_preconnect(&host, port);
        }
        result
    }

    async fn preconnect_streams(&self, wanted: usize, chain: ProxyChain) -> Result<()> {
        // DNS-discovered H3 first when eligible, with a plain backup when
        // the record advertises no ALPN we speak.
        if self.quic_possible() && chain.is_direct() && self.session.config.enable_dns_alpn_h3 {
            let job = Job::dns_alpn_h3(
                self.session.clone(),
                self.origin.clone(),
                self.first_supported_version(),
                self.network_anonymization_key.clone(),
                self.priority,
            );
            match job.run().await.result {
                Ok(_) => return Ok(()),
                Err(NetError::DnsNoMatchingSupportedAlpn) => {
                    tracing::debug!(
                        target: "raceline::factory",
                        origin = %self.origin,
                        "dns-alpn preconnect found no usable alpn, preconnecting plain"
                    );
                }
                Err(error) => return Err(error),
            }
        }

        let attempts = (0..wanted).map(|_| {
            Job::main(
                self.session.clone(),
                self.origin.clone(),
                chain.clone(),
                self.network_anonymization_key.clone(),
                self.priority,
            )
            .run()
        });
        let outcomes = futures_util::future::join_all(attempts).await;
        let mut last_error = None;
        let mut any_ok = false;
        for outcome in outcomes {
            match outcome.result {
                Ok(_) => any_ok = true,
                Err(error) => last_error = Some(error),
            }
        }
        match (any_ok, last_error) {
            (true, _) | (false, None) => Ok(()),
            (false, Some(error)) => Err(error),
        }
    }
}

/// Awaits the future inside `slot`; never resolves while the slot is empty.
/// The race loop always returns out of a branch before every slot can be
/// empty at once.
async fn conditional<F: std::future::Future + Unpin>(slot: &mut Option<F>) -> F::Output {
    match slot.as_mut() {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}
