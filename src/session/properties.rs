//! Session-scoped server knowledge
//!
//! [`HttpServerProperties`] remembers what previous connections learned
//! about servers: advertised alternative services, which of those are
//! currently broken, smoothed RTT estimates, and H2 support. Shared across
//! a session behind an `Arc`; all interior mutability is behind one mutex.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tokio::time::Instant;

use crate::connect::interface::QuicVersion;
use crate::proxy::HostPortPair;

/// Partition key for server knowledge. Entries recorded under one key are
/// never visible under another.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct NetworkAnonymizationKey(Option<String>);

impl NetworkAnonymizationKey {
    pub fn from_site(site: impl Into<String>) -> Self {
        Self(Some(site.into()))
    }
}

/// Protocol an alternative service speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlternateProtocol {
    Http2,
    Http3,
}

/// An advertised alternative endpoint for an origin.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AlternativeService {
    pub protocol: AlternateProtocol,
    pub host: String,
    pub port: u16,
}

impl AlternativeService {
    pub fn new(protocol: AlternateProtocol, host: impl Into<String>, port: u16) -> Self {
        Self {
            protocol,
            host: host.into(),
            port,
        }
    }

    pub fn host_port_pair(&self) -> HostPortPair {
        HostPortPair::new(self.host.clone(), self.port)
    }
}

/// An advertisement plus its validity window and, for H3, the QUIC versions
/// the server listed.
#[derive(Debug, Clone)]
pub struct AlternativeServiceInfo {
    pub service: AlternativeService,
    pub expiration: Instant,
    /// Empty means the advertisement named no versions; any locally
    /// supported version may be used.
    pub advertised_versions: Vec<QuicVersion>,
}

/// Smoothed network stats for an origin, learned from completed connections.
#[derive(Debug, Clone, Copy)]
pub struct ServerNetworkStats {
    pub srtt: Duration,
}

/// Initial expiry for a newly broken alternative service. Doubles on each
/// consecutive breakage, capped at two days.
pub const BROKEN_ALTERNATIVE_SERVICE_DELAY: Duration = Duration::from_secs(300);
const MAX_BROKEN_DELAY: Duration = Duration::from_secs(2 * 24 * 60 * 60);

#[derive(Debug, Default)]
struct BrokenState {
    broken_until: Option<Instant>,
    broken_until_default_network_change: bool,
    recently_broken: bool,
    consecutive_failures: u32,
}

impl BrokenState {
    fn is_broken(&self, now: Instant) -> bool {
        self.broken_until_default_network_change
            || self.broken_until.is_some_and(|until| until > now)
    }
}

type ServiceKey = (AlternativeService, NetworkAnonymizationKey);
type OriginKey = (String, u16, NetworkAnonymizationKey);

#[derive(Debug, Default)]
struct Inner {
    alternative_services: HashMap<OriginKey, Vec<AlternativeServiceInfo>>,
    broken: HashMap<ServiceKey, BrokenState>,
    network_stats: HashMap<(String, u16), ServerNetworkStats>,
    supports_h2: HashSet<(String, u16)>,
    h2_preconnects_in_flight: HashSet<(String, u16)>,
}

#[derive(Debug, Default)]
pub struct HttpServerProperties {
    inner: std::sync::Mutex<Inner>,
}

impl HttpServerProperties {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("server properties lock poisoned")
    }

    pub fn set_alternative_services(
        &self,
        host: &str,
        port: u16,
        key: &NetworkAnonymizationKey,
        services: Vec<AlternativeServiceInfo>,
    ) {
        let origin = (host.to_string(), port, key.clone());
        if services.is_empty() {
            self.lock().alternative_services.remove(&origin);
        } else {
            self.lock().alternative_services.insert(origin, services);
        }
    }

    /// Advertisements for an origin, unexpired ones only.
    pub fn alternative_service_infos(
        &self,
        host: &str,
        port: u16,
        key: &NetworkAnonymizationKey,
    ) -> Vec<AlternativeServiceInfo> {
        let now = Instant::now();
        let origin = (host.to_string(), port, key.clone());
        self.lock()
            .alternative_services
            .get(&origin)
            .map(|infos| {
                infos
                    .iter()
                    .filter(|info| info.expiration > now)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Mark `service` broken with exponential-backoff expiry. Survives a
    /// default-network change.
    pub fn mark_alternative_service_broken(
        &self,
        service: &AlternativeService,
        key: &NetworkAnonymizationKey,
    ) {
        let mut inner = self.lock();
        let state = inner
            .broken
            .entry((service.clone(), key.clone()))
            .or_default();
        let shift = state.consecutive_failures.min(10);
        let delay = (BROKEN_ALTERNATIVE_SERVICE_DELAY * 2u32.pow(shift)).min(MAX_BROKEN_DELAY);
        state.broken_until = Some(Instant::now() + delay);
        state.broken_until_default_network_change = false;
        state.recently_broken = true;
        state.consecutive_failures += 1;
        tracing::debug!(
            target: "raceline::session",
            host = %service.host,
            port = service.port,
            delay_secs = delay.as_secs(),
            "alternative service marked broken"
        );
    }

    /// Mark `service` broken only until the default network changes.
    pub fn mark_alternative_service_broken_until_default_network_changes(
        &self,
        service: &AlternativeService,
        key: &NetworkAnonymizationKey,
    ) {
        let mut inner = self.lock();
        let state = inner
            .broken
            .entry((service.clone(), key.clone()))
            .or_default();
        state.broken_until_default_network_change = true;
        state.recently_broken = true;
        tracing::debug!(
            target: "raceline::session",
            host = %service.host,
            port = service.port,
            "alternative service marked broken until default network changes"
        );
    }

    pub fn is_alternative_service_broken(
        &self,
        service: &AlternativeService,
        key: &NetworkAnonymizationKey,
    ) -> bool {
        let now = Instant::now();
        self.lock()
            .broken
            .get(&(service.clone(), key.clone()))
            .is_some_and(|state| state.is_broken(now))
    }

    /// True while broken or after a brokenness whose expiry passed without a
    /// confirmation.
    pub fn was_alternative_service_recently_broken(
        &self,
        service: &AlternativeService,
        key: &NetworkAnonymizationKey,
    ) -> bool {
        self.lock()
            .broken
            .get(&(service.clone(), key.clone()))
            .is_some_and(|state| state.recently_broken)
    }

    /// A connection over `service` worked: clear brokenness and the backoff
    /// history.
    pub fn confirm_alternative_service(
        &self,
        service: &AlternativeService,
        key: &NetworkAnonymizationKey,
    ) {
        self.lock().broken.remove(&(service.clone(), key.clone()));
    }

    /// Drops every until-network-change mark. Backoff-based marks persist.
    pub fn on_default_network_changed(&self) {
        let mut inner = self.lock();
        for state in inner.broken.values_mut() {
            state.broken_until_default_network_change = false;
        }
    }

    pub fn server_network_stats(&self, host: &str, port: u16) -> Option<ServerNetworkStats> {
        self.lock()
            .network_stats
            .get(&(host.to_string(), port))
            .copied()
    }

    pub fn set_server_network_stats(&self, host: &str, port: u16, stats: ServerNetworkStats) {
        self.lock()
            .network_stats
            .insert((host.to_string(), port), stats);
    }

    pub fn supports_h2(&self, host: &str, port: u16) -> bool {
        self.lock().supports_h2.contains(&(host.to_string(), port))
    }

    pub fn set_supports_h2(&self, host: &str, port: u16) {
        self.lock().supports_h2.insert((host.to_string(), port));
    }

    /// Registers an in-flight H2 preconnect for an origin. Returns true when
    /// another preconnect to the same origin was already in flight, in which
    /// case the caller throttles.
    pub fn begin_h2_preconnect(&self, host: &str, port: u16) -> bool {
        !self
            .lock()
            .h2_preconnects_in_flight
            .insert((host.to_string(), port))
    }

    pub fn end_h2_preconnect(&self, host: &str, port: u16) {
        self.lock()
            .h2_preconnects_in_flight
            .remove(&(host.to_string(), port));
    }
}
