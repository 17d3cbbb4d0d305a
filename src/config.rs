//! Tunables for connection establishment and job racing
//!
//! Every constant the racing and tunnel logic depends on lives here with its
//! default, so tests can pin values and embedders can override them.

use std::time::Duration;

use crate::connect::interface::QuicVersion;
use crate::connect::ConnectTimeoutConfig;

/// Default artificial delay before starting the main job when an
/// alternative job exists and no RTT estimate is known.
pub const DEFAULT_MAIN_JOB_DELAY: Duration = Duration::from_millis(300);

/// Multiplier applied to the smoothed RTT when computing the main-job delay.
pub const MAIN_JOB_DELAY_SRTT_MULTIPLIER: f64 = 1.5;

/// Hard cap on the main-job delay.
pub const MAX_MAIN_JOB_DELAY: Duration = Duration::from_secs(3);

/// Wait imposed on an H2 preconnect when another preconnect to the same
/// origin is already in flight.
pub const H2_PRECONNECT_THROTTLE: Duration = Duration::from_millis(300);

/// How long a failed proxy chain stays deprioritized.
pub const DEFAULT_PROXY_RETRY_DELAY: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
pub struct FactoryConfig {
    /// Master switch for QUIC alternative jobs.
    pub enable_quic: bool,
    /// Whether advertised alternative services are consulted at all.
    pub enable_alternative_services: bool,
    /// Whether DNS HTTPS-record ALPN entries may spawn an H3 job.
    pub enable_dns_alpn_h3: bool,
    /// QUIC versions this endpoint can speak, in preference order.
    pub supported_quic_versions: Vec<QuicVersion>,
    /// When non-empty, QUIC alternatives are only raced for these hosts.
    pub quic_host_allowlist: Vec<String>,
    pub main_job_delay: Duration,
    pub srtt_multiplier: f64,
    pub max_main_job_delay: Duration,
    pub h2_preconnect_throttle: Duration,
    pub proxy_retry_delay: Duration,
    pub user_agent: Option<String>,
    pub timeouts: ConnectTimeoutConfig,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            enable_quic: true,
            enable_alternative_services: true,
            enable_dns_alpn_h3: true,
            supported_quic_versions: vec![QuicVersion::Rfc9000],
            quic_host_allowlist: Vec::new(),
            main_job_delay: DEFAULT_MAIN_JOB_DELAY,
            srtt_multiplier: MAIN_JOB_DELAY_SRTT_MULTIPLIER,
            max_main_job_delay: MAX_MAIN_JOB_DELAY,
            h2_preconnect_throttle: H2_PRECONNECT_THROTTLE,
            proxy_retry_delay: DEFAULT_PROXY_RETRY_DELAY,
            user_agent: None,
            timeouts: ConnectTimeoutConfig::default(),
        }
    }
}

impl FactoryConfig {
    /// Whether a QUIC alternative may be raced for `host`.
    pub fn quic_allowed_for_host(&self, host: &str) -> bool {
        self.quic_host_allowlist.is_empty()
            || self.quic_host_allowlist.iter().any(|h| h == host)
    }
}
