//! Connect-phase timeout policy
//!
//! The time allowed for reaching an HTTP(S) proxy adapts to the measured
//! network: a multiple of the smoothed HTTP RTT estimate, clamped to a fixed
//! window. Without an estimate the policy falls back either to a flat
//! alternate default (constrained platforms) or to the sum of the underlying
//! transport and TLS budgets.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ConnectTimeoutConfig {
    /// RTT multiplier for secure (TLS/QUIC) proxy hops.
    pub secure_multiplier: u32,
    /// RTT multiplier for insecure proxy hops.
    pub insecure_multiplier: u32,
    /// Lower clamp on the adaptive connect timeout.
    pub min_connect: Duration,
    /// Upper clamp on the adaptive connect timeout.
    pub max_connect: Duration,
    /// Budget for one CONNECT exchange once the proxy connection is up.
    /// Suspended while an auth challenge waits on credentials.
    pub tunnel: Duration,
    /// When set, a missing RTT estimate yields `alternate_default` instead
    /// of the transport+TLS sum.
    pub use_alternate_default: bool,
    pub alternate_default: Duration,
    /// Budget for the raw transport connect, used only in the fallback sum.
    pub transport: Duration,
    /// Additional budget for the TLS handshake, used only in the fallback
    /// sum for secure hops.
    pub tls_handshake: Duration,
}

impl Default for ConnectTimeoutConfig {
    fn default() -> Self {
        Self {
            secure_multiplier: 10,
            insecure_multiplier: 5,
            min_connect: Duration::from_secs(8),
            max_connect: Duration::from_secs(30),
            tunnel: Duration::from_secs(10),
            use_alternate_default: false,
            alternate_default: Duration::from_secs(10),
            transport: Duration::from_secs(240),
            tls_handshake: Duration::from_secs(30),
        }
    }
}

impl ConnectTimeoutConfig {
    /// Time allowed to bring up the connection to a proxy hop, through TLS
    /// for secure hops.
    pub fn connect_timeout(&self, secure: bool, rtt_estimate: Option<Duration>) -> Duration {
        match rtt_estimate {
            Some(rtt) => {
                let multiplier = if secure {
                    self.secure_multiplier
                } else {
                    self.insecure_multiplier
                };
                (rtt * multiplier).clamp(self.min_connect, self.max_connect)
            }
            None if self.use_alternate_default => self.alternate_default,
            None => {
                let mut total = self.transport;
                if secure {
                    total += self.tls_handshake;
                }
                total
            }
        }
    }
}
