//! Error codes for connection establishment
//!
//! A single flat error code enum is shared by every layer: host resolution,
//! transport, TLS, tunnel negotiation, and QUIC session setup all report one
//! of these codes. Retriability for proxy fallback is decided per proxy
//! scheme in [`classification`].

pub mod classification;

pub use classification::can_fallback_to_next_proxy;

/// A Result alias where the Err case is [`NetError`].
pub type Result<T> = std::result::Result<T, NetError>;

/// Terminal error codes surfaced by connection-establishment jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum NetError {
    // Resolution errors.
    #[error("host name could not be resolved")]
    NameNotResolved,

    // Transport errors.
    #[error("connection refused")]
    ConnectionRefused,
    #[error("connection reset")]
    ConnectionReset,
    #[error("connection aborted")]
    ConnectionAborted,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("connection attempt timed out")]
    ConnectionTimedOut,
    #[error("operation timed out")]
    TimedOut,
    #[error("address unreachable")]
    AddressUnreachable,
    #[error("internet connection lost")]
    InternetDisconnected,
    #[error("network changed")]
    NetworkChanged,

    // TLS errors.
    #[error("SSL protocol error")]
    SslProtocolError,
    #[error("SSL client certificate needed")]
    SslClientAuthCertNeeded,
    #[error("server certificate invalid")]
    CertInvalid,
    #[error("proxy certificate invalid")]
    ProxyCertificateInvalid,

    // Proxy / tunnel errors.
    #[error("proxy connection failed")]
    ProxyConnectionFailed,
    #[error("SOCKS connection failed")]
    SocksConnectionFailed,
    #[error("tunnel connection failed")]
    TunnelConnectionFailed,
    #[error("proxy response headers truncated")]
    ResponseHeadersTruncated,
    #[error("empty response from proxy")]
    EmptyResponse,
    #[error("proxy authentication required")]
    ProxyAuthRequested,
    #[error("no supported proxies in configuration")]
    NoSupportedProxies,

    // QUIC errors.
    #[error("QUIC protocol error")]
    QuicProtocolError,
    #[error("QUIC handshake failed")]
    QuicHandshakeFailed,
    #[error("datagram too big for path")]
    MsgTooBig,
    #[error("no matching supported ALPN in DNS record")]
    DnsNoMatchingSupportedAlpn,

    // Generic I/O failure that does not map to a more specific code.
    #[error("unexpected I/O failure")]
    Unexpected,
}

impl NetError {
    /// Map an I/O error to the closest transport-level code.
    pub fn from_io(err: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::ConnectionRefused => NetError::ConnectionRefused,
            ErrorKind::ConnectionReset | ErrorKind::BrokenPipe => NetError::ConnectionReset,
            ErrorKind::ConnectionAborted => NetError::ConnectionAborted,
            ErrorKind::TimedOut => NetError::ConnectionTimedOut,
            ErrorKind::HostUnreachable | ErrorKind::NetworkUnreachable => {
                NetError::AddressUnreachable
            }
            ErrorKind::UnexpectedEof => NetError::ConnectionClosed,
            _ => NetError::Unexpected,
        }
    }
}

/// Coarse progress indicator for a connect job, for UI/diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    Idle,
    ResolvingHost,
    Connecting,
    SslHandshake,
    EstablishingProxyTunnel,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_mapping() {
        let refused = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        assert_eq!(NetError::from_io(&refused), NetError::ConnectionRefused);
        let eof = std::io::Error::from(std::io::ErrorKind::UnexpectedEof);
        assert_eq!(NetError::from_io(&eof), NetError::ConnectionClosed);
        let other = std::io::Error::other("weird");
        assert_eq!(NetError::from_io(&other), NetError::Unexpected);
    }
}
