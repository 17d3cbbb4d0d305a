//! Proxy fallback retriability
//!
//! Decides whether a terminal connection error, attributed to a particular
//! proxy chain, should cause the request to be retried on the next chain in
//! the configured proxy list. The sets are deliberately scheme-specific and
//! partially empirical; `ConnectionClosed` triggers fallback only for SOCKS
//! proxies, `MsgTooBig` only for QUIC proxies, and `EmptyResponse` never
//! does.

use crate::error::NetError;
use crate::proxy::{ProxyChain, ProxyScheme};

/// Errors that trigger fallback for every non-direct proxy chain.
fn in_common_set(error: NetError) -> bool {
    matches!(
        error,
        NetError::ProxyConnectionFailed
            | NetError::NameNotResolved
            | NetError::AddressUnreachable
            | NetError::ConnectionRefused
            | NetError::ConnectionReset
            | NetError::ConnectionAborted
            | NetError::ConnectionTimedOut
            | NetError::TimedOut
            | NetError::SslProtocolError
            | NetError::SslClientAuthCertNeeded
            | NetError::ProxyCertificateInvalid
    )
}

/// Returns true if `error`, raised while connecting through `chain`, should
/// cause the request to be retried against the next configured proxy chain.
///
/// Direct connections never fall back; there is nothing to fall back to past
/// DIRECT, and origin-leg certificate errors must stay user-visible.
pub fn can_fallback_to_next_proxy(chain: &ProxyChain, error: NetError) -> bool {
    if !chain.is_valid() || chain.is_direct() {
        return false;
    }

    if in_common_set(error) {
        return true;
    }

    let socks = chain
        .servers()
        .iter()
        .any(|s| matches!(s.scheme(), ProxyScheme::Socks4 | ProxyScheme::Socks5));
    if socks
        && matches!(
            error,
            NetError::ConnectionClosed | NetError::SocksConnectionFailed
        )
    {
        return true;
    }

    let quic = chain
        .servers()
        .iter()
        .any(|s| s.scheme() == ProxyScheme::Quic);
    if quic
        && matches!(
            error,
            NetError::QuicProtocolError | NetError::QuicHandshakeFailed | NetError::MsgTooBig
        )
    {
        return true;
    }

    false
}
