//! Proxy retry bookkeeping
//!
//! Chains that recently failed with a retriable error are remembered here and
//! skipped on subsequent proxy-list iteration until their retry deadline
//! expires. Entries are keyed by the full [`ProxyChain`] value, so two chains
//! differing only in the IP-protection tag are tracked independently, and a
//! failure attributed to any hop marks the whole chain.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::NetError;
use crate::proxy::ProxyChain;

/// Why and until when a chain is considered bad.
#[derive(Debug, Clone)]
pub struct ProxyRetryInfo {
    pub bad_until: Instant,
    pub net_error: NetError,
    /// The delay the entry was marked with, kept so a re-mark of the same
    /// chain can be compared against the deadline it replaces.
    pub current_delay: Duration,
}

/// Shared map of temporarily-bad proxy chains. Session-scoped, injected
/// wherever needed; never global.
#[derive(Debug, Default)]
pub struct ProxyRetryMap {
    entries: Mutex<HashMap<ProxyChain, ProxyRetryInfo>>,
}

impl ProxyRetryMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `chain` bad for `retry_delay` because of `error`. Direct chains
    /// are never marked.
    pub fn mark_as_bad(&self, chain: &ProxyChain, error: NetError, retry_delay: Duration) {
        if chain.is_direct() || !chain.is_valid() {
            return;
        }
        tracing::debug!(
            target: "raceline::proxy",
            chain = %chain,
            error = %error,
            retry_delay_ms = retry_delay.as_millis() as u64,
            "marking proxy chain as bad"
        );
        let mut entries = self.entries.lock().expect("retry map lock poisoned");
        entries.insert(
            chain.clone(),
            ProxyRetryInfo {
                bad_until: Instant::now() + retry_delay,
                net_error: error,
                current_delay: retry_delay,
            },
        );
    }

    /// True if `chain` has an unexpired retry deadline.
    pub fn is_bad(&self, chain: &ProxyChain) -> bool {
        let entries = self.entries.lock().expect("retry map lock poisoned");
        match entries.get(chain) {
            Some(info) => info.bad_until > Instant::now(),
            None => false,
        }
    }

    /// Retry info for `chain`, expired or not.
    pub fn get(&self, chain: &ProxyChain) -> Option<ProxyRetryInfo> {
        self.entries
            .lock()
            .expect("retry map lock poisoned")
            .get(chain)
            .cloned()
    }

    /// Drop entries whose deadline has passed.
    pub fn clear_expired(&self) {
        let now = Instant::now();
        self.entries
            .lock()
            .expect("retry map lock poisoned")
            .retain(|_, info| info.bad_until > now);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("retry map lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::ProxyScheme;

    fn chain(uri: &str) -> ProxyChain {
        ProxyChain::from_uri(uri, ProxyScheme::Http)
    }

    #[tokio::test(start_paused = true)]
    async fn mark_and_expire() {
        let map = ProxyRetryMap::new();
        let bad = chain("http://bad:80");
        map.mark_as_bad(&bad, NetError::ConnectionRefused, Duration::from_secs(300));
        assert!(map.is_bad(&bad));
        assert_eq!(map.get(&bad).unwrap().net_error, NetError::ConnectionRefused);

        tokio::time::advance(Duration::from_secs(301)).await;
        assert!(!map.is_bad(&bad));
        map.clear_expired();
        assert!(map.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn direct_is_never_marked() {
        let map = ProxyRetryMap::new();
        map.mark_as_bad(
            &ProxyChain::direct(),
            NetError::ConnectionRefused,
            Duration::from_secs(300),
        );
        assert!(map.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn ip_protection_tag_tracked_separately() {
        let map = ProxyRetryMap::new();
        let plain = chain("https://proxy:443");
        let tagged = plain.for_ip_protection();
        map.mark_as_bad(&tagged, NetError::ConnectionReset, Duration::from_secs(60));
        assert!(map.is_bad(&tagged));
        assert!(!map.is_bad(&plain));
    }
}
