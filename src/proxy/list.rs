//! Ordered fallback list of proxy chains
//!
//! [`ProxyList`] holds the chains a request may use, in preference order,
//! with a cursor at the chain currently being attempted. Fallback marks the
//! current chain bad in the shared retry map and advances the cursor; running
//! off the end means every configured chain has failed.

use std::time::Duration;

use crate::error::NetError;
use crate::proxy::chain::ProxyChain;
use crate::proxy::retry::ProxyRetryMap;
use crate::proxy::server::{ProxyScheme, ProxyServer};

#[derive(Debug, Clone, Default)]
pub struct ProxyList {
    chains: Vec<ProxyChain>,
    cursor: usize,
}

impl ProxyList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a semicolon-separated PAC result string, e.g.
    /// `"PROXY a:80; PROXY b:80; DIRECT"`. Malformed elements are skipped.
    pub fn from_pac_string(pac: &str) -> Self {
        let mut chains = Vec::new();
        for element in pac.split(';') {
            let server = ProxyServer::from_pac_string(element);
            if !server.is_valid() {
                tracing::debug!(
                    target: "raceline::proxy",
                    element,
                    "skipping malformed pac element"
                );
                continue;
            }
            chains.push(ProxyChain::from_server(server));
        }
        Self { chains, cursor: 0 }
    }

    pub fn from_chains(chains: Vec<ProxyChain>) -> Self {
        Self { chains, cursor: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }

    pub fn len(&self) -> usize {
        self.chains.len()
    }

    pub fn chains(&self) -> &[ProxyChain] {
        &self.chains
    }

    /// The chain the cursor points at, or `None` once the list is exhausted.
    pub fn current(&self) -> Option<&ProxyChain> {
        self.chains.get(self.cursor)
    }

    /// Record `error` against the current chain and advance to the next one.
    /// Returns the new current chain, or `None` when the list is exhausted.
    /// The failed chain is marked bad in `retry_map` for `retry_delay` so
    /// later requests deprioritize it up front.
    pub fn fallback(
        &mut self,
        error: NetError,
        retry_map: &ProxyRetryMap,
        retry_delay: Duration,
    ) -> Option<&ProxyChain> {
        if let Some(chain) = self.chains.get(self.cursor) {
            retry_map.mark_as_bad(chain, error, retry_delay);
            self.cursor += 1;
        }
        self.current()
    }

    /// Reorder the list so chains currently marked bad come after the rest,
    /// preserving relative order within each group. Resets the cursor.
    pub fn deprioritize_bad(&mut self, retry_map: &ProxyRetryMap) {
        // Direct stays where it is; deprioritizing it below a known-bad proxy
        // would invert the fallback-of-last-resort ordering.
        let (good, bad): (Vec<_>, Vec<_>) = self
            .chains
            .drain(..)
            .partition(|c| c.is_direct() || !retry_map.is_bad(c));
        self.chains = good;
        self.chains.extend(bad);
        self.cursor = 0;
    }

    /// Drop every chain whose first hop uses a scheme outside `allowed`.
    /// Direct chains are always kept.
    pub fn retain_schemes(&mut self, allowed: &[ProxyScheme]) {
        self.chains
            .retain(|c| c.is_direct() || allowed.contains(&c.proxy_server(0).scheme()));
        self.cursor = self.cursor.min(self.chains.len());
    }

    pub fn to_pac_string(&self) -> String {
        self.chains
            .iter()
            .map(ProxyChain::to_pac_string)
            .collect::<Vec<_>>()
            .join(";")
    }
}
