//! Ordered proxy hop sequences
//!
//! [`ProxyChain`] is an immutable ordered list of [`ProxyServer`] hops. Zero
//! hops means a direct connection. Multi-hop chains are only valid when every
//! hop is HTTP or HTTPS (mixing the two is allowed); a chain may additionally
//! be tagged as used for IP-protection proxying, and two chains that differ
//! only in that tag are distinct values with independent retry tracking.

use std::fmt;

use crate::proxy::server::{ProxyScheme, ProxyServer};

/// Chain id assigned by [`ProxyChain::for_ip_protection`] when no explicit id
/// is given.
pub const DEFAULT_IP_PROTECTION_CHAIN_ID: i32 = 0;

/// An immutable ordered sequence of proxy hops.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProxyChain {
    // None marks the invalid chain, produced by failed parses and by
    // construction from an inconsistent hop list.
    servers: Option<Vec<ProxyServer>>,
    ip_protection_chain_id: Option<i32>,
}

impl ProxyChain {
    /// The zero-hop (direct) chain.
    pub fn direct() -> Self {
        Self {
            servers: Some(Vec::new()),
            ip_protection_chain_id: None,
        }
    }

    /// The invalid sentinel chain.
    pub fn invalid() -> Self {
        Self {
            servers: None,
            ip_protection_chain_id: None,
        }
    }

    /// Build a chain from an ordered hop list, validating multi-hop rules.
    /// An inconsistent list yields [`ProxyChain::invalid`].
    pub fn new(servers: Vec<ProxyServer>) -> Self {
        if !Self::is_valid_server_list(&servers) {
            return Self::invalid();
        }
        Self {
            servers: Some(servers),
            ip_protection_chain_id: None,
        }
    }

    /// Build a single-hop chain. A Direct server yields the direct chain; an
    /// invalid server yields the invalid chain.
    pub fn from_server(server: ProxyServer) -> Self {
        match server.scheme() {
            ProxyScheme::Direct => Self::direct(),
            ProxyScheme::Invalid => Self::invalid(),
            _ => Self::new(vec![server]),
        }
    }

    fn is_valid_server_list(servers: &[ProxyServer]) -> bool {
        if servers.iter().any(|s| !s.is_valid() || s.is_direct()) {
            return false;
        }
        // Multi-hop chains may freely mix HTTP and HTTPS but nothing else.
        servers.len() <= 1 || servers.iter().all(|s| s.is_http_like())
    }

    pub fn is_valid(&self) -> bool {
        self.servers.is_some()
    }

    pub fn is_direct(&self) -> bool {
        matches!(&self.servers, Some(s) if s.is_empty())
    }

    pub fn is_single_proxy(&self) -> bool {
        matches!(&self.servers, Some(s) if s.len() == 1)
    }

    pub fn is_multi_proxy(&self) -> bool {
        matches!(&self.servers, Some(s) if s.len() > 1)
    }

    pub fn is_for_ip_protection(&self) -> bool {
        self.ip_protection_chain_id.is_some()
    }

    pub fn ip_protection_chain_id(&self) -> Option<i32> {
        self.ip_protection_chain_id
    }

    /// Whether a plain GET may be issued to the first hop instead of a
    /// CONNECT tunnel: allowed only for a single HTTP or HTTPS hop.
    pub fn is_get_to_proxy_allowed(&self) -> bool {
        match &self.servers {
            Some(s) => s.len() == 1 && s[0].is_http_like(),
            None => false,
        }
    }

    /// Number of hops. Zero for direct and for the invalid chain.
    pub fn length(&self) -> usize {
        self.servers.as_ref().map_or(0, Vec::len)
    }

    /// The hop list. Empty for direct and for the invalid chain.
    pub fn servers(&self) -> &[ProxyServer] {
        self.servers.as_deref().unwrap_or(&[])
    }

    /// The hop at `index`.
    ///
    /// # Panics
    ///
    /// Panics when the chain is invalid or `index` is out of range.
    pub fn proxy_server(&self, index: usize) -> &ProxyServer {
        let servers = self.servers.as_ref().expect("invalid proxy chain");
        &servers[index]
    }

    /// The last hop.
    ///
    /// # Panics
    ///
    /// Panics for direct and invalid chains.
    pub fn last(&self) -> &ProxyServer {
        self.servers
            .as_ref()
            .and_then(|s| s.last())
            .expect("proxy chain has no last hop")
    }

    /// Splits off the last hop, returning the prefix chain (which keeps the
    /// IP-protection tag) and the removed server. `None` for direct and
    /// invalid chains.
    pub fn split_last(&self) -> Option<(ProxyChain, ProxyServer)> {
        let servers = self.servers.as_ref()?;
        let (last, prefix) = servers.split_last()?;
        let prefix_chain = ProxyChain {
            servers: Some(prefix.to_vec()),
            ip_protection_chain_id: self.ip_protection_chain_id,
        };
        Some((prefix_chain, last.clone()))
    }

    /// A copy of this chain tagged for IP protection. Idempotent with
    /// respect to the hop list; an already-tagged chain keeps its id.
    pub fn for_ip_protection(&self) -> ProxyChain {
        let mut chain = self.clone();
        if chain.ip_protection_chain_id.is_none() {
            chain.ip_protection_chain_id = Some(DEFAULT_IP_PROTECTION_CHAIN_ID);
        }
        chain
    }

    /// A copy tagged for IP protection with an explicit chain id.
    pub fn with_ip_protection_chain_id(&self, chain_id: i32) -> ProxyChain {
        let mut chain = self.clone();
        chain.ip_protection_chain_id = Some(chain_id);
        chain
    }
}

impl fmt::Display for ProxyChain {
    /// Renders the debug string form: `[direct://]`,
    /// `[scheme://host:port, ...]`, with a trailing ` (IP Protection)` when
    /// tagged, and `INVALID PROXY CHAIN` for invalid chains.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(servers) = &self.servers else {
            return f.write_str("INVALID PROXY CHAIN");
        };
        f.write_str("[")?;
        if servers.is_empty() {
            f.write_str("direct://")?;
        } else {
            for (i, server) in servers.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                f.write_str(&server.to_uri())?;
            }
        }
        f.write_str("]")?;
        if self.is_for_ip_protection() {
            f.write_str(" (IP Protection)")?;
        }
        Ok(())
    }
}
