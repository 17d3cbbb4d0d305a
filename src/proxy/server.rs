//! Single proxy hop representation
//!
//! [`ProxyServer`] is an immutable value pairing a scheme with an optional
//! canonicalized host:port. Hostnames are canonicalized at construction with
//! the same rules a URL parser applies (case folding, IDNA, IPv4 octal/hex
//! normalization, bracketed IPv6 literals); malformed input yields an
//! `Invalid` server rather than an error.

use std::fmt;

use url::{Host, Url};

/// Proxy scheme for one hop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProxyScheme {
    Invalid,
    Direct,
    Http,
    Https,
    Quic,
    Socks4,
    Socks5,
}

impl ProxyScheme {
    /// Default port used when a parse omits the port.
    pub fn default_port(self) -> Option<u16> {
        match self {
            ProxyScheme::Http => Some(80),
            ProxyScheme::Https | ProxyScheme::Quic => Some(443),
            ProxyScheme::Socks4 | ProxyScheme::Socks5 => Some(1080),
            ProxyScheme::Invalid | ProxyScheme::Direct => None,
        }
    }

    /// True for schemes whose lower layer is TLS (or QUIC's built-in crypto).
    pub fn is_secure(self) -> bool {
        matches!(self, ProxyScheme::Https | ProxyScheme::Quic)
    }

    /// True for HTTP and HTTPS, the schemes that speak HTTP to the proxy.
    pub fn is_http_like(self) -> bool {
        matches!(self, ProxyScheme::Http | ProxyScheme::Https)
    }

    /// Scheme keyword as used in the URI form.
    pub fn uri_keyword(self) -> &'static str {
        match self {
            ProxyScheme::Invalid => "invalid",
            ProxyScheme::Direct => "direct",
            ProxyScheme::Http => "http",
            ProxyScheme::Https => "https",
            ProxyScheme::Quic => "quic",
            ProxyScheme::Socks4 => "socks4",
            ProxyScheme::Socks5 => "socks5",
        }
    }
}

/// A canonicalized host plus port.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HostPortPair {
    host: String,
    port: u16,
}

impl HostPortPair {
    /// Construct without canonicalization. The host is assumed to already be
    /// in canonical form (e.g. it came out of a parsed URL).
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port`, with IPv6 literals kept bracketed.
    pub fn to_string_form(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for HostPortPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Canonicalize a hostname or IP literal the way a URL parser would.
///
/// Returns `None` when the input is empty, contains components other than a
/// host (userinfo, port, path), or fails IDNA/IP-literal canonicalization.
pub fn canonicalize_host(host: &str) -> Option<String> {
    if host.is_empty() {
        return None;
    }
    // `Url::port()` reports nothing for a scheme-default port, so a smuggled
    // port would vanish in the parse below. A colon is only legal inside a
    // complete IPv6 bracket pair.
    let bracketed = host.starts_with('[') && host.ends_with(']');
    if !bracketed && host.contains(':') {
        return None;
    }
    // Leverage the url parser for IDNA, case folding, and IP literal
    // normalization. Anything beyond a bare host is rejected.
    let url = Url::parse(&format!("http://{host}/")).ok()?;
    if url.port().is_some()
        || url.path() != "/"
        || !url.username().is_empty()
        || url.password().is_some()
        || url.query().is_some()
        || url.fragment().is_some()
    {
        return None;
    }
    match url.host()? {
        Host::Domain(d) => Some(d.to_string()),
        Host::Ipv4(ip) => Some(ip.to_string()),
        Host::Ipv6(ip) => Some(format!("[{ip}]")),
    }
}

/// One proxy hop: a scheme plus, for non-direct schemes, a host:port.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProxyServer {
    scheme: ProxyScheme,
    host_port: Option<HostPortPair>,
}

impl ProxyServer {
    /// A server representing a direct (proxyless) connection.
    pub fn direct() -> Self {
        Self {
            scheme: ProxyScheme::Direct,
            host_port: None,
        }
    }

    /// The invalid sentinel, produced by all failed parses.
    pub fn invalid() -> Self {
        Self {
            scheme: ProxyScheme::Invalid,
            host_port: None,
        }
    }

    /// Build from an explicit scheme, host, and optional port. The host is
    /// canonicalized; the port defaults per scheme when omitted. Malformed
    /// input yields [`ProxyServer::invalid`].
    pub fn from_scheme_host_port(scheme: ProxyScheme, host: &str, port: Option<u16>) -> Self {
        match scheme {
            ProxyScheme::Direct => ProxyServer::direct(),
            ProxyScheme::Invalid => ProxyServer::invalid(),
            _ => {
                let Some(canonical) = canonicalize_host(host) else {
                    return ProxyServer::invalid();
                };
                let Some(port) = port.or_else(|| scheme.default_port()) else {
                    return ProxyServer::invalid();
                };
                ProxyServer {
                    scheme,
                    host_port: Some(HostPortPair::new(canonical, port)),
                }
            }
        }
    }

    pub fn scheme(&self) -> ProxyScheme {
        self.scheme
    }

    pub fn is_valid(&self) -> bool {
        self.scheme != ProxyScheme::Invalid
    }

    pub fn is_direct(&self) -> bool {
        self.scheme == ProxyScheme::Direct
    }

    pub fn is_secure(&self) -> bool {
        self.scheme.is_secure()
    }

    pub fn is_http_like(&self) -> bool {
        self.scheme.is_http_like()
    }

    /// Host:port for schemes that carry one.
    ///
    /// # Panics
    ///
    /// Panics for Direct and Invalid servers, which carry no endpoint.
    pub fn host_port_pair(&self) -> &HostPortPair {
        self.host_port
            .as_ref()
            .unwrap_or_else(|| panic!("{:?} proxy has no host:port", self.scheme))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_ports() {
        assert_eq!(ProxyScheme::Http.default_port(), Some(80));
        assert_eq!(ProxyScheme::Https.default_port(), Some(443));
        assert_eq!(ProxyScheme::Quic.default_port(), Some(443));
        assert_eq!(ProxyScheme::Socks4.default_port(), Some(1080));
        assert_eq!(ProxyScheme::Socks5.default_port(), Some(1080));
        assert_eq!(ProxyScheme::Direct.default_port(), None);
        assert_eq!(ProxyScheme::Invalid.default_port(), None);
    }

    #[test]
    fn host_is_case_folded() {
        let server = ProxyServer::from_scheme_host_port(ProxyScheme::Http, "FoOpY", Some(80));
        assert!(server.is_valid());
        assert_eq!(server.host_port_pair().host(), "foopy");
        assert_eq!(server.host_port_pair().port(), 80);
    }

    #[test]
    fn idna_and_ip_literals_are_canonicalized() {
        let server = ProxyServer::from_scheme_host_port(ProxyScheme::Http, "bücher.example", None);
        assert_eq!(server.host_port_pair().host(), "xn--bcher-kva.example");

        // Octal/hex IPv4 forms normalize to dotted decimal.
        let server = ProxyServer::from_scheme_host_port(ProxyScheme::Http, "0x7f.0.0.1", None);
        assert_eq!(server.host_port_pair().host(), "127.0.0.1");

        let server = ProxyServer::from_scheme_host_port(ProxyScheme::Http, "[::1]", None);
        assert_eq!(server.host_port_pair().host(), "[::1]");
    }

    #[test]
    fn canonicalization_is_idempotent() {
        for raw in ["FoOpY", "bücher.example", "0x7f.0.0.1", "[::1]"] {
            let once = canonicalize_host(raw).unwrap();
            let twice = canonicalize_host(&once).unwrap();
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn malformed_hosts_yield_invalid() {
        for bad in [
            "",
            "foo/bar",
            "user@host",
            "::1",
            "host:80",
            "host:443",
            "[::1]:80",
            "a b",
        ] {
            let server = ProxyServer::from_scheme_host_port(ProxyScheme::Http, bad, Some(80));
            assert!(!server.is_valid(), "expected {bad:?} to be rejected");
        }
    }

    #[test]
    fn ordering_is_lexicographic_on_scheme_host_port() {
        let a = ProxyServer::from_scheme_host_port(ProxyScheme::Http, "aaa", Some(80));
        let b = ProxyServer::from_scheme_host_port(ProxyScheme::Http, "bbb", Some(80));
        let c = ProxyServer::from_scheme_host_port(ProxyScheme::Http, "bbb", Some(81));
        let d = ProxyServer::from_scheme_host_port(ProxyScheme::Https, "aaa", Some(80));
        assert!(a < b && b < c && c < d);
    }
}
