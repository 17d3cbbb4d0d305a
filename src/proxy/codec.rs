//! Proxy string codecs
//!
//! Bidirectional conversion between [`ProxyServer`]/[`ProxyChain`] and the
//! two textual forms: PAC result elements (`PROXY host:port`, `DIRECT`, ...)
//! and the URI-like `scheme://host:port` form. Parsing never panics; every
//! malformed input maps to the Invalid sentinel.

use crate::proxy::chain::ProxyChain;
use crate::proxy::server::{ProxyScheme, ProxyServer};

/// Split `host[:port]`, keeping bracketed IPv6 literals intact. Returns the
/// host part and the optional parsed port; `None` for a malformed port.
fn split_host_port(input: &str) -> Option<(&str, Option<u16>)> {
    if input.is_empty() {
        return None;
    }
    if input.starts_with('[') {
        // Bracketed IPv6 literal, optionally followed by :port.
        let close = input.find(']')?;
        let host = &input[..=close];
        let rest = &input[close + 1..];
        if rest.is_empty() {
            return Some((host, None));
        }
        let port = rest.strip_prefix(':')?;
        return Some((host, Some(port.parse().ok()?)));
    }
    match input.rfind(':') {
        Some(idx) => {
            let host = &input[..idx];
            let port = &input[idx + 1..];
            if host.is_empty() || host.contains(':') {
                // Unbracketed IPv6 literals are rejected.
                return None;
            }
            Some((host, Some(port.parse().ok()?)))
        }
        None => Some((input, None)),
    }
}

fn scheme_from_pac_keyword(keyword: &str) -> Option<ProxyScheme> {
    if keyword.eq_ignore_ascii_case("DIRECT") {
        Some(ProxyScheme::Direct)
    } else if keyword.eq_ignore_ascii_case("PROXY") {
        Some(ProxyScheme::Http)
    } else if keyword.eq_ignore_ascii_case("HTTPS") {
        Some(ProxyScheme::Https)
    } else if keyword.eq_ignore_ascii_case("QUIC") {
        Some(ProxyScheme::Quic)
    } else if keyword.eq_ignore_ascii_case("SOCKS") || keyword.eq_ignore_ascii_case("SOCKS4") {
        Some(ProxyScheme::Socks4)
    } else if keyword.eq_ignore_ascii_case("SOCKS5") {
        Some(ProxyScheme::Socks5)
    } else {
        None
    }
}

fn scheme_from_uri_keyword(keyword: &str) -> Option<ProxyScheme> {
    match keyword.to_ascii_lowercase().as_str() {
        "http" => Some(ProxyScheme::Http),
        "https" => Some(ProxyScheme::Https),
        "quic" => Some(ProxyScheme::Quic),
        "socks4" => Some(ProxyScheme::Socks4),
        // Bare "socks" means SOCKS5 in the URI form.
        "socks" | "socks5" => Some(ProxyScheme::Socks5),
        "direct" => Some(ProxyScheme::Direct),
        _ => None,
    }
}

impl ProxyServer {
    /// Parse one PAC result element, e.g. `"PROXY foopy:80"` or `"DIRECT"`.
    /// The scheme keyword is case-insensitive; leading/trailing space and tab
    /// are ignored; the port defaults per scheme when omitted.
    pub fn from_pac_string(input: &str) -> ProxyServer {
        let trimmed = input.trim_matches([' ', '\t']);
        if trimmed.is_empty() {
            return ProxyServer::invalid();
        }
        let (keyword, rest) = match trimmed.find([' ', '\t']) {
            Some(idx) => (&trimmed[..idx], trimmed[idx + 1..].trim_matches([' ', '\t'])),
            None => (trimmed, ""),
        };
        let Some(scheme) = scheme_from_pac_keyword(keyword) else {
            return ProxyServer::invalid();
        };
        if scheme == ProxyScheme::Direct {
            return if rest.is_empty() {
                ProxyServer::direct()
            } else {
                ProxyServer::invalid()
            };
        }
        let Some((host, port)) = split_host_port(rest) else {
            return ProxyServer::invalid();
        };
        ProxyServer::from_scheme_host_port(scheme, host, port)
    }

    /// Serialize to a PAC result element.
    pub fn to_pac_string(&self) -> String {
        match self.scheme() {
            ProxyScheme::Invalid => "INVALID".to_string(),
            ProxyScheme::Direct => "DIRECT".to_string(),
            ProxyScheme::Http => format!("PROXY {}", self.host_port_pair()),
            ProxyScheme::Https => format!("HTTPS {}", self.host_port_pair()),
            ProxyScheme::Quic => format!("QUIC {}", self.host_port_pair()),
            ProxyScheme::Socks4 => format!("SOCKS {}", self.host_port_pair()),
            ProxyScheme::Socks5 => format!("SOCKS5 {}", self.host_port_pair()),
        }
    }

    /// Parse the URI form `[scheme://]host[:port]`. When the scheme prefix is
    /// absent, `default_scheme` is assumed. `direct://` takes no host;
    /// trailing paths make the input invalid.
    pub fn from_uri(input: &str, default_scheme: ProxyScheme) -> ProxyServer {
        let trimmed = input.trim_matches([' ', '\t']);
        let (scheme, rest) = match trimmed.find("://") {
            Some(idx) => {
                let Some(scheme) = scheme_from_uri_keyword(&trimmed[..idx]) else {
                    return ProxyServer::invalid();
                };
                (scheme, &trimmed[idx + 3..])
            }
            None => (default_scheme, trimmed),
        };
        match scheme {
            ProxyScheme::Invalid => ProxyServer::invalid(),
            ProxyScheme::Direct => {
                if rest.is_empty() {
                    ProxyServer::direct()
                } else {
                    ProxyServer::invalid()
                }
            }
            _ => {
                if rest.contains('/') {
                    return ProxyServer::invalid();
                }
                let Some((host, port)) = split_host_port(rest) else {
                    return ProxyServer::invalid();
                };
                ProxyServer::from_scheme_host_port(scheme, host, port)
            }
        }
    }

    /// Serialize to the URI form with an explicit scheme and port.
    pub fn to_uri(&self) -> String {
        match self.scheme() {
            ProxyScheme::Invalid => "invalid://".to_string(),
            ProxyScheme::Direct => "direct://".to_string(),
            scheme => format!("{}://{}", scheme.uri_keyword(), self.host_port_pair()),
        }
    }
}

impl ProxyChain {
    /// Parse a single-hop chain from the URI form.
    pub fn from_uri(input: &str, default_scheme: ProxyScheme) -> ProxyChain {
        ProxyChain::from_server(ProxyServer::from_uri(input, default_scheme))
    }

    /// Serialize the hop list as semicolon-joined PAC elements. A direct
    /// chain renders as `DIRECT`.
    pub fn to_pac_string(&self) -> String {
        if !self.is_valid() {
            return "INVALID".to_string();
        }
        if self.is_direct() {
            return "DIRECT".to_string();
        }
        self.servers()
            .iter()
            .map(ProxyServer::to_pac_string)
            .collect::<Vec<_>>()
            .join(";")
    }
}
