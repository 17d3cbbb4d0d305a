//! Tunnel layer planning
//!
//! A CONNECT tunnel through a proxy chain is planned up front as a flat
//! list of layers, innermost (first physical hop) first. Each layer names
//! the proxy spoken to and the endpoint that hop is asked to CONNECT to:
//! the next hop's endpoint, or the origin at the last hop. The connect job
//! then walks the list iteratively; no recursion, no I/O here.

use crate::error::{NetError, Result};
use crate::proxy::{HostPortPair, ProxyChain, ProxyServer};

#[derive(Debug, Clone)]
pub struct TunnelLayer {
    pub hop_index: usize,
    /// The proxy this layer speaks HTTP to.
    pub server: ProxyServer,
    /// The endpoint named in this layer's CONNECT request.
    pub connect_target: HostPortPair,
}

/// Plan the layer list for tunneling to `origin` through `chain`. The
/// direct chain yields an empty plan. Chains with a non-HTTP hop cannot be
/// tunneled by this job.
pub fn build_tunnel_layers(chain: &ProxyChain, origin: &HostPortPair) -> Result<Vec<TunnelLayer>> {
    if !chain.is_valid() {
        return Err(NetError::NoSupportedProxies);
    }
    let servers = chain.servers();
    if servers.iter().any(|s| !s.is_http_like()) {
        return Err(NetError::NoSupportedProxies);
    }
    let mut layers = Vec::with_capacity(servers.len());
    for (hop_index, server) in servers.iter().enumerate() {
        let connect_target = match servers.get(hop_index + 1) {
            Some(next) => next.host_port_pair().clone(),
            None => origin.clone(),
        };
        layers.push(TunnelLayer {
            hop_index,
            server: server.clone(),
            connect_target,
        });
    }
    Ok(layers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::ProxyScheme;

    fn origin() -> HostPortPair {
        HostPortPair::new("www.example.org", 443)
    }

    #[test]
    fn single_hop_targets_origin() {
        let chain = ProxyChain::from_uri("https://proxy:70", ProxyScheme::Http);
        let layers = build_tunnel_layers(&chain, &origin()).unwrap();
        assert_eq!(layers.len(), 1);
        assert_eq!(layers[0].server.host_port_pair().to_string_form(), "proxy:70");
        assert_eq!(layers[0].connect_target, origin());
    }

    #[test]
    fn nested_layers_target_the_next_hop() {
        let chain = ProxyChain::new(vec![
            ProxyServer::from_uri("https://a:70", ProxyScheme::Http),
            ProxyServer::from_uri("https://b:71", ProxyScheme::Http),
            ProxyServer::from_uri("https://c:72", ProxyScheme::Http),
        ]);
        let layers = build_tunnel_layers(&chain, &origin()).unwrap();
        assert_eq!(layers.len(), 3);
        assert_eq!(layers[0].connect_target.to_string_form(), "b:71");
        assert_eq!(layers[1].connect_target.to_string_form(), "c:72");
        assert_eq!(layers[2].connect_target, origin());
        assert_eq!(layers[2].hop_index, 2);
    }

    #[test]
    fn direct_plans_no_layers() {
        let layers = build_tunnel_layers(&ProxyChain::direct(), &origin()).unwrap();
        assert!(layers.is_empty());
    }

    #[test]
    fn non_http_hops_are_rejected() {
        let chain = ProxyChain::from_uri("socks5://s:1080", ProxyScheme::Http);
        assert_eq!(
            build_tunnel_layers(&chain, &origin()).unwrap_err(),
            NetError::NoSupportedProxies
        );
    }
}
