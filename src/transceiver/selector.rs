//! Destination selection.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use http::Uri;

use super::pool::Endpoint;
use crate::{
    dns::{Name, Resolve},
    error::{Error, Kind, Result},
};

/// Picks a destination address for a request, delegating hostname lookup to
/// the configured resolver. Fails with an unresolved-host error before any
/// pool work happens.
pub(crate) struct ServerSelector {
    resolver: Arc<dyn Resolve>,
}

impl ServerSelector {
    pub(crate) fn new(resolver: Arc<dyn Resolve>) -> ServerSelector {
        ServerSelector { resolver }
    }

    pub(crate) async fn select(&self, uri: &Uri, endpoint: &Endpoint) -> Result<SocketAddr> {
        // literal addresses skip the resolver entirely
        if let Ok(ip) = endpoint.host().parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, endpoint.port()));
        }

        let addrs = self
            .resolver
            .resolve(Name::from(endpoint.host()))
            .await
            .map_err(|e| Error::new(Kind::UnresolvedHost, Some(e)).with_uri(uri.clone()))?;

        let mut addr = addrs
            .into_iter()
            .next()
            .ok_or_else(|| Error::unresolved_host(uri.clone()))?;
        if addr.port() == 0 {
            addr.set_port(endpoint.port());
        }
        Ok(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::GaiResolver;

    #[tokio::test]
    async fn literal_ip_bypasses_resolver() {
        let selector = ServerSelector::new(Arc::new(GaiResolver::new()));
        let uri: Uri = "http://127.0.0.1:8080/abc".parse().unwrap();
        let endpoint = Endpoint::from_uri(&uri).unwrap();
        let addr = selector.select(&uri, &endpoint).await.unwrap();
        assert_eq!(addr, "127.0.0.1:8080".parse().unwrap());
    }

    #[tokio::test]
    async fn unresolvable_host_fails_before_pooling() {
        let selector = ServerSelector::new(Arc::new(GaiResolver::new()));
        let uri: Uri = "http://definitely-not-a-host.invalid/".parse().unwrap();
        let endpoint = Endpoint::from_uri(&uri).unwrap();
        let err = selector.select(&uri, &endpoint).await.unwrap_err();
        assert!(err.is_unresolved_host());
    }
}
