//! DNS resolution.

use std::{
    borrow::Cow,
    collections::HashMap,
    fmt,
    future::Future,
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
};

use crate::error::BoxError;

/// A domain name to resolve into IP addresses.
#[derive(Clone, Hash, Eq, PartialEq)]
pub struct Name {
    host: Box<str>,
}

impl Name {
    /// Creates a new [`Name`] from a string slice.
    #[inline]
    pub fn new(host: Box<str>) -> Name {
        Name { host }
    }

    /// View the hostname as a string slice.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.host
    }
}

impl From<&str> for Name {
    fn from(value: &str) -> Self {
        Name::new(value.into())
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.host, f)
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.host, f)
    }
}

/// Alias for an `Iterator` trait object over `SocketAddr`.
pub type Addrs = Box<dyn Iterator<Item = SocketAddr> + Send>;

/// Alias for the `Future` type returned by a DNS resolver.
pub type Resolving = Pin<Box<dyn Future<Output = Result<Addrs, BoxError>> + Send>>;

/// Trait for customizing DNS resolution in courier.
pub trait Resolve: Send + Sync {
    /// Performs DNS resolution on a `Name`.
    /// The return type is a future containing an iterator of `SocketAddr`.
    ///
    /// It is assumed that `resolve` is always ready to run, does not need a
    /// mutable reference to `self`, and boxes its future and iterator so it
    /// stays object-safe.
    ///
    /// A port explicitly specified in the URI overrides any port in the
    /// resolved `SocketAddr`s; otherwise port `0` is replaced by the
    /// conventional port for the scheme (80 for http, 443 for https).
    fn resolve(&self, name: Name) -> Resolving;
}

/// Trait for converting types into a shared DNS resolver (`Arc<dyn Resolve>`).
pub trait IntoResolve {
    /// Converts the implementor into an [`Arc<dyn Resolve>`].
    fn into_resolve(self) -> Arc<dyn Resolve>;
}

impl IntoResolve for Arc<dyn Resolve> {
    #[inline]
    fn into_resolve(self) -> Arc<dyn Resolve> {
        self
    }
}

impl<R> IntoResolve for R
where
    R: Resolve + 'static,
{
    #[inline]
    fn into_resolve(self) -> Arc<dyn Resolve> {
        Arc::new(self)
    }
}

/// Default resolver delegating to the system's getaddrinfo through the
/// runtime's blocking pool.
#[derive(Debug, Default, Clone)]
pub struct GaiResolver {
    _priv: (),
}

impl GaiResolver {
    /// Creates a new `GaiResolver`.
    pub fn new() -> Self {
        GaiResolver::default()
    }
}

impl Resolve for GaiResolver {
    fn resolve(&self, name: Name) -> Resolving {
        Box::pin(async move {
            // Port 0 is a placeholder; the selector patches the real port in.
            let addrs = tokio::net::lookup_host((name.as_str(), 0)).await?;
            let addrs: Addrs = Box::new(addrs.collect::<Vec<_>>().into_iter());
            Ok(addrs)
        })
    }
}

/// DNS resolver that supports hostname overrides.
///
/// Checks manual hostname-to-IP mappings before falling back to the
/// underlying resolver. Useful for testing or bypassing DNS for specific
/// domains.
pub(crate) struct DnsResolverWithOverrides {
    dns_resolver: Arc<dyn Resolve>,
    overrides: Arc<HashMap<Cow<'static, str>, Vec<SocketAddr>>>,
}

impl DnsResolverWithOverrides {
    pub(crate) fn new(
        dns_resolver: Arc<dyn Resolve>,
        overrides: HashMap<Cow<'static, str>, Vec<SocketAddr>>,
    ) -> Self {
        DnsResolverWithOverrides {
            dns_resolver,
            overrides: Arc::new(overrides),
        }
    }
}

impl Resolve for DnsResolverWithOverrides {
    fn resolve(&self, name: Name) -> Resolving {
        match self.overrides.get(name.as_str()) {
            Some(dest) => {
                let addrs: Addrs = Box::new(dest.clone().into_iter());
                Box::pin(std::future::ready(Ok(addrs)))
            }
            None => self.dns_resolver.resolve(name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn overrides_shadow_inner_resolver() {
        let fixed: SocketAddr = "10.0.0.7:8080".parse().unwrap();
        let mut overrides = HashMap::new();
        overrides.insert(Cow::Borrowed("shadowed.invalid"), vec![fixed]);

        let resolver =
            DnsResolverWithOverrides::new(Arc::new(GaiResolver::new()), overrides);
        let addrs: Vec<_> = resolver
            .resolve(Name::from("shadowed.invalid"))
            .await
            .unwrap()
            .collect();
        assert_eq!(addrs, vec![fixed]);
    }

    #[tokio::test]
    async fn gai_resolves_localhost() {
        let addrs: Vec<_> = GaiResolver::new()
            .resolve(Name::from("localhost"))
            .await
            .unwrap()
            .collect();
        assert!(!addrs.is_empty());
    }
}
