use std::{
    collections::HashMap,
    future::Future,
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    task::{Context as TaskContext, Poll},
    time::Duration,
};

use http::{Method, Uri};

use crate::{
    config::{
        ChannelPoolOptions, ChannelPoolOptionsProvider, Decompression, Http1Options,
        Http2Options, HttpVersion, NetOptions, RetryOptions, SslOptions,
    },
    context::Context,
    dns::{DnsResolverWithOverrides, GaiResolver, IntoResolve, Resolve},
    error::{Error, Result},
    filter::{FilteringExec, RequestFilter, ResponseFilter},
    interceptor::{ExpectContinueInterceptor, Interceptor, Next},
    listener::{Listener, NoopListener},
    redirect::RedirectInterceptor,
    request::{Request, RequestBuilder},
    response::Response,
    retry::RetryInterceptor,
    transceiver::{
        pipeline::Connector,
        pool::ChannelPools,
        selector::ServerSelector,
        Transceiver, TransceiverOptions,
    },
};

/// An asynchronous HTTP client with per-endpoint connection pooling.
///
/// Cheap to clone; clones share the pools, the interceptor chain, and the
/// resolver.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    chain: Vec<Arc<dyn Interceptor>>,
    transceiver: Transceiver,
}

impl Client {
    /// A `Client` with default configuration.
    ///
    /// # Panics
    ///
    /// Panics if the TLS backend cannot be initialised. Use
    /// [`Client::builder()`] to handle that failure.
    pub fn new() -> Client {
        Client::builder().build().expect("Client::new()")
    }

    /// Start configuring a `Client`.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Convenience method to make a `GET` request to a URI.
    pub fn get<U: IntoUri>(&self, uri: U) -> RequestBuilder {
        self.request(Method::GET, uri)
    }

    /// Convenience method to make a `POST` request to a URI.
    pub fn post<U: IntoUri>(&self, uri: U) -> RequestBuilder {
        self.request(Method::POST, uri)
    }

    /// Convenience method to make a `PUT` request to a URI.
    pub fn put<U: IntoUri>(&self, uri: U) -> RequestBuilder {
        self.request(Method::PUT, uri)
    }

    /// Convenience method to make a `DELETE` request to a URI.
    pub fn delete<U: IntoUri>(&self, uri: U) -> RequestBuilder {
        self.request(Method::DELETE, uri)
    }

    /// Convenience method to make a `HEAD` request to a URI.
    pub fn head<U: IntoUri>(&self, uri: U) -> RequestBuilder {
        self.request(Method::HEAD, uri)
    }

    /// Convenience method to make a `PATCH` request to a URI.
    pub fn patch<U: IntoUri>(&self, uri: U) -> RequestBuilder {
        self.request(Method::PATCH, uri)
    }

    /// Start building a request with `method` and `uri`.
    pub fn request<U: IntoUri>(&self, method: Method, uri: U) -> RequestBuilder {
        let request = uri.into_uri().map(|uri| Request::new(method, uri));
        RequestBuilder::new(self.clone(), request)
    }

    /// Dispatch a built request.
    pub fn execute(&self, request: Request) -> Pending {
        self.execute_with(request, Arc::new(NoopListener))
    }

    /// Dispatch a built request, observing its lifecycle with `listener`.
    pub fn execute_with(&self, request: Request, listener: Arc<dyn Listener>) -> Pending {
        let inner = self.inner.clone();
        let ctx = Arc::new(Context::new());
        let fut_ctx = ctx.clone();
        let fut = async move {
            let next = Next::new(&inner.chain, &inner.transceiver, &listener);
            next.proceed(request, &fut_ctx).await
        };
        Pending {
            fut: Box::pin(fut),
            ctx,
        }
    }

    /// The interceptor chain this client runs, in execution order.
    pub fn interceptors(&self) -> &[Arc<dyn Interceptor>] {
        &self.inner.chain
    }
}

impl Default for Client {
    fn default() -> Self {
        Client::new()
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("interceptors", &self.inner.chain.len())
            .finish()
    }
}

/// An in-flight request: a future resolving to the [`Response`], plus
/// access to the per-request [`Context`] (chunk writer, expect-continue
/// callback).
///
/// Dropping a `Pending` before completion cancels the request.
#[must_use = "Pending does nothing unless polled"]
pub struct Pending {
    fut: Pin<Box<dyn Future<Output = Result<Response>> + Send>>,
    ctx: Arc<Context>,
}

impl Pending {
    pub(crate) fn error(err: Error) -> Pending {
        Pending {
            fut: Box::pin(std::future::ready(Err(err))),
            ctx: Arc::new(Context::new()),
        }
    }

    /// The request's scratchpad.
    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }
}

impl Future for Pending {
    type Output = Result<Response>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        self.fut.as_mut().poll(cx)
    }
}

impl std::fmt::Debug for Pending {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pending").finish()
    }
}

/// Builds a [`Client`] from fluent configuration.
pub struct ClientBuilder {
    resolver: Arc<dyn Resolve>,
    resolver_overrides: HashMap<std::borrow::Cow<'static, str>, Vec<SocketAddr>>,
    h2_clear_text_upgrade: bool,
    connect_timeout: Duration,
    read_timeout: Duration,
    keep_alive: bool,
    version: HttpVersion,
    connection_pool_size: usize,
    connection_pool_waiting_queue_length: usize,
    use_decompress: bool,
    decompression: Decompression,
    expect_continue_enabled: bool,
    uri_encode_enabled: bool,
    channel_pool_options_provider: Option<ChannelPoolOptionsProvider>,
    net_options: NetOptions,
    http1_options: Http1Options,
    http2_options: Http2Options,
    retry_options: Option<RetryOptions>,
    max_redirects: usize,
    max_content_length: Option<u64>,
    ssl_options: SslOptions,
    request_filters: Vec<Arc<dyn RequestFilter>>,
    response_filters: Vec<Arc<dyn ResponseFilter>>,
    user_interceptors: Vec<Arc<dyn Interceptor>>,
    chain: Vec<Arc<dyn Interceptor>>,
}

impl ClientBuilder {
    /// A builder with the default configuration.
    pub fn new() -> ClientBuilder {
        let mut builder = ClientBuilder {
            resolver: Arc::new(GaiResolver::new()),
            resolver_overrides: HashMap::new(),
            h2_clear_text_upgrade: false,
            connect_timeout: Duration::from_secs(3),
            read_timeout: Duration::from_secs(6),
            keep_alive: true,
            version: HttpVersion::Http11,
            connection_pool_size: 512,
            connection_pool_waiting_queue_length: 256,
            use_decompress: false,
            decompression: Decompression::GzipDeflate,
            expect_continue_enabled: false,
            uri_encode_enabled: false,
            channel_pool_options_provider: None,
            net_options: NetOptions::default(),
            http1_options: Http1Options::default(),
            http2_options: Http2Options::default(),
            retry_options: Some(RetryOptions::default()),
            max_redirects: 5,
            max_content_length: None,
            ssl_options: SslOptions::default(),
            request_filters: Vec::new(),
            response_filters: Vec::new(),
            user_interceptors: Vec::new(),
            chain: Vec::new(),
        };
        builder.rebuild_chain();
        builder
    }

    /// Use a custom DNS resolver. Shared by identity across
    /// [`copy()`](ClientBuilder::copy)-derived builders.
    pub fn resolver<R: IntoResolve>(mut self, resolver: R) -> ClientBuilder {
        self.resolver = resolver.into_resolve();
        self
    }

    /// Map a hostname to fixed addresses, bypassing DNS.
    pub fn resolve_to(mut self, host: &'static str, addrs: Vec<SocketAddr>) -> ClientBuilder {
        self.resolver_overrides
            .insert(std::borrow::Cow::Borrowed(host), addrs);
        self
    }

    /// Speak HTTP/2 over cleartext `http` endpoints with prior knowledge
    /// (the client preface goes straight onto the socket). Only meaningful
    /// together with [`version(Http2)`](ClientBuilder::version).
    pub fn h2_clear_text_upgrade(mut self, enabled: bool) -> ClientBuilder {
        self.h2_clear_text_upgrade = enabled;
        self
    }

    /// Bound TCP connect (and the h2 SETTINGS exchange).
    pub fn connect_timeout(mut self, timeout: Duration) -> ClientBuilder {
        self.connect_timeout = timeout;
        self
    }

    /// Time allowed between write completion and the end of the response.
    pub fn read_timeout(mut self, timeout: Duration) -> ClientBuilder {
        self.read_timeout = timeout;
        self
    }

    /// Ask HTTP/1 servers to keep connections open for reuse.
    pub fn keep_alive(mut self, enabled: bool) -> ClientBuilder {
        self.keep_alive = enabled;
        self
    }

    /// The protocol version to negotiate.
    pub fn version(mut self, version: HttpVersion) -> ClientBuilder {
        self.version = version;
        self
    }

    /// Maximum connections per endpoint.
    pub fn connection_pool_size(mut self, size: usize) -> ClientBuilder {
        self.connection_pool_size = size;
        self
    }

    /// Maximum acquirers queued per endpoint when the pool is full.
    pub fn connection_pool_waiting_queue_length(mut self, len: usize) -> ClientBuilder {
        self.connection_pool_waiting_queue_length = len;
        self
    }

    /// Transparently decode compressed response bodies.
    pub fn use_decompress(mut self, enabled: bool) -> ClientBuilder {
        self.use_decompress = enabled;
        self
    }

    /// Which codings to advertise and decode when decompression is on.
    pub fn decompression(mut self, decompression: Decompression) -> ClientBuilder {
        self.decompression = decompression;
        self
    }

    /// Send bodies with `Expect: 100-continue` semantics by default.
    pub fn expect_continue_enabled(mut self, enabled: bool) -> ClientBuilder {
        self.expect_continue_enabled = enabled;
        self.rebuild_chain();
        self
    }

    /// Percent-encode request targets by default.
    pub fn uri_encode_enabled(mut self, enabled: bool) -> ClientBuilder {
        self.uri_encode_enabled = enabled;
        self
    }

    /// Per-endpoint pool sizing overrides. Shared by identity across
    /// [`copy()`](ClientBuilder::copy)-derived builders.
    pub fn channel_pool_options_provider(
        mut self,
        provider: ChannelPoolOptionsProvider,
    ) -> ClientBuilder {
        self.channel_pool_options_provider = Some(provider);
        self
    }

    /// Socket options for new connections.
    pub fn net_options(mut self, options: NetOptions) -> ClientBuilder {
        self.net_options = options;
        self
    }

    /// HTTP/1-specific knobs.
    pub fn http1_options(mut self, options: Http1Options) -> ClientBuilder {
        self.http1_options = options;
        self
    }

    /// HTTP/2-specific knobs.
    pub fn http2_options(mut self, options: Http2Options) -> ClientBuilder {
        self.http2_options = options;
        self
    }

    /// Configure retry behaviour; `None` removes the retry interceptor
    /// from the chain entirely.
    pub fn retry_options(mut self, options: Option<RetryOptions>) -> ClientBuilder {
        self.retry_options = options;
        self.rebuild_chain();
        self
    }

    /// Redirect hops to follow before giving up.
    pub fn max_redirects(mut self, max: usize) -> ClientBuilder {
        self.max_redirects = max;
        self.rebuild_chain();
        self
    }

    /// Fail responses whose aggregated body exceeds `max` bytes.
    pub fn max_content_length(mut self, max: u64) -> ClientBuilder {
        self.max_content_length = Some(max);
        self
    }

    /// TLS options for `https` endpoints.
    pub fn ssl_options(mut self, options: SslOptions) -> ClientBuilder {
        self.ssl_options = options;
        self
    }

    /// Register a request filter. Replaces the `Filtering` slot of the
    /// chain with a fresh instance.
    pub fn add_request_filter<F: RequestFilter>(mut self, filter: F) -> ClientBuilder {
        self.request_filters.push(Arc::new(filter));
        self.rebuild_chain();
        self
    }

    /// Register a response filter. Replaces the `Filtering` slot of the
    /// chain with a fresh instance.
    pub fn add_response_filter<F: ResponseFilter>(mut self, filter: F) -> ClientBuilder {
        self.response_filters.push(Arc::new(filter));
        self.rebuild_chain();
        self
    }

    /// Append a custom interceptor after the built-in chain.
    pub fn add_interceptor<I: Interceptor>(mut self, interceptor: I) -> ClientBuilder {
        self.user_interceptors.push(Arc::new(interceptor));
        self.rebuild_chain();
        self
    }

    /// The interceptor chain as currently configured.
    pub fn interceptors(&self) -> &[Arc<dyn Interceptor>] {
        &self.chain
    }

    /// Deep-copy this builder. Option structs are copied by value, while
    /// the resolver and the pool-options provider are shared by identity.
    pub fn copy(&self) -> ClientBuilder {
        ClientBuilder {
            resolver: self.resolver.clone(),
            resolver_overrides: self.resolver_overrides.clone(),
            h2_clear_text_upgrade: self.h2_clear_text_upgrade,
            connect_timeout: self.connect_timeout,
            read_timeout: self.read_timeout,
            keep_alive: self.keep_alive,
            version: self.version,
            connection_pool_size: self.connection_pool_size,
            connection_pool_waiting_queue_length: self.connection_pool_waiting_queue_length,
            use_decompress: self.use_decompress,
            decompression: self.decompression,
            expect_continue_enabled: self.expect_continue_enabled,
            uri_encode_enabled: self.uri_encode_enabled,
            channel_pool_options_provider: self.channel_pool_options_provider.clone(),
            net_options: self.net_options.clone(),
            http1_options: self.http1_options.clone(),
            http2_options: self.http2_options.clone(),
            retry_options: self.retry_options.clone(),
            max_redirects: self.max_redirects,
            max_content_length: self.max_content_length,
            ssl_options: self.ssl_options.clone(),
            request_filters: self.request_filters.clone(),
            response_filters: self.response_filters.clone(),
            user_interceptors: self.user_interceptors.clone(),
            chain: self.chain.clone(),
        }
    }

    /// Recompute the chain: `[Retry, Redirect, Filtering, ExpectContinue]`
    /// (Retry omitted when disabled), then user interceptors.
    fn rebuild_chain(&mut self) {
        let mut chain: Vec<Arc<dyn Interceptor>> = Vec::with_capacity(4);
        if let Some(retry) = &self.retry_options {
            chain.push(Arc::new(RetryInterceptor::new(retry.clone())));
        }
        chain.push(Arc::new(RedirectInterceptor::new(self.max_redirects)));
        chain.push(Arc::new(FilteringExec::new(
            self.request_filters.clone(),
            self.response_filters.clone(),
        )));
        chain.push(Arc::new(ExpectContinueInterceptor::new(
            self.expect_continue_enabled,
        )));
        chain.extend(self.user_interceptors.iter().cloned());
        self.chain = chain;
    }

    /// Build the configured [`Client`].
    pub fn build(self) -> Result<Client> {
        let connector = Arc::new(Connector::new(
            self.connect_timeout,
            self.net_options,
            self.http1_options,
            self.http2_options,
            self.ssl_options,
            self.version,
            self.h2_clear_text_upgrade,
        )?);

        let resolver: Arc<dyn Resolve> = if self.resolver_overrides.is_empty() {
            self.resolver
        } else {
            Arc::new(DnsResolverWithOverrides::new(
                self.resolver,
                self.resolver_overrides,
            ))
        };

        let pools = ChannelPools::new(
            connector,
            ChannelPoolOptions::new(
                self.connection_pool_size,
                self.connection_pool_waiting_queue_length,
            ),
            self.channel_pool_options_provider,
            self.version == HttpVersion::Http2,
        );

        let transceiver = Transceiver::new(
            ServerSelector::new(resolver),
            pools,
            TransceiverOptions {
                keep_alive: self.keep_alive,
                read_timeout: self.read_timeout,
                max_content_length: self.max_content_length,
                use_decompress: self.use_decompress,
                decompression: self.decompression,
                uri_encode: self.uri_encode_enabled,
            },
        );

        Ok(Client {
            inner: Arc::new(ClientInner {
                chain: self.chain,
                transceiver,
            }),
        })
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        ClientBuilder::new()
    }
}

impl std::fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("version", &self.version)
            .field("connect_timeout", &self.connect_timeout)
            .field("read_timeout", &self.read_timeout)
            .field("interceptors", &self.chain.len())
            .finish()
    }
}

/// Conversion into a validated `http::Uri`.
pub trait IntoUri: Sealed {
    /// Try to turn the value into a `Uri` with an `http`/`https` scheme and
    /// a host.
    fn into_uri(self) -> Result<Uri>;
}

impl IntoUri for Uri {
    fn into_uri(self) -> Result<Uri> {
        validate_uri(self)
    }
}

impl IntoUri for &str {
    fn into_uri(self) -> Result<Uri> {
        match self.parse::<Uri>() {
            Ok(uri) => validate_uri(uri),
            Err(e) => Err(Error::builder(e)),
        }
    }
}

impl IntoUri for String {
    fn into_uri(self) -> Result<Uri> {
        self.as_str().into_uri()
    }
}

impl IntoUri for &String {
    fn into_uri(self) -> Result<Uri> {
        self.as_str().into_uri()
    }
}

fn validate_uri(uri: Uri) -> Result<Uri> {
    match uri.scheme_str() {
        Some("http") | Some("https") => {}
        _ => return Err(Error::builder("URI scheme must be http or https").with_uri(uri)),
    }
    if uri.host().is_none() {
        return Err(Error::builder("URI is missing a host").with_uri(uri));
    }
    Ok(uri)
}

mod sealed {
    pub trait Sealed {}
    impl Sealed for http::Uri {}
    impl Sealed for &str {}
    impl Sealed for String {}
    impl Sealed for &String {}
}
use sealed::Sealed;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_chain_has_four_interceptors() {
        let builder = ClientBuilder::new();
        assert_eq!(builder.interceptors().len(), 4);
    }

    #[test]
    fn disabling_retry_shortens_chain() {
        let builder = ClientBuilder::new().retry_options(None);
        assert_eq!(builder.interceptors().len(), 3);
    }

    #[test]
    fn filter_registration_swaps_filtering_slot_identity() {
        struct Nop;
        impl RequestFilter for Nop {
            fn on_request(
                &self,
                _: &mut crate::request::Request,
                _: &crate::context::Context,
            ) -> Result<()> {
                Ok(())
            }
        }

        let builder = ClientBuilder::new();
        // Filtering sits after Retry and Redirect
        let before = builder.interceptors()[2].clone();
        let builder = builder.add_request_filter(Nop);
        assert_eq!(builder.interceptors().len(), 4);
        let after = builder.interceptors()[2].clone();
        assert!(!Arc::ptr_eq(&before, &after));
    }

    #[test]
    fn copy_shares_singletons_and_duplicates_options() {
        let resolver: Arc<dyn Resolve> = Arc::new(GaiResolver::new());
        let provider: ChannelPoolOptionsProvider = Arc::new(|_| None);
        let builder = ClientBuilder::new()
            .resolver(resolver.clone())
            .channel_pool_options_provider(provider.clone())
            .connect_timeout(Duration::from_secs(9))
            .max_redirects(7);

        let copied = builder.copy();
        assert_eq!(copied.connect_timeout, Duration::from_secs(9));
        assert_eq!(copied.max_redirects, 7);
        assert!(Arc::ptr_eq(&copied.resolver, &builder.resolver));
        assert!(Arc::ptr_eq(
            copied.channel_pool_options_provider.as_ref().unwrap(),
            builder.channel_pool_options_provider.as_ref().unwrap(),
        ));
    }

    #[test]
    fn rejects_non_http_schemes() {
        assert!("ftp://example.com/".into_uri().is_err());
        assert!("http://example.com/ok".into_uri().is_ok());
    }
}
