//! Option structs consumed by the [`ClientBuilder`](crate::ClientBuilder).
//!
//! Each group of related knobs lives in its own plain struct with a small
//! fluent builder, so `ClientBuilder::copy()` can deep-copy them while
//! sharing true singletons (resolver, pool-options provider) by reference.

use std::{fmt, sync::Arc, time::Duration};

/// HTTP protocol version the client is willing to speak.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HttpVersion {
    /// HTTP/1.0, one request per connection unless keep-alive is negotiated.
    Http10,
    /// HTTP/1.1 (the default).
    Http11,
    /// HTTP/2 over TLS (ALPN) or cleartext prior-knowledge.
    Http2,
}

/// Content encodings the client can transparently decode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decompression {
    /// `Accept-Encoding: gzip`
    Gzip,
    /// `Accept-Encoding: deflate`
    Deflate,
    /// `Accept-Encoding: gzip, deflate`
    GzipDeflate,
}

impl Decompression {
    pub(crate) fn accept_encoding(&self) -> &'static str {
        match self {
            Decompression::Gzip => "gzip",
            Decompression::Deflate => "deflate",
            Decompression::GzipDeflate => "gzip, deflate",
        }
    }
}

/// Socket-level options applied to every new connection.
#[derive(Clone, Debug, Default)]
pub struct NetOptions {
    pub(crate) no_delay: bool,
    pub(crate) so_keepalive: Option<Duration>,
    pub(crate) local_address: Option<std::net::IpAddr>,
}

impl NetOptions {
    /// Start building a set of socket options.
    pub fn builder() -> NetOptionsBuilder {
        NetOptionsBuilder {
            options: NetOptions::default(),
        }
    }
}

/// Builder for [`NetOptions`].
#[must_use]
#[derive(Debug)]
pub struct NetOptionsBuilder {
    options: NetOptions,
}

impl NetOptionsBuilder {
    /// Set `TCP_NODELAY` on new sockets.
    pub fn no_delay(mut self, enabled: bool) -> Self {
        self.options.no_delay = enabled;
        self
    }

    /// Enable `SO_KEEPALIVE` with the given probe interval.
    pub fn so_keepalive(mut self, interval: Duration) -> Self {
        self.options.so_keepalive = Some(interval);
        self
    }

    /// Bind outgoing sockets to a local address.
    pub fn local_address(mut self, addr: std::net::IpAddr) -> Self {
        self.options.local_address = Some(addr);
        self
    }

    /// Finish building.
    pub fn build(self) -> NetOptions {
        self.options
    }
}

/// Knobs specific to HTTP/1.x connections.
#[derive(Clone, Debug)]
pub struct Http1Options {
    pub(crate) max_initial_line_length: usize,
    pub(crate) max_header_size: usize,
}

impl Default for Http1Options {
    fn default() -> Self {
        Http1Options {
            max_initial_line_length: 4096,
            max_header_size: 8192,
        }
    }
}

impl Http1Options {
    /// Start building HTTP/1 options.
    pub fn builder() -> Http1OptionsBuilder {
        Http1OptionsBuilder {
            options: Http1Options::default(),
        }
    }
}

/// Builder for [`Http1Options`].
#[must_use]
#[derive(Debug)]
pub struct Http1OptionsBuilder {
    options: Http1Options,
}

impl Http1OptionsBuilder {
    /// Cap the length of the response status line.
    pub fn max_initial_line_length(mut self, max: usize) -> Self {
        self.options.max_initial_line_length = max;
        self
    }

    /// Cap the total size of the response header block.
    pub fn max_header_size(mut self, max: usize) -> Self {
        self.options.max_header_size = max;
        self
    }

    /// Finish building.
    pub fn build(self) -> Http1Options {
        self.options
    }
}

/// Knobs specific to HTTP/2 connections, forwarded to the framing layer's
/// SETTINGS exchange.
#[derive(Clone, Debug, Default)]
pub struct Http2Options {
    pub(crate) initial_stream_window_size: Option<u32>,
    pub(crate) initial_connection_window_size: Option<u32>,
    pub(crate) max_frame_size: Option<u32>,
    pub(crate) max_header_list_size: Option<u32>,
    pub(crate) max_concurrent_streams: Option<u32>,
}

impl Http2Options {
    /// Start building HTTP/2 options.
    pub fn builder() -> Http2OptionsBuilder {
        Http2OptionsBuilder {
            options: Http2Options::default(),
        }
    }
}

/// Builder for [`Http2Options`].
#[must_use]
#[derive(Debug)]
pub struct Http2OptionsBuilder {
    options: Http2Options,
}

impl Http2OptionsBuilder {
    /// Sets the stream-level flow control window.
    pub fn initial_stream_window_size<T>(mut self, value: T) -> Self
    where
        T: Into<Option<u32>>,
    {
        self.options.initial_stream_window_size = value.into();
        self
    }

    /// Sets the connection-level flow control window.
    pub fn initial_connection_window_size<T>(mut self, value: T) -> Self
    where
        T: Into<Option<u32>>,
    {
        self.options.initial_connection_window_size = value.into();
        self
    }

    /// Sets the maximum frame size to advertise.
    pub fn max_frame_size<T>(mut self, value: T) -> Self
    where
        T: Into<Option<u32>>,
    {
        self.options.max_frame_size = value.into();
        self
    }

    /// Sets the maximum header list size to advertise.
    pub fn max_header_list_size<T>(mut self, value: T) -> Self
    where
        T: Into<Option<u32>>,
    {
        self.options.max_header_list_size = value.into();
        self
    }

    /// Caps the number of concurrent streams the peer may open.
    pub fn max_concurrent_streams<T>(mut self, value: T) -> Self
    where
        T: Into<Option<u32>>,
    {
        self.options.max_concurrent_streams = value.into();
        self
    }

    /// Finish building.
    pub fn build(self) -> Http2Options {
        self.options
    }
}

/// Retry behaviour for the retry interceptor.
///
/// Passing `None` for the whole struct to
/// [`ClientBuilder::retry_options`](crate::ClientBuilder::retry_options)
/// removes the retry interceptor from the chain entirely.
#[derive(Clone, Debug)]
pub struct RetryOptions {
    pub(crate) max_retries: u32,
    pub(crate) backoff: Option<Duration>,
}

impl Default for RetryOptions {
    fn default() -> Self {
        RetryOptions {
            max_retries: 3,
            backoff: None,
        }
    }
}

impl RetryOptions {
    /// Retry up to `max` times with no backoff.
    pub fn new(max: u32) -> Self {
        RetryOptions {
            max_retries: max,
            backoff: None,
        }
    }

    /// Sleep `backoff` between attempts.
    pub fn backoff(mut self, backoff: Duration) -> Self {
        self.backoff = Some(backoff);
        self
    }
}

/// TLS options for `https` endpoints.
#[derive(Clone)]
pub struct SslOptions {
    pub(crate) handshake_timeout: Option<Duration>,
    pub(crate) cert_verification: bool,
    pub(crate) extra_root_certificates: Vec<rustls::pki_types::CertificateDer<'static>>,
}

impl Default for SslOptions {
    fn default() -> Self {
        SslOptions {
            handshake_timeout: None,
            cert_verification: true,
            extra_root_certificates: Vec::new(),
        }
    }
}

impl fmt::Debug for SslOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SslOptions")
            .field("handshake_timeout", &self.handshake_timeout)
            .field("cert_verification", &self.cert_verification)
            .field(
                "extra_root_certificates",
                &self.extra_root_certificates.len(),
            )
            .finish()
    }
}

impl SslOptions {
    /// Bound the TLS handshake; falls back to the connect timeout when unset.
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = Some(timeout);
        self
    }

    /// Controls server certificate verification.
    ///
    /// # Warning
    ///
    /// Disabling verification makes the connection vulnerable to
    /// man-in-the-middle attacks. Intended for testing.
    pub fn cert_verification(mut self, enabled: bool) -> Self {
        self.cert_verification = enabled;
        self
    }

    /// Trust an additional root certificate (DER).
    pub fn add_root_certificate(
        mut self,
        cert: rustls::pki_types::CertificateDer<'static>,
    ) -> Self {
        self.extra_root_certificates.push(cert);
        self
    }
}

/// Sizing of one endpoint's channel pool.
#[derive(Clone, Copy, Debug)]
pub struct ChannelPoolOptions {
    pub(crate) pool_size: usize,
    pub(crate) waiting_queue_length: usize,
    pub(crate) idle_timeout: Option<Duration>,
}

impl Default for ChannelPoolOptions {
    fn default() -> Self {
        ChannelPoolOptions {
            pool_size: 512,
            waiting_queue_length: 256,
            idle_timeout: Some(Duration::from_secs(60)),
        }
    }
}

impl ChannelPoolOptions {
    /// Create options with the given pool size and waiting queue length.
    pub fn new(pool_size: usize, waiting_queue_length: usize) -> Self {
        ChannelPoolOptions {
            pool_size,
            waiting_queue_length,
            ..Default::default()
        }
    }

    /// Drop connections idle longer than `timeout`.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }
}

/// Per-endpoint override for pool sizing. Shared by identity across
/// [`copy()`](crate::ClientBuilder::copy)-derived builders.
pub type ChannelPoolOptionsProvider =
    Arc<dyn Fn(&crate::transceiver::Endpoint) -> Option<ChannelPoolOptions> + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http2_options_builder() {
        let opts = Http2Options::builder()
            .max_frame_size(1 << 15)
            .max_concurrent_streams(64)
            .build();
        assert_eq!(opts.max_frame_size, Some(1 << 15));
        assert_eq!(opts.max_concurrent_streams, Some(64));
        assert_eq!(opts.initial_stream_window_size, None);
    }

    #[test]
    fn pool_options_defaults() {
        let opts = ChannelPoolOptions::default();
        assert_eq!(opts.pool_size, 512);
        assert_eq!(opts.waiting_queue_length, 256);
    }
}
