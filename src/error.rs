use std::{error::Error as StdError, fmt, io};

use http::Uri;

/// A `Result` alias where the `Err` case is `courier::Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// A boxed error type that can be used for dynamic error handling.
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// The errors that may occur when dispatching a `Request`.
///
/// Note: errors may include the full URI used to make the `Request`. If the
/// URI contains sensitive information (e.g. an API key as a query
/// parameter), be sure to remove it ([`without_uri`](Error::without_uri)).
pub struct Error {
    inner: Box<Inner>,
}

struct Inner {
    kind: Kind,
    source: Option<BoxError>,
    uri: Option<Uri>,
}

impl Error {
    pub(crate) fn new<E>(kind: Kind, source: Option<E>) -> Error
    where
        E: Into<BoxError>,
    {
        Error {
            inner: Box::new(Inner {
                kind,
                source: source.map(Into::into),
                uri: None,
            }),
        }
    }

    pub(crate) fn builder<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Builder, Some(e))
    }

    pub(crate) fn unresolved_host(uri: Uri) -> Error {
        Error::new(Kind::UnresolvedHost, None::<Error>).with_uri(uri)
    }

    pub(crate) fn pool_exhausted() -> Error {
        Error::new(Kind::PoolExhausted, None::<Error>)
    }

    pub(crate) fn connect<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::ConnectFailed, Some(e))
    }

    pub(crate) fn handshake<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::HandshakeFailed, Some(e))
    }

    pub(crate) fn connection_inactive() -> Error {
        Error::new(Kind::ConnectionInactive, None::<Error>)
    }

    pub(crate) fn write_buffer_full() -> Error {
        Error::new(Kind::WriteBufferFull, None::<Error>)
    }

    pub(crate) fn write<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::WriteFailed { body_sent: false }, Some(e))
    }

    pub(crate) fn write_partial<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::WriteFailed { body_sent: true }, Some(e))
    }

    /// Marks a write failure as having happened after body bytes were
    /// handed to the transport; other kinds pass through unchanged.
    pub(crate) fn into_partial_write(mut self) -> Error {
        if let Kind::WriteFailed { body_sent } = &mut self.inner.kind {
            *body_sent = true;
        }
        self
    }

    pub(crate) fn read_timeout() -> Error {
        Error::new(Kind::ReadTimeout, Some(TimedOut))
    }

    pub(crate) fn encode<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Encode, Some(e))
    }

    pub(crate) fn decode<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Decode, Some(e))
    }

    pub(crate) fn redirect<E: Into<BoxError>>(e: E, uri: Uri) -> Error {
        Error::new(Kind::Redirect, Some(e)).with_uri(uri)
    }

    pub(crate) fn content_overflow(limit: u64) -> Error {
        Error::new(Kind::ContentOverflow, Some(format!("body exceeds {limit} bytes")))
    }

    pub(crate) fn cancelled() -> Error {
        Error::new(Kind::Cancelled, None::<Error>)
    }

    pub(crate) fn io<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Io, Some(e))
    }
}

impl Error {
    /// Returns a possible URI related to this error.
    pub fn uri(&self) -> Option<&Uri> {
        self.inner.uri.as_ref()
    }

    /// Add a URI related to this error (overwriting any existing).
    pub fn with_uri(mut self, uri: Uri) -> Self {
        self.inner.uri = Some(uri);
        self
    }

    /// Strip the related URI from this error (if, for example, it contains
    /// sensitive information).
    pub fn without_uri(mut self) -> Self {
        self.inner.uri = None;
        self
    }

    /// Returns true if the error came from building a client or request.
    pub fn is_builder(&self) -> bool {
        matches!(self.inner.kind, Kind::Builder)
    }

    /// Returns true if the destination host could not be resolved.
    pub fn is_unresolved_host(&self) -> bool {
        matches!(self.inner.kind, Kind::UnresolvedHost)
    }

    /// Returns true if the endpoint's waiter queue overflowed.
    pub fn is_pool_exhausted(&self) -> bool {
        matches!(self.inner.kind, Kind::PoolExhausted)
    }

    /// Returns true if the error is related to establishing a connection.
    pub fn is_connect(&self) -> bool {
        matches!(self.inner.kind, Kind::ConnectFailed)
    }

    /// Returns true if TLS, ALPN, or the h2 preface exchange failed.
    pub fn is_handshake(&self) -> bool {
        matches!(self.inner.kind, Kind::HandshakeFailed)
    }

    /// Returns true if a pooled connection turned out to be dead.
    pub fn is_connection_inactive(&self) -> bool {
        matches!(self.inner.kind, Kind::ConnectionInactive)
    }

    /// Returns true if the connection's write buffer was over its
    /// high-water mark.
    pub fn is_write_buffer_full(&self) -> bool {
        matches!(self.inner.kind, Kind::WriteBufferFull)
    }

    /// Returns true if the transport rejected the request write.
    pub fn is_write(&self) -> bool {
        matches!(self.inner.kind, Kind::WriteFailed { .. })
    }

    pub(crate) fn is_partial_write(&self) -> bool {
        matches!(self.inner.kind, Kind::WriteFailed { body_sent: true })
    }

    /// Returns true if the read timeout fired before the response ended.
    pub fn is_read_timeout(&self) -> bool {
        matches!(self.inner.kind, Kind::ReadTimeout)
    }

    /// Returns true if the error is related to a timeout of any sort.
    pub fn is_timeout(&self) -> bool {
        if self.is_read_timeout() {
            return true;
        }
        let mut source = self.source();
        while let Some(err) = source {
            if err.is::<TimedOut>() {
                return true;
            }
            if let Some(io) = err.downcast_ref::<io::Error>() {
                if io.kind() == io::ErrorKind::TimedOut {
                    return true;
                }
            }
            source = err.source();
        }
        false
    }

    /// Returns true if the error occurred while encoding the request body.
    pub fn is_encode(&self) -> bool {
        matches!(self.inner.kind, Kind::Encode)
    }

    /// Returns true if the error occurred while decoding the response body.
    pub fn is_decode(&self) -> bool {
        matches!(self.inner.kind, Kind::Decode)
    }

    /// Returns true if the error came from following redirects.
    pub fn is_redirect(&self) -> bool {
        matches!(self.inner.kind, Kind::Redirect)
    }

    /// Returns true if the aggregated body crossed `max_content_length`.
    pub fn is_content_overflow(&self) -> bool {
        matches!(self.inner.kind, Kind::ContentOverflow)
    }

    /// Returns true if the request was cancelled before completion.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.inner.kind, Kind::Cancelled)
    }

    /// Returns true if the error is retry-eligible: a fresh attempt on a new
    /// connection has a chance of succeeding and no request bytes beyond the
    /// head may have reached the server. A write failure stays eligible
    /// only while no body byte had been handed to the transport.
    pub fn is_retry_eligible(&self) -> bool {
        matches!(
            self.inner.kind,
            Kind::PoolExhausted
                | Kind::ConnectFailed
                | Kind::HandshakeFailed
                | Kind::ConnectionInactive
                | Kind::WriteBufferFull
                | Kind::WriteFailed { body_sent: false }
        )
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut builder = f.debug_struct("courier::Error");
        builder.field("kind", &self.inner.kind);
        if let Some(ref uri) = self.inner.uri {
            builder.field("uri", uri);
        }
        if let Some(ref source) = self.inner.source {
            builder.field("source", source);
        }
        builder.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.inner.kind {
            Kind::Builder => f.write_str("builder error")?,
            Kind::UnresolvedHost => f.write_str("failed to resolve host")?,
            Kind::PoolExhausted => f.write_str("connection pool waiter queue is full")?,
            Kind::ConnectFailed => f.write_str("error connecting to endpoint")?,
            Kind::HandshakeFailed => f.write_str("transport handshake failed")?,
            Kind::ConnectionInactive => f.write_str("acquired connection is inactive")?,
            Kind::WriteBufferFull => f.write_str("connection write buffer is full")?,
            Kind::WriteFailed { .. } => f.write_str("error writing request")?,
            Kind::ReadTimeout => f.write_str("read timed out before response end")?,
            Kind::Encode => f.write_str("error encoding request body")?,
            Kind::Decode => f.write_str("error decoding response body")?,
            Kind::Redirect => f.write_str("error following redirect")?,
            Kind::ContentOverflow => f.write_str("response body too large")?,
            Kind::Cancelled => f.write_str("request cancelled")?,
            Kind::Io => f.write_str("io error")?,
        }
        if let Some(uri) = &self.inner.uri {
            write!(f, " for uri ({uri})")?;
        }
        if let Some(e) = &self.inner.source {
            write!(f, ": {e}")?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner.source.as_ref().map(|e| &**e as _)
    }
}

#[derive(Debug)]
pub(crate) enum Kind {
    Builder,
    UnresolvedHost,
    PoolExhausted,
    ConnectFailed,
    HandshakeFailed,
    ConnectionInactive,
    WriteBufferFull,
    WriteFailed {
        /// Body bytes reached the transport before the failure; replaying
        /// the request is no longer safe.
        body_sent: bool,
    },
    ReadTimeout,
    Encode,
    Decode,
    Redirect,
    ContentOverflow,
    Cancelled,
    Io,
}

/// Sentinel carried as the source of timeout-flavoured errors.
#[derive(Debug)]
pub(crate) struct TimedOut;

impl fmt::Display for TimedOut {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("operation timed out")
    }
}

impl StdError for TimedOut {}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}

    #[test]
    fn test_source_chain() {
        let root = Error::new(Kind::WriteFailed { body_sent: false }, None::<Error>);
        assert!(root.source().is_none());

        let link = Error::io(root);
        assert!(link.source().is_some());
        assert_send::<Error>();
        assert_sync::<Error>();
    }

    #[test]
    fn mem_size_of() {
        use std::mem::size_of;
        assert_eq!(size_of::<Error>(), size_of::<usize>());
    }

    #[test]
    fn is_timeout() {
        let err = Error::read_timeout();
        assert!(err.is_timeout());
        assert!(err.is_read_timeout());

        let nested = Error::connect(TimedOut);
        assert!(nested.is_timeout());
        assert!(!nested.is_read_timeout());

        let io = io::Error::from(io::ErrorKind::TimedOut);
        let nested = Error::io(io);
        assert!(nested.is_timeout());
    }

    #[test]
    fn retry_eligibility() {
        assert!(Error::pool_exhausted().is_retry_eligible());
        assert!(Error::connection_inactive().is_retry_eligible());
        assert!(Error::write_buffer_full().is_retry_eligible());
        assert!(!Error::read_timeout().is_retry_eligible());
        assert!(!Error::cancelled().is_retry_eligible());
    }

    #[test]
    fn write_failure_eligibility_tracks_body_progress() {
        // nothing beyond the head went out: safe to replay
        assert!(Error::write("broken pipe").is_retry_eligible());
        // body bytes reached the transport: replaying could duplicate them
        assert!(!Error::write_partial("broken pipe").is_retry_eligible());

        let promoted = Error::write("broken pipe").into_partial_write();
        assert!(promoted.is_partial_write());
        assert!(!promoted.is_retry_eligible());

        // promotion leaves other kinds alone
        assert!(!Error::encode("gone").into_partial_write().is_partial_write());
    }

    #[test]
    fn uri_attachment() {
        let uri: Uri = "http://example.com/secret?key=1".parse().unwrap();
        let err = Error::unresolved_host(uri.clone());
        assert_eq!(err.uri(), Some(&uri));
        assert!(err.without_uri().uri().is_none());
    }
}
