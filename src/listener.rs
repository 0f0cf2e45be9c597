//! Request lifecycle observation.

use http::StatusCode;

use crate::error::Error;

/// Observer of one request's lifecycle.
///
/// Callbacks for a given request are totally ordered and never overlap:
/// `on_filters_end`, the pool/connection callbacks, the write callbacks,
/// then exactly one of `on_completed` / `on_error`.
///
/// Every method has a no-op default, so implementors override only what
/// they care about.
#[allow(unused_variables)]
pub trait Listener: Send + Sync + 'static {
    /// All request filters have run.
    fn on_filters_end(&self) {}

    /// About to ask the endpoint's pool for a connection.
    fn on_connection_pool_attempt(&self) {}

    /// The pool produced a connection (possibly still handshaking).
    fn on_connection_pool_acquired(&self) {}

    /// The pool could not produce a connection.
    fn on_connection_pool_failed(&self, err: &Error) {}

    /// Waiting for the connection's transport handshake.
    fn on_connection_attempt(&self) {}

    /// The connection is established and validated.
    fn on_connection_acquired(&self) {}

    /// About to hand the request to a writer.
    fn on_write_attempt(&self) {}

    /// The last request byte reached the transport's outbound buffer.
    fn on_write_done(&self) {}

    /// The transport rejected the write.
    fn on_write_failed(&self, err: &Error) {}

    /// The response head arrived.
    fn on_message_received(&self, status: StatusCode) {}

    /// The response ended normally.
    fn on_completed(&self) {}

    /// The request failed; fires exactly once, after which no further
    /// callbacks are delivered.
    fn on_error(&self, err: &Error) {}
}

pub(crate) struct NoopListener;

impl Listener for NoopListener {}
