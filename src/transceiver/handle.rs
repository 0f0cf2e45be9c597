//! Listener wrapper owning the read-timeout token and the connection
//! release decision.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use http::StatusCode;

use super::{channel::Channel, pool::ChannelPool, timer::Timeout};
use crate::{error::Error, listener::Listener};

/// When the wrapped connection is given back to its pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ReleaseOn {
    /// HTTP/1: after the response message ends (or on error) — never on
    /// write completion, the connection is still owed a response.
    MessageEnd,
    /// HTTP/2: right after the request write; the response keeps flowing
    /// through the registry, release is accounting only.
    WriteDone,
}

struct Binding {
    channel: Arc<Channel>,
    pool: Arc<ChannelPool>,
}

/// Per-request strategy object wrapping the user [`Listener`].
///
/// All observer callbacks delegate to the wrapped listener after the
/// release bookkeeping runs. Release happens exactly once regardless of
/// which terminal path fires first.
pub(crate) struct TimeoutHandle {
    listener: Arc<dyn Listener>,
    binding: Option<Binding>,
    mode: ReleaseOn,
    released: AtomicBool,
    timeout: Mutex<Option<Timeout>>,
}

impl TimeoutHandle {
    pub(crate) fn new(
        listener: Arc<dyn Listener>,
        channel: Arc<Channel>,
        pool: Arc<ChannelPool>,
        mode: ReleaseOn,
    ) -> Arc<TimeoutHandle> {
        Arc::new(TimeoutHandle {
            listener,
            binding: Some(Binding { channel, pool }),
            mode,
            released: AtomicBool::new(false),
            timeout: Mutex::new(None),
        })
    }

    /// A handle with no connection attached; unit-test plumbing.
    #[cfg(test)]
    pub(crate) fn detached() -> Arc<TimeoutHandle> {
        Arc::new(TimeoutHandle {
            listener: Arc::new(crate::listener::NoopListener),
            binding: None,
            mode: ReleaseOn::MessageEnd,
            released: AtomicBool::new(false),
            timeout: Mutex::new(None),
        })
    }

    /// Arm the read timeout; the token is cancelled on every terminal path.
    pub(crate) fn set_timeout(&self, token: Timeout) {
        *self.timeout.lock().unwrap() = Some(token);
    }

    pub(crate) fn cancel_timeout(&self) {
        if let Some(token) = self.timeout.lock().unwrap().take() {
            token.cancel();
        }
    }

    fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(binding) = &self.binding {
            binding.pool.release(&binding.channel);
        }
    }

    pub(crate) fn on_write_attempt(&self) {
        self.listener.on_write_attempt();
    }

    pub(crate) fn on_write_done(&self) {
        if self.mode == ReleaseOn::WriteDone {
            self.release();
        }
        self.listener.on_write_done();
    }

    pub(crate) fn on_write_failed(&self, err: &Error) {
        self.listener.on_write_failed(err);
    }

    pub(crate) fn on_message_received(&self, status: StatusCode) {
        self.listener.on_message_received(status);
    }

    pub(crate) fn on_message_completed(&self) {
        if self.mode == ReleaseOn::MessageEnd {
            self.release();
        }
        self.listener.on_completed();
    }

    pub(crate) fn on_error(&self, err: &Error) {
        if let Some(binding) = &self.binding {
            // an errored HTTP/1 connection can be mid-message; never reuse it
            if self.mode == ReleaseOn::MessageEnd {
                binding.channel.close();
            }
        }
        self.release();
        self.listener.on_error(err);
    }
}

impl std::fmt::Debug for TimeoutHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutHandle")
            .field("mode", &self.mode)
            .field("released", &self.released.load(Ordering::Relaxed))
            .finish()
    }
}
