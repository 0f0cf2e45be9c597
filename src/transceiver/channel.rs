//! A live transport channel.

use std::{
    fmt,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex, OnceLock,
    },
    time::Instant,
};

use bytes::Bytes;
use tokio::{io::AsyncWrite, sync::watch};
use tokio_util::sync::CancellationToken;

use super::{pool::Endpoint, registry::HandleRegistry};
use crate::error::{Error, Result};

pub(crate) type WriteHalf = Box<dyn AsyncWrite + Send + Unpin>;

/// Pending outbound bytes above this mark flip the channel unwritable
/// until the writes drain.
const WRITE_BUFFER_HIGH_WATER_MARK: usize = 64 * 1024;

/// Handshake progress of a channel, observable by every acquirer.
#[derive(Clone)]
pub(crate) enum HandshakeState {
    Pending,
    Ready,
    Failed(Arc<Error>),
}

/// Protocol parts installed on a channel once negotiation finishes. Each
/// variant owns the channel's `HandleRegistry`.
pub(crate) enum Proto {
    H1 {
        write: Arc<tokio::sync::Mutex<WriteHalf>>,
        registry: Arc<HandleRegistry>,
        version: http::Version,
    },
    H2 {
        send: tokio::sync::Mutex<h2::client::SendRequest<Bytes>>,
        registry: Arc<HandleRegistry>,
    },
}

/// A pooled transport connection.
///
/// Created as soon as the connect is initiated; the pipeline fills in the
/// protocol parts and settles the handshake state asynchronously.
pub(crate) struct Channel {
    id: u64,
    endpoint: Endpoint,
    addr: SocketAddr,
    proto: OnceLock<Proto>,
    handshake_rx: watch::Receiver<HandshakeState>,
    handshake_tx: watch::Sender<HandshakeState>,
    active: AtomicBool,
    writable: AtomicBool,
    pending_out: AtomicUsize,
    in_flight: AtomicBool,
    idle_since: Mutex<Instant>,
    shutdown: CancellationToken,
}

impl Channel {
    pub(crate) fn new(endpoint: Endpoint, addr: SocketAddr) -> Arc<Channel> {
        static IDS: AtomicU64 = AtomicU64::new(0);
        let (handshake_tx, handshake_rx) = watch::channel(HandshakeState::Pending);
        Arc::new(Channel {
            id: IDS.fetch_add(1, Ordering::Relaxed),
            endpoint,
            addr,
            proto: OnceLock::new(),
            handshake_rx,
            handshake_tx,
            active: AtomicBool::new(true),
            writable: AtomicBool::new(true),
            pending_out: AtomicUsize::new(0),
            in_flight: AtomicBool::new(false),
            idle_since: Mutex::new(Instant::now()),
            shutdown: CancellationToken::new(),
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub(crate) fn remote_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Wait until the transport handshake has settled, propagating its
    /// failure if it did not succeed. Connect-stage failures keep their
    /// kind; everything else surfaces as a handshake failure.
    pub(crate) async fn handshake(&self) -> Result<()> {
        let mut rx = self.handshake_rx.clone();
        loop {
            match &*rx.borrow() {
                HandshakeState::Ready => return Ok(()),
                HandshakeState::Failed(err) => {
                    return Err(if err.is_connect() {
                        Error::connect(err.clone())
                    } else {
                        Error::handshake(err.clone())
                    });
                }
                HandshakeState::Pending => {}
            }
            if rx.changed().await.is_err() {
                return Err(Error::connection_inactive());
            }
        }
    }

    pub(crate) fn settle_handshake(&self, result: Result<()>) {
        let state = match result {
            Ok(()) => HandshakeState::Ready,
            Err(e) => HandshakeState::Failed(Arc::new(e)),
        };
        let _ = self.handshake_tx.send(state);
    }

    pub(crate) fn install(&self, proto: Proto) {
        if self.proto.set(proto).is_err() {
            unreachable!("protocol parts installed twice");
        }
    }

    pub(crate) fn proto(&self) -> Option<&Proto> {
        self.proto.get()
    }

    pub(crate) fn registry(&self) -> Option<&Arc<HandleRegistry>> {
        match self.proto.get()? {
            Proto::H1 { registry, .. } => Some(registry),
            Proto::H2 { registry, .. } => Some(registry),
        }
    }

    pub(crate) fn is_h2(&self) -> bool {
        matches!(self.proto.get(), Some(Proto::H2 { .. }))
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn is_writable(&self) -> bool {
        self.writable.load(Ordering::Acquire)
    }

    /// Account bytes handed to a writer but not yet drained into the
    /// transport. Crossing the high-water mark flips the channel
    /// unwritable so validation rejects further requests instead of
    /// piling onto a congested connection. The returned reservation
    /// settles the accounting when dropped, whether the write finished,
    /// failed, or was cancelled mid-flight.
    #[must_use]
    pub(crate) fn reserve_outbound(&self, n: usize) -> OutboundReservation<'_> {
        let pending = self.pending_out.fetch_add(n, Ordering::AcqRel) + n;
        if pending > WRITE_BUFFER_HIGH_WATER_MARK {
            self.writable.store(false, Ordering::Release);
        }
        OutboundReservation { channel: self, n }
    }

    fn settle_outbound(&self, n: usize) {
        let pending = self
            .pending_out
            .fetch_sub(n, Ordering::AcqRel)
            .saturating_sub(n);
        if pending <= WRITE_BUFFER_HIGH_WATER_MARK {
            self.writable.store(true, Ordering::Release);
        }
    }

    /// Mark the channel dead and wake its reader/driver task. Clearing the
    /// registry is the closer's responsibility.
    pub(crate) fn close(&self) {
        if self.active.swap(false, Ordering::AcqRel) {
            log::debug!("closing channel {} to {}", self.id, self.endpoint);
            self.shutdown.cancel();
        }
    }

    pub(crate) fn closed_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Bind the channel to one in-flight request (HTTP/1 exclusivity).
    /// Returns false if it was already bound.
    pub(crate) fn bind(&self) -> bool {
        !self.in_flight.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn unbind(&self) {
        self.in_flight.store(false, Ordering::Release);
        *self.idle_since.lock().unwrap() = Instant::now();
    }

    pub(crate) fn is_bound(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    pub(crate) fn idle_for(&self) -> std::time::Duration {
        self.idle_since.lock().unwrap().elapsed()
    }
}

/// Bytes counted against a channel's outbound high-water mark, released
/// on drop.
pub(crate) struct OutboundReservation<'a> {
    channel: &'a Channel,
    n: usize,
}

impl Drop for OutboundReservation<'_> {
    fn drop(&mut self) {
        self.channel.settle_outbound(self.n);
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("addr", &self.addr)
            .field("active", &self.is_active())
            .field("bound", &self.is_bound())
            .field("writable", &self.is_writable())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transceiver::pool::Scheme;

    fn channel() -> Arc<Channel> {
        Channel::new(
            Endpoint {
                scheme: Scheme::Http,
                host: "127.0.0.1".to_string(),
                port: 80,
            },
            "127.0.0.1:80".parse().unwrap(),
        )
    }

    #[test]
    fn writable_follows_the_high_water_mark() {
        let ch = channel();
        assert!(ch.is_writable());

        let at_mark = ch.reserve_outbound(WRITE_BUFFER_HIGH_WATER_MARK);
        assert!(ch.is_writable(), "at the mark is still writable");

        let past_mark = ch.reserve_outbound(1);
        assert!(!ch.is_writable(), "past the mark is not");

        drop(past_mark);
        assert!(ch.is_writable(), "draining below the mark restores it");
        drop(at_mark);
        assert!(ch.is_writable());
    }

    #[test]
    fn small_writes_never_trip_the_mark() {
        let ch = channel();
        for _ in 0..1000 {
            let reservation = ch.reserve_outbound(512);
            drop(reservation);
        }
        assert!(ch.is_writable());
    }

    #[test]
    fn abandoned_write_still_drains_the_accounting() {
        // the reservation settles on drop even when the write future is
        // cancelled instead of completing
        let ch = channel();
        let reservation = ch.reserve_outbound(WRITE_BUFFER_HIGH_WATER_MARK + 1);
        assert!(!ch.is_writable());
        drop(reservation);
        assert!(ch.is_writable());
    }
}
