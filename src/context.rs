//! Per-request scratchpad shared between the core and interceptors.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use tokio::sync::watch;

use crate::{
    error::{Error, Result},
    transceiver::ChunkWriter,
};

type ContinueCallback = Arc<dyn Fn() + Send + Sync>;

/// Mutable per-request state. Created when the user issues the request and
/// dropped when the response future completes.
///
/// The well-known attributes are typed fields; anything else interceptors
/// want to stash goes through [`extensions`](Context::extensions).
#[derive(Default)]
pub struct Context {
    expect_continue: AtomicBool,
    continue_callback: Mutex<Option<ContinueCallback>>,
    chunk_writer: Mutex<Option<ChunkWriterPromise>>,
    extensions: Mutex<http::Extensions>,
}

impl Context {
    pub(crate) fn new() -> Context {
        Context::default()
    }

    /// Whether the request should be sent with `Expect: 100-continue`
    /// semantics: head first, body on signal.
    pub fn expect_continue_enabled(&self) -> bool {
        self.expect_continue.load(Ordering::Acquire)
    }

    pub(crate) fn set_expect_continue(&self, enabled: bool) {
        self.expect_continue.store(enabled, Ordering::Release);
    }

    /// The resumption callback parked by the writer when the head was sent
    /// under expect-continue. Invoking it streams the deferred body; repeat
    /// invocations are no-ops.
    pub fn continue_callback(&self) -> Option<ContinueCallback> {
        self.continue_callback.lock().unwrap().clone()
    }

    pub(crate) fn set_continue_callback(&self, cb: ContinueCallback) {
        *self.continue_callback.lock().unwrap() = Some(cb);
    }

    /// Resolves to the request's [`ChunkWriter`] once the head has been
    /// handed to the transport. Only present for chunk-stream requests.
    pub fn chunk_writer(&self) -> Option<ChunkWriterPromise> {
        self.chunk_writer.lock().unwrap().clone()
    }

    pub(crate) fn install_chunk_writer(&self) -> ChunkWriterPromise {
        let promise = ChunkWriterPromise::new();
        *self.chunk_writer.lock().unwrap() = Some(promise.clone());
        promise
    }

    /// Free-form typed attributes for interceptors and filters.
    pub fn extensions(&self) -> std::sync::MutexGuard<'_, http::Extensions> {
        self.extensions.lock().unwrap()
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("expect_continue", &self.expect_continue_enabled())
            .finish()
    }
}

/// A promise resolved with the request's [`ChunkWriter`] right after the
/// writer starts transmitting the head, so producers can queue bytes before
/// the head has even been flushed.
#[derive(Clone)]
pub struct ChunkWriterPromise {
    tx: Arc<watch::Sender<PromiseState>>,
    rx: watch::Receiver<PromiseState>,
}

#[derive(Clone)]
enum PromiseState {
    Empty,
    Ready(ChunkWriter),
    Failed(Arc<Error>),
}

impl ChunkWriterPromise {
    fn new() -> Self {
        let (tx, rx) = watch::channel(PromiseState::Empty);
        ChunkWriterPromise {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Wait for the writer to publish the chunk writer.
    pub async fn get(&self) -> Result<ChunkWriter> {
        let mut rx = self.rx.clone();
        loop {
            match &*rx.borrow() {
                PromiseState::Ready(w) => return Ok(w.clone()),
                PromiseState::Failed(e) => return Err(Error::write(e.clone())),
                PromiseState::Empty => {}
            }
            if rx.changed().await.is_err() {
                return Err(Error::cancelled());
            }
        }
    }

    /// Non-blocking peek, for callers that only want it if already there.
    pub fn try_get(&self) -> Option<ChunkWriter> {
        match &*self.rx.borrow() {
            PromiseState::Ready(w) => Some(w.clone()),
            _ => None,
        }
    }

    pub(crate) fn fulfill(&self, writer: ChunkWriter) {
        let mut writer = Some(writer);
        self.tx.send_if_modified(|slot| {
            if matches!(slot, PromiseState::Empty) {
                *slot = PromiseState::Ready(writer.take().expect("closure runs once"));
                true
            } else {
                false
            }
        });
    }

    pub(crate) fn fail(&self, err: Arc<Error>) {
        let mut err = Some(err);
        self.tx.send_if_modified(|slot| {
            if matches!(slot, PromiseState::Empty) {
                *slot = PromiseState::Failed(err.take().expect("closure runs once"));
                true
            } else {
                false
            }
        });
    }
}

impl std::fmt::Debug for ChunkWriterPromise {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkWriterPromise").finish()
    }
}
