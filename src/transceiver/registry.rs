//! Per-connection map of in-flight response handles.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
};

use bytes::Bytes;
use http::{HeaderMap, StatusCode, Uri, Version};
use tokio::sync::{mpsc, oneshot};

use super::handle::TimeoutHandle;
use crate::{
    context::Context,
    error::{Error, Result},
    response::{Response, ResponseBody},
};

/// HTTP/1 has a single in-flight exchange per connection.
pub(crate) const H1_REQUEST_ID: u32 = 1;

/// First HTTP/2 request id; ids stay odd and grow monotonically.
const H2_FIRST_ID: u32 = 3;

/// Largest id assignable before the connection must be replaced.
const MAX_STREAM_ID: u32 = i32::MAX as u32;

enum IdSource {
    /// Always [`H1_REQUEST_ID`].
    Single,
    /// Odd, monotonically increasing.
    Odd(AtomicU32),
}

/// Bounded mapping `request id -> ResponseHandle`, one per connection.
///
/// Entries are removed before their response future completes; `clear`
/// drains everything when the connection dies.
pub(crate) struct HandleRegistry {
    ids: IdSource,
    inner: Mutex<HashMap<u32, ResponseHandle>>,
}

impl HandleRegistry {
    pub(crate) fn h1() -> HandleRegistry {
        HandleRegistry {
            ids: IdSource::Single,
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn h2() -> HandleRegistry {
        HandleRegistry {
            ids: IdSource::Odd(AtomicU32::new(H2_FIRST_ID)),
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Assign a fresh id and store the handle under it. Hands the handle
    /// back if no id can be assigned (id space exhausted, or an HTTP/1
    /// exchange is already in flight).
    pub(crate) fn put(&self, handle: ResponseHandle) -> std::result::Result<u32, ResponseHandle> {
        let id = match &self.ids {
            IdSource::Single => H1_REQUEST_ID,
            IdSource::Odd(next) => {
                let id = next.fetch_add(2, Ordering::AcqRel);
                if id > MAX_STREAM_ID {
                    return Err(handle);
                }
                id
            }
        };
        let mut inner = self.inner.lock().unwrap();
        if inner.contains_key(&id) {
            return Err(handle);
        }
        inner.insert(id, handle);
        Ok(id)
    }

    pub(crate) fn remove(&self, id: u32) -> Option<ResponseHandle> {
        self.inner.lock().unwrap().remove(&id)
    }

    pub(crate) fn contains(&self, id: u32) -> bool {
        self.inner.lock().unwrap().contains_key(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    /// Invoke the parked 100-continue resumption for `id`, leaving the
    /// entry in place. Returns false when the id is unknown.
    pub(crate) fn fire_continue(&self, id: u32) -> bool {
        let cb = {
            let inner = self.inner.lock().unwrap();
            match inner.get(&id) {
                Some(handle) => handle.ctx.continue_callback(),
                None => return false,
            }
        };
        match cb {
            Some(cb) => {
                cb();
                true
            }
            None => false,
        }
    }

    /// Complete every outstanding handle with an error from `cause` and
    /// empty the table. Used when the connection closes underneath its
    /// in-flight exchanges.
    pub(crate) fn clear(&self, cause: impl Fn() -> Error) {
        let drained: Vec<ResponseHandle> = {
            let mut inner = self.inner.lock().unwrap();
            inner.drain().map(|(_, h)| h).collect()
        };
        for handle in drained {
            handle.fail(cause());
        }
    }
}

impl std::fmt::Debug for HandleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleRegistry")
            .field("len", &self.len())
            .finish()
    }
}

/// The receiving side of one request: completes the response future,
/// streams body chunks, and drives the release/observer bookkeeping through
/// its [`TimeoutHandle`].
pub(crate) struct ResponseHandle {
    uri: Uri,
    head_tx: Option<oneshot::Sender<Result<Response>>>,
    body_tx: Option<mpsc::UnboundedSender<Result<Bytes>>>,
    pub(crate) handle: Arc<TimeoutHandle>,
    pub(crate) ctx: Arc<Context>,
    max_content_length: Option<u64>,
    received: u64,
    head_request: bool,
}

impl std::fmt::Debug for ResponseHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseHandle")
            .field("uri", &self.uri)
            .field("head_pending", &self.head_tx.is_some())
            .finish()
    }
}

impl ResponseHandle {
    pub(crate) fn new(
        uri: Uri,
        head_tx: oneshot::Sender<Result<Response>>,
        handle: Arc<TimeoutHandle>,
        ctx: Arc<Context>,
        max_content_length: Option<u64>,
        head_request: bool,
    ) -> ResponseHandle {
        ResponseHandle {
            uri,
            head_tx: Some(head_tx),
            body_tx: None,
            handle,
            ctx,
            max_content_length,
            received: 0,
            head_request,
        }
    }

    /// Whether the response to a HEAD request (no body follows the head).
    pub(crate) fn is_head_request(&self) -> bool {
        self.head_request
    }

    /// Deliver the response head, opening the body channel.
    pub(crate) fn receive_head(&mut self, status: StatusCode, version: Version, headers: HeaderMap) {
        let (tx, body) = ResponseBody::channel();
        let response = Response::new(status, version, headers, self.uri.clone(), body);
        self.body_tx = Some(tx);
        self.handle.on_message_received(status);
        if let Some(head_tx) = self.head_tx.take() {
            let _ = head_tx.send(Ok(response));
        }
    }

    /// Deliver one body chunk. Fails when the aggregate size crosses the
    /// configured cap; a dropped receiver just discards the bytes.
    pub(crate) fn receive_data(&mut self, chunk: Bytes) -> Result<()> {
        self.received += chunk.len() as u64;
        if let Some(limit) = self.max_content_length {
            if self.received > limit {
                return Err(Error::content_overflow(limit));
            }
        }
        if let Some(tx) = &self.body_tx {
            let _ = tx.send(Ok(chunk));
        }
        Ok(())
    }

    /// Normal end of message: cancel the read timeout, end the body stream,
    /// run the protocol's release bookkeeping.
    pub(crate) fn complete(mut self) {
        self.handle.cancel_timeout();
        self.body_tx.take();
        self.handle.on_message_completed();
    }

    /// Terminal failure: exactly one of the response future or body stream
    /// observes the error, and the listener's `on_error` fires once.
    pub(crate) fn fail(mut self, err: Error) {
        self.handle.cancel_timeout();
        self.handle.on_error(&err);
        if let Some(head_tx) = self.head_tx.take() {
            let _ = head_tx.send(Err(err));
        } else if let Some(body_tx) = self.body_tx.take() {
            let _ = body_tx.send(Err(err));
        }
    }
}
