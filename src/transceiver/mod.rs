//! The transceiver: resolves a destination, acquires a pooled channel,
//! writes the request in its wire form, registers a response handle, arms
//! the read timeout, and completes the response future.

use std::{sync::Arc, time::Duration};

use http::{header, HeaderValue, Method, Version};
use tokio::sync::oneshot;

pub(crate) mod channel;
pub(crate) mod h1;
pub(crate) mod h2;
pub(crate) mod handle;
pub(crate) mod pipeline;
pub(crate) mod pool;
pub(crate) mod registry;
pub(crate) mod selector;
pub(crate) mod timer;
pub(crate) mod writer;

pub use pool::Endpoint;
pub use writer::ChunkWriter;

use channel::{Channel, Proto};
use handle::{ReleaseOn, TimeoutHandle};
use pool::{ChannelPool, ChannelPools};
use registry::{HandleRegistry, ResponseHandle};
use selector::ServerSelector;
use writer::{RequestHead, WriteEnv};

use crate::{
    config::Decompression,
    context::Context,
    decoder,
    error::{Error, Result},
    listener::Listener,
    request::{Body, Request},
    response::Response,
    util,
};

pub(crate) struct TransceiverOptions {
    pub(crate) keep_alive: bool,
    pub(crate) read_timeout: Duration,
    pub(crate) max_content_length: Option<u64>,
    pub(crate) use_decompress: bool,
    pub(crate) decompression: Decompression,
    pub(crate) uri_encode: bool,
}

/// Orchestrates one request lifecycle across the pools, writers, registry
/// and timer.
pub(crate) struct Transceiver {
    selector: ServerSelector,
    pools: ChannelPools,
    options: TransceiverOptions,
}

impl Transceiver {
    pub(crate) fn new(
        selector: ServerSelector,
        pools: ChannelPools,
        options: TransceiverOptions,
    ) -> Transceiver {
        Transceiver {
            selector,
            pools,
            options,
        }
    }

    pub(crate) async fn send(
        &self,
        request: Request,
        ctx: Arc<Context>,
        listener: Arc<dyn Listener>,
    ) -> Result<Response> {
        listener.on_filters_end();

        // resolve the destination before any pool work
        let endpoint = match pool::Endpoint::from_uri(request.uri()) {
            Ok(endpoint) => endpoint,
            Err(err) => {
                listener.on_error(&err);
                return Err(err);
            }
        };
        let addr = match self.selector.select(request.uri(), &endpoint).await {
            Ok(addr) => addr,
            Err(err) => {
                listener.on_error(&err);
                return Err(err);
            }
        };
        log::trace!("{} resolved to {addr}", request.uri());

        // expose the chunk-writer promise before anything can fail the write
        if matches!(request.body(), Body::Chunked) {
            ctx.install_chunk_writer();
        }

        let pool = self.pools.pool_for(&endpoint);
        listener.on_connection_pool_attempt();
        let channel = match pool.acquire(addr).await {
            Ok(channel) => channel,
            Err(err) => {
                let err = normalize_acquire_error(err);
                listener.on_connection_pool_failed(&err);
                listener.on_error(&err);
                return Err(err);
            }
        };
        listener.on_connection_pool_acquired();

        let mut guard = AcquireGuard {
            pool: pool.clone(),
            channel: channel.clone(),
            armed: true,
        };

        listener.on_connection_attempt();
        if let Err(err) = channel.handshake().await {
            drop(guard);
            listener.on_error(&err);
            return Err(err);
        }

        // re-validate what the pool handed out
        if !channel.is_active() {
            channel.close();
            drop(guard);
            let err = Error::connection_inactive();
            listener.on_error(&err);
            return Err(err);
        }
        if !channel.is_writable() {
            drop(guard);
            let err = Error::write_buffer_full();
            listener.on_error(&err);
            return Err(err);
        }
        listener.on_connection_acquired();

        // effective version follows the installed protocol parts
        let version = match channel.proto() {
            Some(Proto::H2 { .. }) => Version::HTTP_2,
            Some(Proto::H1 { version, .. }) => *version,
            None => {
                drop(guard);
                let err = Error::connection_inactive();
                listener.on_error(&err);
                return Err(err);
            }
        };

        let mode = if channel.is_h2() {
            ReleaseOn::WriteDone
        } else {
            ReleaseOn::MessageEnd
        };
        let handle = TimeoutHandle::new(listener.clone(), channel.clone(), pool.clone(), mode);
        guard.armed = false; // the handle owns the release from here on

        let read_timeout = request
            .overrides()
            .read_timeout
            .unwrap_or(self.options.read_timeout);
        let head = self.build_head(&request, version);
        let registry = channel
            .registry()
            .expect("protocol parts carry a registry")
            .clone();

        let (head_tx, head_rx) = oneshot::channel();
        let response_handle = ResponseHandle::new(
            request.uri().clone(),
            head_tx,
            handle.clone(),
            ctx.clone(),
            self.options.max_content_length,
            request.method() == Method::HEAD,
        );
        let id = match registry.put(response_handle) {
            Ok(id) => id,
            Err(rejected) => {
                rejected.fail(Error::io("request id space exhausted"));
                return match head_rx.await {
                    Ok(result) => result,
                    Err(_) => Err(Error::io("request state lost")),
                };
            }
        };

        let mut cancel_guard = CancelGuard {
            registry: registry.clone(),
            id,
            done: false,
        };

        let env = WriteEnv {
            channel: channel.clone(),
            registry: registry.clone(),
            id,
            ctx: ctx.clone(),
        };
        handle.on_write_attempt();
        match writer::transmit(&env, head, request.into_body()).await {
            Ok(()) => {
                handle.on_write_done();
                self.arm_read_timeout(read_timeout, &handle, &registry, &channel, id);
            }
            Err(err) => {
                handle.on_write_failed(&err);
                let encode = err.is_encode();
                let partial = err.is_partial_write();
                let err = Arc::new(err);
                if let Some(promise) = ctx.chunk_writer() {
                    promise.fail(err.clone());
                }
                if !channel.is_h2() {
                    // the head may be half-written; the connection is dead
                    channel.close();
                }
                if let Some(rejected) = registry.remove(id) {
                    rejected.fail(if encode {
                        Error::encode(err)
                    } else if partial {
                        Error::write_partial(err)
                    } else {
                        Error::write(err)
                    });
                }
            }
        }

        let result = match head_rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::io("request state lost")),
        };
        cancel_guard.done = true;

        result.map(|response| {
            decoder::decode_response(response, self.options.use_decompress)
        })
    }

    fn build_head(&self, request: &Request, version: Version) -> RequestHead {
        let mut headers = request.headers().clone();
        let uri = if request
            .overrides()
            .uri_encode
            .unwrap_or(self.options.uri_encode)
        {
            util::encode_uri(request.uri())
        } else {
            request.uri().clone()
        };

        if version == Version::HTTP_2 {
            util::strip_connection_headers(&mut headers);
            headers.remove(header::HOST);
        } else {
            if !headers.contains_key(header::HOST) {
                if let Some(host) = util::authority_string(&uri) {
                    if let Ok(value) = HeaderValue::from_str(&host) {
                        headers.insert(header::HOST, value);
                    }
                }
            }
            // leave a caller-set connection value intact
            if !headers.contains_key(header::CONNECTION) {
                let value = if self.options.keep_alive {
                    HeaderValue::from_static("keep-alive")
                } else {
                    HeaderValue::from_static("close")
                };
                headers.insert(header::CONNECTION, value);
            }
        }

        if self.options.use_decompress && !headers.contains_key(header::ACCEPT_ENCODING) {
            headers.insert(
                header::ACCEPT_ENCODING,
                HeaderValue::from_static(self.options.decompression.accept_encoding()),
            );
        }

        RequestHead {
            method: request.method().clone(),
            uri,
            version,
            headers,
        }
    }

    fn arm_read_timeout(
        &self,
        timeout: Duration,
        handle: &Arc<TimeoutHandle>,
        registry: &Arc<HandleRegistry>,
        channel: &Arc<Channel>,
        id: u32,
    ) {
        let registry = registry.clone();
        let channel = channel.clone();
        let token = timer::global().schedule(
            timeout,
            Box::new(move || {
                // a missing id means the response was already delivered
                if let Some(stale) = registry.remove(id) {
                    log::debug!("read timeout fired for request {id} on channel {}", channel.id());
                    if !channel.is_h2() {
                        channel.close();
                    }
                    stale.fail(Error::read_timeout());
                }
            }),
        );
        handle.set_timeout(token);
    }
}

/// Maps pool-acquire failures at this single site: saturation passes
/// through, timeouts become connect failures, anything else is wrapped as a
/// generic acquire error.
fn normalize_acquire_error(err: Error) -> Error {
    if err.is_pool_exhausted() || err.is_connect() {
        err
    } else if err.is_timeout() {
        Error::connect(err)
    } else {
        Error::io(format!("error while acquiring channel: {err}"))
    }
}

/// Releases an acquired channel on drop until the `TimeoutHandle` takes
/// over ownership of the release decision.
struct AcquireGuard {
    pool: Arc<ChannelPool>,
    channel: Arc<Channel>,
    armed: bool,
}

impl Drop for AcquireGuard {
    fn drop(&mut self) {
        if self.armed {
            self.pool.release(&self.channel);
        }
    }
}

/// Cleans up a registered exchange when the response future is dropped
/// before completion: the registry entry is removed, the timer token
/// cancelled, and (HTTP/1) the connection closed rather than pooled.
struct CancelGuard {
    registry: Arc<HandleRegistry>,
    id: u32,
    done: bool,
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if let Some(stale) = self.registry.remove(self.id) {
            stale.fail(Error::cancelled());
        }
    }
}
