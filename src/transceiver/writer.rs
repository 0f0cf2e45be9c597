//! Request writers: serialise each body variant onto a connection.
//!
//! Every writer resolves once the last byte it is responsible for has been
//! handed to the transport's outbound buffer. Under expect-continue only
//! the head goes out; the body is parked behind an idempotent resumption
//! callback published through the request context.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures_util::future;
use http::{header, HeaderMap, HeaderValue, Method, Uri, Version};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::{
    channel::{Channel, Proto, WriteHalf},
    h1,
    h2 as h2_glue,
    registry::HandleRegistry,
};
use crate::{
    context::Context,
    error::{Error, Result},
    multipart::{Form, Payload},
    request::Body,
};

const FILE_SEGMENT: usize = 8 * 1024;

/// Everything a writer needs besides the request itself.
pub(crate) struct WriteEnv {
    pub(crate) channel: Arc<Channel>,
    pub(crate) registry: Arc<HandleRegistry>,
    pub(crate) id: u32,
    pub(crate) ctx: Arc<Context>,
}

/// The request head as it goes on the wire.
pub(crate) struct RequestHead {
    pub(crate) method: Method,
    pub(crate) uri: Uri,
    pub(crate) version: Version,
    pub(crate) headers: HeaderMap,
}

/// Serialise `body` according to its variant. Returns once the write this
/// variant is responsible for has been buffered.
pub(crate) async fn transmit(env: &WriteEnv, mut head: RequestHead, body: Body) -> Result<()> {
    let expect_continue = env.ctx.expect_continue_enabled() && deferrable(&body);
    match env.channel.proto() {
        Some(Proto::H1 { write, .. }) => {
            let plan = build_plan(body, &mut head.headers, true).await?;
            h1_transmit(env, write.clone(), head, plan, expect_continue).await
        }
        Some(Proto::H2 { send, .. }) => {
            let plan = build_plan(body, &mut head.headers, false).await?;
            h2_transmit(env, send, head, plan, expect_continue).await
        }
        None => Err(Error::connection_inactive()),
    }
}

/// Chunk streams are producer-driven and cannot be parked behind a
/// 100-continue signal; everything else can.
fn deferrable(body: &Body) -> bool {
    !matches!(body, Body::Empty | Body::Chunked)
}

// ===== body plans =====

enum Plan {
    Empty,
    /// Plain and form bodies: one buffer, written in a single piece.
    Buffer(Bytes),
    File {
        file: tokio::fs::File,
        len: u64,
    },
    Multipart(Vec<Piece>),
    Chunked,
}

enum Piece {
    Bytes(Bytes),
    File {
        file: tokio::fs::File,
        len: u64,
    },
}

/// Open every file and fix the framing headers before a single byte is
/// written, so encoding problems surface with nothing on the wire.
async fn build_plan(body: Body, headers: &mut HeaderMap, h1: bool) -> Result<Plan> {
    match body {
        Body::Empty => Ok(Plan::Empty),
        Body::Bytes(bytes) => {
            if !headers.contains_key(header::CONTENT_LENGTH) {
                headers.insert(header::CONTENT_LENGTH, content_length(bytes.len() as u64));
            }
            Ok(Plan::Buffer(bytes))
        }
        Body::Form(encoded) => {
            if !headers.contains_key(header::CONTENT_TYPE) {
                headers.insert(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("application/x-www-form-urlencoded"),
                );
            }
            let bytes = Bytes::from(encoded);
            headers.insert(header::CONTENT_LENGTH, content_length(bytes.len() as u64));
            Ok(Plan::Buffer(bytes))
        }
        Body::File(path) => {
            let file = tokio::fs::File::open(&path).await.map_err(Error::encode)?;
            let len = file.metadata().await.map_err(Error::encode)?.len();
            headers.insert(header::CONTENT_LENGTH, content_length(len));
            Ok(Plan::File { file, len })
        }
        Body::Multipart(form) => {
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_str(&form.content_type()).map_err(Error::encode)?,
            );
            if h1 {
                headers.insert(
                    header::TRANSFER_ENCODING,
                    HeaderValue::from_static("chunked"),
                );
            }
            Ok(Plan::Multipart(multipart_pieces(&form).await?))
        }
        Body::Chunked => {
            if h1 {
                headers.insert(
                    header::TRANSFER_ENCODING,
                    HeaderValue::from_static("chunked"),
                );
            }
            Ok(Plan::Chunked)
        }
    }
}

async fn multipart_pieces(form: &Form) -> Result<Vec<Piece>> {
    let mut pieces = Vec::new();
    for part in form.parts() {
        pieces.push(Piece::Bytes(Bytes::from(form.part_head(part))));
        match &part.payload {
            Payload::Bytes(bytes) => pieces.push(Piece::Bytes(bytes.clone())),
            Payload::File(path) => {
                let file = tokio::fs::File::open(path).await.map_err(Error::encode)?;
                let len = file.metadata().await.map_err(Error::encode)?.len();
                pieces.push(Piece::File { file, len });
            }
        }
        pieces.push(Piece::Bytes(Bytes::from_static(b"\r\n")));
    }
    pieces.push(Piece::Bytes(Bytes::from(form.closing())));
    Ok(pieces)
}

fn content_length(len: u64) -> HeaderValue {
    HeaderValue::from_str(&len.to_string()).expect("integer is a valid header value")
}

// ===== HTTP/1 =====

type SharedWrite = Arc<tokio::sync::Mutex<WriteHalf>>;

async fn h1_transmit(
    env: &WriteEnv,
    write: SharedWrite,
    head: RequestHead,
    plan: Plan,
    expect_continue: bool,
) -> Result<()> {
    let channel = &env.channel;
    let target = origin_form(&head.uri);
    let head_bytes = h1::encode_head(&head.method, &target, head.version, &head.headers);
    let chunked = matches!(plan, Plan::Multipart(_) | Plan::Chunked);

    if expect_continue {
        // park first: the interim response can arrive the moment the head
        // is on the wire
        park_continuation(
            env,
            Deferred::H1 {
                channel: channel.clone(),
                write: write.clone(),
                plan,
                chunked,
            },
        );
        write_all(channel, &write, head_bytes.freeze()).await?;
        return Ok(());
    }

    match plan {
        Plan::Empty => write_all(channel, &write, head_bytes.freeze()).await,
        Plan::Buffer(body) => {
            // single headers+body write; a failure may have flushed body
            // bytes already, so it is not replayable
            let mut combined = head_bytes;
            combined.extend_from_slice(&body);
            write_all(channel, &write, combined.freeze())
                .await
                .map_err(Error::into_partial_write)
        }
        Plan::Chunked => {
            write_all(channel, &write, head_bytes.freeze()).await?;
            let writer = ChunkWriter::h1(channel.clone(), write);
            if let Some(promise) = env.ctx.chunk_writer() {
                promise.fulfill(writer);
            }
            Ok(())
        }
        plan => {
            write_all(channel, &write, head_bytes.freeze()).await?;
            h1_send_plan(channel, &write, plan, chunked)
                .await
                .map_err(Error::into_partial_write)
        }
    }
}

fn origin_form(uri: &Uri) -> String {
    match uri.path_and_query() {
        Some(pq) => pq.as_str().to_string(),
        None => "/".to_string(),
    }
}

/// Write and flush, accounting the bytes against the channel's outbound
/// high-water mark for the duration.
async fn write_all(channel: &Channel, write: &SharedWrite, data: Bytes) -> Result<()> {
    let _reservation = channel.reserve_outbound(data.len());
    let mut w = write.lock().await;
    w.write_all(&data).await.map_err(Error::write)?;
    w.flush().await.map_err(Error::write)
}

async fn h1_send_plan(
    channel: &Channel,
    write: &SharedWrite,
    plan: Plan,
    chunked: bool,
) -> Result<()> {
    match plan {
        Plan::Empty | Plan::Chunked => Ok(()),
        Plan::Buffer(body) => {
            if chunked {
                write_all(channel, write, h1::chunk_frame(&body)).await?;
                write_all(channel, write, Bytes::from_static(h1::LAST_CHUNK)).await
            } else {
                write_all(channel, write, body).await
            }
        }
        Plan::File { file, len } => {
            h1_send_file(channel, write, file, len, chunked).await?;
            if chunked {
                write_all(channel, write, Bytes::from_static(h1::LAST_CHUNK)).await?;
            }
            Ok(())
        }
        Plan::Multipart(pieces) => {
            for piece in pieces {
                match piece {
                    Piece::Bytes(bytes) => {
                        let framed = if chunked {
                            h1::chunk_frame(&bytes)
                        } else {
                            bytes
                        };
                        write_all(channel, write, framed).await?;
                    }
                    Piece::File { file, len } => {
                        h1_send_file(channel, write, file, len, chunked).await?;
                    }
                }
            }
            if chunked {
                write_all(channel, write, Bytes::from_static(h1::LAST_CHUNK)).await?;
            }
            Ok(())
        }
    }
}

async fn h1_send_file(
    channel: &Channel,
    write: &SharedWrite,
    mut file: tokio::fs::File,
    len: u64,
    chunked: bool,
) -> Result<()> {
    let mut remaining = len;
    let mut buf = [0u8; FILE_SEGMENT];
    while remaining > 0 {
        let n = file.read(&mut buf).await.map_err(Error::encode)?;
        if n == 0 {
            return Err(Error::encode("file truncated while streaming"));
        }
        let data = Bytes::copy_from_slice(&buf[..n]);
        let framed = if chunked { h1::chunk_frame(&data) } else { data };
        write_all(channel, write, framed).await?;
        remaining = remaining.saturating_sub(n as u64);
    }
    Ok(())
}

// ===== HTTP/2 =====

async fn h2_transmit(
    env: &WriteEnv,
    send: &tokio::sync::Mutex<h2::client::SendRequest<Bytes>>,
    head: RequestHead,
    plan: Plan,
    expect_continue: bool,
) -> Result<()> {
    let mut request = http::Request::builder()
        .method(head.method)
        .uri(head.uri)
        .version(Version::HTTP_2);
    if let Some(headers) = request.headers_mut() {
        *headers = head.headers;
    }
    let request = request.body(()).map_err(Error::write)?;

    let end_stream = matches!(plan, Plan::Empty) && !expect_continue;
    let (response, mut stream) = {
        let mut send = send.lock().await;
        future::poll_fn(|cx| send.poll_ready(cx))
            .await
            .map_err(Error::write)?;
        send.send_request(request, end_stream).map_err(Error::write)?
    };
    h2_glue::spawn_response_task(response, env.registry.clone(), env.id);

    if expect_continue {
        park_continuation(
            env,
            Deferred::H2 {
                channel: env.channel.clone(),
                stream,
                plan,
            },
        );
        return Ok(());
    }

    match plan {
        Plan::Empty => Ok(()),
        Plan::Chunked => {
            let writer = ChunkWriter::h2(env.channel.clone(), stream);
            if let Some(promise) = env.ctx.chunk_writer() {
                promise.fulfill(writer);
            }
            Ok(())
        }
        plan => h2_send_plan(&env.channel, &mut stream, plan)
            .await
            .map_err(Error::into_partial_write),
    }
}

async fn h2_send_plan(
    channel: &Channel,
    stream: &mut h2::SendStream<Bytes>,
    plan: Plan,
) -> Result<()> {
    match plan {
        Plan::Empty | Plan::Chunked => h2_glue::finish(stream),
        Plan::Buffer(body) => h2_glue::send_data(channel, stream, body, true).await,
        Plan::File { file, len } => {
            h2_send_file(channel, stream, file, len).await?;
            h2_glue::finish(stream)
        }
        Plan::Multipart(pieces) => {
            for piece in pieces {
                match piece {
                    Piece::Bytes(bytes) => {
                        h2_glue::send_data(channel, stream, bytes, false).await?
                    }
                    Piece::File { file, len } => {
                        h2_send_file(channel, stream, file, len).await?
                    }
                }
            }
            h2_glue::finish(stream)
        }
    }
}

async fn h2_send_file(
    channel: &Channel,
    stream: &mut h2::SendStream<Bytes>,
    mut file: tokio::fs::File,
    len: u64,
) -> Result<()> {
    let mut remaining = len;
    let mut buf = [0u8; FILE_SEGMENT];
    while remaining > 0 {
        let n = file.read(&mut buf).await.map_err(Error::encode)?;
        if n == 0 {
            return Err(Error::encode("file truncated while streaming"));
        }
        h2_glue::send_data(channel, stream, Bytes::copy_from_slice(&buf[..n]), false).await?;
        remaining = remaining.saturating_sub(n as u64);
    }
    Ok(())
}

// ===== expect-continue deferral =====

enum Deferred {
    H1 {
        channel: Arc<Channel>,
        write: SharedWrite,
        plan: Plan,
        chunked: bool,
    },
    H2 {
        channel: Arc<Channel>,
        stream: h2::SendStream<Bytes>,
        plan: Plan,
    },
}

impl Deferred {
    async fn send(self) -> Result<()> {
        let result = match self {
            Deferred::H1 {
                channel,
                write,
                plan,
                chunked,
            } => h1_send_plan(&channel, &write, plan, chunked).await,
            Deferred::H2 {
                channel,
                mut stream,
                plan,
            } => h2_send_plan(&channel, &mut stream, plan).await,
        };
        // the deferred send is all body; any failure is past the head
        result.map_err(Error::into_partial_write)
    }
}

/// Park the deferred body behind a callback in the context. Only the first
/// invocation sends; an exchange already finalised (the registry no longer
/// knows the id) discards the body instead.
fn park_continuation(env: &WriteEnv, deferred: Deferred) {
    let state = Arc::new(Mutex::new(Some(deferred)));
    let registry = env.registry.clone();
    let channel = env.channel.clone();
    let id = env.id;
    env.ctx.set_continue_callback(Arc::new(move || {
        let Some(deferred) = state.lock().unwrap().take() else {
            return;
        };
        if !registry.contains(id) {
            return;
        }
        let registry = registry.clone();
        let channel = channel.clone();
        tokio::spawn(async move {
            if let Err(err) = deferred.send().await {
                if let Some(handle) = registry.remove(id) {
                    if !channel.is_h2() {
                        channel.close();
                    }
                    handle.fail(err);
                }
            }
        });
    }));
}

// ===== chunk writer =====

/// Handle for incrementally producing a request body after the head has
/// been emitted.
#[derive(Clone)]
pub struct ChunkWriter {
    inner: Arc<ChunkSink>,
}

enum ChunkSink {
    H1 {
        channel: Arc<Channel>,
        write: SharedWrite,
        done: std::sync::atomic::AtomicBool,
    },
    H2 {
        channel: Arc<Channel>,
        stream: tokio::sync::Mutex<h2::SendStream<Bytes>>,
        done: std::sync::atomic::AtomicBool,
    },
}

impl ChunkWriter {
    fn h1(channel: Arc<Channel>, write: SharedWrite) -> ChunkWriter {
        ChunkWriter {
            inner: Arc::new(ChunkSink::H1 {
                channel,
                write,
                done: std::sync::atomic::AtomicBool::new(false),
            }),
        }
    }

    fn h2(channel: Arc<Channel>, stream: h2::SendStream<Bytes>) -> ChunkWriter {
        ChunkWriter {
            inner: Arc::new(ChunkSink::H2 {
                channel,
                stream: tokio::sync::Mutex::new(stream),
                done: std::sync::atomic::AtomicBool::new(false),
            }),
        }
    }

    /// Send one body chunk.
    pub async fn write(&self, data: impl Into<Bytes>) -> Result<()> {
        use std::sync::atomic::Ordering;
        let data = data.into();
        let result = match &*self.inner {
            ChunkSink::H1 {
                channel,
                write,
                done,
            } => {
                if done.load(Ordering::Acquire) {
                    return Err(Error::write("chunk stream already ended"));
                }
                if data.is_empty() {
                    return Ok(());
                }
                write_all(channel, write, h1::chunk_frame(&data)).await
            }
            ChunkSink::H2 {
                channel,
                stream,
                done,
            } => {
                if done.load(Ordering::Acquire) {
                    return Err(Error::write("chunk stream already ended"));
                }
                let mut stream = stream.lock().await;
                h2_glue::send_data(channel, &mut stream, data, false).await
            }
        };
        result.map_err(Error::into_partial_write)
    }

    /// Finish the body. Further writes fail; repeat `end` calls are no-ops.
    pub async fn end(&self) -> Result<()> {
        use std::sync::atomic::Ordering;
        let result = match &*self.inner {
            ChunkSink::H1 {
                channel,
                write,
                done,
            } => {
                if done.swap(true, Ordering::AcqRel) {
                    return Ok(());
                }
                write_all(channel, write, Bytes::from_static(h1::LAST_CHUNK)).await
            }
            ChunkSink::H2 { stream, done, .. } => {
                if done.swap(true, Ordering::AcqRel) {
                    return Ok(());
                }
                let mut stream = stream.lock().await;
                h2_glue::finish(&mut stream)
            }
        };
        result.map_err(Error::into_partial_write)
    }
}

impl std::fmt::Debug for ChunkWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkWriter").finish()
    }
}
