//! HTTP/1.x wire handling: request head encoding, response parsing, and the
//! per-connection reader task.

use std::sync::{Arc, Weak};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Version};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::{
    channel::Channel,
    pool::ChannelPool,
    registry::{HandleRegistry, ResponseHandle, H1_REQUEST_ID},
};
use crate::{
    config::Http1Options,
    error::{Error, Result},
};

const MAX_HEADERS: usize = 100;
const READ_BUF_SIZE: usize = 8 * 1024;

// ===== request encoding =====

/// Serialise the request head in origin-form.
pub(crate) fn encode_head(
    method: &Method,
    target: &str,
    version: Version,
    headers: &HeaderMap,
) -> BytesMut {
    let version = match version {
        Version::HTTP_10 => "HTTP/1.0",
        _ => "HTTP/1.1",
    };
    let mut buf = BytesMut::with_capacity(256);
    buf.put_slice(method.as_str().as_bytes());
    buf.put_u8(b' ');
    buf.put_slice(target.as_bytes());
    buf.put_u8(b' ');
    buf.put_slice(version.as_bytes());
    buf.put_slice(b"\r\n");
    for (name, value) in headers {
        buf.put_slice(name.as_str().as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(value.as_bytes());
        buf.put_slice(b"\r\n");
    }
    buf.put_slice(b"\r\n");
    buf
}

/// One chunk of a `Transfer-Encoding: chunked` body.
pub(crate) fn chunk_frame(data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(data.len() + 16);
    buf.put_slice(format!("{:x}\r\n", data.len()).as_bytes());
    buf.put_slice(data);
    buf.put_slice(b"\r\n");
    buf.freeze()
}

pub(crate) const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

// ===== response decoding =====

#[derive(Debug)]
struct Head {
    status: StatusCode,
    version: Version,
    headers: HeaderMap,
}

enum Framing {
    /// HEAD responses, 204, 304.
    None,
    Length(u64),
    Chunked,
    /// Body runs until the server closes the connection.
    Eof,
}

/// Reads responses off one HTTP/1 connection until it dies, routing each
/// message to the registered handle. On exit the channel is closed and
/// anything still registered is failed.
pub(crate) async fn reader_task<R>(
    mut read: R,
    channel: Arc<Channel>,
    registry: Arc<HandleRegistry>,
    pool: Weak<ChannelPool>,
    opts: Http1Options,
) where
    R: AsyncRead + Send + Unpin,
{
    let shutdown = channel.closed_token();
    let result = tokio::select! {
        res = read_loop(&mut read, &registry, &opts) => res,
        _ = shutdown.cancelled() => Ok(()),
    };
    if let Err(err) = result {
        log::debug!("h1 reader for channel {} exited: {err}", channel.id());
    }
    channel.close();
    registry.clear(Error::connection_inactive);
    if let Some(pool) = pool.upgrade() {
        pool.on_channel_closed(&channel);
    }
}

async fn read_loop<R>(
    read: &mut R,
    registry: &HandleRegistry,
    opts: &Http1Options,
) -> Result<()>
where
    R: AsyncRead + Send + Unpin,
{
    let mut buf = BytesMut::with_capacity(READ_BUF_SIZE);
    loop {
        let head = loop {
            if let Some(head) = parse_head(&mut buf, opts)? {
                break head;
            }
            if read.read_buf(&mut buf).await.map_err(Error::io)? == 0 {
                if buf.is_empty() && registry.len() == 0 {
                    // idle connection closed by the peer
                    return Ok(());
                }
                return Err(Error::io("connection closed mid-response"));
            }
        };

        if head.status == StatusCode::CONTINUE {
            registry.fire_continue(H1_REQUEST_ID);
            continue;
        }
        if head.status.is_informational() {
            continue;
        }

        let Some(handle) = registry.remove(H1_REQUEST_ID) else {
            return Err(Error::decode("response received without an in-flight request"));
        };

        let close = wants_close(&head);
        let ended = serve_exchange(read, &mut buf, handle, head).await?;
        if close || !ended {
            return Ok(());
        }
    }
}

/// Deliver one response to its handle. Returns `Ok(true)` when the message
/// ended with the connection still usable, `Ok(false)` when the body ran to
/// EOF.
async fn serve_exchange<R>(
    read: &mut R,
    buf: &mut BytesMut,
    mut handle: ResponseHandle,
    head: Head,
) -> Result<bool>
where
    R: AsyncRead + Send + Unpin,
{
    let framing = match decide_framing(&head, handle.is_head_request()) {
        Ok(framing) => framing,
        Err(err) => {
            handle.fail(err);
            return Err(Error::decode("unintelligible response framing"));
        }
    };
    handle.receive_head(head.status, head.version, head.headers);

    let result = match framing {
        Framing::None => Ok(true),
        Framing::Length(len) => read_sized(read, buf, &mut handle, len).await.map(|_| true),
        Framing::Chunked => read_chunked(read, buf, &mut handle).await.map(|_| true),
        Framing::Eof => read_to_eof(read, buf, &mut handle).await.map(|_| false),
    };
    match result {
        Ok(reusable) => {
            handle.complete();
            Ok(reusable)
        }
        Err(err) => {
            handle.fail(err);
            Err(Error::io("response body aborted"))
        }
    }
}

fn parse_head(buf: &mut BytesMut, opts: &Http1Options) -> Result<Option<Head>> {
    let (len, code, minor, raw_headers) = {
        let mut storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut response = httparse::Response::new(&mut storage);
        match response.parse(&buf[..]) {
            Ok(httparse::Status::Complete(len)) => {
                let code = response.code.expect("complete response has a code");
                let minor = response.version.expect("complete response has a version");
                let raw: Vec<(HeaderName, HeaderValue)> = response
                    .headers
                    .iter()
                    .map(|h| {
                        let name = HeaderName::from_bytes(h.name.as_bytes())
                            .map_err(Error::decode)?;
                        let value =
                            HeaderValue::from_bytes(h.value).map_err(Error::decode)?;
                        Ok((name, value))
                    })
                    .collect::<Result<_>>()?;
                (len, code, minor, raw)
            }
            Ok(httparse::Status::Partial) => {
                if buf.len() > opts.max_header_size + opts.max_initial_line_length {
                    return Err(Error::decode("response head exceeds configured limits"));
                }
                return Ok(None);
            }
            Err(err) => return Err(Error::decode(err)),
        }
    };
    buf.advance(len);

    let mut headers = HeaderMap::with_capacity(raw_headers.len());
    for (name, value) in raw_headers {
        headers.append(name, value);
    }
    Ok(Some(Head {
        status: StatusCode::from_u16(code).map_err(Error::decode)?,
        version: if minor == 0 {
            Version::HTTP_10
        } else {
            Version::HTTP_11
        },
        headers,
    }))
}

fn decide_framing(head: &Head, head_request: bool) -> Result<Framing> {
    if head_request
        || head.status == StatusCode::NO_CONTENT
        || head.status == StatusCode::NOT_MODIFIED
    {
        return Ok(Framing::None);
    }
    if let Some(te) = head.headers.get(header::TRANSFER_ENCODING) {
        let te = te.to_str().map_err(Error::decode)?;
        if te
            .split(',')
            .any(|v| v.trim().eq_ignore_ascii_case("chunked"))
        {
            return Ok(Framing::Chunked);
        }
    }
    if let Some(len) = head.headers.get(header::CONTENT_LENGTH) {
        let len = len
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .ok_or_else(|| Error::decode("invalid content-length"))?;
        return Ok(if len == 0 {
            Framing::None
        } else {
            Framing::Length(len)
        });
    }
    Ok(Framing::Eof)
}

fn wants_close(head: &Head) -> bool {
    let connection = head
        .headers
        .get(header::CONNECTION)
        .and_then(|v| v.to_str().ok());
    match connection {
        Some(v) if v.eq_ignore_ascii_case("close") => true,
        Some(v) if v.eq_ignore_ascii_case("keep-alive") => false,
        _ => head.version == Version::HTTP_10,
    }
}

async fn fill<R>(read: &mut R, buf: &mut BytesMut) -> Result<()>
where
    R: AsyncRead + Send + Unpin,
{
    if read.read_buf(buf).await.map_err(Error::io)? == 0 {
        return Err(Error::io("connection closed mid-body"));
    }
    Ok(())
}

async fn read_sized<R>(
    read: &mut R,
    buf: &mut BytesMut,
    handle: &mut ResponseHandle,
    len: u64,
) -> Result<()>
where
    R: AsyncRead + Send + Unpin,
{
    let mut remaining = len;
    while remaining > 0 {
        if buf.is_empty() {
            fill(read, buf).await?;
        }
        let take = remaining.min(buf.len() as u64) as usize;
        handle.receive_data(buf.split_to(take).freeze())?;
        remaining -= take as u64;
    }
    Ok(())
}

async fn read_to_eof<R>(
    read: &mut R,
    buf: &mut BytesMut,
    handle: &mut ResponseHandle,
) -> Result<()>
where
    R: AsyncRead + Send + Unpin,
{
    loop {
        if !buf.is_empty() {
            let chunk = buf.split().freeze();
            handle.receive_data(chunk)?;
        }
        if read.read_buf(buf).await.map_err(Error::io)? == 0 {
            return Ok(());
        }
    }
}

async fn read_chunked<R>(
    read: &mut R,
    buf: &mut BytesMut,
    handle: &mut ResponseHandle,
) -> Result<()>
where
    R: AsyncRead + Send + Unpin,
{
    loop {
        let line = read_line(read, buf).await?;
        let size = parse_chunk_size(&line)?;
        if size == 0 {
            // trailer section, terminated by an empty line
            loop {
                let trailer = read_line(read, buf).await?;
                if trailer.is_empty() {
                    return Ok(());
                }
            }
        }
        let mut remaining = size;
        while remaining > 0 {
            if buf.is_empty() {
                fill(read, buf).await?;
            }
            let take = remaining.min(buf.len() as u64) as usize;
            handle.receive_data(buf.split_to(take).freeze())?;
            remaining -= take as u64;
        }
        let crlf = read_line(read, buf).await?;
        if !crlf.is_empty() {
            return Err(Error::decode("chunk not terminated by CRLF"));
        }
    }
}

/// Read up to the next CRLF, returning the line without it.
async fn read_line<R>(read: &mut R, buf: &mut BytesMut) -> Result<Bytes>
where
    R: AsyncRead + Send + Unpin,
{
    loop {
        if let Some(pos) = buf.windows(2).position(|w| w == b"\r\n") {
            let line = buf.split_to(pos).freeze();
            buf.advance(2);
            return Ok(line);
        }
        if buf.len() > READ_BUF_SIZE {
            return Err(Error::decode("chunk size line too long"));
        }
        fill(read, buf).await?;
    }
}

fn parse_chunk_size(line: &[u8]) -> Result<u64> {
    let digits = match line.iter().position(|b| *b == b';') {
        Some(pos) => &line[..pos],
        None => line,
    };
    let digits = std::str::from_utf8(digits)
        .map_err(Error::decode)?
        .trim();
    u64::from_str_radix(digits, 16).map_err(Error::decode)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> Http1Options {
        Http1Options::default()
    }

    #[test]
    fn parses_complete_head() {
        let mut buf = BytesMut::from(
            &b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nX-A: 1\r\n\r\nhello"[..],
        );
        let head = parse_head(&mut buf, &options()).unwrap().unwrap();
        assert_eq!(head.status, StatusCode::OK);
        assert_eq!(head.version, Version::HTTP_11);
        assert_eq!(head.headers.len(), 2);
        // the body bytes stay in the buffer
        assert_eq!(&buf[..], b"hello");
    }

    #[test]
    fn partial_head_asks_for_more() {
        let mut buf = BytesMut::from(&b"HTTP/1.1 200 OK\r\nContent-"[..]);
        assert!(parse_head(&mut buf, &options()).unwrap().is_none());
    }

    #[test]
    fn oversized_head_is_rejected() {
        let mut huge = BytesMut::from(&b"HTTP/1.1 200 OK\r\n"[..]);
        huge.extend_from_slice("X-Pad: ".as_bytes());
        huge.extend_from_slice(&vec![b'a'; 64 * 1024]);
        let err = parse_head(&mut huge, &options()).unwrap_err();
        assert!(err.is_decode());
    }

    #[test]
    fn chunk_size_parsing() {
        assert_eq!(parse_chunk_size(b"1f").unwrap(), 31);
        assert_eq!(parse_chunk_size(b"0").unwrap(), 0);
        assert_eq!(parse_chunk_size(b"a;ext=1").unwrap(), 10);
        assert!(parse_chunk_size(b"zz").is_err());
    }

    #[test]
    fn head_encoding_is_wire_exact() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("127.0.0.1"));
        let head = encode_head(&Method::POST, "/abc", Version::HTTP_11, &headers);
        assert_eq!(&head[..], b"POST /abc HTTP/1.1\r\nhost: 127.0.0.1\r\n\r\n");
    }

    #[test]
    fn chunk_frames() {
        assert_eq!(&chunk_frame(b"hello")[..], b"5\r\nhello\r\n");
        assert_eq!(LAST_CHUNK, b"0\r\n\r\n");
    }

    #[test]
    fn close_semantics() {
        let head = |version, conn: Option<&'static str>| {
            let mut headers = HeaderMap::new();
            if let Some(v) = conn {
                headers.insert(header::CONNECTION, HeaderValue::from_static(v));
            }
            Head {
                status: StatusCode::OK,
                version,
                headers,
            }
        };
        assert!(wants_close(&head(Version::HTTP_10, None)));
        assert!(!wants_close(&head(Version::HTTP_10, Some("keep-alive"))));
        assert!(!wants_close(&head(Version::HTTP_11, None)));
        assert!(wants_close(&head(Version::HTTP_11, Some("close"))));
    }
}
