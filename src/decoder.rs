//! Transparent response body decompression.

use std::io;

use async_compression::tokio::bufread::{GzipDecoder, ZlibDecoder};
use futures_util::{StreamExt, TryStreamExt};
use http::header;
use tokio_util::io::{ReaderStream, StreamReader};

use crate::{
    error::Error,
    response::{Response, ResponseBody},
};

/// Swap the body for a decoding stream when the response is compressed and
/// decompression is enabled. The `Content-Encoding` and `Content-Length`
/// headers are removed alongside, since they no longer describe the bytes
/// the caller will see.
pub(crate) fn decode_response(mut response: Response, enabled: bool) -> Response {
    if !enabled {
        return response;
    }

    let encoding = response
        .headers()
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_ascii_lowercase());
    let encoding = match encoding.as_deref() {
        Some("gzip") => Coding::Gzip,
        Some("deflate") => Coding::Deflate,
        _ => return response,
    };
    log::trace!("decoding {encoding:?} response body");

    let body = std::mem::replace(response.body_mut(), ResponseBody::empty());
    let raw = StreamReader::new(body.map_err(io::Error::other));

    let decoded = match encoding {
        Coding::Gzip => ResponseBody::boxed(
            ReaderStream::new(GzipDecoder::new(raw)).map(|item| item.map_err(Error::decode)),
        ),
        Coding::Deflate => ResponseBody::boxed(
            ReaderStream::new(ZlibDecoder::new(raw)).map(|item| item.map_err(Error::decode)),
        ),
    };
    *response.body_mut() = decoded;
    response.headers_mut().remove(header::CONTENT_ENCODING);
    response.headers_mut().remove(header::CONTENT_LENGTH);
    response
}

#[derive(Debug)]
enum Coding {
    Gzip,
    Deflate,
}
