use std::{
    fmt,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::{Bytes, BytesMut};
use futures_core::Stream;
use futures_util::StreamExt;
use http::{header, HeaderMap, StatusCode, Uri, Version};
use tokio::sync::mpsc;

use crate::error::{Error, Result};

/// A response to a dispatched request.
pub struct Response {
    status: StatusCode,
    version: Version,
    headers: HeaderMap,
    uri: Uri,
    body: ResponseBody,
}

impl Response {
    pub(crate) fn new(
        status: StatusCode,
        version: Version,
        headers: HeaderMap,
        uri: Uri,
        body: ResponseBody,
    ) -> Response {
        Response {
            status,
            version,
            headers,
            uri,
            body,
        }
    }

    /// Get the `StatusCode` of this `Response`.
    #[inline]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Get the HTTP `Version` of this `Response`.
    #[inline]
    pub fn version(&self) -> Version {
        self.version
    }

    /// Get the `Headers` of this `Response`.
    #[inline]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Get a mutable reference to the `Headers` of this `Response`.
    #[inline]
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Get the final `Uri` of this `Response`.
    #[inline]
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// Get the content length, if it is known from the headers.
    ///
    /// Reasons it may not be known: chunked transfer encoding, or the body
    /// was transparently decompressed.
    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(header::CONTENT_LENGTH)?
            .to_str()
            .ok()?
            .parse()
            .ok()
    }

    /// Stream one chunk of the response body.
    ///
    /// Returns `None` when the body has been fully received.
    pub async fn chunk(&mut self) -> Result<Option<Bytes>> {
        self.body.next().await.transpose()
    }

    /// Aggregate the full response body as `Bytes`.
    pub async fn bytes(mut self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.body.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }

    /// Aggregate the full response body as UTF-8 text (lossy).
    pub async fn text(self) -> Result<String> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Deserialize the response body as JSON.
    pub async fn json<T: serde::de::DeserializeOwned>(self) -> Result<T> {
        let bytes = self.bytes().await?;
        serde_json::from_slice(&bytes).map_err(Error::decode)
    }

    /// Turn the response into a stream of body chunks.
    pub fn into_body(self) -> ResponseBody {
        self.body
    }

    pub(crate) fn body_mut(&mut self) -> &mut ResponseBody {
        &mut self.body
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Response")
            .field("uri", &self.uri)
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish()
    }
}

/// Streamed response body.
pub struct ResponseBody {
    inner: BodyInner,
}

enum BodyInner {
    Channel(mpsc::UnboundedReceiver<Result<Bytes>>),
    Boxed(Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>),
}

impl ResponseBody {
    pub(crate) fn channel() -> (mpsc::UnboundedSender<Result<Bytes>>, ResponseBody) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            tx,
            ResponseBody {
                inner: BodyInner::Channel(rx),
            },
        )
    }

    pub(crate) fn empty() -> ResponseBody {
        let (_, body) = ResponseBody::channel();
        body
    }

    pub(crate) fn boxed<S>(stream: S) -> ResponseBody
    where
        S: Stream<Item = Result<Bytes>> + Send + 'static,
    {
        ResponseBody {
            inner: BodyInner::Boxed(Box::pin(stream)),
        }
    }
}

impl Stream for ResponseBody {
    type Item = Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match &mut self.get_mut().inner {
            BodyInner::Channel(rx) => rx.poll_recv(cx),
            BodyInner::Boxed(s) => s.as_mut().poll_next(cx),
        }
    }
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ResponseBody").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn aggregates_channel_body() {
        let (tx, body) = ResponseBody::channel();
        tx.send(Ok(Bytes::from_static(b"hello "))).unwrap();
        tx.send(Ok(Bytes::from_static(b"world"))).unwrap();
        drop(tx);

        let resp = Response::new(
            StatusCode::OK,
            Version::HTTP_11,
            HeaderMap::new(),
            Uri::from_static("http://127.0.0.1/"),
            body,
        );
        assert_eq!(resp.text().await.unwrap(), "hello world");
    }

    #[tokio::test]
    async fn body_error_propagates() {
        let (tx, body) = ResponseBody::channel();
        tx.send(Ok(Bytes::from_static(b"partial"))).unwrap();
        tx.send(Err(Error::read_timeout())).unwrap();
        drop(tx);

        let resp = Response::new(
            StatusCode::OK,
            Version::HTTP_11,
            HeaderMap::new(),
            Uri::from_static("http://127.0.0.1/"),
            body,
        );
        let err = resp.bytes().await.unwrap_err();
        assert!(err.is_read_timeout());
    }
}
