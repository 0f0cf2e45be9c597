use std::{fmt, path::PathBuf, time::Duration};

use bytes::Bytes;
use http::{header, HeaderMap, HeaderName, HeaderValue, Method, Uri};

use crate::{
    client::{Client, Pending},
    error::{Error, Result},
    multipart::Form,
    util,
};

/// A request which can be executed with `Client::execute()`.
///
/// The body variant doubles as the request's type tag: it selects which
/// writer serialises the request onto the wire.
#[derive(Debug)]
pub struct Request {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
    overrides: Overrides,
}

/// The request body variants.
#[derive(Clone, Debug, Default)]
pub enum Body {
    /// No body.
    #[default]
    Empty,
    /// A full in-memory body, written in one piece.
    Bytes(Bytes),
    /// A file streamed from disk in segments.
    File(PathBuf),
    /// A `multipart/form-data` body.
    Multipart(Form),
    /// `application/x-www-form-urlencoded` attributes, already serialised.
    Form(String),
    /// An open-ended body fed through a
    /// [`ChunkWriter`](crate::transceiver::ChunkWriter) after the head is
    /// sent.
    Chunked,
}

impl Body {
    #[allow(dead_code)]
    pub(crate) fn is_empty(&self) -> bool {
        matches!(self, Body::Empty)
    }
}

/// Per-request overrides of client-level configuration.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct Overrides {
    pub(crate) read_timeout: Option<Duration>,
    pub(crate) max_redirects: Option<usize>,
    pub(crate) expect_continue: Option<bool>,
    pub(crate) uri_encode: Option<bool>,
}

impl Request {
    /// Constructs a new request.
    #[inline]
    pub fn new(method: Method, uri: Uri) -> Self {
        Request {
            method,
            uri,
            headers: HeaderMap::new(),
            body: Body::Empty,
            overrides: Overrides::default(),
        }
    }

    /// Get the method.
    #[inline]
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Get a mutable reference to the method.
    #[inline]
    pub fn method_mut(&mut self) -> &mut Method {
        &mut self.method
    }

    /// Get the uri.
    #[inline]
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// Get a mutable reference to the uri.
    #[inline]
    pub fn uri_mut(&mut self) -> &mut Uri {
        &mut self.uri
    }

    /// Get the headers.
    #[inline]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Get a mutable reference to the headers.
    #[inline]
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Get the body.
    #[inline]
    pub fn body(&self) -> &Body {
        &self.body
    }

    /// Get a mutable reference to the body.
    #[inline]
    pub fn body_mut(&mut self) -> &mut Body {
        &mut self.body
    }

    pub(crate) fn into_body(self) -> Body {
        self.body
    }

    pub(crate) fn overrides(&self) -> &Overrides {
        &self.overrides
    }

    pub(crate) fn overrides_mut(&mut self) -> &mut Overrides {
        &mut self.overrides
    }

    /// Attempt to clone the request.
    ///
    /// `None` is returned if the body is a chunk stream, which cannot be
    /// replayed.
    pub fn try_clone(&self) -> Option<Request> {
        if matches!(self.body, Body::Chunked) {
            return None;
        }
        Some(Request {
            method: self.method.clone(),
            uri: self.uri.clone(),
            headers: self.headers.clone(),
            body: self.body.clone(),
            overrides: self.overrides,
        })
    }
}

/// A builder to construct the properties of a `Request`.
///
/// To construct a `RequestBuilder`, refer to the `Client` documentation.
#[must_use = "RequestBuilder does nothing until you 'send' it"]
pub struct RequestBuilder {
    client: Client,
    request: Result<Request>,
}

impl RequestBuilder {
    pub(crate) fn new(client: Client, request: Result<Request>) -> RequestBuilder {
        RequestBuilder { client, request }
    }

    /// Add a header to this request.
    pub fn header<K, V>(mut self, key: K, value: V) -> RequestBuilder
    where
        HeaderName: TryFrom<K>,
        <HeaderName as TryFrom<K>>::Error: Into<http::Error>,
        HeaderValue: TryFrom<V>,
        <HeaderValue as TryFrom<V>>::Error: Into<http::Error>,
    {
        let mut error = None;
        if let Ok(ref mut req) = self.request {
            match <HeaderName as TryFrom<K>>::try_from(key) {
                Ok(key) => match <HeaderValue as TryFrom<V>>::try_from(value) {
                    Ok(value) => {
                        req.headers_mut().append(key, value);
                    }
                    Err(e) => error = Some(Error::builder(e.into())),
                },
                Err(e) => error = Some(Error::builder(e.into())),
            }
        }
        if let Some(err) = error {
            self.request = Err(err);
        }
        self
    }

    /// Add a set of headers to the existing ones on this request.
    pub fn headers(mut self, headers: HeaderMap) -> RequestBuilder {
        if let Ok(ref mut req) = self.request {
            util::replace_headers(req.headers_mut(), headers);
        }
        self
    }

    /// Enable HTTP basic authentication.
    pub fn basic_auth<U, P>(self, username: U, password: Option<P>) -> RequestBuilder
    where
        U: fmt::Display,
        P: fmt::Display,
    {
        let header = util::basic_auth(username, password);
        self.header(header::AUTHORIZATION, header)
    }

    /// Set an in-memory request body.
    pub fn body<B: Into<Bytes>>(mut self, body: B) -> RequestBuilder {
        if let Ok(ref mut req) = self.request {
            *req.body_mut() = Body::Bytes(body.into());
        }
        self
    }

    /// Stream a file from disk as the request body.
    pub fn file(mut self, path: impl Into<PathBuf>) -> RequestBuilder {
        if let Ok(ref mut req) = self.request {
            *req.body_mut() = Body::File(path.into());
        }
        self
    }

    /// Send a `multipart/form-data` body.
    pub fn multipart(mut self, form: Form) -> RequestBuilder {
        if let Ok(ref mut req) = self.request {
            *req.body_mut() = Body::Multipart(form);
        }
        self
    }

    /// Send a form-urlencoded body serialised from `form`.
    ///
    /// Sets the `Content-Type: application/x-www-form-urlencoded` header.
    pub fn form<T: serde::Serialize + ?Sized>(mut self, form: &T) -> RequestBuilder {
        let mut error = None;
        if let Ok(ref mut req) = self.request {
            match serde_urlencoded::to_string(form) {
                Ok(encoded) => *req.body_mut() = Body::Form(encoded),
                Err(e) => error = Some(Error::builder(e)),
            }
        }
        if let Some(err) = error {
            self.request = Err(err);
        }
        self
    }

    /// Append one form attribute, switching the body to form-urlencoded.
    pub fn attr<K, V>(mut self, name: K, value: V) -> RequestBuilder
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut error = None;
        if let Ok(ref mut req) = self.request {
            match serde_urlencoded::to_string([(name.as_ref(), value.as_ref())]) {
                Ok(pair) => match req.body_mut() {
                    Body::Form(existing) if !existing.is_empty() => {
                        existing.push('&');
                        existing.push_str(&pair);
                    }
                    body => *body = Body::Form(pair),
                },
                Err(e) => error = Some(Error::builder(e)),
            }
        }
        if let Some(err) = error {
            self.request = Err(err);
        }
        self
    }

    /// Send a JSON body serialised from `json`.
    ///
    /// Sets the `Content-Type: application/json` header.
    pub fn json<T: serde::Serialize + ?Sized>(mut self, json: &T) -> RequestBuilder {
        let mut error = None;
        if let Ok(ref mut req) = self.request {
            match serde_json::to_vec(json) {
                Ok(body) => {
                    if !req.headers().contains_key(header::CONTENT_TYPE) {
                        req.headers_mut().insert(
                            header::CONTENT_TYPE,
                            HeaderValue::from_static("application/json"),
                        );
                    }
                    *req.body_mut() = Body::Bytes(body.into());
                }
                Err(e) => error = Some(Error::builder(e)),
            }
        }
        if let Some(err) = error {
            self.request = Err(err);
        }
        self
    }

    /// Send the body as an open-ended chunk stream: the head goes out
    /// immediately and bytes are fed through the request's
    /// [`ChunkWriter`](crate::transceiver::ChunkWriter).
    pub fn chunked(mut self) -> RequestBuilder {
        if let Ok(ref mut req) = self.request {
            *req.body_mut() = Body::Chunked;
        }
        self
    }

    /// Modify the query string, serialising `query` and appending it.
    pub fn query<T: serde::Serialize + ?Sized>(mut self, query: &T) -> RequestBuilder {
        let mut error = None;
        if let Ok(ref mut req) = self.request {
            match serde_urlencoded::to_string(query) {
                Ok(encoded) if !encoded.is_empty() => {
                    let uri = req.uri();
                    let path = uri.path();
                    let pq = match uri.query() {
                        Some(q) => format!("{path}?{q}&{encoded}"),
                        None => format!("{path}?{encoded}"),
                    };
                    let mut parts = uri.clone().into_parts();
                    match pq.parse::<http::uri::PathAndQuery>() {
                        Ok(pq) => {
                            parts.path_and_query = Some(pq);
                            match Uri::from_parts(parts) {
                                Ok(uri) => *req.uri_mut() = uri,
                                Err(e) => error = Some(Error::builder(e)),
                            }
                        }
                        Err(e) => error = Some(Error::builder(e)),
                    }
                }
                Ok(_) => {}
                Err(e) => error = Some(Error::builder(e)),
            }
        }
        if let Some(err) = error {
            self.request = Err(err);
        }
        self
    }

    /// Override the client-level read timeout for this request.
    pub fn read_timeout(mut self, timeout: Duration) -> RequestBuilder {
        if let Ok(ref mut req) = self.request {
            req.overrides_mut().read_timeout = Some(timeout);
        }
        self
    }

    /// Override the client-level redirect cap for this request.
    pub fn max_redirects(mut self, max: usize) -> RequestBuilder {
        if let Ok(ref mut req) = self.request {
            req.overrides_mut().max_redirects = Some(max);
        }
        self
    }

    /// Override expect-continue handling for this request.
    pub fn expect_continue(mut self, enabled: bool) -> RequestBuilder {
        if let Ok(ref mut req) = self.request {
            req.overrides_mut().expect_continue = Some(enabled);
        }
        self
    }

    /// Override percent-encoding of the request target for this request.
    pub fn uri_encode(mut self, enabled: bool) -> RequestBuilder {
        if let Ok(ref mut req) = self.request {
            req.overrides_mut().uri_encode = Some(enabled);
        }
        self
    }

    /// Build the `Request`.
    pub fn build(self) -> Result<Request> {
        self.request
    }

    /// Dispatch the request, returning a [`Pending`] response future.
    pub fn send(self) -> Pending {
        match self.request {
            Ok(req) => self.client.execute(req),
            Err(err) => Pending::error(err),
        }
    }
}

impl fmt::Debug for RequestBuilder {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut builder = f.debug_struct("RequestBuilder");
        match self.request {
            Ok(ref req) => builder
                .field("method", req.method())
                .field("uri", req.uri())
                .finish(),
            Err(ref err) => builder.field("error", err).finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunked_requests_are_not_cloneable() {
        let mut req = Request::new(Method::POST, Uri::from_static("http://a/b"));
        assert!(req.try_clone().is_some());
        *req.body_mut() = Body::Chunked;
        assert!(req.try_clone().is_none());
    }

    #[test]
    fn clone_preserves_overrides() {
        let mut req = Request::new(Method::GET, Uri::from_static("http://a/b"));
        req.overrides_mut().read_timeout = Some(Duration::from_secs(3));
        let clone = req.try_clone().unwrap();
        assert_eq!(clone.overrides().read_timeout, Some(Duration::from_secs(3)));
    }
}
