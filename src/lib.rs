#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![cfg_attr(test, deny(warnings))]

//! # courier
//!
//! An asynchronous HTTP client that pools transport connections per
//! endpoint, multiplexes concurrent requests over HTTP/2 (including
//! cleartext prior-knowledge h2), and enforces per-request read timeouts.
//!
//! - Plain, [form](RequestBuilder::form), [JSON](RequestBuilder::json),
//!   [multipart], file, and [chunk-stream](RequestBuilder::chunked) bodies
//! - HTTP/1.0, HTTP/1.1 and HTTP/2 with TLS ALPN negotiation
//! - Per-endpoint connection pools with bounded wait queues
//! - `Expect: 100-continue` request deferral
//! - Redirect following and retry of safely-retryable failures
//! - An extensible chain of [interceptors](Interceptor) and
//!   request/response [filters](filter)
//!
//! ## Making requests
//!
//! ```rust,no_run
//! # async fn run() -> Result<(), courier::Error> {
//! let client = courier::Client::new();
//!
//! let body = client
//!     .get("http://httpbin.org/get")
//!     .send()
//!     .await?
//!     .text()
//!     .await?;
//!
//! println!("body = {body:?}");
//! # Ok(())
//! # }
//! ```
//!
//! **NOTE**: reuse a [`Client`] across requests — that is what makes
//! connection pooling work.
//!
//! ## Streaming a request body
//!
//! A chunk-stream request exposes a [`ChunkWriter`] once the head has been
//! handed to the transport:
//!
//! ```rust,no_run
//! # async fn run() -> Result<(), courier::Error> {
//! let client = courier::Client::new();
//! let pending = client.post("http://httpbin.org/post").chunked().send();
//!
//! // the promise resolves once the head has been written
//! let promise = pending.context().chunk_writer().expect("chunked request");
//! let response = tokio::spawn(pending);
//!
//! let writer = promise.get().await?;
//! writer.write("hello ").await?;
//! writer.write("world").await?;
//! writer.end().await?;
//!
//! let response = response.await.expect("task")?;
//! # drop(response);
//! # Ok(())
//! # }
//! ```

mod client;
mod config;
mod context;
mod decoder;
mod dns;
mod error;
pub mod filter;
mod interceptor;
mod listener;
pub mod multipart;
mod redirect;
mod request;
mod response;
mod retry;
mod transceiver;
mod util;

pub use http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, Version};

pub use self::{
    client::{Client, ClientBuilder, IntoUri, Pending},
    config::{
        ChannelPoolOptions, ChannelPoolOptionsProvider, Decompression, Http1Options,
        Http1OptionsBuilder, Http2Options, Http2OptionsBuilder, HttpVersion, NetOptions,
        NetOptionsBuilder, RetryOptions, SslOptions,
    },
    context::{ChunkWriterPromise, Context},
    dns::{Addrs, GaiResolver, IntoResolve, Name, Resolve, Resolving},
    error::{Error, Result},
    interceptor::{Interceptor, Next},
    listener::Listener,
    multipart::{Form, Part},
    request::{Body, Request, RequestBuilder},
    response::{Response, ResponseBody},
    transceiver::{ChunkWriter, Endpoint},
};
