//! The interceptor chain around the transceiver.
//!
//! Interceptors form an onion: each one sees the request on the way in and
//! the response (or error) on the way out, and may re-enter the rest of the
//! chain as often as it needs (retry, redirect). The innermost `proceed`
//! hands the request to the transceiver.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use http::{header, HeaderValue};

use crate::{
    context::Context,
    error::Result,
    listener::Listener,
    request::{Body, Request},
    response::Response,
    transceiver::Transceiver,
};

/// A link in the request-processing chain.
pub trait Interceptor: Send + Sync + 'static {
    /// Process `request`, delegating to `next` zero or more times.
    fn proceed<'a>(
        &'a self,
        request: Request,
        ctx: &'a Arc<Context>,
        next: Next<'a>,
    ) -> BoxFuture<'a, Result<Response>>;
}

/// The remainder of the chain after the current interceptor.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    chain: &'a [Arc<dyn Interceptor>],
    transceiver: &'a Transceiver,
    listener: &'a Arc<dyn Listener>,
}

impl std::fmt::Debug for Next<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Next")
            .field("remaining", &self.chain.len())
            .finish()
    }
}

impl<'a> Next<'a> {
    pub(crate) fn new(
        chain: &'a [Arc<dyn Interceptor>],
        transceiver: &'a Transceiver,
        listener: &'a Arc<dyn Listener>,
    ) -> Next<'a> {
        Next {
            chain,
            transceiver,
            listener,
        }
    }

    /// Run the rest of the chain on `request`.
    pub fn proceed(
        mut self,
        request: Request,
        ctx: &'a Arc<Context>,
    ) -> BoxFuture<'a, Result<Response>> {
        match self.chain.split_first() {
            Some((head, rest)) => {
                self.chain = rest;
                head.proceed(request, ctx, self)
            }
            None => {
                let transceiver = self.transceiver;
                let ctx = ctx.clone();
                let listener = self.listener.clone();
                Box::pin(async move { transceiver.send(request, ctx, listener).await })
            }
        }
    }
}

/// Turns on expect-continue semantics for requests with a deferrable body:
/// the writer sends only the head and parks the body behind the context's
/// resumption callback.
pub(crate) struct ExpectContinueInterceptor {
    default: bool,
}

impl ExpectContinueInterceptor {
    pub(crate) fn new(default: bool) -> ExpectContinueInterceptor {
        ExpectContinueInterceptor { default }
    }
}

impl Interceptor for ExpectContinueInterceptor {
    fn proceed<'a>(
        &'a self,
        mut request: Request,
        ctx: &'a Arc<Context>,
        next: Next<'a>,
    ) -> BoxFuture<'a, Result<Response>> {
        let enabled = request.overrides().expect_continue.unwrap_or(self.default);
        let has_body = !matches!(request.body(), Body::Empty | Body::Chunked);
        if enabled && has_body {
            if !request.headers().contains_key(header::EXPECT) {
                request
                    .headers_mut()
                    .insert(header::EXPECT, HeaderValue::from_static("100-continue"));
            }
            ctx.set_expect_continue(true);
        }
        next.proceed(request, ctx)
    }
}
