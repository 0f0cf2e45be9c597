//! Request and response filters.
//!
//! Filters are cheap hooks that mutate the request before it leaves the
//! client, or the response before the caller sees it. They run inside the
//! interceptor chain at the `Filtering` slot; registering a filter replaces
//! that slot with a fresh [`FilteringExec`], so downstream code can detect
//! reconfiguration by identity.

use std::sync::Arc;

use futures_util::future::BoxFuture;

use crate::{
    context::Context,
    error::Result,
    interceptor::{Interceptor, Next},
    request::Request,
    response::Response,
};

/// Mutates outgoing requests.
pub trait RequestFilter: Send + Sync + 'static {
    /// Inspect or rewrite `request` before it is dispatched.
    fn on_request(&self, request: &mut Request, ctx: &Context) -> Result<()>;
}

/// Mutates incoming responses.
pub trait ResponseFilter: Send + Sync + 'static {
    /// Inspect or rewrite `response` before it reaches the caller.
    fn on_response(&self, response: &mut Response, ctx: &Context) -> Result<()>;
}

/// The `Filtering` interceptor: applies every request filter in
/// registration order, runs the rest of the chain, then applies every
/// response filter.
pub(crate) struct FilteringExec {
    request_filters: Vec<Arc<dyn RequestFilter>>,
    response_filters: Vec<Arc<dyn ResponseFilter>>,
}

impl FilteringExec {
    pub(crate) fn new(
        request_filters: Vec<Arc<dyn RequestFilter>>,
        response_filters: Vec<Arc<dyn ResponseFilter>>,
    ) -> FilteringExec {
        FilteringExec {
            request_filters,
            response_filters,
        }
    }
}

impl Interceptor for FilteringExec {
    fn proceed<'a>(
        &'a self,
        mut request: Request,
        ctx: &'a Arc<Context>,
        next: Next<'a>,
    ) -> BoxFuture<'a, Result<Response>> {
        Box::pin(async move {
            for filter in &self.request_filters {
                filter.on_request(&mut request, ctx)?;
            }
            let mut response = next.proceed(request, ctx).await?;
            for filter in &self.response_filters {
                filter.on_response(&mut response, ctx)?;
            }
            Ok(response)
        })
    }
}
