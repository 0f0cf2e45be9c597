//! Retrying failed dispatch attempts.
//!
//! Only errors where no request byte beyond the head can have reached the
//! server are retried (see [`Error::is_retry_eligible`]); everything else
//! surfaces immediately. Requests whose body cannot be replayed are never
//! retried.

use std::sync::Arc;

use futures_util::future::BoxFuture;

use crate::{
    config::RetryOptions,
    context::Context,
    error::{Error, Result},
    interceptor::{Interceptor, Next},
    request::Request,
    response::Response,
};

pub(crate) struct RetryInterceptor {
    options: RetryOptions,
}

impl RetryInterceptor {
    pub(crate) fn new(options: RetryOptions) -> RetryInterceptor {
        RetryInterceptor { options }
    }
}

impl Interceptor for RetryInterceptor {
    fn proceed<'a>(
        &'a self,
        request: Request,
        ctx: &'a Arc<Context>,
        next: Next<'a>,
    ) -> BoxFuture<'a, Result<Response>> {
        Box::pin(async move {
            let mut current = request;
            let mut attempt = 0u32;
            loop {
                let replay = current.try_clone();
                match next.proceed(current, ctx).await {
                    Ok(response) => return Ok(response),
                    Err(err) => {
                        let Some(replay_req) = replay else {
                            return Err(err);
                        };
                        if attempt >= self.options.max_retries || !err.is_retry_eligible() {
                            return Err(err);
                        }
                        attempt += 1;
                        log::debug!(
                            "retrying request ({attempt}/{}) after: {err}",
                            self.options.max_retries
                        );
                        if let Some(backoff) = self.options.backoff {
                            tokio::time::sleep(backoff).await;
                        }
                        current = replay_req;
                    }
                }
            }
        })
    }
}
