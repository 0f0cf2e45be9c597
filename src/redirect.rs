//! Redirect following.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use http::{header, Method, StatusCode, Uri};

use crate::{
    context::Context,
    error::{Error, Result},
    interceptor::{Interceptor, Next},
    request::{Body, Request},
    response::Response,
};

#[derive(Debug)]
struct TooManyRedirects;

impl std::fmt::Display for TooManyRedirects {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("too many redirects")
    }
}

impl std::error::Error for TooManyRedirects {}

/// Follows `3xx` responses up to a per-client (or per-request) hop cap.
///
/// `303 See Other` — and `301`/`302` for non-GET/HEAD methods — downgrade
/// to a body-less GET; `307`/`308` replay the request as-is. Requests whose
/// body cannot be replayed stop at the first redirect. Credentials are
/// stripped when the redirect leaves the original host.
pub(crate) struct RedirectInterceptor {
    default_max: usize,
}

impl RedirectInterceptor {
    pub(crate) fn new(default_max: usize) -> RedirectInterceptor {
        RedirectInterceptor { default_max }
    }
}

impl Interceptor for RedirectInterceptor {
    fn proceed<'a>(
        &'a self,
        request: Request,
        ctx: &'a Arc<Context>,
        next: Next<'a>,
    ) -> BoxFuture<'a, Result<Response>> {
        Box::pin(async move {
            let max = request.overrides().max_redirects.unwrap_or(self.default_max);
            let mut current = request;
            let mut followed = 0usize;
            loop {
                let replay = current.try_clone();
                let base = current.uri().clone();
                let response = next.proceed(current, ctx).await?;

                if !is_redirect(response.status()) {
                    return Ok(response);
                }
                let Some(location) = response
                    .headers()
                    .get(header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_owned)
                else {
                    return Ok(response);
                };
                let Some(mut next_request) = replay else {
                    // body cannot be replayed, surface the redirect as-is
                    return Ok(response);
                };
                if followed >= max {
                    return Err(Error::redirect(TooManyRedirects, base));
                }

                let target = resolve_location(&base, &location)
                    .map_err(|e| Error::redirect(e, base.clone()))?;
                log::debug!("redirecting ({}) to {target}", response.status());

                if downgrades_to_get(response.status(), next_request.method()) {
                    *next_request.method_mut() = Method::GET;
                    *next_request.body_mut() = Body::Empty;
                    for name in [
                        header::CONTENT_TYPE,
                        header::CONTENT_LENGTH,
                        header::CONTENT_ENCODING,
                        header::TRANSFER_ENCODING,
                    ] {
                        next_request.headers_mut().remove(name);
                    }
                }
                if base.host() != target.host() {
                    for name in [
                        header::AUTHORIZATION,
                        header::PROXY_AUTHORIZATION,
                        header::COOKIE,
                    ] {
                        next_request.headers_mut().remove(name);
                    }
                }
                *next_request.uri_mut() = target;
                // the previous hop chose the host; recompute it next write
                next_request.headers_mut().remove(header::HOST);

                current = next_request;
                followed += 1;
            }
        })
    }
}

fn is_redirect(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT
    )
}

fn downgrades_to_get(status: StatusCode, method: &Method) -> bool {
    match status {
        StatusCode::SEE_OTHER => true,
        StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND => {
            method != Method::GET && method != Method::HEAD
        }
        _ => false,
    }
}

/// Resolve a `Location` value against the URI it came from.
fn resolve_location(base: &Uri, location: &str) -> std::result::Result<Uri, http::Error> {
    let location: Uri = location.parse()?;
    if location.scheme().is_some() {
        return Ok(location);
    }
    // relative reference: keep the base scheme and authority
    let mut parts = base.clone().into_parts();
    parts.path_and_query = Some(match location.path_and_query() {
        Some(pq) if location.path().starts_with('/') => pq.clone(),
        Some(pq) => {
            // path-relative: resolve against the base directory
            let dir = match base.path().rfind('/') {
                Some(idx) => &base.path()[..=idx],
                None => "/",
            };
            format!("{dir}{pq}").parse()?
        }
        None => "/".parse()?,
    });
    Ok(Uri::from_parts(parts)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absolute_location_wins() {
        let base: Uri = "http://a.example/x".parse().unwrap();
        let target = resolve_location(&base, "http://b.example/y").unwrap();
        assert_eq!(target.to_string(), "http://b.example/y");
    }

    #[test]
    fn relative_location_keeps_authority() {
        let base: Uri = "http://a.example/x/y?q=1".parse().unwrap();
        let target = resolve_location(&base, "/z").unwrap();
        assert_eq!(target.to_string(), "http://a.example/z");

        let target = resolve_location(&base, "sibling").unwrap();
        assert_eq!(target.to_string(), "http://a.example/x/sibling");
    }

    #[test]
    fn downgrade_rules() {
        assert!(downgrades_to_get(StatusCode::SEE_OTHER, &Method::GET));
        assert!(downgrades_to_get(StatusCode::FOUND, &Method::POST));
        assert!(!downgrades_to_get(StatusCode::FOUND, &Method::GET));
        assert!(!downgrades_to_get(StatusCode::TEMPORARY_REDIRECT, &Method::POST));
    }
}
