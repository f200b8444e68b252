//! Panic reporting for axum / tower HTTP handlers.
//!
//! Provides:
//! - [`ReportingLayer`] / [`ReportingService`]: tower middleware
//! - `Reporter::handle_func`: wraps a `Fn(Request) -> impl Future` handler
//! - `Reporter::handle_route`: wraps a handler that takes path parameters
//!
//! With an enabled reporter every request is served with its own session
//! (see [`RequestHub`]) carrying the request method and URL. A panic in the
//! handler is reported, then re-raised or answered with a 500 depending on
//! [`HttpOptions::repanic`]. A disabled reporter calls straight through.

use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::extract::rejection::PathRejection;
use axum::extract::{FromRequestParts, Path, Request};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures::future::BoxFuture;
use sentry::protocol::Event;
use sentry::Hub;
use tower::{Layer, Service};

use crate::recover::{call_bound, guarded};
use crate::reporter::Reporter;
use crate::session::RequestHub;

/// Path parameters of a matched route, by name.
pub type PathParams = HashMap<String, String>;

/// Behavior of the HTTP wrappers of an enabled reporter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpOptions {
    /// Re-raise a recovered panic after reporting it instead of answering 500.
    pub repanic: bool,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self { repanic: true }
    }
}

#[derive(Clone)]
struct Guard {
    hub: Arc<Hub>,
    options: HttpOptions,
}

/// tower layer applying [`ReportingService`].
#[derive(Clone)]
pub struct ReportingLayer {
    guard: Option<Guard>,
}

impl<S> Layer<S> for ReportingLayer {
    type Service = ReportingService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ReportingService {
            inner,
            guard: self.guard.clone(),
        }
    }
}

/// Middleware reporting panics of the wrapped service.
#[derive(Clone)]
pub struct ReportingService<S> {
    inner: S,
    guard: Option<Guard>,
}

impl<S> ReportingService<S> {
    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S, B> Service<http::Request<B>> for ReportingService<S>
where
    S: Service<http::Request<B>, Response = Response> + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Response, S::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: http::Request<B>) -> Self::Future {
        let Some(guard) = self.guard.clone() else {
            return Box::pin(self.inner.call(request));
        };

        let session = RequestHub::fork(&guard.hub);
        let hub = session.hub().clone();
        let details = request_details(&request);
        hub.configure_scope(|scope| {
            scope.add_event_processor(move |mut event: Event<'static>| {
                if event.request.is_none() {
                    event.request = Some(details.clone());
                }
                Some(event)
            });
        });
        request.extensions_mut().insert(session);

        let fut = call_bound(&hub, &mut self.inner, request);
        Box::pin(async move {
            match guarded(hub, fut).await {
                Ok(result) => result,
                Err(recovered) if guard.options.repanic => recovered.resume(),
                Err(_) => Ok(StatusCode::INTERNAL_SERVER_ERROR.into_response()),
            }
        })
    }
}

fn request_details<B>(request: &http::Request<B>) -> sentry::protocol::Request {
    let uri = request.uri();
    let url = if uri.scheme().is_some() {
        uri.to_string()
    } else {
        let host = request
            .headers()
            .get(http::header::HOST)
            .and_then(|h| h.to_str().ok())
            .unwrap_or("localhost");
        format!("http://{host}{uri}")
    };

    sentry::protocol::Request {
        url: url.parse().ok(),
        method: Some(request.method().to_string()),
        query_string: uri.query().map(str::to_owned),
        ..Default::default()
    }
}

/// Service adapter for a `Fn(Request) -> impl Future` handler.
#[derive(Clone)]
pub struct HandlerFn<H> {
    handler: H,
}

impl<H, Fut, R> Service<Request> for HandlerFn<H>
where
    H: Fn(Request) -> Fut,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoResponse,
{
    type Response = Response;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Response, Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request) -> Self::Future {
        let fut = (self.handler)(request);
        Box::pin(async move { Ok(fut.await.into_response()) })
    }
}

/// Service adapter for a `Fn(PathParams, Request) -> impl Future` handler.
#[derive(Clone)]
pub struct RouteFn<H> {
    handler: H,
}

impl<H, Fut, R> Service<Request> for RouteFn<H>
where
    H: Fn(PathParams, Request) -> Fut + Clone + Send + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoResponse,
{
    type Response = Response;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Response, Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request) -> Self::Future {
        let handler = self.handler.clone();
        Box::pin(async move {
            let (mut parts, body) = request.into_parts();
            let params = match Path::<PathParams>::from_request_parts(&mut parts, &()).await {
                Ok(Path(params)) => params,
                // Mounted outside a router, or on a route without parameters.
                Err(PathRejection::MissingPathParams(_)) => PathParams::new(),
                Err(rejection) => return Ok(rejection.into_response()),
            };
            Ok(handler(params, Request::from_parts(parts, body))
                .await
                .into_response())
        })
    }
}

impl Reporter {
    /// Reporting middleware as a tower layer, for `Router::layer`.
    pub fn layer(&self) -> ReportingLayer {
        ReportingLayer {
            guard: self.http_options().map(|options| Guard {
                hub: self.hub().clone(),
                options,
            }),
        }
    }

    /// Like [`Reporter::layer`] with explicit options.
    pub fn layer_with(&self, options: HttpOptions) -> ReportingLayer {
        ReportingLayer {
            guard: self.http_options().map(|_| Guard {
                hub: self.hub().clone(),
                options,
            }),
        }
    }

    /// Wrap `next` so panics while serving are reported.
    pub fn middleware<S>(&self, next: S) -> ReportingService<S> {
        self.layer().layer(next)
    }

    /// Wrap a plain handler function.
    ///
    /// Mount the result with `Router::route_service`.
    pub fn handle_func<H, Fut, R>(&self, handler: H) -> ReportingService<HandlerFn<H>>
    where
        H: Fn(Request) -> Fut + Clone + Send + 'static,
        Fut: Future<Output = R> + Send + 'static,
        R: IntoResponse,
    {
        self.middleware(HandlerFn { handler })
    }

    /// Wrap a handler that receives the matched path parameters.
    pub fn handle_route<H, Fut, R>(&self, handler: H) -> ReportingService<RouteFn<H>>
    where
        H: Fn(PathParams, Request) -> Fut + Clone + Send + 'static,
        Fut: Future<Output = R> + Send + 'static,
        R: IntoResponse,
    {
        self.middleware(RouteFn { handler })
    }
}
