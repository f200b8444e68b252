//! Error and panic reporting for tonic handlers.
//!
//! tonic's own `Interceptor` only sees request metadata, so the unary and
//! stream interceptors here are called from the service implementation
//! around the handler body:
//!
//! ```ignore
//! async fn publish(&self, request: Request<PublishRequest>) -> Result<Response<PublishResponse>, Status> {
//!     self.unary.intercept(request, |request| handle_publish(&self.state, request)).await
//! }
//! ```
//!
//! Both reuse the session attached by [`SessionInterceptor`] when present
//! and attach a fresh one otherwise.
//!
//! [`RecoveryLayer`] covers every method of a server at once:
//!
//! ```ignore
//! Server::builder()
//!     .layer(reporter.grpc_layer())
//!     .add_service(PublishServer::new(service))
//!     .serve(addr)
//!     .await?;
//! ```
//!
//! It attaches the session and recovers panics. Error statuses travel in
//! response trailers, out of its reach, so reporting them still goes through
//! the interceptors.
//!
//! [`SessionInterceptor`]: crate::session::SessionInterceptor

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use futures::Stream;
use sentry::Hub;
use thiserror::Error;
use tonic::body::BoxBody;
use tonic::{Code, Request, Response, Status};
use tower::{Layer, Service};

use crate::error::{ReportableError, Tags};
use crate::recover::{call_bound, guarded, Recovered};
use crate::reporter::report;
use crate::session::{ensure_grpc_session, RequestHub};

/// Which handler errors are reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportOn {
    Always,
    Never,
    /// Report only statuses with one of these codes.
    Codes(Vec<Code>),
}

impl ReportOn {
    pub fn should_report(&self, status: &Status) -> bool {
        match self {
            Self::Always => true,
            Self::Never => false,
            Self::Codes(codes) => codes.contains(&status.code()),
        }
    }
}

impl Default for ReportOn {
    /// Server-side faults only; client mistakes are not reported.
    fn default() -> Self {
        Self::Codes(vec![
            Code::Unknown,
            Code::Internal,
            Code::Unimplemented,
            Code::Unavailable,
            Code::DataLoss,
        ])
    }
}

/// Interceptor configuration.
#[derive(Debug, Clone, Default)]
pub struct InterceptorOptions {
    /// Re-raise a recovered panic after reporting it.
    pub repanic: bool,
    pub report_on: ReportOn,
}

impl InterceptorOptions {
    #[must_use]
    pub fn with_repanic(mut self, repanic: bool) -> Self {
        self.repanic = repanic;
        self
    }

    #[must_use]
    pub fn with_report_on(mut self, report_on: ReportOn) -> Self {
        self.report_on = report_on;
        self
    }
}

/// Failure of an intercepted call.
#[derive(Debug)]
pub enum CallFailure {
    /// The handler returned an error status.
    Status(Status),
    /// The handler panicked; the panic has been reported.
    Panicked(Recovered),
}

impl From<CallFailure> for Status {
    fn from(failure: CallFailure) -> Self {
        match failure {
            CallFailure::Status(status) => status,
            CallFailure::Panicked(recovered) => Status::internal(recovered.message()),
        }
    }
}

/// Reportable view of a handler's error [`Status`].
///
/// Carries the message and code only. Status details and metadata are
/// never sent.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct StatusError {
    code: Code,
    message: String,
}

impl StatusError {
    pub fn code(&self) -> Code {
        self.code
    }
}

impl From<&Status> for StatusError {
    fn from(status: &Status) -> Self {
        Self {
            code: status.code(),
            message: status.message().to_owned(),
        }
    }
}

impl ReportableError for StatusError {
    fn tags(&self) -> Tags {
        Tags::from([("grpc.code".to_owned(), format!("{:?}", self.code))])
    }
}

/// Reports panics and error statuses of unary handlers.
#[derive(Clone)]
pub struct UnaryInterceptor {
    hub: Arc<Hub>,
    options: InterceptorOptions,
}

impl UnaryInterceptor {
    pub(crate) fn new(hub: Arc<Hub>, options: InterceptorOptions) -> Self {
        Self { hub, options }
    }

    pub fn options(&self) -> &InterceptorOptions {
        &self.options
    }

    /// Run `handler`, returning the wire-level result.
    ///
    /// A recovered panic becomes `Status::internal` carrying the panic
    /// message, unless `repanic` is set.
    pub async fn intercept<Req, Res, F, Fut>(
        &self,
        request: Request<Req>,
        handler: F,
    ) -> Result<Response<Res>, Status>
    where
        F: FnOnce(Request<Req>) -> Fut,
        Fut: Future<Output = Result<Response<Res>, Status>>,
    {
        self.intercept_outcome(request, handler)
            .await
            .map_err(Status::from)
    }

    /// Run `handler`, keeping a recovered panic distinct from an error status.
    pub async fn intercept_outcome<Req, Res, F, Fut>(
        &self,
        mut request: Request<Req>,
        handler: F,
    ) -> Result<Response<Res>, CallFailure>
    where
        F: FnOnce(Request<Req>) -> Fut,
        Fut: Future<Output = Result<Response<Res>, Status>>,
    {
        let hub = ensure_grpc_session(&mut request, &self.hub);
        finish(hub, &self.options, async move { handler(request).await }).await
    }
}

impl fmt::Debug for UnaryInterceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnaryInterceptor")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Reports panics and error statuses of streaming handlers.
#[derive(Clone)]
pub struct StreamInterceptor {
    hub: Arc<Hub>,
    options: InterceptorOptions,
}

impl StreamInterceptor {
    pub(crate) fn new(hub: Arc<Hub>, options: InterceptorOptions) -> Self {
        Self { hub, options }
    }

    pub fn options(&self) -> &InterceptorOptions {
        &self.options
    }

    /// Run a streaming `handler` with its inbound stream wrapped in a
    /// [`SessionStream`].
    pub async fn intercept<S, Res, F, Fut>(
        &self,
        request: Request<S>,
        handler: F,
    ) -> Result<Response<Res>, Status>
    where
        F: FnOnce(Request<SessionStream<S>>) -> Fut,
        Fut: Future<Output = Result<Response<Res>, Status>>,
    {
        self.intercept_outcome(request, handler)
            .await
            .map_err(Status::from)
    }

    pub async fn intercept_outcome<S, Res, F, Fut>(
        &self,
        mut request: Request<S>,
        handler: F,
    ) -> Result<Response<Res>, CallFailure>
    where
        F: FnOnce(Request<SessionStream<S>>) -> Fut,
        Fut: Future<Output = Result<Response<Res>, Status>>,
    {
        let hub = ensure_grpc_session(&mut request, &self.hub);
        let session = hub.clone();
        let request = request.map(move |inner| SessionStream { inner, hub: session });
        finish(hub, &self.options, async move { handler(request).await }).await
    }
}

impl fmt::Debug for StreamInterceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamInterceptor")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

async fn finish<T, Fut>(
    hub: Arc<Hub>,
    options: &InterceptorOptions,
    call: Fut,
) -> Result<T, CallFailure>
where
    Fut: Future<Output = Result<T, Status>>,
{
    match guarded(hub.clone(), call).await {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(status)) => {
            if options.report_on.should_report(&status) {
                report(&hub, &StatusError::from(&status));
            }
            Err(CallFailure::Status(status))
        }
        Err(recovered) if options.repanic => recovered.resume(),
        Err(recovered) => Err(CallFailure::Panicked(recovered)),
    }
}

/// Inbound stream of a call, together with the call's session.
pub struct SessionStream<S> {
    inner: S,
    hub: Arc<Hub>,
}

impl<S> SessionStream<S> {
    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: Stream + Unpin> Stream for SessionStream<S> {
    type Item = S::Item;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl<S> fmt::Debug for SessionStream<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionStream").finish_non_exhaustive()
    }
}

/// tower layer for `tonic::transport::Server::builder().layer(..)`.
#[derive(Clone)]
pub struct RecoveryLayer {
    hub: Arc<Hub>,
    repanic: bool,
}

impl RecoveryLayer {
    pub(crate) fn new(hub: Arc<Hub>, repanic: bool) -> Self {
        Self { hub, repanic }
    }
}

impl<S> Layer<S> for RecoveryLayer {
    type Service = RecoveryService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RecoveryService {
            inner,
            hub: self.hub.clone(),
            repanic: self.repanic,
        }
    }
}

/// Gives each gRPC call a session and answers a panic with `INTERNAL`.
#[derive(Clone)]
pub struct RecoveryService<S> {
    inner: S,
    hub: Arc<Hub>,
    repanic: bool,
}

impl<S, B> Service<http::Request<B>> for RecoveryService<S>
where
    S: Service<http::Request<B>, Response = http::Response<BoxBody>> + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
{
    type Response = http::Response<BoxBody>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, S::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: http::Request<B>) -> Self::Future {
        // tonic copies these extensions onto the handler's `Request`.
        let hub = match RequestHub::from_http(&request) {
            Some(hub) => hub,
            None => {
                let session = RequestHub::fork(&self.hub);
                let hub = session.hub().clone();
                request.extensions_mut().insert(session);
                hub
            }
        };

        let fut = call_bound(&hub, &mut self.inner, request);
        let repanic = self.repanic;
        Box::pin(async move {
            match guarded(hub, fut).await {
                Ok(result) => result,
                Err(recovered) if repanic => recovered.resume(),
                Err(recovered) => Ok(status_response(&Status::internal(recovered.message()))),
            }
        })
    }
}

impl<S> fmt::Debug for RecoveryService<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryService")
            .field("repanic", &self.repanic)
            .finish_non_exhaustive()
    }
}

/// Trailers-only gRPC response carrying `status`.
fn status_response(status: &Status) -> http::Response<BoxBody> {
    let mut response = http::Response::new(tonic::body::empty_body());
    let headers = response.headers_mut();
    headers.insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("application/grpc"),
    );
    if let Err(e) = status.add_header(headers) {
        tracing::warn!(error = %e.message(), "Could not encode gRPC status headers");
    }
    response
}
