//! Request-scoped reporting sessions.
//!
//! A session is a [`sentry::Hub`] forked from the reporter's default hub.
//! Each request gets its own, so tags and extras set while serving one
//! request never leak into events of another. Sessions travel with the
//! request in its extensions as a [`RequestHub`].

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use sentry::Hub;
use tonic::service::Interceptor;
use tonic::{Request, Status};

/// Reporting session stored in request extensions.
///
/// Axum handlers can take it with `Extension<RequestHub>`.
#[derive(Clone)]
pub struct RequestHub(Arc<Hub>);

impl RequestHub {
    /// Fork a new session from `parent`, inheriting its client and scope.
    pub fn fork(parent: &Arc<Hub>) -> Self {
        Self(Arc::new(Hub::new_from_top(parent.clone())))
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.0
    }

    pub fn into_hub(self) -> Arc<Hub> {
        self.0
    }

    /// The session attached to a gRPC request, if any.
    pub fn from_grpc<T>(request: &Request<T>) -> Option<Arc<Hub>> {
        request
            .extensions()
            .get::<RequestHub>()
            .map(|session| session.0.clone())
    }

    /// The session attached to an HTTP request, if any.
    pub fn from_http<B>(request: &http::Request<B>) -> Option<Arc<Hub>> {
        request
            .extensions()
            .get::<RequestHub>()
            .map(|session| session.0.clone())
    }
}

impl Deref for RequestHub {
    type Target = Hub;

    fn deref(&self) -> &Hub {
        &self.0
    }
}

impl fmt::Debug for RequestHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestHub")
            .field("enabled", &self.0.client().is_some())
            .finish()
    }
}

/// Reuse the session on a gRPC request or attach a new one forked from
/// `default`.
pub(crate) fn ensure_grpc_session<T>(request: &mut Request<T>, default: &Arc<Hub>) -> Arc<Hub> {
    if let Some(hub) = RequestHub::from_grpc(request) {
        return hub;
    }
    let session = RequestHub::fork(default);
    let hub = session.hub().clone();
    request.extensions_mut().insert(session);
    hub
}

/// tonic interceptor that gives every incoming call its own session.
///
/// Install with `MyServer::with_interceptor(service, reporter.session_interceptor())`.
#[derive(Clone)]
pub struct SessionInterceptor {
    hub: Arc<Hub>,
}

impl SessionInterceptor {
    pub(crate) fn new(hub: Arc<Hub>) -> Self {
        Self { hub }
    }
}

impl Interceptor for SessionInterceptor {
    fn call(&mut self, mut request: Request<()>) -> Result<Request<()>, Status> {
        ensure_grpc_session(&mut request, &self.hub);
        Ok(request)
    }
}

impl fmt::Debug for SessionInterceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionInterceptor").finish_non_exhaustive()
    }
}
