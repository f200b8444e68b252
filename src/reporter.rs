//! The error reporter.
//!
//! A [`Reporter`] is built once at startup and cloned into everything that
//! reports: HTTP routers, gRPC services, background tasks. It is either
//! enabled (it owns a Sentry client) or disabled, and that never changes
//! afterwards. A disabled reporter still logs every error locally and still
//! wraps handlers, so callers never need to branch on it.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use sentry::types::Uuid;
use sentry::{Client, Hub, Scope};

use crate::config::ReporterConfig;
use crate::error::ReportableError;
use crate::grpc::{InterceptorOptions, RecoveryLayer, StreamInterceptor, UnaryInterceptor};
use crate::http::HttpOptions;
use crate::session::SessionInterceptor;

/// Identifier of a transmitted event. Empty when nothing was sent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct EventId(Option<Uuid>);

impl EventId {
    pub fn empty() -> Self {
        Self(None)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }

    pub fn uuid(&self) -> Option<Uuid> {
        self.0
    }
}

impl From<Uuid> for EventId {
    /// Sentry returns the nil uuid for dropped events.
    fn from(uuid: Uuid) -> Self {
        if uuid.is_nil() {
            Self(None)
        } else {
            Self(Some(uuid))
        }
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(uuid) => write!(f, "{}", uuid.simple()),
            None => Ok(()),
        }
    }
}

/// Initialize a reporter from the environment.
///
/// `release` overrides `SENTRY_RELEASE` when non-empty. Never fails: an
/// unusable configuration produces a disabled reporter and a warning.
pub fn init_reporter(release: Option<&str>) -> Reporter {
    match ReporterConfig::from_env() {
        Ok(config) => Reporter::new(config.with_release(release)),
        Err(e) => {
            tracing::warn!(error = %e, "Could not read sentry settings, error reporting is disabled");
            Reporter::disabled()
        }
    }
}

/// Shared handle to the error-tracking backend.
#[derive(Clone)]
pub struct Reporter {
    inner: Arc<Inner>,
}

struct Inner {
    client: Option<Arc<Client>>,
    hub: Arc<Hub>,
    http: Option<HttpOptions>,
}

impl Reporter {
    /// Build a reporter using Sentry's default HTTP transport.
    pub fn new(config: ReporterConfig) -> Self {
        Self::build(config.normalized(), None)
    }

    /// Build a reporter that sends events through `transport`.
    pub fn with_transport(
        config: ReporterConfig,
        transport: Arc<dyn sentry::TransportFactory>,
    ) -> Self {
        Self::build(config.normalized(), Some(transport))
    }

    /// A reporter that only logs locally.
    pub fn disabled() -> Self {
        Self::from_client(None)
    }

    fn build(
        config: ReporterConfig,
        transport: Option<Arc<dyn sentry::TransportFactory>>,
    ) -> Self {
        let dsn = match config.parsed_dsn() {
            Ok(Some(dsn)) => dsn,
            Ok(None) => {
                tracing::warn!("No sentry DSN configured, error reporting is disabled");
                return Self::disabled();
            }
            Err(e) => {
                tracing::warn!(error = %e, "Could not initialize sentry, error reporting is disabled");
                return Self::disabled();
            }
        };

        let mut options = config.client_options(dsn);
        options.transport = Some(
            transport.unwrap_or_else(|| Arc::new(sentry::transports::DefaultTransportFactory)),
        );

        let client = Arc::new(Client::from(options));
        if !client.is_enabled() {
            tracing::warn!("Sentry client rejected its options, error reporting is disabled");
            return Self::disabled();
        }

        tracing::info!(
            release = config.release.as_deref().unwrap_or_default(),
            environment = config.environment.as_deref().unwrap_or_default(),
            sample_rate = config.sample_rate,
            tracing = config.enable_tracing,
            "Sentry error reporting initialized"
        );
        Self::from_client(Some(client))
    }

    fn from_client(client: Option<Arc<Client>>) -> Self {
        let hub = Arc::new(Hub::new(client.clone(), Arc::new(Scope::default())));
        let http = client.as_ref().map(|_| HttpOptions::default());
        Self {
            inner: Arc::new(Inner { client, hub, http }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.client.is_some()
    }

    /// The process-wide default session.
    pub fn hub(&self) -> &Arc<Hub> {
        &self.inner.hub
    }

    pub(crate) fn http_options(&self) -> Option<HttpOptions> {
        self.inner.http
    }

    /// Report an error through the default session and log it locally.
    ///
    /// Ignorable errors and errors seen by a disabled reporter are only
    /// logged. With `should_panic`, panics with the error's message once
    /// reporting is done, whatever the outcome.
    pub fn capture<E>(&self, err: Option<&E>, should_panic: bool) -> EventId
    where
        E: ReportableError + ?Sized,
    {
        let Some(err) = err else {
            return EventId::empty();
        };
        let event_id = report(&self.inner.hub, err);
        if should_panic {
            panic!("{err}");
        }
        event_id
    }

    /// Report an error through a request-scoped session.
    ///
    /// Falls back to the default session when `session` is `None`.
    pub fn capture_with_context<E>(
        &self,
        session: Option<&Arc<Hub>>,
        err: Option<&E>,
        should_panic: bool,
    ) -> EventId
    where
        E: ReportableError + ?Sized,
    {
        let Some(err) = err else {
            return EventId::empty();
        };
        let event_id = report(session.unwrap_or(&self.inner.hub), err);
        if should_panic {
            panic!("{err}");
        }
        event_id
    }

    /// Wait up to `timeout` for queued events to be sent.
    pub fn flush(&self, timeout: Duration) -> bool {
        match &self.inner.client {
            Some(client) => client.flush(Some(timeout)),
            None => true,
        }
    }

    /// Interceptor for unary gRPC calls, configured not to re-panic.
    pub fn unary_interceptor(&self) -> UnaryInterceptor {
        self.unary_interceptor_with(InterceptorOptions::default())
    }

    pub fn unary_interceptor_with(&self, options: InterceptorOptions) -> UnaryInterceptor {
        UnaryInterceptor::new(self.inner.hub.clone(), options)
    }

    /// Interceptor for streaming gRPC calls, configured not to re-panic.
    pub fn stream_interceptor(&self) -> StreamInterceptor {
        self.stream_interceptor_with(InterceptorOptions::default())
    }

    pub fn stream_interceptor_with(&self, options: InterceptorOptions) -> StreamInterceptor {
        StreamInterceptor::new(self.inner.hub.clone(), options)
    }

    /// Server-wide tower layer recovering panics of every gRPC method.
    pub fn grpc_layer(&self) -> RecoveryLayer {
        self.grpc_layer_with(InterceptorOptions::default())
    }

    pub fn grpc_layer_with(&self, options: InterceptorOptions) -> RecoveryLayer {
        RecoveryLayer::new(self.inner.hub.clone(), options.repanic)
    }

    /// tonic interceptor attaching a fresh session to each call.
    pub fn session_interceptor(&self) -> SessionInterceptor {
        SessionInterceptor::new(self.inner.hub.clone())
    }
}

/// Report `err` through `session` and log it locally.
///
/// Only logs when the session has no client or the error is ignorable.
pub(crate) fn report<E>(session: &Arc<Hub>, err: &E) -> EventId
where
    E: ReportableError + ?Sized,
{
    let enabled = session.client().is_some_and(|client| client.is_enabled());
    if !enabled || err.is_ignorable() {
        tracing::error!(error = %err, ignorable = err.is_ignorable(), "Error logged locally only");
        return EventId::empty();
    }

    // Scope changes stay on a throwaway hub so concurrent captures
    // through the same session never see each other's tags.
    let hub = Hub::new_from_top(session.clone());
    hub.configure_scope(|scope| {
        if let Some(extras) = err.extras() {
            for (key, value) in &extras {
                scope.set_extra(key, value.clone());
            }
            scope.set_context("extras", sentry::protocol::Context::Other(extras));
        }
        for (key, value) in &err.tags() {
            scope.set_tag(key, value);
        }
    });
    let event_id = EventId::from(hub.capture_error(err));

    if event_id.is_empty() {
        // Sampled out or dropped by the client.
        tracing::error!(error = %err, "Error not sent to sentry");
    } else {
        tracing::error!(
            error = %err,
            event_id = %event_id,
            "Error captured in sentry with the event ID `{event_id}`"
        );
    }
    event_id
}

impl fmt::Debug for Reporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reporter")
            .field("enabled", &self.is_enabled())
            .field("http", &self.inner.http)
            .finish()
    }
}
