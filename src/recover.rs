//! Panic recovery for handler futures.
//!
//! The handler future runs with its session hub bound, so breadcrumbs and
//! scope changes made while serving land on that session. A panic is caught
//! at the await point, reported through the same hub as a fatal `panic`
//! exception and handed back as a [`Recovered`] value. Callers decide
//! whether to re-raise it or turn it into an error response.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::{self, BoxFuture};
use futures::FutureExt;
use sentry::protocol::{Event, Exception, Level, Mechanism};
use sentry::{Hub, SentryFutureExt};
use tower::Service;

use crate::reporter::EventId;

/// A panic caught while serving a request.
pub struct Recovered {
    message: String,
    event_id: EventId,
    payload: Box<dyn Any + Send + 'static>,
}

impl Recovered {
    /// The panic payload rendered as a string.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The id of the event reporting this panic.
    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    /// Continue unwinding with the original payload.
    pub fn resume(self) -> ! {
        std::panic::resume_unwind(self.payload)
    }
}

impl fmt::Debug for Recovered {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Recovered")
            .field("message", &self.message)
            .field("event_id", &self.event_id)
            .finish_non_exhaustive()
    }
}

/// Drive `fut` with `hub` bound, catching and reporting any panic.
pub(crate) async fn guarded<F>(hub: Arc<Hub>, fut: F) -> Result<F::Output, Recovered>
where
    F: Future,
{
    let outcome = AssertUnwindSafe(fut)
        .catch_unwind()
        .bind_hub(hub.clone())
        .await;

    outcome.map_err(|payload| {
        let message = panic_message(&*payload);
        let event_id = EventId::from(hub.capture_event(panic_event(&message)));
        tracing::error!(panic = %message, event_id = %event_id, "recovered panic while serving request");
        Recovered {
            message,
            event_id,
            payload,
        }
    })
}

/// Call `inner` with `hub` as the current hub.
///
/// A panic raised by `call` itself is replayed when the returned future is
/// polled, so [`guarded`] sees it like any other handler panic.
pub(crate) fn call_bound<S, R>(
    hub: &Arc<Hub>,
    inner: &mut S,
    request: R,
) -> BoxFuture<'static, Result<S::Response, S::Error>>
where
    S: Service<R>,
    S::Future: Send + 'static,
    S::Response: 'static,
    S::Error: 'static,
{
    let call = std::panic::catch_unwind(AssertUnwindSafe(|| {
        Hub::run(hub.clone(), || inner.call(request))
    }));
    match call {
        Ok(fut) => Box::pin(fut),
        Err(payload) => Box::pin(future::lazy(move |_| -> Result<S::Response, S::Error> {
            std::panic::resume_unwind(payload)
        })),
    }
}

/// Render a panic payload the way the default panic hook does.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "Box<dyn Any>".to_owned()
    }
}

fn panic_event(message: &str) -> Event<'static> {
    Event {
        exception: vec![Exception {
            ty: "panic".into(),
            value: Some(message.to_owned()),
            mechanism: Some(Mechanism {
                ty: "panic".into(),
                handled: Some(false),
                ..Default::default()
            }),
            ..Default::default()
        }]
        .into(),
        level: Level::Fatal,
        ..Default::default()
    }
}
