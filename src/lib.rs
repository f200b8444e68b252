//! Surveil: error and panic reporting to Sentry for axum and tonic services.
//!
//! Application errors are sent with their tags and extras; panics in HTTP
//! handlers and gRPC calls are recovered and reported. Without a DSN every
//! entry point degrades to local logging and pass-through wrapping.
//!
//! # Modules
//!
//! - [`config`]: Environment configuration
//! - [`error`]: Error classification and the `TrackedError` carrier
//! - [`reporter`]: The `Reporter` and its capture entry points
//! - [`session`]: Request-scoped reporting sessions
//! - [`http`](crate::http): axum / tower handler wrappers
//! - [`grpc`]: tonic interceptors and the server recovery layer
//! - [`observability`]: Logging setup
//!
//! # Example
//!
//! ```no_run
//! use surveil::{init_reporter, TrackedError};
//!
//! let reporter = init_reporter(Some(env!("CARGO_PKG_VERSION")));
//! let err = TrackedError::new("cache refresh failed").with_tag("component", "cache");
//! let event_id = reporter.capture(Some(&err), false);
//! println!("reported as {event_id}");
//! ```

// Lint configuration
#![warn(clippy::all)]
#![allow(
    clippy::module_name_repetitions, // http::HttpOptions is fine
    clippy::must_use_candidate,      // Not all functions need #[must_use]
    clippy::missing_errors_doc,      // Error docs can be verbose
    clippy::missing_panics_doc       // capture documents its panic inline
)]

pub mod config;
pub mod error;
pub mod grpc;
pub mod http;
pub mod observability;
pub mod recover;
pub mod reporter;
pub mod session;

pub use config::ReporterConfig;
pub use error::{ConfigError, Extras, ReportableError, Tags, TrackedError};
pub use grpc::{
    CallFailure, InterceptorOptions, RecoveryLayer, RecoveryService, ReportOn, SessionStream,
    StatusError, StreamInterceptor, UnaryInterceptor,
};
pub use crate::http::{HttpOptions, PathParams, ReportingLayer, ReportingService};
pub use recover::Recovered;
pub use reporter::{init_reporter, EventId, Reporter};
pub use session::{RequestHub, SessionInterceptor};
