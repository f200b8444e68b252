//! Error types and the error classification used by the reporter.
//!
//! Any error can be reported. Errors that implement [`ReportableError`]
//! additionally control whether they are sent at all (`is_ignorable`), and
//! which tags and extras travel with the event.

use std::backtrace::{Backtrace, BacktraceStatus};
use std::collections::BTreeMap;
use std::error::Error as StdError;

use serde_json::Value;
use thiserror::Error;

/// Boxed error accepted as the cause of a [`TrackedError`].
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Indexed key-value metadata attached to an event.
pub type Tags = BTreeMap<String, String>;

/// Unstructured diagnostic payload attached to an event.
pub type Extras = BTreeMap<String, Value>;

/// Errors raised while loading the reporter configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read sentry settings: {0}")]
    Parse(#[from] clap::Error),

    #[error("invalid sentry DSN: {0}")]
    Dsn(#[from] sentry::types::ParseDsnError),
}

/// Classification of an error for remote reporting.
///
/// The defaults describe a plain error: reportable, no tags, no extras.
pub trait ReportableError: StdError {
    /// Ignorable errors are logged locally but never sent upstream.
    fn is_ignorable(&self) -> bool {
        false
    }

    /// Diagnostic payload for the event, if any.
    fn extras(&self) -> Option<Extras> {
        None
    }

    /// Tags for the event.
    fn tags(&self) -> Tags {
        Tags::new()
    }
}

impl ReportableError for std::io::Error {}

/// An application error carrying reporting metadata.
///
/// # Example
///
/// ```
/// use surveil::{ReportableError, TrackedError};
///
/// let err = TrackedError::new("payment declined")
///     .with_tag("component", "billing")
///     .with_extra("order_id", 1234);
/// assert_eq!(err.tags()["component"], "billing");
/// assert!(!err.is_ignorable());
/// ```
#[derive(Debug, Error)]
#[error("{message}")]
pub struct TrackedError {
    message: String,
    #[source]
    source: Option<BoxError>,
    tags: Tags,
    extras: Extras,
    ignorable: bool,
    stacktrace: Option<String>,
}

impl TrackedError {
    /// Create an error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
            tags: Tags::new(),
            extras: Extras::new(),
            ignorable: false,
            stacktrace: capture_stacktrace(),
        }
    }

    /// Wrap a cause with a context message.
    pub fn wrap(source: impl Into<BoxError>, message: impl Into<String>) -> Self {
        Self {
            source: Some(source.into()),
            ..Self::new(message)
        }
    }

    /// Attach a tag.
    #[must_use]
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Attach an extra.
    #[must_use]
    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extras.insert(key.into(), value.into());
        self
    }

    /// Mark the error as not worth remote reporting.
    #[must_use]
    pub fn ignorable(mut self) -> Self {
        self.ignorable = true;
        self
    }

    /// Attach the current stacktrace even when `RUST_BACKTRACE` is unset.
    #[must_use]
    pub fn with_stacktrace(mut self) -> Self {
        self.stacktrace = Some(Backtrace::force_capture().to_string());
        self
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl ReportableError for TrackedError {
    fn is_ignorable(&self) -> bool {
        self.ignorable
    }

    fn extras(&self) -> Option<Extras> {
        if self.extras.is_empty() && self.stacktrace.is_none() {
            return None;
        }
        let mut extras = self.extras.clone();
        if let Some(stacktrace) = &self.stacktrace {
            extras.insert("stacktrace".into(), Value::String(stacktrace.clone()));
        }
        Some(extras)
    }

    fn tags(&self) -> Tags {
        self.tags.clone()
    }
}

impl From<anyhow::Error> for TrackedError {
    fn from(err: anyhow::Error) -> Self {
        let message = err.to_string();
        Self::wrap(err, message)
    }
}

// Honors RUST_BACKTRACE / RUST_LIB_BACKTRACE.
fn capture_stacktrace() -> Option<String> {
    let backtrace = Backtrace::capture();
    match backtrace.status() {
        BacktraceStatus::Captured => Some(backtrace.to_string()),
        _ => None,
    }
}
