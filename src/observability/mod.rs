//! Observability infrastructure.
//!
//! Provides:
//! - Structured local logging with Sentry breadcrumbs

pub mod tracing;
