//! Reporter configuration.
//!
//! Settings are read once at startup from the process environment:
//! - `SENTRY_DSN`: Sentry DSN; reporting is disabled when empty
//! - `SENTRY_SAMPLING`: Fraction of errors transmitted (default 1.0)
//! - `SENTRY_RELEASE`: Release identifier attached to events
//! - `SENTRY_TRACING`: Enables performance tracing
//! - `SENTRY_TRACES_SAMPLE_RATE`: Fraction of traces transmitted (default 0.0)
//! - `ENVIRONMENT`: Deployment environment attached to events
//!
//! Only the DSN decides whether reporting is enabled. A malformed sampling or
//! tracing value is logged and replaced by its default.

use clap::builder::BoolishValueParser;
use clap::{ArgAction, Parser};
use sentry::integrations::backtrace::{AttachStacktraceIntegration, ProcessStacktraceIntegration};
use sentry::integrations::contexts::ContextIntegration;
use sentry::types::Dsn;
use std::borrow::Cow;
use std::convert::Infallible;
use std::sync::Arc;

use crate::error::ConfigError;

/// Sentry reporting configuration.
#[derive(Parser, Debug, Clone, PartialEq)]
#[command(name = "surveil")]
#[command(author, version, about, long_about = None)]
pub struct ReporterConfig {
    /// Sentry DSN. Reporting is disabled when empty.
    #[arg(long = "sentry-dsn", env = "SENTRY_DSN", default_value = "", hide_env_values = true)]
    pub dsn: String,

    /// Release identifier attached to every event
    #[arg(long = "sentry-release", env = "SENTRY_RELEASE")]
    pub release: Option<String>,

    /// Fraction of error events transmitted
    #[arg(
        long = "sentry-sampling",
        env = "SENTRY_SAMPLING",
        default_value_t = DEFAULT_SAMPLE_RATE,
        value_parser = parse_sample_rate
    )]
    pub sample_rate: f32,

    /// Enable performance tracing (1, t, true, yes, on)
    #[arg(
        long = "sentry-tracing",
        env = "SENTRY_TRACING",
        action = ArgAction::Set,
        default_value_t = false,
        default_missing_value = "true",
        num_args = 0..=1,
        value_parser = BoolishValueParser::new()
    )]
    pub enable_tracing: bool,

    /// Fraction of traces transmitted when tracing is enabled
    #[arg(
        long = "sentry-traces-sample-rate",
        env = "SENTRY_TRACES_SAMPLE_RATE",
        default_value_t = DEFAULT_TRACES_SAMPLE_RATE,
        value_parser = parse_traces_sample_rate
    )]
    pub traces_sample_rate: f32,

    /// Deployment environment (production, staging, ...)
    #[arg(long = "environment", env = "ENVIRONMENT")]
    pub environment: Option<String>,
}

impl ReporterConfig {
    /// Read the configuration from environment variables only.
    ///
    /// Command-line arguments of the host process are ignored.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self::try_parse_from([env!("CARGO_PKG_NAME")])?.normalized())
    }

    /// Parse configuration from CLI arguments and environment.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Replace out-of-range sample rates with their defaults.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.sample_rate = fraction_or(self.sample_rate, DEFAULT_SAMPLE_RATE, "SENTRY_SAMPLING");
        self.traces_sample_rate = fraction_or(
            self.traces_sample_rate,
            DEFAULT_TRACES_SAMPLE_RATE,
            "SENTRY_TRACES_SAMPLE_RATE",
        );
        self
    }

    /// Replace the release when `release` is non-empty.
    #[must_use]
    pub fn with_release(mut self, release: Option<&str>) -> Self {
        if let Some(release) = release.filter(|r| !r.is_empty()) {
            self.release = Some(release.to_owned());
        }
        self
    }

    /// The parsed DSN, `None` when no DSN is configured.
    pub fn parsed_dsn(&self) -> Result<Option<Dsn>, ConfigError> {
        let dsn = self.dsn.trim();
        if dsn.is_empty() {
            return Ok(None);
        }
        Ok(Some(dsn.parse()?))
    }

    /// Build the Sentry client options for a parsed DSN.
    pub fn client_options(&self, dsn: Dsn) -> sentry::ClientOptions {
        sentry::ClientOptions {
            dsn: Some(dsn),
            release: non_empty(self.release.as_deref()),
            environment: non_empty(self.environment.as_deref()),
            sample_rate: self.sample_rate,
            traces_sample_rate: if self.enable_tracing {
                self.traces_sample_rate
            } else {
                0.0
            },
            attach_stacktrace: true,
            integrations: vec![
                Arc::new(AttachStacktraceIntegration::new()),
                Arc::new(ProcessStacktraceIntegration::new()),
                Arc::new(ContextIntegration::new()),
            ],
            ..Default::default()
        }
    }
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            dsn: String::new(),
            release: None,
            sample_rate: DEFAULT_SAMPLE_RATE,
            enable_tracing: false,
            traces_sample_rate: DEFAULT_TRACES_SAMPLE_RATE,
            environment: None,
        }
    }
}

const DEFAULT_SAMPLE_RATE: f32 = 1.0;
const DEFAULT_TRACES_SAMPLE_RATE: f32 = 0.0;

fn parse_sample_rate(value: &str) -> Result<f32, Infallible> {
    Ok(parse_fraction(value, DEFAULT_SAMPLE_RATE, "SENTRY_SAMPLING"))
}

fn parse_traces_sample_rate(value: &str) -> Result<f32, Infallible> {
    Ok(parse_fraction(
        value,
        DEFAULT_TRACES_SAMPLE_RATE,
        "SENTRY_TRACES_SAMPLE_RATE",
    ))
}

fn parse_fraction(value: &str, default: f32, name: &str) -> f32 {
    match value.trim().parse::<f32>() {
        Ok(rate) => fraction_or(rate, default, name),
        Err(_) if value.trim().is_empty() => default,
        Err(e) => {
            tracing::warn!(name, value, error = %e, default, "Ignoring unparseable sentry setting");
            default
        }
    }
}

fn fraction_or(rate: f32, default: f32, name: &str) -> f32 {
    if (0.0..=1.0).contains(&rate) {
        rate
    } else {
        tracing::warn!(name, rate, default, "Sentry rate must be between 0.0 and 1.0, using default");
        default
    }
}

fn non_empty(value: Option<&str>) -> Option<Cow<'static, str>> {
    value
        .filter(|v| !v.is_empty())
        .map(|v| Cow::Owned(v.to_owned()))
}
