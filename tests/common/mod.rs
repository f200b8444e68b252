//! Test utilities for Surveil tests.
//!
//! Provides:
//! - Reporters wired to an in-memory Sentry transport
//! - Capture of local log output

#![allow(dead_code)]

use std::io;
use std::sync::{Arc, Mutex};

use sentry::protocol::Event;
use sentry::test::TestTransport;
use surveil::{Reporter, ReporterConfig};
use tracing_subscriber::fmt::MakeWriter;

/// DSN accepted by the client; nothing is sent over the network.
pub const TEST_DSN: &str = "https://public@sentry.invalid/1";

/// Reporter fixture recording every transmitted event.
pub struct TestReporter {
    pub reporter: Reporter,
    pub transport: Arc<TestTransport>,
}

impl TestReporter {
    /// Enabled reporter with sampling 1.0.
    pub fn new() -> Self {
        Self::with_config(Self::config())
    }

    /// Configuration pointing at [`TEST_DSN`].
    pub fn config() -> ReporterConfig {
        ReporterConfig {
            dsn: TEST_DSN.into(),
            ..Default::default()
        }
    }

    pub fn with_config(config: ReporterConfig) -> Self {
        let transport = TestTransport::new();
        let reporter = Reporter::with_transport(config, Arc::new(transport.clone()));
        assert!(reporter.is_enabled(), "test reporter should be enabled");
        Self {
            reporter,
            transport,
        }
    }

    /// Events sent since the last call.
    pub fn events(&self) -> Vec<Event<'static>> {
        self.transport.fetch_and_clear_events()
    }
}

impl Default for TestReporter {
    fn default() -> Self {
        Self::new()
    }
}

/// In-memory log sink usable as a `tracing_subscriber` writer.
#[derive(Clone, Default)]
pub struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    pub fn contents(&self) -> String {
        let buffer = self.0.lock().expect("log buffer poisoned");
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .expect("log buffer poisoned")
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for CapturedLogs {
    type Writer = CapturedLogs;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Run `f` with a subscriber writing into memory, returning its log output.
pub fn with_captured_logs<R>(f: impl FnOnce() -> R) -> (R, String) {
    let logs = CapturedLogs::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(logs.clone())
        .with_ansi(false)
        .finish();
    let result = tracing::subscriber::with_default(subscriber, f);
    (result, logs.contents())
}

/// Look up a tag on a captured event.
pub fn tag<'a>(event: &'a Event<'static>, key: &str) -> Option<&'a str> {
    event.tags.get(key).map(String::as_str)
}
