// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 tailproxy Contributors

// In-memory log ring buffer and the tracing layer that feeds it

use std::fmt::{self, Write as _};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::filter::Targets;
use tracing_subscriber::layer::{Context, Layer};

/// Maximum number of retained entries
pub const LOG_CAPACITY: usize = 10_000;

/// Bounded, thread-safe sequence of formatted log lines.
///
/// Once the cap is reached the oldest half is dropped in one step, so appends
/// stay amortized O(1) and the newest entry is always kept.
#[derive(Clone)]
pub struct LogBuffer {
    inner: Arc<Mutex<Vec<String>>>,
    capacity: usize,
}

impl LogBuffer {
    pub fn new() -> Self {
        Self::with_capacity(LOG_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        Self {
            inner: Arc::new(Mutex::new(Vec::with_capacity(capacity))),
            capacity,
        }
    }

    pub fn append(&self, line: impl Into<String>) {
        let mut logs = self.inner.lock();
        if logs.len() >= self.capacity {
            let half = logs.len() / 2;
            logs.drain(..half);
        }
        logs.push(line.into());
    }

    /// All retained lines joined by `\n`, oldest first
    pub fn snapshot(&self) -> String {
        self.inner.lock().join("\n")
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for LogBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogBuffer")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// `HH:MM:SS [LEVEL] message key=value ...`
pub fn format_entry(
    timestamp: &chrono::DateTime<chrono::Local>,
    level: &Level,
    message: &str,
    fields: &[(String, String)],
) -> String {
    let mut entry = format!("{} [{}] {}", timestamp.format("%H:%M:%S"), level, message);
    for (key, value) in fields {
        let _ = write!(entry, " {}={}", key, value);
    }
    entry
}

#[derive(Default)]
struct EntryVisitor {
    message: String,
    fields: Vec<(String, String)>,
}

impl EntryVisitor {
    fn record(&mut self, field: &Field, value: String) {
        if field.name() == "message" {
            self.message = value;
        } else {
            self.fields.push((field.name().to_string(), value));
        }
    }
}

impl Visit for EntryVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.record(field, format!("{value:?}"));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.record(field, value.to_string());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.record(field, value.to_string());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.record(field, value.to_string());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.record(field, value.to_string());
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.record(field, value.to_string());
    }
}

/// Writes every event it sees into a [`LogBuffer`]
#[derive(Clone, Debug)]
pub struct LogBufferLayer {
    buffer: LogBuffer,
}

impl LogBufferLayer {
    pub fn new(buffer: LogBuffer) -> Self {
        Self { buffer }
    }

    /// Our own crates and the daemon output at full detail, dependencies at info
    pub fn default_filter() -> Targets {
        Targets::new()
            .with_default(Level::INFO)
            .with_target("tailproxy_daemon", Level::DEBUG)
            .with_target("tailproxyd", Level::DEBUG)
            .with_target(crate::filter::DAEMON_LOG_TARGET, Level::TRACE)
    }
}

impl<S> Layer<S> for LogBufferLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = EntryVisitor::default();
        event.record(&mut visitor);

        let entry = format_entry(
            &chrono::Local::now(),
            event.metadata().level(),
            &visitor.message,
            &visitor.fields,
        );
        self.buffer.append(entry);
    }
}
