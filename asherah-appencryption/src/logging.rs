//! Diagnostic logging setup.
//!
//! The library only emits `tracing` events. Hosts either install their own
//! subscriber or call [`init`] / [`set_log_hook`] once. Key material and
//! plaintext never appear in events.

use std::fmt;
use std::sync::Arc;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

pub const LOG_ERROR: i32 = 3;
pub const LOG_WARN: i32 = 4;
pub const LOG_INFO: i32 = 6;
pub const LOG_DEBUG: i32 = 7;

fn env_filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "warn" }))
}

/// Installs a stderr fmt subscriber. `RUST_LOG` takes precedence over
/// `verbose`. Does nothing if a global subscriber is already set.
pub fn init(verbose: bool) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter(verbose))
        .with_writer(std::io::stderr)
        .try_init();
}

/// Routes every event to `callback(level, message)` instead of stderr.
/// Returns false if a global subscriber is already set.
pub fn set_log_hook<F>(verbose: bool, callback: F) -> bool
where
    F: Fn(i32, &str) + Send + Sync + 'static,
{
    tracing_subscriber::registry()
        .with(env_filter(verbose))
        .with(LogHook::new(callback))
        .try_init()
        .is_ok()
}

/// Maps a `tracing` level to its syslog severity.
pub fn posix_level(level: &Level) -> i32 {
    match *level {
        Level::ERROR => LOG_ERROR,
        Level::WARN => LOG_WARN,
        Level::INFO => LOG_INFO,
        _ => LOG_DEBUG,
    }
}

/// A layer forwarding events to a host callback with syslog severities.
#[derive(Clone)]
pub struct LogHook {
    callback: Arc<dyn Fn(i32, &str) + Send + Sync>,
}

impl LogHook {
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(i32, &str) + Send + Sync + 'static,
    {
        Self {
            callback: Arc::new(callback),
        }
    }
}

impl fmt::Debug for LogHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogHook").finish_non_exhaustive()
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.fields.push_str(&format!(" {}={value:?}", field.name()));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.push_str(&format!(" {}={value}", field.name()));
        }
    }
}

impl<S: Subscriber> Layer<S> for LogHook {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        visitor.message.push_str(&visitor.fields);
        (self.callback)(posix_level(event.metadata().level()), &visitor.message);
    }
}
