//! Tracing layer that feeds the log view.
//!
//! Every event becomes one `LEVEL target: message key=value` line prepended
//! to a [`LogBuffer`]. Sinks subscribed to that buffer must not log, since
//! they run while the buffer is locked. Events under [`PANIC_TARGET`] are
//! skipped for the same reason: a panic can unwind out of a sink.

use std::fmt::{self, Write as _};

use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};
use warden_core::LogBuffer;

/// Target of events logged by the panic hook.
pub const PANIC_TARGET: &str = "warden::panic";

/// Appends formatted events to a [`LogBuffer`].
#[derive(Debug, Clone)]
pub struct LogBufferLayer {
    buffer: LogBuffer,
}

impl LogBufferLayer {
    /// Creates a layer writing into `buffer`.
    pub fn new(buffer: LogBuffer) -> Self {
        Self { buffer }
    }
}

impl<S: Subscriber> Layer<S> for LogBufferLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        if meta.target() == PANIC_TARGET {
            return;
        }

        let mut visitor = EventVisitor::default();
        event.record(&mut visitor);

        self.buffer.append(&format!(
            "{} {}: {}{}\n",
            meta.level(),
            meta.target(),
            visitor.message,
            visitor.fields
        ));
    }
}

#[derive(Default)]
struct EventVisitor {
    message: String,
    fields: String,
}

impl Visit for EventVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{:?}", value);
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::filter::LevelFilter;
    use tracing_subscriber::layer::SubscriberExt;

    #[test]
    fn formats_level_target_and_message() {
        let buffer = LogBuffer::default();
        let subscriber = tracing_subscriber::registry().with(LogBufferLayer::new(buffer.clone()));

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(target: "warden::proxy", "Proxy listening on {}", 9008);
        });

        assert_eq!(buffer.text(), "INFO warden::proxy: Proxy listening on 9008\n");
    }

    #[test]
    fn appends_fields_and_prepends_newest() {
        let buffer = LogBuffer::default();
        let subscriber = tracing_subscriber::registry().with(LogBufferLayer::new(buffer.clone()));

        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(target: "warden", port = 9008, "bind failed");
            tracing::error!(target: "warden", "gave up");
        });

        assert_eq!(
            buffer.text(),
            "ERROR warden: gave up\nWARN warden: bind failed port=9008\n"
        );
    }

    #[test]
    fn respects_per_layer_filter() {
        let buffer = LogBuffer::default();
        let subscriber = tracing_subscriber::registry()
            .with(LogBufferLayer::new(buffer.clone()).with_filter(LevelFilter::INFO));

        tracing::subscriber::with_default(subscriber, || {
            tracing::debug!(target: "warden", "hidden");
            tracing::info!(target: "warden", "shown");
        });

        assert_eq!(buffer.text(), "INFO warden: shown\n");
    }

    #[test]
    fn panic_events_bypass_buffer() {
        let buffer = LogBuffer::default();
        let subscriber = tracing_subscriber::registry().with(LogBufferLayer::new(buffer.clone()));

        tracing::subscriber::with_default(subscriber, || {
            tracing::error!(target: PANIC_TARGET, "PANIC: boom");
        });

        assert_eq!(buffer.text(), "");
    }

    #[test]
    fn panic_events_from_a_sink_do_not_relock() {
        let buffer = LogBuffer::default();
        // A panic hook fired inside a sink runs with the buffer locked
        buffer.subscribe(|text| {
            if text.contains("explode") {
                tracing::error!(target: PANIC_TARGET, "PANIC: sink failed");
            }
        });
        let subscriber = tracing_subscriber::registry().with(LogBufferLayer::new(buffer.clone()));

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(target: "warden", "explode");
        });

        assert_eq!(buffer.text(), "INFO warden: explode\n");
    }
}
