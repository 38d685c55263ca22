//! Bounded display log.
//!
//! Accumulates text fragments delivered from any thread into one display
//! buffer. The newest fragment is prefixed, a single fragment is capped at
//! `fragment_ceiling` characters, and when the buffer grows past `capacity`
//! it is cut back to three quarters of the capacity so the next appends do
//! not each trigger another cut.
//!
//! Lengths are counted in characters, never bytes, so truncation never
//! splits a UTF-8 sequence.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

/// Default maximum size of the display buffer.
pub const DEFAULT_CAPACITY: usize = 20_000;

/// Default maximum size of a single fragment.
pub const DEFAULT_FRAGMENT_CEILING: usize = 3_000;

/// Callback receiving the full buffer after every update.
pub type LogSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Thread-safe bounded log buffer with observer notification.
///
/// Sinks are invoked while the buffer lock is held, which keeps the
/// snapshots they see in append order. A sink must therefore never call
/// back into [`LogBuffer::append`] or [`LogBuffer::clear`].
#[derive(Clone)]
pub struct LogBuffer {
    text: Arc<Mutex<String>>,
    sinks: Arc<RwLock<Vec<LogSink>>>,
    capacity: usize,
    fragment_ceiling: usize,
}

impl std::fmt::Debug for LogBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogBuffer")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .field("fragment_ceiling", &self.fragment_ceiling)
            .field("sinks", &self.sinks.read().len())
            .finish()
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_FRAGMENT_CEILING)
    }
}

impl LogBuffer {
    /// Creates an empty buffer with the given limits.
    pub fn new(capacity: usize, fragment_ceiling: usize) -> Self {
        Self {
            text: Arc::new(Mutex::new(String::new())),
            sinks: Arc::new(RwLock::new(Vec::new())),
            capacity,
            fragment_ceiling,
        }
    }

    /// Registers a display sink.
    pub fn subscribe<F>(&self, sink: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.sinks.write().push(Arc::new(sink));
    }

    /// Returns the maximum buffer size in characters.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the maximum fragment size in characters.
    pub fn fragment_ceiling(&self) -> usize {
        self.fragment_ceiling
    }

    /// Returns a copy of the current buffer.
    pub fn text(&self) -> String {
        self.text.lock().clone()
    }

    /// Returns the current buffer length in characters.
    pub fn len(&self) -> usize {
        self.text.lock().chars().count()
    }

    /// Returns true if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.text.lock().is_empty()
    }

    /// Prepends a fragment and notifies every sink with the full buffer.
    pub fn append(&self, fragment: &str) {
        let fragment = truncate_chars(fragment, self.fragment_ceiling);

        let mut text = self.text.lock();
        let mut combined = String::with_capacity(fragment.len() + text.len());
        combined.push_str(fragment);
        combined.push_str(&text);

        if combined.chars().count() > self.capacity {
            let keep = self.capacity - self.capacity / 4;
            let cut = truncate_chars(&combined, keep).len();
            combined.truncate(cut);
        }

        *text = combined;
        self.notify(&text);
    }

    /// Empties the buffer and notifies every sink.
    pub fn clear(&self) {
        let mut text = self.text.lock();
        text.clear();
        self.notify(&text);
    }

    fn notify(&self, text: &str) {
        for sink in self.sinks.read().iter() {
            sink(text);
        }
    }
}

/// Returns the prefix of `s` holding at most `max` characters.
fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
