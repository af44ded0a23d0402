//! Logging: a bounded text buffer that is shipped to the controller after
//! every batch, and the `slog` drains that feed it.

use std::fmt::{self, Write as _};
use std::io::Write as _;
use std::sync::{Arc, Mutex, PoisonError};

use slog::{Drain, Key, Level, Logger, Never, OwnedKVList, Record, Serializer, o};

#[derive(Debug, Default)]
struct Inner {
    text: String,
    dropped: usize,
}

/// Fixed-capacity append-only log text.
///
/// A line that does not fit is dropped whole; [`LogBuffer::take`] reports
/// how many bytes were lost.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    inner: Arc<Mutex<Inner>>,
    capacity: usize,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                text: String::with_capacity(capacity),
                dropped: 0,
            })),
            capacity,
        }
    }

    pub fn append(&self, line: &str) {
        let mut inner = self.lock();
        if inner.text.len() + line.len() > self.capacity {
            inner.dropped += line.len();
        } else {
            inner.text.push_str(line);
        }
    }

    /// Returns the buffered text and empties the buffer.
    pub fn take(&self) -> String {
        let mut inner = self.lock();
        let mut text = std::mem::take(&mut inner.text);
        if inner.dropped > 0 {
            let _ = writeln!(text, "[log truncated: {} bytes dropped]", inner.dropped);
            inner.dropped = 0;
        }
        inner.text.reserve(self.capacity);
        text
    }

    pub fn len(&self) -> usize {
        self.lock().text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Collects rendered ` key=value` pairs.
#[derive(Default)]
struct PairCollector(Vec<String>);

impl Serializer for PairCollector {
    fn emit_arguments(&mut self, key: Key, val: &fmt::Arguments) -> slog::Result {
        self.0.push(format!(" {key}={val}"));
        Ok(())
    }
}

/// `message key=value ...`, pairs in the order they were written at the call site.
fn render(record: &Record, values: &OwnedKVList) -> String {
    let mut line = record.msg().to_string();
    // slog hands pairs over last-first.
    for source in [&record.kv() as &dyn slog::KV, values] {
        let mut pairs = PairCollector::default();
        let _ = source.serialize(record, &mut pairs);
        pairs.0.iter().rev().for_each(|pair| line.push_str(pair));
    }
    line.push('\n');
    line
}

/// Writes every record at or above `level` into a [`LogBuffer`].
pub struct BufferDrain {
    buffer: LogBuffer,
    level: Level,
}

impl BufferDrain {
    pub fn new(buffer: LogBuffer, level: Level) -> Self {
        Self { buffer, level }
    }
}

impl Drain for BufferDrain {
    type Ok = ();
    type Err = Never;

    fn log(&self, record: &Record, values: &OwnedKVList) -> Result<(), Never> {
        if record.level().is_at_least(self.level) {
            self.buffer.append(&render(record, values));
        }
        Ok(())
    }
}

/// Mirrors records at or above `level` to stderr with a local timestamp.
pub struct EchoDrain {
    enabled: bool,
    level: Level,
}

impl Drain for EchoDrain {
    type Ok = ();
    type Err = Never;

    fn log(&self, record: &Record, values: &OwnedKVList) -> Result<(), Never> {
        if self.enabled && record.level().is_at_least(self.level) {
            let now = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
            let line = render(record, values);
            let _ = write!(std::io::stderr().lock(), "{now} {} {line}", record.level().as_short_str());
        }
        Ok(())
    }
}

/// Builds the process logger. Results (`info` and up) go to `buffer`, which
/// is bounded and shipped to the controller; with `echo` set, `debug`
/// bookkeeping is mirrored to stderr as well.
pub fn build_logger(buffer: &LogBuffer, echo: bool) -> Logger {
    let drain = slog::Duplicate::new(
        BufferDrain::new(buffer.clone(), Level::Info),
        EchoDrain {
            enabled: echo,
            level: Level::Debug,
        },
    )
    .ignore_res();
    Logger::root(drain, o!())
}
