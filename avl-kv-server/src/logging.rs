//! Log sink setup.
//!
//! The rest of the crate records events with `tracing::info!` and
//! `tracing::error!`. This module decides where those events go:
//!
//! - **stderr** (default): formatted lines are written straight to standard error.
//! - **syslog**: formatted lines are pushed into a bounded [`RingBuffer`]. A
//!   background flusher drains it in batches, either on a fixed interval or
//!   when the buffer fills past a high-water mark, and sends each line to the
//!   local syslog socket. When the buffer is full the oldest line is
//!   overwritten and the loss is reported with the next batch.
//!
//! Callers never block on delivery beyond pushing into the buffer.

use std::collections::VecDeque;
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::{net::UnixDatagram, select, sync::Notify, sync::oneshot, task::JoinHandle};
use tracing::{Level, Metadata};
use tracing_subscriber::{EnvFilter, fmt, fmt::MakeWriter};

/// Identifier attached to every syslog line.
pub const SYSLOG_IDENT: &str = "avl-kv-server";
/// Local syslog datagram socket.
pub const SYSLOG_PATH: &str = "/dev/log";

const RING_CAPACITY: usize = 1024;
const HIGH_WATER_MARK: usize = RING_CAPACITY * 3 / 4;
const FLUSH_INTERVAL: Duration = Duration::from_millis(200);
/// `LOG_USER` facility code.
const FACILITY_USER: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTarget {
    Stderr,
    Syslog,
}

#[derive(Debug, Clone, Copy)]
pub struct LogSettings {
    /// Record informational events, not only errors.
    pub verbose: bool,
    pub target: LogTarget,
}

impl LogSettings {
    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(if self.verbose { "info" } else { "error" })
        })
    }
}

/// Keeps the syslog flusher alive; call [`LogHandle::shutdown`] before exit.
pub struct LogHandle {
    flusher: Option<(oneshot::Sender<()>, JoinHandle<()>)>,
}

impl LogHandle {
    /// Stops the flusher after it has delivered everything still buffered.
    pub async fn shutdown(mut self) {
        if let Some((stop, task)) = self.flusher.take() {
            let _ = stop.send(());
            let _ = task.await;
        }
    }
}

/// Installs the global subscriber. Must run inside a Tokio runtime.
pub fn init(settings: LogSettings) -> LogHandle {
    match settings.target {
        LogTarget::Stderr => {
            let _ = fmt()
                .with_env_filter(settings.filter())
                .with_writer(io::stderr)
                .with_target(false)
                .try_init();
            LogHandle { flusher: None }
        }
        LogTarget::Syslog => {
            let shared = Arc::new(SharedRing::new(RING_CAPACITY));
            let _ = fmt()
                .with_env_filter(settings.filter())
                .with_writer(RingMakeWriter {
                    shared: Arc::clone(&shared),
                })
                .with_ansi(false)
                .with_target(false)
                .without_time()
                .try_init();

            let sink = SyslogSink::connect(SYSLOG_PATH);
            let (stop_tx, stop_rx) = oneshot::channel();
            let task = tokio::spawn(run_flusher(shared, sink, stop_rx));
            LogHandle {
                flusher: Some((stop_tx, task)),
            }
        }
    }
}

/// Fixed-capacity FIFO that overwrites its oldest entry when full.
#[derive(Debug)]
pub struct RingBuffer<T> {
    entries: VecDeque<T>,
    capacity: usize,
    overwritten: u64,
}

impl<T> RingBuffer<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            overwritten: 0,
        }
    }

    /// Appends `entry`, evicting the oldest entry if the buffer is full.
    pub fn push(&mut self, entry: T) -> Option<T> {
        let evicted = if self.entries.len() == self.capacity {
            self.overwritten += 1;
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(entry);
        evicted
    }

    /// Removes every buffered entry, oldest first.
    pub fn drain(&mut self) -> Vec<T> {
        self.entries.drain(..).collect()
    }

    /// Returns and resets the number of entries lost to overwrites.
    pub fn take_overwritten(&mut self) -> u64 {
        std::mem::take(&mut self.overwritten)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Syslog severity of a buffered line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error = 3,
    Warning = 4,
    Info = 6,
    Debug = 7,
}

impl From<Level> for Severity {
    fn from(level: Level) -> Self {
        match level {
            Level::ERROR => Severity::Error,
            Level::WARN => Severity::Warning,
            Level::INFO => Severity::Info,
            _ => Severity::Debug,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub severity: Severity,
    pub line: String,
}

struct SharedRing {
    ring: Mutex<RingBuffer<LogRecord>>,
    wake: Notify,
}

impl SharedRing {
    fn new(capacity: usize) -> Self {
        Self {
            ring: Mutex::new(RingBuffer::with_capacity(capacity)),
            wake: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RingBuffer<LogRecord>> {
        // A panic while holding the lock leaves the buffer intact.
        self.ring.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, record: LogRecord) {
        let len = {
            let mut ring = self.lock();
            ring.push(record);
            ring.len()
        };
        if len >= HIGH_WATER_MARK {
            self.wake.notify_one();
        }
    }

    fn take_batch(&self) -> Vec<LogRecord> {
        let mut ring = self.lock();
        let overwritten = ring.take_overwritten();
        let mut batch = Vec::with_capacity(ring.len() + 1);
        if overwritten > 0 {
            batch.push(LogRecord {
                severity: Severity::Warning,
                line: format!("log buffer full, {overwritten} records dropped\n"),
            });
        }
        batch.extend(ring.drain());
        batch
    }
}

#[derive(Clone)]
struct RingMakeWriter {
    shared: Arc<SharedRing>,
}

impl<'a> MakeWriter<'a> for RingMakeWriter {
    type Writer = RingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        RingWriter::new(Arc::clone(&self.shared), Severity::Info)
    }

    fn make_writer_for(&'a self, meta: &Metadata<'_>) -> Self::Writer {
        RingWriter::new(Arc::clone(&self.shared), Severity::from(*meta.level()))
    }
}

/// Collects one formatted event and pushes it into the ring when dropped.
struct RingWriter {
    shared: Arc<SharedRing>,
    severity: Severity,
    buf: Vec<u8>,
}

impl RingWriter {
    fn new(shared: Arc<SharedRing>, severity: Severity) -> Self {
        Self {
            shared,
            severity,
            buf: Vec::new(),
        }
    }
}

impl Write for RingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for RingWriter {
    fn drop(&mut self) {
        if self.buf.is_empty() {
            return;
        }
        let line = String::from_utf8_lossy(&self.buf).into_owned();
        self.shared.push(LogRecord {
            severity: self.severity,
            line,
        });
    }
}

/// Delivers records to a syslog datagram socket, or stderr if unreachable.
struct SyslogSink {
    socket: Option<UnixDatagram>,
    pid: u32,
}

impl SyslogSink {
    fn connect(path: impl AsRef<Path>) -> Self {
        let socket = UnixDatagram::unbound().and_then(|socket| {
            socket.connect(path.as_ref())?;
            Ok(socket)
        });
        let socket = match socket {
            Ok(socket) => Some(socket),
            Err(err) => {
                eprintln!(
                    "syslog socket {} unavailable ({err}); logging to stderr",
                    path.as_ref().display()
                );
                None
            }
        };
        Self {
            socket,
            pid: std::process::id(),
        }
    }

    async fn deliver(&self, batch: Vec<LogRecord>) {
        for record in batch {
            let sent = match &self.socket {
                Some(socket) => socket
                    .send(format_datagram(&record, self.pid).as_bytes())
                    .await
                    .is_ok(),
                None => false,
            };
            if !sent {
                let _ = io::stderr().write_all(record.line.as_bytes());
            }
        }
    }
}

/// Formats a record as an RFC 3164 message without a timestamp; syslogd adds it.
fn format_datagram(record: &LogRecord, pid: u32) -> String {
    let priority = FACILITY_USER * 8 + record.severity as u8;
    format!(
        "<{priority}>{SYSLOG_IDENT}[{pid}]: {}",
        record.line.trim_end()
    )
}

async fn run_flusher(shared: Arc<SharedRing>, sink: SyslogSink, mut stop: oneshot::Receiver<()>) {
    let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
    loop {
        let stopping = select! {
            _ = ticker.tick() => false,
            _ = shared.wake.notified() => false,
            _ = &mut stop => true,
        };
        sink.deliver(shared.take_batch()).await;
        if stopping {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_overwrites_oldest_when_full() {
        let mut ring = RingBuffer::with_capacity(3);
        for i in 0..3 {
            assert_eq!(ring.push(i), None);
        }
        assert_eq!(ring.push(3), Some(0));
        assert_eq!(ring.push(4), Some(1));

        assert_eq!(ring.len(), 3);
        assert_eq!(ring.take_overwritten(), 2);
        assert_eq!(ring.take_overwritten(), 0);
        assert_eq!(ring.drain(), vec![2, 3, 4]);
        assert!(ring.is_empty());
    }

    #[test]
    fn zero_capacity_ring_still_holds_one_entry() {
        let mut ring = RingBuffer::with_capacity(0);
        assert_eq!(ring.capacity(), 1);
        ring.push("a");
        assert_eq!(ring.push("b"), Some("a"));
    }

    #[test]
    fn writer_pushes_one_record_per_event() {
        let shared = Arc::new(SharedRing::new(8));
        let make = RingMakeWriter {
            shared: Arc::clone(&shared),
        };

        {
            let mut writer = make.make_writer();
            write!(writer, "first ").expect("write");
            writeln!(writer, "event").expect("write");
        }
        drop(make.make_writer());

        let batch = shared.take_batch();
        assert_eq!(
            batch,
            vec![LogRecord {
                severity: Severity::Info,
                line: "first event\n".into(),
            }]
        );
    }

    #[test]
    fn batch_reports_dropped_records() {
        let shared = SharedRing::new(2);
        for line in ["a\n", "b\n", "c\n"] {
            shared.push(LogRecord {
                severity: Severity::Error,
                line: line.into(),
            });
        }
        let batch = shared.take_batch();
        let lines: Vec<&str> = batch.iter().map(|record| record.line.as_str()).collect();
        assert_eq!(lines, ["log buffer full, 1 records dropped\n", "b\n", "c\n"]);
        assert!(shared.take_batch().is_empty());
    }

    #[test]
    fn datagram_carries_priority_and_ident() {
        let record = LogRecord {
            severity: Severity::Error,
            line: " ERROR rejected request\n".into(),
        };
        assert_eq!(
            format_datagram(&record, 42),
            "<11>avl-kv-server[42]:  ERROR rejected request"
        );
        assert_eq!(Severity::from(Level::INFO) as u8, 6);
    }

    #[tokio::test]
    async fn flusher_delivers_buffered_records_on_shutdown() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("log.sock");
        let receiver = UnixDatagram::bind(&path).expect("bind syslog stand-in");

        let shared = Arc::new(SharedRing::new(16));
        for line in ["one\n", "two\n"] {
            shared.push(LogRecord {
                severity: Severity::Info,
                line: line.into(),
            });
        }

        let sink = SyslogSink::connect(&path);
        let (stop_tx, stop_rx) = oneshot::channel();
        let handle = LogHandle {
            flusher: Some((stop_tx, tokio::spawn(run_flusher(shared, sink, stop_rx)))),
        };
        handle.shutdown().await;

        let pid = std::process::id();
        let mut buf = [0u8; 256];
        for expected in ["one", "two"] {
            let n = receiver.recv(&mut buf).await.expect("datagram");
            assert_eq!(
                std::str::from_utf8(&buf[..n]).expect("utf-8"),
                format!("<14>avl-kv-server[{pid}]: {expected}")
            );
        }
    }
}
