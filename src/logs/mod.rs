//! Persisting the child's output.
//!
//! [`LogWriter`] routes lines of the two child streams into [`LogSink`]s and
//! stamps them. At runtime the writer lives on its own thread, fed through a
//! [`LogSender`]; it is the only owner of the log files.

mod pump;
mod sink;
mod timestamp;

use std::{
    borrow::Cow,
    fmt, io,
    path::{Path, PathBuf},
    sync::Arc,
    thread,
};

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};

use crate::config::LogSettings;

pub use pump::pump_lines;
pub use sink::LogSink;
pub use timestamp::DateFormat;

/// Output records that may wait for the writer thread before pumps block.
pub const OUTPUT_QUEUE_LIMIT: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamId {
    Stdout,
    Stderr,
}

impl StreamId {
    fn index(self) -> usize {
        match self {
            Self::Stdout => 0,
            Self::Stderr => 1,
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdout => write!(f, "stdout"),
            Self::Stderr => write!(f, "stderr"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    /// The end of a line read from a child stream (or a trailing fragment at EOF).
    Output { stream: StreamId, line: Vec<u8> },
    /// A leading piece of a line too long to buffer; more of it follows.
    Fragment { stream: StreamId, bytes: Vec<u8> },
    /// A supervisor lifecycle message.
    Lifecycle(String),
}

/// Writing a log file failed. Never fatal to the supervised process.
#[derive(Debug, Error)]
#[error("failed to write log file {}: {source}", path.display())]
pub struct LogWriteError {
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

impl LogWriteError {
    fn new(path: &Path, source: io::Error) -> Self {
        Self {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Routes child output and lifecycle lines to the configured sinks.
#[derive(Debug)]
pub struct LogWriter {
    app: String,
    out: Option<LogSink>,
    err: Option<LogSink>,
    combined: Option<LogSink>,
    merge_logs: bool,
    time: bool,
    date_format: DateFormat,
    /// Per stream: a fragment was written and its line is not finished yet.
    open_line: [bool; 2],
}

impl LogWriter {
    pub fn new(app: &str, settings: &LogSettings) -> Self {
        let sink = |path: &Option<PathBuf>| {
            path.as_ref()
                .map(|path| LogSink::new(path, settings.max_size, settings.retain))
        };
        Self {
            app: app.to_string(),
            out: sink(&settings.out_file),
            err: if settings.merge_logs {
                None
            } else {
                sink(&settings.error_file)
            },
            combined: sink(&settings.log_file),
            merge_logs: settings.merge_logs,
            time: settings.time,
            date_format: settings.date_format.clone(),
            open_line: [false; 2],
        }
    }

    /// Appends one line of `stream` to its file and to the combined log,
    /// terminating it with a newline if needed.
    ///
    /// Every sink is attempted; the first failure is returned.
    pub fn write(&mut self, stream: StreamId, line: &[u8]) -> Result<(), LogWriteError> {
        self.emit(stream, line, true)
    }

    /// Appends part of an unfinished line, byte for byte. The timestamp, if
    /// any, is written before the first part only.
    pub fn write_fragment(&mut self, stream: StreamId, bytes: &[u8]) -> Result<(), LogWriteError> {
        self.emit(stream, bytes, false)
    }

    fn emit(
        &mut self,
        stream: StreamId,
        bytes: &[u8],
        ends_line: bool,
    ) -> Result<(), LogWriteError> {
        let line = self.stamp(stream, bytes, ends_line);
        self.open_line[stream.index()] = !ends_line;
        let target = match stream {
            StreamId::Stdout => self.out.as_mut(),
            StreamId::Stderr if self.merge_logs => self.out.as_mut(),
            StreamId::Stderr => self.err.as_mut(),
        };
        let mut result = Ok(());
        if let Some(sink) = target {
            if let Err(err) = sink.write(&line) {
                result = Err(LogWriteError::new(sink.path(), err));
            }
        }
        if let Some(sink) = self.combined.as_mut() {
            if let Err(err) = sink.write(&line) {
                result = result.and(Err(LogWriteError::new(sink.path(), err)));
            }
        }
        result
    }

    /// Appends a timestamped supervisor message to the combined log, if any.
    pub fn write_lifecycle(&mut self, message: &str) -> Result<(), LogWriteError> {
        let Some(sink) = self.combined.as_mut() else {
            return Ok(());
        };
        let line = format!("{}: [{}] {message}\n", self.date_format.now(), self.app);
        sink.write(line.as_bytes())
            .map_err(|err| LogWriteError::new(sink.path(), err))
    }

    pub fn apply(&mut self, record: LogRecord) -> Result<(), LogWriteError> {
        match record {
            LogRecord::Output { stream, line } => self.write(stream, &line),
            LogRecord::Fragment { stream, bytes } => self.write_fragment(stream, &bytes),
            LogRecord::Lifecycle(message) => self.write_lifecycle(&message),
        }
    }

    fn stamp<'a>(&self, stream: StreamId, bytes: &'a [u8], ends_line: bool) -> Cow<'a, [u8]> {
        let prefix = self.time && !self.open_line[stream.index()];
        let newline = ends_line && !bytes.ends_with(b"\n");
        if !prefix && !newline {
            return Cow::Borrowed(bytes);
        }
        let mut stamped = Vec::with_capacity(bytes.len() + 32);
        if prefix {
            stamped.extend_from_slice(self.date_format.now().as_bytes());
            stamped.extend_from_slice(b": ");
        }
        stamped.extend_from_slice(bytes);
        if newline {
            stamped.push(b'\n');
        }
        Cow::Owned(stamped)
    }
}

enum Command {
    /// Output records hold a queue permit until written.
    Record(LogRecord, Option<OwnedSemaphorePermit>),
    Close,
}

/// Cloneable entry point for output pumps.
///
/// At most [`OUTPUT_QUEUE_LIMIT`] output records wait for the writer thread;
/// beyond that, [`send`](Self::send) waits, which in turn stops reading from
/// the child.
#[derive(Clone)]
pub struct LogSender {
    tx: mpsc::UnboundedSender<Command>,
    permits: Arc<Semaphore>,
}

impl LogSender {
    /// Queues `record`; dropped silently once the writer has closed.
    pub async fn send(&self, record: LogRecord) {
        let Ok(permit) = Arc::clone(&self.permits).acquire_owned().await else {
            return;
        };
        let _ = self.tx.send(Command::Record(record, Some(permit)));
    }
}

/// Owns the writer thread.
pub struct LogWriterHandle {
    tx: mpsc::UnboundedSender<Command>,
    permits: Arc<Semaphore>,
    done: Option<oneshot::Receiver<()>>,
}

impl LogWriterHandle {
    /// Moves `writer` onto a dedicated thread. Failures are passed to
    /// `on_error` from that thread.
    pub fn spawn<F>(writer: LogWriter, on_error: F) -> io::Result<Self>
    where
        F: FnMut(LogWriteError) + Send + 'static,
    {
        Self::spawn_with_limit(writer, OUTPUT_QUEUE_LIMIT, on_error)
    }

    /// Like [`spawn`](Self::spawn), with at most `limit` queued output records.
    pub fn spawn_with_limit<F>(
        mut writer: LogWriter,
        limit: usize,
        mut on_error: F,
    ) -> io::Result<Self>
    where
        F: FnMut(LogWriteError) + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = oneshot::channel();
        thread::Builder::new()
            .name(format!("{}-logs", writer.app))
            .spawn(move || {
                while let Some(command) = rx.blocking_recv() {
                    match command {
                        Command::Record(record, permit) => {
                            if let Err(err) = writer.apply(record) {
                                on_error(err);
                            }
                            drop(permit);
                        }
                        Command::Close => break,
                    }
                }
                let _ = done_tx.send(());
            })?;
        Ok(Self {
            tx,
            permits: Arc::new(Semaphore::new(limit.max(1))),
            done: Some(done_rx),
        })
    }

    /// A handle with no thread behind it; every record is discarded.
    pub fn detached() -> Self {
        let (tx, _) = mpsc::unbounded_channel();
        Self {
            tx,
            permits: Arc::new(Semaphore::new(OUTPUT_QUEUE_LIMIT)),
            done: None,
        }
    }

    pub fn sender(&self) -> LogSender {
        LogSender {
            tx: self.tx.clone(),
            permits: Arc::clone(&self.permits),
        }
    }

    /// Queues `record` without waiting for queue space. Meant for the
    /// supervisor's own lifecycle lines.
    pub fn send(&self, record: LogRecord) {
        let _ = self.tx.send(Command::Record(record, None));
    }

    /// Writes everything queued so far, then stops the thread.
    pub async fn close(mut self) {
        let _ = self.tx.send(Command::Close);
        if let Some(done) = self.done.take() {
            let _ = done.await;
        }
    }
}
