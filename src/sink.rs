use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::event::TraceEvent;
use crate::pipeline::{ShutdownRx, ShutdownTx, shutdown_channel};

/// Where flushed events end up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Stdout,
    /// Opened in append mode and closed again on every flush so it can be tailed.
    File(PathBuf),
}

impl Destination {
    /// Resolve the configured output, creating the parent directory and checking the file can
    /// be opened for appending.
    pub fn open(output: Option<&Path>) -> Result<Self> {
        let Some(path) = output else {
            return Ok(Self::Stdout);
        };
        let path = std::path::absolute(path)
            .with_context(|| format!("invalid output path {}", path.display()))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("cannot create output directory {}", parent.display())
            })?;
        }
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("cannot open output file {}", path.display()))?;
        Ok(Self::File(path))
    }

    async fn write(&self, text: &str) -> io::Result<()> {
        match self {
            Self::Stdout => {
                let mut stdout = tokio::io::stdout();
                stdout.write_all(text.as_bytes()).await?;
                stdout.flush().await
            }
            Self::File(path) => {
                let mut file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .await?;
                file.write_all(text.as_bytes()).await?;
                file.flush().await
            }
        }
    }
}

/// Write-behind accumulator for trace events.
///
/// Producers append into the input buffer. A background task periodically swaps that buffer
/// with its own (empty) output buffer under the lock and writes the output buffer after
/// releasing it, so producers never wait on sink I/O.
#[derive(Clone)]
pub struct EventSink {
    inner: Arc<Inner>,
}

struct Inner {
    input: Mutex<String>,
    destination: Destination,
    flusher: Mutex<Option<Flusher>>,
}

struct Flusher {
    stop: ShutdownTx,
    handle: JoinHandle<()>,
}

impl EventSink {
    /// Build the sink and start its flush task. Must be called inside a tokio runtime.
    pub fn spawn(destination: Destination, interval: Duration) -> Self {
        let inner = Arc::new(Inner {
            input: Mutex::new(String::new()),
            destination,
            flusher: Mutex::new(None),
        });
        let (stop, stop_rx) = shutdown_channel();
        let handle = tokio::spawn(flush_loop(inner.clone(), interval, stop_rx));
        *lock(&inner.flusher) = Some(Flusher { stop, handle });
        info!(
            destination = ?inner.destination,
            interval_ms = interval.as_millis() as u64,
            "event sink started"
        );
        Self { inner }
    }

    pub fn append(&self, text: &str) {
        lock(&self.inner.input).push_str(text);
    }

    pub fn record(&self, event: &TraceEvent<'_>) {
        self.append(&event.to_line());
    }

    /// Stop the flush task and write out everything still buffered.
    pub async fn close(&self) -> Result<()> {
        let flusher = lock(&self.inner.flusher).take();
        if let Some(Flusher { stop, handle }) = flusher {
            let _ = stop.send(true);
            if let Err(err) = handle.await {
                warn!(error = %err, "event sink flush task ended abnormally");
            }
        }
        let mut output = String::new();
        self.inner.flush(&mut output).await?;
        debug!("event sink closed");
        Ok(())
    }
}

impl Inner {
    /// Exchange the input buffer with `output` if there is anything to write.
    fn swap_into(&self, output: &mut String) -> bool {
        let mut input = lock(&self.input);
        if input.is_empty() {
            return false;
        }
        std::mem::swap(&mut *input, output);
        true
    }

    async fn flush(&self, output: &mut String) -> Result<()> {
        if !self.swap_into(output) {
            return Ok(());
        }
        let written = self.destination.write(output).await;
        let len = output.len();
        output.clear();
        written.with_context(|| format!("failed to write events to {:?}", self.destination))?;
        debug!(bytes = len, "flushed events");
        Ok(())
    }
}

async fn flush_loop(inner: Arc<Inner>, interval: Duration, mut stop: ShutdownRx) {
    let mut output = String::new();
    loop {
        tokio::select! {
            biased;
            res = stop.changed() => {
                if res.is_err() || *stop.borrow() {
                    break;
                }
            }
            _ = sleep(interval) => {}
        }
        if let Err(err) = inner.flush(&mut output).await {
            error!(error = %format!("{err:#}"), "cannot write trace output; exiting");
            std::process::exit(1);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_sink(path: &Path, interval_ms: u64) -> EventSink {
        let destination = Destination::open(Some(path)).unwrap();
        EventSink::spawn(destination, Duration::from_millis(interval_ms))
    }

    #[test]
    fn open_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("deeper").join("trace.ndjson");
        let destination = Destination::open(Some(&path)).unwrap();
        assert_eq!(destination, Destination::File(path.clone()));
        assert!(path.exists());
    }

    #[test]
    fn no_path_means_stdout() {
        assert_eq!(Destination::open(None).unwrap(), Destination::Stdout);
    }

    #[tokio::test]
    async fn close_flushes_everything_in_append_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.ndjson");
        let sink = file_sink(&path, 2);

        let mut expected = String::new();
        for i in 0..2000 {
            let line = format!("line {i}\n");
            sink.append(&line);
            expected.push_str(&line);
            if i % 50 == 0 {
                sleep(Duration::from_millis(1)).await;
            }
        }
        sink.close().await.unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), expected);
    }

    #[tokio::test]
    async fn flushes_periodically_before_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.ndjson");
        let sink = file_sink(&path, 10);

        sink.append("first\n");
        sleep(Duration::from_millis(200)).await;
        assert_eq!(fs::read_to_string(&path).unwrap(), "first\n");

        sink.append("second\n");
        sink.close().await.unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "first\nsecond\n");
    }

    #[tokio::test]
    async fn empty_cycles_do_no_io() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.ndjson");
        let sink = file_sink(&path, 5);
        fs::remove_file(&path).unwrap();

        sleep(Duration::from_millis(60)).await;
        sink.close().await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn concurrent_producers_lose_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.ndjson");
        let sink = file_sink(&path, 1);

        let producers: Vec<_> = (0..8)
            .map(|p| {
                let sink = sink.clone();
                tokio::spawn(async move {
                    for i in 0..250 {
                        sink.append(&format!("{p}:{i}\n"));
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.await.unwrap();
        }
        sink.close().await.unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2000);
        for p in 0..8 {
            let mine: Vec<&str> = lines
                .iter()
                .copied()
                .filter(|l| l.starts_with(&format!("{p}:")))
                .collect();
            let expected: Vec<String> = (0..250).map(|i| format!("{p}:{i}")).collect();
            assert_eq!(mine, expected);
        }
    }

    #[tokio::test]
    async fn write_failure_is_reported_on_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.ndjson");
        let sink = file_sink(&path, 60_000);
        fs::remove_file(&path).unwrap();
        fs::create_dir(&path).unwrap();

        sink.append("lost\n");
        assert!(sink.close().await.is_err());
    }

    #[tokio::test]
    async fn close_twice_flushes_late_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.ndjson");
        let sink = file_sink(&path, 60_000);

        sink.append("a\n");
        sink.close().await.unwrap();
        sink.append("b\n");
        sink.close().await.unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "a\nb\n");
    }
}
