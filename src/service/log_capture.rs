//! Background capture of a child's stdout/stderr into its [`LogBuffer`].

use super::{LogBuffer, LogEntry};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// How long `finish` waits for readers to hit EOF before aborting them.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Owns the reader tasks for one process.
///
/// Uses `parking_lot::Mutex` for the task list so `Drop` can reach it
/// synchronously.
pub struct LogCapture {
    service_name: String,
    buffer: Arc<LogBuffer>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: Arc<Notify>,
}

impl LogCapture {
    pub fn new(service_name: impl Into<String>, buffer: Arc<LogBuffer>) -> Self {
        Self {
            service_name: service_name.into(),
            buffer,
            tasks: Mutex::new(Vec::new()),
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn buffer(&self) -> &Arc<LogBuffer> {
        &self.buffer
    }

    /// Spawn a reader that turns each line of `stream` into a [`LogEntry`].
    pub fn attach<R>(&self, stream: R, is_stderr: bool)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buffer = self.buffer.clone();
        let shutdown = self.shutdown.clone();
        let service = self.service_name.clone();

        let handle = tokio::spawn(async move {
            let mut lines = BufReader::new(stream).lines();
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.notified() => break,
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => buffer.add(LogEntry::new(&service, line, is_stderr)),
                        Ok(None) => break,
                        Err(e) => {
                            tracing::debug!(
                                "Stopped reading {} of '{}': {}",
                                if is_stderr { "stderr" } else { "stdout" },
                                service,
                                e
                            );
                            break;
                        }
                    },
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    /// Wait for the readers to reach EOF so no trailing output is lost,
    /// aborting any that are still running after a short grace period.
    pub async fn finish(&self) {
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        if tasks.is_empty() {
            return;
        }
        let aborts: Vec<_> = tasks.iter().map(|t| t.abort_handle()).collect();
        if tokio::time::timeout(DRAIN_TIMEOUT, futures::future::join_all(tasks))
            .await
            .is_err()
        {
            tracing::debug!(
                "Output readers for '{}' still busy after {:?}, aborting",
                self.service_name,
                DRAIN_TIMEOUT
            );
            self.shutdown.notify_waiters();
            for abort in aborts {
                abort.abort();
            }
        }
    }
}

impl Drop for LogCapture {
    fn drop(&mut self) {
        self.shutdown.notify_waiters();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}
