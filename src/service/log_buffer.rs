//! Per-service log aggregation.
//!
//! Each service gets a [`LogBuffer`]: a fixed-capacity ring of structured
//! [`LogEntry`] values with point queries, live subscriptions and an
//! optional append-only mirror on disk. A [`LogManager`] owns the buffers of
//! one project.
//!
//! # Memory Management
//!
//! Adding past capacity evicts the oldest entry. Adding never blocks: a
//! subscriber whose channel is full simply misses that entry.

use crate::config;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Default number of entries kept per service.
pub const DEFAULT_LOG_CAPACITY: usize = 1000;

/// Entries a subscriber may have queued before it starts missing some.
pub const SUBSCRIBER_CHANNEL_CAPACITY: usize = 256;

/// Threshold percentage for the one-time capacity warning.
const LOG_BUFFER_WARNING_THRESHOLD: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(crate::error::Error::Validation(format!(
                "unknown log level '{}'",
                other
            ))),
        }
    }
}

/// Guess a level from the text of a captured line.
pub fn infer_log_level(message: &str) -> LogLevel {
    let lower = message.to_lowercase();
    if ["error", "exception", "fatal", "panic"]
        .iter()
        .any(|k| lower.contains(k))
    {
        LogLevel::Error
    } else if lower.contains("warn") {
        LogLevel::Warn
    } else if lower.contains("debug") || lower.contains("trace") {
        LogLevel::Debug
    } else {
        LogLevel::Info
    }
}

/// One captured line. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub service: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub is_stderr: bool,
}

impl LogEntry {
    pub fn new(service: impl Into<String>, message: impl Into<String>, is_stderr: bool) -> Self {
        let message = message.into();
        Self {
            service: service.into(),
            level: infer_log_level(&message),
            message,
            timestamp: Utc::now(),
            is_stderr,
        }
    }

    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// The line written to the durable log file.
    pub fn file_line(&self) -> String {
        format!(
            "{} [{}]{} {}",
            self.timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            self.level,
            if self.is_stderr { " [stderr]" } else { "" },
            self.message
        )
    }
}

/// A live feed of entries from one buffer.
///
/// `recv` returns `None` once the feed is unsubscribed or the buffer is
/// closed and every queued entry has been read.
#[derive(Debug)]
pub struct LogSubscription {
    id: u64,
    rx: mpsc::Receiver<LogEntry>,
}

impl LogSubscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn recv(&mut self) -> Option<LogEntry> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<LogEntry> {
        self.rx.try_recv().ok()
    }
}

/// Bounded, thread-safe ring of one service's output.
pub struct LogBuffer {
    service: String,
    capacity: usize,
    entries: RwLock<VecDeque<LogEntry>>,
    subscribers: Mutex<HashMap<u64, mpsc::Sender<LogEntry>>>,
    next_subscriber: AtomicU64,
    file: Mutex<Option<BufWriter<File>>>,
    file_path: Option<PathBuf>,
    closed: AtomicBool,
    warned_at_capacity: AtomicBool,
    dropped_count: AtomicUsize,
}

impl LogBuffer {
    /// In-memory buffer; `capacity` 0 is treated as 1.
    pub fn new(service: impl Into<String>, capacity: usize) -> Self {
        Self {
            service: service.into(),
            capacity: capacity.max(1),
            entries: RwLock::new(VecDeque::new()),
            subscribers: Mutex::new(HashMap::new()),
            next_subscriber: AtomicU64::new(0),
            file: Mutex::new(None),
            file_path: None,
            closed: AtomicBool::new(false),
            warned_at_capacity: AtomicBool::new(false),
            dropped_count: AtomicUsize::new(0),
        }
    }

    /// Buffer that also appends to `<project>/.devstack/logs/<service>.log`.
    ///
    /// If the file cannot be opened the buffer still works in memory and a
    /// warning is logged.
    pub fn with_file(service: impl Into<String>, capacity: usize, project_dir: &Path) -> Self {
        let mut buffer = Self::new(service, capacity);
        let dir = config::log_dir(project_dir);
        let path = dir.join(format!("{}.log", sanitize_file_name(&buffer.service)));

        let opened = config::create_private_dir(&dir)
            .and_then(|_| OpenOptions::new().create(true).append(true).open(&path));
        match opened {
            Ok(file) => {
                *buffer.file.get_mut() = Some(BufWriter::new(file));
                buffer.file_path = Some(path);
            }
            Err(e) => tracing::warn!(
                "Durable logging disabled for '{}': cannot open {}: {}",
                buffer.service,
                path.display(),
                e
            ),
        }
        buffer
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn file_path(&self) -> Option<&Path> {
        self.file_path.as_deref()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Entries evicted to make room since creation.
    pub fn dropped_count(&self) -> usize {
        self.dropped_count.load(Ordering::Relaxed)
    }

    /// Append an entry, broadcast it to subscribers and mirror it to disk.
    /// Silently ignored after [`close`](Self::close).
    pub fn add(&self, entry: LogEntry) {
        if self.is_closed() {
            return;
        }

        {
            let mut entries = self.entries.write();
            entries.push_back(entry.clone());
            if entries.len() > self.capacity {
                entries.pop_front();
                self.dropped_count.fetch_add(1, Ordering::Relaxed);
            }

            let threshold = (self.capacity as f64 * LOG_BUFFER_WARNING_THRESHOLD) as usize;
            if self.capacity >= 10
                && entries.len() >= threshold
                && !self.warned_at_capacity.swap(true, Ordering::Relaxed)
            {
                tracing::warn!(
                    "Log buffer for service '{}' is at {}/{} entries. Oldest entries will be dropped.",
                    self.service,
                    entries.len(),
                    self.capacity
                );
            }

            // Broadcast and mirror while still holding the ring lock so
            // subscribers and the log file see entries in insertion order.
            self.broadcast(&entry);
            self.append_to_file(&entry);
        }
    }

    fn append_to_file(&self, entry: &LogEntry) {
        let mut file = self.file.lock();
        if let Some(writer) = file.as_mut() {
            if let Err(e) = writeln!(writer, "{}", entry.file_line()) {
                tracing::warn!("Failed to write log file for '{}': {}", self.service, e);
                *file = None;
            }
        }
    }

    fn broadcast(&self, entry: &LogEntry) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|id, tx| match tx.try_send(entry.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::debug!(
                    "Log subscriber {} for '{}' is lagging, entry skipped",
                    id,
                    self.service
                );
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    /// The last `min(n, len)` entries in insertion order; `n <= 0` means all.
    pub fn get_recent(&self, n: i64) -> Vec<LogEntry> {
        let entries = self.entries.read();
        let take = if n <= 0 {
            entries.len()
        } else {
            (n as usize).min(entries.len())
        };
        entries
            .iter()
            .skip(entries.len() - take)
            .cloned()
            .collect()
    }

    /// Entries stamped at or after `since`.
    pub fn get_since(&self, since: DateTime<Utc>) -> Vec<LogEntry> {
        self.entries
            .read()
            .iter()
            .filter(|e| e.timestamp >= since)
            .cloned()
            .collect()
    }

    pub fn get_by_level(&self, level: LogLevel) -> Vec<LogEntry> {
        self.entries
            .read()
            .iter()
            .filter(|e| e.level == level)
            .cloned()
            .collect()
    }

    /// Attach a live feed. On a closed buffer the feed ends immediately.
    pub fn subscribe(&self) -> LogSubscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        if !self.is_closed() {
            self.subscribers.lock().insert(id, tx);
        }
        LogSubscription { id, rx }
    }

    /// Current contents plus a feed of everything added afterwards.
    ///
    /// Both are taken under the ring lock, so every entry is in exactly one
    /// of the two.
    pub fn subscribe_with_backlog(&self) -> (Vec<LogEntry>, LogSubscription) {
        let entries = self.entries.read();
        let backlog = entries.iter().cloned().collect();
        let subscription = self.subscribe();
        drop(entries);
        (backlog, subscription)
    }

    /// Detach a feed. Its reader sees the end of the stream after draining
    /// what was already queued.
    pub fn unsubscribe(&self, subscription: &LogSubscription) {
        self.subscribers.lock().remove(&subscription.id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Flush the durable mirror without closing.
    pub fn flush(&self) {
        if let Some(writer) = self.file.lock().as_mut() {
            if let Err(e) = writer.flush() {
                tracing::warn!("Failed to flush log file for '{}': {}", self.service, e);
            }
        }
    }

    /// End every feed and flush the file. Safe to call more than once.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // Taking the ring lock orders close after any in-flight add.
        let _entries = self.entries.write();
        self.subscribers.lock().clear();
        if let Some(mut writer) = self.file.lock().take() {
            if let Err(e) = writer.flush() {
                tracing::warn!("Failed to flush log file for '{}': {}", self.service, e);
            }
        }
    }
}

impl Drop for LogBuffer {
    fn drop(&mut self) {
        self.close();
    }
}

fn sanitize_file_name(service: &str) -> String {
    service
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c => c,
        })
        .collect()
}

/// The log buffers of one project, keyed by service name.
pub struct LogManager {
    project_dir: PathBuf,
    buffers: RwLock<HashMap<String, Arc<LogBuffer>>>,
}

impl LogManager {
    pub fn new(project_dir: impl Into<PathBuf>) -> Self {
        Self {
            project_dir: project_dir.into(),
            buffers: RwLock::new(HashMap::new()),
        }
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    /// Create (or replace) the buffer for `service`. A replaced buffer is
    /// closed.
    pub fn create_buffer(&self, service: &str, capacity: usize, file_logging: bool) -> Arc<LogBuffer> {
        let buffer = Arc::new(if file_logging {
            LogBuffer::with_file(service, capacity, &self.project_dir)
        } else {
            LogBuffer::new(service, capacity)
        });
        if let Some(previous) = self
            .buffers
            .write()
            .insert(service.to_string(), buffer.clone())
        {
            previous.close();
        }
        buffer
    }

    pub fn get(&self, service: &str) -> Option<Arc<LogBuffer>> {
        self.buffers.read().get(service).cloned()
    }

    pub fn remove(&self, service: &str) -> Option<Arc<LogBuffer>> {
        let removed = self.buffers.write().remove(service);
        if let Some(buffer) = &removed {
            buffer.close();
        }
        removed
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.buffers.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn close_all(&self) {
        for buffer in self.buffers.read().values() {
            buffer.close();
        }
    }
}
