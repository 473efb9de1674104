use crate::models::{LogLevel, ServiceMessage, ServiceMessageKind, SessionLog};
use crate::utils::error::Result;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Sink for structured session events
///
/// The core never renders anything itself; front ends implement this to
/// show lifecycle changes and service messages.
pub trait Notifier: Send + Sync {
    fn session_event(&self, entry: SessionLog);

    fn service_message(&self, _message: &ServiceMessage) {}
}

/// Session lifecycle journal
pub struct LogService {
    /// In-memory log buffer (most recent logs)
    logs: Arc<RwLock<VecDeque<SessionLog>>>,

    /// Maximum logs to keep in memory
    max_memory_logs: usize,

    /// Optional log file path
    log_file_path: Option<PathBuf>,
}

impl LogService {
    pub fn new(max_memory_logs: usize) -> Self {
        Self {
            logs: Arc::new(RwLock::new(VecDeque::with_capacity(max_memory_logs))),
            max_memory_logs,
            log_file_path: None,
        }
    }

    /// Create with file logging enabled
    pub fn with_file(mut self, log_file_path: PathBuf) -> Self {
        self.log_file_path = Some(log_file_path);
        self
    }

    /// Record an entry and wait for the file append
    pub async fn log(&self, entry: SessionLog) -> Result<()> {
        self.push(entry.clone());

        if let Some(ref file_path) = self.log_file_path {
            write_to_file(file_path, &entry).await?;
        }

        Ok(())
    }

    fn push(&self, entry: SessionLog) {
        match entry.level {
            LogLevel::Info => tracing::info!("{}", entry.format()),
            LogLevel::Warning => tracing::warn!("{}", entry.format()),
            LogLevel::Error => tracing::error!("{}", entry.format()),
        }

        let mut logs = self.logs.write();
        if logs.len() >= self.max_memory_logs {
            logs.pop_front();
        }
        logs.push_back(entry);
    }

    pub fn get_logs(&self) -> Vec<SessionLog> {
        self.logs.read().iter().cloned().collect()
    }

    pub fn get_logs_for_session(&self, session_id: Uuid) -> Vec<SessionLog> {
        self.logs
            .read()
            .iter()
            .filter(|log| log.session_id == session_id)
            .cloned()
            .collect()
    }

    /// Entries recorded under a connection identity (`user@host:port`)
    pub fn get_logs_for_identity(&self, identity: &str) -> Vec<SessionLog> {
        self.logs
            .read()
            .iter()
            .filter(|log| log.identity == identity)
            .cloned()
            .collect()
    }

    pub fn get_logs_in_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<SessionLog> {
        self.logs
            .read()
            .iter()
            .filter(|log| log.timestamp >= start && log.timestamp <= end)
            .cloned()
            .collect()
    }

    pub fn get_logs_by_level(&self, level: LogLevel) -> Vec<SessionLog> {
        self.logs
            .read()
            .iter()
            .filter(|log| log.level == level)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.logs.write().clear();
    }

    /// Get recent logs (last N)
    pub fn get_recent(&self, count: usize) -> Vec<SessionLog> {
        let logs = self.logs.read();
        logs.iter().skip(logs.len().saturating_sub(count)).cloned().collect()
    }
}

impl Notifier for LogService {
    fn session_event(&self, entry: SessionLog) {
        self.push(entry.clone());

        // Appends happen off the caller; outside a runtime the file is skipped
        if let Some(path) = self.log_file_path.clone() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    if let Err(e) = write_to_file(&path, &entry).await {
                        tracing::warn!("Session journal append failed: {}", e);
                    }
                });
            }
        }
    }

    fn service_message(&self, message: &ServiceMessage) {
        match message.kind {
            ServiceMessageKind::Error => tracing::error!("[{}] {}", message.session_id, message.text),
            ServiceMessageKind::Warning => tracing::warn!("[{}] {}", message.session_id, message.text),
            _ => tracing::info!("[{}] {}", message.session_id, message.text),
        }
    }
}

async fn write_to_file(file_path: &Path, entry: &SessionLog) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(file_path)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to open log file {}: {}", file_path.display(), e))?;

    let log_line = format!("{}\n", entry.format());

    file.write_all(log_line.as_bytes())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to write to log file: {}", e))?;

    file.flush()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to flush log file: {}", e))?;

    Ok(())
}
