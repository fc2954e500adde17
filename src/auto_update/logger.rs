// Update Logger
// Dedicated update log file next to the regular `log` output, rotated by size

use chrono::{DateTime, SecondsFormat, Utc};
use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::auto_update::transfer::DownloadProgress;
use crate::auto_update::UpdateError;

/// Log file size that triggers rotation (10 MiB)
const MAX_LOG_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// Rotated files kept next to the live one
const MAX_ROTATED_FILES: usize = 5;

const PROGRESS_STEP_PERCENT: u8 = 10;
const PROGRESS_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

/// One line of the update log
#[derive(Debug, Clone)]
pub struct UpdateLogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    /// Pipeline stage (or `Idle`) the entry was written in
    pub stage: String,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl UpdateLogEntry {
    pub fn new(level: LogLevel, stage: &str, message: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            stage: stage.to_string(),
            message: message.to_string(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// `[<timestamp>] [<LEVEL>] [<stage>] <message>[ | <details>]`
    pub fn format(&self) -> String {
        let details = self
            .details
            .as_ref()
            .map(|d| format!(" | {}", d))
            .unwrap_or_default();

        format!(
            "[{}] [{}] [{}] {}{}",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
            self.level,
            self.stage,
            self.message,
            details
        )
    }
}

#[derive(Debug, Default)]
struct ProgressMark {
    percent: Option<u8>,
    at: Option<Instant>,
}

pub struct UpdateLogger {
    log_file_path: PathBuf,
    file_lock: Mutex<()>,
    progress: Mutex<ProgressMark>,
}

impl UpdateLogger {
    /// Logger writing `update.log` inside `log_dir`
    pub fn new(log_dir: &Path) -> Result<Self, UpdateError> {
        fs::create_dir_all(log_dir).map_err(|e| {
            UpdateError::FileSystem(format!(
                "Failed to create log directory {}: {}",
                log_dir.display(),
                e
            ))
        })?;

        Ok(Self {
            log_file_path: log_dir.join("update.log"),
            file_lock: Mutex::new(()),
            progress: Mutex::new(ProgressMark::default()),
        })
    }

    pub fn log_file_path(&self) -> &Path {
        &self.log_file_path
    }

    pub fn log(&self, entry: &UpdateLogEntry) -> Result<(), UpdateError> {
        let _guard = self.file_lock.lock().unwrap_or_else(PoisonError::into_inner);

        self.rotate_if_needed()?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file_path)
            .map_err(|e| self.io_error("open", e))?;

        let mut writer = BufWriter::new(file);
        writeln!(writer, "{}", entry.format()).map_err(|e| self.io_error("write", e))?;
        writer.flush().map_err(|e| self.io_error("write", e))?;
        Ok(())
    }

    pub fn info(&self, stage: &str, message: &str) -> Result<(), UpdateError> {
        self.log(&UpdateLogEntry::new(LogLevel::Info, stage, message))
    }

    pub fn warn(&self, stage: &str, message: &str) -> Result<(), UpdateError> {
        self.log(&UpdateLogEntry::new(LogLevel::Warn, stage, message))
    }

    pub fn debug(&self, stage: &str, message: &str) -> Result<(), UpdateError> {
        self.log(&UpdateLogEntry::new(LogLevel::Debug, stage, message))
    }

    /// Error entry carrying the serialized error as details
    pub fn failure(&self, stage: &str, error: &UpdateError) -> Result<(), UpdateError> {
        let mut entry = UpdateLogEntry::new(LogLevel::Error, stage, &error.to_string());
        if let Ok(details) = serde_json::to_value(error) {
            entry = entry.with_details(details);
        }
        self.log(&entry)
    }

    /// Log download progress every 10 percentage points, or every 30 seconds
    /// when the total is unknown or the download is slow
    pub fn log_progress(&self, stage: &str, progress: &DownloadProgress) -> Result<(), UpdateError> {
        let percent = progress.percentage.clamp(0.0, 100.0) as u8;
        let now = Instant::now();

        let due = {
            let mut mark = self.progress.lock().unwrap_or_else(PoisonError::into_inner);
            let step_due = progress.total_bytes.is_some()
                && match mark.percent {
                    None => true,
                    Some(last) => percent >= last.saturating_add(PROGRESS_STEP_PERCENT) || percent < last,
                };
            let time_due = match mark.at {
                None => true,
                Some(at) => now.duration_since(at) >= PROGRESS_INTERVAL,
            };
            if step_due || time_due {
                mark.percent = Some(percent);
                mark.at = Some(now);
            }
            step_due || time_due
        };

        if !due {
            return Ok(());
        }

        let message = match progress.total_bytes {
            Some(total) => format!(
                "Download progress: {}% ({} / {} bytes)",
                percent, progress.bytes_downloaded, total
            ),
            None => format!("Download progress: {} bytes", progress.bytes_downloaded),
        };
        self.info(stage, &message)
    }

    /// Call before each new download
    pub fn reset_progress_tracking(&self) {
        *self.progress.lock().unwrap_or_else(PoisonError::into_inner) = ProgressMark::default();
    }

    pub fn log_handoff(
        &self,
        old_version: &str,
        new_version: &str,
        duration: Duration,
    ) -> Result<(), UpdateError> {
        let entry = UpdateLogEntry::new(
            LogLevel::Info,
            "HandoffRequested",
            &format!(
                "Update staged: {} -> {} (took {} seconds)",
                old_version,
                new_version,
                duration.as_secs()
            ),
        )
        .with_details(serde_json::json!({
            "old_version": old_version,
            "new_version": new_version,
            "duration_seconds": duration.as_secs()
        }));
        self.log(&entry)
    }

    pub fn current_file_size(&self) -> Result<u64, UpdateError> {
        match fs::metadata(&self.log_file_path) {
            Ok(metadata) => Ok(metadata.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(self.io_error("stat", e)),
        }
    }

    /// Live file first, then `update.1.log` onwards
    pub fn list_log_files(&self) -> Vec<PathBuf> {
        std::iter::once(self.log_file_path.clone())
            .chain((1..=MAX_ROTATED_FILES).map(|i| self.rotated_path(i)))
            .filter(|path| path.exists())
            .collect()
    }

    fn rotated_path(&self, index: usize) -> PathBuf {
        let dir = self.log_file_path.parent().unwrap_or(Path::new("."));
        dir.join(format!("update.{}.log", index))
    }

    fn rotate_if_needed(&self) -> Result<(), UpdateError> {
        if self.current_file_size()? >= MAX_LOG_FILE_SIZE {
            self.rotate_logs()?;
        }
        Ok(())
    }

    fn rotate_logs(&self) -> Result<(), UpdateError> {
        let oldest = self.rotated_path(MAX_ROTATED_FILES);
        if oldest.exists() {
            fs::remove_file(&oldest).map_err(|e| self.io_error("rotate", e))?;
        }

        for i in (1..MAX_ROTATED_FILES).rev() {
            let from = self.rotated_path(i);
            if from.exists() {
                fs::rename(&from, self.rotated_path(i + 1)).map_err(|e| self.io_error("rotate", e))?;
            }
        }

        fs::rename(&self.log_file_path, self.rotated_path(1)).map_err(|e| self.io_error("rotate", e))?;
        Ok(())
    }

    fn io_error(&self, action: &str, e: std::io::Error) -> UpdateError {
        UpdateError::FileSystem(format!(
            "Failed to {} {}: {}",
            action,
            self.log_file_path.display(),
            e
        ))
    }
}
