//! Per-run context: log sink and outcome counters

use crate::Result;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusLevel {
    Info,
    Success,
    Warning,
    Error,
}

impl StatusLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusLevel::Info => "INFO",
            StatusLevel::Success => "OK",
            StatusLevel::Warning => "WARN",
            StatusLevel::Error => "ERROR",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub timestamp: chrono::DateTime<chrono::Local>,
    pub level: StatusLevel,
    pub message: String,
}

/// Explicit state threaded through every engine operation.
///
/// Entries go to the `log` facade, to an in-memory ring, and to the log
/// file when one is configured.
#[derive(Debug)]
pub struct RunContext {
    entries: Vec<LogEntry>,
    max_entries: usize,
    log_path: Option<PathBuf>,
    errors: u32,
    warnings: u32,
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new()
    }
}

impl RunContext {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            max_entries: 1000,
            log_path: None,
            errors: 0,
            warnings: 0,
        }
    }

    /// Also append every entry to `path`
    pub fn with_log_file(mut self, path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        OpenOptions::new().create(true).append(true).open(path)?;
        self.log_path = Some(path.to_path_buf());
        Ok(self)
    }

    pub fn log(&mut self, level: StatusLevel, message: impl Into<String>) {
        let entry = LogEntry {
            timestamp: chrono::Local::now(),
            level,
            message: message.into(),
        };

        match level {
            StatusLevel::Info | StatusLevel::Success => log::info!("{}", entry.message),
            StatusLevel::Warning => {
                self.warnings += 1;
                log::warn!("{}", entry.message)
            }
            StatusLevel::Error => {
                self.errors += 1;
                log::error!("{}", entry.message)
            }
        }

        if let Some(path) = &self.log_path {
            let line = format!(
                "[{}] [{}] {}\n",
                entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
                level.as_str(),
                entry.message
            );
            // A broken log file must not abort a transaction
            if let Err(e) = OpenOptions::new()
                .append(true)
                .open(path)
                .and_then(|mut f| f.write_all(line.as_bytes()))
            {
                log::debug!("Could not append to {}: {}", path.display(), e);
            }
        }

        self.entries.push(entry);
        if self.entries.len() > self.max_entries {
            self.entries.remove(0);
        }
    }

    pub fn info(&mut self, message: impl Into<String>) {
        self.log(StatusLevel::Info, message);
    }

    pub fn success(&mut self, message: impl Into<String>) {
        self.log(StatusLevel::Success, message);
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.log(StatusLevel::Warning, message);
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.log(StatusLevel::Error, message);
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn error_count(&self) -> u32 {
        self.errors
    }

    pub fn warning_count(&self) -> u32 {
        self.warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_counters() {
        let mut ctx = RunContext::new();
        ctx.info("starting");
        ctx.warn("backend unreachable");
        ctx.error("nginx -t failed");
        ctx.warn("no redirect");

        assert_eq!(ctx.warning_count(), 2);
        assert_eq!(ctx.error_count(), 1);
        assert_eq!(ctx.entries().len(), 4);
        assert_eq!(ctx.entries()[2].level, StatusLevel::Error);
    }

    #[test]
    fn test_log_file_sink() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("logs/run.log");
        let mut ctx = RunContext::new().with_log_file(&path).unwrap();
        ctx.success("site enabled");

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("[OK] site enabled"));
    }
}
