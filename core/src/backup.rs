//! Snapshot and restore of the nginx configuration tree
//!
//! Every snapshot is a fresh timestamped directory under the backup root:
//!
//! ```text
//! <root>/<label>-<YYYYmmdd-HHMMSS-mmm>/
//!     manifest.json
//!     tree/...        copy of the config root, symlinks kept as symlinks
//!     ABSENT          marker written instead of tree/ when there was nothing to copy
//! ```
//!
//! Snapshots are never modified or pruned here.

use crate::fsops;
use crate::{Error, Result};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const MANIFEST_FILE: &str = "manifest.json";
const TREE_DIR: &str = "tree";
const ABSENT_MARKER: &str = "ABSENT";

/// Contents of `manifest.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupManifest {
    pub label: String,
    pub timestamp: DateTime<Local>,
    pub source: PathBuf,
    pub source_present: bool,
    /// Files and symlinks captured, relative to `source`
    pub entries: Vec<PathBuf>,
}

/// Handle to an immutable snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRef {
    pub path: PathBuf,
    pub manifest: BackupManifest,
}

impl BackupRef {
    pub fn timestamp(&self) -> DateTime<Local> {
        self.manifest.timestamp
    }

    pub fn contains(&self, relative: &Path) -> bool {
        self.manifest.entries.iter().any(|e| e == relative)
    }

    fn tree(&self) -> PathBuf {
        self.path.join(TREE_DIR)
    }
}

/// Outcome of a best-effort restore
#[derive(Debug, Clone, Default)]
pub struct RestoreReport {
    pub restored: Vec<PathBuf>,
    pub failures: Vec<(PathBuf, String)>,
}

impl RestoreReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct BackupStore {
    root: PathBuf,
    source: PathBuf,
}

impl BackupStore {
    /// `source` is the tree being protected, `root` where snapshots accumulate
    pub fn new(source: impl Into<PathBuf>, root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            source: source.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Capture the config root. A missing root yields an `ABSENT` snapshot, not an error.
    pub fn snapshot(&self, label: &str) -> Result<BackupRef> {
        fs::create_dir_all(&self.root).map_err(|e| {
            Error::resource(format!(
                "Cannot create backup root {}: {}",
                self.root.display(),
                e
            ))
        })?;

        let timestamp = Local::now();
        let path = self.unique_dir(&sanitize_label(label), &timestamp)?;

        let source_present = self.source.is_dir();
        let entries = if source_present {
            copy_tree(&self.source, &path.join(TREE_DIR), Path::new("")).map_err(|e| {
                Error::resource(format!(
                    "Failed to copy {} into {}: {}",
                    self.source.display(),
                    path.display(),
                    e
                ))
            })?
        } else {
            fs::write(path.join(ABSENT_MARKER), self.source.display().to_string())?;
            Vec::new()
        };

        let manifest = BackupManifest {
            label: label.to_string(),
            timestamp,
            source: self.source.clone(),
            source_present,
            entries,
        };
        fs::write(
            path.join(MANIFEST_FILE),
            serde_json::to_string_pretty(&manifest)?,
        )?;

        log::info!(
            "Backup '{}' written to {} ({} entries)",
            label,
            path.display(),
            manifest.entries.len()
        );
        Ok(BackupRef { path, manifest })
    }

    /// Open an existing snapshot directory
    pub fn open(&self, path: &Path) -> Result<BackupRef> {
        let content = fs::read_to_string(path.join(MANIFEST_FILE)).map_err(|e| {
            Error::resource(format!("Unreadable backup {}: {}", path.display(), e))
        })?;
        let manifest: BackupManifest = serde_json::from_str(&content)?;
        Ok(BackupRef {
            path: path.to_path_buf(),
            manifest,
        })
    }

    /// All snapshots, newest first. Directories without a readable manifest are skipped.
    pub fn list(&self) -> Result<Vec<BackupRef>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut backups = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.is_dir() {
                if let Ok(backup) = self.open(&path) {
                    backups.push(backup);
                }
            }
        }
        backups.sort_by(|a, b| b.manifest.timestamp.cmp(&a.manifest.timestamp));
        Ok(backups)
    }

    /// Put every captured entry back. Individual failures are collected, not fatal.
    pub fn restore(&self, backup: &BackupRef) -> Result<RestoreReport> {
        let mut report = RestoreReport::default();
        if !backup.manifest.source_present {
            log::info!(
                "Backup {} recorded no config root; nothing to restore",
                backup.path.display()
            );
            return Ok(report);
        }
        if !backup.tree().is_dir() {
            return Err(Error::resource(format!(
                "Backup {} has no captured tree",
                backup.path.display()
            )));
        }

        for relative in &backup.manifest.entries {
            match self.restore_entry(backup, relative) {
                Ok(()) => report.restored.push(relative.clone()),
                Err(e) => {
                    log::warn!("Failed to restore {}: {}", relative.display(), e);
                    report.failures.push((relative.clone(), e.to_string()));
                }
            }
        }
        Ok(report)
    }

    /// Restore one captured file or symlink to its original location
    pub fn restore_entry(&self, backup: &BackupRef, relative: &Path) -> Result<()> {
        if !backup.contains(relative) {
            return Err(Error::NotFound(format!(
                "{} is not part of backup {}",
                relative.display(),
                backup.path.display()
            )));
        }
        let src = backup.tree().join(relative);
        let dest = backup.manifest.source.join(relative);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }

        let meta = fs::symlink_metadata(&src)?;
        if meta.file_type().is_symlink() {
            let target = fs::read_link(&src)?;
            fsops::remove_if_exists(&dest)?;
            fsops::symlink(&target, &dest)?;
        } else {
            let tmp = fsops::temp_path(&dest);
            fs::copy(&src, &tmp)?;
            // rename over a symlink replaces the link itself
            if let Err(e) = fs::rename(&tmp, &dest) {
                fs::remove_file(&tmp).ok();
                return Err(e.into());
            }
        }
        Ok(())
    }

    fn unique_dir(&self, label: &str, timestamp: &DateTime<Local>) -> Result<PathBuf> {
        let base = format!("{}-{}", label, timestamp.format("%Y%m%d-%H%M%S-%3f"));
        for attempt in 0..100 {
            let name = if attempt == 0 {
                base.clone()
            } else {
                format!("{}-{}", base, attempt)
            };
            let path = self.root.join(name);
            match fs::create_dir(&path) {
                Ok(()) => return Ok(path),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(Error::resource(format!(
            "Could not allocate a unique backup directory for '{}'",
            label
        )))
    }
}

fn sanitize_label(label: &str) -> String {
    let cleaned: String = label
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "backup".to_string()
    } else {
        cleaned
    }
}

/// Recursive copy that keeps symlinks as symlinks. Returns captured paths relative to the top.
fn copy_tree(src: &Path, dest: &Path, relative: &Path) -> std::io::Result<Vec<PathBuf>> {
    fs::create_dir_all(dest)?;
    let mut captured = Vec::new();

    let mut children: Vec<_> = fs::read_dir(src)?.collect::<std::io::Result<_>>()?;
    children.sort_by_key(|e| e.file_name());

    for entry in children {
        let name = entry.file_name();
        let from = entry.path();
        let to = dest.join(&name);
        let rel = relative.join(&name);
        let file_type = fs::symlink_metadata(&from)?.file_type();

        if file_type.is_symlink() {
            fsops::symlink(&fs::read_link(&from)?, &to)?;
            captured.push(rel);
        } else if file_type.is_dir() {
            captured.extend(copy_tree(&from, &to, &rel)?);
        } else {
            fs::copy(&from, &to)?;
            captured.push(rel);
        }
    }
    Ok(captured)
}
