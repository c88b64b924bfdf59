//! Filesystem primitives: atomic writes, file-level backups, enable links

use crate::{Error, Result};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Suffix of the staging file used while a candidate config is checked
pub const TEMP_SUFFIX: &str = ".wizard-tmp";

/// Suffix of single-file backups taken before third-party tools touch a file
pub const FILE_BACKUP_SUFFIX: &str = ".wizard-bak";

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

pub fn temp_path(path: &Path) -> PathBuf {
    with_suffix(path, TEMP_SUFFIX)
}

pub fn file_backup_path(path: &Path) -> PathBuf {
    with_suffix(path, FILE_BACKUP_SUFFIX)
}

/// Write `content` next to `path` and rename it into place
pub fn write_atomic(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = temp_path(path);
    let result = fs::File::create(&tmp)
        .and_then(|mut f| {
            f.write_all(content.as_bytes())?;
            f.sync_all()
        })
        .and_then(|_| fs::rename(&tmp, path));
    if let Err(e) = result {
        fs::remove_file(&tmp).ok();
        return Err(e.into());
    }
    Ok(())
}

/// Copy `path` to its `.wizard-bak` sibling and return the backup path
pub fn backup_file(path: &Path) -> Result<PathBuf> {
    if !path.is_file() {
        return Err(Error::NotFound(format!(
            "Cannot back up missing file: {}",
            path.display()
        )));
    }
    let backup = file_backup_path(path);
    fs::copy(path, &backup)
        .map_err(|e| Error::resource(format!("Failed to back up {}: {}", path.display(), e)))?;
    Ok(backup)
}

/// Put a `.wizard-bak` copy back over `path`
pub fn restore_file_backup(backup: &Path, path: &Path) -> Result<()> {
    let content = fs::read_to_string(backup).map_err(|e| {
        Error::resource(format!("Failed to read backup {}: {}", backup.display(), e))
    })?;
    write_atomic(path, &content)
}

/// Whether anything (including a dangling symlink) exists at `path`
pub fn exists_no_follow(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}

/// Remove a file or symlink; `Ok(false)` when nothing was there
pub fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Create the enable symlink `link -> target`; `Ok(false)` if it already existed
pub fn create_symlink(target: &Path, link: &Path) -> Result<bool> {
    if exists_no_follow(link) {
        return Ok(false);
    }
    if let Some(parent) = link.parent() {
        fs::create_dir_all(parent)?;
    }
    symlink(target, link)?;
    Ok(true)
}

#[cfg(unix)]
pub(crate) fn symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(not(unix))]
pub(crate) fn symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    fs::copy(target, link).map(|_| ())
}

/// Remove staging and backup-suffixed siblings of `path`
pub fn remove_artifacts(path: &Path) -> Result<Vec<PathBuf>> {
    let mut removed = Vec::new();
    for candidate in [temp_path(path), file_backup_path(path)] {
        if remove_if_exists(&candidate)? {
            removed.push(candidate);
        }
    }
    Ok(removed)
}
