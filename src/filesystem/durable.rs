// src/filesystem/durable.rs

//! Crash-safe filesystem primitives
//!
//! Every mutating helper here makes its directory-entry change durable
//! before returning: after `mkdir`, `unlink`, `rmdir` or a create-truncate,
//! the parent directory is opened and fsync'd. A power loss after a helper
//! returns `Ok` can therefore never expose a half-applied change.
//!
//! No helper retries. Errors carry the failing path and are propagated.

use super::path::check_path_len;
use crate::error::{Error, Result};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info};

/// Parent directory of `path`, treating a bare file name as relative to `.`
fn parent_of(path: &Path) -> Result<PathBuf> {
    match path.parent() {
        Some(parent) if parent.as_os_str().is_empty() => Ok(PathBuf::from(".")),
        Some(parent) => Ok(parent.to_path_buf()),
        None => Err(Error::InvalidArgument(format!(
            "No parent directory for {}",
            path.display()
        ))),
    }
}

fn fsync_dir(dir: &Path) -> Result<()> {
    let handle = File::open(dir).map_err(|e| {
        Error::Internal(format!("Failed to open directory {}: {}", dir.display(), e))
    })?;
    handle.sync_all().map_err(|e| {
        Error::Internal(format!("Failed to fsync directory {}: {}", dir.display(), e))
    })
}

/// Fsync the directory that contains `path`
pub fn fsync_parent_dir(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    check_path_len(path)?;
    fsync_dir(&parent_of(path)?)
}

/// Flush and fsync an open file
pub fn flush_and_sync(file: &mut File) -> Result<()> {
    file.flush()?;
    file.sync_all()?;
    Ok(())
}

/// Create a directory and all missing ancestors, durably
///
/// Components are created left to right and each newly created level's
/// parent is fsync'd before the next level is touched, so a crash part way
/// leaves a durable prefix of the chain.
pub fn create_dir_all_durable(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    check_path_len(path)?;

    let mut current = PathBuf::new();
    for component in path.components() {
        current.push(component);
        if !matches!(component, Component::Normal(_)) {
            continue;
        }

        match fs::create_dir(&current) {
            Ok(()) => {
                debug!("Created directory {}", current.display());
                fsync_dir(&parent_of(&current)?)?;
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                if !current.is_dir() {
                    return Err(Error::Internal(format!(
                        "{} exists and is not a directory",
                        current.display()
                    )));
                }
            }
            Err(e) => {
                return Err(Error::Internal(format!(
                    "Failed to create directory {}: {}",
                    current.display(),
                    e
                )));
            }
        }
    }

    Ok(())
}

/// Remove a directory tree, durably
///
/// A missing directory is success.
pub fn remove_dir_all_durable(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    check_path_len(path)?;
    remove_dir_inner(path, false)
}

/// Depth-first removal. Nested calls skip the final parent fsync because the
/// enclosing call fsyncs that same directory once its listing is empty.
fn remove_dir_inner(dir: &Path, nested: bool) -> Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            info!("Directory does not exist: {}", dir.display());
            return Ok(());
        }
        Err(e) => {
            return Err(Error::Internal(format!(
                "Failed to open directory {}: {}",
                dir.display(),
                e
            )));
        }
    };

    for entry in entries {
        let entry = entry?;
        let entry_path = entry.path();
        check_path_len(&entry_path).map_err(|e| Error::Internal(e.to_string()))?;

        // file_type() does not follow symlinks, so a link to a directory is unlinked
        if entry.file_type()?.is_dir() {
            remove_dir_inner(&entry_path, true)?;
        } else {
            fs::remove_file(&entry_path).map_err(|e| {
                Error::Internal(format!("Failed to remove {}: {}", entry_path.display(), e))
            })?;
        }
    }

    fsync_dir(dir)?;
    fs::remove_dir(dir).map_err(|e| {
        Error::Internal(format!("Failed to remove directory {}: {}", dir.display(), e))
    })?;

    if !nested {
        fsync_dir(&parent_of(dir)?)?;
    }
    debug!("Removed directory {}", dir.display());
    Ok(())
}

/// Create (or truncate) a file to zero length, durably, and keep it open
pub fn create_file_durable(path: impl AsRef<Path>) -> Result<File> {
    let path = path.as_ref();
    check_path_len(path)?;

    let mut file = File::create(path).map_err(|e| {
        Error::Internal(format!("Failed to create {}: {}", path.display(), e))
    })?;
    flush_and_sync(&mut file)?;
    fsync_parent_dir(path)?;
    Ok(file)
}

/// Remove a file, durably
///
/// An absent file is success and no fsync is issued since no directory
/// entry changed.
pub fn remove_file_durable(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    check_path_len(path)?;

    match fs::remove_file(path) {
        Ok(()) => {
            debug!("Removed {}", path.display());
            fsync_parent_dir(path)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            info!("File does not exist: {}", path.display());
            Ok(())
        }
        Err(e) => Err(Error::Internal(format!(
            "Failed to remove {}: {}",
            path.display(),
            e
        ))),
    }
}

/// Write a whole file, fsync it and its directory entry
pub fn write_file_durable(path: impl AsRef<Path>, content: &[u8]) -> Result<()> {
    let path = path.as_ref();
    check_path_len(path)?;

    let mut file = File::create(path).map_err(|e| {
        Error::Internal(format!("Failed to create {}: {}", path.display(), e))
    })?;
    file.write_all(content)?;
    flush_and_sync(&mut file)?;
    drop(file);

    fsync_parent_dir(path)
}
