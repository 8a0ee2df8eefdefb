// src/filesystem/mod.rs

//! Filesystem operations for the update engine
//!
//! This module provides:
//! - Crash-safe primitives that fsync the parent directory after every
//!   directory-entry change
//! - Path length bounds and generated file-name checks
//! - Atomic file placement with a cross-filesystem fallback

mod durable;
pub mod path;

pub use durable::{
    create_dir_all_durable, create_file_durable, flush_and_sync, fsync_parent_dir,
    remove_dir_all_durable, remove_file_durable, write_file_durable,
};

use crate::Result;
use std::fs::{self, File};
use std::path::Path;
use tracing::debug;

/// Move a file atomically, falling back to copy+sync+delete for cross-filesystem moves.
///
/// This handles the EXDEV error that occurs when the working directory and
/// the destination live on different filesystems (e.g. tmpfs and flash).
/// The destination's directory entry is fsync'd before returning.
pub fn move_file_atomic(src: &Path, dst: &Path) -> Result<()> {
    path::check_path_len(src)?;
    path::check_path_len(dst)?;

    match fs::rename(src, dst) {
        Ok(()) => {}
        Err(e) if e.raw_os_error() == Some(libc::EXDEV) => {
            debug!(
                "Cross-filesystem move detected ({} -> {}), using copy fallback",
                src.display(),
                dst.display()
            );

            fs::copy(src, dst)?;

            // Content must be on disk before the source disappears
            let file = File::open(dst)?;
            file.sync_all()?;
            drop(file);

            fsync_parent_dir(dst)?;
            remove_file_durable(src)?;
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    }

    fsync_parent_dir(dst)?;
    fsync_parent_dir(src)
}
