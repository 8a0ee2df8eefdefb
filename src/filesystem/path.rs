// src/filesystem/path.rs

//! Path bounds and file-name checks
//!
//! Artifact names are built from values that ultimately come from a package
//! (versions, bundle identifiers) so every generated name is checked to be a
//! single path component before it is joined onto a configured directory.

use crate::error::{Error, Result};
use std::path::{Path, PathBuf};

/// Longest path, in bytes, the engine will operate on (exclusive bound)
pub const MAX_PATH_LEN: usize = 4096;

/// Reject a path whose length reaches [`MAX_PATH_LEN`]
///
/// # Examples
///
/// ```
/// use sensor_fwupdate::filesystem::path::check_path_len;
///
/// assert!(check_path_len("/var/lib/sensor/tmp").is_ok());
/// assert!(check_path_len("/".repeat(4096)).is_err());
/// ```
pub fn check_path_len(path: impl AsRef<Path>) -> Result<()> {
    let len = path.as_ref().as_os_str().len();
    if len == 0 {
        return Err(Error::InvalidArgument("Empty path".to_string()));
    }
    if len >= MAX_PATH_LEN {
        return Err(Error::InvalidArgument(format!(
            "Path is {} bytes, limit is {}",
            len,
            MAX_PATH_LEN - 1
        )));
    }
    Ok(())
}

/// Check a generated file name is a single, non-special path component
///
/// # Examples
///
/// ```
/// use sensor_fwupdate::filesystem::path::sanitize_filename;
///
/// assert_eq!(sanitize_filename("custom_000001.json").unwrap(), "custom_000001.json");
/// assert!(sanitize_filename("../custom.json").is_err());
/// assert!(sanitize_filename("a\0b").is_err());
/// ```
pub fn sanitize_filename(name: &str) -> Result<&str> {
    if name.is_empty() {
        return Err(Error::InvalidArgument("Empty filename".to_string()));
    }
    if name == "." || name == ".." {
        return Err(Error::InvalidArgument(format!("Invalid filename: {}", name)));
    }
    if name.contains(['/', '\\', '\0']) {
        return Err(Error::InvalidArgument(format!(
            "Filename contains a separator or NUL: {:?}",
            name
        )));
    }
    Ok(name)
}

/// Join a generated file name onto a directory, enforcing both checks above
pub fn join_filename(dir: impl AsRef<Path>, name: &str) -> Result<PathBuf> {
    let joined = dir.as_ref().join(sanitize_filename(name)?);
    check_path_len(&joined)?;
    Ok(joined)
}
