// src/storage/mod.rs

//! Persistent parameter store interface
//!
//! The engine keeps its registries as opaque byte blobs addressed by
//! [`StorageItem`]. A store supports reading the blob size, loading a byte
//! range and saving a byte range at an offset (growing the blob as needed).
//! Two backends are provided: SQLite for devices and an in-memory map for
//! tests and hosts without persistence.

mod memory;
mod sqlite;

pub use memory::MemoryParameterStore;
pub use sqlite::SqliteParameterStore;

use crate::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use strum_macros::{Display, EnumString};

/// Keys of the blobs the engine owns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize)]
pub enum StorageItem {
    /// AI-model active registry
    FwMgrBinaryInfo1,
    /// AI-model pending-erasure registry
    FwMgrBinaryInfo2,
}

/// Byte-addressed blob storage
///
/// Implementations are not locked by the engine beyond its own
/// serialization; nothing else may write the same items concurrently.
pub trait ParameterStore: Send + Sync {
    /// Current blob length in bytes, 0 for a never-saved item
    fn size(&self, item: StorageItem) -> Result<usize>;

    /// Fill `buf` from `offset`; the range must lie within the blob
    fn load(&self, item: StorageItem, offset: usize, buf: &mut [u8]) -> Result<()>;

    /// Write `data` at `offset`, zero-filling any gap past the current end
    fn save(&self, item: StorageItem, offset: usize, data: &[u8]) -> Result<()>;
}

impl<T: ParameterStore + ?Sized> ParameterStore for Arc<T> {
    fn size(&self, item: StorageItem) -> Result<usize> {
        (**self).size(item)
    }

    fn load(&self, item: StorageItem, offset: usize, buf: &mut [u8]) -> Result<()> {
        (**self).load(item, offset, buf)
    }

    fn save(&self, item: StorageItem, offset: usize, data: &[u8]) -> Result<()> {
        (**self).save(item, offset, data)
    }
}

/// Splice `data` into `blob` at `offset`, shared by the backends
fn splice(blob: &mut Vec<u8>, offset: usize, data: &[u8]) {
    let end = offset + data.len();
    if blob.len() < end {
        blob.resize(end, 0);
    }
    blob[offset..end].copy_from_slice(data);
}

/// Bounds check shared by the backends
fn check_range(item: StorageItem, blob_len: usize, offset: usize, len: usize) -> Result<()> {
    match offset.checked_add(len) {
        Some(end) if end <= blob_len => Ok(()),
        _ => Err(crate::Error::InvalidArgument(format!(
            "Range {}+{} outside {} ({} bytes)",
            offset, len, item, blob_len
        ))),
    }
}
