// src/storage/memory.rs
//! In-memory parameter store

use super::{ParameterStore, StorageItem, check_range, splice};
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// Parameter store backed by a map, lost on drop
#[derive(Debug, Default)]
pub struct MemoryParameterStore {
    items: Mutex<HashMap<StorageItem, Vec<u8>>>,
}

impl MemoryParameterStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn items(&self) -> Result<MutexGuard<'_, HashMap<StorageItem, Vec<u8>>>> {
        self.items
            .lock()
            .map_err(|_| Error::Internal("Parameter store lock poisoned".to_string()))
    }
}

impl ParameterStore for MemoryParameterStore {
    fn size(&self, item: StorageItem) -> Result<usize> {
        Ok(self.items()?.get(&item).map_or(0, Vec::len))
    }

    fn load(&self, item: StorageItem, offset: usize, buf: &mut [u8]) -> Result<()> {
        let items = self.items()?;
        let blob = items.get(&item).map_or(&[][..], Vec::as_slice);
        check_range(item, blob.len(), offset, buf.len())?;
        buf.copy_from_slice(&blob[offset..offset + buf.len()]);
        Ok(())
    }

    fn save(&self, item: StorageItem, offset: usize, data: &[u8]) -> Result<()> {
        splice(self.items()?.entry(item).or_default(), offset, data);
        Ok(())
    }
}
