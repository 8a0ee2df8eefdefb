// src/buffer.rs

//! Payload buffer manager interface
//!
//! Callers hand `Write` a [`BufferHandle`] to memory owned by a buffer
//! manager rather than a byte slice. The engine maps the buffer only for
//! the duration of one write; [`BufferManager::with_mapped`] scopes the
//! mapping so it is released on every exit path.

use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

/// Opaque reference to a caller-owned buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub u64);

/// Memory the engine can map read-only for one write
pub trait BufferManager: Send + Sync {
    /// Map the first `size` bytes of `handle` and pass them to `f`
    ///
    /// A buffer that cannot be mapped is `ResourceExhausted`.
    fn with_mapped(
        &self,
        handle: BufferHandle,
        size: usize,
        f: &mut dyn FnMut(&[u8]) -> Result<()>,
    ) -> Result<()>;
}

/// Buffer manager over process heap allocations
#[derive(Debug, Default)]
pub struct HeapBufferManager {
    buffers: Mutex<HashMap<BufferHandle, Vec<u8>>>,
    next: AtomicU64,
}

impl HeapBufferManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of `data` and return its handle
    pub fn allocate(&self, data: Vec<u8>) -> Result<BufferHandle> {
        let handle = BufferHandle(self.next.fetch_add(1, Ordering::Relaxed) + 1);
        self.buffers()?.insert(handle, data);
        Ok(handle)
    }

    /// Release a buffer; unknown handles are ignored
    pub fn free(&self, handle: BufferHandle) -> Result<()> {
        self.buffers()?.remove(&handle);
        Ok(())
    }

    fn buffers(&self) -> Result<MutexGuard<'_, HashMap<BufferHandle, Vec<u8>>>> {
        self.buffers
            .lock()
            .map_err(|_| Error::Internal("Buffer manager lock poisoned".to_string()))
    }
}

impl BufferManager for HeapBufferManager {
    fn with_mapped(
        &self,
        handle: BufferHandle,
        size: usize,
        f: &mut dyn FnMut(&[u8]) -> Result<()>,
    ) -> Result<()> {
        let buffers = self.buffers()?;
        let data = buffers.get(&handle).ok_or_else(|| {
            Error::ResourceExhausted(format!("Failed to map unknown buffer {:?}", handle))
        })?;
        let mapped = data.get(..size).ok_or_else(|| {
            Error::ResourceExhausted(format!(
                "Failed to map {} bytes of {}-byte buffer {:?}",
                size,
                data.len(),
                handle
            ))
        })?;
        debug!("Mapped {} bytes of buffer {:?}", size, handle);
        f(mapped)
    }
}
