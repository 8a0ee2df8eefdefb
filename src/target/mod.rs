// src/target/mod.rs

//! Per-target update behavior
//!
//! The transaction engine is target-agnostic. Everything that depends on
//! what is being updated (where the artifact lands, how it is converted,
//! which registry holds it, what makes two components "the same") lives
//! behind [`TargetHandler`]. A handler opens a [`TargetWriter`] for each
//! write transaction.
//!
//! Only the AI-model target is implemented; the engine reports
//! `Unimplemented` for targets without a registered handler.

mod ai_model;
pub mod network_info;

pub use ai_model::AiModelHandler;

use crate::Result;
use crate::component::{ComponentInfo, TargetComponent};
use crate::registry::SlotLayout;
use crate::storage::StorageItem;
use std::path::{Path, PathBuf};

/// Capabilities of one updatable target
pub trait TargetHandler: Send + Sync {
    fn target(&self) -> TargetComponent;

    /// Registry of components in use
    fn active_item(&self) -> StorageItem;

    /// Registry of erasures not yet applied; `None` if the target cannot be erased
    fn pending_item(&self) -> Option<StorageItem>;

    fn layout(&self) -> SlotLayout;

    /// Identity used by the uniqueness check at Complete
    fn same_component(&self, a: &ComponentInfo, b: &ComponentInfo) -> bool;

    /// Largest payload accepted by one `Write`
    fn max_write_chunk_size(&self) -> u32;

    /// Scratch directory owned by an open writer
    fn work_dir(&self) -> &Path;

    /// Final locations a completed write of `info` occupies
    fn artifact_paths(&self, info: &ComponentInfo) -> Result<Vec<PathBuf>>;

    /// Start receiving a new component
    fn begin_write(&self, info: &ComponentInfo) -> Result<Box<dyn TargetWriter>>;

    /// Remove a component's artifacts; already-absent artifacts are success
    fn erase(&self, info: &ComponentInfo) -> Result<()>;
}

/// Receiver of one component's package stream
pub trait TargetWriter: Send {
    /// Consume the next extent of the package
    fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Version carried by the package, once it has been read
    fn version(&self) -> Option<&str>;

    /// Finish the stream and place the final artifacts for `info`
    ///
    /// Returns the artifact size recorded as `total_size`.
    fn complete(&mut self, info: &ComponentInfo) -> Result<u64>;

    /// Discard partial and placed artifacts, best effort
    fn cancel(&mut self) -> Result<()>;
}
