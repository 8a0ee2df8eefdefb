// src/lib.rs

//! Sensor firmware update engine
//!
//! Receives firmware and AI-model packages for an intelligent camera
//! sensor as a byte stream, places the converted artifacts on disk and
//! keeps a persistent slot registry of installed components.
//!
//! # Architecture
//!
//! - Streaming parser: packages are parsed incrementally across arbitrary
//!   write boundaries; framing never reaches the artifact
//! - Slot registry: fixed-size records in an injected parameter store
//! - Deferred erasure: erasures are registered first, applied by the
//!   orphan sweep at the start of every transaction
//! - Journalled writes: a crash between artifact placement and the
//!   registry save is rolled back or forward at the next Begin
//! - Single transaction: every entry point fails fast with `Busy` instead
//!   of blocking

pub mod buffer;
pub mod component;
pub mod config;
pub mod convert;
mod error;
pub mod filesystem;
pub mod logging;
pub mod package;
pub mod registry;
pub mod storage;
pub mod target;
pub mod transaction;

pub use buffer::{BufferHandle, BufferManager, HeapBufferManager};
pub use component::{ComponentInfo, TargetComponent};
pub use config::{ConversionWait, UpdateConfig};
pub use error::{Error, Result, ResultCode, result_code};
pub use registry::{Registry, SlotLayout};
pub use storage::{MemoryParameterStore, ParameterStore, SqliteParameterStore, StorageItem};
pub use target::{AiModelHandler, TargetHandler, TargetWriter};
pub use transaction::{RecoveryOutcome, UpdateEngine, UpdateHandle, UpdateState};
