// src/transaction/mod.rs

//! Update transaction engine
//!
//! [`UpdateEngine`] owns at most one open update transaction and exposes
//! the Begin/Write/Complete/Cancel/Erase operations. Every entry point
//! takes a non-blocking lock first; entering while another call runs
//! returns [`Error::Busy`] instead of blocking.
//!
//! # Transaction Lifecycle
//!
//! ```text
//! Begin -> IDLE -> Write -> WRITING -> Complete (registry saved, context freed)
//!            |                  \-> ERROR -> Cancel
//!            \-> Erase -> ERASE_DONE -> Complete (slot cleared, context freed)
//! ```
//!
//! Write transactions are journalled (see [`journal`]) so that a crash
//! between artifact placement and the registry save is resolved by
//! [`recovery`] at the next Begin. Erasures are made durable by the
//! pending-erasure registry instead.

mod journal;
mod recovery;

pub use journal::{JournalPhase, JournalRecord, UpdateJournal, find_incomplete_journals};
pub use recovery::{RecoveryOutcome, recover_all};

use crate::buffer::{BufferHandle, BufferManager};
use crate::component::{ComponentInfo, TargetComponent, check_target_device};
use crate::config::UpdateConfig;
use crate::filesystem::create_dir_all_durable;
use crate::registry::{Registry, SlotSelection};
use crate::storage::ParameterStore;
use crate::target::{AiModelHandler, TargetHandler, TargetWriter};
use crate::{Error, Result};
use chrono::Utc;
use fs2::FileExt;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Handle of an open update transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UpdateHandle(Uuid);

impl fmt::Display for UpdateHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transaction state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateState {
    /// Slot selected, nothing written yet
    Idle,
    /// Package bytes are being received
    Writing,
    /// Erasure registered, waiting for Complete to clear the slot
    EraseDone,
    /// A step failed; only Cancel is accepted
    Error,
}

/// The single open transaction
struct UpdateContext {
    handle: UpdateHandle,
    handler: usize,
    target_device: String,
    info: ComponentInfo,
    selection: SlotSelection,
    state: UpdateState,
    written: u64,
    writer: Option<Box<dyn TargetWriter>>,
    journal: Option<UpdateJournal>,
    /// Advisory lock on the state directory, held until the context is freed
    lock: File,
    started: Instant,
}

impl UpdateContext {
    fn fail(&mut self, error: Error) -> Error {
        warn!("Update {} failed: {}", self.handle, error);
        self.state = UpdateState::Error;
        error
    }

    fn barrier(&mut self, record: JournalRecord) -> Result<()> {
        match self.journal.as_mut() {
            Some(journal) => journal.write_barrier(record),
            None => Ok(()),
        }
    }

    fn release(self) {
        if let Err(e) = FileExt::unlock(&self.lock) {
            warn!("Failed to release update lock: {}", e);
        }
        debug!(
            "Update {} released after {} ms",
            self.handle,
            self.started.elapsed().as_millis()
        );
    }
}

/// The update engine
pub struct UpdateEngine {
    config: UpdateConfig,
    store: Arc<dyn ParameterStore>,
    buffers: Arc<dyn BufferManager>,
    handlers: Vec<Box<dyn TargetHandler>>,
    active: Mutex<Option<UpdateContext>>,
}

impl UpdateEngine {
    /// Create an engine with the AI-model target registered
    pub fn new(
        config: UpdateConfig,
        store: Arc<dyn ParameterStore>,
        buffers: Arc<dyn BufferManager>,
    ) -> Result<Self> {
        config.validate()?;
        create_dir_all_durable(&config.state_dir)?;

        let ai_model = AiModelHandler::new(&config);
        Ok(Self {
            config,
            store,
            buffers,
            handlers: vec![Box::new(ai_model)],
            active: Mutex::new(None),
        })
    }

    /// Register an additional target, replacing any handler for the same target
    pub fn with_handler(mut self, handler: Box<dyn TargetHandler>) -> Self {
        self.handlers.retain(|h| h.target() != handler.target());
        self.handlers.push(handler);
        self
    }

    pub fn config(&self) -> &UpdateConfig {
        &self.config
    }

    /// Enter an entry point, failing fast if another one is running
    fn enter(&self) -> Result<MutexGuard<'_, Option<UpdateContext>>> {
        match self.active.try_lock() {
            Ok(guard) => Ok(guard),
            Err(TryLockError::WouldBlock) => Err(Error::Busy),
            Err(TryLockError::Poisoned(_)) => {
                Err(Error::Internal("Update engine lock poisoned".to_string()))
            }
        }
    }

    fn handler_index(&self, target: TargetComponent) -> Result<usize> {
        self.handlers
            .iter()
            .position(|h| h.target() == target)
            .ok_or_else(|| Error::Unimplemented(format!("No update handler for {}", target)))
    }

    fn context<'g>(
        guard: &'g mut Option<UpdateContext>,
        handle: UpdateHandle,
    ) -> Result<&'g mut UpdateContext> {
        match guard.as_mut() {
            Some(ctx) if ctx.handle == handle => Ok(ctx),
            _ => Err(Error::InvalidArgument(format!(
                "Unknown update handle {}",
                handle
            ))),
        }
    }

    fn acquire_lock(&self) -> Result<File> {
        let lock_path = self.config.lock_path();
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)?;
        match lock.try_lock_exclusive() {
            Ok(()) => Ok(lock),
            Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
                debug!("{} is held by another engine", lock_path.display());
                Err(Error::Busy)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Resolve journals left by an interrupted write transaction
    fn recover(&self) {
        match recover_all(&self.config.journal_dir(), self.store.as_ref()) {
            Ok(outcomes) => {
                for outcome in outcomes {
                    info!("Recovered interrupted update: {:?}", outcome);
                }
            }
            Err(e) => warn!("Update recovery failed: {}", e),
        }
    }

    /// Sweep pending erasures of every erasable target
    fn clean_up(&self) {
        let registry = Registry::new(self.store.as_ref());
        for handler in &self.handlers {
            let Some(pending) = handler.pending_item() else {
                continue;
            };
            match registry.clean_up_orphans(handler.active_item(), pending, |info| {
                handler.erase(info)
            }) {
                Ok(report) if report.erased + report.failed > 0 => info!(
                    "Orphan cleanup for {}: {} erased, {} left pending",
                    handler.target(),
                    report.erased,
                    report.failed
                ),
                Ok(_) => {}
                Err(e) => warn!("Orphan cleanup for {} failed: {}", handler.target(), e),
            }
        }
    }

    /// Open an update transaction for `info` on `target`
    pub fn begin(
        &self,
        target: TargetComponent,
        target_device: &str,
        info: &ComponentInfo,
    ) -> Result<UpdateHandle> {
        let mut guard = self.enter()?;

        check_target_device(target_device)?;
        info.validate()?;
        let handler_index = self.handler_index(target)?;

        if let Some(ctx) = guard.as_ref() {
            return Err(Error::FailedPrecondition(format!(
                "Update {} is already in progress",
                ctx.handle
            )));
        }

        let lock = self.acquire_lock()?;
        self.recover();
        self.clean_up();

        let handler = &self.handlers[handler_index];
        let selection = Registry::new(self.store.as_ref()).select_slot(
            handler.active_item(),
            handler.layout(),
            info,
        )?;

        let handle = UpdateHandle(Uuid::new_v4());
        info!(
            "Began update {} of {} on {} ({} slot {}, found = {})",
            handle,
            target,
            target_device,
            selection.item,
            selection.slot,
            selection.is_found()
        );

        *guard = Some(UpdateContext {
            handle,
            handler: handler_index,
            target_device: target_device.to_string(),
            info: info.clone(),
            selection,
            state: UpdateState::Idle,
            written: 0,
            writer: None,
            journal: None,
            lock,
            started: Instant::now(),
        });
        Ok(handle)
    }

    /// Pass `size` bytes of a caller buffer to the open transaction
    pub fn write(&self, handle: UpdateHandle, buffer: BufferHandle, size: usize) -> Result<()> {
        let mut guard = self.enter()?;
        let ctx = Self::context(&mut guard, handle)?;
        self.prepare_write(ctx)?;

        let Some(writer) = ctx.writer.as_mut() else {
            return Err(Error::Internal("Writer missing while writing".to_string()));
        };
        let result = self
            .buffers
            .with_mapped(buffer, size, &mut |bytes| writer.write(bytes));
        self.finish_write(ctx, size, result)
    }

    /// Pass bytes owned by the caller to the open transaction
    pub fn write_bytes(&self, handle: UpdateHandle, data: &[u8]) -> Result<()> {
        let mut guard = self.enter()?;
        let ctx = Self::context(&mut guard, handle)?;
        self.prepare_write(ctx)?;

        let result = match ctx.writer.as_mut() {
            Some(writer) => writer.write(data),
            None => Err(Error::Internal("Writer missing while writing".to_string())),
        };
        self.finish_write(ctx, data.len(), result)
    }

    /// Check the state and open the writer on the first call
    fn prepare_write(&self, ctx: &mut UpdateContext) -> Result<()> {
        match ctx.state {
            UpdateState::Writing => return Ok(()),
            UpdateState::Idle => {}
            state => {
                return Err(Error::FailedPrecondition(format!(
                    "Cannot write in state {:?}",
                    state
                )));
            }
        }

        if let Some(existing) = &ctx.selection.existing {
            let error = Error::AlreadyExists(format!(
                "{} slot {} already holds version {}",
                ctx.selection.item, ctx.selection.slot, existing.version
            ));
            return Err(ctx.fail(error));
        }

        let handler = &self.handlers[ctx.handler];
        let mut journal = UpdateJournal::create(&self.config.journal_dir(), &ctx.handle.to_string())?;
        journal.write_barrier(JournalRecord::Begin {
            tx_uuid: ctx.handle.to_string(),
            target: handler.target(),
            target_device: ctx.target_device.clone(),
            item: ctx.selection.item,
            slot: ctx.selection.slot,
            work_dir: handler.work_dir().to_path_buf(),
            timestamp: Utc::now(),
        })?;

        match handler.begin_write(&ctx.info) {
            Ok(writer) => {
                ctx.writer = Some(writer);
                ctx.journal = Some(journal);
                ctx.state = UpdateState::Writing;
                debug!("Update {} is writing", ctx.handle);
                Ok(())
            }
            Err(e) => {
                if let Err(del) = journal.delete() {
                    warn!("Failed to delete journal of update {}: {}", ctx.handle, del);
                }
                Err(e)
            }
        }
    }

    fn finish_write(&self, ctx: &mut UpdateContext, size: usize, result: Result<()>) -> Result<()> {
        if let Err(e) = result {
            return Err(ctx.fail(e));
        }
        ctx.written += size as u64;
        if let Some(version) = ctx.writer.as_ref().and_then(|w| w.version())
            && ctx.info.version != version
        {
            debug!("Update {} carries version {}", ctx.handle, version);
            ctx.info.version = version.to_string();
        }
        Ok(())
    }

    /// Commit the open transaction
    pub fn complete(&self, handle: UpdateHandle) -> Result<()> {
        let mut guard = self.enter()?;
        let ctx = Self::context(&mut guard, handle)?;

        let result = match ctx.state {
            UpdateState::Writing => self.complete_write(ctx),
            UpdateState::EraseDone => self.complete_erase(ctx),
            state => {
                return Err(Error::FailedPrecondition(format!(
                    "Cannot complete in state {:?}",
                    state
                )));
            }
        };
        if let Err(e) = result {
            return Err(ctx.fail(e));
        }

        if let Some(ctx) = guard.take() {
            info!("Completed update {}", ctx.handle);
            ctx.release();
        }
        Ok(())
    }

    fn complete_write(&self, ctx: &mut UpdateContext) -> Result<()> {
        let handler = &self.handlers[ctx.handler];
        let registry = Registry::new(self.store.as_ref());
        registry.check_unique(ctx.selection.item, ctx.selection.slot, &ctx.info, |a, b| {
            handler.same_component(a, b)
        })?;

        let planned = JournalRecord::ArtifactsPlanned {
            version: ctx.info.version.clone(),
            hash: ctx.info.hash_hex(),
            paths: handler.artifact_paths(&ctx.info)?,
        };
        ctx.barrier(planned)?;

        let Some(writer) = ctx.writer.as_mut() else {
            return Err(Error::Internal("Writer missing while writing".to_string()));
        };
        let size = writer.complete(&ctx.info)?;
        let total_size = i32::try_from(size).map_err(|_| {
            Error::InvalidData(format!("Artifact of {} bytes is too large to record", size))
        })?;

        let mut record = ctx.info.clone();
        record.stamp_completed(total_size);
        self.commit_record(ctx, record)
    }

    /// Save the completed record and close the journal
    ///
    /// Once the slot is saved the placed artifacts belong to the registry:
    /// the writer is dropped without cleanup and journal failures are only
    /// logged. Recovery rolls an unfinished journal forward from the slot.
    fn commit_record(&self, ctx: &mut UpdateContext, record: ComponentInfo) -> Result<()> {
        Registry::new(self.store.as_ref()).save_slot(
            ctx.selection.item,
            ctx.selection.slot,
            &record,
        )?;
        ctx.writer = None;
        ctx.info = record;

        let slot = ctx.selection.slot;
        if let Err(e) = ctx.barrier(JournalRecord::RegistryCommitted { slot }) {
            warn!("Failed to journal commit of update {}: {}", ctx.handle, e);
        }

        let duration_ms = ctx.started.elapsed().as_millis() as u64;
        if let Some(mut journal) = ctx.journal.take() {
            let finished = journal
                .write_barrier(JournalRecord::Done {
                    duration_ms,
                    success: true,
                })
                .and_then(|()| journal.archive());
            if let Err(e) = finished {
                warn!("Failed to archive journal of update {}: {}", ctx.handle, e);
            }
        }
        info!(
            "Saved version {} ({} bytes) to {} slot {}",
            ctx.info.version, ctx.info.total_size, ctx.selection.item, ctx.selection.slot
        );
        Ok(())
    }

    fn complete_erase(&self, ctx: &mut UpdateContext) -> Result<()> {
        Registry::new(self.store.as_ref()).save_slot(
            ctx.selection.item,
            ctx.selection.slot,
            &ComponentInfo::default(),
        )?;
        info!(
            "Cleared {} slot {}",
            ctx.selection.item, ctx.selection.slot
        );
        Ok(())
    }

    /// Abandon the open transaction; cleanup failures are only logged
    pub fn cancel(&self, handle: UpdateHandle) -> Result<()> {
        let mut guard = self.enter()?;
        Self::context(&mut guard, handle)?;
        let Some(mut ctx) = guard.take() else {
            return Ok(());
        };

        if let Some(mut writer) = ctx.writer.take() {
            if let Err(e) = writer.cancel() {
                warn!("Failed to clean up update {}: {}", ctx.handle, e);
            }
        } else if ctx.state == UpdateState::EraseDone {
            warn!(
                "Update {} cancelled after erase; the erasure stays registered",
                ctx.handle
            );
        }

        if let Some(mut journal) = ctx.journal.take() {
            let duration_ms = ctx.started.elapsed().as_millis() as u64;
            let finished = journal
                .write_barrier(JournalRecord::Done {
                    duration_ms,
                    success: false,
                })
                .and_then(|()| journal.delete());
            if let Err(e) = finished {
                warn!("Failed to discard journal of update {}: {}", ctx.handle, e);
            }
        }

        info!("Cancelled update {} in state {:?}", ctx.handle, ctx.state);
        ctx.release();
        Ok(())
    }

    /// Register the matched component for erasure and sweep it
    pub fn erase(&self, handle: UpdateHandle) -> Result<()> {
        let mut guard = self.enter()?;
        let ctx = Self::context(&mut guard, handle)?;

        if ctx.state != UpdateState::Idle {
            return Err(Error::FailedPrecondition(format!(
                "Cannot erase in state {:?}",
                ctx.state
            )));
        }
        let Some(existing) = ctx.selection.existing.clone() else {
            let error = Error::NotFound(format!(
                "No registered component with hash {}",
                ctx.info.hash_hex()
            ));
            return Err(ctx.fail(error));
        };

        let handler = &self.handlers[ctx.handler];
        let Some(pending) = handler.pending_item() else {
            return Err(Error::Unimplemented(format!(
                "{} does not support erasure",
                handler.target()
            )));
        };

        if let Err(e) = Registry::new(self.store.as_ref()).register_for_erasure(pending, &existing)
        {
            return Err(ctx.fail(e));
        }
        ctx.state = UpdateState::EraseDone;
        self.clean_up();
        Ok(())
    }

    /// Largest `size` accepted by one write
    pub fn max_write_chunk_size(&self, handle: UpdateHandle) -> Result<u32> {
        let mut guard = self.enter()?;
        let ctx = Self::context(&mut guard, handle)?;
        Ok(self.handlers[ctx.handler].max_write_chunk_size())
    }

    /// Current state of the open transaction
    pub fn state(&self, handle: UpdateHandle) -> Result<UpdateState> {
        let mut guard = self.enter()?;
        Ok(Self::context(&mut guard, handle)?.state)
    }

    /// Bytes passed to the open transaction so far
    pub fn bytes_written(&self, handle: UpdateHandle) -> Result<u64> {
        let mut guard = self.enter()?;
        Ok(Self::context(&mut guard, handle)?.written)
    }

    /// Every slot registered for `target`, in slot order
    ///
    /// Free slots are included with `valid` unset.
    pub fn list_components(
        &self,
        target: TargetComponent,
        target_device: &str,
    ) -> Result<Vec<ComponentInfo>> {
        let _guard = self.enter()?;
        check_target_device(target_device)?;
        let handler = &self.handlers[self.handler_index(target)?];

        Registry::new(self.store.as_ref()).load_all(handler.active_item())
    }
}

impl Drop for UpdateEngine {
    fn drop(&mut self) {
        // Release the lock file if a transaction is still open
        if let Ok(mut guard) = self.active.lock()
            && let Some(ctx) = guard.take()
        {
            ctx.release();
        }
    }
}
