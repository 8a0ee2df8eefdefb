// src/registry.rs

//! Slot-based component registry
//!
//! A registry is an array of fixed-size [`ComponentInfo`] records stored as
//! one blob in the parameter store. The slot count is the blob size divided
//! by [`RECORD_SIZE`]; it is never stored separately.
//!
//! Each erasable target has two registries:
//!
//! - **active**: components the device currently uses
//! - **pending erasure**: write-ahead record of erasures whose artifacts
//!   have not been confirmed removed
//!
//! An erase is first appended to the pending registry (the durability
//! point). [`Registry::clean_up_orphans`] later removes the artifacts,
//! clears the matching active entries and finally clears the pending entry.
//! Active is persisted before pending, so a crash in between leaves a
//! pending entry that the next cleanup erases again; erasing an absent
//! artifact succeeds, so the sweep converges.

use crate::component::{ComponentInfo, RECORD_SIZE};
use crate::error::{Error, Result};
use crate::storage::{ParameterStore, StorageItem};
use tracing::{debug, info, warn};

/// Slot arrangement of a target's active registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotLayout {
    /// One slot, replaced in place
    Single,
    /// Up to `capacity` independent slots
    Multi { capacity: usize },
}

/// Where a new component will be written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotSelection {
    pub item: StorageItem,
    pub slot: usize,
    /// Existing valid record with the same content, if the slot holds one
    pub existing: Option<ComponentInfo>,
}

impl SlotSelection {
    pub fn offset(&self) -> usize {
        self.slot * RECORD_SIZE
    }

    pub fn is_found(&self) -> bool {
        self.existing.is_some()
    }
}

/// Outcome of one orphan sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Pending entries whose artifacts were erased and cleared
    pub erased: usize,
    /// Pending entries left for the next sweep
    pub failed: usize,
    /// Active entries cleared alongside
    pub active_cleared: usize,
}

/// Registry operations over a parameter store
pub struct Registry<'a> {
    store: &'a dyn ParameterStore,
}

impl<'a> Registry<'a> {
    pub fn new(store: &'a dyn ParameterStore) -> Self {
        Self { store }
    }

    /// Load every slot of `item`
    pub fn load_all(&self, item: StorageItem) -> Result<Vec<ComponentInfo>> {
        let size = self.store.size(item)?;
        if size % RECORD_SIZE != 0 {
            warn!(
                "{} holds {} bytes, not a multiple of {}; ignoring the tail",
                item, size, RECORD_SIZE
            );
        }
        let slots = size / RECORD_SIZE;
        if slots == 0 {
            return Ok(Vec::new());
        }

        let mut blob = vec![0u8; slots * RECORD_SIZE];
        self.store.load(item, 0, &mut blob)?;
        blob.chunks_exact(RECORD_SIZE)
            .map(ComponentInfo::decode)
            .collect()
    }

    /// Write one record into `slot`, growing the blob if needed
    pub fn save_slot(&self, item: StorageItem, slot: usize, info: &ComponentInfo) -> Result<()> {
        let record = info.encode()?;
        self.store.save(item, slot * RECORD_SIZE, &record)?;
        debug!("Saved {} slot {} (valid = {})", item, slot, info.valid);
        Ok(())
    }

    /// Rewrite every slot of `item`
    pub fn save_all(&self, item: StorageItem, infos: &[ComponentInfo]) -> Result<()> {
        let mut blob = Vec::with_capacity(infos.len() * RECORD_SIZE);
        for info in infos {
            blob.extend_from_slice(&info.encode()?);
        }
        self.store.save(item, 0, &blob)
    }

    /// Pick the slot a new component will occupy
    ///
    /// A valid slot with the same content wins; otherwise the first free
    /// slot, or a new slot past the end while capacity remains.
    pub fn select_slot(
        &self,
        item: StorageItem,
        layout: SlotLayout,
        info: &ComponentInfo,
    ) -> Result<SlotSelection> {
        let slots = self.load_all(item)?;

        let capacity = match layout {
            SlotLayout::Single => {
                let existing = slots
                    .first()
                    .filter(|current| current.valid && current.same_content(info))
                    .cloned();
                return Ok(SlotSelection {
                    item,
                    slot: 0,
                    existing,
                });
            }
            SlotLayout::Multi { capacity } => capacity,
        };

        if let Some((slot, existing)) = slots
            .iter()
            .enumerate()
            .find(|(_, s)| s.valid && s.same_content(info))
        {
            debug!("{} slot {} already holds this content", item, slot);
            return Ok(SlotSelection {
                item,
                slot,
                existing: Some(existing.clone()),
            });
        }

        let free = slots.iter().position(|s| !s.valid).unwrap_or(slots.len());
        if free >= capacity {
            return Err(Error::ResourceExhausted(format!(
                "All {} slots of {} are in use",
                capacity, item
            )));
        }

        Ok(SlotSelection {
            item,
            slot: free,
            existing: None,
        })
    }

    /// Fail if a valid slot other than `exclude_slot` holds the same component
    pub fn check_unique(
        &self,
        item: StorageItem,
        exclude_slot: usize,
        info: &ComponentInfo,
        same_component: impl Fn(&ComponentInfo, &ComponentInfo) -> bool,
    ) -> Result<()> {
        let slots = self.load_all(item)?;
        for (slot, existing) in slots.iter().enumerate() {
            if slot != exclude_slot && existing.valid && same_component(existing, info) {
                return Err(Error::AlreadyExists(format!(
                    "{} slot {} already holds component version {}",
                    item, slot, existing.version
                )));
            }
        }
        Ok(())
    }

    /// Append `info` to the pending-erasure registry at its first free slot
    pub fn register_for_erasure(&self, pending: StorageItem, info: &ComponentInfo) -> Result<()> {
        let slots = self.load_all(pending)?;
        let free = slots.iter().position(|s| !s.valid).unwrap_or(slots.len());

        let mut entry = info.clone();
        entry.valid = true;
        self.save_slot(pending, free, &entry)?;

        info!(
            "Registered version {} for erasure in {} slot {}",
            info.version, pending, free
        );
        Ok(())
    }

    /// Erase every pending entry and reconcile the active registry
    ///
    /// `erase` removes a component's artifacts and must treat already-absent
    /// artifacts as success. Entries it fails on stay pending.
    pub fn clean_up_orphans(
        &self,
        active: StorageItem,
        pending: StorageItem,
        mut erase: impl FnMut(&ComponentInfo) -> Result<()>,
    ) -> Result<CleanupReport> {
        let mut pending_slots = self.load_all(pending)?;
        let mut report = CleanupReport::default();
        if !pending_slots.iter().any(|s| s.valid) {
            debug!("No components pending erasure");
            return Ok(report);
        }

        let mut active_slots = self.load_all(active)?;

        for (slot, entry) in pending_slots.iter_mut().enumerate() {
            if !entry.valid {
                continue;
            }
            if let Err(e) = erase(entry) {
                warn!(
                    "Erasing version {} failed, will retry on next transaction: {}",
                    entry.version, e
                );
                report.failed += 1;
                continue;
            }

            for registered in active_slots.iter_mut() {
                if registered.valid && registered.same_content(entry) {
                    *registered = ComponentInfo::default();
                    report.active_cleared += 1;
                }
            }
            info!("Cleaned up orphaned component at pending slot {}", slot);
            *entry = ComponentInfo::default();
            report.erased += 1;
        }

        if report.active_cleared > 0 {
            self.save_all(active, &active_slots)?;
        }
        if report.erased > 0 {
            self.save_all(pending, &pending_slots)?;
        }
        Ok(report)
    }
}
