// tests/recovery.rs

//! Crash recovery: interrupted erasures and interrupted writes.

mod common;

use chrono::Utc;
use common::{Harness, component, hash};
use sensor_fwupdate::transaction::{JournalRecord, UpdateJournal, find_incomplete_journals};
use sensor_fwupdate::{
    ComponentInfo, Error, MemoryParameterStore, ParameterStore, Registry, Result, StorageItem,
    TargetComponent,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

const ACTIVE: StorageItem = StorageItem::FwMgrBinaryInfo1;
const PENDING: StorageItem = StorageItem::FwMgrBinaryInfo2;

/// Store whose next save to one item fails, as if power was lost
struct FlakyStore {
    inner: MemoryParameterStore,
    fail_item: StorageItem,
    armed: AtomicBool,
}

impl ParameterStore for FlakyStore {
    fn size(&self, item: StorageItem) -> Result<usize> {
        self.inner.size(item)
    }

    fn load(&self, item: StorageItem, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.inner.load(item, offset, buf)
    }

    fn save(&self, item: StorageItem, offset: usize, data: &[u8]) -> Result<()> {
        if item == self.fail_item && self.armed.swap(false, Ordering::SeqCst) {
            return Err(Error::Internal(format!("Simulated crash saving {}", item)));
        }
        self.inner.save(item, offset, data)
    }
}

fn record(version: &str, hash_byte: u8) -> ComponentInfo {
    let mut info = ComponentInfo::new(version, hash(hash_byte));
    info.stamp_completed(64);
    info
}

#[test]
fn test_cleanup_converges_after_crash_between_saves() {
    let store = FlakyStore {
        inner: MemoryParameterStore::new(),
        fail_item: PENDING,
        armed: AtomicBool::new(false),
    };
    let registry = Registry::new(&store);
    let doomed = record("000000111111", 1);
    let kept = record("000000222222", 2);
    registry.save_all(ACTIVE, &[doomed.clone(), kept.clone()]).unwrap();
    registry.register_for_erasure(PENDING, &doomed).unwrap();

    let temp_dir = tempfile::tempdir().unwrap();
    let artifact = temp_dir.path().join("doomed.rpk");
    fs::write(&artifact, b"model").unwrap();
    let erase = |_: &ComponentInfo| -> Result<()> {
        match fs::remove_file(&artifact) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    };

    // Active is saved, then the pending save is lost
    store.armed.store(true, Ordering::SeqCst);
    assert!(registry.clean_up_orphans(ACTIVE, PENDING, erase).is_err());
    assert!(!artifact.exists());
    assert!(registry.load_all(PENDING).unwrap()[0].valid);
    let after_crash = registry.load_all(ACTIVE).unwrap();
    assert!(!after_crash[0].valid);

    // Restart: erasing the absent artifact succeeds and the state settles
    let report = registry.clean_up_orphans(ACTIVE, PENDING, erase).unwrap();
    assert_eq!(report.erased, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(registry.load_all(ACTIVE).unwrap(), after_crash);
    assert_eq!(registry.load_all(ACTIVE).unwrap()[1], kept);
    assert!(registry.load_all(PENDING).unwrap().iter().all(|p| !p.valid));

    let report = registry.clean_up_orphans(ACTIVE, PENDING, erase).unwrap();
    assert_eq!(report.erased, 0);
}

#[test]
fn test_failed_erase_retried_at_next_begin() {
    let harness = Harness::new();
    let info = record("000000313131", 0x31);
    Registry::new(harness.store.as_ref()).save_slot(ACTIVE, 0, &info).unwrap();
    Registry::new(harness.store.as_ref())
        .register_for_erasure(PENDING, &info)
        .unwrap();

    // A directory where the descriptor file should be cannot be removed as a file
    let json = harness.json_path("313131");
    fs::create_dir_all(json.join("blocker")).unwrap();

    let handle = harness
        .engine
        .begin(TargetComponent::AiModel, "dev0", &component(0x40))
        .unwrap();
    harness.engine.cancel(handle).unwrap();
    let pending = Registry::new(harness.store.as_ref()).load_all(PENDING).unwrap();
    assert!(pending[0].valid);
    assert_eq!(harness.installed().len(), 1);

    fs::remove_dir_all(&json).unwrap();
    let handle = harness
        .engine
        .begin(TargetComponent::AiModel, "dev0", &component(0x40))
        .unwrap();
    harness.engine.cancel(handle).unwrap();
    let pending = Registry::new(harness.store.as_ref()).load_all(PENDING).unwrap();
    assert!(pending.iter().all(|p| !p.valid));
    assert!(harness.installed().is_empty());
    assert_eq!(
        harness
            .engine
            .list_components(TargetComponent::AiModel, "dev0")
            .unwrap()
            .len(),
        1
    );
}

/// Leave a journal as an interrupted Complete would
fn interrupted_write(harness: &Harness, tx: &str, slot: usize, hash_byte: u8, committed: bool) -> Vec<PathBuf> {
    let rpk = harness.rpk_path("000000515151", hash_byte);
    let json = harness.json_path("515151");
    for path in [&rpk, &json] {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"placed").unwrap();
    }
    fs::create_dir_all(&harness.config.tmp_dir).unwrap();
    fs::write(harness.config.raw_artifact_path(), b"raw").unwrap();

    let mut journal = UpdateJournal::create(&harness.config.journal_dir(), tx).unwrap();
    journal
        .write_barrier(JournalRecord::Begin {
            tx_uuid: tx.to_string(),
            target: TargetComponent::AiModel,
            target_device: "dev0".to_string(),
            item: ACTIVE,
            slot,
            work_dir: harness.config.tmp_dir.clone(),
            timestamp: Utc::now(),
        })
        .unwrap();
    journal
        .write_barrier(JournalRecord::ArtifactsPlanned {
            version: "000000515151".to_string(),
            hash: hex::encode(hash(hash_byte)),
            paths: vec![rpk.clone(), json.clone()],
        })
        .unwrap();
    if committed {
        journal
            .write_barrier(JournalRecord::RegistryCommitted { slot })
            .unwrap();
    }
    vec![rpk, json]
}

fn journal_count(dir: &Path) -> usize {
    find_incomplete_journals(dir).unwrap().len()
}

#[test]
fn test_uncommitted_write_rolled_back_at_begin() {
    let harness = Harness::new();
    let placed = interrupted_write(&harness, "crashed", 0, 0x51, false);
    assert_eq!(journal_count(&harness.config.journal_dir()), 1);

    let handle = harness
        .engine
        .begin(TargetComponent::AiModel, "dev0", &component(0x52))
        .unwrap();

    assert!(placed.iter().all(|p| !p.exists()));
    assert!(!harness.config.tmp_dir.exists());
    assert_eq!(journal_count(&harness.config.journal_dir()), 0);
    harness.engine.cancel(handle).unwrap();
}

#[test]
fn test_durable_registry_save_rolled_forward_at_begin() {
    let harness = Harness::new();
    let placed = interrupted_write(&harness, "saved", 2, 0x51, false);
    // The record reached the store but the journal did not say so
    Registry::new(harness.store.as_ref())
        .save_slot(ACTIVE, 2, &record("000000515151", 0x51))
        .unwrap();

    let handle = harness
        .engine
        .begin(TargetComponent::AiModel, "dev0", &component(0x52))
        .unwrap();

    assert!(placed.iter().all(|p| p.exists()));
    assert!(!harness.config.tmp_dir.exists());
    assert_eq!(journal_count(&harness.config.journal_dir()), 0);
    assert!(
        harness
            .config
            .journal_dir()
            .join("archive")
            .join("tx-saved.journal")
            .exists()
    );
    harness.engine.cancel(handle).unwrap();
}

#[test]
fn test_committed_write_rolled_forward_at_begin() {
    let harness = Harness::new();
    let placed = interrupted_write(&harness, "committed", 0, 0x51, true);

    let handle = harness
        .engine
        .begin(TargetComponent::AiModel, "dev0", &component(0x52))
        .unwrap();

    assert!(placed.iter().all(|p| p.exists()));
    assert_eq!(journal_count(&harness.config.journal_dir()), 0);
    harness.engine.cancel(handle).unwrap();
}
