// src/transaction/recovery.rs

//! Update recovery for crash safety
//!
//! This module handles journals left behind by a write transaction that
//! never finished. The key principle is:
//!
//! - Before RegistryCommitted: roll back (remove planned artifacts and the
//!   working directory)
//! - After RegistryCommitted: roll forward (clean up, archive the journal)
//!
//! The registry is the source of truth for whether the commit actually
//! happened, since a crash can occur after the record is saved but before
//! the journal says so.

use crate::Result;
use crate::filesystem::{remove_dir_all_durable, remove_file_durable};
use crate::registry::Registry;
use crate::storage::{ParameterStore, StorageItem};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::journal::{JournalPhase, JournalRecord, UpdateJournal, find_incomplete_journals};

/// Outcome of recovering one transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// Transaction was rolled back (before the registry commit)
    RolledBack { tx_uuid: String, reason: String },
    /// Registry already holds the component; leftovers were cleaned up
    RolledForward { tx_uuid: String, slot: usize },
    /// Transaction was already complete, just needed archiving
    Clean { tx_uuid: String },
    /// Journal was unreadable and has been discarded
    Corrupted { tx_uuid: String, error: String },
}

/// Recover every incomplete transaction in `journal_dir`
pub fn recover_all(
    journal_dir: &Path,
    store: &dyn ParameterStore,
) -> Result<Vec<RecoveryOutcome>> {
    let mut outcomes = Vec::new();
    for journal_path in find_incomplete_journals(journal_dir)? {
        outcomes.push(recover_single(journal_path, store)?);
    }
    Ok(outcomes)
}

/// Fields of the `Begin` record recovery needs
struct Started {
    item: StorageItem,
    slot: usize,
    work_dir: PathBuf,
}

fn recover_single(journal_path: PathBuf, store: &dyn ParameterStore) -> Result<RecoveryOutcome> {
    let journal = UpdateJournal::open(journal_path)?;
    let tx_uuid = journal.tx_uuid().to_string();

    let records = match journal.read_all() {
        Ok(r) => r,
        Err(e) => {
            warn!("Discarding unreadable journal {}: {}", tx_uuid, e);
            journal.delete()?;
            return Ok(RecoveryOutcome::Corrupted {
                tx_uuid,
                error: format!("Failed to read journal: {}", e),
            });
        }
    };

    let Some(started) = records.iter().find_map(|r| match r {
        JournalRecord::Begin {
            item,
            slot,
            work_dir,
            ..
        } => Some(Started {
            item: *item,
            slot: *slot,
            work_dir: work_dir.clone(),
        }),
        _ => None,
    }) else {
        warn!("Discarding journal {} without a Begin record", tx_uuid);
        journal.delete()?;
        return Ok(RecoveryOutcome::Corrupted {
            tx_uuid,
            error: "Journal has no Begin record".to_string(),
        });
    };

    let last_phase = records
        .iter()
        .map(JournalRecord::to_phase)
        .max()
        .unwrap_or(JournalPhase::Writing);
    info!(
        "Recovering update {} (last phase: {:?})",
        tx_uuid,
        last_phase
    );

    match last_phase {
        JournalPhase::Writing => {
            cleanup_work_dir(&started.work_dir);
            journal.delete()?;
            Ok(RecoveryOutcome::RolledBack {
                tx_uuid,
                reason: "Crashed while receiving the package".to_string(),
            })
        }

        // Critical transition: the registry decides which way to go
        JournalPhase::ArtifactsPlanned => {
            let (hash, paths) = planned_artifacts(&records);
            if registry_holds(store, &started, hash)? {
                cleanup_work_dir(&started.work_dir);
                journal.archive()?;
                Ok(RecoveryOutcome::RolledForward {
                    tx_uuid,
                    slot: started.slot,
                })
            } else {
                rollback_artifacts(&tx_uuid, paths)?;
                cleanup_work_dir(&started.work_dir);
                journal.delete()?;
                Ok(RecoveryOutcome::RolledBack {
                    tx_uuid,
                    reason: "Registry commit was not durable".to_string(),
                })
            }
        }

        JournalPhase::RegistryCommitted => {
            cleanup_work_dir(&started.work_dir);
            journal.archive()?;
            Ok(RecoveryOutcome::RolledForward {
                tx_uuid,
                slot: started.slot,
            })
        }

        JournalPhase::Done => {
            journal.archive()?;
            Ok(RecoveryOutcome::Clean { tx_uuid })
        }
    }
}

fn planned_artifacts(records: &[JournalRecord]) -> (&str, &[PathBuf]) {
    records
        .iter()
        .rev()
        .find_map(|r| match r {
            JournalRecord::ArtifactsPlanned { hash, paths, .. } => {
                Some((hash.as_str(), paths.as_slice()))
            }
            _ => None,
        })
        .unwrap_or(("", &[]))
}

/// Check whether the journalled slot already holds the component
fn registry_holds(store: &dyn ParameterStore, started: &Started, hash: &str) -> Result<bool> {
    let slots = Registry::new(store).load_all(started.item)?;
    Ok(slots
        .get(started.slot)
        .is_some_and(|info| info.valid && info.hash_hex() == hash))
}

/// Remove artifacts a rolled-back transaction may have placed
fn rollback_artifacts(tx_uuid: &str, paths: &[PathBuf]) -> Result<()> {
    info!("Rolling back update {}", tx_uuid);
    for path in paths {
        remove_file_durable(path)?;
        debug!("Removed {}", path.display());
    }
    Ok(())
}

fn cleanup_work_dir(work_dir: &Path) {
    if let Err(e) = remove_dir_all_durable(work_dir) {
        warn!(
            "Failed to remove working directory {}: {}",
            work_dir.display(),
            e
        );
    }
}
