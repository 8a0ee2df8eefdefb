// src/transaction/journal.rs

//! Append-only update journal for crash recovery
//!
//! Every write transaction keeps a journal recording how far it got. Each
//! record is written as a single line with a CRC32 checksum for integrity
//! verification.
//!
//! Format: `{crc32_hex}|{json}\n`
//!
//! All records are phase barriers: they are fsync'd before the engine
//! proceeds to the step they announce.

use crate::component::TargetComponent;
use crate::filesystem::{create_dir_all_durable, fsync_parent_dir, remove_file_durable};
use crate::storage::StorageItem;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A record in the update journal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum JournalRecord {
    /// Writing started for a component bound to a registry slot
    Begin {
        tx_uuid: String,
        target: TargetComponent,
        target_device: String,
        item: StorageItem,
        slot: usize,
        work_dir: PathBuf,
        timestamp: DateTime<Utc>,
    },

    /// Final artifact locations, recorded before the converter runs
    ArtifactsPlanned {
        version: String,
        hash: String,
        paths: Vec<PathBuf>,
    },

    /// Component record saved to the active registry
    RegistryCommitted { slot: usize },

    /// Transaction finished (completed or cancelled)
    Done { duration_ms: u64, success: bool },
}

/// Progress of a journalled transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum JournalPhase {
    /// Artifact being streamed into the working directory
    Writing,
    /// Final artifacts may exist, registry not yet updated
    ArtifactsPlanned,
    /// Registry updated - point of no return
    RegistryCommitted,
    Done,
}

impl JournalRecord {
    /// Get the phase this record moves the transaction into
    pub fn to_phase(&self) -> JournalPhase {
        match self {
            Self::Begin { .. } => JournalPhase::Writing,
            Self::ArtifactsPlanned { .. } => JournalPhase::ArtifactsPlanned,
            Self::RegistryCommitted { .. } => JournalPhase::RegistryCommitted,
            Self::Done { .. } => JournalPhase::Done,
        }
    }
}

/// Append-only update journal with fsync barriers
#[derive(Debug)]
pub struct UpdateJournal {
    path: PathBuf,
    file: File,
    tx_uuid: String,
    sequence: u64,
}

impl UpdateJournal {
    /// Create a new journal for a transaction
    pub fn create(journal_dir: &Path, tx_uuid: &str) -> Result<Self> {
        create_dir_all_durable(journal_dir)?;

        let path = journal_dir.join(format!("tx-{}.journal", tx_uuid));
        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&path)?;
        fsync_parent_dir(&path)?;

        Ok(Self {
            path,
            file,
            tx_uuid: tx_uuid.to_string(),
            sequence: 0,
        })
    }

    /// Open an existing journal for recovery
    pub fn open(path: PathBuf) -> Result<Self> {
        let tx_uuid = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.strip_prefix("tx-"))
            .ok_or_else(|| {
                Error::InvalidData(format!("Invalid journal filename: {}", path.display()))
            })?
            .to_string();

        let sequence = {
            let file = File::open(&path)?;
            BufReader::new(file).lines().count() as u64
        };

        let file = OpenOptions::new().append(true).open(&path)?;

        Ok(Self {
            path,
            file,
            tx_uuid,
            sequence,
        })
    }

    pub fn tx_uuid(&self) -> &str {
        &self.tx_uuid
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of records written, including those found on open
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Append a record and fsync it
    pub fn write_barrier(&mut self, record: JournalRecord) -> Result<()> {
        self.sequence += 1;
        let json = serde_json::to_string(&record)
            .map_err(|e| Error::Internal(format!("Failed to serialize journal record: {}", e)))?;
        let crc = crc32fast::hash(json.as_bytes());
        writeln!(self.file, "{:08x}|{}", crc, json)?;
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Read all valid records from the journal
    ///
    /// Reading stops at the first record whose checksum does not match; a
    /// torn final line is the expected shape of a crash mid-append.
    pub fn read_all(&self) -> Result<Vec<JournalRecord>> {
        let file = File::open(&self.path)?;
        let reader = BufReader::new(file);
        let mut records = Vec::new();

        for (line_num, line_result) in reader.lines().enumerate() {
            let line = line_result?;
            if line.is_empty() {
                continue;
            }

            let Some((crc_hex, json)) = line.split_once('|') else {
                warn!("Malformed journal line {}: missing delimiter", line_num + 1);
                continue;
            };

            let Ok(expected_crc) = u32::from_str_radix(crc_hex, 16) else {
                warn!("Invalid CRC32 at line {}: {}", line_num + 1, crc_hex);
                break;
            };

            let actual_crc = crc32fast::hash(json.as_bytes());
            if expected_crc != actual_crc {
                warn!(
                    "CRC mismatch at line {}: expected {:08x}, got {:08x}",
                    line_num + 1,
                    expected_crc,
                    actual_crc
                );
                break;
            }

            let record: JournalRecord = serde_json::from_str(json).map_err(|e| {
                Error::InvalidData(format!(
                    "Failed to parse journal record at line {}: {}",
                    line_num + 1,
                    e
                ))
            })?;

            records.push(record);
        }

        Ok(records)
    }

    /// Get the furthest phase reached
    pub fn last_phase(&self) -> Result<Option<JournalPhase>> {
        Ok(self.read_all()?.iter().map(JournalRecord::to_phase).max())
    }

    /// Archive the journal after the transaction finished
    pub fn archive(self) -> Result<()> {
        let parent = self.path.parent().unwrap_or(Path::new("."));
        let archive_dir = parent.join("archive");
        create_dir_all_durable(&archive_dir)?;

        let file_name = self.path.file_name().ok_or_else(|| {
            Error::InvalidData(format!("Invalid journal path: {}", self.path.display()))
        })?;
        let archive_path = archive_dir.join(file_name);
        fs::rename(&self.path, &archive_path)?;
        fsync_parent_dir(&archive_path)?;
        fsync_parent_dir(&self.path)?;

        debug!("Archived journal {}", self.tx_uuid);
        Ok(())
    }

    /// Delete the journal
    pub fn delete(self) -> Result<()> {
        remove_file_durable(&self.path)
    }
}

#[cfg(test)]
impl UpdateJournal {
    /// Swap the handle for a read-only one so every later barrier fails
    pub(crate) fn reopen_read_only(&mut self) -> Result<()> {
        self.file = File::open(&self.path)?;
        Ok(())
    }
}

/// Find journals without a `Done` record
pub fn find_incomplete_journals(journal_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut journals = Vec::new();

    if !journal_dir.exists() {
        return Ok(journals);
    }

    for entry in fs::read_dir(journal_dir)? {
        let path = entry?.path();

        // Only top-level tx-*.journal files; archive/ is skipped
        if path.is_file()
            && path.extension().is_some_and(|e| e == "journal")
            && path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("tx-"))
        {
            let journal = UpdateJournal::open(path.clone())?;
            let done = match journal.read_all() {
                Ok(records) => records
                    .iter()
                    .any(|r| matches!(r, JournalRecord::Done { .. })),
                // Unreadable journals are handed to recovery as well
                Err(_) => false,
            };

            if !done {
                journals.push(path);
            }
        }
    }

    journals.sort();
    Ok(journals)
}
