// src/storage/sqlite.rs

//! SQLite-backed parameter store
//!
//! Each storage item is one row holding the whole blob. Saves read, splice
//! and rewrite the row inside an immediate transaction so a crash leaves
//! either the old or the new blob.

use super::{ParameterStore, StorageItem, check_range, splice};
use crate::{Error, Result};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

/// Parameter store in a SQLite database
pub struct SqliteParameterStore {
    conn: Mutex<Connection>,
}

impl SqliteParameterStore {
    /// Open (creating if needed) a store at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        // A returned save must survive power loss
        conn.pragma_update(None, "synchronous", "FULL")?;
        Self::init(conn)
    }

    /// Open a store that lives only as long as this value
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS parameters (
                item TEXT PRIMARY KEY,
                data BLOB NOT NULL,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Internal("Parameter store lock poisoned".to_string()))
    }

    fn read_blob(conn: &Connection, item: StorageItem) -> Result<Vec<u8>> {
        let blob: Option<Vec<u8>> = conn
            .query_row(
                "SELECT data FROM parameters WHERE item = ?1",
                [item.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(blob.unwrap_or_default())
    }
}

impl ParameterStore for SqliteParameterStore {
    fn size(&self, item: StorageItem) -> Result<usize> {
        let conn = self.conn()?;
        let len: Option<i64> = conn
            .query_row(
                "SELECT length(data) FROM parameters WHERE item = ?1",
                [item.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(len.map_or(0, |l| l.max(0) as usize))
    }

    fn load(&self, item: StorageItem, offset: usize, buf: &mut [u8]) -> Result<()> {
        let conn = self.conn()?;
        let blob = Self::read_blob(&conn, item)?;
        check_range(item, blob.len(), offset, buf.len())?;
        buf.copy_from_slice(&blob[offset..offset + buf.len()]);
        Ok(())
    }

    fn save(&self, item: StorageItem, offset: usize, data: &[u8]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut blob = Self::read_blob(&tx, item)?;
        splice(&mut blob, offset, data);
        tx.execute(
            "INSERT INTO parameters (item, data) VALUES (?1, ?2)
             ON CONFLICT(item) DO UPDATE SET data = excluded.data,
                                             updated_at = CURRENT_TIMESTAMP",
            params![item.to_string(), blob],
        )?;
        tx.commit()?;

        debug!("Saved {} bytes of {} at offset {}", data.len(), item, offset);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sqlite_store_persists_across_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("params.db");

        {
            let store = SqliteParameterStore::open(&path).unwrap();
            store.save(StorageItem::FwMgrBinaryInfo1, 0, b"hello").unwrap();
            store.save(StorageItem::FwMgrBinaryInfo1, 8, b"!").unwrap();
        }

        let store = SqliteParameterStore::open(&path).unwrap();
        assert_eq!(store.size(StorageItem::FwMgrBinaryInfo1).unwrap(), 9);
        assert_eq!(store.size(StorageItem::FwMgrBinaryInfo2).unwrap(), 0);

        let mut buf = [0u8; 9];
        store.load(StorageItem::FwMgrBinaryInfo1, 0, &mut buf).unwrap();
        assert_eq!(&buf, b"hello\0\0\0!");
    }

    #[test]
    fn test_sqlite_store_load_out_of_range() {
        let store = SqliteParameterStore::open_in_memory().unwrap();
        store.save(StorageItem::FwMgrBinaryInfo2, 0, &[1, 2, 3]).unwrap();

        let mut buf = [0u8; 2];
        store.load(StorageItem::FwMgrBinaryInfo2, 1, &mut buf).unwrap();
        assert_eq!(buf, [2, 3]);
        assert!(matches!(
            store.load(StorageItem::FwMgrBinaryInfo2, 2, &mut buf),
            Err(Error::InvalidArgument(_))
        ));
    }
}
