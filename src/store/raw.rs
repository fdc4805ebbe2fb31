//! Thin wrapper over the memory-mapped B-tree backing a wallet directory.
//! One file, many named tables; writes are atomic per commit.

use std::path::{Path, PathBuf};

use redb::{Database, ReadableTable, TableDefinition};
use tracing::debug;

use crate::error::Result;

pub const WALLET_FILE_NAME: &str = "wallet.redb";

/// A batched mutation: `None` deletes the key.
pub type RawOp = (Vec<u8>, Option<Vec<u8>>);

pub struct RawStore {
    db: Database,
    path: PathBuf,
}

impl RawStore {
    /// Open (or create) the B-tree file inside a wallet directory.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(WALLET_FILE_NAME);
        let db = Database::create(&path)?;
        debug!(path = %path.display(), "opened wallet store");
        Ok(RawStore { db, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn def<'a>(name: &'a str) -> TableDefinition<'a, &'static [u8], &'static [u8]> {
        TableDefinition::new(name)
    }

    /// Make sure a table exists so later reads don't fail on first use.
    pub fn ensure_table(&self, name: &str) -> Result<()> {
        let tx = self.db.begin_write()?;
        tx.open_table(Self::def(name))?;
        tx.commit()?;
        Ok(())
    }

    pub fn get(&self, table: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let tx = self.db.begin_read()?;
        let table = match tx.open_table(Self::def(table)) {
            Ok(t) => t,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(table.get(key)?.map(|guard| guard.value().to_vec()))
    }

    /// All rows of a table in key order.
    pub fn read_all(&self, table: &str) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let tx = self.db.begin_read()?;
        let table = match tx.open_table(Self::def(table)) {
            Ok(t) => t,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut rows = Vec::new();
        for entry in table.range::<&[u8]>(..)? {
            let (key, value) = entry?;
            rows.push((key.value().to_vec(), value.value().to_vec()));
        }
        Ok(rows)
    }

    pub fn put(&self, table: &str, key: &[u8], value: &[u8]) -> Result<()> {
        self.apply(table, &[(key.to_vec(), Some(value.to_vec()))])
    }

    /// Apply a batch of puts/deletes in one atomic commit.
    pub fn apply(&self, table: &str, ops: &[RawOp]) -> Result<()> {
        let tx = self.db.begin_write()?;
        {
            let mut t = tx.open_table(Self::def(table))?;
            for (key, value) in ops {
                match value {
                    Some(v) => {
                        t.insert(key.as_slice(), v.as_slice())?;
                    }
                    None => {
                        t.remove(key.as_slice())?;
                    }
                }
            }
        }
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn roundtrip_and_ordering() {
        let dir = TempDir::new().unwrap();
        let store = RawStore::open(dir.path()).unwrap();

        store.put("t", b"\x00\x00\x00\x02", b"two").unwrap();
        store.put("t", b"\x00\x00\x00\x00", b"zero").unwrap();
        store.put("t", b"\x00\x00\x00\x01", b"one").unwrap();

        let rows = store.read_all("t").unwrap();
        let keys: Vec<_> = rows.iter().map(|(k, _)| k[3]).collect();
        assert_eq!(keys, vec![0, 1, 2]);
    }

    #[test]
    fn batch_is_atomic_and_deletes() {
        let dir = TempDir::new().unwrap();
        let store = RawStore::open(dir.path()).unwrap();

        store.put("t", b"a", b"1").unwrap();
        store
            .apply("t", &[(b"a".to_vec(), None), (b"b".to_vec(), Some(b"2".to_vec()))])
            .unwrap();

        assert_eq!(store.get("t", b"a").unwrap(), None);
        assert_eq!(store.get("t", b"b").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn missing_table_reads_empty() {
        let dir = TempDir::new().unwrap();
        let store = RawStore::open(dir.path()).unwrap();
        assert!(store.read_all("nope").unwrap().is_empty());
        assert_eq!(store.get("nope", b"k").unwrap(), None);
    }
}
