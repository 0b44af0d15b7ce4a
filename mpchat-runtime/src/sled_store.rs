//! Durable [`RecordStore`] on the sled embedded database.
//!
//! One tree per record table; values are the core's bincode record encoding.

use std::path::Path;

use anyhow::Context;
use mpchat_core::store::{decode_record, encode_record};
use mpchat_core::{Query, Record, RecordStore, StoreError};
use sled::{Db, Tree};

pub struct SledStore {
    db: Db,
}

fn backend(e: sled::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

impl SledStore {
    /// Open or create the database under `dir`.
    pub fn open(dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create data directory {}", dir.display()))?;
        let path = dir.join("mpchat.db");
        let db = sled::open(&path)
            .with_context(|| format!("failed to open store at {}", path.display()))?;
        tracing::debug!(path = %path.display(), "store opened");
        Ok(Self { db })
    }

    /// In-memory database, removed on drop.
    pub fn temporary() -> anyhow::Result<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .context("failed to open temporary store")?;
        Ok(Self { db })
    }

    fn tree<R: Record>(&self) -> Result<Tree, StoreError> {
        self.db.open_tree(R::TABLE).map_err(backend)
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush().map_err(backend)?;
        Ok(())
    }
}

impl RecordStore for SledStore {
    fn create<R: Record>(&mut self, record: &R) -> Result<bool, StoreError> {
        let bytes = encode_record(record)?;
        let swapped = self
            .tree::<R>()?
            .compare_and_swap(record.key(), None::<&[u8]>, Some(bytes))
            .map_err(backend)?;
        Ok(swapped.is_ok())
    }

    fn put<R: Record>(&mut self, record: &R) -> Result<(), StoreError> {
        let bytes = encode_record(record)?;
        self.tree::<R>()?
            .insert(record.key(), bytes)
            .map_err(backend)?;
        Ok(())
    }

    fn query<R: Record>(&self, query: &Query<'_, R>) -> Result<Vec<R>, StoreError> {
        let mut records = Vec::new();
        for item in self.tree::<R>()?.iter() {
            let (_, value) = item.map_err(backend)?;
            records.push(decode_record::<R>(&value)?);
        }
        Ok(query.apply(records))
    }

    fn delete<R: Record>(&mut self, filter: &dyn Fn(&R) -> bool) -> Result<usize, StoreError> {
        let tree = self.tree::<R>()?;
        let mut doomed = Vec::new();
        for item in tree.iter() {
            let (key, value) = item.map_err(backend)?;
            if filter(&decode_record::<R>(&value)?) {
                doomed.push(key);
            }
        }
        for key in &doomed {
            tree.remove(key).map_err(backend)?;
        }
        Ok(doomed.len())
    }
}
