//! Generic keyed record store: create / predicate-and-sort query / delete, one table per record type.
//! Records are bincode-encoded so every backend stores the same bytes.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use serde::de::DeserializeOwned;
use serde::Serialize;

/// A value that lives in a table of the record store, addressed by a unique key.
pub trait Record: Serialize + DeserializeOwned {
    const TABLE: &'static str;
    fn key(&self) -> Vec<u8>;
}

/// One page of a query result: `index` counts pages from 0, `size` records per page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub index: usize,
    pub size: usize,
}

type Filter<'a, R> = Box<dyn Fn(&R) -> bool + 'a>;
type Order<'a, R> = Box<dyn Fn(&R, &R) -> Ordering + 'a>;

/// Predicate, optional sort and optional page.
pub struct Query<'a, R> {
    filter: Filter<'a, R>,
    order: Option<Order<'a, R>>,
    page: Option<Page>,
}

impl<'a, R> Query<'a, R> {
    pub fn all() -> Self {
        Self {
            filter: Box::new(|_| true),
            order: None,
            page: None,
        }
    }

    pub fn filter(filter: impl Fn(&R) -> bool + 'a) -> Self {
        Self {
            filter: Box::new(filter),
            order: None,
            page: None,
        }
    }

    pub fn sorted_by(mut self, order: impl Fn(&R, &R) -> Ordering + 'a) -> Self {
        self.order = Some(Box::new(order));
        self
    }

    pub fn paged(mut self, page: Page) -> Self {
        self.page = Some(page);
        self
    }

    pub fn matches(&self, record: &R) -> bool {
        (self.filter)(record)
    }

    /// Filter, sort and page already-decoded records.
    pub fn apply(&self, records: impl IntoIterator<Item = R>) -> Vec<R> {
        let mut out: Vec<R> = records.into_iter().filter(|r| self.matches(r)).collect();
        if let Some(order) = &self.order {
            out.sort_by(|a, b| order(a, b));
        }
        match self.page {
            Some(Page { index, size }) => out
                .into_iter()
                .skip(index.saturating_mul(size))
                .take(size)
                .collect(),
            None => out,
        }
    }
}

/// Keyed record store. `create` never overwrites; `put` always does.
pub trait RecordStore {
    /// Insert if no record with the same key exists. Returns false when one already did.
    fn create<R: Record>(&mut self, record: &R) -> Result<bool, StoreError>;
    fn put<R: Record>(&mut self, record: &R) -> Result<(), StoreError>;
    fn query<R: Record>(&self, query: &Query<'_, R>) -> Result<Vec<R>, StoreError>;
    /// Delete every record matching `filter`. Returns how many were removed.
    fn delete<R: Record>(&mut self, filter: &dyn Fn(&R) -> bool) -> Result<usize, StoreError>;
}

pub fn encode_record<R: Record>(record: &R) -> Result<Vec<u8>, StoreError> {
    Ok(bincode::serialize(record)?)
}

pub fn decode_record<R: Record>(bytes: &[u8]) -> Result<R, StoreError> {
    Ok(bincode::deserialize(bytes)?)
}

/// Recoverable persistence error, returned to the caller.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("record encoding error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("store backend error: {0}")]
    Backend(String),
}

/// In-memory store. Tables are ordered by key.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: HashMap<&'static str, BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len<R: Record>(&self) -> usize {
        self.tables.get(R::TABLE).map(|t| t.len()).unwrap_or(0)
    }
}

impl RecordStore for MemoryStore {
    fn create<R: Record>(&mut self, record: &R) -> Result<bool, StoreError> {
        let table = self.tables.entry(R::TABLE).or_default();
        let key = record.key();
        if table.contains_key(&key) {
            return Ok(false);
        }
        table.insert(key, encode_record(record)?);
        Ok(true)
    }

    fn put<R: Record>(&mut self, record: &R) -> Result<(), StoreError> {
        let bytes = encode_record(record)?;
        self.tables
            .entry(R::TABLE)
            .or_default()
            .insert(record.key(), bytes);
        Ok(())
    }

    fn query<R: Record>(&self, query: &Query<'_, R>) -> Result<Vec<R>, StoreError> {
        let Some(table) = self.tables.get(R::TABLE) else {
            return Ok(Vec::new());
        };
        let records = table
            .values()
            .map(|bytes| decode_record::<R>(bytes))
            .collect::<Result<Vec<R>, _>>()?;
        Ok(query.apply(records))
    }

    fn delete<R: Record>(&mut self, filter: &dyn Fn(&R) -> bool) -> Result<usize, StoreError> {
        let Some(table) = self.tables.get_mut(R::TABLE) else {
            return Ok(0);
        };
        let mut doomed = Vec::new();
        for (key, bytes) in table.iter() {
            if filter(&decode_record::<R>(bytes)?) {
                doomed.push(key.clone());
            }
        }
        for key in &doomed {
            table.remove(key);
        }
        Ok(doomed.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        id: u32,
        rank: i64,
    }

    impl Record for Note {
        const TABLE: &'static str = "notes";
        fn key(&self) -> Vec<u8> {
            self.id.to_be_bytes().to_vec()
        }
    }

    fn filled() -> MemoryStore {
        let mut store = MemoryStore::new();
        for (id, rank) in [(1, 30), (2, 10), (3, 20), (4, 40)] {
            store.put(&Note { id, rank }).unwrap();
        }
        store
    }

    #[test]
    fn create_does_not_overwrite() {
        let mut store = MemoryStore::new();
        assert!(store.create(&Note { id: 1, rank: 5 }).unwrap());
        assert!(!store.create(&Note { id: 1, rank: 9 }).unwrap());
        let all = store.query(&Query::<Note>::all()).unwrap();
        assert_eq!(all, vec![Note { id: 1, rank: 5 }]);
    }

    #[test]
    fn query_filters_sorts_and_pages() {
        let store = filled();
        let q = Query::filter(|n: &Note| n.rank > 10)
            .sorted_by(|a, b| a.rank.cmp(&b.rank))
            .paged(Page { index: 0, size: 2 });
        let ranks: Vec<i64> = store.query(&q).unwrap().iter().map(|n| n.rank).collect();
        assert_eq!(ranks, vec![20, 30]);

        let q = Query::filter(|n: &Note| n.rank > 10)
            .sorted_by(|a, b| a.rank.cmp(&b.rank))
            .paged(Page { index: 1, size: 2 });
        let ranks: Vec<i64> = store.query(&q).unwrap().iter().map(|n| n.rank).collect();
        assert_eq!(ranks, vec![40]);
    }

    #[test]
    fn delete_by_predicate() {
        let mut store = filled();
        assert_eq!(store.delete(&|n: &Note| n.id % 2 == 0).unwrap(), 2);
        assert_eq!(store.len::<Note>(), 2);
        assert_eq!(store.delete(&|_: &Note| true).unwrap(), 2);
        assert!(store.query(&Query::<Note>::all()).unwrap().is_empty());
    }
}
