//! Record store adapter
//!
//! The replication engine never touches disk itself. It appends, inserts and
//! reads records through [`RecordStore`]; implementations serialize their own
//! writes so that `append` assigns record numbers atomically.

use crate::record::{LogChain, RecNo, Record};
use crate::{Error, Result};
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Append/read primitive the replication engine calls
pub trait RecordStore: Send + Sync {
    /// Commit a new record at `max_recno() + 1` and return it
    fn append(&self, data: Vec<u8>) -> Result<Record>;

    /// Place a record at its own record number (forwarded or backfilled
    /// records). Fails with [`Error::Duplicate`] if the slot is taken.
    fn insert(&self, record: Record) -> Result<()>;

    /// Read one record.
    ///
    /// Returns [`Error::RecordMissing`] for a hole at or below the high-water
    /// mark and [`Error::RecordNotFound`] above it.
    fn read(&self, recno: RecNo) -> Result<Record>;

    /// True if the record is present
    fn contains(&self, recno: RecNo) -> bool;

    /// Highest record number present (0 for an empty log)
    fn max_recno(&self) -> RecNo;

    /// Highest N such that records 1..=N are all present
    fn contiguous_recno(&self) -> RecNo {
        let mut recno = 0;
        while self.contains(recno + 1) {
            recno += 1;
        }
        recno
    }

    /// Present records as ordered, maximal runs
    fn chains(&self) -> Vec<LogChain> {
        let mut chains: Vec<LogChain> = Vec::new();
        for recno in 1..=self.max_recno() {
            if !self.contains(recno) {
                continue;
            }
            match chains.last_mut() {
                Some(chain) if chain.last + 1 == recno => chain.last = recno,
                _ => chains.push(LogChain::new(recno, recno)),
            }
        }
        chains
    }
}

/// In-memory record store
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<BTreeMap<RecNo, Record>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records held
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// True if the store holds no records
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Record numbers held, in order
    pub fn recnos(&self) -> Vec<RecNo> {
        self.records.read().keys().copied().collect()
    }
}

impl RecordStore for MemoryStore {
    fn append(&self, data: Vec<u8>) -> Result<Record> {
        let mut records = self.records.write();
        let recno = records.keys().next_back().copied().unwrap_or(0) + 1;
        let record = Record::new(recno, data);
        records.insert(recno, record.clone());
        Ok(record)
    }

    fn insert(&self, record: Record) -> Result<()> {
        if record.recno == 0 {
            return Err(Error::storage("record number must be > 0"));
        }
        let mut records = self.records.write();
        if records.contains_key(&record.recno) {
            return Err(Error::Duplicate(record.recno));
        }
        records.insert(record.recno, record);
        Ok(())
    }

    fn read(&self, recno: RecNo) -> Result<Record> {
        let records = self.records.read();
        if let Some(record) = records.get(&recno) {
            return Ok(record.clone());
        }
        let max = records.keys().next_back().copied().unwrap_or(0);
        if recno == 0 || recno > max {
            Err(Error::RecordNotFound(recno))
        } else {
            Err(Error::RecordMissing(recno))
        }
    }

    fn contains(&self, recno: RecNo) -> bool {
        self.records.read().contains_key(&recno)
    }

    fn max_recno(&self) -> RecNo {
        self.records.read().keys().next_back().copied().unwrap_or(0)
    }

    fn contiguous_recno(&self) -> RecNo {
        let records = self.records.read();
        let mut expected = 1;
        for recno in records.keys() {
            if *recno != expected {
                break;
            }
            expected += 1;
        }
        expected - 1
    }

    fn chains(&self) -> Vec<LogChain> {
        let records = self.records.read();
        let mut chains: Vec<LogChain> = Vec::new();
        for recno in records.keys().copied() {
            match chains.last_mut() {
                Some(chain) if chain.last + 1 == recno => chain.last = recno,
                _ => chains.push(LogChain::new(recno, recno)),
            }
        }
        chains
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(recnos: &[RecNo]) -> MemoryStore {
        let store = MemoryStore::new();
        for recno in recnos {
            store
                .insert(Record::new(*recno, format!("r{}", recno).into_bytes()))
                .unwrap();
        }
        store
    }

    #[test]
    fn test_append_assigns_next_recno() {
        let store = MemoryStore::new();
        assert_eq!(store.append(b"a".to_vec()).unwrap().recno, 1);
        assert_eq!(store.append(b"b".to_vec()).unwrap().recno, 2);
        assert_eq!(store.max_recno(), 2);
    }

    #[test]
    fn test_insert_duplicate() {
        let store = store_with(&[1]);
        let err = store.insert(Record::new(1, vec![])).unwrap_err();
        assert!(matches!(err, Error::Duplicate(1)));
        assert!(store.insert(Record::new(0, vec![])).is_err());
    }

    #[test]
    fn test_read_missing_vs_not_found() {
        let store = store_with(&[1, 2, 5]);
        assert_eq!(store.read(2).unwrap().data, b"r2");
        assert!(matches!(store.read(3), Err(Error::RecordMissing(3))));
        assert!(matches!(store.read(6), Err(Error::RecordNotFound(6))));
    }

    #[test]
    fn test_contiguous_and_chains() {
        let store = store_with(&[1, 2, 3, 6, 7, 9]);
        assert_eq!(store.contiguous_recno(), 3);
        assert_eq!(store.max_recno(), 9);
        assert_eq!(
            store.chains(),
            vec![
                LogChain::new(1, 3),
                LogChain::new(6, 7),
                LogChain::new(9, 9)
            ]
        );
    }

    #[test]
    fn test_default_trait_methods_match_overrides() {
        struct Probe(MemoryStore);
        impl RecordStore for Probe {
            fn append(&self, data: Vec<u8>) -> Result<Record> {
                self.0.append(data)
            }
            fn insert(&self, record: Record) -> Result<()> {
                self.0.insert(record)
            }
            fn read(&self, recno: RecNo) -> Result<Record> {
                self.0.read(recno)
            }
            fn contains(&self, recno: RecNo) -> bool {
                self.0.contains(recno)
            }
            fn max_recno(&self) -> RecNo {
                self.0.max_recno()
            }
        }

        let probe = Probe(store_with(&[2, 3, 4, 8]));
        assert_eq!(probe.contiguous_recno(), 0);
        assert_eq!(probe.chains(), probe.0.chains());
    }
}
