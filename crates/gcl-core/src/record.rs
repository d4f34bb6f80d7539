//! Log records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Record number. The first record of a log is 1; 0 means "nothing yet".
pub type RecNo = u64;

/// One committed log record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Position in the log
    pub recno: RecNo,
    /// Commit time on the server that first accepted the write
    pub timestamp: DateTime<Utc>,
    /// Opaque payload
    pub data: Vec<u8>,
}

impl Record {
    /// Create a record stamped with the current time
    pub fn new(recno: RecNo, data: Vec<u8>) -> Self {
        Self {
            recno,
            timestamp: Utc::now(),
            data,
        }
    }

    /// Same position and payload; timestamps are ignored
    pub fn same_content(&self, other: &Record) -> bool {
        self.recno == other.recno && self.data == other.data
    }
}

/// Inclusive run of record numbers that are all present in a log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogChain {
    /// First record number of the run
    pub first: RecNo,
    /// Last record number of the run
    pub last: RecNo,
}

impl LogChain {
    /// Create a run; `first` must not exceed `last`
    pub fn new(first: RecNo, last: RecNo) -> Self {
        debug_assert!(first <= last, "log chain {}..={} is inverted", first, last);
        Self { first, last }
    }

    /// Number of records in the run
    pub fn len(&self) -> u64 {
        self.last - self.first + 1
    }

    /// Runs are never empty
    pub fn is_empty(&self) -> bool {
        false
    }

    /// True if `recno` lies inside the run
    pub fn contains(&self, recno: RecNo) -> bool {
        self.first <= recno && recno <= self.last
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_content_ignores_timestamp() {
        let a = Record::new(4, b"payload".to_vec());
        let mut b = a.clone();
        b.timestamp = b.timestamp + chrono::Duration::seconds(5);
        assert!(a.same_content(&b));
        b.data.push(b'!');
        assert!(!a.same_content(&b));
    }

    #[test]
    fn test_log_chain() {
        let chain = LogChain::new(3, 7);
        assert_eq!(chain.len(), 5);
        assert!(chain.contains(3));
        assert!(chain.contains(7));
        assert!(!chain.contains(8));
    }
}
