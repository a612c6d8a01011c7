//! Per-session storage change tracking
//!
//! Every storage read and write performed during one VM session goes
//! through a [`ChangeSet`]. The first read of a `(contract, key)` captures
//! the pre-session value into a read-through cache; the first write fixes
//! `value_before`; later writes update `value_after` in place, so there is
//! exactly one record per `(contract, key)` per session. Commit hands the
//! whole record list to the host in one call (atomic at the host) and a
//! resolved set can never be committed again, which makes commit-after-
//! fault a structural no-op.

use super::errors::StorageResult;
use super::StorageValue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Before/after pair for a single contract key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageChangeRecord {
    pub contract_id: String,
    pub key: String,
    pub value_before: StorageValue,
    pub value_after: StorageValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SetState {
    Open,
    Committed,
    Discarded,
}

/// The session-scoped change tracker
#[derive(Debug)]
pub struct ChangeSet {
    records: BTreeMap<(String, String), StorageChangeRecord>,
    read_cache: BTreeMap<(String, String), StorageValue>,
    state: SetState,
}

impl Default for ChangeSet {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeSet {
    pub fn new() -> Self {
        Self {
            records: BTreeMap::new(),
            read_cache: BTreeMap::new(),
            state: SetState::Open,
        }
    }

    /// Read a key, seeing this session's own writes; the first host read
    /// per key is captured through `fetch`
    pub fn read<F>(&mut self, contract_id: &str, key: &str, fetch: F) -> StorageValue
    where
        F: FnOnce() -> StorageValue,
    {
        let map_key = (contract_id.to_string(), key.to_string());
        if let Some(record) = self.records.get(&map_key) {
            return record.value_after.clone();
        }
        if let Some(cached) = self.read_cache.get(&map_key) {
            return cached.clone();
        }
        let value = fetch();
        self.read_cache.insert(map_key, value.clone());
        value
    }

    /// Record a write; `value_before` is fixed at the first write per key
    pub fn write<F>(&mut self, contract_id: &str, key: &str, value: StorageValue, fetch: F)
    where
        F: FnOnce() -> StorageValue,
    {
        let map_key = (contract_id.to_string(), key.to_string());
        if let Some(record) = self.records.get_mut(&map_key) {
            record.value_after = value;
            return;
        }
        let before = match self.read_cache.get(&map_key) {
            Some(cached) => cached.clone(),
            None => {
                let fetched = fetch();
                self.read_cache.insert(map_key.clone(), fetched.clone());
                fetched
            }
        };
        self.records.insert(
            map_key,
            StorageChangeRecord {
                contract_id: contract_id.to_string(),
                key: key.to_string(),
                value_before: before,
                value_after: value,
            },
        );
    }

    /// Records in deterministic (contract, key) order
    pub fn records(&self) -> Vec<StorageChangeRecord> {
        self.records.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn is_open(&self) -> bool {
        self.state == SetState::Open
    }

    /// Apply the whole change set through `apply` (one host call, atomic
    /// there). Returns false without calling the host when the set was
    /// already committed or discarded.
    pub fn commit<F>(&mut self, apply: F) -> StorageResult<bool>
    where
        F: FnOnce(&[StorageChangeRecord]) -> StorageResult<()>,
    {
        match self.state {
            SetState::Open => {}
            SetState::Committed | SetState::Discarded => return Ok(false),
        }
        let records = self.records();
        apply(&records)?;
        self.state = SetState::Committed;
        Ok(true)
    }

    /// Drop every record without touching host state
    pub fn discard(&mut self) {
        self.records.clear();
        self.state = SetState::Discarded;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::errors::StorageError;
    use std::cell::Cell;

    fn set() -> ChangeSet {
        ChangeSet::new()
    }

    #[test]
    fn test_one_record_per_key_with_fixed_before() {
        let mut changes = set();
        changes.write("c1", "k", StorageValue::Int(5), || StorageValue::Int(1));
        changes.write("c1", "k", StorageValue::Int(9), || {
            panic!("before value must be captured only once")
        });
        assert_eq!(changes.len(), 1);
        let records = changes.records();
        assert_eq!(records[0].value_before, StorageValue::Int(1));
        assert_eq!(records[0].value_after, StorageValue::Int(9));
    }

    #[test]
    fn test_read_through_cache_fetches_once() {
        let mut changes = set();
        let fetches = Cell::new(0);
        for _ in 0..3 {
            changes.read("c1", "k", || {
                fetches.set(fetches.get() + 1);
                StorageValue::Int(7)
            });
        }
        assert_eq!(fetches.get(), 1);
    }

    #[test]
    fn test_read_sees_own_writes() {
        let mut changes = set();
        changes.write("c1", "k", StorageValue::Int(5), || StorageValue::Null);
        let value = changes.read("c1", "k", || panic!("must not hit host"));
        assert_eq!(value, StorageValue::Int(5));
    }

    #[test]
    fn test_before_value_from_prior_read() {
        let mut changes = set();
        changes.read("c1", "k", || StorageValue::Int(3));
        changes.write("c1", "k", StorageValue::Int(4), || {
            panic!("before value must come from the read cache")
        });
        assert_eq!(changes.records()[0].value_before, StorageValue::Int(3));
    }

    #[test]
    fn test_commit_after_discard_is_noop() {
        let mut changes = set();
        changes.write("c1", "k", StorageValue::Int(5), || StorageValue::Null);
        changes.discard();
        let applied = changes
            .commit(|_| panic!("host must not be called"))
            .unwrap();
        assert!(!applied);
    }

    #[test]
    fn test_commit_applies_once() {
        let mut changes = set();
        changes.write("c1", "k", StorageValue::Int(5), || StorageValue::Null);
        let calls = Cell::new(0);
        let applied = changes
            .commit(|records| {
                calls.set(calls.get() + 1);
                assert_eq!(records.len(), 1);
                Ok(())
            })
            .unwrap();
        assert!(applied);
        let again = changes.commit(|_| panic!("double commit")).unwrap();
        assert!(!again);
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_failed_commit_stays_open_and_unapplied() {
        let mut changes = set();
        changes.write("c1", "k", StorageValue::Int(5), || StorageValue::Null);
        let result = changes.commit(|_| {
            Err(StorageError::CommitRejected {
                details: "quota".into(),
            })
        });
        assert!(result.is_err());
        assert!(changes.is_open());
    }

    #[test]
    fn test_records_deterministic_order() {
        let mut changes = set();
        changes.write("c2", "b", StorageValue::Int(1), || StorageValue::Null);
        changes.write("c1", "z", StorageValue::Int(2), || StorageValue::Null);
        changes.write("c1", "a", StorageValue::Int(3), || StorageValue::Null);
        let keys: Vec<(String, String)> = changes
            .records()
            .iter()
            .map(|r| (r.contract_id.clone(), r.key.clone()))
            .collect();
        assert_eq!(
            keys,
            vec![
                ("c1".to_string(), "a".to_string()),
                ("c1".to_string(), "z".to_string()),
                ("c2".to_string(), "b".to_string()),
            ]
        );
    }
}
