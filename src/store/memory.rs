//! In-memory store backed by a `BTreeMap`.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::RwLock;

use super::{BatchOp, KvPair, KvStore};
use crate::error::{Error, Result};

/// In-memory ordered store.
///
/// Used by tests and by nodes configured to run without persistence.
#[derive(Default)]
pub struct MemoryStore {
    map: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records held
    pub fn len(&self) -> usize {
        self.map.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned<T>(_: T) -> Error {
    Error::Storage("memory store lock poisoned".into())
}

impl KvStore for MemoryStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let map = self.map.read().map_err(poisoned)?;
        Ok(map.get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut map = self.map.write().map_err(poisoned)?;
        map.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        let mut map = self.map.write().map_err(poisoned)?;
        map.remove(key);
        Ok(())
    }

    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<()> {
        // Single write guard: readers never observe a half-applied batch.
        let mut map = self.map.write().map_err(poisoned)?;
        for op in ops {
            match op {
                BatchOp::Put { key, value } => {
                    map.insert(key, value);
                }
                BatchOp::Delete { key } => {
                    map.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn seek_prev(&self, key: &[u8]) -> Result<Option<KvPair>> {
        let map = self.map.read().map_err(poisoned)?;
        Ok(map
            .range::<[u8], _>((Bound::Unbounded, Bound::Excluded(key)))
            .next_back()
            .map(|(k, v)| (k.clone(), v.clone())))
    }

    fn scan_from(&self, start: &[u8], end: &[u8], limit: usize) -> Result<Vec<KvPair>> {
        if start >= end {
            return Ok(Vec::new());
        }
        let map = self.map.read().map_err(poisoned)?;
        Ok(map
            .range::<[u8], _>((Bound::Included(start), Bound::Excluded(end)))
            .take(limit)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_delete() {
        let store = MemoryStore::new();
        store.put(b"alpha", b"1").unwrap();
        assert_eq!(store.get(b"alpha").unwrap(), Some(b"1".to_vec()));

        store.delete(b"alpha").unwrap();
        assert_eq!(store.get(b"alpha").unwrap(), None);
        // Deleting an absent key is fine
        store.delete(b"alpha").unwrap();
    }

    #[test]
    fn test_batch_applies_in_order() {
        let store = MemoryStore::new();
        store
            .write_batch(vec![
                BatchOp::put(b"k".to_vec(), b"v1".to_vec()),
                BatchOp::put(b"k".to_vec(), b"v2".to_vec()),
                BatchOp::put(b"gone".to_vec(), b"x".to_vec()),
                BatchOp::delete(b"gone".to_vec()),
            ])
            .unwrap();

        assert_eq!(store.get(b"k").unwrap(), Some(b"v2".to_vec()));
        assert_eq!(store.get(b"gone").unwrap(), None);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_seek_prev_is_strict() {
        let store = MemoryStore::new();
        store.put(&[1, 0], b"a").unwrap();
        store.put(&[1, 5], b"b").unwrap();
        store.put(&[2, 0], b"c").unwrap();

        let (k, _) = store.seek_prev(&[2, 0]).unwrap().unwrap();
        assert_eq!(k, vec![1, 5]);
        assert!(store.seek_prev(&[1, 0]).unwrap().is_none());
    }

    #[test]
    fn test_scan_respects_bounds_and_limit() {
        let store = MemoryStore::new();
        for i in 0u8..10 {
            store.put(&[7, i], &[i]).unwrap();
        }
        store.put(&[8, 0], b"other").unwrap();

        let rows = store.scan_from(&[7, 3], &[8], 4).unwrap();
        let keys: Vec<u8> = rows.iter().map(|(k, _)| k[1]).collect();
        assert_eq!(keys, vec![3, 4, 5, 6]);

        let rows = store.scan_from(&[7, 8], &[8], 100).unwrap();
        assert_eq!(rows.len(), 2);
    }
}
