//! In-memory backend for tests and throwaway nodes.
//!
//! The keyspace is an `Arc<BTreeMap>` behind a lock. Snapshots clone the
//! `Arc`; a write copies the map only while a snapshot still holds the old
//! version.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use parking_lot::RwLock;

use kestrel_core::error::DatabaseError;

use super::{Backend, Snapshot, WriteOp};

type Keyspace = BTreeMap<Vec<u8>, Vec<u8>>;

#[derive(Default)]
pub struct MemoryBackend {
    map: RwLock<Arc<Keyspace>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of raw rows, including bucket registry rows.
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}

impl Backend for MemoryBackend {
    fn snapshot(&self) -> Box<dyn Snapshot + '_> {
        Box::new(MemorySnapshot {
            map: Arc::clone(&self.map.read()),
        })
    }

    fn write(&self, ops: Vec<WriteOp>) -> Result<(), DatabaseError> {
        let mut guard = self.map.write();
        let map = Arc::make_mut(&mut guard);
        for op in ops {
            match op {
                WriteOp::Put { key, value } => {
                    map.insert(key, value);
                }
                WriteOp::Delete { key } => {
                    map.remove(&key);
                }
            }
        }
        Ok(())
    }
}

struct MemorySnapshot {
    map: Arc<Keyspace>,
}

impl Snapshot for MemorySnapshot {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DatabaseError> {
        Ok(self.map.get(key).cloned())
    }

    fn next_entry(
        &self,
        from: &[u8],
        inclusive: bool,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>, DatabaseError> {
        let lower = if inclusive {
            Bound::Included(from)
        } else {
            Bound::Excluded(from)
        };
        Ok(self
            .map
            .range::<[u8], _>((lower, Bound::Unbounded))
            .next()
            .map(|(key, value)| (key.clone(), value.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(key: &[u8], value: &[u8]) -> WriteOp {
        WriteOp::Put {
            key: key.to_vec(),
            value: value.to_vec(),
        }
    }

    #[test]
    fn write_then_read() {
        let backend = MemoryBackend::new();
        assert!(backend.is_empty());
        backend.write(vec![put(b"a", b"1"), put(b"b", b"2")]).unwrap();
        assert_eq!(backend.len(), 2);
        assert_eq!(backend.snapshot().get(b"a").unwrap(), Some(b"1".to_vec()));

        backend
            .write(vec![WriteOp::Delete { key: b"a".to_vec() }])
            .unwrap();
        assert_eq!(backend.snapshot().get(b"a").unwrap(), None);
    }

    #[test]
    fn snapshot_is_frozen() {
        let backend = MemoryBackend::new();
        backend.write(vec![put(b"a", b"1")]).unwrap();
        let snapshot = backend.snapshot();
        backend.write(vec![put(b"a", b"2")]).unwrap();
        assert_eq!(snapshot.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(backend.snapshot().get(b"a").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn next_entry_bounds() {
        let backend = MemoryBackend::new();
        backend.write(vec![put(b"b", b""), put(b"d", b"")]).unwrap();
        let snapshot = backend.snapshot();
        let key = |found: Option<(Vec<u8>, Vec<u8>)>| found.map(|(k, _)| k);
        assert_eq!(key(snapshot.next_entry(b"b", true).unwrap()), Some(b"b".to_vec()));
        assert_eq!(key(snapshot.next_entry(b"b", false).unwrap()), Some(b"d".to_vec()));
        assert_eq!(key(snapshot.next_entry(b"c", true).unwrap()), Some(b"d".to_vec()));
        assert_eq!(key(snapshot.next_entry(b"d", false).unwrap()), None);
    }
}
