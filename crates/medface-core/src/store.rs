//! Enrollment store: one active reference descriptor per identity.

use crate::types::{EnrollmentRecord, FaceDescriptor, IdentityKey};
use chrono::Utc;
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::RwLock;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("descriptor has {actual} dimensions, store expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("enrollment store lock poisoned")]
    Poisoned,
    #[error("storage backend: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl StoreError {
    pub fn backend(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Backend(err.into())
    }
}

/// Reject a descriptor whose length differs from the store's dimensionality.
pub fn check_dimension(expected: usize, descriptor: &FaceDescriptor) -> Result<(), StoreError> {
    if descriptor.dimension() != expected {
        return Err(StoreError::DimensionMismatch {
            expected,
            actual: descriptor.dimension(),
        });
    }
    Ok(())
}

/// Point-in-time copy of the enrolled records.
///
/// Taken atomically with respect to individual records; iterate it as often
/// as needed. Records enrolled after the snapshot was taken are not visible.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    records: Vec<EnrollmentRecord>,
}

impl Snapshot {
    pub fn new(records: Vec<EnrollmentRecord>) -> Self {
        Self { records }
    }
}

impl Deref for Snapshot {
    type Target = [EnrollmentRecord];

    fn deref(&self) -> &Self::Target {
        &self.records
    }
}

impl<'a> IntoIterator for &'a Snapshot {
    type Item = &'a EnrollmentRecord;
    type IntoIter = std::slice::Iter<'a, EnrollmentRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

/// Key-indexed storage of enrollment records.
///
/// Replacement of a single identity's record must be atomic: a concurrent
/// reader sees either the old or the new descriptor, never a mix.
pub trait EnrollmentStore: Send + Sync {
    /// Descriptor length every stored record has.
    fn dimension(&self) -> usize;

    /// Insert or replace the record for `key`.
    fn put(
        &self,
        key: IdentityKey,
        descriptor: FaceDescriptor,
    ) -> Result<EnrollmentRecord, StoreError>;

    fn get(&self, key: &IdentityKey) -> Result<Option<EnrollmentRecord>, StoreError>;

    fn snapshot(&self) -> Result<Snapshot, StoreError>;

    /// Remove the record for `key`. Returns whether one existed; absence is
    /// not an error.
    fn remove(&self, key: &IdentityKey) -> Result<bool, StoreError>;

    fn len(&self) -> Result<usize, StoreError>;

    fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }
}

/// In-process store guarded by a single `RwLock`.
#[derive(Debug)]
pub struct MemoryStore {
    dimension: usize,
    records: RwLock<HashMap<IdentityKey, EnrollmentRecord>>,
}

impl MemoryStore {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Insert a fully formed record, keeping its original timestamp.
    /// Used by persistent backends to warm the cache.
    pub fn restore(&self, record: EnrollmentRecord) -> Result<(), StoreError> {
        check_dimension(self.dimension, &record.descriptor)?;
        let mut records = self.records.write().map_err(|_| StoreError::Poisoned)?;
        records.insert(record.identity_key.clone(), record);
        Ok(())
    }
}

impl EnrollmentStore for MemoryStore {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn put(
        &self,
        key: IdentityKey,
        descriptor: FaceDescriptor,
    ) -> Result<EnrollmentRecord, StoreError> {
        check_dimension(self.dimension, &descriptor)?;
        let record = EnrollmentRecord {
            identity_key: key,
            descriptor,
            enrolled_at: Utc::now(),
        };
        let mut records = self.records.write().map_err(|_| StoreError::Poisoned)?;
        records.insert(record.identity_key.clone(), record.clone());
        Ok(record)
    }

    fn get(&self, key: &IdentityKey) -> Result<Option<EnrollmentRecord>, StoreError> {
        let records = self.records.read().map_err(|_| StoreError::Poisoned)?;
        Ok(records.get(key).cloned())
    }

    fn snapshot(&self) -> Result<Snapshot, StoreError> {
        let records = self.records.read().map_err(|_| StoreError::Poisoned)?;
        Ok(Snapshot::new(records.values().cloned().collect()))
    }

    fn remove(&self, key: &IdentityKey) -> Result<bool, StoreError> {
        let mut records = self.records.write().map_err(|_| StoreError::Poisoned)?;
        Ok(records.remove(key).is_some())
    }

    fn len(&self) -> Result<usize, StoreError> {
        let records = self.records.read().map_err(|_| StoreError::Poisoned)?;
        Ok(records.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn descriptor(fill: f32, dim: usize) -> FaceDescriptor {
        FaceDescriptor::new(vec![fill; dim])
    }

    #[test]
    fn test_put_then_get() {
        let store = MemoryStore::new(4);
        let record = store.put("alice".into(), descriptor(0.5, 4)).unwrap();
        assert_eq!(record.identity_key.as_str(), "alice");

        let fetched = store.get(&"alice".into()).unwrap().unwrap();
        assert_eq!(fetched, record);
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn test_put_replaces_existing_identity() {
        let store = MemoryStore::new(4);
        store.put("alice".into(), descriptor(0.1, 4)).unwrap();
        store.put("alice".into(), descriptor(0.9, 4)).unwrap();

        assert_eq!(store.len().unwrap(), 1);
        let fetched = store.get(&"alice".into()).unwrap().unwrap();
        assert_eq!(fetched.descriptor, descriptor(0.9, 4));
    }

    #[test]
    fn test_dimension_mismatch_leaves_store_unchanged() {
        let store = MemoryStore::new(128);
        store.put("alice".into(), descriptor(0.1, 128)).unwrap();

        let err = store.put("bob".into(), descriptor(0.1, 64)).unwrap_err();
        assert!(matches!(
            err,
            StoreError::DimensionMismatch {
                expected: 128,
                actual: 64
            }
        ));
        assert_eq!(store.len().unwrap(), 1);
        assert!(store.get(&"bob".into()).unwrap().is_none());
    }

    #[test]
    fn test_remove_is_idempotent() {
        let store = MemoryStore::new(2);
        store.put("alice".into(), descriptor(0.1, 2)).unwrap();
        assert!(store.remove(&"alice".into()).unwrap());
        assert!(!store.remove(&"alice".into()).unwrap());
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn test_snapshot_is_isolated_from_later_writes() {
        let store = MemoryStore::new(2);
        store.put("alice".into(), descriptor(0.1, 2)).unwrap();
        let snapshot = store.snapshot().unwrap();

        store.put("bob".into(), descriptor(0.2, 2)).unwrap();
        store.remove(&"alice".into()).unwrap();

        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].identity_key.as_str(), "alice");
        // Restartable: iterating twice yields the same records.
        assert_eq!(snapshot.iter().count(), (&snapshot).into_iter().count());
    }

    #[test]
    fn test_restore_keeps_timestamp() {
        let store = MemoryStore::new(2);
        let original = store.put("alice".into(), descriptor(0.1, 2)).unwrap();
        let other = MemoryStore::new(2);
        other.restore(original.clone()).unwrap();
        assert_eq!(other.get(&"alice".into()).unwrap(), Some(original));
    }

    #[test]
    fn test_concurrent_puts_never_tear_records() {
        let store = Arc::new(MemoryStore::new(64));
        let writers: Vec<_> = (0..4)
            .map(|i| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        store.put("shared".into(), descriptor(i as f32, 64)).unwrap();
                    }
                })
            })
            .collect();

        for _ in 0..100 {
            for record in &store.snapshot().unwrap() {
                let first = record.descriptor.values()[0];
                assert!(record.descriptor.values().iter().all(|v| *v == first));
            }
        }
        for w in writers {
            w.join().unwrap();
        }
        assert_eq!(store.len().unwrap(), 1);
    }
}
