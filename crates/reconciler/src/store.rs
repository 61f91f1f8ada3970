//! Object store contract the reconciler reads and writes through, plus an
//! in-memory implementation for offline evaluation and tests.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::anyhow;
use podtick_core::{MetaPatch, Metadata, ObjectKey, Snapshot};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("object not found")]
    NotFound,
    #[error("resource version conflict")]
    Conflict,
    #[error("store unavailable: {0:#}")]
    Unavailable(anyhow::Error),
}

/// Fetch and conditional-update primitives.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, key: &ObjectKey) -> Result<Snapshot, StoreError>;

    /// Apply `patch` only if the object is still at `base.resource_version`;
    /// otherwise fail with [`StoreError::Conflict`].
    async fn update(&self, base: &Snapshot, patch: &MetaPatch) -> Result<(), StoreError>;
}

#[async_trait::async_trait]
impl<S: ObjectStore + ?Sized> ObjectStore for Arc<S> {
    async fn get(&self, key: &ObjectKey) -> Result<Snapshot, StoreError> {
        (**self).get(key).await
    }

    async fn update(&self, base: &Snapshot, patch: &MetaPatch) -> Result<(), StoreError> {
        (**self).update(base, patch).await
    }
}

/// Failure injected into the next matching [`MemStore`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    NotFound,
    Conflict,
    Unavailable,
}

impl Fault {
    fn into_error(self) -> StoreError {
        match self {
            Fault::NotFound => StoreError::NotFound,
            Fault::Conflict => StoreError::Conflict,
            Fault::Unavailable => StoreError::Unavailable(anyhow!("injected outage")),
        }
    }
}

#[derive(Default)]
struct MemInner {
    objects: BTreeMap<ObjectKey, (u64, Metadata)>,
    get_faults: VecDeque<Fault>,
    update_faults: VecDeque<Fault>,
    writes: u64,
}

/// Versioned in-memory store with optimistic concurrency.
#[derive(Default)]
pub struct MemStore {
    inner: Mutex<MemInner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert or replace an object, bumping its version.
    pub fn put(&self, key: ObjectKey, meta: Metadata) -> u64 {
        let mut inner = self.lock();
        let version = inner.objects.get(&key).map(|(v, _)| v + 1).unwrap_or(1);
        inner.objects.insert(key, (version, meta));
        version
    }

    pub fn remove(&self, key: &ObjectKey) -> Option<Metadata> {
        self.lock().objects.remove(key).map(|(_, m)| m)
    }

    pub fn meta(&self, key: &ObjectKey) -> Option<Metadata> {
        self.lock().objects.get(key).map(|(_, m)| m.clone())
    }

    pub fn version(&self, key: &ObjectKey) -> Option<u64> {
        self.lock().objects.get(key).map(|(v, _)| *v)
    }

    /// Successful conditional updates so far.
    pub fn writes(&self) -> u64 {
        self.lock().writes
    }

    pub fn fail_next_get(&self, fault: Fault) {
        self.lock().get_faults.push_back(fault);
    }

    pub fn fail_next_update(&self, fault: Fault) {
        self.lock().update_faults.push_back(fault);
    }
}

#[async_trait::async_trait]
impl ObjectStore for MemStore {
    async fn get(&self, key: &ObjectKey) -> Result<Snapshot, StoreError> {
        let mut inner = self.lock();
        if let Some(fault) = inner.get_faults.pop_front() {
            return Err(fault.into_error());
        }
        let (version, meta) = inner.objects.get(key).ok_or(StoreError::NotFound)?;
        Ok(Snapshot { key: key.clone(), resource_version: Some(version.to_string()), meta: meta.clone() })
    }

    async fn update(&self, base: &Snapshot, patch: &MetaPatch) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if let Some(fault) = inner.update_faults.pop_front() {
            return Err(fault.into_error());
        }
        let (version, meta) = inner.objects.get_mut(&base.key).ok_or(StoreError::NotFound)?;
        if base.resource_version.as_deref() != Some(version.to_string().as_str()) {
            return Err(StoreError::Conflict);
        }
        patch.apply_to(meta);
        *version += 1;
        inner.writes += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stale_version_is_rejected() {
        let store = MemStore::new();
        let key = ObjectKey::namespaced("default", "p");
        store.put(key.clone(), Metadata::default());
        let snap = store.get(&key).await.unwrap();

        let mut patch = MetaPatch::default();
        patch.annotations.insert("a".into(), Some("1".into()));
        store.update(&snap, &patch).await.unwrap();
        assert!(matches!(store.update(&snap, &patch).await, Err(StoreError::Conflict)));
        assert_eq!(store.writes(), 1);
        assert_eq!(store.version(&key), Some(2));
    }

    #[tokio::test]
    async fn injected_faults_fire_once() {
        let store = MemStore::new();
        let key = ObjectKey::namespaced("default", "p");
        store.put(key.clone(), Metadata::default());
        store.fail_next_get(Fault::Unavailable);
        assert!(matches!(store.get(&key).await, Err(StoreError::Unavailable(_))));
        assert!(store.get(&key).await.is_ok());
        assert!(matches!(store.get(&ObjectKey::namespaced("default", "nope")).await, Err(StoreError::NotFound)));
    }
}
