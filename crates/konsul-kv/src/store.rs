use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Weak;

use async_trait::async_trait;
use konsul_store_api::KvApplyApi;
use konsul_store_api::NoopSink;
use konsul_store_api::PersistenceSink;
use konsul_store_api::WatchNotifier;
use konsul_types::kv::KvEntrySnapshot;
use konsul_types::now_ms;
use konsul_types::watch::WatchEvent;
use konsul_types::KonsulError;
use konsul_types::KvEntry;
use konsul_types::Result;
use log::debug;
use tokio::sync::RwLock;

/// Map and global index live behind the same lock so a mutation and its
/// index allocation are always observed together.
struct Inner {
    map: BTreeMap<String, KvEntry>,
    index: u64,
}

pub struct KvStore {
    inner: RwLock<Inner>,
    persistence: Arc<dyn PersistenceSink>,
    watch: RwLock<Option<Weak<dyn WatchNotifier>>>,
}

impl std::fmt::Debug for KvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvStore").finish_non_exhaustive()
    }
}

impl Default for KvStore {
    fn default() -> Self {
        Self::new(Arc::new(NoopSink))
    }
}

impl KvStore {
    pub fn new(persistence: Arc<dyn PersistenceSink>) -> Self {
        KvStore {
            inner: RwLock::new(Inner {
                map: BTreeMap::new(),
                index: 0,
            }),
            persistence,
            watch: RwLock::new(None),
        }
    }

    /// Wires the watch manager after both it and the store exist. Held as a
    /// weak reference: the store never keeps the manager alive.
    pub async fn set_watch_notifier(&self, notifier: Weak<dyn WatchNotifier>) {
        *self.watch.write().await = Some(notifier);
    }

    async fn emit(&self, event: WatchEvent) {
        let guard = self.watch.read().await;
        if let Some(weak) = guard.as_ref() {
            if let Some(notifier) = weak.upgrade() {
                notifier.notify(event);
            }
        }
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        self.inner.read().await.map.get(key).map(|e| e.value.clone())
    }

    pub async fn get_entry(&self, key: &str) -> Option<KvEntry> {
        self.inner.read().await.map.get(key).cloned()
    }

    pub async fn list(&self) -> Vec<String> {
        self.inner.read().await.map.keys().cloned().collect()
    }

    pub async fn list_entries(&self) -> BTreeMap<String, KvEntry> {
        self.inner.read().await.map.clone()
    }

    pub async fn batch_get(&self, keys: &[String]) -> BTreeMap<String, String> {
        let inner = self.inner.read().await;
        keys.iter()
            .filter_map(|k| inner.map.get(k).map(|e| (k.clone(), e.value.clone())))
            .collect()
    }

    pub async fn batch_get_entries(&self, keys: &[String]) -> BTreeMap<String, KvEntry> {
        let inner = self.inner.read().await;
        keys.iter()
            .filter_map(|k| inner.map.get(k).map(|e| (k.clone(), e.clone())))
            .collect()
    }

    // ---- unconditional writes ----

    pub async fn set(&self, key: String, value: String) -> Result<KvEntry> {
        let (entry, old) = self.set_impl(key.clone(), value.clone(), None).await;
        self.persistence.kv_set(&key, value.as_bytes()).await?;
        self.emit(WatchEvent::Set {
            key,
            value: entry.value.clone(),
            old_value: old,
            timestamp_ms: now_ms(),
        })
        .await;
        Ok(entry)
    }

    pub async fn set_local(&self, key: String, value: String) -> Result<KvEntry> {
        let (entry, old) = self.set_impl(key.clone(), value.clone(), None).await;
        self.emit(WatchEvent::Set {
            key,
            value: entry.value.clone(),
            old_value: old,
            timestamp_ms: now_ms(),
        })
        .await;
        Ok(entry)
    }

    pub async fn set_with_flags(&self, key: String, value: String, flags: u64) -> Result<KvEntry> {
        let (entry, old) = self.set_impl(key.clone(), value.clone(), Some(flags)).await;
        self.persistence.kv_set(&key, value.as_bytes()).await?;
        self.emit(WatchEvent::Set {
            key,
            value: entry.value.clone(),
            old_value: old,
            timestamp_ms: now_ms(),
        })
        .await;
        Ok(entry)
    }

    pub async fn set_with_flags_local(&self, key: String, value: String, flags: u64) -> Result<KvEntry> {
        let (entry, old) = self.set_impl(key.clone(), value.clone(), Some(flags)).await;
        self.emit(WatchEvent::Set {
            key,
            value: entry.value.clone(),
            old_value: old,
            timestamp_ms: now_ms(),
        })
        .await;
        Ok(entry)
    }

    async fn set_impl(&self, key: String, value: String, flags: Option<u64>) -> (KvEntry, Option<String>) {
        let mut inner = self.inner.write().await;
        inner.index += 1;
        let index = inner.index;

        let old_value = inner.map.get(&key).map(|e| e.value.clone());
        let entry = match inner.map.get(&key) {
            Some(existing) => existing.updated(value, flags, index),
            None => KvEntry::new(value, flags.unwrap_or(0), index),
        };
        inner.map.insert(key, entry.clone());
        (entry, old_value)
    }

    // ---- CAS writes ----

    pub async fn set_cas(&self, key: String, value: String, flags: Option<u64>, expected_index: u64) -> Result<KvEntry> {
        let (entry, old) = self.set_cas_impl(&key, value.clone(), flags, expected_index).await?;
        self.persistence.kv_set(&key, value.as_bytes()).await?;
        self.emit(WatchEvent::Set {
            key,
            value: entry.value.clone(),
            old_value: old,
            timestamp_ms: now_ms(),
        })
        .await;
        Ok(entry)
    }

    pub async fn set_cas_local(
        &self,
        key: String,
        value: String,
        flags: Option<u64>,
        expected_index: u64,
    ) -> Result<KvEntry> {
        let (entry, old) = self.set_cas_impl(&key, value.clone(), flags, expected_index).await?;
        self.emit(WatchEvent::Set {
            key,
            value: entry.value.clone(),
            old_value: old,
            timestamp_ms: now_ms(),
        })
        .await;
        Ok(entry)
    }

    async fn set_cas_impl(
        &self,
        key: &str,
        value: String,
        flags: Option<u64>,
        expected_index: u64,
    ) -> Result<(KvEntry, Option<String>)> {
        let mut inner = self.inner.write().await;
        let current = inner.map.get(key).cloned();

        match (&current, expected_index) {
            (None, 0) => {}
            (None, _) => return Err(KonsulError::not_found(key)),
            (Some(e), 0) => return Err(KonsulError::cas_conflict(key, 0, e.modify_index)),
            (Some(e), exp) if e.modify_index != exp => {
                return Err(KonsulError::cas_conflict(key, exp, e.modify_index))
            }
            (Some(_), _) => {}
        }

        inner.index += 1;
        let index = inner.index;
        let old_value = current.as_ref().map(|e| e.value.clone());
        let entry = match &current {
            Some(existing) => existing.updated(value, flags, index),
            None => KvEntry::new(value, flags.unwrap_or(0), index),
        };
        inner.map.insert(key.to_string(), entry.clone());
        Ok((entry, old_value))
    }

    // ---- deletes ----

    pub async fn delete(&self, key: &str) -> Result<()> {
        let old = self.delete_impl(key).await;
        self.persistence.kv_delete(key).await?;
        if let Some(old) = old {
            self.emit(WatchEvent::Delete {
                key: key.to_string(),
                old_value: Some(old),
                timestamp_ms: now_ms(),
            })
            .await;
        }
        Ok(())
    }

    pub async fn delete_local(&self, key: &str) -> Result<()> {
        let old = self.delete_impl(key).await;
        if let Some(old) = old {
            self.emit(WatchEvent::Delete {
                key: key.to_string(),
                old_value: Some(old),
                timestamp_ms: now_ms(),
            })
            .await;
        }
        Ok(())
    }

    /// Unconditional and idempotent: absence of `key` is not an error.
    async fn delete_impl(&self, key: &str) -> Option<String> {
        let mut inner = self.inner.write().await;
        inner.map.remove(key).map(|e| e.value)
    }

    pub async fn delete_cas(&self, key: &str, expected_index: u64) -> Result<()> {
        let old = self.delete_cas_impl(key, expected_index).await?;
        self.persistence.kv_delete(key).await?;
        self.emit(WatchEvent::Delete {
            key: key.to_string(),
            old_value: Some(old),
            timestamp_ms: now_ms(),
        })
        .await;
        Ok(())
    }

    pub async fn delete_cas_local(&self, key: &str, expected_index: u64) -> Result<()> {
        let old = self.delete_cas_impl(key, expected_index).await?;
        self.emit(WatchEvent::Delete {
            key: key.to_string(),
            old_value: Some(old),
            timestamp_ms: now_ms(),
        })
        .await;
        Ok(())
    }

    async fn delete_cas_impl(&self, key: &str, expected_index: u64) -> Result<String> {
        let mut inner = self.inner.write().await;
        let current = inner
            .map
            .get(key)
            .cloned()
            .ok_or_else(|| KonsulError::not_found(key))?;

        if current.modify_index != expected_index {
            return Err(KonsulError::cas_conflict(key, expected_index, current.modify_index));
        }

        inner.map.remove(key);
        Ok(current.value)
    }

    // ---- batch ----

    pub async fn batch_set(&self, items: Vec<(String, String, u64)>) -> Result<()> {
        let events = self.batch_set_impl(items.clone()).await;
        let persisted: Vec<(String, Vec<u8>)> = items
            .into_iter()
            .map(|(k, v, _)| (k, v.into_bytes()))
            .collect();
        self.persistence.kv_batch_set(&persisted).await?;
        for event in events {
            self.emit(event).await;
        }
        Ok(())
    }

    pub async fn batch_set_local(&self, items: Vec<(String, String, u64)>) -> Result<()> {
        let events = self.batch_set_impl(items).await;
        for event in events {
            self.emit(event).await;
        }
        Ok(())
    }

    /// All items are applied inside one critical section: the lock is held
    /// for the whole batch, so there is no partial visibility.
    async fn batch_set_impl(&self, items: Vec<(String, String, u64)>) -> Vec<WatchEvent> {
        let mut inner = self.inner.write().await;
        let mut events = Vec::with_capacity(items.len());

        for (key, value, flags) in items {
            inner.index += 1;
            let index = inner.index;
            let old_value = inner.map.get(&key).map(|e| e.value.clone());
            let entry = match inner.map.get(&key) {
                Some(existing) => existing.updated(value.clone(), Some(flags), index),
                None => KvEntry::new(value.clone(), flags, index),
            };
            inner.map.insert(key.clone(), entry);
            events.push(WatchEvent::Set {
                key,
                value,
                old_value,
                timestamp_ms: now_ms(),
            });
        }

        events
    }

    pub async fn batch_delete(&self, keys: Vec<String>) -> Result<()> {
        let events = self.batch_delete_impl(keys.clone()).await;
        self.persistence.kv_batch_delete(&keys).await?;
        for event in events {
            self.emit(event).await;
        }
        Ok(())
    }

    pub async fn batch_delete_local(&self, keys: Vec<String>) -> Result<()> {
        let events = self.batch_delete_impl(keys).await;
        for event in events {
            self.emit(event).await;
        }
        Ok(())
    }

    async fn batch_delete_impl(&self, keys: Vec<String>) -> Vec<WatchEvent> {
        let mut inner = self.inner.write().await;
        let mut events = Vec::new();

        for key in keys {
            if let Some(old) = inner.map.remove(&key) {
                events.push(WatchEvent::Delete {
                    key,
                    old_value: Some(old.value),
                    timestamp_ms: now_ms(),
                });
            }
        }

        events
    }

    pub async fn batch_set_cas(&self, items: Vec<(String, String, u64, u64)>) -> Result<()> {
        let (events, persisted) = self.batch_set_cas_impl(items).await?;
        self.persistence.kv_batch_set(&persisted).await?;
        for event in events {
            self.emit(event).await;
        }
        Ok(())
    }

    pub async fn batch_set_cas_local(&self, items: Vec<(String, String, u64, u64)>) -> Result<()> {
        let (events, _persisted) = self.batch_set_cas_impl(items).await?;
        for event in events {
            self.emit(event).await;
        }
        Ok(())
    }

    /// Two-phase: validate every expectation first under the write lock; if
    /// any fails, abort with no state change at all.
    async fn batch_set_cas_impl(
        &self,
        items: Vec<(String, String, u64, u64)>,
    ) -> Result<(Vec<WatchEvent>, Vec<(String, Vec<u8>)>)> {
        let mut inner = self.inner.write().await;

        for (key, _value, _flags, expected_index) in &items {
            let current = inner.map.get(key);
            match (current, *expected_index) {
                (None, 0) => {}
                (None, _exp) => return Err(KonsulError::not_found(key.as_str())),
                (Some(e), 0) => return Err(KonsulError::cas_conflict(key.as_str(), 0, e.modify_index)),
                (Some(e), exp) if e.modify_index != exp => {
                    return Err(KonsulError::cas_conflict(key.as_str(), exp, e.modify_index))
                }
                (Some(_), _) => {}
            }
        }

        let mut events = Vec::with_capacity(items.len());
        let mut persisted = Vec::with_capacity(items.len());

        for (key, value, flags, _expected_index) in items {
            inner.index += 1;
            let index = inner.index;
            let old_value = inner.map.get(&key).map(|e| e.value.clone());
            let entry = match inner.map.get(&key) {
                Some(existing) => existing.updated(value.clone(), Some(flags), index),
                None => KvEntry::new(value.clone(), flags, index),
            };
            inner.map.insert(key.clone(), entry);
            persisted.push((key.clone(), value.clone().into_bytes()));
            events.push(WatchEvent::Set {
                key,
                value,
                old_value,
                timestamp_ms: now_ms(),
            });
        }

        Ok((events, persisted))
    }

    pub async fn batch_delete_cas(&self, items: BTreeMap<String, u64>) -> Result<()> {
        let (events, keys) = self.batch_delete_cas_impl(items).await?;
        self.persistence.kv_batch_delete(&keys).await?;
        for event in events {
            self.emit(event).await;
        }
        Ok(())
    }

    pub async fn batch_delete_cas_local(&self, items: BTreeMap<String, u64>) -> Result<()> {
        let (events, _keys) = self.batch_delete_cas_impl(items).await?;
        for event in events {
            self.emit(event).await;
        }
        Ok(())
    }

    async fn batch_delete_cas_impl(
        &self,
        items: BTreeMap<String, u64>,
    ) -> Result<(Vec<WatchEvent>, Vec<String>)> {
        let mut inner = self.inner.write().await;

        for (key, expected_index) in &items {
            let current = inner
                .map
                .get(key)
                .ok_or_else(|| KonsulError::not_found(key.as_str()))?;
            if current.modify_index != *expected_index {
                return Err(KonsulError::cas_conflict(key.as_str(), *expected_index, current.modify_index));
            }
        }

        let mut events = Vec::with_capacity(items.len());
        let mut keys = Vec::with_capacity(items.len());

        for key in items.into_keys() {
            if let Some(old) = inner.map.remove(&key) {
                keys.push(key.clone());
                events.push(WatchEvent::Delete {
                    key,
                    old_value: Some(old.value),
                    timestamp_ms: now_ms(),
                });
            }
        }

        Ok((events, keys))
    }

    // ---- snapshot ----

    pub async fn get_all_data(&self) -> BTreeMap<String, KvEntrySnapshot> {
        let inner = self.inner.read().await;
        inner.map.iter().map(|(k, v)| (k.clone(), v.into())).collect()
    }

    pub async fn restore_from_snapshot(&self, data: BTreeMap<String, KvEntrySnapshot>) {
        let mut inner = self.inner.write().await;
        let mut max_index = inner.index;
        let mut map = BTreeMap::new();

        for (key, snap) in data {
            max_index = max_index.max(snap.modify_index).max(snap.create_index);
            map.insert(key, KvEntry::from(snap));
        }

        inner.map = map;
        inner.index = max_index;
        debug!("kv store restored from snapshot, index={}", inner.index);
    }

    pub async fn curr_index(&self) -> u64 {
        self.inner.read().await.index
    }
}

#[async_trait]
impl KvApplyApi for KvStore {
    async fn set_local(&self, key: String, value: String) -> Result<KvEntry> {
        KvStore::set_local(self, key, value).await
    }

    async fn set_with_flags_local(&self, key: String, value: String, flags: u64) -> Result<KvEntry> {
        KvStore::set_with_flags_local(self, key, value, flags).await
    }

    async fn set_cas_local(
        &self,
        key: String,
        value: String,
        flags: Option<u64>,
        expected_index: u64,
    ) -> Result<KvEntry> {
        KvStore::set_cas_local(self, key, value, flags, expected_index).await
    }

    async fn delete_local(&self, key: &str) -> Result<()> {
        KvStore::delete_local(self, key).await
    }

    async fn delete_cas_local(&self, key: &str, expected_index: u64) -> Result<()> {
        KvStore::delete_cas_local(self, key, expected_index).await
    }

    async fn batch_set_local(&self, items: Vec<(String, String, u64)>) -> Result<()> {
        KvStore::batch_set_local(self, items).await
    }

    async fn batch_set_cas_local(&self, items: Vec<(String, String, u64, u64)>) -> Result<()> {
        KvStore::batch_set_cas_local(self, items).await
    }

    async fn batch_delete_local(&self, keys: Vec<String>) -> Result<()> {
        KvStore::batch_delete_local(self, keys).await
    }

    async fn batch_delete_cas_local(&self, items: BTreeMap<String, u64>) -> Result<()> {
        KvStore::batch_delete_cas_local(self, items).await
    }

    async fn get_all_data(&self) -> BTreeMap<String, KvEntrySnapshot> {
        KvStore::get_all_data(self).await
    }

    async fn restore_from_snapshot(&self, data: BTreeMap<String, KvEntrySnapshot>) {
        KvStore::restore_from_snapshot(self, data).await
    }

    async fn curr_index(&self) -> u64 {
        KvStore::curr_index(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_assigns_increasing_modify_index() {
        let store = KvStore::default();
        let a = store.set("a".into(), "1".into()).await.unwrap();
        let b = store.set("a".into(), "2".into()).await.unwrap();
        assert!(b.modify_index > a.modify_index);
        assert_eq!(a.create_index, b.create_index);
    }

    #[tokio::test]
    async fn set_cas_create_only_when_absent() {
        let store = KvStore::default();
        let first = store.set_cas("k".into(), "v1".into(), None, 0).await.unwrap();
        assert_eq!(first.modify_index, 1);

        let err = store.set_cas("k".into(), "v2".into(), None, 0).await.unwrap_err();
        assert_eq!(err.kind(), konsul_types::ErrorKind::CasConflict);
    }

    #[tokio::test]
    async fn set_cas_conflict_leaves_state_untouched() {
        let store = KvStore::default();
        store.set_cas("k".into(), "v1".into(), None, 0).await.unwrap();
        let before = store.get_entry("k").await.unwrap();

        let err = store.set_cas("k".into(), "v2".into(), None, 999).await.unwrap_err();
        assert_eq!(err.kind(), konsul_types::ErrorKind::CasConflict);

        let after = store.get_entry("k").await.unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn cas_sequence_matches_scenario_s2() {
        let store = KvStore::default();
        let r1 = store.set_cas("k".into(), "v1".into(), None, 0).await.unwrap();
        assert_eq!(r1.modify_index, 1);

        let r2 = store.set_cas("k".into(), "v2".into(), None, 1).await.unwrap();
        assert_eq!(r2.modify_index, 2);

        let err = store.set_cas("k".into(), "v3".into(), None, 1).await.unwrap_err();
        match err {
            KonsulError::CasConflict { expected, current, .. } => {
                assert_eq!(expected, 1);
                assert_eq!(current, 2);
            }
            other => panic!("unexpected error: {other:?}"),
        }

        assert_eq!(store.get("k").await.unwrap(), "v2");
    }

    #[tokio::test]
    async fn batch_set_cas_all_or_nothing() {
        let store = KvStore::default();
        // item #1 ("k1") has a stale expectation -> whole batch must fail.
        store.set("k1".into(), "orig".into()).await.unwrap();

        let items = vec![
            ("k0".to_string(), "v0".to_string(), 0u64, 0u64),
            ("k1".to_string(), "v1".to_string(), 0u64, 999u64),
        ];
        let err = store.batch_set_cas(items).await.unwrap_err();
        assert_eq!(err.kind(), konsul_types::ErrorKind::CasConflict);

        // k0 must not have been created by the aborted batch.
        assert!(store.get("k0").await.is_none());
        assert_eq!(store.get("k1").await.unwrap(), "orig");
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let store = KvStore::default();
        store.delete("missing").await.unwrap();
    }

    #[tokio::test]
    async fn snapshot_round_trip_preserves_index() {
        let store = KvStore::default();
        store.set("a".into(), "1".into()).await.unwrap();
        store.set("b".into(), "2".into()).await.unwrap();

        let data = store.get_all_data().await;
        let restored = KvStore::default();
        restored.restore_from_snapshot(data).await;

        assert_eq!(restored.curr_index().await, store.curr_index().await);
        assert_eq!(restored.get("a").await, Some("1".to_string()));
    }
}
