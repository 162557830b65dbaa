use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use konsul_store_api::NoopSink;
use konsul_store_api::PersistenceSink;
use konsul_store_api::RegistryApplyApi;
use konsul_types::now_ms;
use konsul_types::service::CheckDefinition;
use konsul_types::service::CheckStatus;
use konsul_types::service::ServiceEntrySnapshot;
use konsul_types::service::ServiceRegistration;
use konsul_types::KonsulError;
use konsul_types::Result;
use konsul_types::ServiceEntry;
use log::debug;
use tokio::sync::RwLock;

use crate::query::QueryEngine;
use crate::validation::validate_registration;

const DEFAULT_TTL_SECS: u64 = 30;

/// Map, secondary indexes and global index live behind the same lock so a
/// re-registration's index update is never observed half-applied.
struct Inner {
    map: BTreeMap<String, ServiceEntry>,
    tag_index: BTreeMap<String, BTreeSet<String>>,
    meta_index: BTreeMap<String, BTreeMap<String, BTreeSet<String>>>,
    index: u64,
}

impl Inner {
    fn index_entry(&mut self, entry: &ServiceEntry) {
        for tag in &entry.tags {
            self.tag_index
                .entry(tag.clone())
                .or_default()
                .insert(entry.name.clone());
        }
        for (key, value) in &entry.meta {
            self.meta_index
                .entry(key.clone())
                .or_default()
                .entry(value.clone())
                .or_default()
                .insert(entry.name.clone());
        }
    }

    fn deindex_entry(&mut self, entry: &ServiceEntry) {
        for tag in &entry.tags {
            if let Some(bucket) = self.tag_index.get_mut(tag) {
                bucket.remove(&entry.name);
                if bucket.is_empty() {
                    self.tag_index.remove(tag);
                }
            }
        }
        for (key, value) in &entry.meta {
            if let Some(by_value) = self.meta_index.get_mut(key) {
                if let Some(bucket) = by_value.get_mut(value) {
                    bucket.remove(&entry.name);
                    if bucket.is_empty() {
                        by_value.remove(value);
                    }
                }
                if by_value.is_empty() {
                    self.meta_index.remove(key);
                }
            }
        }
    }

    fn all_names(&self) -> BTreeSet<String> {
        self.map.keys().cloned().collect()
    }
}

pub struct ServiceRegistry {
    inner: RwLock<Inner>,
    ttl: Duration,
    persistence: Arc<dyn PersistenceSink>,
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry").field("ttl", &self.ttl).finish_non_exhaustive()
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new(Duration::from_secs(DEFAULT_TTL_SECS), Arc::new(NoopSink))
    }
}

impl ServiceRegistry {
    pub fn new(ttl: Duration, persistence: Arc<dyn PersistenceSink>) -> Self {
        ServiceRegistry {
            inner: RwLock::new(Inner {
                map: BTreeMap::new(),
                tag_index: BTreeMap::new(),
                meta_index: BTreeMap::new(),
                index: 0,
            }),
            ttl,
            persistence,
        }
    }

    // ---- reads ----

    pub async fn get(&self, name: &str) -> Option<ServiceEntry> {
        let inner = self.inner.read().await;
        inner
            .map
            .get(name)
            .filter(|e| e.is_live(now_ms()))
            .cloned()
    }

    /// All live services, in lexicographic order by name.
    pub async fn list(&self) -> Vec<ServiceEntry> {
        let inner = self.inner.read().await;
        let now = now_ms();
        inner.map.values().filter(|e| e.is_live(now)).cloned().collect()
    }

    /// Every entry regardless of liveness, in lexicographic order by name.
    pub async fn list_all(&self) -> Vec<ServiceEntry> {
        let inner = self.inner.read().await;
        inner.map.values().cloned().collect()
    }

    // ---- query engine ----

    pub async fn query_by_tags(&self, tags: &[String]) -> Vec<ServiceEntry> {
        let inner = self.inner.read().await;
        let all = inner.all_names();
        let names = QueryEngine::by_tags(&inner.tag_index, tags, &all);
        self.materialize(&inner, names)
    }

    pub async fn query_by_metadata(&self, filters: &BTreeMap<String, String>) -> Vec<ServiceEntry> {
        let inner = self.inner.read().await;
        let all = inner.all_names();
        let names = QueryEngine::by_metadata(&inner.meta_index, filters, &all);
        self.materialize(&inner, names)
    }

    pub async fn query_by_tags_and_metadata(
        &self,
        tags: &[String],
        filters: &BTreeMap<String, String>,
    ) -> Vec<ServiceEntry> {
        let inner = self.inner.read().await;
        let all = inner.all_names();
        let names = QueryEngine::by_tags_and_metadata(&inner.tag_index, &inner.meta_index, tags, filters, &all);
        self.materialize(&inner, names)
    }

    fn materialize(&self, inner: &Inner, names: BTreeSet<String>) -> Vec<ServiceEntry> {
        let now = now_ms();
        names
            .into_iter()
            .filter_map(|name| inner.map.get(&name))
            .filter(|e| e.is_live(now))
            .cloned()
            .collect()
    }

    // ---- register ----

    pub async fn register(&self, reg: ServiceRegistration) -> Result<ServiceEntry> {
        let entry = self.register_impl(reg, None, now_ms()).await?;
        self.persist(&entry).await?;
        Ok(entry)
    }

    pub async fn register_local(&self, reg: ServiceRegistration, now_ms: u64) -> Result<ServiceEntry> {
        self.register_impl(reg, None, now_ms).await
    }

    pub async fn register_cas(&self, reg: ServiceRegistration, expected_index: u64) -> Result<ServiceEntry> {
        let entry = self.register_impl(reg, Some(expected_index), now_ms()).await?;
        self.persist(&entry).await?;
        Ok(entry)
    }

    pub async fn register_cas_local(&self, reg: ServiceRegistration, expected_index: u64, now_ms: u64) -> Result<ServiceEntry> {
        self.register_impl(reg, Some(expected_index), now_ms).await
    }

    async fn persist(&self, entry: &ServiceEntry) -> Result<()> {
        let blob = serde_json::to_vec(&ServiceEntrySnapshot::from(entry))
            .map_err(|e| KonsulError::internal(format!("encoding service entry: {e}")))?;
        self.persistence.service_set(&entry.name, &blob, self.ttl).await
    }

    async fn register_impl(&self, reg: ServiceRegistration, expected_index: Option<u64>, now: u64) -> Result<ServiceEntry> {
        validate_registration(&reg)?;

        let mut inner = self.inner.write().await;
        let current = inner.map.get(&reg.name).cloned();

        if let Some(exp) = expected_index {
            match (&current, exp) {
                (None, 0) => {}
                (None, _) => return Err(KonsulError::not_found(reg.name.as_str())),
                (Some(e), 0) => return Err(KonsulError::cas_conflict(reg.name.as_str(), 0, e.modify_index)),
                (Some(e), exp) if e.modify_index != exp => {
                    return Err(KonsulError::cas_conflict(reg.name.as_str(), exp, e.modify_index))
                }
                (Some(_), _) => {}
            }
        }

        inner.index += 1;
        let index = inner.index;

        let (create_index, checks) = match &current {
            Some(existing) => (existing.create_index, existing.checks.clone()),
            None => (index, Vec::new()),
        };

        let new_entry = ServiceEntry {
            name: reg.name.clone(),
            address: reg.address,
            port: reg.port,
            tags: reg.tags,
            meta: reg.meta,
            checks,
            expires_at_ms: now + self.ttl.as_millis() as u64,
            create_index,
            modify_index: index,
        };

        // De-index the old entry before inserting the new one, inside the
        // same write-lock critical section.
        if let Some(old) = &current {
            inner.deindex_entry(old);
        }
        inner.index_entry(&new_entry);
        inner.map.insert(new_entry.name.clone(), new_entry.clone());

        Ok(new_entry)
    }

    // ---- deregister ----

    pub async fn deregister(&self, name: &str) -> Result<()> {
        self.deregister_impl(name).await;
        self.persistence.service_delete(name).await
    }

    pub async fn deregister_local(&self, name: &str) -> Result<()> {
        self.deregister_impl(name).await;
        Ok(())
    }

    async fn deregister_impl(&self, name: &str) {
        let mut inner = self.inner.write().await;
        if let Some(old) = inner.map.remove(name) {
            inner.deindex_entry(&old);
        }
    }

    pub async fn deregister_cas(&self, name: &str, expected_index: u64) -> Result<()> {
        self.deregister_cas_impl(name, expected_index).await?;
        self.persistence.service_delete(name).await
    }

    pub async fn deregister_cas_local(&self, name: &str, expected_index: u64) -> Result<()> {
        self.deregister_cas_impl(name, expected_index).await
    }

    async fn deregister_cas_impl(&self, name: &str, expected_index: u64) -> Result<()> {
        let mut inner = self.inner.write().await;
        let current = inner
            .map
            .get(name)
            .cloned()
            .ok_or_else(|| KonsulError::not_found(name))?;

        if current.modify_index != expected_index {
            return Err(KonsulError::cas_conflict(name, expected_index, current.modify_index));
        }

        inner.map.remove(name);
        inner.deindex_entry(&current);
        Ok(())
    }

    // ---- heartbeat / expiry ----

    pub async fn heartbeat(&self, name: &str) -> Result<ServiceEntry> {
        let entry = self.heartbeat_impl(name, now_ms()).await?;
        self.persist(&entry).await?;
        Ok(entry)
    }

    pub async fn heartbeat_local(&self, name: &str, now_ms: u64) -> Result<ServiceEntry> {
        self.heartbeat_impl(name, now_ms).await
    }

    async fn heartbeat_impl(&self, name: &str, now: u64) -> Result<ServiceEntry> {
        let mut inner = self.inner.write().await;
        let entry = inner
            .map
            .get_mut(name)
            .ok_or_else(|| KonsulError::not_found(name))?;
        entry.expires_at_ms = now + self.ttl.as_millis() as u64;
        Ok(entry.clone())
    }

    /// Removes every entry whose TTL has elapsed; returns how many were
    /// removed. Intended to run as a periodic sweep and as part of the
    /// replicated apply path.
    pub async fn cleanup_expired(&self) -> usize {
        let mut inner = self.inner.write().await;
        let now = now_ms();
        let expired: Vec<String> = inner
            .map
            .iter()
            .filter(|(_, e)| !e.is_live(now))
            .map(|(name, _)| name.clone())
            .collect();

        for name in &expired {
            if let Some(old) = inner.map.remove(name) {
                inner.deindex_entry(&old);
            }
        }
        if !expired.is_empty() {
            debug!("expired {} service(s)", expired.len());
        }
        expired.len()
    }

    // ---- health checks ----

    pub async fn register_check(&self, service_name: &str, check: CheckDefinition) -> Result<()> {
        self.register_check_impl(service_name, check).await
    }

    pub async fn register_check_local(&self, service_name: &str, check: CheckDefinition) -> Result<()> {
        self.register_check_impl(service_name, check).await
    }

    async fn register_check_impl(&self, service_name: &str, check: CheckDefinition) -> Result<()> {
        if check.ttl_secs == 0 {
            return Err(KonsulError::validation("check ttl must be greater than zero"));
        }

        let mut inner = self.inner.write().await;
        let entry = inner
            .map
            .get_mut(service_name)
            .ok_or_else(|| KonsulError::not_found(service_name))?;

        match entry.checks.iter_mut().find(|c| c.check_id == check.check_id) {
            Some(existing) => *existing = check,
            None => entry.checks.push(check),
        }
        Ok(())
    }

    pub async fn update_check_status(
        &self,
        service_name: &str,
        check_id: &str,
        status: CheckStatus,
        output: String,
    ) -> Result<()> {
        self.update_check_status_impl(service_name, check_id, status, output, now_ms())
            .await
    }

    pub async fn update_check_status_local(
        &self,
        service_name: &str,
        check_id: &str,
        status: CheckStatus,
        output: String,
        now_ms: u64,
    ) -> Result<()> {
        self.update_check_status_impl(service_name, check_id, status, output, now_ms)
            .await
    }

    async fn update_check_status_impl(
        &self,
        service_name: &str,
        check_id: &str,
        status: CheckStatus,
        output: String,
        now: u64,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let entry = inner
            .map
            .get_mut(service_name)
            .ok_or_else(|| KonsulError::not_found(service_name))?;

        let check = entry
            .checks
            .iter_mut()
            .find(|c| c.check_id == check_id)
            .ok_or_else(|| KonsulError::not_found(check_id))?;

        check.status = status;
        check.output = output;
        check.updated_at = now;
        Ok(())
    }

    pub async fn deregister_check(&self, service_name: &str, check_id: &str) -> Result<()> {
        self.deregister_check_impl(service_name, check_id).await
    }

    pub async fn deregister_check_local(&self, service_name: &str, check_id: &str) -> Result<()> {
        self.deregister_check_impl(service_name, check_id).await
    }

    /// Idempotent: a missing service or check is not an error.
    async fn deregister_check_impl(&self, service_name: &str, check_id: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(entry) = inner.map.get_mut(service_name) {
            entry.checks.retain(|c| c.check_id != check_id);
        }
        Ok(())
    }

    // ---- snapshot ----

    pub async fn get_all_data(&self) -> BTreeMap<String, ServiceEntrySnapshot> {
        let inner = self.inner.read().await;
        inner.map.iter().map(|(k, v)| (k.clone(), v.into())).collect()
    }

    /// Rebuilds both secondary indexes from scratch.
    pub async fn restore_from_snapshot(&self, data: BTreeMap<String, ServiceEntrySnapshot>) {
        let mut inner = self.inner.write().await;
        let mut max_index = inner.index;
        let mut map = BTreeMap::new();
        let mut tag_index: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut meta_index: BTreeMap<String, BTreeMap<String, BTreeSet<String>>> = BTreeMap::new();

        for (name, snap) in data {
            max_index = max_index.max(snap.modify_index).max(snap.create_index);
            let entry = ServiceEntry::from(snap);

            for tag in &entry.tags {
                tag_index.entry(tag.clone()).or_default().insert(name.clone());
            }
            for (key, value) in &entry.meta {
                meta_index
                    .entry(key.clone())
                    .or_default()
                    .entry(value.clone())
                    .or_default()
                    .insert(name.clone());
            }

            map.insert(name, entry);
        }

        inner.map = map;
        inner.tag_index = tag_index;
        inner.meta_index = meta_index;
        inner.index = max_index;
        debug!("service registry restored from snapshot, index={}", inner.index);
    }

    pub async fn curr_index(&self) -> u64 {
        self.inner.read().await.index
    }
}

#[async_trait]
impl RegistryApplyApi for ServiceRegistry {
    async fn register_local(&self, reg: ServiceRegistration, now_ms: u64) -> Result<ServiceEntry> {
        ServiceRegistry::register_local(self, reg, now_ms).await
    }

    async fn register_cas_local(&self, reg: ServiceRegistration, expected_index: u64, now_ms: u64) -> Result<ServiceEntry> {
        ServiceRegistry::register_cas_local(self, reg, expected_index, now_ms).await
    }

    async fn deregister_local(&self, name: &str) -> Result<()> {
        ServiceRegistry::deregister_local(self, name).await
    }

    async fn deregister_cas_local(&self, name: &str, expected_index: u64) -> Result<()> {
        ServiceRegistry::deregister_cas_local(self, name, expected_index).await
    }

    async fn heartbeat_local(&self, name: &str, now_ms: u64) -> Result<ServiceEntry> {
        ServiceRegistry::heartbeat_local(self, name, now_ms).await
    }

    async fn cleanup_expired(&self) -> usize {
        ServiceRegistry::cleanup_expired(self).await
    }

    async fn register_check_local(&self, service_name: &str, check: CheckDefinition) -> Result<()> {
        ServiceRegistry::register_check_local(self, service_name, check).await
    }

    async fn update_check_status_local(
        &self,
        service_name: &str,
        check_id: &str,
        status: CheckStatus,
        output: String,
        now_ms: u64,
    ) -> Result<()> {
        ServiceRegistry::update_check_status_local(self, service_name, check_id, status, output, now_ms).await
    }

    async fn deregister_check_local(&self, service_name: &str, check_id: &str) -> Result<()> {
        ServiceRegistry::deregister_check_local(self, service_name, check_id).await
    }

    async fn get_all_data(&self) -> BTreeMap<String, ServiceEntrySnapshot> {
        ServiceRegistry::get_all_data(self).await
    }

    async fn restore_from_snapshot(&self, data: BTreeMap<String, ServiceEntrySnapshot>) {
        ServiceRegistry::restore_from_snapshot(self, data).await
    }

    async fn curr_index(&self) -> u64 {
        ServiceRegistry::curr_index(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registration(name: &str, tags: &[&str], meta: &[(&str, &str)]) -> ServiceRegistration {
        ServiceRegistration {
            name: name.to_string(),
            address: "10.0.0.1".to_string(),
            port: 8080,
            tags: tags.iter().map(|s| s.to_string()).collect(),
            meta: meta.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        }
    }

    #[tokio::test]
    async fn register_assigns_increasing_modify_index() {
        let registry = ServiceRegistry::default();
        let a = registry.register(registration("api", &[], &[])).await.unwrap();
        let b = registry.register(registration("api", &[], &[])).await.unwrap();
        assert!(b.modify_index > a.modify_index);
        assert_eq!(a.create_index, b.create_index);
    }

    #[tokio::test]
    async fn reregistration_moves_indexes_atomically() {
        let registry = ServiceRegistry::default();
        registry
            .register(registration("api", &["env:dev"], &[]))
            .await
            .unwrap();
        registry
            .register(registration("api", &["env:prod"], &[]))
            .await
            .unwrap();

        let dev = registry.query_by_tags(&["env:dev".to_string()]).await;
        assert!(dev.is_empty());
        let prod = registry.query_by_tags(&["env:prod".to_string()]).await;
        assert_eq!(prod.len(), 1);
        assert_eq!(prod[0].name, "api");
    }

    #[tokio::test]
    async fn register_cas_create_only_when_absent() {
        let registry = ServiceRegistry::default();
        registry.register_cas(registration("api", &[], &[]), 0).await.unwrap();
        let err = registry
            .register_cas(registration("api", &[], &[]), 0)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), konsul_types::ErrorKind::CasConflict);
    }

    #[tokio::test]
    async fn deregister_is_idempotent() {
        let registry = ServiceRegistry::default();
        registry.deregister("missing").await.unwrap();
    }

    #[tokio::test]
    async fn rejects_invalid_registration_without_mutating_state() {
        let registry = ServiceRegistry::default();
        let mut bad = registration("api", &[], &[]);
        bad.port = 0;
        assert!(registry.register(bad).await.is_err());
        assert!(registry.get("api").await.is_none());
    }

    #[tokio::test]
    async fn heartbeat_extends_ttl_and_preserves_indexes() {
        let registry = ServiceRegistry::new(Duration::from_millis(50), Arc::new(NoopSink));
        let created = registry.register(registration("api", &[], &[])).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let after = registry.heartbeat("api").await.unwrap();
        assert_eq!(after.create_index, created.create_index);
        assert_eq!(after.modify_index, created.modify_index);
        assert!(after.expires_at_ms > created.expires_at_ms);
    }

    #[tokio::test]
    async fn cleanup_expired_removes_stale_entries_and_indexes() {
        let registry = ServiceRegistry::new(Duration::from_millis(10), Arc::new(NoopSink));
        registry
            .register(registration("api", &["env:prod"], &[]))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let removed = registry.cleanup_expired().await;
        assert_eq!(removed, 1);
        assert!(registry.get("api").await.is_none());
        assert!(registry.query_by_tags(&["env:prod".to_string()]).await.is_empty());
    }

    #[tokio::test]
    async fn health_check_effective_status_falls_back_to_critical_after_ttl() {
        let registry = ServiceRegistry::default();
        registry.register(registration("api", &[], &[])).await.unwrap();

        let check = CheckDefinition::new("c1", "liveness", Duration::from_secs(5), now_ms());
        registry.register_check("api", check).await.unwrap();
        registry
            .update_check_status("api", "c1", CheckStatus::Passing, "ok".to_string())
            .await
            .unwrap();

        let entry = registry.get("api").await.unwrap();
        let check = entry.checks.iter().find(|c| c.check_id == "c1").unwrap();
        assert_eq!(check.effective_status(now_ms()), CheckStatus::Passing);
        assert_eq!(check.effective_status(now_ms() + 10_000), CheckStatus::Critical);
    }

    #[tokio::test]
    async fn snapshot_round_trip_rebuilds_indexes() {
        let registry = ServiceRegistry::default();
        registry
            .register(registration("api", &["env:prod"], &[("team", "platform")]))
            .await
            .unwrap();

        let data = registry.get_all_data().await;
        let restored = ServiceRegistry::default();
        restored.restore_from_snapshot(data).await;

        assert_eq!(restored.curr_index().await, registry.curr_index().await);
        let found = restored.query_by_tags(&["env:prod".to_string()]).await;
        assert_eq!(found.len(), 1);
        let found = restored
            .query_by_metadata(&BTreeMap::from([("team".to_string(), "platform".to_string())]))
            .await;
        assert_eq!(found.len(), 1);
    }
}
