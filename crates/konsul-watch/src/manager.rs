//! The watch manager.
//!
//! Subscriptions are indexed by their literal pattern string so `notify`
//! only has to test each *distinct pattern* against the changed key and
//! then fan out to the (usually small) set of watcher ids registered
//! under a matching pattern -- never the full watcher population.
//! Because `notify` is called synchronously
//! from the stores' mutation path through the `WatchNotifier` trait, the
//! manager's internal state lives behind a `std::sync::RwLock`, and sends
//! onto a subscriber's queue are always non-blocking `try_send`.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::RwLock;

use konsul_acl::AclEvaluator;
use konsul_store_api::MetricsSink;
use konsul_store_api::NoopMetrics;
use konsul_store_api::WatchNotifier;
use konsul_types::acl::Capability;
use konsul_types::acl::Resource;
use konsul_types::now_ms;
use konsul_types::watch::WatchEvent;
use konsul_types::KonsulError;
use konsul_types::Result;
use log::debug;
use tokio::sync::mpsc;

use crate::pattern;

pub type WatcherId = u64;

/// The transport a watcher's event stream will be delivered over. Carried
/// only for metric labeling and caller bookkeeping -- the manager itself
/// is transport-agnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    StreamingSocket,
    ServerSentEvents,
}

impl Transport {
    pub fn label(&self) -> &'static str {
        match self {
            Transport::StreamingSocket => "streaming_socket",
            Transport::ServerSentEvents => "server_sent_events",
        }
    }
}

/// A live watch subscription, returned to the caller of `add_watcher`. The
/// caller reads `events` to stream matching, ACL-permitted events to its
/// transport of choice.
pub struct Watcher {
    pub id: WatcherId,
    pub pattern: String,
    pub acl_policies: Vec<String>,
    pub transport: Transport,
    pub user_id: Option<String>,
    pub created_at_ms: u64,
    pub events: mpsc::Receiver<WatchEvent>,
}

struct Subscription {
    pattern: String,
    acl_policies: Vec<String>,
    transport: Transport,
    user_id: Option<String>,
    sender: mpsc::Sender<WatchEvent>,
}

struct Inner {
    subscriptions: BTreeMap<WatcherId, Subscription>,
    by_pattern: BTreeMap<String, BTreeSet<WatcherId>>,
    per_user_count: BTreeMap<String, usize>,
    closed: bool,
}

pub struct WatchManager {
    inner: RwLock<Inner>,
    next_id: AtomicU64,
    buffer_size: usize,
    per_client_limit: usize,
    acl: Option<Arc<AclEvaluator>>,
    metrics: Arc<dyn MetricsSink>,
}

/// Default bounded-queue depth per watcher.
pub const DEFAULT_BUFFER_SIZE: usize = 16;

impl WatchManager {
    pub fn new(buffer_size: usize, per_client_limit: usize, acl: Option<Arc<AclEvaluator>>) -> Self {
        Self::with_metrics(buffer_size, per_client_limit, acl, Arc::new(NoopMetrics))
    }

    pub fn with_metrics(
        buffer_size: usize,
        per_client_limit: usize,
        acl: Option<Arc<AclEvaluator>>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        WatchManager {
            inner: RwLock::new(Inner {
                subscriptions: BTreeMap::new(),
                by_pattern: BTreeMap::new(),
                per_user_count: BTreeMap::new(),
                closed: false,
            }),
            next_id: AtomicU64::new(1),
            buffer_size: buffer_size.max(1),
            per_client_limit,
            acl,
            metrics,
        }
    }

    pub fn add_watcher(
        &self,
        pattern: String,
        acl_policies: Vec<String>,
        transport: Transport,
        user_id: Option<String>,
    ) -> Result<Watcher> {
        let mut inner = self.inner.write().expect("watch manager lock poisoned");
        if inner.closed {
            return Err(KonsulError::Shutdown);
        }

        if self.per_client_limit > 0 {
            if let Some(uid) = &user_id {
                let count = inner.per_user_count.get(uid).copied().unwrap_or(0);
                if count >= self.per_client_limit {
                    return Err(KonsulError::TooManyWatchers {
                        user_id: uid.clone(),
                        limit: self.per_client_limit,
                    });
                }
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.buffer_size);

        inner.by_pattern.entry(pattern.clone()).or_default().insert(id);
        if let Some(uid) = &user_id {
            *inner.per_user_count.entry(uid.clone()).or_insert(0) += 1;
        }
        inner.subscriptions.insert(
            id,
            Subscription {
                pattern: pattern.clone(),
                acl_policies: acl_policies.clone(),
                transport,
                user_id: user_id.clone(),
                sender,
            },
        );

        self.metrics.set_gauge("watchers_active", &[], inner.subscriptions.len() as i64);
        debug!("watch: added watcher {id} pattern={pattern} transport={}", transport.label());

        Ok(Watcher {
            id,
            pattern,
            acl_policies,
            transport,
            user_id,
            created_at_ms: now_ms(),
            events: receiver,
        })
    }

    /// Idempotent: removing an id that is already gone (or was never
    /// registered) is a no-op.
    pub fn remove_watcher(&self, id: WatcherId) {
        let mut inner = self.inner.write().expect("watch manager lock poisoned");
        let Some(sub) = inner.subscriptions.remove(&id) else {
            return;
        };

        if let Some(ids) = inner.by_pattern.get_mut(&sub.pattern) {
            ids.remove(&id);
            if ids.is_empty() {
                inner.by_pattern.remove(&sub.pattern);
            }
        }
        if let Some(uid) = &sub.user_id {
            if let Some(count) = inner.per_user_count.get_mut(uid) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    inner.per_user_count.remove(uid);
                }
            }
        }

        self.metrics.set_gauge("watchers_active", &[], inner.subscriptions.len() as i64);
        debug!("watch: removed watcher {id}");
    }

    /// Closes every subscriber's queue. Subsequent `add_watcher`/`notify`
    /// calls are no-ops.
    pub fn close(&self) {
        let mut inner = self.inner.write().expect("watch manager lock poisoned");
        inner.closed = true;
        inner.subscriptions.clear();
        inner.by_pattern.clear();
        inner.per_user_count.clear();
        self.metrics.set_gauge("watchers_active", &[], 0);
    }

    pub fn active_count(&self) -> usize {
        self.inner.read().expect("watch manager lock poisoned").subscriptions.len()
    }
}

impl WatchNotifier for WatchManager {
    /// Never blocks: ACL checks are plain in-memory lookups and queue sends
    /// are `try_send`, so a slow or stalled consumer can never stall the
    /// store's mutation path.
    fn notify(&self, event: WatchEvent) {
        let inner = self.inner.read().expect("watch manager lock poisoned");
        if inner.closed {
            return;
        }

        let key = event.key();
        self.metrics.incr_counter("watch_events_total", &[("type", event.type_label())]);

        for (pat, ids) in &inner.by_pattern {
            if !pattern::matches(pat, key) {
                continue;
            }

            for id in ids {
                let Some(sub) = inner.subscriptions.get(id) else {
                    continue;
                };

                if let Some(acl) = &self.acl {
                    let allowed = acl.evaluate(&sub.acl_policies, &Resource::kv(key), Capability::Read);
                    if !allowed {
                        continue;
                    }
                }

                match sub.sender.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        self.metrics.incr_counter("watch_events_dropped", &[("reason", "queue_full")]);
                        debug!("watch: dropped event for watcher {id}, queue full");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        self.metrics.incr_counter("watch_events_dropped", &[("reason", "closed")]);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use konsul_types::acl::PathRule;
    use konsul_types::Policy;

    use super::*;

    fn event(key: &str) -> WatchEvent {
        WatchEvent::Set {
            key: key.to_string(),
            value: "v".to_string(),
            old_value: None,
            timestamp_ms: 0,
        }
    }

    #[tokio::test]
    async fn exact_pattern_matches_only_its_key() {
        let manager = WatchManager::new(4, 0, None);
        let mut w = manager.add_watcher("app/config/db".to_string(), vec![], Transport::StreamingSocket, None).unwrap();

        manager.notify(event("app/config/other"));
        manager.notify(event("app/config/db"));

        let got = w.events.recv().await.unwrap();
        assert_eq!(got.key(), "app/config/db");
        assert!(w.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn double_star_suffix_matches_descendants() {
        let manager = WatchManager::new(4, 0, None);
        let mut w = manager.add_watcher("app/**".to_string(), vec![], Transport::ServerSentEvents, None).unwrap();

        manager.notify(event("app/config/db"));
        let got = w.events.recv().await.unwrap();
        assert_eq!(got.key(), "app/config/db");
    }

    #[tokio::test]
    async fn full_queue_drops_event_without_blocking() {
        let manager = WatchManager::new(1, 0, None);
        let mut w = manager.add_watcher("k".to_string(), vec![], Transport::StreamingSocket, None).unwrap();

        manager.notify(event("k"));
        manager.notify(event("k"));

        let first = w.events.recv().await.unwrap();
        assert_eq!(first.key(), "k");
        assert!(w.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn denied_event_is_not_delivered_but_permitted_one_is() {
        let acl = Arc::new(AclEvaluator::new());
        acl.add(Policy {
            name: "p".to_string(),
            kv: vec![
                PathRule { path: "app/config/*".to_string(), capabilities: vec![Capability::Read] },
                PathRule { path: "app/secrets/*".to_string(), capabilities: vec![Capability::Deny] },
            ],
            ..Default::default()
        })
        .unwrap();

        let manager = WatchManager::new(4, 0, Some(acl));
        let mut w = manager
            .add_watcher("app/**".to_string(), vec!["p".to_string()], Transport::StreamingSocket, None)
            .unwrap();

        manager.notify(event("app/secrets/token"));
        manager.notify(event("app/config/db"));

        let got = w.events.recv().await.unwrap();
        assert_eq!(got.key(), "app/config/db");
        assert!(w.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn per_client_quota_rejects_beyond_limit() {
        let manager = WatchManager::new(4, 1, None);
        manager
            .add_watcher("a".to_string(), vec![], Transport::StreamingSocket, Some("u1".to_string()))
            .unwrap();

        let err = manager
            .add_watcher("b".to_string(), vec![], Transport::StreamingSocket, Some("u1".to_string()))
            .unwrap_err();
        assert_eq!(err.kind(), konsul_types::ErrorKind::TooManyWatchers);
    }

    #[test]
    fn remove_watcher_is_idempotent() {
        let manager = WatchManager::new(4, 0, None);
        manager.remove_watcher(999);
    }

    #[tokio::test]
    async fn close_is_a_terminal_no_op_barrier() {
        let manager = WatchManager::new(4, 0, None);
        manager.add_watcher("a".to_string(), vec![], Transport::StreamingSocket, None).unwrap();
        manager.close();

        let err = manager
            .add_watcher("b".to_string(), vec![], Transport::StreamingSocket, None)
            .unwrap_err();
        assert_eq!(err.kind(), konsul_types::ErrorKind::Shutdown);
    }
}
