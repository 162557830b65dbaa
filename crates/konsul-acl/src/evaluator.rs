//! Policy storage and the explicit-deny-wins evaluation algorithm.
//!
//! `Evaluate` is called from the watch fan-out's `Notify` path, which
//! must never block on an async runtime. The evaluator is
//! therefore a plain synchronous structure behind a `std::sync::RwLock`
//! rather than an async one: policy reads and writes are both small,
//! in-memory, lock-only operations with no I/O.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::RwLock;
use std::time::Instant;

use konsul_store_api::MetricsSink;
use konsul_store_api::NoopMetrics;
use konsul_types::acl::path_rule_matches;
use konsul_types::acl::Capability;
use konsul_types::acl::Resource;
use konsul_types::KonsulError;
use konsul_types::Policy;
use konsul_types::Result;
use log::debug;
use log::warn;

/// Policies are serialized behind a single lock: writes are infrequent and
/// small, so a plain read/write lock keeps `evaluate` (the hot path) free
/// of write contention without any extra bookkeeping.
pub struct AclEvaluator {
    policies: RwLock<BTreeMap<String, Policy>>,
    metrics: Arc<dyn MetricsSink>,
}

impl Default for AclEvaluator {
    fn default() -> Self {
        AclEvaluator {
            policies: RwLock::new(BTreeMap::new()),
            metrics: Arc::new(NoopMetrics),
        }
    }
}

impl AclEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_metrics(metrics: Arc<dyn MetricsSink>) -> Self {
        AclEvaluator {
            policies: RwLock::new(BTreeMap::new()),
            metrics,
        }
    }

    /// Adds or replaces a named policy. Validates before mutating: a
    /// policy with no name or no rules is rejected and the store is left
    /// untouched.
    pub fn add(&self, policy: Policy) -> Result<()> {
        policy.validate().map_err(KonsulError::validation)?;
        let mut guard = self.policies.write().expect("acl policy lock poisoned");
        guard.insert(policy.name.clone(), policy);
        Ok(())
    }

    /// `Update` and `Add` share the same all-or-nothing validate-then-insert
    /// semantics; both are exposed for callers that want to express intent.
    pub fn update(&self, policy: Policy) -> Result<()> {
        self.add(policy)
    }

    pub fn delete(&self, name: &str) -> Result<()> {
        self.policies.write().expect("acl policy lock poisoned").remove(name);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Policy> {
        self.policies.read().expect("acl policy lock poisoned").get(name).cloned()
    }

    pub fn list(&self) -> Vec<Policy> {
        self.policies.read().expect("acl policy lock poisoned").values().cloned().collect()
    }

    /// Bulk-loads a full policy set, e.g. from a config file at startup.
    /// Each policy is validated independently; the first invalid one
    /// aborts the load with no partial state change.
    pub fn load(&self, policies: Vec<Policy>) -> Result<()> {
        for policy in &policies {
            policy.validate().map_err(KonsulError::validation)?;
        }
        let mut guard = self.policies.write().expect("acl policy lock poisoned");
        guard.clear();
        for policy in policies {
            guard.insert(policy.name.clone(), policy);
        }
        Ok(())
    }

    /// `Evaluate(policies, resource, capability)`:
    ///
    /// 1. An empty policy list denies.
    /// 2. Unknown policy names are logged and skipped, not treated as an
    ///    error -- a watcher or client referencing a since-deleted policy
    ///    should not panic the evaluation path.
    /// 3. Every matching rule across every named policy is collected.
    /// 4. An explicit `deny` in any matching rule wins immediately,
    ///    regardless of any `allow` rule elsewhere.
    /// 5. Otherwise, the requested capability must appear in some matching
    ///    rule, or the default is deny.
    pub fn evaluate(&self, policy_names: &[String], resource: &Resource, capability: Capability) -> bool {
        let start = Instant::now();
        let allowed = self.evaluate_inner(policy_names, resource, capability);

        let result_label = if allowed { "allow" } else { "deny" };
        let capability_label = capability.to_string();
        self.metrics.incr_counter(
            "acl_evaluations_total",
            &[("resource", resource.label()), ("capability", &capability_label), ("result", result_label)],
        );
        self.metrics
            .observe_histogram("acl_evaluation_duration", &[("resource", resource.label())], start.elapsed().as_secs_f64());

        allowed
    }

    fn evaluate_inner(&self, policy_names: &[String], resource: &Resource, capability: Capability) -> bool {
        if policy_names.is_empty() {
            return false;
        }

        let guard = self.policies.read().expect("acl policy lock poisoned");
        let mut allow = false;

        for name in policy_names {
            let Some(policy) = guard.get(name) else {
                debug!("acl: referenced policy '{name}' does not exist, skipping");
                continue;
            };

            match resource {
                Resource::Kv(path) => {
                    for rule in &policy.kv {
                        if !path_rule_matches(&rule.path, path) {
                            continue;
                        }
                        if rule.capabilities.contains(&Capability::Deny) {
                            return false;
                        }
                        if rule.capabilities.contains(&capability) {
                            allow = true;
                        }
                    }
                }
                Resource::Service(path) => {
                    for rule in &policy.service {
                        if !path_rule_matches(&rule.path, path) {
                            continue;
                        }
                        if rule.capabilities.contains(&Capability::Deny) {
                            return false;
                        }
                        if rule.capabilities.contains(&capability) {
                            allow = true;
                        }
                    }
                }
                Resource::Health => {
                    if policy.health.iter().any(|r| r.capabilities.contains(&Capability::Deny)) {
                        return false;
                    }
                    if policy.health.iter().any(|r| r.capabilities.contains(&capability)) {
                        allow = true;
                    }
                }
                Resource::Backup => {
                    if policy.backup.iter().any(|r| r.capabilities.contains(&Capability::Deny)) {
                        return false;
                    }
                    if policy.backup.iter().any(|r| r.capabilities.contains(&capability)) {
                        allow = true;
                    }
                }
                Resource::Admin => {
                    if policy.admin.iter().any(|r| r.capabilities.contains(&Capability::Deny)) {
                        return false;
                    }
                    if policy.admin.iter().any(|r| r.capabilities.contains(&capability)) {
                        allow = true;
                    }
                }
            }
        }

        if !allow {
            warn!(
                "acl: denied capability={capability} resource={} (no matching allow rule)",
                resource.label()
            );
        }
        allow
    }
}

#[cfg(test)]
mod tests {
    use konsul_types::acl::CapabilityRule;
    use konsul_types::acl::PathRule;

    use super::*;

    fn kv_policy(name: &str, path: &str, caps: &[Capability]) -> Policy {
        Policy {
            name: name.to_string(),
            kv: vec![PathRule {
                path: path.to_string(),
                capabilities: caps.to_vec(),
            }],
            ..Default::default()
        }
    }

    #[test]
    fn empty_policy_list_denies() {
        let acl = AclEvaluator::new();
        assert!(!acl.evaluate(&[], &Resource::kv("app/config"), Capability::Read));
    }

    #[test]
    fn allow_rule_grants_matching_capability() {
        let acl = AclEvaluator::new();
        acl.add(kv_policy("p1", "app/*", &[Capability::Read])).unwrap();

        assert!(acl.evaluate(&["p1".to_string()], &Resource::kv("app/config"), Capability::Read));
    }

    #[test]
    fn explicit_deny_wins_over_allow_in_another_policy() {
        let acl = AclEvaluator::new();
        acl.add(kv_policy("allow-all", "app/*", &[Capability::Read])).unwrap();
        acl.add(kv_policy("deny-secrets", "app/secrets/*", &[Capability::Deny])).unwrap();

        let names = vec!["allow-all".to_string(), "deny-secrets".to_string()];
        assert!(acl.evaluate(&names, &Resource::kv("app/config/db"), Capability::Read));
        assert!(!acl.evaluate(&names, &Resource::kv("app/secrets/token"), Capability::Read));
    }

    #[test]
    fn missing_policy_name_is_skipped_not_fatal() {
        let acl = AclEvaluator::new();
        assert!(!acl.evaluate(&["does-not-exist".to_string()], &Resource::kv("app/config"), Capability::Read));
    }

    #[test]
    fn non_path_resource_rules_apply_unconditionally() {
        let acl = AclEvaluator::new();
        let policy = Policy {
            name: "ops".to_string(),
            admin: vec![CapabilityRule {
                capabilities: vec![Capability::Read, Capability::Write],
            }],
            ..Default::default()
        };
        acl.add(policy).unwrap();

        assert!(acl.evaluate(&["ops".to_string()], &Resource::Admin, Capability::Write));
        assert!(!acl.evaluate(&["ops".to_string()], &Resource::Admin, Capability::Delete));
    }

    #[test]
    fn invalid_policy_is_rejected_without_mutating_state() {
        let acl = AclEvaluator::new();
        let bad = Policy {
            name: "empty".to_string(),
            ..Default::default()
        };
        assert!(acl.add(bad).is_err());
        assert!(acl.get("empty").is_none());
    }
}
