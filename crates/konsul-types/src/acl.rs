//! ACL policy model: resources, capabilities, and policy documents.
//!
//! The evaluator dispatches on a tagged resource variant; each variant
//! carries the kind-specific path (empty for non-path kinds). Adding a new
//! resource kind means adding a variant and a handler arm, never an open
//! trait hierarchy.

use serde::Deserialize;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Read,
    Write,
    Delete,
    List,
    Deny,
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Capability::Read => "read",
            Capability::Write => "write",
            Capability::Delete => "delete",
            Capability::List => "list",
            Capability::Deny => "deny",
        };
        f.write_str(s)
    }
}

/// A single path-scoped rule: `kv` and `service` rules carry a path that
/// may end with `*` for a prefix match; a rule for any other resource kind
/// applies unconditionally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathRule {
    pub path: String,
    pub capabilities: Vec<Capability>,
}

/// A rule with no path, for `health`/`backup`/`admin` resources.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityRule {
    pub capabilities: Vec<Capability>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Policy {
    pub name: String,
    #[serde(default)]
    pub kv: Vec<PathRule>,
    #[serde(default)]
    pub service: Vec<PathRule>,
    #[serde(default)]
    pub health: Vec<CapabilityRule>,
    #[serde(default)]
    pub backup: Vec<CapabilityRule>,
    #[serde(default)]
    pub admin: Vec<CapabilityRule>,
}

impl Policy {
    /// A policy must name itself and carry at least one rule across all
    /// resource kinds.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("policy name must not be empty".to_string());
        }
        let rule_count =
            self.kv.len() + self.service.len() + self.health.len() + self.backup.len() + self.admin.len();
        if rule_count == 0 {
            return Err(format!("policy {} has no rules", self.name));
        }
        Ok(())
    }
}

/// The resource a capability is being evaluated against. `Kv`/`Service`
/// carry a path; the rest evaluate every rule in their list unconditionally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
    Kv(String),
    Service(String),
    Health,
    Backup,
    Admin,
}

impl Resource {
    pub fn kv(path: impl Into<String>) -> Self {
        Resource::Kv(path.into())
    }

    pub fn service(path: impl Into<String>) -> Self {
        Resource::Service(path.into())
    }

    /// Label used for `acl_evaluations_total{resource,...}`.
    pub fn label(&self) -> &'static str {
        match self {
            Resource::Kv(_) => "kv",
            Resource::Service(_) => "service",
            Resource::Health => "health",
            Resource::Backup => "backup",
            Resource::Admin => "admin",
        }
    }
}

/// A rule matches a path iff it equals the path exactly, or ends with `*`
/// and is a prefix of the path.
pub fn path_rule_matches(rule_path: &str, path: &str) -> bool {
    if let Some(prefix) = rule_path.strip_suffix('*') {
        path.starts_with(prefix)
    } else {
        rule_path == path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_path_matches_only_itself() {
        assert!(path_rule_matches("app/config", "app/config"));
        assert!(!path_rule_matches("app/config", "app/config/db"));
    }

    #[test]
    fn prefix_path_matches_descendants() {
        assert!(path_rule_matches("app/*", "app/config"));
        assert!(path_rule_matches("app/*", "app/"));
        assert!(!path_rule_matches("app/*", "other/config"));
    }

    #[test]
    fn empty_policy_fails_validation() {
        let p = Policy {
            name: "empty".to_string(),
            ..Default::default()
        };
        assert!(p.validate().is_err());
    }

    #[test]
    fn unnamed_policy_fails_validation() {
        let p = Policy {
            kv: vec![PathRule {
                path: "*".to_string(),
                capabilities: vec![Capability::Read],
            }],
            ..Default::default()
        };
        assert!(p.validate().is_err());
    }
}
