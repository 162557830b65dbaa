//! Validation rules for service registration.

use std::collections::BTreeSet;

use konsul_types::service::MAX_META_ENTRIES;
use konsul_types::service::MAX_META_KEY_LEN;
use konsul_types::service::MAX_META_VALUE_LEN;
use konsul_types::service::MAX_TAGS;
use konsul_types::service::MAX_TAG_LEN;
use konsul_types::service::RESERVED_META_PREFIXES;
use konsul_types::service::ServiceRegistration;
use konsul_types::KonsulError;
use once_cell::sync::Lazy;
use regex::Regex;

static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_:./-]+$").unwrap());
static META_KEY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").unwrap());

/// Runs full validation before any state change. On failure, the registry
/// performs no mutation at all.
pub fn validate_registration(reg: &ServiceRegistration) -> Result<(), KonsulError> {
    if reg.name.is_empty() {
        return Err(KonsulError::validation("service name must not be empty"));
    }
    if reg.address.is_empty() {
        return Err(KonsulError::validation("service address must not be empty"));
    }
    if reg.port == 0 {
        return Err(KonsulError::validation("port must be between 1 and 65535"));
    }

    if reg.tags.len() > MAX_TAGS {
        return Err(KonsulError::validation(format!(
            "service {} has {} tags, max is {}",
            reg.name,
            reg.tags.len(),
            MAX_TAGS
        )));
    }

    let mut seen = BTreeSet::new();
    for tag in &reg.tags {
        if tag.len() > MAX_TAG_LEN {
            return Err(KonsulError::validation(format!("tag '{tag}' exceeds {MAX_TAG_LEN} chars")));
        }
        if !TAG_RE.is_match(tag) {
            return Err(KonsulError::validation(format!("tag '{tag}' has invalid characters")));
        }
        if !seen.insert(tag.as_str()) {
            return Err(KonsulError::validation(format!("duplicate tag '{tag}'")));
        }
    }

    if reg.meta.len() > MAX_META_ENTRIES {
        return Err(KonsulError::validation(format!(
            "service {} has {} meta entries, max is {}",
            reg.name,
            reg.meta.len(),
            MAX_META_ENTRIES
        )));
    }

    for (key, value) in &reg.meta {
        if key.len() > MAX_META_KEY_LEN {
            return Err(KonsulError::validation(format!("meta key '{key}' exceeds {MAX_META_KEY_LEN} chars")));
        }
        if !META_KEY_RE.is_match(key) {
            return Err(KonsulError::validation(format!("meta key '{key}' has invalid characters")));
        }
        if RESERVED_META_PREFIXES.iter().any(|p| key.starts_with(p)) {
            return Err(KonsulError::validation(format!("meta key '{key}' uses a reserved prefix")));
        }
        if value.len() > MAX_META_VALUE_LEN {
            return Err(KonsulError::validation(format!(
                "meta value for '{key}' exceeds {MAX_META_VALUE_LEN} chars"
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn base() -> ServiceRegistration {
        ServiceRegistration {
            name: "api".to_string(),
            address: "10.0.0.1".to_string(),
            port: 8080,
            tags: vec!["env:prod".to_string(), "http".to_string()],
            meta: BTreeMap::from([("team".to_string(), "platform".to_string())]),
        }
    }

    #[test]
    fn accepts_a_well_formed_registration() {
        assert!(validate_registration(&base()).is_ok());
    }

    #[test]
    fn rejects_out_of_range_port() {
        let mut reg = base();
        reg.port = 0;
        assert!(validate_registration(&reg).is_err());
    }

    #[test]
    fn rejects_duplicate_tags() {
        let mut reg = base();
        reg.tags.push("env:prod".to_string());
        assert!(validate_registration(&reg).is_err());
    }

    #[test]
    fn rejects_invalid_tag_characters() {
        let mut reg = base();
        reg.tags.push("bad tag!".to_string());
        assert!(validate_registration(&reg).is_err());
    }

    #[test]
    fn rejects_reserved_meta_prefix() {
        let mut reg = base();
        reg.meta.insert("konsul_internal".to_string(), "x".to_string());
        assert!(validate_registration(&reg).is_err());
    }

    #[test]
    fn rejects_underscore_prefixed_meta_key() {
        let mut reg = base();
        reg.meta.insert("_hidden".to_string(), "x".to_string());
        assert!(validate_registration(&reg).is_err());
    }
}
