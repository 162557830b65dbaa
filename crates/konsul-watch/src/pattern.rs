//! The watch pattern grammar.
//!
//! Three shapes: a literal string matches only itself; `*` matches exactly
//! one `/`-delimited segment; a pattern ending in the literal suffix
//! `/**` matches the prefix before it and everything below that prefix,
//! including the prefix itself.

/// Whether `pattern` matches `key` under the watch grammar.
pub fn matches(pattern: &str, key: &str) -> bool {
    if let Some(prefix) = pattern.strip_suffix("/**") {
        return key == prefix || key.starts_with(&format!("{prefix}/"));
    }
    if pattern == "**" {
        return true;
    }

    let pattern_segs: Vec<&str> = pattern.split('/').collect();
    let key_segs: Vec<&str> = key.split('/').collect();
    if pattern_segs.len() != key_segs.len() {
        return false;
    }

    pattern_segs
        .iter()
        .zip(key_segs.iter())
        .all(|(p, k)| *p == "*" || p == k)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_pattern_matches_only_itself() {
        assert!(matches("app/config/db", "app/config/db"));
        assert!(!matches("app/config/db", "app/config/other"));
    }

    #[test]
    fn single_star_matches_one_segment() {
        assert!(matches("app/*", "app/config"));
        assert!(!matches("app/*", "app/config/db"));
        assert!(!matches("app/*", "other/config"));
    }

    #[test]
    fn double_star_suffix_matches_prefix_and_below() {
        assert!(matches("app/**", "app"));
        assert!(matches("app/**", "app/config"));
        assert!(matches("app/**", "app/config/db"));
        assert!(!matches("app/**", "apps/config"));
    }

    #[test]
    fn bare_double_star_matches_everything() {
        assert!(matches("**", "anything/at/all"));
    }
}
