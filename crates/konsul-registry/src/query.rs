//! The deterministic query engine.
//!
//! These are pure functions over the secondary indexes so they can be unit
//! tested without the locking and liveness-filtering machinery in
//! `registry.rs`. `ServiceRegistry` is what actually applies liveness
//! filtering and returns entries in lexicographic order by name.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

pub struct QueryEngine;

impl QueryEngine {
    /// Names having ALL of `tags`. Empty input means "all known names"
    /// (the caller is responsible for liveness filtering).
    pub fn by_tags(
        tag_index: &BTreeMap<String, BTreeSet<String>>,
        tags: &[String],
        all_names: &BTreeSet<String>,
    ) -> BTreeSet<String> {
        if tags.is_empty() {
            return all_names.clone();
        }

        let mut result: Option<BTreeSet<String>> = None;
        for tag in tags {
            let bucket = tag_index.get(tag).cloned().unwrap_or_default();
            result = Some(match result {
                None => bucket,
                Some(acc) => acc.intersection(&bucket).cloned().collect(),
            });
            if result.as_ref().map(|s| s.is_empty()).unwrap_or(false) {
                break;
            }
        }
        result.unwrap_or_default()
    }

    /// Names matching ALL `(key, value)` filters. Empty input means "all
    /// known names".
    pub fn by_metadata(
        meta_index: &BTreeMap<String, BTreeMap<String, BTreeSet<String>>>,
        filters: &BTreeMap<String, String>,
        all_names: &BTreeSet<String>,
    ) -> BTreeSet<String> {
        if filters.is_empty() {
            return all_names.clone();
        }

        let mut result: Option<BTreeSet<String>> = None;
        for (key, value) in filters {
            let bucket = meta_index
                .get(key)
                .and_then(|by_value| by_value.get(value))
                .cloned()
                .unwrap_or_default();
            result = Some(match result {
                None => bucket,
                Some(acc) => acc.intersection(&bucket).cloned().collect(),
            });
            if result.as_ref().map(|s| s.is_empty()).unwrap_or(false) {
                break;
            }
        }
        result.unwrap_or_default()
    }

    /// `by_tags(tags) ∩ by_metadata(meta)`; degenerates to whichever input
    /// is non-empty when the other is empty.
    pub fn by_tags_and_metadata(
        tag_index: &BTreeMap<String, BTreeSet<String>>,
        meta_index: &BTreeMap<String, BTreeMap<String, BTreeSet<String>>>,
        tags: &[String],
        filters: &BTreeMap<String, String>,
        all_names: &BTreeSet<String>,
    ) -> BTreeSet<String> {
        let by_tags = Self::by_tags(tag_index, tags, all_names);
        let by_meta = Self::by_metadata(meta_index, filters, all_names);
        by_tags.intersection(&by_meta).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(ns: &[&str]) -> BTreeSet<String> {
        ns.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn empty_tags_return_all_names() {
        let idx = BTreeMap::new();
        let all = names(&["a", "b"]);
        assert_eq!(QueryEngine::by_tags(&idx, &[], &all), all);
    }

    #[test]
    fn by_tags_intersects_buckets() {
        let mut idx = BTreeMap::new();
        idx.insert("env:prod".to_string(), names(&["api", "web"]));
        idx.insert("http".to_string(), names(&["api"]));

        let all = names(&["api", "web"]);
        let got = QueryEngine::by_tags(&idx, &["env:prod".to_string(), "http".to_string()], &all);
        assert_eq!(got, names(&["api"]));
    }

    #[test]
    fn tags_and_metadata_is_the_and_of_both() {
        let mut tag_idx = BTreeMap::new();
        tag_idx.insert("env:prod".to_string(), names(&["api", "web"]));

        let mut meta_idx = BTreeMap::new();
        meta_idx.insert(
            "team".to_string(),
            BTreeMap::from([("platform".to_string(), names(&["api"]))]),
        );

        let all = names(&["api", "web"]);
        let filters = BTreeMap::from([("team".to_string(), "platform".to_string())]);

        let combined = QueryEngine::by_tags_and_metadata(
            &tag_idx,
            &meta_idx,
            &["env:prod".to_string()],
            &filters,
            &all,
        );
        let by_tags = QueryEngine::by_tags(&tag_idx, &["env:prod".to_string()], &all);
        let by_meta = QueryEngine::by_metadata(&meta_idx, &filters, &all);
        let expected: BTreeSet<String> = by_tags.intersection(&by_meta).cloned().collect();

        assert_eq!(combined, expected);
        assert_eq!(combined, names(&["api"]));
    }
}
