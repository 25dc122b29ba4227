//! Environment scoping between a job and its stages.
//!
//! Entries are `KEY=VALUE` strings. A stage entry without `=` names a job-level
//! variable to inherit; an entry with more than one `=` is malformed and dropped.

use std::collections::HashMap;

/// Job-level environment lookup, keyed by variable name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobEnv {
    entries: HashMap<String, String>,
}

impl JobEnv {
    /// Build the lookup from job-level entries.
    ///
    /// Entries that are not exactly one `KEY=VALUE` pair are discarded. A later
    /// entry for the same key replaces an earlier one.
    pub fn from_entries(entries: &[String]) -> Self {
        let entries = entries
            .iter()
            .filter_map(|entry| split_pair(entry).map(|(key, _)| (key.to_string(), entry.clone())))
            .collect();
        Self { entries }
    }

    /// Full `KEY=VALUE` entry for `key`, if declared at job level.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolve a stage's declarations into the list injected into its sandbox.
    ///
    /// Declaration order is preserved; dropped entries leave no gap.
    pub fn resolve(&self, stage_env: &[String]) -> Vec<String> {
        stage_env
            .iter()
            .filter_map(|entry| match entry.matches('=').count() {
                0 => self.get(entry).map(str::to_string),
                1 => Some(entry.clone()),
                _ => None,
            })
            .collect()
    }
}

/// Split `KEY=VALUE`, requiring exactly one `=`.
fn split_pair(entry: &str) -> Option<(&str, &str)> {
    let (key, value) = entry.split_once('=')?;
    if value.contains('=') {
        return None;
    }
    Some((key, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_resolves_bare_keys_and_passes_pairs() {
        let job = JobEnv::from_entries(&strings(&["A=1", "B=2", "bad"]));
        let resolved = job.resolve(&strings(&["A", "C=3", "noop="]));
        assert_eq!(resolved, strings(&["A=1", "C=3", "noop="]));
    }

    #[test]
    fn test_malformed_job_entries_are_discarded() {
        let job = JobEnv::from_entries(&strings(&["bad", "X=1=2", "OK=yes"]));
        assert_eq!(job.len(), 1);
        assert_eq!(job.get("OK"), Some("OK=yes"));
        assert!(job.get("bad").is_none());
        assert!(job.get("X").is_none());
    }

    #[test]
    fn test_unknown_bare_key_contributes_nothing() {
        let job = JobEnv::from_entries(&strings(&["A=1"]));
        assert!(job.resolve(&strings(&["MISSING"])).is_empty());
    }

    #[test]
    fn test_stage_entries_with_multiple_equals_dropped() {
        let job = JobEnv::default();
        let resolved = job.resolve(&strings(&["URL=a=b", "K=v", "Q==x"]));
        assert_eq!(resolved, strings(&["K=v"]));
    }

    #[test]
    fn test_order_is_stage_declaration_order() {
        let job = JobEnv::from_entries(&strings(&["A=1", "B=2"]));
        let resolved = job.resolve(&strings(&["B", "Z=9", "A"]));
        assert_eq!(resolved, strings(&["B=2", "Z=9", "A=1"]));
    }

    #[test]
    fn test_later_job_entry_wins() {
        let job = JobEnv::from_entries(&strings(&["A=1", "A=2"]));
        assert_eq!(job.resolve(&strings(&["A"])), strings(&["A=2"]));
    }

    #[test]
    fn test_empty_value_is_a_valid_pair() {
        let job = JobEnv::from_entries(&strings(&["EMPTY="]));
        assert_eq!(job.resolve(&strings(&["EMPTY"])), strings(&["EMPTY="]));
    }
}
