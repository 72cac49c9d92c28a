//! Reference counter
//!
//! Bipartite map between `namespace/resource` keys of configmaps or secrets
//! and the `namespace/pod` keys of the pods that reference them.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct Refs {
    by_resource: HashMap<String, HashSet<String>>,
    by_pod: HashMap<String, HashSet<String>>,
}

impl Refs {
    fn unlink(&mut self, resource: &str, pod: &str) {
        if let Some(pods) = self.by_resource.get_mut(resource) {
            pods.remove(pod);
            if pods.is_empty() {
                self.by_resource.remove(resource);
            }
        }
    }
}

#[derive(Default)]
pub struct RefCounter {
    inner: Mutex<Refs>,
}

impl RefCounter {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Refs> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record that `pod` references `resource`
    pub fn add(&self, resource: &str, pod: &str) {
        let mut refs = self.lock();
        refs.by_resource
            .entry(resource.to_string())
            .or_default()
            .insert(pod.to_string());
        refs.by_pod
            .entry(pod.to_string())
            .or_default()
            .insert(resource.to_string());
    }

    /// Make `resources` the exact set referenced by `pod`
    pub fn set_pod_refs<I>(&self, pod: &str, resources: I)
    where
        I: IntoIterator<Item = String>,
    {
        let wanted: HashSet<String> = resources.into_iter().collect();
        let mut refs = self.lock();
        let current = refs.by_pod.remove(pod).unwrap_or_default();
        for stale in current.difference(&wanted) {
            refs.unlink(stale, pod);
        }
        for resource in &wanted {
            refs.by_resource
                .entry(resource.clone())
                .or_default()
                .insert(pod.to_string());
        }
        if !wanted.is_empty() {
            refs.by_pod.insert(pod.to_string(), wanted);
        }
    }

    /// Drop every entry for `pod`
    pub fn remove_pod(&self, pod: &str) {
        let mut refs = self.lock();
        if let Some(resources) = refs.by_pod.remove(pod) {
            for resource in resources {
                refs.unlink(&resource, pod);
            }
        }
    }

    /// Sorted pod keys referencing `resource`
    pub fn referrers(&self, resource: &str) -> Vec<String> {
        self.lock()
            .by_resource
            .get(resource)
            .map(|pods| pods.iter().cloned().collect::<BTreeSet<_>>().into_iter().collect())
            .unwrap_or_default()
    }

    pub fn has_referrers(&self, resource: &str) -> bool {
        self.lock().by_resource.contains_key(resource)
    }

    pub fn is_empty(&self) -> bool {
        self.lock().by_resource.is_empty()
    }

    pub fn len(&self) -> usize {
        self.lock().by_resource.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pod_entries_are_removed_together() {
        let rc = RefCounter::new();
        rc.add("default/cfg", "default/app");
        rc.add("default/cfg", "default/other");
        rc.add("default/extra", "default/app");
        rc.add("default/cfg", "default/app");

        assert_eq!(
            rc.referrers("default/cfg"),
            vec!["default/app".to_string(), "default/other".to_string()]
        );

        rc.remove_pod("default/app");
        assert_eq!(rc.referrers("default/cfg"), vec!["default/other".to_string()]);
        assert!(!rc.has_referrers("default/extra"));

        rc.remove_pod("default/other");
        assert!(rc.is_empty());
    }

    #[test]
    fn set_pod_refs_replaces_previous_set() {
        let rc = RefCounter::new();
        rc.set_pod_refs("default/app", ["default/a".to_string(), "default/b".to_string()]);
        rc.set_pod_refs("default/app", ["default/b".to_string()]);

        assert!(!rc.has_referrers("default/a"));
        assert_eq!(rc.referrers("default/b"), vec!["default/app".to_string()]);

        rc.set_pod_refs("default/app", Vec::new());
        assert!(rc.is_empty());
    }
}
