//! Namespace-keyed object store with resource-version ordering
//!
//! Readers get `Arc` snapshots and never observe a partially applied write.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use kube::{Resource, ResourceExt};

use super::object_key;

/// Parse a resource version for ordering. Empty or non-numeric versions yield `None`.
pub fn parse_resource_version(rv: Option<&str>) -> Option<u64> {
    rv.and_then(|s| s.parse::<u64>().ok())
}

/// Order two parsed resource versions. `None` sorts below every numeric version.
pub fn compare_resource_versions(a: Option<u64>, b: Option<u64>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => Ordering::Equal,
    }
}

/// Outcome of [`ObjectCache::upsert`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Upsert {
    Added,
    Updated,
    /// Same resource version as the stored object
    Unchanged,
    /// Older than the stored object
    Stale,
}

impl Upsert {
    pub fn changed(&self) -> bool {
        matches!(self, Upsert::Added | Upsert::Updated)
    }
}

pub struct ObjectCache<K> {
    objects: RwLock<HashMap<String, Arc<K>>>,
}

impl<K> Default for ObjectCache<K> {
    fn default() -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
        }
    }
}

impl<K> ObjectCache<K>
where
    K: Resource + Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<K>>> {
        self.objects
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<K>>> {
        self.objects
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, namespace: &str, name: &str) -> Option<Arc<K>> {
        self.read().get(&object_key(namespace, name)).cloned()
    }

    pub fn get_by_key(&self, key: &str) -> Option<Arc<K>> {
        self.read().get(key).cloned()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.read().contains_key(key)
    }

    pub fn list(&self) -> Vec<Arc<K>> {
        self.read().values().cloned().collect()
    }

    pub fn list_namespace(&self, namespace: &str) -> Vec<Arc<K>> {
        self.read()
            .values()
            .filter(|obj| obj.namespace().as_deref().unwrap_or_default() == namespace)
            .cloned()
            .collect()
    }

    pub fn keys(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Store `obj` unless the stored copy is at least as new.
    /// Objects without a numeric resource version replace each other.
    pub fn upsert(&self, obj: K) -> (Upsert, Option<Arc<K>>) {
        let key = key_of(&obj);
        let incoming = parse_resource_version(obj.meta().resource_version.as_deref());
        let mut objects = self.write();

        let previous = objects.get(&key).cloned();
        let outcome = match &previous {
            None => Upsert::Added,
            Some(stored) => {
                let stored_rv = parse_resource_version(stored.meta().resource_version.as_deref());
                match compare_resource_versions(incoming, stored_rv) {
                    Ordering::Greater => Upsert::Updated,
                    Ordering::Equal if incoming.is_none() => Upsert::Updated,
                    Ordering::Equal => Upsert::Unchanged,
                    Ordering::Less => Upsert::Stale,
                }
            }
        };

        if outcome.changed() {
            objects.insert(key, Arc::new(obj));
        }
        (outcome, previous)
    }

    pub fn remove(&self, namespace: &str, name: &str) -> Option<Arc<K>> {
        self.write().remove(&object_key(namespace, name))
    }

    pub fn remove_by_key(&self, key: &str) -> Option<Arc<K>> {
        self.write().remove(key)
    }
}

/// `namespace/name` key of an object
pub fn key_of<K: Resource>(obj: &K) -> String {
    object_key(
        obj.meta().namespace.as_deref().unwrap_or_default(),
        obj.meta().name.as_deref().unwrap_or_default(),
    )
}
