//! list+watch informer feeding an [`ObjectCache`]
//!
//! The informer is the single writer of its cache. Every accepted change is
//! fanned out to the registered handlers on the informer task, so handlers
//! must only enqueue work and return.

use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::{Arc, Mutex, RwLock};

use futures::StreamExt;
use kube::runtime::watcher::{self, watcher, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Resource};
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::cache::{key_of, ObjectCache};

/// Callbacks invoked for cache changes
pub trait EventHandler<K>: Send + Sync {
    fn on_add(&self, _obj: &K) {}
    fn on_update(&self, _old: &K, _new: &K) {}
    fn on_delete(&self, _obj: &K) {}
}

pub struct Informer<K> {
    kind: &'static str,
    cache: Arc<ObjectCache<K>>,
    handlers: RwLock<Vec<Arc<dyn EventHandler<K>>>>,
    relist: Mutex<Option<HashSet<String>>>,
    synced: watch::Sender<bool>,
}

impl<K> Informer<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    pub fn new(kind: &'static str) -> Self {
        let (synced, _) = watch::channel(false);
        Self {
            kind,
            cache: Arc::new(ObjectCache::new()),
            handlers: RwLock::new(Vec::new()),
            relist: Mutex::new(None),
            synced,
        }
    }

    pub fn cache(&self) -> &Arc<ObjectCache<K>> {
        &self.cache
    }

    pub fn add_handler(&self, handler: Arc<dyn EventHandler<K>>) {
        self.handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(handler);
    }

    fn handlers(&self) -> Vec<Arc<dyn EventHandler<K>>> {
        self.handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn has_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Resolves once the initial list has been applied
    pub async fn wait_synced(&self) {
        let mut rx = self.synced.subscribe();
        // The sender lives as long as self, so this only errs on drop.
        let _ = rx.wait_for(|synced| *synced).await;
    }

    /// Apply one watcher event to the cache and notify handlers
    pub fn apply(&self, event: Event<K>) {
        match event {
            Event::Init => {
                debug!(kind = self.kind, "Relist started");
                *self.relist.lock().unwrap_or_else(|p| p.into_inner()) = Some(HashSet::new());
            }
            Event::InitApply(obj) => {
                if let Some(seen) = self
                    .relist
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .as_mut()
                {
                    seen.insert(key_of(&obj));
                }
                self.store(obj);
            }
            Event::InitDone => {
                let seen = self
                    .relist
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .take();
                if let Some(seen) = seen {
                    for key in self.cache.keys() {
                        if !seen.contains(&key) {
                            if let Some(obj) = self.cache.remove_by_key(&key) {
                                self.dispatch_delete(&obj);
                            }
                        }
                    }
                }
                if !self.has_synced() {
                    info!(kind = self.kind, objects = self.cache.len(), "Cache synced");
                }
                self.synced.send_replace(true);
            }
            Event::Apply(obj) => self.store(obj),
            Event::Delete(obj) => {
                let key = key_of(&obj);
                if let Some(stored) = self.cache.remove_by_key(&key) {
                    self.dispatch_delete(&stored);
                }
            }
        }
    }

    fn store(&self, obj: K) {
        let key = key_of(&obj);
        let (outcome, previous) = self.cache.upsert(obj);
        if !outcome.changed() {
            debug!(kind = self.kind, key = %key, outcome = ?outcome, "Ignoring event");
            return;
        }
        let Some(current) = self.cache.get_by_key(&key) else {
            return;
        };
        let handlers = self.handlers();
        match previous {
            Some(old) => {
                for h in &handlers {
                    h.on_update(&old, &current);
                }
            }
            None => {
                for h in &handlers {
                    h.on_add(&current);
                }
            }
        }
    }

    fn dispatch_delete(&self, obj: &K) {
        for h in self.handlers() {
            h.on_delete(obj);
        }
    }
}

impl<K> Informer<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    /// Drive the informer from a watch on `api` until `token` is cancelled
    pub async fn run(self: Arc<Self>, api: Api<K>, config: watcher::Config, token: CancellationToken) {
        info!(kind = self.kind, "Starting informer");
        let mut stream = watcher(api, config).default_backoff().boxed();
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                event = stream.next() => match event {
                    Some(Ok(event)) => self.apply(event),
                    Some(Err(e)) => warn!(kind = self.kind, error = %e, "Watch error"),
                    None => break,
                },
            }
        }
        debug!(kind = self.kind, "Informer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::ObjectMeta;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct Recorder {
        seen: StdMutex<Vec<String>>,
    }

    impl EventHandler<ConfigMap> for Recorder {
        fn on_add(&self, obj: &ConfigMap) {
            self.seen.lock().unwrap().push(format!("add {}", key_of(obj)));
        }
        fn on_update(&self, _old: &ConfigMap, new: &ConfigMap) {
            self.seen.lock().unwrap().push(format!("update {}", key_of(new)));
        }
        fn on_delete(&self, obj: &ConfigMap) {
            self.seen.lock().unwrap().push(format!("delete {}", key_of(obj)));
        }
    }

    fn cm(name: &str, rv: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                namespace: Some("default".to_string()),
                name: Some(name.to_string()),
                resource_version: Some(rv.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn relist_prunes_missing_objects() {
        let informer = Informer::<ConfigMap>::new("ConfigMap");
        let recorder = Arc::new(Recorder::default());
        informer.add_handler(recorder.clone());

        informer.apply(Event::Apply(cm("a", "1")));
        informer.apply(Event::Apply(cm("b", "1")));
        assert!(!informer.has_synced());

        informer.apply(Event::Init);
        informer.apply(Event::InitApply(cm("a", "2")));
        informer.apply(Event::InitDone);

        assert!(informer.has_synced());
        assert_eq!(informer.cache().len(), 1);
        let seen = recorder.seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                "add default/a".to_string(),
                "add default/b".to_string(),
                "update default/a".to_string(),
                "delete default/b".to_string(),
            ]
        );
    }

    #[test]
    fn stale_updates_are_not_dispatched() {
        let informer = Informer::<ConfigMap>::new("ConfigMap");
        let recorder = Arc::new(Recorder::default());
        informer.add_handler(recorder.clone());

        informer.apply(Event::Apply(cm("a", "5")));
        informer.apply(Event::Apply(cm("a", "4")));
        informer.apply(Event::Apply(cm("a", "5")));

        assert_eq!(recorder.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn wait_synced_resolves_after_init_done() {
        let informer = Arc::new(Informer::<ConfigMap>::new("ConfigMap"));
        let waiter = {
            let informer = informer.clone();
            tokio::spawn(async move { informer.wait_synced().await })
        };
        informer.apply(Event::Init);
        informer.apply(Event::InitDone);
        waiter.await.unwrap();
    }
}
