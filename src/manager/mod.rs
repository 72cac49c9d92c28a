//! Informer-backed caches and the reference counter

pub mod cache;
pub mod informer;
pub mod refcount;
pub mod resources;

pub use informer::{EventHandler, Informer};
pub use refcount::RefCounter;
pub use resources::ResourceManager;

use crate::{Error, Result};

/// `namespace/name` key used by the caches and the work queues
pub fn object_key(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace, name)
}

/// Split a `namespace/name` key
pub fn split_key(key: &str) -> Result<(&str, &str)> {
    match key.split_once('/') {
        Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
            Ok((ns, name))
        }
        _ => Err(Error::InvalidArgument(format!("invalid resource key {:?}", key))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_split_into_namespace_and_name() {
        assert_eq!(split_key("default/web").unwrap(), ("default", "web"));
        assert!(split_key("web").is_err());
        assert!(split_key("/web").is_err());
        assert!(split_key("a/b/c").is_err());
    }
}
