/*!
A concurrent cache of shared handles.

Values are held weakly: the cache never keeps a value alive, it only hands
out the existing one while somebody else still owns it.
```
# use syclrt::cache::Cache;
let cache = Cache::<u32, String>::new();
let a = cache.get_or_register(1, || "one".to_string());
let b = cache.get_or_register(1, || unreachable!());
assert!(std::sync::Arc::ptr_eq(&a, &b));
drop((a, b));
assert!(cache.get(&1).is_none());
```
*/

use dashmap::{mapref::entry::Entry, DashMap};
use std::{
    fmt::{self, Debug},
    hash::Hash,
    sync::{Arc, Weak},
};

pub struct Cache<K, V> {
    map: DashMap<K, Weak<V>>,
}

impl<K: Eq + Hash, V> Cache<K, V> {
    pub fn new() -> Self {
        Self {
            map: DashMap::new(),
        }
    }
    /// The live value of `key`, if any.
    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        self.map.get(key)?.upgrade()
    }
    /** The live value of `key`, or a new one created by `create` and
    registered.

    `create` runs with the entry locked, so concurrent callers for the same
    key observe a single value. */
    pub fn get_or_register(&self, key: K, create: impl FnOnce() -> V) -> Arc<V> {
        self.try_get_or_register(key, || Ok::<_, std::convert::Infallible>(create()))
            .unwrap_or_else(|never| match never {})
    }
    /// Like [`.get_or_register()`](Self::get_or_register) with a fallible `create`.
    pub fn try_get_or_register<E>(
        &self,
        key: K,
        create: impl FnOnce() -> Result<V, E>,
    ) -> Result<Arc<V>, E> {
        match self.map.entry(key) {
            Entry::Occupied(mut entry) => {
                if let Some(value) = entry.get().upgrade() {
                    return Ok(value);
                }
                let value = Arc::new(create()?);
                entry.insert(Arc::downgrade(&value));
                Ok(value)
            }
            Entry::Vacant(entry) => {
                let value = Arc::new(create()?);
                entry.insert(Arc::downgrade(&value));
                Ok(value)
            }
        }
    }
    /// Forgets `key`, live values stay valid.
    pub fn remove(&self, key: &K) {
        self.map.remove(key);
    }
    /// Drops the entries of values which are gone.
    pub fn purge(&self) {
        self.map.retain(|_, value| value.strong_count() > 0);
    }
    /// Number of entries, including stale ones.
    pub fn len(&self) -> usize {
        self.map.len()
    }
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl<K: Eq + Hash, V> Default for Cache<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Debug, V> Debug for Cache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set()
            .entries(self.map.iter().map(|entry| {
                let key = entry.key();
                let live = entry.value().strong_count() > 0;
                format!("{key:?}: {}", if live { "live" } else { "stale" })
            }))
            .finish()
    }
}
