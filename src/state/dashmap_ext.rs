use dashmap::DashMap;
use std::borrow::Borrow;
use std::hash::Hash;

/// Guard-free access helpers for the sharded maps behind the registry,
/// the presence table and the tab coordinator.
///
/// Every `DashMap` accessor returns a guard that pins a shard lock. Holding
/// one across an `.await`, or while calling into an observer that touches the
/// same map, deadlocks. These helpers copy out or run a closure and release
/// the shard before returning.
pub trait DashMapExt<K, V> {
    /// Clone the value for `key`.
    fn get_cloned<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: Clone;

    /// Clone every `(key, value)` pair.
    fn iter_cloned(&self) -> Vec<(K, V)>
    where
        K: Clone,
        V: Clone;

    /// Run `f` on the value for `key` under the shard lock and return its
    /// result. `None` when the key is absent.
    fn with_mut<Q, R>(&self, key: &Q, f: impl FnOnce(&mut V) -> R) -> Option<R>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized;
}

impl<K, V> DashMapExt<K, V> for DashMap<K, V>
where
    K: Eq + Hash,
{
    fn get_cloned<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: Clone,
    {
        self.get(key).map(|r| r.value().clone())
    }

    fn iter_cloned(&self) -> Vec<(K, V)>
    where
        K: Clone,
        V: Clone,
    {
        self.iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    fn with_mut<Q, R>(&self, key: &Q, f: impl FnOnce(&mut V) -> R) -> Option<R>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.get_mut(key).map(|mut r| f(r.value_mut()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_mut_releases_guard() {
        let map: DashMap<String, u32> = DashMap::new();
        map.insert("a".into(), 1);

        let r = map.with_mut("a", |v| {
            *v += 1;
            *v
        });
        assert_eq!(r, Some(2));
        // A second access on the same shard would deadlock if the guard leaked.
        assert_eq!(map.get_cloned("a"), Some(2));
        assert_eq!(map.with_mut("missing", |v| *v), None);
    }
}
