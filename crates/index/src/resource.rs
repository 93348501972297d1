//! Bounded pool of expensive resources.
//!
//! A [`ResourceCache`] builds resources on demand through a generator, keeps
//! at most `capacity` idle ones alive, and hands them out as scoped
//! [`Checkout`]s. Eviction is least-recently-used over a logical clock and
//! only ever considers entries nobody has checked out; every resource is
//! passed to the finalizer exactly once, on eviction or when the last handle
//! to the cache goes away.

use crate::error::Result;
use std::collections::HashMap;
use std::hash::Hash;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

type Generator<K, R> = Box<dyn Fn(&K) -> Result<R> + Send + Sync>;
type Finalizer<R> = Box<dyn Fn(R) + Send + Sync>;

struct Entry<R> {
    resource: Arc<R>,
    tick: u64,
    checkouts: usize,
}

struct State<K, R> {
    capacity: usize,
    clock: u64,
    entries: HashMap<K, Entry<R>>,
}
impl<K: Eq + Hash + Clone, R> State<K, R> {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Remove least-recently-used idle entries until the pool fits its
    /// capacity, or nothing idle is left.
    fn evict(&mut self) -> Vec<Arc<R>> {
        let mut evicted = Vec::new();
        while self.entries.len() > self.capacity {
            let oldest = self
                .entries
                .iter()
                .filter(|(_, entry)| entry.checkouts == 0)
                .min_by_key(|(_, entry)| entry.tick)
                .map(|(key, _)| key.clone());
            let Some(key) = oldest else { break };
            if let Some(entry) = self.entries.remove(&key) {
                evicted.push(entry.resource);
            }
        }
        evicted
    }
}

struct Shared<K, R> {
    generator: Generator<K, R>,
    finalizer: Finalizer<R>,
    state: Mutex<State<K, R>>,
}
impl<K, R> Shared<K, R> {
    fn lock(&self) -> MutexGuard<'_, State<K, R>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Must be called without holding the state lock.
    fn finalize(&self, evicted: Vec<Arc<R>>) {
        if !evicted.is_empty() {
            debug!(count = evicted.len(), "finalizing evicted resources");
        }
        for resource in evicted {
            // Idle entries have no checkouts, so the pool holds the only reference.
            if let Ok(resource) = Arc::try_unwrap(resource) {
                (self.finalizer)(resource);
            }
        }
    }
}
impl<K, R> Drop for Shared<K, R> {
    fn drop(&mut self) {
        let entries = std::mem::take(&mut self.lock().entries);
        for (_, entry) in entries {
            if let Ok(resource) = Arc::try_unwrap(entry.resource) {
                (self.finalizer)(resource);
            }
        }
    }
}

/// Bounded, keyed, least-recently-used pool of resources.
///
/// Cloning the cache yields another handle to the same pool.
pub struct ResourceCache<K, R> {
    shared: Arc<Shared<K, R>>,
}
impl<K, R> Clone for ResourceCache<K, R> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}
impl<K, R> ResourceCache<K, R>
where
    K: Eq + Hash + Clone,
{
    pub fn new<G, F>(capacity: usize, generator: G, finalizer: F) -> Self
    where
        G: Fn(&K) -> Result<R> + Send + Sync + 'static,
        F: Fn(R) + Send + Sync + 'static,
    {
        Self {
            shared: Arc::new(Shared {
                generator: Box::new(generator),
                finalizer: Box::new(finalizer),
                state: Mutex::new(State {
                    capacity,
                    clock: 0,
                    entries: HashMap::new(),
                }),
            }),
        }
    }

    /// Check out the resource for `key`, generating it on a miss.
    ///
    /// The resource stays in the pool, and cannot be evicted, until the
    /// returned [`Checkout`] is dropped. Generator errors are returned as-is
    /// and nothing is cached for the key.
    pub fn get(&self, key: &K) -> Result<Checkout<K, R>> {
        {
            let mut state = self.shared.lock();
            let tick = state.tick();
            if let Some(entry) = state.entries.get_mut(key) {
                entry.tick = tick;
                entry.checkouts += 1;
                return Ok(self.checkout(key, Arc::clone(&entry.resource)));
            }
        }
        // Generate outside the lock: it is the expensive part.
        let generated = (self.shared.generator)(key)?;
        let mut state = self.shared.lock();
        let tick = state.tick();
        if let Some(entry) = state.entries.get_mut(key) {
            // Lost a race against another caller generating the same key.
            entry.tick = tick;
            entry.checkouts += 1;
            let resource = Arc::clone(&entry.resource);
            drop(state);
            (self.shared.finalizer)(generated);
            return Ok(self.checkout(key, resource));
        }
        let resource = Arc::new(generated);
        state.entries.insert(
            key.clone(),
            Entry {
                resource: Arc::clone(&resource),
                tick,
                checkouts: 1,
            },
        );
        let evicted = state.evict();
        drop(state);
        self.shared.finalize(evicted);
        Ok(self.checkout(key, resource))
    }

    fn checkout(&self, key: &K, resource: Arc<R>) -> Checkout<K, R> {
        Checkout {
            resource,
            _release: Release {
                shared: Arc::clone(&self.shared),
                key: key.clone(),
            },
        }
    }

    pub fn capacity(&self) -> usize {
        self.shared.lock().capacity
    }

    /// Change the capacity, evicting idle entries if the pool is now too big.
    pub fn set_capacity(&self, capacity: usize) {
        let mut state = self.shared.lock();
        state.capacity = capacity;
        let evicted = state.evict();
        drop(state);
        self.shared.finalize(evicted);
    }

    /// Number of live resources, checked out or idle.
    pub fn len(&self) -> usize {
        self.shared.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Finalize every idle resource.
    pub fn clear(&self) {
        let mut state = self.shared.lock();
        let idle: Vec<K> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.checkouts == 0)
            .map(|(key, _)| key.clone())
            .collect();
        let evicted = idle
            .iter()
            .filter_map(|key| state.entries.remove(key))
            .map(|entry| entry.resource)
            .collect();
        drop(state);
        self.shared.finalize(evicted);
    }
}

struct Release<K: Eq + Hash + Clone, R> {
    shared: Arc<Shared<K, R>>,
    key: K,
}
impl<K: Eq + Hash + Clone, R> Drop for Release<K, R> {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        if let Some(entry) = state.entries.get_mut(&self.key) {
            entry.checkouts = entry.checkouts.saturating_sub(1);
        }
        let evicted = state.evict();
        drop(state);
        self.shared.finalize(evicted);
    }
}

/// A resource checked out of a [`ResourceCache`].
pub struct Checkout<K: Eq + Hash + Clone, R> {
    resource: Arc<R>,
    // Fields drop in declaration order: the resource reference has to be gone
    // before the release can finalize it.
    _release: Release<K, R>,
}
impl<K: Eq + Hash + Clone, R> Deref for Checkout<K, R> {
    type Target = R;
    fn deref(&self) -> &R {
        &self.resource
    }
}
