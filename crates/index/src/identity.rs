//! Identity registry: which engine currently serves a given index.
//!
//! Lazy decoders only carry a [`CacheIdentity`]; they find the engine to read
//! from here. The registry never keeps an engine alive. An entry disappears
//! when its engine is closed or dropped, and a stale entry is silently
//! replaced by the next engine that opens the same index.

use crate::engine::{Engine, Inner};
use crate::error::{ErrorKind, Result};
use crate::models::CacheIdentity;
use exn::OptionExt;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError, Weak};
use tracing::debug;

static GLOBAL: LazyLock<Arc<Registry>> = LazyLock::new(|| Arc::new(Registry::new()));

#[derive(Default)]
pub struct Registry {
    entries: Mutex<HashMap<CacheIdentity, Weak<Inner>>>,
}
impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry, used by engines that aren't given one.
    pub fn global() -> Arc<Self> {
        Arc::clone(&GLOBAL)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CacheIdentity, Weak<Inner>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn register(&self, identity: &CacheIdentity, engine: &Engine) -> Result<()> {
        let mut entries = self.lock();
        if entries.get(identity).is_some_and(|entry| entry.strong_count() > 0) {
            exn::bail!(ErrorKind::AlreadyOpen(identity.clone()));
        }
        debug!(%identity, "registering engine");
        entries.insert(identity.clone(), engine.downgrade().into_inner());
        Ok(())
    }

    /// The live engine serving `identity`.
    pub fn resolve(&self, identity: &CacheIdentity) -> Result<Engine> {
        self.lock()
            .get(identity)
            .and_then(Weak::upgrade)
            .map(Engine::from_inner)
            .ok_or_raise(|| ErrorKind::OwningCacheNotOpen(identity.clone()))
    }

    pub fn contains(&self, identity: &CacheIdentity) -> bool {
        self.lock().get(identity).is_some_and(|entry| entry.strong_count() > 0)
    }

    /// Forget `identity` if its entry points at `engine` or is already dead.
    pub(crate) fn release(&self, identity: &CacheIdentity, engine: *const Inner) {
        let mut entries = self.lock();
        if entries
            .get(identity)
            .is_some_and(|entry| std::ptr::eq(entry.as_ptr(), engine) || entry.strong_count() == 0)
        {
            debug!(%identity, "releasing engine");
            entries.remove(identity);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineOptions;

    #[tokio::test]
    async fn test_resolve_live_engine() {
        let registry = Arc::new(Registry::new());
        let engine = EngineOptions::new().registry(Arc::clone(&registry)).open_in_memory().await.unwrap();
        let resolved = registry.resolve(engine.identity()).unwrap();
        assert!(resolved.ptr_eq(&engine));
    }

    #[tokio::test]
    async fn test_drop_removes_entry() {
        let registry = Arc::new(Registry::new());
        let engine = EngineOptions::new().registry(Arc::clone(&registry)).open_in_memory().await.unwrap();
        let identity = engine.identity().clone();
        assert!(registry.contains(&identity));
        drop(engine);
        assert!(!registry.contains(&identity));
        let err = registry.resolve(&identity).err().unwrap();
        assert!(matches!(&*err, ErrorKind::OwningCacheNotOpen(_)));
    }

    #[tokio::test]
    async fn test_close_removes_entry_while_clones_live() {
        let registry = Arc::new(Registry::new());
        let engine = EngineOptions::new().registry(Arc::clone(&registry)).open_in_memory().await.unwrap();
        let identity = engine.identity().clone();
        let handle = engine.clone();
        engine.close().await;
        assert!(!registry.contains(&identity));
        drop(handle);
    }

    #[tokio::test]
    async fn test_second_live_engine_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.db");
        let registry = Arc::new(Registry::new());
        let options = EngineOptions::new().registry(Arc::clone(&registry));
        let first = options.clone().open(&path).await.unwrap();
        let err = options.clone().open(&path).await.err().unwrap();
        assert!(matches!(&*err, ErrorKind::AlreadyOpen(identity) if identity == first.identity()));
        // The failed open must not have evicted the live entry.
        assert!(registry.resolve(first.identity()).unwrap().ptr_eq(&first));

        first.close().await;
        let second = options.open(&path).await.unwrap();
        assert!(registry.resolve(second.identity()).unwrap().ptr_eq(&second));
    }

    #[tokio::test]
    async fn test_registries_are_independent() {
        let a = Arc::new(Registry::new());
        let b = Arc::new(Registry::new());
        let engine = EngineOptions::new().registry(Arc::clone(&a)).open_in_memory().await.unwrap();
        assert!(a.contains(engine.identity()));
        assert!(!b.contains(engine.identity()));
    }
}
