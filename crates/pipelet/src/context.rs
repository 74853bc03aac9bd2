//! Process-wide worker context.
//!
//! One value constructed at startup and passed into the pool and executors
//! explicitly, with explicit teardown when the pool stops. Nothing in this
//! crate reaches for module-level globals.

use std::sync::Arc;

use crate::cache::ObjectCache;
use crate::commutative::CommutativeLocks;
use crate::registry::TaskRegistry;
use crate::store::ObjectStore;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Advisory cache budget in bytes.
    pub cache_budget: u64,
    /// Emit per-task tracing spans even when the task doesn't ask for them.
    pub debug: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            cache_budget: 256 * 1024 * 1024,
            debug: false,
        }
    }
}

pub struct WorkerContext {
    registry: TaskRegistry,
    store: Arc<dyn ObjectStore>,
    cache: ObjectCache,
    commutative: CommutativeLocks,
    config: WorkerConfig,
}

impl WorkerContext {
    pub fn new(
        registry: TaskRegistry,
        store: Arc<dyn ObjectStore>,
        config: WorkerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            store,
            cache: ObjectCache::new(config.cache_budget),
            commutative: CommutativeLocks::new(),
            config,
        })
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn cache(&self) -> &ObjectCache {
        &self.cache
    }

    pub fn commutative(&self) -> &CommutativeLocks {
        &self.commutative
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }
}
