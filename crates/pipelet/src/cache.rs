//! Process-wide cache of deserialized objects, shared by all executor slots.
//!
//! Keyed by backing-store identifier (stable across tasks). At most one live
//! entry per identifier. Entries with a nonzero pin count are never evicted.
//! Every mutation path goes through one internal lock; no user code runs
//! while it is held, so hold time stays bounded.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::{FatalError, SerializationError};

struct CacheEntry {
    value: Arc<serde_json::Value>,
    size: u64,
    /// Monotonic access counter; smallest = least recently used.
    last_access: u64,
    /// Tasks currently holding this object.
    pins: u32,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    used: u64,
    tick: u64,
}

impl CacheInner {
    fn touch(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Remove least-recently-used unpinned entries until under budget.
    ///
    /// The budget is advisory: when everything left is pinned, nothing is
    /// evicted even if still over budget.
    fn evict_to(&mut self, budget: u64) {
        while self.used > budget {
            let victim = self
                .entries
                .iter()
                .filter(|(_, e)| e.pins == 0)
                .min_by_key(|(_, e)| e.last_access)
                .map(|(id, _)| id.clone());

            let Some(id) = victim else { break };
            if let Some(entry) = self.entries.remove(&id) {
                self.used -= entry.size;
                tracing::debug!(id = %id, size = entry.size, "Evicted cache entry");
            }
        }
    }
}

pub struct ObjectCache {
    inner: Mutex<CacheInner>,
    budget: u64,
}

impl ObjectCache {
    pub fn new(budget: u64) -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
            budget,
        }
    }

    /// Return the cached handle, loading via `loader` on a miss.
    ///
    /// The returned handle is pinned; callers must pair this with
    /// [`release`](Self::release) (or [`invalidate`](Self::invalidate) after
    /// a write-back). The loader runs outside the cache lock and is invoked
    /// at most once per miss.
    pub async fn get_or_load<F, Fut>(
        &self,
        id: &str,
        loader: F,
    ) -> Result<Arc<serde_json::Value>, SerializationError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(serde_json::Value, u64), SerializationError>>,
    {
        if let Some(hit) = self.lookup_pinned(id) {
            tracing::trace!(id, "Cache hit");
            return Ok(hit);
        }

        tracing::trace!(id, "Cache miss, loading");
        let (value, size) = loader().await?;

        let mut inner = self.lock();
        let tick = inner.touch();
        // Another slot may have loaded the same identifier while we were
        // reading the store; its entry wins to keep one live entry per id.
        if let Some(entry) = inner.entries.get_mut(id) {
            entry.pins += 1;
            entry.last_access = tick;
            return Ok(Arc::clone(&entry.value));
        }

        let handle = Arc::new(value);
        inner.entries.insert(
            id.to_string(),
            CacheEntry {
                value: Arc::clone(&handle),
                size,
                last_access: tick,
                pins: 1,
            },
        );
        inner.used += size;
        inner.evict_to(self.budget);
        Ok(handle)
    }

    /// Insert or replace an entry, pinned for the calling task.
    pub fn put(&self, id: &str, value: serde_json::Value, size: u64) -> Arc<serde_json::Value> {
        let handle = Arc::new(value);
        let mut inner = self.lock();
        if let Some(old) = inner.entries.remove(id) {
            inner.used -= old.size;
        }
        let tick = inner.touch();
        inner.entries.insert(
            id.to_string(),
            CacheEntry {
                value: Arc::clone(&handle),
                size,
                last_access: tick,
                pins: 1,
            },
        );
        inner.used += size;
        inner.evict_to(self.budget);
        handle
    }

    /// Drop one pin after a task finishes with the object.
    ///
    /// Releasing an identifier that was invalidated meanwhile is a no-op;
    /// releasing an unpinned live entry is a cache invariant violation.
    pub fn release(&self, id: &str) -> Result<(), FatalError> {
        let mut inner = self.lock();
        match inner.entries.get_mut(id) {
            None => Ok(()),
            Some(entry) if entry.pins == 0 => Err(FatalError::PinUnderflow(id.to_string())),
            Some(entry) => {
                entry.pins -= 1;
                Ok(())
            }
        }
    }

    /// Remove the entry unconditionally, pinned or not. Used after REMOVE
    /// commands and after OUT/INOUT write-backs so no reader is served the
    /// stale value.
    pub fn invalidate(&self, id: &str) {
        let mut inner = self.lock();
        if let Some(entry) = inner.entries.remove(id) {
            inner.used -= entry.size;
            tracing::debug!(id, "Invalidated cache entry");
        }
    }

    /// Evict least-recently-used unpinned entries while over `budget`.
    pub fn evict_if_needed(&self, budget: u64) {
        self.lock().evict_to(budget);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn used_size(&self) -> u64 {
        self.lock().used
    }

    #[cfg(test)]
    fn pin_count(&self, id: &str) -> Option<u32> {
        self.lock().entries.get(id).map(|e| e.pins)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheInner> {
        // A poisoned cache lock means a panic mid-mutation; entries can no
        // longer be trusted.
        self.inner.lock().unwrap_or_else(|_| {
            panic!("object cache lock poisoned");
        })
    }

    /// Hit-path lookup: bump recency and pin.
    fn lookup_pinned(&self, id: &str) -> Option<Arc<serde_json::Value>> {
        let mut inner = self.lock();
        let tick = inner.touch();
        let entry = inner.entries.get_mut(id)?;
        entry.last_access = tick;
        entry.pins += 1;
        Some(Arc::clone(&entry.value))
    }
}
