//! Identifier-scoped exclusive locks for COMMUTATIVE parameters.
//!
//! Held for the full duration of the task body, across slots: two
//! commutative tasks on the same object never overlap in execution even on
//! different slots. CONCURRENT parameters deliberately bypass this table.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Default)]
pub struct CommutativeLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl CommutativeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the locks for all given identifiers, in sorted order so two
    /// tasks locking overlapping sets cannot deadlock.
    pub async fn lock_all(&self, identifiers: &[String]) -> Vec<OwnedMutexGuard<()>> {
        let mut ids: Vec<&String> = identifiers.iter().collect();
        ids.sort();
        ids.dedup();

        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            let lock = self
                .locks
                .entry(id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone();
            guards.push(lock.lock_owned().await);
        }
        guards
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn same_identifier_excludes() {
        let locks = Arc::new(CommutativeLocks::new());
        let in_section = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let locks = Arc::clone(&locks);
            let in_section = Arc::clone(&in_section);
            let max_seen = Arc::clone(&max_seen);
            handles.push(tokio::spawn(async move {
                let _guards = locks.lock_all(&["acc".to_string()]).await;
                let now = in_section.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                in_section.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn overlapping_sets_do_not_deadlock() {
        let locks = Arc::new(CommutativeLocks::new());

        let l1 = Arc::clone(&locks);
        let a = tokio::spawn(async move {
            for _ in 0..50 {
                let _g = l1.lock_all(&["a".to_string(), "b".to_string()]).await;
            }
        });
        let l2 = Arc::clone(&locks);
        let b = tokio::spawn(async move {
            for _ in 0..50 {
                let _g = l2.lock_all(&["b".to_string(), "a".to_string()]).await;
            }
        });

        tokio::time::timeout(Duration::from_secs(5), async {
            a.await.unwrap();
            b.await.unwrap();
        })
        .await
        .expect("lock ordering must prevent deadlock");
    }

    #[tokio::test]
    async fn duplicate_identifiers_lock_once() {
        let locks = CommutativeLocks::new();
        let guards = locks
            .lock_all(&["x".to_string(), "x".to_string()])
            .await;
        assert_eq!(guards.len(), 1);
    }
}
