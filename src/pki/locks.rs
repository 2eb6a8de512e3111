use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

type LockMap = DashMap<String, Arc<Mutex<()>>>;

/// Named async locks, one per entity key such as `crl:7`.
///
/// Holding the guard serializes operations on that entity across tasks.
/// A key is forgotten once nobody holds or waits for it.
#[derive(Debug, Clone, Default)]
pub struct EntityLocks {
    locks: Arc<LockMap>,
}

/// Interest in one key. Dropping the last one removes the key.
struct Claim {
    key: String,
    locks: Arc<LockMap>,
    mutex: Arc<Mutex<()>>,
}

impl Drop for Claim {
    fn drop(&mut self) {
        // the map and this claim
        self.locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 2);
    }
}

/// Held lock on one entity.
pub struct EntityGuard {
    // released before the claim is dropped
    _guard: OwnedMutexGuard<()>,
    _claim: Claim,
}

impl EntityLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn claim(&self, key: String) -> Claim {
        let mutex = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        Claim {
            key,
            locks: self.locks.clone(),
            mutex,
        }
    }

    pub async fn lock(&self, key: impl Into<String>) -> EntityGuard {
        let claim = self.claim(key.into());
        let guard = claim.mutex.clone().lock_owned().await;
        EntityGuard {
            _guard: guard,
            _claim: claim,
        }
    }

    pub fn try_lock(&self, key: impl Into<String>) -> Option<EntityGuard> {
        let claim = self.claim(key.into());
        let guard = claim.mutex.clone().try_lock_owned().ok()?;
        Some(EntityGuard {
            _guard: guard,
            _claim: claim,
        })
    }

    /// Number of keys currently held or waited for.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
