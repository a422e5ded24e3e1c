// Copyright 2020 The Matrix.org Foundation C.I.C.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Locks keyed by the entity they protect.

use std::{collections::HashMap, hash::Hash, sync::Arc};

use tokio::sync::{Mutex, OwnedMutexGuard};

/// A set of async locks, one per key.
///
/// Holders of the same key are serialized, holders of different keys never
/// wait for each other. Locks nobody holds are dropped the next time the
/// map is touched.
#[derive(Debug)]
pub(crate) struct LockMap<K> {
    locks: Mutex<HashMap<K, Arc<Mutex<()>>>>,
}

impl<K> Default for LockMap<K> {
    fn default() -> Self {
        Self { locks: Mutex::new(HashMap::new()) }
    }
}

impl<K: Eq + Hash> LockMap<K> {
    /// Acquire the lock for the given key, waiting for the current holder to
    /// release it.
    pub(crate) async fn lock(&self, key: K) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(key).or_default().clone()
        };

        lock.lock_owned().await
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        self.locks.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use tokio::time::timeout;

    use super::LockMap;

    #[tokio::test]
    async fn same_key_is_exclusive() {
        let locks = Arc::new(LockMap::default());
        let guard = locks.lock("a").await;

        assert!(timeout(Duration::from_millis(20), locks.lock("a")).await.is_err());
        assert!(timeout(Duration::from_millis(20), locks.lock("b")).await.is_ok());

        drop(guard);
        assert!(timeout(Duration::from_millis(20), locks.lock("a")).await.is_ok());
    }

    #[tokio::test]
    async fn released_locks_are_pruned() {
        let locks = LockMap::default();

        drop(locks.lock(1).await);
        drop(locks.lock(2).await);
        let _guard = locks.lock(3).await;

        assert_eq!(locks.len().await, 1);
    }
}
