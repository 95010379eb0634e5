//! Keyed async mutual exclusion.
//!
//! [`KeyedLocks`] hands out one async mutex per string key. It serializes
//! CAS writes and releases per fingerprint and indexing attempts per file
//! id, while work on different keys proceeds in parallel. Entries are
//! removed when the last holder or waiter for a key goes away, so the table
//! does not grow with the number of keys ever seen.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type Table = HashMap<String, Arc<AsyncMutex<()>>>;

#[derive(Clone, Default)]
pub struct KeyedLocks {
    table: Arc<Mutex<Table>>,
}

/// Held lock for one key. Dropping it releases the key.
pub struct KeyGuard {
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
    table: Arc<Mutex<Table>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until `key` is free and take it.
    pub async fn lock(&self, key: &str) -> KeyGuard {
        let entry = {
            let mut table = lock_table(&self.table);
            table
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        let guard = entry.lock_owned().await;
        KeyGuard {
            key: key.to_string(),
            guard: Some(guard),
            table: self.table.clone(),
        }
    }

    /// Number of keys currently held or awaited.
    pub fn len(&self) -> usize {
        lock_table(&self.table).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        // Release before inspecting the count so waiters see the key free.
        self.guard.take();
        let mut table = lock_table(&self.table);
        if let Some(entry) = table.get(&self.key) {
            // Only the table's own reference left: no holder, no waiter.
            if Arc::strong_count(entry) == 1 {
                table.remove(&self.key);
            }
        }
    }
}

fn lock_table(table: &Mutex<Table>) -> MutexGuard<'_, Table> {
    table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
