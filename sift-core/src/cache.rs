use crate::error::Result;
use std::collections::HashMap;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Bounded TTL cache with single-flight fill-through.
///
/// `get_with` computes and inserts on miss under per-key exclusion: while one
/// caller runs the thunk, other callers for the same key block and receive
/// the filled value instead of computing their own. Expired entries are
/// purged on observation. Capacity 0 disables caching entirely.
pub struct Cache<V> {
    capacity: usize,
    inner: Mutex<Inner<V>>,
    filled: Condvar,
}

struct Inner<V> {
    entries: HashMap<String, Entry<V>>,
    in_flight: std::collections::HashSet<String>,
}

struct Entry<V> {
    value: V,
    expires: Instant,
}

impl<V: Clone> Cache<V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                in_flight: std::collections::HashSet::new(),
            }),
            filled: Condvar::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|i| i.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get_with<F>(&self, key: &str, ttl: Duration, thunk: F) -> Result<V>
    where
        F: FnOnce() -> Result<V>,
    {
        if self.capacity == 0 {
            return thunk();
        }

        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(_) => return thunk(),
        };
        loop {
            match inner.entries.get(key) {
                Some(entry) if entry.expires > Instant::now() => return Ok(entry.value.clone()),
                Some(_) => {
                    inner.entries.remove(key);
                }
                None => {}
            }
            if !inner.in_flight.contains(key) {
                break;
            }
            inner = match self.filled.wait(inner) {
                Ok(guard) => guard,
                Err(_) => return thunk(),
            };
        }

        inner.in_flight.insert(key.to_string());
        drop(inner);

        let result = thunk();

        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(_) => return result,
        };
        inner.in_flight.remove(key);
        if let Ok(value) = &result {
            if inner.entries.len() >= self.capacity {
                // Evict the entry closest to expiry.
                if let Some(victim) = inner
                    .entries
                    .iter()
                    .min_by_key(|(_, e)| e.expires)
                    .map(|(k, _)| k.clone())
                {
                    inner.entries.remove(&victim);
                }
            }
            inner.entries.insert(
                key.to_string(),
                Entry {
                    value: value.clone(),
                    expires: Instant::now() + ttl,
                },
            );
        }
        drop(inner);
        self.filled.notify_all();
        result
    }
}
