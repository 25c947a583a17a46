use super::device::Artifact;
use crate::core::{DynoError, ProbeKey};
use log::{debug, trace};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Cached outcome of one candidate compile. `None` records a candidate that
/// is known not to produce an artifact (structurally invalid, or over the
/// device's resource budget); hitting it again skips the compile entirely.
pub type CacheEntry = Option<Arc<dyn Artifact>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub discards: u64,
}

/// Session-wide compile cache, shared by every tuning worker.
///
/// One mutex guards the map structure and nothing else. A miss compiles
/// outside the lock, then re-locks to publish: at-least-once compute,
/// at-most-one published. The loser of a same-key race discards its own
/// artifact after check-in and returns the published one.
pub struct CompileCache {
    entries: Mutex<HashMap<ProbeKey, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
    inserts: AtomicU64,
    discards: AtomicU64,
}

impl CompileCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            inserts: AtomicU64::new(0),
            discards: AtomicU64::new(0),
        }
    }

    /// Probe without compiling. Outer `None` means the key is absent; inner
    /// `None` is the cached no-artifact marker.
    pub fn lookup(&self, key: &ProbeKey) -> Result<Option<CacheEntry>, DynoError> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| DynoError::Poisoned("cache"))?;
        Ok(entries.get(key).cloned())
    }

    /// Fetch the entry for `key`, running `compile_fn` on a miss.
    ///
    /// `compile_fn` runs with no lock held, so unrelated probes keep flowing
    /// during a slow compile. `Ok(None)` from it is cached as the no-artifact
    /// marker; an `Err` propagates and leaves the key absent.
    pub fn compile_or_fetch<F>(&self, key: ProbeKey, compile_fn: F) -> Result<CacheEntry, DynoError>
    where
        F: FnOnce() -> Result<CacheEntry, DynoError>,
    {
        {
            let entries = self
                .entries
                .lock()
                .map_err(|_| DynoError::Poisoned("cache"))?;
            if let Some(entry) = entries.get(&key) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                trace!("[CompileCache] hit {}", key);
                return Ok(entry.clone());
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        debug!("[CompileCache] miss {}, compiling", key);

        let fresh = compile_fn()?;

        let mut entries = self
            .entries
            .lock()
            .map_err(|_| DynoError::Poisoned("cache"))?;
        match entries.entry(key) {
            Entry::Occupied(slot) => {
                // Another worker published while we compiled. Keep theirs.
                self.discards.fetch_add(1, Ordering::Relaxed);
                debug!("[CompileCache] lost publish race, discarding duplicate");
                Ok(slot.get().clone())
            }
            Entry::Vacant(slot) => {
                self.inserts.fetch_add(1, Ordering::Relaxed);
                Ok(slot.insert(fresh).clone())
            }
        }
    }

    /// Drop every entry. An in-flight compile that loses its key to this
    /// simply re-inserts against the empty map.
    pub fn clear(&self) -> Result<(), DynoError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| DynoError::Poisoned("cache"))?;
        let dropped = entries.len();
        entries.clear();
        debug!("[CompileCache] cleared {} entries", dropped);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            inserts: self.inserts.load(Ordering::Relaxed),
            discards: self.discards.load(Ordering::Relaxed),
        }
    }
}

impl Default for CompileCache {
    fn default() -> Self {
        Self::new()
    }
}
