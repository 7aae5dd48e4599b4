//! The in-memory cache of parsed profiles.
//!
//! Parsed profiles are kept under the checksum the client supplied for them. Entries leave the
//! cache in two ways:
//!
//! - **Decay**: every entry older than the configured decay window is dropped. This runs as
//!   housekeeping whenever a new entry is inserted while memory is fine.
//! - **Forced eviction**: when the resident memory of the whole process is above the configured
//!   ceiling at insert time, entries are dropped oldest first until it is not anymore.
//!
//! Reading an entry never refreshes it. A profile that is requested constantly is evicted just
//! like one that was never looked at again.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::config::CacheConfig;
use crate::memory::MemoryProbe;


#[derive(Debug)]
struct CacheEntry<T> {
    value: Arc<T>,
    inserted_at: Instant,
    /// Insertion order, breaks ties between entries inserted at the same instant.
    sequence: u64,
}

#[derive(Debug)]
struct Entries<T> {
    map: HashMap<String, CacheEntry<T>>,
    next_sequence: u64,
}

/// A checksum-keyed cache that is bounded by process memory and entry age.
///
/// All operations take a single lock, so inserts, lookups and eviction passes are mutually
/// exclusive.
#[derive(Debug)]
pub struct EvictingCache<T> {
    max_memory: u64,
    decay_window: Duration,
    probe: Arc<dyn MemoryProbe>,
    entries: Mutex<Entries<T>>,
}

impl<T> EvictingCache<T> {
    pub fn new(config: CacheConfig, probe: Arc<dyn MemoryProbe>) -> Self {
        Self {
            max_memory: config.max_memory,
            decay_window: config.decay_window,
            probe,
            entries: Mutex::new(Entries {
                map: HashMap::new(),
                next_sequence: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Entries<T>> {
        // The map stays consistent even if a holder panicked, none of the critical sections
        // leave it half-updated.
        self.entries.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    /// Looks up the profile stored under `key`.
    ///
    /// This does not affect when the entry is evicted.
    pub fn get(&self, key: &str) -> Option<Arc<T>> {
        self.lock().map.get(key).map(|entry| Arc::clone(&entry.value))
    }

    /// Stores `value` under `key`, replacing any previous entry.
    ///
    /// If the process is above its memory ceiling, the oldest entries are evicted first. When that
    /// does not bring memory back under the ceiling, the value is not stored and `false` is
    /// returned. Otherwise decayed entries are cleaned up before inserting.
    pub fn put(&self, key: String, value: Arc<T>) -> bool {
        self.put_at(key, value, Instant::now())
    }

    fn put_at(&self, key: String, value: Arc<T>, now: Instant) -> bool {
        let mut entries = self.lock();

        if self.probe.current_usage() > self.max_memory {
            self.evict_oldest(&mut entries);

            let usage = self.probe.current_usage();
            if usage > self.max_memory {
                tracing::warn!(
                    checksum = %key,
                    usage,
                    max_memory = self.max_memory,
                    "Not caching profile, memory usage is still above the limit"
                );
                metric!(counter("caches.declined") += 1);
                metric!(gauge("caches.entries") = entries.map.len() as u64);
                return false;
            }
        } else {
            self.expire(&mut entries, now);
        }

        let sequence = entries.next_sequence;
        entries.next_sequence += 1;
        entries.map.insert(
            key,
            CacheEntry {
                value,
                inserted_at: now,
                sequence,
            },
        );
        metric!(gauge("caches.entries") = entries.map.len() as u64);

        true
    }

    /// Runs an eviction pass and returns the number of removed entries.
    ///
    /// With `force`, entries are removed oldest first for as long as the process is above its
    /// memory ceiling. Without it, all entries older than the decay window are removed.
    pub fn decay(&self, force: bool) -> usize {
        self.decay_at(force, Instant::now())
    }

    fn decay_at(&self, force: bool, now: Instant) -> usize {
        let mut entries = self.lock();
        let removed = if force {
            self.evict_oldest(&mut entries)
        } else {
            self.expire(&mut entries, now)
        };
        metric!(gauge("caches.entries") = entries.map.len() as u64);
        removed
    }

    /// Removes all entries that were inserted more than `decay_window` before `now`.
    fn expire(&self, entries: &mut Entries<T>, now: Instant) -> usize {
        let before = entries.map.len();
        entries
            .map
            .retain(|_, entry| now.saturating_duration_since(entry.inserted_at) <= self.decay_window);

        let removed = before - entries.map.len();
        if removed > 0 {
            tracing::debug!(removed, "Decayed cached profiles");
            metric!(counter("caches.evicted") += removed as i64, "mode" => "decay");
        }
        removed
    }

    /// Removes entries oldest first until memory usage is at or below the ceiling.
    ///
    /// After each removal the probe is asked to [reclaim](MemoryProbe::reclaim) freed memory, so
    /// the next measurement reflects the dropped profile. Profiles that are still shared with a
    /// running request only free their memory once that request is done.
    fn evict_oldest(&self, entries: &mut Entries<T>) -> usize {
        let mut ordered: Vec<_> = entries
            .map
            .iter()
            .map(|(key, entry)| (entry.inserted_at, entry.sequence, key.clone()))
            .collect();
        ordered.sort_unstable();

        let mut removed = 0;
        for (_, _, key) in ordered {
            if self.probe.current_usage() <= self.max_memory {
                break;
            }
            drop(entries.map.remove(&key));
            self.probe.reclaim();
            removed += 1;
        }

        tracing::debug!(removed, "Evicted cached profiles under memory pressure");
        metric!(counter("caches.evicted") += removed as i64, "mode" => "forced");
        removed
    }

    /// Returns the number of cached profiles.
    pub fn len(&self) -> usize {
        self.lock().map.len()
    }

    /// Returns `true` if no profiles are cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
