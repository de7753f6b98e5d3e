//! Bounded, time limited key/value cache.
//!
//! Entries may declare a size and a timeout. A cache with a finite capacity
//! requires every entry to declare its size and rejects any insert that would
//! push the total over capacity, leaving the cache untouched.
//!
//! Expiry is lazy: a read of an expired entry reports it as missing and, when
//! active scanning is enabled, schedules it for removal. Eviction is two-phase:
//! [`MemoryCache::scan_for_expired_items`] only marks entries under the read
//! lock, [`MemoryCache::remove_scheduled_entries`] takes the write lock once to
//! drop everything that was marked.

use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};

use crate::{Error, Result};

const STATE_ALIVE: u8 = 0;
const STATE_EXPIRED: u8 = 1;
const STATE_SCHEDULED: u8 = 2;

const SCAN_INTERVAL: Duration = Duration::from_secs(60);

pub trait Clock: Sync + Send {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline]
    fn now(&self) -> Instant {
        Instant::now()
    }
}

#[derive(Debug, Clone)]
pub struct MemoryCacheOptions {
    /// `None` means unbounded
    pub capacity: Option<usize>,
    pub default_timeout: Option<Duration>,
    pub active_scanning: bool,
}

impl Default for MemoryCacheOptions {
    fn default() -> Self {
        Self { capacity: None, default_timeout: None, active_scanning: true }
    }
}

impl From<&iotroute_conf::Cache> for MemoryCacheOptions {
    fn from(cfg: &iotroute_conf::Cache) -> Self {
        Self {
            capacity: if cfg.capacity < 0 { None } else { Some(cfg.capacity as usize) },
            default_timeout: cfg.default_timeout,
            active_scanning: cfg.active_scanning,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EntryOptions {
    pub size: Option<usize>,
    pub timeout: Option<Duration>,
}

impl EntryOptions {
    #[inline]
    pub fn size(mut self, size: usize) -> Self {
        self.size = Some(size);
        self
    }

    #[inline]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

struct Entry<V> {
    value: V,
    size: usize,
    expires_at: Option<Instant>,
    state: AtomicU8,
}

impl<V> Entry<V> {
    #[inline]
    fn is_expired(&self, now: Instant) -> bool {
        self.state.load(Ordering::SeqCst) != STATE_ALIVE || self.expires_at.is_some_and(|t| t <= now)
    }

    /// Moves an alive-but-timed-out entry into the expired state, returns true on transition
    #[inline]
    fn mark_expired(&self, now: Instant) -> bool {
        if self.expires_at.is_some_and(|t| t <= now) {
            self.state
                .compare_exchange(STATE_ALIVE, STATE_EXPIRED, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        } else {
            false
        }
    }
}

struct CacheInner<K, V> {
    entries: RwLock<AHashMap<K, Entry<V>>>,
    size: Mutex<usize>,
    deletion_queue: Mutex<Vec<K>>,
    last_scan: Mutex<Instant>,
    options: MemoryCacheOptions,
    clock: Box<dyn Clock>,
    closed: AtomicBool,
}

pub struct MemoryCache<K, V> {
    inner: Arc<CacheInner<K, V>>,
}

impl<K, V> Clone for MemoryCache<K, V> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<K, V> MemoryCache<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(options: MemoryCacheOptions) -> Self {
        Self::with_clock(options, SystemClock)
    }

    pub fn with_clock<C: Clock + 'static>(options: MemoryCacheOptions, clock: C) -> Self {
        let now = clock.now();
        Self {
            inner: Arc::new(CacheInner {
                entries: RwLock::new(AHashMap::default()),
                size: Mutex::new(0),
                deletion_queue: Mutex::new(Vec::new()),
                last_scan: Mutex::new(now),
                options,
                clock: Box::new(clock),
                closed: AtomicBool::new(false),
            }),
        }
    }

    #[inline]
    fn check_closed(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            Err(Error::Disposed("memory cache"))
        } else {
            Ok(())
        }
    }

    fn validate(&self, opts: &EntryOptions) -> Result<usize> {
        match (self.inner.options.capacity, opts.size) {
            (Some(_), None) => Err(Error::SizeRequired),
            (_, Some(0)) => Err(Error::InvalidArgument("entry size must be positive".into())),
            (_, Some(size)) => Ok(size),
            (None, None) => Ok(0),
        }
    }

    fn make_entry(&self, value: V, size: usize, opts: &EntryOptions, now: Instant) -> Entry<V> {
        let timeout = opts.timeout.or(self.inner.options.default_timeout);
        Entry { value, size, expires_at: timeout.map(|t| now + t), state: AtomicU8::new(STATE_ALIVE) }
    }

    /// Inserts a new entry. Fails if a live entry exists under `key`; an expired one is replaced.
    pub fn add(&self, key: K, value: V, opts: EntryOptions) -> Result<()> {
        self.insert(key, value, opts, false)
    }

    /// Inserts or replaces, with the same size and timeout validation as [`MemoryCache::add`]
    pub fn add_or_update(&self, key: K, value: V, opts: EntryOptions) -> Result<()> {
        self.insert(key, value, opts, true)
    }

    /// Inserts every pair with the same options under one write lock. The batch is
    /// applied as a whole or not at all: a live key, a duplicate key within the batch
    /// or a total over capacity rejects it and leaves the cache untouched.
    pub fn add_range<I>(&self, items: I, opts: EntryOptions) -> Result<usize>
    where
        I: IntoIterator<Item = (K, V)>,
    {
        self.insert_range(items, opts, false)
    }

    /// Batch form of [`MemoryCache::add_or_update`]; a key repeated in the batch keeps its last value
    pub fn add_or_update_range<I>(&self, items: I, opts: EntryOptions) -> Result<usize>
    where
        I: IntoIterator<Item = (K, V)>,
    {
        self.insert_range(items, opts, true)
    }

    fn insert(&self, key: K, value: V, opts: EntryOptions, replace_alive: bool) -> Result<()> {
        let new_size = self.validate(&opts)?;
        let now = self.inner.clock.now();

        let mut entries = self.inner.entries.write();
        self.check_closed()?;
        let old_size = match entries.get(&key) {
            Some(existing) if !replace_alive && !existing.is_expired(now) => return Err(Error::KeyExists),
            Some(existing) => existing.size,
            None => 0,
        };

        let mut size = self.inner.size.lock();
        let total = *size - old_size + new_size;
        if let Some(capacity) = self.inner.options.capacity {
            if total > capacity {
                return Err(Error::CapacityExceeded);
            }
        }

        let entry = self.make_entry(value, new_size, &opts, now);
        entries.insert(key, entry);
        *size = total;
        Ok(())
    }

    fn insert_range<I>(&self, items: I, opts: EntryOptions, replace_alive: bool) -> Result<usize>
    where
        I: IntoIterator<Item = (K, V)>,
    {
        let new_size = self.validate(&opts)?;
        let now = self.inner.clock.now();

        let mut entries = self.inner.entries.write();
        self.check_closed()?;

        let mut batch: AHashMap<K, V> = AHashMap::default();
        for (key, value) in items {
            if !replace_alive
                && (batch.contains_key(&key) || entries.get(&key).is_some_and(|e| !e.is_expired(now)))
            {
                return Err(Error::KeyExists);
            }
            batch.insert(key, value);
        }

        let mut size = self.inner.size.lock();
        let total = batch.keys().fold(*size, |total, key| {
            total + new_size - entries.get(key).map(|e| e.size).unwrap_or_default()
        });
        if let Some(capacity) = self.inner.options.capacity {
            if total > capacity {
                return Err(Error::CapacityExceeded);
            }
        }

        let count = batch.len();
        for (key, value) in batch {
            let entry = self.make_entry(value, new_size, &opts, now);
            entries.insert(key, entry);
        }
        *size = total;
        Ok(count)
    }

    /// Returns the live value for `key`, `None` when absent or expired
    pub fn try_get_value(&self, key: &K) -> Result<Option<V>> {
        let now = self.inner.clock.now();

        let (value, newly_expired) = {
            let entries = self.inner.entries.read();
            self.check_closed()?;
            match entries.get(key) {
                None => (None, false),
                Some(entry) => {
                    let transitioned = entry.mark_expired(now);
                    if entry.is_expired(now) {
                        (None, transitioned)
                    } else {
                        (Some(entry.value.clone()), false)
                    }
                }
            }
        };

        if newly_expired && self.inner.options.active_scanning {
            self.schedule_removal(key.clone());
            self.start_scan(now);
        }
        Ok(value)
    }

    /// Like [`MemoryCache::try_get_value`] but a missing entry is an error
    #[inline]
    pub fn get(&self, key: &K) -> Result<V> {
        self.try_get_value(key)?.ok_or(Error::KeyNotFound)
    }

    #[inline]
    pub fn contains_key(&self, key: &K) -> Result<bool> {
        Ok(self.try_get_value(key)?.is_some())
    }

    fn schedule_removal(&self, key: K) {
        let entries = self.inner.entries.read();
        if self.inner.closed.load(Ordering::SeqCst) {
            return;
        }
        if let Some(entry) = entries.get(&key) {
            let prev = entry.state.swap(STATE_SCHEDULED, Ordering::SeqCst);
            if prev != STATE_SCHEDULED {
                self.inner.deletion_queue.lock().push(key);
            }
        }
    }

    fn start_scan(&self, now: Instant) {
        {
            let mut last = self.inner.last_scan.lock();
            if now.saturating_duration_since(*last) < SCAN_INTERVAL {
                return;
            }
            *last = now;
        }
        if let Err(e) = self.scan_for_expired_items() {
            log::debug!("expired item scan skipped, {e}");
        }
    }

    /// Removes `key`, failing if it is not present
    pub fn remove(&self, key: &K) -> Result<()> {
        if self.try_remove(key)? {
            Ok(())
        } else {
            Err(Error::KeyNotFound)
        }
    }

    /// Removes `key`, reporting whether anything was removed
    pub fn try_remove(&self, key: &K) -> Result<bool> {
        let mut entries = self.inner.entries.write();
        self.check_closed()?;
        match entries.remove(key) {
            Some(entry) => {
                *self.inner.size.lock() -= entry.size;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Marks every timed-out entry and queues it for removal. Nothing is evicted here.
    pub fn scan_for_expired_items(&self) -> Result<usize> {
        let now = self.inner.clock.now();
        let entries = self.inner.entries.read();
        self.check_closed()?;
        let mut marked = Vec::new();
        for (key, entry) in entries.iter() {
            entry.mark_expired(now);
            if entry
                .state
                .compare_exchange(STATE_EXPIRED, STATE_SCHEDULED, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                marked.push(key.clone());
            }
        }
        drop(entries);

        let count = marked.len();
        if count > 0 {
            self.inner.deletion_queue.lock().extend(marked);
        }
        Ok(count)
    }

    /// Evicts everything queued by a scan or a lazy read, returns the number of evictions
    pub fn remove_scheduled_entries(&self) -> Result<usize> {
        self.check_closed()?;
        let queued = std::mem::take(&mut *self.inner.deletion_queue.lock());
        if queued.is_empty() {
            return Ok(0);
        }

        let mut entries = self.inner.entries.write();
        self.check_closed()?;
        let mut size = self.inner.size.lock();
        let mut removed = 0;
        for key in queued {
            //the key may have been re-added since it was queued
            let scheduled = entries.get(&key).is_some_and(|e| e.state.load(Ordering::SeqCst) != STATE_ALIVE);
            if scheduled {
                if let Some(entry) = entries.remove(&key) {
                    *size -= entry.size;
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    pub async fn remove_scheduled_entries_async(&self) -> Result<usize> {
        let cache = self.clone();
        tokio::task::spawn_blocking(move || cache.remove_scheduled_entries())
            .await
            .map_err(|e| Error::Msg(format!("scheduled removal task failed, {e}")))?
    }

    pub fn clear(&self) -> Result<()> {
        let mut entries = self.inner.entries.write();
        self.check_closed()?;
        entries.clear();
        *self.inner.size.lock() = 0;
        self.inner.deletion_queue.lock().clear();
        Ok(())
    }

    /// Drops all entries; every later call fails with [`Error::Disposed`]
    pub fn close(&self) {
        let mut entries = self.inner.entries.write();
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        entries.clear();
        self.inner.deletion_queue.lock().clear();
        *self.inner.size.lock() = 0;
    }

    #[inline]
    pub fn count(&self) -> Result<usize> {
        let entries = self.inner.entries.read();
        self.check_closed()?;
        Ok(entries.len())
    }

    /// Sum of the declared sizes of all stored entries, expired ones included until evicted
    #[inline]
    pub fn size(&self) -> Result<usize> {
        let _entries = self.inner.entries.read();
        self.check_closed()?;
        Ok(*self.inner.size.lock())
    }

    #[inline]
    pub fn capacity(&self) -> Option<usize> {
        self.inner.options.capacity
    }

    #[inline]
    pub fn default_timeout(&self) -> Option<Duration> {
        self.inner.options.default_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone)]
    struct ManualClock(Arc<Mutex<Instant>>);

    impl ManualClock {
        fn new() -> Self {
            ManualClock(Arc::new(Mutex::new(Instant::now())))
        }
        fn advance(&self, d: Duration) {
            *self.0.lock() += d;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> Instant {
            *self.0.lock()
        }
    }

    fn bounded(capacity: usize) -> MemoryCache<String, u32> {
        MemoryCache::new(MemoryCacheOptions { capacity: Some(capacity), ..Default::default() })
    }

    #[test]
    fn add_and_get() {
        let cache: MemoryCache<String, u32> = MemoryCache::new(MemoryCacheOptions::default());
        cache.add("a".into(), 1, EntryOptions::default()).unwrap();
        assert_eq!(cache.try_get_value(&"a".into()).unwrap(), Some(1));
        assert_eq!(cache.get(&"a".into()).unwrap(), 1);
        assert_eq!(cache.try_get_value(&"b".into()).unwrap(), None);
        assert!(matches!(cache.get(&"b".into()), Err(Error::KeyNotFound)));
        assert!(matches!(cache.add("a".into(), 2, EntryOptions::default()), Err(Error::KeyExists)));

        cache.add_or_update("a".into(), 2, EntryOptions::default()).unwrap();
        assert_eq!(cache.get(&"a".into()).unwrap(), 2);
        assert_eq!(cache.count().unwrap(), 1);
    }

    #[test]
    fn capacity_is_never_exceeded() {
        let cache = bounded(10);
        cache.add("a".into(), 1, EntryOptions::default().size(6)).unwrap();
        assert_eq!(cache.size().unwrap(), 6);

        assert!(matches!(
            cache.add("b".into(), 2, EntryOptions::default().size(5)),
            Err(Error::CapacityExceeded)
        ));
        assert_eq!(cache.size().unwrap(), 6);
        assert!(matches!(
            cache.add_or_update("c".into(), 3, EntryOptions::default().size(11)),
            Err(Error::CapacityExceeded)
        ));
        assert_eq!(cache.size().unwrap(), 6);
        assert_eq!(cache.count().unwrap(), 1);

        cache.add("b".into(), 2, EntryOptions::default().size(4)).unwrap();
        assert_eq!(cache.size().unwrap(), 10);

        //replacing an entry only accounts for the difference
        cache.add_or_update("a".into(), 9, EntryOptions::default().size(5)).unwrap();
        assert_eq!(cache.size().unwrap(), 9);
        assert!(cache.size().unwrap() <= cache.capacity().unwrap());
    }

    #[test]
    fn bounded_cache_requires_size() {
        let cache = bounded(10);
        assert!(matches!(cache.add("a".into(), 1, EntryOptions::default()), Err(Error::SizeRequired)));
        assert!(matches!(
            cache.add("a".into(), 1, EntryOptions::default().size(0)),
            Err(Error::InvalidArgument(_))
        ));
        assert_eq!(cache.count().unwrap(), 0);
        assert_eq!(cache.size().unwrap(), 0);
    }

    #[test]
    fn lazy_expiry_on_read() {
        let cache: MemoryCache<String, u32> = MemoryCache::new(MemoryCacheOptions::default());
        cache.add("a".into(), 1, EntryOptions::default().timeout(Duration::from_millis(100))).unwrap();
        assert_eq!(cache.try_get_value(&"a".into()).unwrap(), Some(1));
        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(cache.try_get_value(&"a".into()).unwrap(), None);
        assert!(matches!(cache.get(&"a".into()), Err(Error::KeyNotFound)));
    }

    #[test]
    fn add_over_expired_key() {
        let clock = ManualClock::new();
        let cache: MemoryCache<String, u32> = MemoryCache::with_clock(
            MemoryCacheOptions { capacity: Some(10), ..Default::default() },
            clock.clone(),
        );
        cache.add("a".into(), 1, EntryOptions::default().size(8).timeout(Duration::from_secs(1))).unwrap();
        clock.advance(Duration::from_secs(2));

        //the expired entry's size is released by the replacement
        cache.add("a".into(), 2, EntryOptions::default().size(9)).unwrap();
        assert_eq!(cache.get(&"a".into()).unwrap(), 2);
        assert_eq!(cache.size().unwrap(), 9);
    }

    #[test]
    fn two_phase_eviction() {
        let clock = ManualClock::new();
        let cache: MemoryCache<String, u32> = MemoryCache::with_clock(
            MemoryCacheOptions { capacity: Some(100), active_scanning: false, ..Default::default() },
            clock.clone(),
        );
        let short = EntryOptions::default().size(10).timeout(Duration::from_secs(5));
        cache.add("a".into(), 1, short).unwrap();
        cache.add("b".into(), 2, short).unwrap();
        cache.add("c".into(), 3, EntryOptions::default().size(10)).unwrap();
        assert_eq!(cache.size().unwrap(), 30);

        clock.advance(Duration::from_secs(6));
        assert_eq!(cache.scan_for_expired_items().unwrap(), 2);
        //marked, not yet evicted
        assert_eq!(cache.count().unwrap(), 3);
        assert_eq!(cache.size().unwrap(), 30);
        assert_eq!(cache.try_get_value(&"a".into()).unwrap(), None);

        assert_eq!(cache.remove_scheduled_entries().unwrap(), 2);
        assert_eq!(cache.count().unwrap(), 1);
        assert_eq!(cache.size().unwrap(), 10);
        assert_eq!(cache.remove_scheduled_entries().unwrap(), 0);
    }

    #[test]
    fn expired_read_schedules_removal() {
        let clock = ManualClock::new();
        let cache: MemoryCache<String, u32> = MemoryCache::with_clock(
            MemoryCacheOptions { default_timeout: Some(Duration::from_secs(1)), ..Default::default() },
            clock.clone(),
        );
        cache.add("a".into(), 1, EntryOptions::default()).unwrap();
        clock.advance(Duration::from_secs(2));
        assert_eq!(cache.try_get_value(&"a".into()).unwrap(), None);
        assert_eq!(cache.remove_scheduled_entries().unwrap(), 1);
        assert_eq!(cache.count().unwrap(), 0);
    }

    #[test]
    fn requeued_key_survives_eviction() {
        let clock = ManualClock::new();
        let cache: MemoryCache<String, u32> =
            MemoryCache::with_clock(MemoryCacheOptions::default(), clock.clone());
        cache.add("a".into(), 1, EntryOptions::default().timeout(Duration::from_secs(1))).unwrap();
        clock.advance(Duration::from_secs(2));
        assert_eq!(cache.scan_for_expired_items().unwrap(), 1);
        cache.add("a".into(), 2, EntryOptions::default()).unwrap();
        assert_eq!(cache.remove_scheduled_entries().unwrap(), 0);
        assert_eq!(cache.get(&"a".into()).unwrap(), 2);
    }

    #[test]
    fn remove_semantics() {
        let cache = bounded(10);
        cache.add("a".into(), 1, EntryOptions::default().size(3)).unwrap();
        assert!(matches!(cache.remove(&"b".into()), Err(Error::KeyNotFound)));
        assert!(!cache.try_remove(&"b".into()).unwrap());
        assert!(cache.try_remove(&"a".into()).unwrap());
        assert_eq!(cache.size().unwrap(), 0);
        assert!(matches!(cache.remove(&"a".into()), Err(Error::KeyNotFound)));
    }

    #[test]
    fn closed_cache_rejects_use() {
        let cache = bounded(10);
        cache.add("a".into(), 1, EntryOptions::default().size(3)).unwrap();
        cache.close();
        assert!(matches!(cache.try_get_value(&"a".into()), Err(Error::Disposed(_))));
        assert!(matches!(cache.add("b".into(), 1, EntryOptions::default().size(1)), Err(Error::Disposed(_))));
        assert!(matches!(cache.try_remove(&"a".into()), Err(Error::Disposed(_))));
        assert!(matches!(cache.scan_for_expired_items(), Err(Error::Disposed(_))));
        assert!(matches!(cache.count(), Err(Error::Disposed(_))));
        assert!(matches!(cache.size(), Err(Error::Disposed(_))));
        cache.close();
    }

    #[test]
    fn range_insert_is_all_or_nothing() {
        let cache = bounded(10);
        cache.add("a".into(), 1, EntryOptions::default().size(4)).unwrap();

        let batch = vec![("b".to_string(), 2), ("c".to_string(), 3), ("d".to_string(), 4)];
        assert!(matches!(
            cache.add_range(batch.clone(), EntryOptions::default().size(3)),
            Err(Error::CapacityExceeded)
        ));
        assert_eq!(cache.size().unwrap(), 4);
        assert_eq!(cache.count().unwrap(), 1);
        assert_eq!(cache.try_get_value(&"b".into()).unwrap(), None);

        assert!(matches!(
            cache.add_range(vec![("e".to_string(), 5), ("a".to_string(), 6)], EntryOptions::default().size(1)),
            Err(Error::KeyExists)
        ));
        assert!(matches!(
            cache.add_range(vec![("e".to_string(), 5), ("e".to_string(), 6)], EntryOptions::default().size(1)),
            Err(Error::KeyExists)
        ));
        assert!(matches!(cache.add_range(batch.clone(), EntryOptions::default()), Err(Error::SizeRequired)));
        assert_eq!(cache.count().unwrap(), 1);

        assert_eq!(cache.add_range(batch[..2].to_vec(), EntryOptions::default().size(3)).unwrap(), 2);
        assert_eq!(cache.size().unwrap(), 10);
        assert_eq!(cache.get(&"c".into()).unwrap(), 3);
    }

    #[test]
    fn range_update_accounts_for_replaced_entries() {
        let cache = bounded(10);
        cache.add_range(vec![("a".to_string(), 1), ("b".to_string(), 2)], EntryOptions::default().size(5)).unwrap();

        //a and b shrink to 3 each, c takes 3, a repeated key keeps its last value
        let batch = vec![("a".to_string(), 10), ("b".to_string(), 20), ("c".to_string(), 30), ("a".to_string(), 11)];
        assert_eq!(cache.add_or_update_range(batch, EntryOptions::default().size(3)).unwrap(), 3);
        assert_eq!(cache.size().unwrap(), 9);
        assert_eq!(cache.get(&"a".into()).unwrap(), 11);

        let over = vec![("d".to_string(), 4), ("a".to_string(), 12)];
        assert!(matches!(
            cache.add_or_update_range(over, EntryOptions::default().size(4)),
            Err(Error::CapacityExceeded)
        ));
        assert_eq!(cache.size().unwrap(), 9);
        assert_eq!(cache.get(&"a".into()).unwrap(), 11);
        assert_eq!(cache.try_get_value(&"d".into()).unwrap(), None);
    }

    #[test]
    fn concurrent_writers_respect_capacity() {
        let cache: MemoryCache<u32, u32> =
            MemoryCache::new(MemoryCacheOptions { capacity: Some(100), ..Default::default() });
        let writers: Vec<_> = (0..4u32)
            .map(|t| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    let mut added = 0usize;
                    for i in 0..100 {
                        if cache.add(t * 1000 + i, i, EntryOptions::default().size(1)).is_ok() {
                            added += 1;
                        }
                        let _ = cache.try_get_value(&(t * 1000 + i / 2));
                    }
                    added
                })
            })
            .collect();
        let added: usize = writers.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(added, 100);
        assert_eq!(cache.count().unwrap(), 100);
        assert_eq!(cache.size().unwrap(), 100);
    }

    #[test]
    fn close_racing_writers_leaves_nothing_behind() {
        for _ in 0..200 {
            let cache: MemoryCache<u32, u32> = MemoryCache::new(MemoryCacheOptions::default());
            let barrier = Arc::new(std::sync::Barrier::new(2));
            let writer = {
                let cache = cache.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    for i in 0..200 {
                        if cache.add(i, i, EntryOptions::default()).is_err() {
                            break;
                        }
                    }
                })
            };
            barrier.wait();
            cache.close();
            writer.join().unwrap();
            assert!(cache.inner.entries.read().is_empty());
            assert_eq!(*cache.inner.size.lock(), 0);
        }
    }

    #[tokio::test]
    async fn async_eviction() {
        let clock = ManualClock::new();
        let cache: MemoryCache<u64, String> =
            MemoryCache::with_clock(MemoryCacheOptions::default(), clock.clone());
        for i in 0..100u64 {
            let opts = if i % 2 == 0 {
                EntryOptions::default().timeout(Duration::from_secs(1))
            } else {
                EntryOptions::default()
            };
            cache.add(i, format!("v{i}"), opts).unwrap();
        }
        clock.advance(Duration::from_secs(1));
        assert_eq!(cache.scan_for_expired_items().unwrap(), 50);
        assert_eq!(cache.remove_scheduled_entries_async().await.unwrap(), 50);
        assert_eq!(cache.count().unwrap(), 50);
    }

    #[test]
    fn options_from_settings() {
        let cfg = iotroute_conf::Cache { capacity: -1, default_timeout: None, active_scanning: true };
        let opts = MemoryCacheOptions::from(&cfg);
        assert!(opts.capacity.is_none());
        let cfg = iotroute_conf::Cache {
            capacity: 64,
            default_timeout: Some(Duration::from_secs(3)),
            active_scanning: false,
        };
        let opts = MemoryCacheOptions::from(&cfg);
        assert_eq!(opts.capacity, Some(64));
        assert_eq!(opts.default_timeout, Some(Duration::from_secs(3)));
    }
}
