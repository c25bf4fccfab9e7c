//! The frame cache: content identifier → buffer store with a byte budget
//!
//! Buffers are addressed by their content identifier, so identical images
//! produced by different evaluation paths share one entry. The cache owns
//! the storage lifetime of every buffer added to it: consumers borrow
//! buffers through checkout/checkin, and only the cache's own delete paths
//! retire them.
//!
//! The byte budget is a floor rather than a hard ceiling: `add` with
//! `force` may push usage past the budget when dropping a frame would be
//! worse than transient over-use (the display path does this during
//! playback). Reclaim pulls victims from [`EvictionStaging`] in
//! first-staged order.
//!
//! All state lives behind one mutex. Single operations can go through the
//! convenience methods on [`FrameCache`]; multi-step windows (resolve a
//! whole identifier tree, reconcile freshly evaluated buffers) take the
//! guard once via [`FrameCache::lock`] and hold it for the window.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, trace};

use crate::buffer::FrameBuffer;
use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::staging::EvictionStaging;

/// Snapshot of cache health counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    /// Byte budget.
    pub capacity: usize,
    /// Bytes currently accounted to cached buffers.
    pub used: usize,
    /// Number of cached buffers (tiles count individually).
    pub entry_count: usize,
    /// Number of buffers staged for eviction.
    pub staged_count: usize,
    /// Checkout hits.
    pub hits: u64,
    /// Checkout misses.
    pub misses: u64,
    /// Buffers evicted to reclaim bytes.
    pub evictions: u64,
}

impl CacheStats {
    /// Checkout hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Budget utilization (0.0 to 1.0; above 1.0 after forced adds).
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            0.0
        } else {
            self.used as f64 / self.capacity as f64
        }
    }
}

struct CacheState {
    budget: usize,
    current: usize,
    full: bool,
    retrieve_tick: u64,
    entries: HashMap<String, Arc<FrameBuffer>>,
    staging: EvictionStaging,
    /// Which identifiers each frame referenced, for range diagnostics and
    /// per-frame flushing. Entries may name evicted identifiers; a frame
    /// counts as cached only while all its identifiers are.
    frames: BTreeMap<i64, HashSet<String>>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl CacheState {
    fn recompute_full(&mut self) {
        self.full = self.current >= self.budget;
    }
}

/// Identifier → buffer store with byte-budget enforcement.
pub struct FrameCache {
    state: Mutex<CacheState>,
}

impl FrameCache {
    /// Create a cache with the given byte budget.
    pub fn new(byte_budget: usize) -> Self {
        Self {
            state: Mutex::new(CacheState {
                budget: byte_budget,
                current: 0,
                full: false,
                retrieve_tick: 0,
                entries: HashMap::new(),
                staging: EvictionStaging::new(),
                frames: BTreeMap::new(),
                hits: 0,
                misses: 0,
                evictions: 0,
            }),
        }
    }

    pub fn with_config(config: &CacheConfig) -> Self {
        Self::new(config.byte_budget)
    }

    /// Acquire the cache lock for a multi-operation window.
    ///
    /// The guard is the sole way to keep the map, the byte accounting, and
    /// the staging consistent across several calls; resolve-then-evaluate
    /// decision windows must run under one guard.
    pub fn lock(&self) -> FrameCacheGuard<'_> {
        FrameCacheGuard {
            state: self.state.lock().unwrap(),
        }
    }

    // Single-operation conveniences; each takes the lock for one call.

    pub fn capacity(&self) -> usize {
        self.lock().capacity()
    }

    pub fn used(&self) -> usize {
        self.lock().used()
    }

    pub fn is_full(&self) -> bool {
        self.lock().is_full()
    }

    pub fn entry_count(&self) -> usize {
        self.lock().entry_count()
    }

    pub fn is_cached(&self, identifier: &str) -> bool {
        self.lock().is_cached(identifier)
    }

    pub fn check_out(&self, identifier: &str) -> Option<Arc<FrameBuffer>> {
        self.lock().check_out(identifier)
    }

    pub fn check_out_buffer(&self, buffer: &Arc<FrameBuffer>) -> Result<(), CacheError> {
        self.lock().check_out_buffer(buffer)
    }

    pub fn check_in(&self, buffer: &Arc<FrameBuffer>) -> Result<(), CacheError> {
        self.lock().check_in(buffer)
    }

    pub fn add(&self, buffer: Arc<FrameBuffer>, force: bool) -> bool {
        self.lock().add(buffer, force)
    }

    pub fn flush(&self, identifier: &str) -> bool {
        self.lock().flush(identifier)
    }

    pub fn free_trash(&self, bytes: usize) -> bool {
        self.lock().free_trash(bytes)
    }

    pub fn free_all_trash(&self) -> bool {
        self.lock().free_all_trash()
    }

    pub fn emergency_free(&self) {
        self.lock().emergency_free()
    }

    pub fn clear(&self) {
        self.lock().clear()
    }

    pub fn set_byte_budget(&self, bytes: usize) {
        self.lock().set_byte_budget(bytes)
    }

    pub fn lock_buffer(&self, buffer: &Arc<FrameBuffer>) -> Result<(), CacheError> {
        self.lock().lock_buffer(buffer)
    }

    pub fn unlock_buffer(&self, buffer: &Arc<FrameBuffer>) -> Result<(), CacheError> {
        self.lock().unlock_buffer(buffer)
    }

    pub fn reference_frame(&self, frame: i64, buffer: &Arc<FrameBuffer>) -> Result<(), CacheError> {
        self.lock().reference_frame(frame, buffer)
    }

    pub fn frame_is_cached(&self, frame: i64) -> bool {
        self.lock().frame_is_cached(frame)
    }

    pub fn cached_ranges(&self) -> Vec<(i64, i64)> {
        self.lock().cached_ranges()
    }

    pub fn flush_frame(&self, frame: i64) -> usize {
        self.lock().flush_frame(frame)
    }

    pub fn stats(&self) -> CacheStats {
        self.lock().stats()
    }
}

impl Default for FrameCache {
    fn default() -> Self {
        Self::with_config(&CacheConfig::default())
    }
}

/// Exclusive access to the cache state for the lifetime of a lock window.
pub struct FrameCacheGuard<'a> {
    state: MutexGuard<'a, CacheState>,
}

impl FrameCacheGuard<'_> {
    pub fn capacity(&self) -> usize {
        self.state.budget
    }

    pub fn used(&self) -> usize {
        self.state.current
    }

    /// True once usage has reached the budget. New adds without `force`
    /// will only succeed if staged victims can cover the shortfall.
    pub fn is_full(&self) -> bool {
        self.state.full
    }

    pub fn entry_count(&self) -> usize {
        self.state.entries.len()
    }

    pub fn staged_count(&self) -> usize {
        self.state.staging.len()
    }

    pub fn is_cached(&self, identifier: &str) -> bool {
        self.state.entries.contains_key(identifier)
    }

    /// Look up a buffer by identifier and check it out.
    ///
    /// A hit bumps the buffer's reference count, stamps its retrieval
    /// order, and removes it from eviction staging. A miss returns `None`;
    /// it is not an error.
    pub fn check_out(&mut self, identifier: &str) -> Option<Arc<FrameBuffer>> {
        match self.state.entries.get(identifier).cloned() {
            Some(buffer) => {
                self.state.hits += 1;
                self.checkout_owned(&buffer);
                trace!(identifier, refs = buffer.cache_reference_count(), "checkout hit");
                Some(buffer)
            }
            None => {
                self.state.misses += 1;
                trace!(identifier, "checkout miss");
                None
            }
        }
    }

    /// Check out an already-resolved buffer.
    ///
    /// Fails if this cache does not own the buffer: handing a buffer from
    /// another cache instance, or one that was already evicted, is a caller
    /// bug.
    pub fn check_out_buffer(&mut self, buffer: &Arc<FrameBuffer>) -> Result<(), CacheError> {
        self.verify_owned(buffer)?;
        self.checkout_owned(buffer);
        Ok(())
    }

    /// Return a previously checked-out buffer.
    ///
    /// Dropping to one remaining reference (the map's own) stages the
    /// buffer for eviction; dropping to zero deletes it immediately.
    pub fn check_in(&mut self, buffer: &Arc<FrameBuffer>) -> Result<(), CacheError> {
        self.verify_owned(buffer)?;

        let refs = buffer.release();
        trace!(identifier = buffer.identifier(), refs, "checkin");
        if refs == 0 {
            if !self.flush(buffer.identifier()) {
                // Deletion refused (pixel lock held); keep the map's
                // reference so the entry invariant holds.
                buffer.retain();
            }
        } else if refs == 1 && !buffer.is_locked() {
            self.state.staging.stage(buffer);
        }
        Ok(())
    }

    /// Add a buffer under its identifier, with reference count one (the
    /// map's own reference). Returns `true` if the buffer fit the budget.
    ///
    /// If it would not fit and staged victims cannot cover the shortfall:
    /// without `force` nothing is mutated and `false` is returned; with
    /// `force` the buffer is inserted anyway and `false` reports that usage
    /// is now past the budget.
    ///
    /// An older buffer already cached under the same identifier is deleted
    /// first.
    pub fn add(&mut self, buffer: Arc<FrameBuffer>, force: bool) -> bool {
        if buffer.in_cache() {
            return true;
        }

        let bytes = buffer.total_size();
        let mut fit = true;

        if self.state.current + bytes > self.state.budget && !self.make_room(bytes) {
            self.state.recompute_full();
            if !force {
                return false;
            }
            debug!(
                identifier = buffer.identifier(),
                bytes,
                used = self.state.current,
                capacity = self.state.budget,
                "forcing buffer into full cache"
            );
            fit = false;
        }

        self.state.current += bytes;
        buffer.retain();

        if let Some(old) = self.state.entries.remove(buffer.identifier()) {
            debug!(identifier = old.identifier(), "replacing cached buffer");
            self.state.staging.unstage(&old);
            let freed = self.delete_cascade(&old);
            self.state.current = self.state.current.saturating_sub(freed);
        }

        self.state
            .entries
            .insert(buffer.identifier().to_owned(), buffer);
        self.state.recompute_full();
        fit
    }

    /// Delete the buffer cached under `identifier`, unless someone besides
    /// the cache still holds it. Returns whether the buffer was deleted.
    ///
    /// This is the single safe-delete gate every other path routes through.
    pub fn flush(&mut self, identifier: &str) -> bool {
        let Some(buffer) = self.state.entries.get(identifier).cloned() else {
            return false;
        };

        if buffer.cache_reference_count() > 1 {
            trace!(
                identifier,
                refs = buffer.cache_reference_count(),
                "flush skipped: buffer still referenced"
            );
            return false;
        }

        if buffer.is_locked() {
            trace!(identifier, "flush skipped: pixel lock held");
            return false;
        }

        self.state.entries.remove(identifier);
        self.state.staging.unstage(&buffer);
        let freed = self.delete_cascade(&buffer);
        self.state.current = self.state.current.saturating_sub(freed);
        self.state.recompute_full();
        debug!(identifier, freed, "flushed buffer");
        true
    }

    /// Evict oldest-staged buffers until at least `bytes` are reclaimed or
    /// staging runs dry. Returns whether the target was met.
    pub fn free_trash(&mut self, bytes: usize) -> bool {
        let mut freed = 0usize;

        while freed < bytes {
            let Some(victim) = self.state.staging.evict_oldest() else {
                break;
            };
            if victim.is_locked() {
                // A pinned buffer is unstaged when the lock is taken, so a
                // locked victim here is a bookkeeping bug.
                debug_assert!(false, "locked buffer in eviction staging");
                continue;
            }
            self.state.entries.remove(victim.identifier());
            let n = self.delete_cascade(&victim);
            self.state.current = self.state.current.saturating_sub(n);
            freed += n;
            self.state.evictions += 1;
            debug!(identifier = victim.identifier(), bytes = n, "evicted staged buffer");
        }

        self.state.recompute_full();
        freed >= bytes
    }

    /// Evict everything staged. Returns `true` only if that emptied the
    /// cache's accounted bytes entirely.
    pub fn free_all_trash(&mut self) -> bool {
        let target = self.state.current;
        self.free_trash(target)
    }

    /// Best-effort reclaim for when the cache is discovered over budget at
    /// an inconvenient moment. Never fails.
    pub fn emergency_free(&mut self) {
        let target = self.state.current.saturating_sub(self.state.budget);
        if target > 0 {
            let _ = self.free_trash(target);
        }
        self.state.recompute_full();
    }

    /// Delete every unlocked buffer. Buffers with a held pixel lock cannot
    /// be safely deleted (a consumer is reading them outside the
    /// checkout/checkin protocol); they are kept and their bytes
    /// re-accounted. Frame bookkeeping is reset.
    pub fn clear(&mut self) {
        let entries = std::mem::take(&mut self.state.entries);
        let mut kept = HashMap::new();
        let mut bytes = 0usize;

        for (identifier, buffer) in entries {
            if buffer.is_locked() {
                debug!(identifier = identifier.as_str(), "clear keeping locked buffer");
                bytes += buffer.total_size();
                kept.insert(identifier, buffer);
            } else {
                self.state.staging.unstage(&buffer);
                buffer.reset_cache_state();
            }
        }

        self.state.entries = kept;
        self.state.current = bytes;
        self.state.frames.clear();
        self.state.recompute_full();
        debug!(kept = self.state.entries.len(), bytes, "cleared cache");
    }

    /// Change the byte budget, evicting staged buffers if the new budget is
    /// below current usage.
    pub fn set_byte_budget(&mut self, bytes: usize) {
        self.state.budget = bytes;
        if self.state.current > bytes {
            let over = self.state.current - bytes;
            let _ = self.free_trash(over);
        }
        self.state.recompute_full();
    }

    /// Take the pixel lock on a cached buffer. While held, no delete path
    /// will retire the buffer, independent of its reference count. The
    /// buffer leaves eviction staging; it is not a victim candidate while
    /// pinned.
    pub fn lock_buffer(&mut self, buffer: &Arc<FrameBuffer>) -> Result<(), CacheError> {
        self.verify_owned(buffer)?;
        buffer.increment_lock();
        self.state.staging.unstage(buffer);
        Ok(())
    }

    /// Release the pixel lock. Dropping the last lock on an otherwise
    /// unreferenced buffer makes it an eviction candidate again.
    pub fn unlock_buffer(&mut self, buffer: &Arc<FrameBuffer>) -> Result<(), CacheError> {
        self.verify_owned(buffer)?;
        buffer.decrement_lock();
        if !buffer.is_locked() && buffer.cache_reference_count() == 1 {
            self.state.staging.stage(buffer);
        }
        Ok(())
    }

    /// Record that `frame` uses this buffer. Keeps per-frame bookkeeping
    /// correct on the fast path, where buffers resolve from the cache
    /// without a fresh evaluation.
    pub fn reference_frame(&mut self, frame: i64, buffer: &Arc<FrameBuffer>) -> Result<(), CacheError> {
        self.verify_owned(buffer)?;
        self.state
            .frames
            .entry(frame)
            .or_default()
            .insert(buffer.identifier().to_owned());
        Ok(())
    }

    /// Whether every identifier `frame` referenced is currently cached.
    pub fn frame_is_cached(&self, frame: i64) -> bool {
        match self.state.frames.get(&frame) {
            Some(ids) => {
                !ids.is_empty() && ids.iter().all(|id| self.state.entries.contains_key(id))
            }
            None => false,
        }
    }

    /// Contiguous runs of fully-cached frames, for cache-bar style
    /// diagnostics.
    pub fn cached_ranges(&self) -> Vec<(i64, i64)> {
        let mut ranges: Vec<(i64, i64)> = Vec::new();

        for (&frame, ids) in &self.state.frames {
            let cached =
                !ids.is_empty() && ids.iter().all(|id| self.state.entries.contains_key(id));
            if !cached {
                continue;
            }

            match ranges.last_mut() {
                Some((_, end)) if *end + 1 == frame => *end = frame,
                _ => ranges.push((frame, frame)),
            }
        }

        ranges
    }

    /// Flush every identifier recorded for `frame` and drop the frame
    /// record. Returns how many buffers were actually deleted.
    pub fn flush_frame(&mut self, frame: i64) -> usize {
        let ids = self.state.frames.remove(&frame).unwrap_or_default();
        let mut flushed = 0;
        for id in ids {
            if self.flush(&id) {
                flushed += 1;
            }
        }
        flushed
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            capacity: self.state.budget,
            used: self.state.current,
            entry_count: self.state.entries.len(),
            staged_count: self.state.staging.len(),
            hits: self.state.hits,
            misses: self.state.misses,
            evictions: self.state.evictions,
        }
    }

    fn verify_owned(&self, buffer: &Arc<FrameBuffer>) -> Result<(), CacheError> {
        match self.state.entries.get(buffer.identifier()) {
            Some(entry) if Arc::ptr_eq(entry, buffer) => Ok(()),
            _ => Err(CacheError::mismatch(buffer.identifier())),
        }
    }

    fn checkout_owned(&mut self, buffer: &Arc<FrameBuffer>) {
        self.state.retrieve_tick += 1;
        buffer.stamp_retrieval(self.state.retrieve_tick);
        let refs = buffer.retain();
        if refs > 1 {
            self.state.staging.unstage(buffer);
        }
    }

    /// Make room for `bytes` by evicting staged victims, oldest first.
    ///
    /// Evicts nothing unless staging can cover the whole shortfall, so a
    /// failed non-forced `add` leaves the cache untouched.
    fn make_room(&mut self, bytes: usize) -> bool {
        let shortfall = (self.state.current + bytes).saturating_sub(self.state.budget);
        if shortfall == 0 {
            return true;
        }
        if self.state.staging.staged_bytes() < shortfall {
            return false;
        }
        self.free_trash(shortfall)
    }

    /// The delete path everything routes through.
    ///
    /// Deleting a master also removes and deletes every still-cached tile
    /// registered against it; deleting a tile unregisters it from its
    /// master's proxy list without touching the master. A tile already
    /// deleted earlier is skipped, never double-freed. Returns the bytes
    /// freed, tiles included.
    ///
    /// The caller removes `buffer` itself from the map and staging.
    fn delete_cascade(&mut self, buffer: &Arc<FrameBuffer>) -> usize {
        let mut freed = buffer.total_size();

        for proxy in buffer.take_proxies() {
            let cached = matches!(
                self.state.entries.get(proxy.identifier()),
                Some(entry) if Arc::ptr_eq(entry, &proxy)
            );
            if cached {
                self.state.entries.remove(proxy.identifier());
                self.state.staging.unstage(&proxy);
                freed += proxy.total_size();
                proxy.reset_cache_state();
                trace!(identifier = proxy.identifier(), "cascade deleted tile");
            }
        }

        if let Some(master) = buffer.proxy_owner() {
            master.unregister_proxy(buffer);
        }

        buffer.reset_cache_state();
        freed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(id: &str, size: usize) -> Arc<FrameBuffer> {
        FrameBuffer::new(id, vec![0u8; size])
    }

    // Stage a buffer the way real code does: check it out, check it back in.
    fn stage(cache: &FrameCache, id: &str) {
        let fb = cache.check_out(id).expect("buffer should be cached");
        cache.check_in(&fb).expect("checkin should succeed");
    }

    #[test]
    fn add_within_budget_does_not_stage() {
        let cache = FrameCache::new(250);
        let a = buffer("A", 100);

        assert!(cache.add(Arc::clone(&a), false));
        assert_eq!(cache.used(), 100);
        assert_eq!(a.cache_reference_count(), 1);
        assert_eq!(cache.stats().staged_count, 0);
    }

    #[test]
    fn checkout_bumps_refcount_and_unstages() {
        let cache = FrameCache::new(250);
        cache.add(buffer("A", 100), false);
        stage(&cache, "A");
        assert_eq!(cache.stats().staged_count, 1);

        let a = cache.check_out("A").unwrap();
        assert_eq!(a.cache_reference_count(), 2);
        assert_eq!(cache.stats().staged_count, 0);
        assert!(cache.is_cached("A"));
    }

    #[test]
    fn checkin_to_one_reference_stages() {
        let cache = FrameCache::new(250);
        cache.add(buffer("A", 100), false);

        let a = cache.check_out("A").unwrap();
        cache.check_in(&a).unwrap();

        assert_eq!(a.cache_reference_count(), 1);
        assert_eq!(cache.stats().staged_count, 1);
        assert!(cache.is_cached("A"));
    }

    #[test]
    fn flush_deletes_unreferenced_buffer() {
        let cache = FrameCache::new(250);
        cache.add(buffer("A", 100), false);
        stage(&cache, "A");

        assert!(cache.flush("A"));
        assert_eq!(cache.used(), 0);
        assert!(!cache.is_cached("A"));
        assert_eq!(cache.stats().staged_count, 0);
    }

    #[test]
    fn flush_refuses_while_checked_out() {
        let cache = FrameCache::new(250);
        cache.add(buffer("A", 100), false);
        let a = cache.check_out("A").unwrap();

        assert!(!cache.flush("A"));
        assert!(cache.is_cached("A"));
        assert_eq!(cache.used(), 100);

        cache.check_in(&a).unwrap();
        assert!(cache.flush("A"));
    }

    #[test]
    fn flush_on_unknown_identifier_is_false() {
        let cache = FrameCache::new(250);
        assert!(!cache.flush("nope"));
    }

    #[test]
    fn add_evicts_staged_victim_to_fit() {
        let cache = FrameCache::new(150);
        cache.add(buffer("A", 100), false);
        stage(&cache, "A");

        assert!(cache.add(buffer("B", 80), false));
        assert_eq!(cache.used(), 80);
        assert!(!cache.is_cached("A"));
        assert!(cache.is_cached("B"));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn rejected_add_leaves_state_untouched() {
        let cache = FrameCache::new(150);
        cache.add(buffer("A", 100), false);
        // A is checked out by the map only but NOT staged, so nothing is
        // evictable.
        let before = cache.stats();

        assert!(!cache.add(buffer("B", 80), false));

        let after = cache.stats();
        assert_eq!(after.used, before.used);
        assert_eq!(after.entry_count, before.entry_count);
        assert_eq!(after.evictions, before.evictions);
        assert!(!cache.is_cached("B"));
    }

    #[test]
    fn forced_add_overflows_budget_and_reports_it() {
        let cache = FrameCache::new(150);
        cache.add(buffer("A", 100), false);

        // Nothing staged, no room: force it in anyway.
        assert!(!cache.add(buffer("B", 80), true));
        assert!(cache.is_cached("B"));
        assert_eq!(cache.used(), 180);
        assert!(cache.is_full());
    }

    #[test]
    fn add_replaces_existing_identifier() {
        let cache = FrameCache::new(1000);
        let old = buffer("A", 100);
        cache.add(Arc::clone(&old), false);
        stage(&cache, "A");

        let new = buffer("A", 300);
        assert!(cache.add(Arc::clone(&new), false));

        assert_eq!(cache.used(), 300);
        assert_eq!(cache.entry_count(), 1);
        assert!(!old.in_cache());
        let resolved = cache.check_out("A").unwrap();
        assert!(Arc::ptr_eq(&resolved, &new));
    }

    #[test]
    fn master_delete_cascades_to_tiles() {
        let cache = FrameCache::new(1000);
        let master = buffer("M", 50);
        let p1 = FrameBuffer::tile_of(&master, "P1", 20);
        let p2 = FrameBuffer::tile_of(&master, "P2", 30);

        cache.add(Arc::clone(&master), false);
        cache.add(Arc::clone(&p1), false);
        cache.add(Arc::clone(&p2), false);
        assert_eq!(cache.used(), 100);

        assert!(cache.flush("M"));

        assert_eq!(cache.used(), 0);
        assert!(!cache.is_cached("M"));
        assert!(!cache.is_cached("P1"));
        assert!(!cache.is_cached("P2"));
        assert!(!p1.in_cache());
        assert!(!p2.in_cache());
    }

    #[test]
    fn tile_deleted_before_master_is_not_double_freed() {
        let cache = FrameCache::new(1000);
        let master = buffer("M", 50);
        let p1 = FrameBuffer::tile_of(&master, "P1", 20);

        cache.add(Arc::clone(&master), false);
        cache.add(Arc::clone(&p1), false);

        // Delete the tile first; it unregisters from the master.
        assert!(cache.flush("P1"));
        assert_eq!(cache.used(), 50);
        assert!(master.proxies().is_empty());

        // The cascade finds no still-cached tiles and frees only the master.
        assert!(cache.flush("M"));
        assert_eq!(cache.used(), 0);
    }

    #[test]
    fn foreign_buffer_is_a_mismatch() {
        let cache = FrameCache::new(250);
        let other = FrameCache::new(250);
        let a = buffer("A", 10);
        other.add(Arc::clone(&a), false);

        assert!(matches!(
            cache.check_out_buffer(&a),
            Err(CacheError::Mismatch { .. })
        ));
        assert!(matches!(
            cache.check_in(&a),
            Err(CacheError::Mismatch { .. })
        ));
    }

    #[test]
    fn evicted_buffer_is_a_mismatch() {
        let cache = FrameCache::new(250);
        let a = buffer("A", 10);
        cache.add(Arc::clone(&a), false);
        stage(&cache, "A");
        assert!(cache.flush("A"));

        assert!(matches!(
            cache.check_out_buffer(&a),
            Err(CacheError::Mismatch { .. })
        ));
    }

    #[test]
    fn clear_preserves_locked_buffers() {
        let cache = FrameCache::new(1000);
        let a = buffer("A", 100);
        let b = buffer("B", 200);
        cache.add(Arc::clone(&a), false);
        cache.add(Arc::clone(&b), false);
        cache.lock_buffer(&a).unwrap();

        cache.clear();

        assert!(cache.is_cached("A"));
        assert!(!cache.is_cached("B"));
        assert_eq!(cache.used(), 100);
        assert!(!b.in_cache());

        cache.unlock_buffer(&a).unwrap();
        cache.clear();
        assert_eq!(cache.used(), 0);
    }

    #[test]
    fn flush_refuses_locked_buffer() {
        let cache = FrameCache::new(250);
        let a = buffer("A", 100);
        cache.add(Arc::clone(&a), false);
        stage(&cache, "A");
        cache.lock_buffer(&a).unwrap();

        assert!(!cache.flush("A"));
        assert!(cache.is_cached("A"));
        assert_eq!(cache.used(), 100);

        cache.unlock_buffer(&a).unwrap();
        assert!(cache.flush("A"));
        assert!(!cache.is_cached("A"));
    }

    #[test]
    fn locked_buffer_survives_eviction() {
        let cache = FrameCache::new(250);
        let a = buffer("A", 100);
        cache.add(Arc::clone(&a), false);
        stage(&cache, "A");
        cache.lock_buffer(&a).unwrap();

        // Nothing is evictable while the only candidate is pinned.
        assert!(!cache.free_trash(100));
        assert!(cache.is_cached("A"));
        assert!(a.is_locked());

        cache.unlock_buffer(&a).unwrap();
        assert!(cache.free_trash(100));
        assert!(!cache.is_cached("A"));
    }

    #[test]
    fn locking_removes_buffer_from_staging() {
        let cache = FrameCache::new(1000);
        let a = buffer("A", 100);
        cache.add(Arc::clone(&a), false);
        stage(&cache, "A");
        assert_eq!(cache.stats().staged_count, 1);

        cache.lock_buffer(&a).unwrap();
        assert_eq!(cache.stats().staged_count, 0);

        // Checkin while locked must not stage either.
        cache.check_out_buffer(&a).unwrap();
        cache.check_in(&a).unwrap();
        assert_eq!(cache.stats().staged_count, 0);

        cache.unlock_buffer(&a).unwrap();
        assert_eq!(cache.stats().staged_count, 1);
    }

    #[test]
    fn checkin_to_zero_cannot_delete_locked_buffer() {
        let cache = FrameCache::new(250);
        let a = buffer("A", 100);
        cache.add(Arc::clone(&a), false);
        let held = cache.check_out("A").unwrap();
        cache.lock_buffer(&held).unwrap();

        // Even driving the reference count to zero must not delete a
        // pinned buffer; the map's own reference is restored.
        cache.check_in(&held).unwrap();
        cache.check_in(&held).unwrap();

        assert!(cache.is_cached("A"));
        assert_eq!(a.cache_reference_count(), 1);
        assert_eq!(cache.used(), 100);

        cache.unlock_buffer(&a).unwrap();
        assert!(cache.flush("A"));
    }

    #[test]
    fn budget_resize_does_not_evict_locked_buffer() {
        let cache = FrameCache::new(1000);
        let a = buffer("A", 400);
        cache.add(Arc::clone(&a), false);
        stage(&cache, "A");
        cache.add(buffer("B", 400), false);
        stage(&cache, "B");
        cache.lock_buffer(&a).unwrap();

        cache.set_byte_budget(500);

        // Only the unpinned buffer was reclaimable.
        assert!(cache.is_cached("A"));
        assert!(!cache.is_cached("B"));
        assert_eq!(cache.used(), 400);
    }

    #[test]
    fn eviction_is_fifo_by_staging_order_not_recency() {
        let cache = FrameCache::new(1000);
        cache.add(buffer("A", 100), false);
        cache.add(buffer("B", 100), false);
        stage(&cache, "A");
        stage(&cache, "B");

        // Touch A again: checkout + checkin re-stages it at the back.
        stage(&cache, "A");

        // A now sits behind B in staging order despite being more recent.
        assert!(cache.free_trash(100));
        assert!(!cache.is_cached("B"));
        assert!(cache.is_cached("A"));
    }

    #[test]
    fn retrieval_order_is_stamped_per_checkout() {
        let cache = FrameCache::new(1000);
        cache.add(buffer("A", 10), false);
        cache.add(buffer("B", 10), false);

        let a = cache.check_out("A").unwrap();
        let b = cache.check_out("B").unwrap();
        assert!(b.retrieval_order() > a.retrieval_order());

        cache.check_in(&a).unwrap();
        let a2 = cache.check_out("A").unwrap();
        assert!(a2.retrieval_order() > b.retrieval_order());
        cache.check_in(&a2).unwrap();
        cache.check_in(&b).unwrap();
    }

    #[test]
    fn set_byte_budget_evicts_to_fit() {
        let cache = FrameCache::new(1000);
        cache.add(buffer("A", 400), false);
        cache.add(buffer("B", 400), false);
        stage(&cache, "A");
        stage(&cache, "B");

        cache.set_byte_budget(500);

        assert!(cache.used() <= 500);
        assert!(!cache.is_cached("A"));
        assert!(cache.is_cached("B"));
        assert!(cache.is_full() || cache.used() < 500);
    }

    #[test]
    fn frame_bookkeeping_and_ranges() {
        let cache = FrameCache::new(1000);
        for (frame, id) in [(1, "f1"), (2, "f2"), (3, "f3"), (5, "f5")] {
            let fb = buffer(id, 10);
            cache.add(Arc::clone(&fb), false);
            cache.reference_frame(frame, &fb).unwrap();
        }

        assert!(cache.frame_is_cached(2));
        assert!(!cache.frame_is_cached(4));
        assert_eq!(cache.cached_ranges(), vec![(1, 3), (5, 5)]);

        // Evicting frame 2's buffer splits the range.
        stage(&cache, "f2");
        assert!(cache.flush("f2"));
        assert!(!cache.frame_is_cached(2));
        assert_eq!(cache.cached_ranges(), vec![(1, 1), (3, 3), (5, 5)]);
    }

    #[test]
    fn flush_frame_deletes_what_it_can() {
        let cache = FrameCache::new(1000);
        let a = buffer("A", 10);
        let b = buffer("B", 10);
        cache.add(Arc::clone(&a), false);
        cache.add(Arc::clone(&b), false);
        cache.reference_frame(7, &a).unwrap();
        cache.reference_frame(7, &b).unwrap();

        // B is checked out, so only A goes.
        let held = cache.check_out("B").unwrap();
        assert_eq!(cache.flush_frame(7), 1);
        assert!(!cache.is_cached("A"));
        assert!(cache.is_cached("B"));
        cache.check_in(&held).unwrap();
    }

    #[test]
    fn stats_track_hits_misses_and_utilization() {
        let cache = FrameCache::new(200);
        cache.add(buffer("A", 100), false);

        let a = cache.check_out("A").unwrap();
        let _ = cache.check_out("missing");

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hit_rate(), 0.5);
        assert_eq!(stats.utilization(), 0.5);
        cache.check_in(&a).unwrap();
    }

    #[test]
    fn emergency_free_reclaims_when_over_budget() {
        let cache = FrameCache::new(100);
        cache.add(buffer("A", 80), false);
        // Nothing staged yet, so B has to be forced over budget.
        assert!(!cache.add(buffer("B", 80), true));
        assert_eq!(cache.used(), 160);

        // Once victims are staged, emergency_free brings usage back down.
        stage(&cache, "A");
        stage(&cache, "B");
        cache.emergency_free();
        assert!(cache.used() <= cache.capacity());
        assert!(cache.is_cached("B"));
    }

    #[test]
    fn accounting_matches_entry_sizes_under_churn() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let cache = FrameCache::new(4096);
        let mut rng = StdRng::seed_from_u64(7);
        let mut held: Vec<Arc<FrameBuffer>> = Vec::new();

        for step in 0..500 {
            match rng.gen_range(0..4) {
                0 => {
                    let id = format!("buf-{}", rng.gen_range(0..32));
                    let size = rng.gen_range(1..256);
                    cache.add(buffer(&id, size), false);
                }
                1 => {
                    let id = format!("buf-{}", rng.gen_range(0..32));
                    if let Some(fb) = cache.check_out(&id) {
                        held.push(fb);
                    }
                }
                2 => {
                    if !held.is_empty() {
                        let fb = held.swap_remove(rng.gen_range(0..held.len()));
                        // May fail if the entry was replaced meanwhile.
                        let _ = cache.check_in(&fb);
                    }
                }
                _ => {
                    let id = format!("buf-{}", rng.gen_range(0..32));
                    cache.flush(&id);
                }
            }

            // The byte accounting must always equal the sum of entry sizes.
            let guard = cache.lock();
            let expected: usize = guard
                .state
                .entries
                .values()
                .map(|fb| fb.total_size())
                .sum();
            assert_eq!(guard.used(), expected, "accounting drift at step {step}");
            for fb in guard.state.entries.values() {
                assert!(fb.cache_reference_count() >= 1);
            }
            drop(guard);
        }
    }
}
