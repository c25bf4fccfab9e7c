//! Frame buffers: the large pixel payloads the cache manages
//!
//! A [`FrameBuffer`] is an opaque pixel allocation with a stable
//! content-derived identifier. The identifier is built by the producer from
//! everything that went into the pixels (source file, frame, conversion
//! parameters), so two buffers with the same identifier are interchangeable
//! and evaluation paths that happen to produce identical images share one
//! cache entry.
//!
//! Buffers are handed around as `Arc<FrameBuffer>`. The cache-side
//! bookkeeping (reference count, pixel lock, retrieval stamp) lives on the
//! buffer but is only ever mutated by [`FrameCache`](crate::FrameCache),
//! under its lock.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// A typed, named attribute attached to a frame buffer.
///
/// Producers use attributes to carry side-band data the cache core does not
/// interpret (the one exception being the transform matrix, which the
/// evaluation layer forwards onto resolved image nodes).
#[derive(Debug, Clone, PartialEq)]
pub enum Attribute {
    Str(String),
    Int(i64),
    Float(f64),
    FloatVec(Vec<f32>),
}

impl Attribute {
    /// Interpret this attribute as a 4x4 matrix in row-major order.
    ///
    /// Returns `None` unless it is a float vector of exactly 16 elements.
    pub fn as_matrix(&self) -> Option<[f32; 16]> {
        match self {
            Attribute::FloatVec(v) if v.len() == 16 => {
                let mut m = [0.0f32; 16];
                m.copy_from_slice(v);
                Some(m)
            }
            _ => None,
        }
    }
}

/// A reference-counted pixel payload with a stable content identifier.
///
/// A buffer is either a regular allocation (one or more planes of pixel
/// data) or a *tile*: a proxy whose storage aliases into another buffer's
/// allocation. A buffer that owns tiles is their *master*. Masters are never
/// themselves tiles, so the aliasing relation cannot form cycles; the tile's
/// back-reference to its master is weak.
#[derive(Debug)]
pub struct FrameBuffer {
    identifier: String,

    /// Pixel planes owned by this buffer (planar formats use several).
    planes: Vec<Vec<u8>>,

    /// For tiles: the number of bytes of the master allocation this tile
    /// spans. Counted independently of the master's own size.
    alias_span: usize,

    attributes: Mutex<BTreeMap<String, Attribute>>,

    /// Tiles whose data aliases into this buffer's allocation.
    proxies: Mutex<Vec<Arc<FrameBuffer>>>,

    /// Back-reference from a tile to its master. Non-owning.
    proxy_owner: Mutex<Weak<FrameBuffer>>,

    /// Number of live holders once cached: the cache map itself counts as
    /// one, each checkout adds one. Zero means "not in any cache".
    cache_ref: AtomicUsize,

    /// Pixel lock, orthogonal to the reference count. A locked buffer is
    /// never deleted by the cache, whatever its reference count says.
    cache_lock: AtomicUsize,

    /// Monotonic stamp of the most recent checkout, for diagnostics.
    retrieval: AtomicU64,
}

impl FrameBuffer {
    /// Create a single-plane buffer.
    pub fn new(identifier: impl Into<String>, pixels: Vec<u8>) -> Arc<Self> {
        Self::with_planes(identifier, vec![pixels])
    }

    /// Create a planar buffer. Its total size is the sum of all plane sizes.
    pub fn with_planes(identifier: impl Into<String>, planes: Vec<Vec<u8>>) -> Arc<Self> {
        Arc::new(Self {
            identifier: identifier.into(),
            planes,
            alias_span: 0,
            attributes: Mutex::new(BTreeMap::new()),
            proxies: Mutex::new(Vec::new()),
            proxy_owner: Mutex::new(Weak::new()),
            cache_ref: AtomicUsize::new(0),
            cache_lock: AtomicUsize::new(0),
            retrieval: AtomicU64::new(0),
        })
    }

    /// Create a tile aliasing `span_bytes` of `master`'s allocation and
    /// register it in the master's proxy list.
    ///
    /// The tile owns no pixels of its own; its `span_bytes` are still
    /// accounted independently by the cache, matching how the producer
    /// reported them when the tiles were carved out.
    ///
    /// A tile cannot serve as a master itself.
    pub fn tile_of(
        master: &Arc<FrameBuffer>,
        identifier: impl Into<String>,
        span_bytes: usize,
    ) -> Arc<Self> {
        debug_assert!(
            !master.is_proxy(),
            "tile master must not itself be a tile"
        );

        let tile = Arc::new(Self {
            identifier: identifier.into(),
            planes: Vec::new(),
            alias_span: span_bytes,
            attributes: Mutex::new(BTreeMap::new()),
            proxies: Mutex::new(Vec::new()),
            proxy_owner: Mutex::new(Arc::downgrade(master)),
            cache_ref: AtomicUsize::new(0),
            cache_lock: AtomicUsize::new(0),
            retrieval: AtomicU64::new(0),
        });

        master.proxies.lock().unwrap().push(Arc::clone(&tile));
        tile
    }

    /// The content identifier this buffer is cached under.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Total allocation size in bytes, including all owned planes. For a
    /// tile this is the span it covers in its master's allocation.
    pub fn total_size(&self) -> usize {
        if self.planes.is_empty() {
            self.alias_span
        } else {
            self.planes.iter().map(Vec::len).sum()
        }
    }

    /// Pixel data of the primary plane, if this buffer owns any.
    pub fn pixels(&self) -> Option<&[u8]> {
        self.planes.first().map(Vec::as_slice)
    }

    /// Number of live holders while cached. Zero when not in a cache.
    pub fn cache_reference_count(&self) -> usize {
        self.cache_ref.load(Ordering::Relaxed)
    }

    /// True once the buffer has been added to a cache and not yet deleted.
    pub fn in_cache(&self) -> bool {
        self.cache_reference_count() > 0
    }

    /// True while a consumer holds the pixel lock.
    pub fn is_locked(&self) -> bool {
        self.cache_lock.load(Ordering::Relaxed) > 0
    }

    /// Stamp of the most recent checkout. Diagnostics only; eviction order
    /// is staging order, not retrieval recency.
    pub fn retrieval_order(&self) -> u64 {
        self.retrieval.load(Ordering::Relaxed)
    }

    /// Look up an attribute by name.
    pub fn attribute(&self, name: &str) -> Option<Attribute> {
        self.attributes.lock().unwrap().get(name).cloned()
    }

    /// Attach or replace an attribute.
    pub fn set_attribute(&self, name: impl Into<String>, value: Attribute) {
        self.attributes.lock().unwrap().insert(name.into(), value);
    }

    /// Snapshot of the tiles registered against this buffer.
    pub fn proxies(&self) -> Vec<Arc<FrameBuffer>> {
        self.proxies.lock().unwrap().clone()
    }

    /// The master buffer this tile aliases into, if it is still alive.
    pub fn proxy_owner(&self) -> Option<Arc<FrameBuffer>> {
        self.proxy_owner.lock().unwrap().upgrade()
    }

    /// True if this buffer is a tile registered against a master.
    pub fn is_proxy(&self) -> bool {
        self.alias_span > 0 || self.proxy_owner().is_some()
    }

    // Cache-side bookkeeping. Only FrameCache calls these, under its lock;
    // the atomics just make concurrent *reads* well-defined.

    pub(crate) fn retain(&self) -> usize {
        self.cache_ref.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn release(&self) -> usize {
        self.cache_ref
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_sub(1))
            })
            .map(|n| n.saturating_sub(1))
            .unwrap_or(0)
    }

    pub(crate) fn reset_cache_state(&self) {
        self.cache_ref.store(0, Ordering::Relaxed);
    }

    pub(crate) fn increment_lock(&self) {
        self.cache_lock.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn decrement_lock(&self) {
        self.cache_lock
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_sub(1))
            })
            .ok();
    }

    pub(crate) fn stamp_retrieval(&self, tick: u64) {
        self.retrieval.store(tick, Ordering::Relaxed);
    }

    /// Drain this buffer's proxy list for the delete cascade.
    pub(crate) fn take_proxies(&self) -> Vec<Arc<FrameBuffer>> {
        std::mem::take(&mut *self.proxies.lock().unwrap())
    }

    /// Remove one tile from this buffer's proxy list, if present.
    pub(crate) fn unregister_proxy(&self, proxy: &Arc<FrameBuffer>) {
        self.proxies
            .lock()
            .unwrap()
            .retain(|p| !Arc::ptr_eq(p, proxy));
    }
}
