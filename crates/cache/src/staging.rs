//! Eviction staging: the FIFO holding area for unreferenced cached buffers
//!
//! A buffer whose cache reference count drops back to one (the cache map's
//! own reference) is still addressable by identifier but has no live
//! consumer. Those buffers are staged here, and the cache pulls eviction
//! victims from the front when it needs to reclaim bytes.
//!
//! Order is strictly first-staged, first-evicted. Retrieval recency is
//! deliberately not consulted. Pixel-locked buffers are never staged; the
//! cache unstages a buffer when its lock is taken.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use crate::buffer::FrameBuffer;

/// FIFO of cached-but-unreferenced buffers, with O(1) membership testing.
///
/// Staging holds no byte-size policy of its own; the cache decides how many
/// victims to pull.
#[derive(Debug, Default)]
pub struct EvictionStaging {
    order: VecDeque<Arc<FrameBuffer>>,
    members: HashSet<String>,
}

impl EvictionStaging {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage a buffer at the back. Idempotent: a buffer already staged keeps
    /// its position.
    pub fn stage(&mut self, buffer: &Arc<FrameBuffer>) {
        if self.members.insert(buffer.identifier().to_owned()) {
            self.order.push_back(Arc::clone(buffer));
        }
    }

    /// Remove a buffer, wherever it sits. Idempotent.
    pub fn unstage(&mut self, buffer: &Arc<FrameBuffer>) {
        if self.members.remove(buffer.identifier()) {
            self.order.retain(|staged| !Arc::ptr_eq(staged, buffer));
        }
    }

    pub fn contains(&self, buffer: &Arc<FrameBuffer>) -> bool {
        self.members.contains(buffer.identifier())
    }

    /// Remove and return the oldest-staged buffer.
    pub fn evict_oldest(&mut self) -> Option<Arc<FrameBuffer>> {
        let oldest = self.order.pop_front()?;
        self.members.remove(oldest.identifier());
        Some(oldest)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Total bytes that could be reclaimed by evicting everything staged.
    pub fn staged_bytes(&self) -> usize {
        self.order.iter().map(|b| b.total_size()).sum()
    }
}
