//! Cache-aware graph evaluation
//!
//! [`CacheAwareNode`] wraps an upstream [`GraphNode`] and answers frame
//! requests through the cache whenever it can. A request first asks the
//! upstream node for an identifier tree and tries to resolve every
//! identifier from the cache; only if something misses does the expensive
//! evaluation run, after which the fresh buffers are reconciled back into
//! the cache so the next request hits.
//!
//! The resolve window and the reconcile window each run under one cache
//! guard. Evaluation itself runs outside the lock, so two threads can race
//! to compute the same identifier; the race is settled at insert time by
//! re-checking the cache and discarding the loser's duplicate work.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, trace, warn};

use frameview_cache::{Attribute, CacheError, FrameBuffer, FrameCache};

use crate::tree::{IdentifierTree, ImageTree, SourceBinding};

/// Buffer attribute naming the render source that produced the pixels.
pub const ATTR_SOURCE: &str = "Source";
/// Buffer attribute carrying a row-major 4x4 transform as 16 floats.
pub const ATTR_TRANSFORM_MATRIX: &str = "TransformMatrix";

/// How a frame request is allowed to interact with the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalMode {
    /// On-demand display: evaluate on miss, force results into the cache
    /// even past the budget rather than drop an in-flight frame.
    Display,
    /// Background cache filling: evaluate on miss, but if the cache cannot
    /// absorb the results the whole frame is unwound and the request fails
    /// with [`EvalError::CacheFull`] so the scheduler can retry later.
    CacheFill,
    /// Read-only consultation: never evaluate; a miss is
    /// [`EvalError::CacheMiss`].
    NoEval,
}

/// Per-request evaluation parameters.
#[derive(Debug, Clone, Copy)]
pub struct EvalContext {
    pub frame: i64,
    /// Request a placeholder instead of real content. Set internally on
    /// the degraded retry after an upstream failure.
    pub missing: bool,
    pub mode: EvalMode,
}

impl EvalContext {
    pub fn new(frame: i64, mode: EvalMode) -> Self {
        Self {
            frame,
            missing: false,
            mode,
        }
    }
}

/// The contract an upstream graph node must satisfy.
pub trait GraphNode: Send + Sync {
    /// Report the shape of a prospective evaluation as identifiers only.
    fn evaluate_identifier(&self, context: &EvalContext) -> Result<IdentifierTree, EvalError>;

    /// Produce the real image tree. `context.missing` requests a
    /// placeholder stand-in.
    fn evaluate(&self, context: &EvalContext) -> Result<ImageTree, EvalError>;
}

#[derive(Debug, Error)]
pub enum EvalError {
    /// Background cache filling could not retain a consistent frame even
    /// with forced insertion; the fresh results were fully unwound.
    #[error("cache cannot absorb freshly evaluated frame")]
    CacheFull,
    /// A read-only request found the frame not fully cached.
    #[error("frame is not fully cached and evaluation is disabled")]
    CacheMiss,
    /// The upstream node failed to produce an identifier tree, in both the
    /// real and the placeholder attempt.
    #[error("identifier evaluation failed: {0}")]
    Identify(String),
    /// The upstream node failed to evaluate, in both the real and the
    /// placeholder attempt.
    #[error("upstream evaluation failed: {0}")]
    Upstream(String),
    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// Outcome of a successful frame request.
#[derive(Debug)]
pub enum FrameResult {
    /// Every identifier resolved from the cache; no evaluation ran.
    Hit(ImageTree),
    /// At least one identifier missed; the frame was evaluated and its
    /// buffers reconciled into the cache.
    MissResolved(ImageTree),
}

impl FrameResult {
    pub fn tree(&self) -> &ImageTree {
        match self {
            FrameResult::Hit(tree) | FrameResult::MissResolved(tree) => tree,
        }
    }

    pub fn into_tree(self) -> ImageTree {
        match self {
            FrameResult::Hit(tree) | FrameResult::MissResolved(tree) => tree,
        }
    }

    pub fn is_hit(&self) -> bool {
        matches!(self, FrameResult::Hit(_))
    }
}

/// Orchestrator resolving identifier trees against the cache and falling
/// back to full upstream evaluation on miss.
pub struct CacheAwareNode<N: GraphNode> {
    upstream: N,
    cache: Arc<FrameCache>,
}

impl<N: GraphNode> CacheAwareNode<N> {
    pub fn new(upstream: N, cache: Arc<FrameCache>) -> Self {
        Self { upstream, cache }
    }

    pub fn cache(&self) -> &Arc<FrameCache> {
        &self.cache
    }

    /// Answer a frame request.
    ///
    /// Identify, resolve from cache, and on any miss evaluate upstream and
    /// reconcile. The returned tree holds checked-out buffers; return them
    /// with [`check_in_tree`](Self::check_in_tree) when done rendering.
    pub fn evaluate(&self, context: &EvalContext) -> Result<FrameResult, EvalError> {
        let mut context = *context;

        // Identify. A failure gets one degraded retry asking for a
        // placeholder; a second failure propagates.
        let id_tree = match self.upstream.evaluate_identifier(&context) {
            Ok(tree) => tree,
            Err(err) if !context.missing => {
                debug!(frame = context.frame, %err, "identify failed; retrying as missing");
                context.missing = true;
                self.upstream.evaluate_identifier(&context)?
            }
            Err(err) => return Err(err),
        };

        // Resolve. One guard covers the whole probe and its undo, so the
        // hit/miss decision is made against a consistent snapshot.
        let mut image = ImageTree::with_shape_of(&id_tree);
        {
            let mut guard = self.cache.lock();
            let mut resolved: Vec<Arc<FrameBuffer>> = Vec::new();
            let mut any_miss = false;

            for index in id_tree.walk() {
                let Some(id) = id_tree.node(index).id.as_deref() else {
                    continue;
                };
                match guard.check_out(id) {
                    Some(buffer) => {
                        resolved.push(Arc::clone(&buffer));
                        image.node_mut(index).buffer = Some(buffer);
                    }
                    None => any_miss = true,
                }
            }

            if !any_miss {
                // Fast path: re-register every buffer against this frame so
                // frame bookkeeping stays correct without a fresh evaluation.
                for buffer in &resolved {
                    guard.reference_frame(context.frame, buffer)?;
                }
                drop(guard);
                trace!(frame = context.frame, "frame resolved entirely from cache");
                self.mark_missing(&mut image, &context);
                self.assign_render_metadata(&mut image);
                return Ok(FrameResult::Hit(image));
            }

            // Undo the partial checkouts before leaving the guard.
            for buffer in &resolved {
                guard.check_in(buffer)?;
            }
        }

        if context.mode == EvalMode::NoEval {
            trace!(frame = context.frame, "miss on read-only request");
            return Err(EvalError::CacheMiss);
        }

        // Evaluate outside the lock; same degraded-retry policy as identify.
        let mut fresh = match self.upstream.evaluate(&context) {
            Ok(tree) => tree,
            Err(err) if !context.missing => {
                debug!(frame = context.frame, %err, "evaluate failed; retrying as missing");
                context.missing = true;
                self.upstream.evaluate(&context)?
            }
            Err(err) => return Err(err),
        };

        self.reconcile(&mut fresh, &context)?;
        self.mark_missing(&mut fresh, &context);
        self.assign_render_metadata(&mut fresh);
        Ok(FrameResult::MissResolved(fresh))
    }

    /// Return every buffer the tree holds to the cache. Buffers the cache
    /// no longer owns (replaced or cleared meanwhile) are skipped.
    pub fn check_in_tree(&self, tree: &ImageTree) {
        let mut guard = self.cache.lock();
        for buffer in tree.buffers() {
            if let Err(err) = guard.check_in(&buffer) {
                warn!(%err, "buffer no longer owned at tree check-in");
            }
        }
    }

    /// Flush every identifier the tree names, for targeted invalidation
    /// when an upstream parameter change makes a shape stale.
    pub fn flush_identifiers(&self, tree: &IdentifierTree) -> usize {
        let mut guard = self.cache.lock();
        tree.identifiers()
            .into_iter()
            .filter(|id| guard.flush(id))
            .count()
    }

    pub fn flush_frame(&self, frame: i64) -> usize {
        self.cache.flush_frame(frame)
    }

    /// Flush whatever `frame` would evaluate to. Not being able to produce
    /// an identifier tree just means there is nothing to flush.
    pub fn flush_frame_identifiers(&self, frame: i64) -> usize {
        let context = EvalContext::new(frame, EvalMode::NoEval);
        match self.upstream.evaluate_identifier(&context) {
            Ok(tree) => self.flush_identifiers(&tree),
            Err(_) => 0,
        }
    }

    /// Fold freshly evaluated buffers into the cache, one guard for the
    /// whole window.
    ///
    /// Per buffer: if the identifier got cached meanwhile (a concurrent
    /// evaluation won the race), the fresh duplicate is discarded and the
    /// cached copy used instead. Otherwise the buffer is force-added; in
    /// cache-fill mode a failure to fit escalates to `CacheFull` after
    /// unwinding everything retained so far.
    fn reconcile(&self, fresh: &mut ImageTree, context: &EvalContext) -> Result<(), EvalError> {
        let mut guard = self.cache.lock();
        let mut retained: Vec<Arc<FrameBuffer>> = Vec::new();
        let mut overflowed = false;

        for index in fresh.walk() {
            let Some(produced) = fresh.node(index).buffer.clone() else {
                continue;
            };

            if let Some(cached) = guard.check_out(produced.identifier()) {
                if !Arc::ptr_eq(&cached, &produced) {
                    trace!(
                        identifier = produced.identifier(),
                        "discarding duplicate evaluation result"
                    );
                    fresh.node_mut(index).buffer = Some(Arc::clone(&cached));
                }
                guard.reference_frame(context.frame, &cached)?;
                retained.push(cached);
                continue;
            }

            if guard.is_full() {
                guard.emergency_free();
            }
            if !guard.add(Arc::clone(&produced), true) {
                overflowed = true;
            }
            guard.check_out_buffer(&produced)?;
            guard.reference_frame(context.frame, &produced)?;
            retained.push(produced);
        }

        if overflowed && context.mode == EvalMode::CacheFill {
            debug!(
                frame = context.frame,
                "cache cannot absorb frame; unwinding fresh results"
            );
            for buffer in &retained {
                let _ = guard.check_in(buffer);
                guard.flush(buffer.identifier());
            }
            return Err(EvalError::CacheFull);
        }

        Ok(())
    }

    fn mark_missing(&self, tree: &mut ImageTree, context: &EvalContext) {
        if !context.missing {
            return;
        }
        for index in tree.walk() {
            let node = tree.node_mut(index);
            node.missing = true;
            node.missing_frame = Some(context.frame);
        }
    }

    /// Forward render metadata from the buffers onto the tree,
    /// unconditionally: cache-resolved buffers must never surface stale
    /// bindings from a prior pass.
    fn assign_render_metadata(&self, tree: &mut ImageTree) {
        for index in tree.walk() {
            let node = tree.node_mut(index);
            let Some(buffer) = node.buffer.clone() else {
                node.transform = None;
                node.binding = None;
                continue;
            };

            node.transform = buffer
                .attribute(ATTR_TRANSFORM_MATRIX)
                .and_then(|attr| attr.as_matrix());
            node.binding = match buffer.attribute(ATTR_SOURCE) {
                Some(Attribute::Str(source)) => Some(SourceBinding {
                    source,
                    identifier: buffer.identifier().to_owned(),
                }),
                _ => None,
            };
        }
    }
}
