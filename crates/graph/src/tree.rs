//! Identifier and image trees
//!
//! Evaluation is two-phase: upstream nodes first report the *shape* of what
//! they would produce as a tree of content identifiers (cheap), and only if
//! the cache cannot satisfy that shape is a tree of real images materialized
//! (expensive). Both trees are arenas: nodes live in a vector and refer to
//! each other by index, with ordered child lists. An [`ImageTree`] built
//! with [`ImageTree::with_shape_of`] shares its index space with the
//! identifier tree it mirrors, so one traversal can read the identifier and
//! write the resolved image at the same index.
//!
//! Traversal order is pre-order, siblings in list order. Every consumer
//! (resolve, reconcile, metadata assignment) walks in this same order, so
//! processing is deterministic for a given tree shape.

use std::sync::Arc;

use frameview_cache::FrameBuffer;

/// Index of a node within its tree's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeIndex(usize);

/// One node of an [`IdentifierTree`].
#[derive(Debug, Clone)]
pub struct IdentifierNode {
    /// Content identifier this node would evaluate to, or `None` for pure
    /// structural nodes (groups, layouts) that own no pixels.
    pub id: Option<String>,
    /// The upstream node asked for this image to be composed in place
    /// rather than cached as an intermediate.
    pub no_intermediate: bool,
    children: Vec<NodeIndex>,
}

/// A tree of content identifiers mirroring the shape of a prospective
/// evaluation, used to probe the cache without materializing buffers.
///
/// Built fresh per evaluation request and discarded once resolved.
#[derive(Debug, Clone, Default)]
pub struct IdentifierTree {
    nodes: Vec<IdentifierNode>,
    root: Option<NodeIndex>,
}

impl IdentifierTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a node to the arena. The first node added becomes the root
    /// unless [`set_root`](Self::set_root) says otherwise.
    pub fn add_node(&mut self, id: Option<String>, no_intermediate: bool) -> NodeIndex {
        let index = NodeIndex(self.nodes.len());
        self.nodes.push(IdentifierNode {
            id,
            no_intermediate,
            children: Vec::new(),
        });
        if self.root.is_none() {
            self.root = Some(index);
        }
        index
    }

    /// Append `child` to `parent`'s ordered child list.
    pub fn add_child(&mut self, parent: NodeIndex, child: NodeIndex) {
        self.nodes[parent.0].children.push(child);
    }

    pub fn set_root(&mut self, root: NodeIndex) {
        self.root = Some(root);
    }

    pub fn root(&self) -> Option<NodeIndex> {
        self.root
    }

    pub fn node(&self, index: NodeIndex) -> &IdentifierNode {
        &self.nodes[index.0]
    }

    pub fn children(&self, index: NodeIndex) -> &[NodeIndex] {
        &self.nodes[index.0].children
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Pre-order traversal, siblings in child-list order.
    pub fn walk(&self) -> Vec<NodeIndex> {
        preorder(self.root, |index| self.nodes[index.0].children.as_slice())
    }

    /// Every identifier in the tree, in traversal order.
    pub fn identifiers(&self) -> Vec<&str> {
        self.walk()
            .into_iter()
            .filter_map(|index| self.nodes[index.0].id.as_deref())
            .collect()
    }
}

/// Binding from a resolved image back to the render source that displays
/// it. Pass-through for the renderer; the cache core does not interpret it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceBinding {
    /// Name of the source node the pixels came from.
    pub source: String,
    /// Content identifier of the bound buffer.
    pub identifier: String,
}

/// One node of an [`ImageTree`].
#[derive(Debug, Clone, Default)]
pub struct ImageNode {
    /// The resolved pixels, if this node carries any. Storage lifetime is
    /// owned by the cache once checked in; dropping the tree never deletes
    /// a cached buffer.
    pub buffer: Option<Arc<FrameBuffer>>,
    /// This node renders a placeholder instead of real content.
    pub missing: bool,
    /// The frame the placeholder stands in for.
    pub missing_frame: Option<i64>,
    pub no_intermediate: bool,
    /// Row-major 4x4 transform forwarded from the buffer's producer.
    pub transform: Option<[f32; 16]>,
    pub binding: Option<SourceBinding>,
    children: Vec<NodeIndex>,
}

impl ImageNode {
    /// A childless node carrying a resolved buffer.
    pub fn with_buffer(buffer: Arc<FrameBuffer>) -> Self {
        Self {
            buffer: Some(buffer),
            ..Self::default()
        }
    }
}

/// The materialized tree of evaluated images.
///
/// A transient view: the creator drops it when done, after returning its
/// checked-out buffers to the cache.
#[derive(Debug, Clone, Default)]
pub struct ImageTree {
    nodes: Vec<ImageNode>,
    root: Option<NodeIndex>,
}

impl ImageTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an empty image tree with the same arena layout as `shape`:
    /// same node count, same child lists, same root, so a [`NodeIndex`]
    /// addresses the matching node in either tree.
    pub fn with_shape_of(shape: &IdentifierTree) -> Self {
        let nodes = shape
            .nodes
            .iter()
            .map(|node| ImageNode {
                no_intermediate: node.no_intermediate,
                children: node.children.clone(),
                ..ImageNode::default()
            })
            .collect();
        Self {
            nodes,
            root: shape.root,
        }
    }

    pub fn add_node(&mut self, node: ImageNode) -> NodeIndex {
        let index = NodeIndex(self.nodes.len());
        self.nodes.push(node);
        if self.root.is_none() {
            self.root = Some(index);
        }
        index
    }

    pub fn add_child(&mut self, parent: NodeIndex, child: NodeIndex) {
        self.nodes[parent.0].children.push(child);
    }

    pub fn set_root(&mut self, root: NodeIndex) {
        self.root = Some(root);
    }

    pub fn root(&self) -> Option<NodeIndex> {
        self.root
    }

    pub fn node(&self, index: NodeIndex) -> &ImageNode {
        &self.nodes[index.0]
    }

    pub fn node_mut(&mut self, index: NodeIndex) -> &mut ImageNode {
        &mut self.nodes[index.0]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Pre-order traversal, siblings in child-list order.
    pub fn walk(&self) -> Vec<NodeIndex> {
        preorder(self.root, |index| self.nodes[index.0].children.as_slice())
    }

    /// Every resolved buffer in the tree, in traversal order.
    pub fn buffers(&self) -> Vec<Arc<FrameBuffer>> {
        self.walk()
            .into_iter()
            .filter_map(|index| self.nodes[index.0].buffer.clone())
            .collect()
    }
}

fn preorder<'a>(
    root: Option<NodeIndex>,
    children: impl Fn(NodeIndex) -> &'a [NodeIndex],
) -> Vec<NodeIndex> {
    let mut order = Vec::new();
    let mut stack: Vec<NodeIndex> = root.into_iter().collect();

    while let Some(index) = stack.pop() {
        order.push(index);
        // Reversed so the first child is visited first.
        stack.extend(children(index).iter().rev());
    }

    order
}
