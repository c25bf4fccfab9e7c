//! Frameview Graph Library
//!
//! Cache-aware lazy graph evaluation: identifier trees probe the cache
//! cheaply, image trees materialize only on miss.

pub mod node;
pub mod tree;

pub use node::{
    CacheAwareNode, EvalContext, EvalError, EvalMode, FrameResult, GraphNode, ATTR_SOURCE,
    ATTR_TRANSFORM_MATRIX,
};
pub use tree::{IdentifierNode, IdentifierTree, ImageNode, ImageTree, NodeIndex, SourceBinding};
