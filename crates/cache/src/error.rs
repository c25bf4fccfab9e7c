//! Cache error taxonomy
//!
//! Expected outcomes are not errors here: a lookup miss is `None`, a
//! capacity-rejected `add` is `false`. The only error the cache itself
//! raises is a caller handing it a buffer it does not own, which is a
//! programmer error rather than a runtime condition to recover from.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// A buffer was checked in or out against a cache that does not own it
    /// (wrong cache instance, or the buffer was already evicted).
    #[error("buffer `{identifier}` is not owned by this cache")]
    Mismatch { identifier: String },
}

impl CacheError {
    pub(crate) fn mismatch(identifier: &str) -> Self {
        CacheError::Mismatch {
            identifier: identifier.to_owned(),
        }
    }
}
