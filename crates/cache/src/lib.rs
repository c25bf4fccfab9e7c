//! Frameview Cache Library
//!
//! Content-addressable frame buffer cache with byte-budget eviction,
//! checkout/checkin reference counting, and tile (proxy) aliasing.

pub mod buffer;
pub mod cache;
pub mod config;
pub mod error;
pub mod staging;

pub use buffer::{Attribute, FrameBuffer};
pub use cache::{CacheStats, FrameCache, FrameCacheGuard};
pub use config::{CacheConfig, ConfigError};
pub use error::CacheError;
pub use staging::EvictionStaging;
