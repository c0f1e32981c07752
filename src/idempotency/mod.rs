//! Duplicate-execution suppression keyed by content-derived hashes.

mod cache;
mod key;
mod store;

pub use cache::{IdempotencyCache, IdempotencyRecord};
pub use key::{canonical_parameters, derive_key};
pub use store::{CacheStore, JsonlCacheStore};
