//! Sciflow Memory - plan cache and working memory
//!
//! - [`PlanCache`]: LRU memo of generated plans keyed by [`PlanKey`]
//! - [`WorkingMemory`]: append-only, keyword-searchable interaction log
//! - [`MemoryStore`]: durable backend, JSON file by default

pub mod cache;
pub mod entry;
pub mod error;
pub mod key;
pub mod store;
pub mod working;

pub use cache::{CacheStats, PlanCache};
pub use entry::MemoryEntry;
pub use error::MemoryError;
pub use key::PlanKey;
pub use store::{InMemoryStore, JsonFileStore, MemoryStore};
pub use working::WorkingMemory;
