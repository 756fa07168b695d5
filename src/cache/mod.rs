//! Local response cache driven by server invalidations.

mod response;
mod store;

pub use response::{
  Index, ResponseCache, Versions, DEFAULT_INDEX_LIMIT, SETTINGS_COLLECTION, SETTINGS_SUFFIX,
};
pub use store::{open_store, CacheStore, MemoryStore, SharedMemoryStore, StoreKind, StoreRegistry};
