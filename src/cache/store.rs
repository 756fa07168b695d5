//! Key/value backing stores for the response cache.
//!
//! Two flavors: [`MemoryStore`] keeps its entries private to the instance,
//! [`SharedMemoryStore`] reads and writes a [`StoreRegistry`] that every
//! store built from the same registry sees. Neither evicts.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use crate::error::Error;

pub trait CacheStore: Send + Sync {
  fn read(&self, key: &str) -> Option<String>;
  fn write(&self, key: &str, value: String);
  fn remove(&self, key: &str);
  /// Drop every entry.
  fn flush(&self);
}

/// Storage flavor selected by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreKind {
  #[default]
  Memory,
  Shared,
}

impl FromStr for StoreKind {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "memory" => Ok(Self::Memory),
      "shared" => Ok(Self::Shared),
      other => Err(Error::UnsupportedStore(other.to_string())),
    }
  }
}

fn lock(map: &Mutex<HashMap<String, String>>) -> MutexGuard<'_, HashMap<String, String>> {
  map.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Store private to the instance that created it.
#[derive(Debug, Default)]
pub struct MemoryStore {
  entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }
}

impl CacheStore for MemoryStore {
  fn read(&self, key: &str) -> Option<String> {
    lock(&self.entries).get(key).cloned()
  }

  fn write(&self, key: &str, value: String) {
    lock(&self.entries).insert(key.to_string(), value);
  }

  fn remove(&self, key: &str) {
    lock(&self.entries).remove(key);
  }

  fn flush(&self) {
    lock(&self.entries).clear();
  }
}

/// Backing map shared by every [`SharedMemoryStore`] built from it.
///
/// Clones share the same map. [`StoreRegistry::global`] is the process-wide
/// instance clients use unless one is injected through their options.
#[derive(Debug, Clone, Default)]
pub struct StoreRegistry {
  entries: Arc<Mutex<HashMap<String, String>>>,
}

static GLOBAL_REGISTRY: OnceLock<StoreRegistry> = OnceLock::new();

impl StoreRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn global() -> &'static StoreRegistry {
    GLOBAL_REGISTRY.get_or_init(StoreRegistry::new)
  }

  pub fn len(&self) -> usize {
    lock(&self.entries).len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

#[derive(Debug, Clone)]
pub struct SharedMemoryStore {
  registry: StoreRegistry,
}

impl SharedMemoryStore {
  pub fn new(registry: StoreRegistry) -> Self {
    Self { registry }
  }
}

impl CacheStore for SharedMemoryStore {
  fn read(&self, key: &str) -> Option<String> {
    lock(&self.registry.entries).get(key).cloned()
  }

  fn write(&self, key: &str, value: String) {
    lock(&self.registry.entries).insert(key.to_string(), value);
  }

  fn remove(&self, key: &str) {
    lock(&self.registry.entries).remove(key);
  }

  fn flush(&self) {
    lock(&self.registry.entries).clear();
  }
}

/// Build the store for `kind`, drawing shared storage from `registry`.
pub fn open_store(kind: StoreKind, registry: &StoreRegistry) -> Box<dyn CacheStore> {
  match kind {
    StoreKind::Memory => Box::new(MemoryStore::new()),
    StoreKind::Shared => Box::new(SharedMemoryStore::new(registry.clone())),
  }
}
