//! Version-stamped, collection-indexed cache of API responses.
//!
//! Results are stored under a digest of `(url, data)`. A result is only
//! served while the index of its collection still lists its key; the server
//! invalidates collections by announcing new versions in `$cached`, either on
//! a response or in a push frame.

use std::collections::HashMap;

use indexmap::IndexMap;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, trace};

use super::store::CacheStore;
use crate::protocol::fields;

/// Administrative settings collection.
pub const SETTINGS_COLLECTION: &str = "settings";

/// Collections ending with this suffix are invalidated along with
/// [`SETTINGS_COLLECTION`].
pub const SETTINGS_SUFFIX: &str = ":settings";

/// Default number of keys kept per collection index.
pub const DEFAULT_INDEX_LIMIT: usize = 1000;

/// Collection name to version.
pub type Versions = HashMap<String, i64>;

/// Collection name to cache keys (in insertion order) and their stored size.
pub type Index = HashMap<String, IndexMap<String, usize>>;

pub struct ResponseCache {
  store: Box<dyn CacheStore>,
  client_id: String,
  env: Option<String>,
  index_limit: usize,
  versions: Option<Versions>,
  index: Option<Index>,
}

impl ResponseCache {
  pub fn new(client_id: impl Into<String>, store: Box<dyn CacheStore>, index_limit: usize) -> Self {
    Self {
      store,
      client_id: client_id.into(),
      env: None,
      index_limit: index_limit.max(1),
      versions: None,
      index: None,
    }
  }

  pub fn env(&self) -> Option<&str> {
    self.env.as_deref()
  }

  /// Switch the storage namespace. In-memory state is dropped when it changes.
  pub fn set_env(&mut self, env: Option<String>) {
    if self.env != env {
      self.env = env;
      self.reset();
    }
  }

  /// Deterministic cache key for a request.
  pub fn key(url: &str, data: &Value) -> String {
    let url = url.trim().trim_matches('/');
    let material = Value::Array(vec![Value::String(url.to_string()), data.clone()]);
    hex::encode(Sha256::digest(material.to_string().as_bytes()))
  }

  fn storage_key(&self, kind: &str) -> String {
    match &self.env {
      Some(env) => format!("{}.{}.{}", self.client_id, env, kind),
      None => format!("{}.{}", self.client_id, kind),
    }
  }

  fn result_key(&self, key: &str) -> String {
    self.storage_key(&format!("result.{}", key))
  }

  /// Look up a cached response. Returns it with `$cached: true`, or `None`.
  pub fn get(&mut self, url: &str, data: &Value) -> Option<Value> {
    let key = Self::key(url, data);
    let raw = self.store.read(&self.result_key(&key))?;
    let mut result: Value = match serde_json::from_str(&raw) {
      Ok(result) => result,
      Err(e) => {
        debug!(error = %e, "discarding unreadable cache entry");
        self.store.remove(&self.result_key(&key));
        return None;
      }
    };

    let collections = collections_of(&result);
    // Results without a collection are never indexed.
    let primary = collections.first()?;

    let indexed = self
      .load_index()
      .get(primary)
      .map(|keys| keys.contains_key(&key))
      .unwrap_or(false);

    if !indexed {
      trace!(collection = %primary, "purging unindexed cache entry");
      self.purge_key(&key, &collections);
      return None;
    }

    if let Value::Object(map) = &mut result {
      map.insert(fields::CACHED.to_string(), Value::Bool(true));
    }
    Some(result)
  }

  /// Store a response and index it under every collection it names.
  pub fn put(&mut self, url: &str, data: &Value, response: &Value) {
    let Value::Object(frame) = response else {
      return;
    };

    let key = Self::key(url, data);
    let mut result = frame.clone();
    result.insert(fields::CACHED.to_string(), Value::Bool(true));
    result.remove(fields::REQ_ID);

    let serialized = Value::Object(result).to_string();
    let size = serialized.len();
    self.store.write(&self.result_key(&key), serialized);

    let declared = frame.get(fields::CACHED).and_then(Value::as_object);
    let tracked = self.load_versions().clone();

    let mut evicted = Vec::new();
    let mut new_versions = Vec::new();
    let mut indexed = false;

    for collection in collections_of(response) {
      let declared_version = declared.and_then(|d| d.get(&collection));
      if !tracked.contains_key(&collection) && declared_version.is_none() {
        continue;
      }
      evicted.extend(self.insert_index(&collection, &key, size));
      indexed = true;
      if let Some(version) = declared_version.and_then(Value::as_i64) {
        new_versions.push((collection, version));
      }
    }

    if !new_versions.is_empty() {
      self.load_versions().extend(new_versions);
      self.save_versions();
    }

    if indexed {
      self.drop_orphans(evicted);
      self.save_index();
    }
  }

  fn insert_index(&mut self, collection: &str, key: &str, size: usize) -> Vec<String> {
    let limit = self.index_limit;
    let keys = self.load_index().entry(collection.to_string()).or_default();

    let mut evicted = Vec::new();
    if !keys.contains_key(key) {
      while keys.len() >= limit {
        match keys.shift_remove_index(0) {
          Some((oldest, _)) => evicted.push(oldest),
          None => break,
        }
      }
    }
    keys.insert(key.to_string(), size);
    evicted
  }

  /// Remove stored results for evicted keys no index refers to any more.
  fn drop_orphans(&mut self, evicted: Vec<String>) {
    for key in evicted {
      let referenced = self
        .load_index()
        .values()
        .any(|keys| keys.contains_key(&key));
      if !referenced {
        self.store.remove(&self.result_key(&key));
      }
    }
  }

  fn purge_key(&mut self, key: &str, collections: &[String]) {
    let index = self.load_index();
    for collection in collections {
      if let Some(keys) = index.get_mut(collection) {
        keys.shift_remove(key);
      }
    }
    self.store.remove(&self.result_key(key));
    self.save_index();
  }

  /// Apply the invalidation set (`$cached`) carried by a response or push.
  pub fn clear(&mut self, response: &Value) {
    let Some(declared) = response.get(fields::CACHED).and_then(Value::as_object) else {
      return;
    };

    let mut invalid = Vec::new();
    {
      let versions = self.load_versions();
      for (collection, version) in declared {
        let Some(version) = version.as_i64() else {
          continue;
        };
        if versions.get(collection) != Some(&version) {
          versions.insert(collection.clone(), version);
          invalid.push(collection.clone());
        }
      }
    }

    if invalid.is_empty() {
      return;
    }
    self.save_versions();

    if invalid.iter().any(|c| c == SETTINGS_COLLECTION) {
      let mut known: Vec<String> = self.load_versions().keys().cloned().collect();
      known.extend(self.load_index().keys().cloned());
      for collection in known {
        if collection.ends_with(SETTINGS_SUFFIX) && !invalid.contains(&collection) {
          invalid.push(collection);
        }
      }
    }

    let mut removed = Vec::new();
    {
      let index = self.load_index();
      for collection in &invalid {
        debug!(collection = %collection, "invalidating cached collection");
        if let Some(keys) = index.remove(collection) {
          removed.extend(keys.into_keys());
        }
      }
    }

    for key in &removed {
      self.store.remove(&self.result_key(key));
    }
    self.save_index();
  }

  /// Copy of the collection versions.
  pub fn get_versions(&mut self) -> Versions {
    self.load_versions().clone()
  }

  /// Fresh copy of the collection index.
  pub fn get_index(&mut self) -> Index {
    self.load_index().clone()
  }

  /// Forget in-memory versions and index; they reload from the store on
  /// next access.
  pub fn reset(&mut self) {
    self.versions = None;
    self.index = None;
  }

  /// Empty the backing store and reset.
  pub fn flush_all(&mut self) {
    self.store.flush();
    self.reset();
  }

  fn load_versions(&mut self) -> &mut Versions {
    if self.versions.is_none() {
      let loaded = self.read_json(&self.storage_key("versions")).unwrap_or_default();
      self.versions = Some(loaded);
    }
    self.versions.get_or_insert_with(Versions::new)
  }

  fn load_index(&mut self) -> &mut Index {
    if self.index.is_none() {
      let loaded = self.read_json(&self.storage_key("index")).unwrap_or_default();
      self.index = Some(loaded);
    }
    self.index.get_or_insert_with(Index::new)
  }

  fn read_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
    let raw = self.store.read(key)?;
    match serde_json::from_str(&raw) {
      Ok(value) => Some(value),
      Err(e) => {
        debug!(key, error = %e, "ignoring unreadable cache metadata");
        None
      }
    }
  }

  fn save_versions(&mut self) {
    let key = self.storage_key("versions");
    if let Some(versions) = &self.versions {
      if let Ok(serialized) = serde_json::to_string(versions) {
        self.store.write(&key, serialized);
      }
    }
  }

  fn save_index(&mut self) {
    let key = self.storage_key("index");
    if let Some(index) = &self.index {
      if let Ok(serialized) = serde_json::to_string(index) {
        self.store.write(&key, serialized);
      }
    }
  }
}

/// Primary collection first, then expanded ones, without duplicates.
fn collections_of(response: &Value) -> Vec<String> {
  let mut collections = Vec::new();
  let Some(primary) = response.get(fields::COLLECTION).and_then(Value::as_str) else {
    return collections;
  };
  collections.push(primary.to_string());

  let expanded: Vec<String> = match response.get(fields::EXPANDED) {
    Some(Value::Array(items)) => items
      .iter()
      .filter_map(Value::as_str)
      .map(str::to_string)
      .collect(),
    Some(Value::Object(map)) => map.keys().cloned().collect(),
    Some(Value::String(name)) => vec![name.clone()],
    _ => Vec::new(),
  };
  for name in expanded {
    if !collections.contains(&name) {
      collections.push(name);
    }
  }
  collections
}
