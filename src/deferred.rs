//! Request data whose values may still be in flight.
//!
//! Callers can pass futures as object fields or array items. Every pending
//! value is awaited together before the request is serialized; the first
//! failure fails the request.

use std::future::Future;

use futures::future::{try_join_all, BoxFuture, FutureExt};
use serde_json::{Map, Value};

use crate::error::Result;

/// A value that resolves later.
pub type PendingValue = BoxFuture<'static, Result<Value>>;

enum Slot {
  Ready(Value),
  Pending(PendingValue),
}

impl Slot {
  async fn resolve(self) -> Result<Value> {
    match self {
      Slot::Ready(value) => Ok(value),
      Slot::Pending(pending) => pending.await,
    }
  }
}

enum Shape {
  Object(Vec<(String, Slot)>),
  Array(Vec<Slot>),
}

/// Object or array data with some values still pending.
pub struct DeferredData {
  shape: Shape,
}

impl DeferredData {
  pub fn object() -> Self {
    Self {
      shape: Shape::Object(Vec::new()),
    }
  }

  pub fn array() -> Self {
    Self {
      shape: Shape::Array(Vec::new()),
    }
  }

  /// Add a resolved field. On array data the name is ignored.
  pub fn field(self, name: impl Into<String>, value: impl Into<Value>) -> Self {
    self.push(name.into(), Slot::Ready(value.into()))
  }

  /// Add a field resolved by `future`.
  pub fn pending_field<F>(self, name: impl Into<String>, future: F) -> Self
  where
    F: Future<Output = Result<Value>> + Send + 'static,
  {
    self.push(name.into(), Slot::Pending(future.boxed()))
  }

  pub fn item(self, value: impl Into<Value>) -> Self {
    self.push(String::new(), Slot::Ready(value.into()))
  }

  pub fn pending_item<F>(self, future: F) -> Self
  where
    F: Future<Output = Result<Value>> + Send + 'static,
  {
    self.push(String::new(), Slot::Pending(future.boxed()))
  }

  fn push(mut self, name: String, slot: Slot) -> Self {
    match &mut self.shape {
      Shape::Object(fields) => fields.push((name, slot)),
      Shape::Array(items) => items.push(slot),
    }
    self
  }

  pub fn has_pending(&self) -> bool {
    let pending = |slot: &Slot| matches!(slot, Slot::Pending(_));
    match &self.shape {
      Shape::Object(fields) => fields.iter().any(|(_, slot)| pending(slot)),
      Shape::Array(items) => items.iter().any(pending),
    }
  }

  /// Await every pending value and assemble the final JSON.
  pub async fn resolve(self) -> Result<Value> {
    match self.shape {
      Shape::Object(fields) => {
        let (names, slots): (Vec<_>, Vec<_>) = fields.into_iter().unzip();
        let values = try_join_all(slots.into_iter().map(Slot::resolve)).await?;
        let map: Map<String, Value> = names.into_iter().zip(values).collect();
        Ok(Value::Object(map))
      }
      Shape::Array(items) => {
        let values = try_join_all(items.into_iter().map(Slot::resolve)).await?;
        Ok(Value::Array(values))
      }
    }
  }
}

/// Data accepted by client requests.
pub enum RequestData {
  Ready(Value),
  Deferred(DeferredData),
}

impl RequestData {
  pub async fn resolve(self) -> Result<Value> {
    match self {
      RequestData::Ready(value) => Ok(value),
      RequestData::Deferred(deferred) => deferred.resolve().await,
    }
  }
}

impl From<Value> for RequestData {
  fn from(value: Value) -> Self {
    RequestData::Ready(value)
  }
}

impl From<DeferredData> for RequestData {
  fn from(deferred: DeferredData) -> Self {
    RequestData::Deferred(deferred)
  }
}

impl Default for RequestData {
  fn default() -> Self {
    RequestData::Ready(Value::Null)
  }
}
