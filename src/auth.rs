//! Authorization payloads and the nonce digest scheme.

use std::collections::HashMap;

use serde_json::{json, Map, Value};

use crate::protocol::fields;

fn md5_hex(input: &str) -> String {
  hex::encode(md5::compute(input.as_bytes()).as_ref())
}

/// `md5(client_id + "::" + client_key)`
pub fn key_hash(client_id: &str, client_key: &str) -> String {
  md5_hex(&format!("{}::{}", client_id, client_key))
}

/// `md5(nonce + client_id + key_hash)`
pub fn auth_key(nonce: &str, client_id: &str, key_hash: &str) -> String {
  md5_hex(&format!("{}{}{}", nonce, client_id, key_hash))
}

/// Identity presented to the server during authorization.
#[derive(Debug, Clone)]
pub struct Credentials {
  pub client_id: String,
  pub client_key: String,
  pub version: u32,
  pub route: Option<String>,
  pub session: Option<String>,
  /// Ask the server to push cache invalidations on this connection.
  pub push: bool,
}

impl Credentials {
  /// Payload for key-based authorization: the raw secret goes over the
  /// encrypted socket, no nonce round trip.
  pub fn key_payload(&self) -> Value {
    self.payload(self.client_key.clone())
  }

  /// Payload for nonce-based authorization.
  pub fn nonce_payload(&self, nonce: &str) -> Value {
    let hash = key_hash(&self.client_id, &self.client_key);
    self.payload(auth_key(nonce, &self.client_id, &hash))
  }

  fn payload(&self, key: String) -> Value {
    let mut payload = Map::new();
    payload.insert("client".to_string(), Value::String(self.client_id.clone()));
    payload.insert("key".to_string(), Value::String(key));
    payload.insert(fields::VERSION.to_string(), json!(self.version));
    if let Some(session) = &self.session {
      payload.insert(fields::SESSION.to_string(), Value::String(session.clone()));
    }
    if let Some(route) = &self.route {
      payload.insert(fields::ROUTE.to_string(), Value::String(route.clone()));
    }
    if self.push {
      payload.insert(fields::PUSH.to_string(), Value::Bool(true));
    }
    Value::Object(payload)
  }

  /// Fields that let an ordinary request double as authorization.
  pub fn inline_headers(&self, headers: &mut Map<String, Value>) {
    headers.insert(fields::CLIENT.to_string(), Value::String(self.client_id.clone()));
    headers.insert(fields::KEY.to_string(), Value::String(self.client_key.clone()));
    if let Some(route) = &self.route {
      headers.insert(fields::ROUTE.to_string(), Value::String(route.clone()));
    }
    if let Some(session) = &self.session {
      headers.insert(fields::SESSION.to_string(), Value::String(session.clone()));
    }
  }
}

/// Payload of the `cached` service request.
pub fn cached_payload(versions: &HashMap<String, i64>) -> Value {
  json!({
    fields::CACHED: versions,
    fields::PUSH: true,
  })
}
