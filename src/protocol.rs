//! Wire protocol types and serialization for the Swell API.
//!
//! Every frame is a single line of UTF-8 JSON terminated by `\n`. Requests are
//! JSON arrays (`[action, ...args]`), responses are JSON objects whose protocol
//! fields are prefixed with `$`.

use std::fmt;

use serde_json::{json, Map, Value};
use tokio::sync::oneshot;

use crate::error::Result;

/// Current protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Identifier sent as `$user_agent` on every request
pub const USER_AGENT: &str = concat!("swell-rust/", env!("CARGO_PKG_VERSION"));

/// Service action performing authorization
pub const ACTION_AUTH: &str = "auth";

/// Service action pushing local cache versions to the server
pub const ACTION_CACHED: &str = "cached";

/// Protocol field names
pub mod fields {
  pub const DATA: &str = "$data";
  pub const ERROR: &str = "$error";
  pub const STATUS: &str = "$status";
  pub const AUTH: &str = "$auth";
  pub const END: &str = "$end";
  pub const PUSH: &str = "$push";
  pub const REQ_ID: &str = "$req_id";
  pub const CACHED: &str = "$cached";
  pub const COLLECTION: &str = "$collection";
  pub const EXPANDED: &str = "$expanded";
  pub const ENV: &str = "$env";
  pub const CLIENT: &str = "$client";
  pub const KEY: &str = "$key";
  pub const ROUTE: &str = "$route";
  pub const SESSION: &str = "$session";
  pub const VERSION: &str = "$v";
  pub const NOCACHE: &str = "$nocache";
  pub const USER_AGENT: &str = "$user_agent";
  pub const USER_APPLICATION: &str = "$user_application";
}

/// Request methods understood by the API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
  Get,
  Put,
  Post,
  Delete,
}

impl Method {
  pub fn as_str(&self) -> &'static str {
    match self {
      Method::Get => "get",
      Method::Put => "put",
      Method::Post => "post",
      Method::Delete => "delete",
    }
  }
}

impl fmt::Display for Method {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// A single outbound frame together with the channel its response is
/// delivered on.
///
/// The correlation id is kept as an explicit field and written into the
/// trailing headers object as `$req_id` when the frame is encoded.
#[derive(Debug)]
pub struct Request {
  pub action: String,
  pub args: Vec<Value>,
  pub id: Option<String>,
  reply: Option<oneshot::Sender<Value>>,
}

impl Request {
  pub fn new(action: impl Into<String>, args: Vec<Value>) -> Self {
    Self {
      action: action.into(),
      args,
      id: None,
      reply: None,
    }
  }

  pub fn with_id(mut self, id: impl Into<String>) -> Self {
    self.id = Some(id.into());
    self
  }

  /// Attach a reply channel and return the receiving half.
  pub fn with_reply(mut self) -> (Self, oneshot::Receiver<Value>) {
    let (tx, rx) = oneshot::channel();
    self.reply = Some(tx);
    (self, rx)
  }

  /// `auth` and `cached` bypass the pending-until-authorized gate.
  pub fn is_service(&self) -> bool {
    self.action == ACTION_AUTH || self.action == ACTION_CACHED
  }

  /// True when the headers object carries both a client id and key.
  pub fn carries_credentials(&self) -> bool {
    self
      .headers()
      .map(|h| h.contains_key(fields::CLIENT) && h.contains_key(fields::KEY))
      .unwrap_or(false)
  }

  fn headers(&self) -> Option<&Map<String, Value>> {
    self.args.last().and_then(Value::as_object)
  }

  /// Encode as a single newline-terminated frame.
  pub fn encode(&self) -> Result<String> {
    let mut frame = Vec::with_capacity(self.args.len() + 1);
    frame.push(Value::String(self.action.clone()));
    frame.extend(self.args.iter().cloned());

    if let Some(id) = &self.id {
      let has_args = frame.len() > 1;
      match frame.last_mut() {
        Some(Value::Object(headers)) if has_args => {
          headers.insert(fields::REQ_ID.to_string(), Value::String(id.clone()));
        }
        _ => frame.push(json!({ fields::REQ_ID: id })),
      }
    }

    let mut line = serde_json::to_string(&Value::Array(frame))?;
    line.push('\n');
    Ok(line)
  }

  /// Deliver a response to whoever is waiting on this request.
  pub(crate) fn resolve(self, response: Value) {
    if let Some(reply) = self.reply {
      // Receiver gone means the caller stopped waiting.
      let _ = reply.send(response);
    }
  }
}

/// Synthesized response for failures that never reached the server.
pub fn error_frame(message: impl Into<String>, status: u16) -> Value {
  json!({
    fields::STATUS: status,
    fields::ERROR: message.into(),
  })
}

pub fn is_push(frame: &Value) -> bool {
  frame.get(fields::PUSH).map(truthy).unwrap_or(false)
}

pub fn is_end(frame: &Value) -> bool {
  frame.get(fields::END).map(truthy).unwrap_or(false)
}

/// Value of `$auth` when the server demands (re)authorization.
pub fn auth_demand(frame: &Value) -> Option<&Value> {
  frame.get(fields::AUTH).filter(|v| truthy(v))
}

pub fn response_id(frame: &Value) -> Option<&str> {
  frame.get(fields::REQ_ID).and_then(Value::as_str)
}

pub fn status(frame: &Value) -> Option<u16> {
  frame
    .get(fields::STATUS)
    .and_then(Value::as_u64)
    .and_then(|s| u16::try_from(s).ok())
}

/// Server-declared error message, if any.
pub fn error_message(frame: &Value) -> Option<String> {
  match frame.get(fields::ERROR)? {
    Value::Null => None,
    Value::String(s) => Some(s.clone()),
    Value::Object(obj) => Some(
      obj
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| Value::Object(obj.clone()).to_string()),
    ),
    other => Some(other.to_string()),
  }
}

/// JavaScript-style truthiness, which is how the server sets its flags.
pub fn truthy(value: &Value) -> bool {
  match value {
    Value::Null => false,
    Value::Bool(b) => *b,
    Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
    Value::String(s) => !s.is_empty(),
    Value::Array(_) | Value::Object(_) => true,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_encode_writes_id_into_headers() {
    let req = Request::new("get", vec![json!("/products"), json!({"$data": {"a": 1}})])
      .with_id("r1");
    let line = req.encode().unwrap();
    assert!(line.ends_with('\n'));

    let frame: Value = serde_json::from_str(line.trim_end()).unwrap();
    assert_eq!(frame[0], "get");
    assert_eq!(frame[1], "/products");
    assert_eq!(frame[2]["$req_id"], "r1");
    assert_eq!(frame[2]["$data"]["a"], 1);
  }

  #[test]
  fn test_encode_without_headers_appends_id_object() {
    let req = Request::new("ping", vec![]).with_id("r2");
    let frame: Value = serde_json::from_str(req.encode().unwrap().trim_end()).unwrap();
    assert_eq!(frame, json!(["ping", {"$req_id": "r2"}]));
  }

  #[test]
  fn test_encode_merges_id_into_service_payload() {
    let req = Request::new(ACTION_AUTH, vec![json!({"client": "id"})]).with_id("r3");
    let frame: Value = serde_json::from_str(req.encode().unwrap().trim_end()).unwrap();
    assert_eq!(frame, json!(["auth", {"client": "id", "$req_id": "r3"}]));
  }

  #[test]
  fn test_service_and_credentials() {
    assert!(Request::new(ACTION_AUTH, vec![]).is_service());
    assert!(Request::new(ACTION_CACHED, vec![]).is_service());
    assert!(!Request::new("get", vec![]).is_service());

    let with_creds = Request::new("get", vec![json!("/x"), json!({"$client": "id", "$key": "k"})]);
    assert!(with_creds.carries_credentials());
    let without = Request::new("get", vec![json!("/x"), json!({"$client": "id"})]);
    assert!(!without.carries_credentials());
  }

  #[test]
  fn test_frame_accessors() {
    let frame = json!({
      "$push": true,
      "$end": 1,
      "$status": 404,
      "$error": "Not found",
      "$req_id": "x",
    });
    assert!(is_push(&frame));
    assert!(is_end(&frame));
    assert_eq!(status(&frame), Some(404));
    assert_eq!(error_message(&frame).as_deref(), Some("Not found"));
    assert_eq!(response_id(&frame), Some("x"));

    let plain = json!({"$data": null});
    assert!(!is_push(&plain));
    assert!(auth_demand(&plain).is_none());
    assert!(error_message(&plain).is_none());
  }

  #[test]
  fn test_error_frame() {
    let frame = error_frame("boom", 500);
    assert_eq!(frame["$status"], 500);
    assert_eq!(frame["$error"], "boom");
  }

  #[test]
  fn test_method_names() {
    assert_eq!(Method::Get.as_str(), "get");
    assert_eq!(Method::Delete.to_string(), "delete");
  }
}
