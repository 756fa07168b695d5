//! Request queues and response correlation for one connection.
//!
//! The pipeline does no I/O. The connection task feeds it requests and
//! received bytes, writes whatever frames it releases, and acts on the
//! outcomes it reports.

use std::collections::VecDeque;

use serde_json::Value;
use tracing::trace;

use crate::protocol::{self, error_frame, Request};

/// Where an enqueued request landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
  Active,
  Pending,
}

/// Something the connection must act on after a received line.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
  /// Unsolicited frame for the push handler.
  Push(Value),
  /// Line that could not be attributed as a well-formed response.
  ProtocolError(String),
  /// Response carrying a server-declared error.
  ServerError(String),
  /// The server is ending the connection.
  End,
}

pub struct Pipeline {
  max_concurrent: usize,
  ready: bool,
  /// Admitted requests; the first `in_flight` entries have been written.
  active: VecDeque<Request>,
  /// Requests waiting for `ready`.
  pending: VecDeque<Request>,
  in_flight: usize,
  partial: Vec<u8>,
}

impl Pipeline {
  pub fn new(max_concurrent: usize) -> Self {
    Self {
      max_concurrent: max_concurrent.max(1),
      ready: false,
      active: VecDeque::new(),
      pending: VecDeque::new(),
      in_flight: 0,
      partial: Vec::new(),
    }
  }

  pub fn is_ready(&self) -> bool {
    self.ready
  }

  pub fn in_flight(&self) -> usize {
    self.in_flight
  }

  pub fn active_len(&self) -> usize {
    self.active.len()
  }

  pub fn pending_len(&self) -> usize {
    self.pending.len()
  }

  /// Actions of the pending queue, front first.
  pub fn pending_actions(&self) -> Vec<&str> {
    self.pending.iter().map(|r| r.action.as_str()).collect()
  }

  pub fn has_queued(&self) -> bool {
    !self.active.is_empty() || !self.pending.is_empty()
  }

  /// Queue a request. Service requests and requests carrying credentials
  /// are admitted immediately; others wait until the pipeline is ready.
  pub fn enqueue(&mut self, request: Request) -> Admission {
    if request.is_service() || self.ready || request.carries_credentials() {
      self.active.push_back(request);
      Admission::Active
    } else {
      self.pending.push_back(request);
      Admission::Pending
    }
  }

  /// Release every admitted, unsent request the concurrency limit allows.
  /// Returns the encoded frames in transmission order.
  pub fn next_frames(&mut self) -> Vec<String> {
    let mut frames = Vec::new();
    while self.in_flight < self.max_concurrent && self.in_flight < self.active.len() {
      let request = &self.active[self.in_flight];
      match request.encode() {
        Ok(frame) => {
          frames.push(frame);
          self.in_flight += 1;
        }
        Err(e) => {
          // Unencodable requests never reach the wire; answer them in place.
          let message = format!("Unable to encode request: {}", e);
          if let Some(request) = self.active.remove(self.in_flight) {
            request.resolve(error_frame(message, 500));
          }
        }
      }
    }
    frames
  }

  /// Authorization finished: admit everything pending, in order.
  pub fn flush_pending(&mut self) {
    self.active.extend(self.pending.drain(..));
    self.ready = true;
  }

  /// Fail every queued request that has not been written.
  pub fn flush_with_error(&mut self, message: &str) {
    let unsent = self.active.split_off(self.in_flight.min(self.active.len()));
    for request in unsent.into_iter().chain(self.pending.drain(..)) {
      request.resolve(error_frame(message, 500));
    }
  }

  /// Fail every queued request, written or not.
  pub fn fail_all(&mut self, message: &str) {
    for request in self.active.drain(..).chain(self.pending.drain(..)) {
      request.resolve(error_frame(message, 500));
    }
    self.in_flight = 0;
  }

  /// Connection lost: non-service requests go back to the front of the
  /// pending queue in their original order; service requests are dropped.
  pub fn requeue(&mut self) {
    let mut survivors: VecDeque<Request> =
      self.active.drain(..).filter(|r| !r.is_service()).collect();
    survivors.extend(self.pending.drain(..));
    self.pending = survivors;
    self.in_flight = 0;
    self.ready = false;
    self.partial.clear();
  }

  /// Accumulate received bytes and dispatch every complete line.
  pub fn receive(&mut self, bytes: &[u8]) -> Vec<Outcome> {
    self.partial.extend_from_slice(bytes);

    let mut outcomes = Vec::new();
    while let Some(pos) = self.partial.iter().position(|b| *b == b'\n') {
      let line: Vec<u8> = self.partial.drain(..=pos).collect();
      let line = String::from_utf8_lossy(&line[..line.len() - 1]);
      let line = line.trim();
      if line.is_empty() {
        continue;
      }
      outcomes.extend(self.receive_line(line));
    }
    outcomes
  }

  fn receive_line(&mut self, line: &str) -> Vec<Outcome> {
    let mut outcomes = Vec::new();

    let response = match serde_json::from_str::<Value>(line) {
      Ok(value) if value.is_object() => {
        if protocol::is_push(&value) {
          return vec![Outcome::Push(value)];
        }
        value
      }
      _ => {
        let message = format!("Unable to parse response from server: {}", line);
        outcomes.push(Outcome::ProtocolError(message.clone()));
        error_frame(message, 500)
      }
    };

    if let Some(message) = protocol::error_message(&response) {
      if !matches!(outcomes.first(), Some(Outcome::ProtocolError(_))) {
        outcomes.push(Outcome::ServerError(message));
      }
    }
    let end = protocol::is_end(&response);

    match self.take_responder(protocol::response_id(&response)) {
      Some(request) => {
        trace!(action = %request.action, "response matched");
        request.resolve(response);
      }
      None => trace!("response without an outstanding request"),
    }

    if end {
      outcomes.push(Outcome::End);
    }
    outcomes
  }

  /// Request a response belongs to: the in-flight request with the same
  /// id, otherwise the oldest in-flight request.
  fn take_responder(&mut self, id: Option<&str>) -> Option<Request> {
    let window = self.in_flight.min(self.active.len());
    if window == 0 {
      return None;
    }
    let position = id
      .and_then(|id| {
        self.active
          .iter()
          .take(window)
          .position(|r| r.id.as_deref() == Some(id))
      })
      .unwrap_or(0);

    let request = self.active.remove(position)?;
    self.in_flight -= 1;
    Some(request)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use tokio::sync::oneshot;

  fn request(id: Option<&str>) -> (Request, oneshot::Receiver<Value>) {
    let req = Request::new("get", vec![json!("/things"), json!({"$data": null})]);
    let req = match id {
      Some(id) => req.with_id(id),
      None => req,
    };
    req.with_reply()
  }

  fn authed_request() -> (Request, oneshot::Receiver<Value>) {
    Request::new("get", vec![json!("/things"), json!({"$client": "id", "$key": "key"})])
      .with_reply()
  }

  fn ready_pipeline(max: usize) -> Pipeline {
    let mut pipeline = Pipeline::new(max);
    pipeline.flush_pending();
    pipeline
  }

  #[test]
  fn test_fifo_correlation() {
    let mut pipeline = ready_pipeline(10);
    let mut receivers = Vec::new();
    for _ in 0..3 {
      let (req, rx) = request(None);
      pipeline.enqueue(req);
      receivers.push(rx);
    }
    assert_eq!(pipeline.next_frames().len(), 3);

    pipeline.receive(b"{\"$data\":\"first\"}\n{\"$data\":\"second\"}\n{\"$data\":\"third\"}\n");
    let got: Vec<Value> = receivers
      .iter_mut()
      .map(|rx| rx.try_recv().unwrap()["$data"].clone())
      .collect();
    assert_eq!(got, vec![json!("first"), json!("second"), json!("third")]);
    assert_eq!(pipeline.in_flight(), 0);
    assert_eq!(pipeline.active_len(), 0);
  }

  #[test]
  fn test_id_correlation_out_of_order() {
    let mut pipeline = ready_pipeline(10);
    let (r1, mut rx1) = request(Some("r1"));
    let (r2, mut rx2) = request(Some("r2"));
    pipeline.enqueue(r1);
    pipeline.enqueue(r2);
    pipeline.next_frames();

    pipeline.receive(b"{\"$req_id\":\"r2\",\"$data\":2}\n");
    assert!(rx1.try_recv().is_err());
    assert_eq!(rx2.try_recv().unwrap()["$data"], 2);

    pipeline.receive(b"{\"$req_id\":\"r1\",\"$data\":1}\n");
    assert_eq!(rx1.try_recv().unwrap()["$data"], 1);
    assert_eq!(pipeline.in_flight(), 0);
  }

  #[test]
  fn test_concurrency_cap() {
    let mut pipeline = ready_pipeline(2);
    let mut receivers = Vec::new();
    for _ in 0..5 {
      let (req, rx) = request(None);
      pipeline.enqueue(req);
      receivers.push(rx);
    }

    assert_eq!(pipeline.next_frames().len(), 2);
    assert!(pipeline.next_frames().is_empty());
    assert_eq!(pipeline.in_flight(), 2);

    pipeline.receive(b"{\"$data\":1}\n");
    assert_eq!(pipeline.next_frames().len(), 1);
    pipeline.receive(b"{\"$data\":2}\n{\"$data\":3}\n");
    assert_eq!(pipeline.next_frames().len(), 2);
    assert!(pipeline.next_frames().is_empty());
  }

  #[test]
  fn test_pending_until_ready() {
    let mut pipeline = Pipeline::new(10);
    let (req, _rx) = request(None);
    assert_eq!(pipeline.enqueue(req), Admission::Pending);
    assert!(pipeline.next_frames().is_empty());

    let (auth, _auth_rx) = Request::new("auth", vec![json!({"client": "id"})]).with_reply();
    assert_eq!(pipeline.enqueue(auth), Admission::Active);
    let (creds, _creds_rx) = authed_request();
    assert_eq!(pipeline.enqueue(creds), Admission::Active);
    assert_eq!(pipeline.next_frames().len(), 2);

    pipeline.flush_pending();
    assert!(pipeline.is_ready());
    assert_eq!(pipeline.pending_len(), 0);
    let frames = pipeline.next_frames();
    assert_eq!(frames.len(), 1);
    assert!(frames[0].starts_with("[\"get\",\"/things\""));
  }

  #[test]
  fn test_requeue_on_close() {
    let mut pipeline = ready_pipeline(10);
    let (service, mut service_rx) = Request::new("cached", vec![json!({})]).with_reply();
    pipeline.enqueue(service);
    let (sent, mut sent_rx) = Request::new("put", vec![json!("/a"), json!({})]).with_reply();
    pipeline.enqueue(sent);
    pipeline.next_frames();
    let (unsent, _unsent_rx) = Request::new("post", vec![json!("/b"), json!({})]).with_reply();
    pipeline.enqueue(unsent);

    pipeline.requeue();
    let (later, _later_rx) = Request::new("delete", vec![json!("/c"), json!({})]).with_reply();
    assert_eq!(pipeline.enqueue(later), Admission::Pending);

    assert_eq!(pipeline.pending_actions(), vec!["put", "post", "delete"]);
    assert_eq!(pipeline.in_flight(), 0);
    assert!(!pipeline.is_ready());
    assert!(matches!(
      service_rx.try_recv(),
      Err(oneshot::error::TryRecvError::Closed)
    ));
    assert!(matches!(
      sent_rx.try_recv(),
      Err(oneshot::error::TryRecvError::Empty)
    ));

    pipeline.flush_pending();
    let frames = pipeline.next_frames();
    assert_eq!(frames.len(), 3);
    assert!(frames[0].starts_with("[\"put\""));
    pipeline.receive(b"{\"$data\":\"ok\"}\n");
    assert_eq!(sent_rx.try_recv().unwrap()["$data"], "ok");
  }

  #[test]
  fn test_partial_lines() {
    let mut pipeline = ready_pipeline(10);
    let (req, mut rx) = request(None);
    pipeline.enqueue(req);
    pipeline.next_frames();

    assert!(pipeline.receive(b"{\"$data\":").is_empty());
    assert!(rx.try_recv().is_err());
    pipeline.receive(b"\"done\"}\n");
    assert_eq!(rx.try_recv().unwrap()["$data"], "done");
  }

  #[test]
  fn test_push_does_not_consume_slot() {
    let mut pipeline = ready_pipeline(10);
    let (req, mut rx) = request(None);
    pipeline.enqueue(req);
    pipeline.next_frames();

    let outcomes = pipeline.receive(b"{\"$push\":true,\"$cached\":{\"products\":8}}\n");
    assert_eq!(outcomes, vec![Outcome::Push(json!({"$push": true, "$cached": {"products": 8}}))]);
    assert!(rx.try_recv().is_err());
    assert_eq!(pipeline.in_flight(), 1);
  }

  #[test]
  fn test_malformed_line_is_protocol_error() {
    let mut pipeline = ready_pipeline(10);
    let (req, mut rx) = request(None);
    pipeline.enqueue(req);
    pipeline.next_frames();

    let outcomes = pipeline.receive(b"[1,2]\n");
    assert!(matches!(&outcomes[..], [Outcome::ProtocolError(msg)] if msg.contains("[1,2]")));
    let response = rx.try_recv().unwrap();
    assert_eq!(response["$status"], 500);
    assert_eq!(pipeline.in_flight(), 0);
  }

  #[test]
  fn test_server_error_and_end() {
    let mut pipeline = ready_pipeline(10);
    let (req, mut rx) = request(None);
    pipeline.enqueue(req);
    pipeline.next_frames();

    let outcomes = pipeline.receive(b"{\"$error\":\"Not found\",\"$status\":404,\"$end\":true}\n");
    assert_eq!(outcomes, vec![Outcome::ServerError("Not found".to_string()), Outcome::End]);
    assert_eq!(rx.try_recv().unwrap()["$status"], 404);
  }

  #[test]
  fn test_request_without_reply_still_dequeues() {
    let mut pipeline = ready_pipeline(1);
    pipeline.enqueue(Request::new("put", vec![json!("/a"), json!({})]));
    let (req, mut rx) = request(None);
    pipeline.enqueue(req);

    assert_eq!(pipeline.next_frames().len(), 1);
    pipeline.receive(b"{\"$data\":1}\n");
    assert_eq!(pipeline.next_frames().len(), 1);
    pipeline.receive(b"{\"$data\":2}\n");
    assert_eq!(rx.try_recv().unwrap()["$data"], 2);
  }

  #[test]
  fn test_flush_with_error_spares_in_flight() {
    let mut pipeline = Pipeline::new(1);
    let (sent, mut sent_rx) = Request::new("auth", vec![json!({})]).with_reply();
    pipeline.enqueue(sent);
    pipeline.next_frames();
    let (unsent, mut unsent_rx) = Request::new("cached", vec![json!({})]).with_reply();
    pipeline.enqueue(unsent);
    let (pending, mut pending_rx) = request(None);
    pipeline.enqueue(pending);

    pipeline.flush_with_error("Connection timed out");
    assert_eq!(unsent_rx.try_recv().unwrap()["$error"], "Connection timed out");
    assert_eq!(pending_rx.try_recv().unwrap()["$status"], 500);
    assert!(sent_rx.try_recv().is_err());
    assert_eq!(pipeline.active_len(), 1);
    assert_eq!(pipeline.pending_len(), 0);
  }
}
