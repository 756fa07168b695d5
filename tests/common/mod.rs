//! In-process line-protocol server for end-to-end tests.

#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use swell::{Client, ClientOptions, StoreRegistry};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

pub const CLIENT_ID: &str = "test-store";
pub const CLIENT_KEY: &str = "secret-key";

/// What the server does with a received frame.
pub enum Reply {
  /// Send this response; `$req_id` is copied from the request when missing.
  Respond(Value),
  /// Drop the connection.
  Close,
  /// Say nothing for now.
  Ignore,
}

type Handler = Arc<dyn Fn(usize, &Value) -> Reply + Send + Sync>;

#[derive(Clone)]
pub struct MockServer {
  pub port: u16,
  frames: Arc<Mutex<Vec<(usize, Value)>>>,
  writer: Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>,
  connections: Arc<AtomicUsize>,
}

impl MockServer {
  pub async fn start<F>(handler: F) -> Self
  where
    F: Fn(usize, &Value) -> Reply + Send + Sync + 'static,
  {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server = Self {
      port: listener.local_addr().unwrap().port(),
      frames: Arc::default(),
      writer: Arc::default(),
      connections: Arc::default(),
    };

    let handler: Handler = Arc::new(handler);
    let accept = server.clone();
    tokio::spawn(async move {
      while let Ok((socket, _)) = listener.accept().await {
        let conn = accept.connections.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(accept.clone().serve(socket, conn, handler.clone()));
      }
    });
    server
  }

  async fn serve(self, socket: TcpStream, conn: usize, handler: Handler) {
    let (read, mut write) = socket.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    *self.writer.lock().unwrap() = Some(tx.clone());

    let writer = tokio::spawn(async move {
      while let Some(line) = rx.recv().await {
        if write.write_all(line.as_bytes()).await.is_err() {
          break;
        }
      }
    });

    let mut lines = BufReader::new(read).lines();
    while let Ok(Some(line)) = lines.next_line().await {
      let frame: Value = serde_json::from_str(&line).unwrap();
      self.frames.lock().unwrap().push((conn, frame.clone()));

      match handler(conn, &frame) {
        Reply::Respond(mut response) => {
          if let (Some(id), Some(obj)) = (req_id(&frame), response.as_object_mut()) {
            obj.entry("$req_id").or_insert_with(|| json!(id));
          }
          let _ = tx.send(format!("{}\n", response));
        }
        Reply::Close => break,
        Reply::Ignore => {}
      }
    }
    writer.abort();
  }

  /// Write a raw frame to the most recent connection.
  pub fn send(&self, frame: Value) {
    if let Some(tx) = self.writer.lock().unwrap().as_ref() {
      let _ = tx.send(format!("{}\n", frame));
    }
  }

  pub fn send_raw(&self, line: &str) {
    if let Some(tx) = self.writer.lock().unwrap().as_ref() {
      let _ = tx.send(format!("{}\n", line));
    }
  }

  pub fn frames(&self) -> Vec<(usize, Value)> {
    self.frames.lock().unwrap().clone()
  }

  /// Frames with the given action, across all connections.
  pub fn frames_for(&self, action: &str) -> Vec<Value> {
    self
      .frames()
      .into_iter()
      .filter(|(_, f)| f[0] == action)
      .map(|(_, f)| f)
      .collect()
  }

  /// Actions received on one connection, in order.
  pub fn actions_on(&self, conn: usize) -> Vec<String> {
    self
      .frames()
      .into_iter()
      .filter(|(c, _)| *c == conn)
      .map(|(_, f)| f[0].as_str().unwrap_or_default().to_string())
      .collect()
  }

  pub fn connection_count(&self) -> usize {
    self.connections.load(Ordering::SeqCst)
  }

  pub fn options(&self) -> ClientOptions {
    ClientOptions::new("127.0.0.1", self.port)
      .with_tls(false)
      .with_retry_interval(Duration::from_millis(50))
      .with_registry(StoreRegistry::new())
  }

  pub fn client(&self) -> Client {
    Client::new(CLIENT_ID, CLIENT_KEY, self.options()).unwrap()
  }
}

pub fn req_id(frame: &Value) -> Option<String> {
  frame
    .as_array()?
    .last()?
    .get("$req_id")?
    .as_str()
    .map(str::to_string)
}

pub fn headers(frame: &Value) -> &Value {
  frame.as_array().and_then(|f| f.last()).unwrap_or(&Value::Null)
}

/// Accept authorization and acknowledge cache version syncs.
pub fn service_reply(frame: &Value) -> Option<Reply> {
  match frame[0].as_str()? {
    "auth" => Some(Reply::Respond(json!({"$data": {"client_id": CLIENT_ID}, "$env": "test"}))),
    "cached" => Some(Reply::Respond(json!({"$data": null}))),
    _ => None,
  }
}

/// Poll `condition` until it holds, panicking after two seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
  for _ in 0..200 {
    if condition() {
      return;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
  }
  panic!("condition not met in time");
}

pub async fn within<T>(future: impl Future<Output = T>) -> T {
  tokio::time::timeout(Duration::from_secs(5), future)
    .await
    .expect("timed out")
}
