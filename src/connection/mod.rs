//! The single multiplexed socket to the API.
//!
//! A [`Connection`] is a handle to a background task that owns the socket and
//! the request [`Pipeline`]. Requests and control commands go to the task
//! over a channel; the task reports lifecycle changes, errors and push frames
//! as [`ConnectionEvent`]s to whoever owns the connection.
//!
//! The task:
//! 1. Connects (TLS unless disabled) and writes admitted requests up to the
//!    concurrency limit
//! 2. Reads newline-delimited responses and routes them to their callers
//! 3. Requeues unanswered requests and reconnects when the socket drops
//! 4. Fails buffered requests when no connection comes up within `timeout`

mod pipeline;
mod stream;

use std::fmt;
use std::io;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace, warn};

pub use pipeline::{Admission, Outcome, Pipeline};
pub use stream::{open_stream, ClientStream};

use crate::error::{Error, Result};
use crate::protocol::Request;

const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Socket and pipelining settings.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
  pub host: String,
  pub port: u16,
  pub tls: bool,
  pub verify_cert: bool,
  /// Connect timeout and socket idle timeout
  pub timeout: Duration,
  /// Delay before reconnecting after a failed attempt
  pub retry_interval: Duration,
  pub max_concurrent: usize,
  /// Log every frame at debug level instead of trace
  pub debug: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
  Transport,
  Network,
  Protocol,
  Server,
}

/// Error reported by the connection task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionError {
  pub kind: ConnectionErrorKind,
  pub message: String,
}

impl ConnectionError {
  pub fn new(kind: ConnectionErrorKind, message: impl Into<String>) -> Self {
    Self {
      kind,
      message: message.into(),
    }
  }
}

impl fmt::Display for ConnectionError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let prefix = match self.kind {
      ConnectionErrorKind::Transport => "Error",
      ConnectionErrorKind::Network => "Network error",
      ConnectionErrorKind::Protocol => "Protocol error",
      ConnectionErrorKind::Server => "Server error",
    };
    write!(f, "{}: {}", prefix, self.message)
  }
}

impl std::error::Error for ConnectionError {}

/// Notifications from the connection task to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
  Connected,
  /// Connected with queued requests; the owner decides how to authorize.
  AuthRequired,
  Closed,
  Error(ConnectionError),
  /// Unsolicited server frame.
  Push(Value),
}

enum Command {
  Request(Request),
  FlushPending,
  FlushActive,
  FailBuffered(String),
  Close,
}

/// Handle to the connection task. Dropping it shuts the task down.
pub struct Connection {
  cmd_tx: mpsc::UnboundedSender<Command>,
  task: JoinHandle<()>,
}

impl Connection {
  /// Spawn the connection task and start connecting.
  pub fn open(options: ConnectionOptions, events: mpsc::UnboundedSender<ConnectionEvent>) -> Self {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let task = ConnectionTask::new(options, cmd_rx, events);
    Self {
      cmd_tx,
      task: tokio::spawn(task.run()),
    }
  }

  /// Queue a request. Its response, if it asked for one, arrives on the
  /// request's reply channel.
  pub fn request(&self, request: Request) -> Result<()> {
    self.send(Command::Request(request))
  }

  /// Authorization completed: release requests held until ready.
  pub fn flush_pending(&self) -> Result<()> {
    self.send(Command::FlushPending)
  }

  /// Write whatever admitted requests the concurrency limit allows.
  pub fn flush_active(&self) -> Result<()> {
    self.send(Command::FlushActive)
  }

  /// Fail every buffered, unsent request with a synthesized 500.
  pub fn fail_buffered(&self, message: impl Into<String>) -> Result<()> {
    self.send(Command::FailBuffered(message.into()))
  }

  pub fn close(&self) {
    let _ = self.cmd_tx.send(Command::Close);
  }

  pub fn is_running(&self) -> bool {
    !self.task.is_finished()
  }

  fn send(&self, command: Command) -> Result<()> {
    self.cmd_tx.send(command).map_err(|_| Error::ChannelClosed)
  }
}

impl Drop for Connection {
  fn drop(&mut self) {
    let _ = self.cmd_tx.send(Command::Close);
  }
}

struct ConnectionTask {
  options: ConnectionOptions,
  pipeline: Pipeline,
  commands: mpsc::UnboundedReceiver<Command>,
  events: mpsc::UnboundedSender<ConnectionEvent>,
  stream: Option<ClientStream>,
  connecting: Option<BoxFuture<'static, Result<ClientStream>>>,
  connect_deadline: Option<Instant>,
  retry_at: Option<Instant>,
  idle_deadline: Option<Instant>,
  read_buf: Vec<u8>,
}

impl ConnectionTask {
  fn new(
    options: ConnectionOptions,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
  ) -> Self {
    Self {
      pipeline: Pipeline::new(options.max_concurrent),
      options,
      commands,
      events,
      stream: None,
      connecting: None,
      connect_deadline: None,
      retry_at: None,
      idle_deadline: None,
      read_buf: vec![0u8; READ_BUFFER_SIZE],
    }
  }

  async fn run(mut self) {
    self.start_connect();

    loop {
      tokio::select! {
        command = self.commands.recv() => match command {
          Some(Command::Close) | None => {
            self.shutdown().await;
            break;
          }
          Some(command) => self.handle_command(command).await,
        },
        result = wait_connect(&mut self.connecting), if self.connecting.is_some() => {
          self.connecting = None;
          self.on_connect_result(result).await;
        }
        read = read_some(&mut self.stream, &mut self.read_buf), if self.stream.is_some() => {
          self.on_read(read).await;
        }
        _ = sleep_until_opt(self.connect_deadline), if self.connect_deadline.is_some() => {
          self.on_connect_timeout();
        }
        _ = sleep_until_opt(self.retry_at), if self.retry_at.is_some() => {
          self.on_retry();
        }
        _ = sleep_until_opt(self.idle_deadline), if self.idle_deadline.is_some() => {
          self.on_idle().await;
        }
      }
    }
  }

  async fn handle_command(&mut self, command: Command) {
    match command {
      Command::Request(request) => {
        let action = request.action.clone();
        let admission = self.pipeline.enqueue(request);
        trace!(%action, ?admission, "request queued");
        if self.stream.is_some() {
          self.write_frames().await;
        } else {
          self.start_connect();
        }
      }
      Command::FlushPending => {
        self.pipeline.flush_pending();
        self.write_frames().await;
      }
      Command::FlushActive => self.write_frames().await,
      Command::FailBuffered(message) => self.pipeline.flush_with_error(&message),
      Command::Close => {}
    }
  }

  fn start_connect(&mut self) {
    if self.stream.is_some() || self.connecting.is_some() {
      return;
    }
    debug!(host = %self.options.host, port = self.options.port, "connecting");

    let options = self.options.clone();
    self.connecting = Some(Box::pin(async move { open_stream(&options).await }));

    let now = Instant::now();
    self.connect_deadline.get_or_insert(now + self.options.timeout);
    self.retry_at = Some(now + self.options.retry_interval * 2);
  }

  async fn on_connect_result(&mut self, result: Result<ClientStream>) {
    match result {
      Ok(stream) => {
        debug!(host = %self.options.host, port = self.options.port, "connected");
        self.stream = Some(stream);
        self.connect_deadline = None;
        self.retry_at = None;
        self.touch();

        self.write_frames().await;
        self.emit(ConnectionEvent::Connected);
        if self.stream.is_some() && self.pipeline.has_queued() {
          self.emit(ConnectionEvent::AuthRequired);
        }
      }
      Err(e) => {
        warn!(error = %e, "connect failed");
        self.emit_error(ConnectionErrorKind::Network, e.to_string());
        if self.pipeline.has_queued() {
          self.retry_at.get_or_insert(Instant::now() + self.options.retry_interval);
        }
      }
    }
  }

  fn on_connect_timeout(&mut self) {
    self.connect_deadline = None;
    if self.stream.is_some() {
      return;
    }
    warn!(timeout = ?self.options.timeout, "connect timed out");
    self.connecting = None;
    self.pipeline.flush_with_error("Connection timed out");
    self.emit_error(ConnectionErrorKind::Transport, "Connection timed out");
    self.start_connect();
  }

  fn on_retry(&mut self) {
    self.retry_at = None;
    if self.stream.is_none() && self.connecting.is_none() && self.pipeline.has_queued() {
      debug!("retrying connection");
      self.start_connect();
    }
  }

  async fn on_idle(&mut self) {
    self.idle_deadline = None;
    if self.stream.is_none() {
      return;
    }
    if self.pipeline.has_queued() {
      // Busy connection; the timeout is spurious.
      self.touch();
    } else {
      debug!("closing idle connection");
      self.handle_close().await;
    }
  }

  async fn on_read(&mut self, read: io::Result<usize>) {
    let n = match read {
      Ok(0) => {
        debug!("connection closed by server");
        self.handle_close().await;
        return;
      }
      Ok(n) => n,
      Err(e) => {
        warn!(error = %e, "read failed");
        self.emit_error(ConnectionErrorKind::Network, e.to_string());
        self.handle_close().await;
        return;
      }
    };
    self.touch();

    if self.options.debug {
      debug!(bytes = n, data = %String::from_utf8_lossy(&self.read_buf[..n]), "received");
    } else {
      trace!(bytes = n, "received");
    }

    let mut end = false;
    for outcome in self.pipeline.receive(&self.read_buf[..n]) {
      match outcome {
        Outcome::Push(frame) => self.emit(ConnectionEvent::Push(frame)),
        Outcome::ProtocolError(message) => self.emit_error(ConnectionErrorKind::Protocol, message),
        Outcome::ServerError(message) => self.emit_error(ConnectionErrorKind::Server, message),
        Outcome::End => end = true,
      }
    }

    if end {
      debug!("server ended the connection");
      self.handle_close().await;
    } else {
      self.write_frames().await;
    }
  }

  async fn write_frames(&mut self) {
    let Some(stream) = self.stream.as_mut() else {
      return;
    };
    let frames = self.pipeline.next_frames();
    if frames.is_empty() {
      return;
    }

    let mut failed = None;
    for frame in &frames {
      if self.options.debug {
        debug!(frame = %frame.trim_end(), "sending");
      } else {
        trace!(bytes = frame.len(), "sending");
      }
      if let Err(e) = stream.write_all(frame.as_bytes()).await {
        failed = Some(e);
        break;
      }
    }
    if failed.is_none() {
      if let Err(e) = stream.flush().await {
        failed = Some(e);
      }
    }
    self.touch();

    if let Some(e) = failed {
      warn!(error = %e, "write failed");
      self.emit_error(ConnectionErrorKind::Network, e.to_string());
      self.handle_close().await;
    }
  }

  /// Socket gone: requeue and reconnect if work remains.
  async fn handle_close(&mut self) {
    let Some(mut stream) = self.stream.take() else {
      return;
    };
    let _ = stream.shutdown().await;
    self.idle_deadline = None;

    self.pipeline.requeue();
    self.emit(ConnectionEvent::Closed);

    if self.pipeline.has_queued() {
      debug!(pending = self.pipeline.pending_len(), "reconnecting with queued requests");
      self.start_connect();
    }
  }

  async fn shutdown(&mut self) {
    self.connecting = None;
    if let Some(mut stream) = self.stream.take() {
      let _ = stream.shutdown().await;
      self.emit(ConnectionEvent::Closed);
    }
    debug!("connection shut down");
  }

  fn touch(&mut self) {
    self.idle_deadline = Some(Instant::now() + self.options.timeout);
  }

  fn emit(&self, event: ConnectionEvent) {
    // Owner gone means nobody is listening.
    let _ = self.events.send(event);
  }

  fn emit_error(&self, kind: ConnectionErrorKind, message: impl Into<String>) {
    self.emit(ConnectionEvent::Error(ConnectionError::new(kind, message)));
  }
}

async fn wait_connect(
  connecting: &mut Option<BoxFuture<'static, Result<ClientStream>>>,
) -> Result<ClientStream> {
  match connecting {
    Some(future) => future.await,
    None => std::future::pending().await,
  }
}

async fn read_some(stream: &mut Option<ClientStream>, buf: &mut [u8]) -> io::Result<usize> {
  match stream {
    Some(stream) => stream.read(buf).await,
    None => std::future::pending().await,
  }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
  match deadline {
    Some(deadline) => sleep_until(deadline).await,
    None => std::future::pending().await,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_connection_error_display() {
    let cases = [
      (ConnectionErrorKind::Transport, "Error: boom"),
      (ConnectionErrorKind::Network, "Network error: boom"),
      (ConnectionErrorKind::Protocol, "Protocol error: boom"),
      (ConnectionErrorKind::Server, "Server error: boom"),
    ];
    for (kind, expected) in cases {
      assert_eq!(ConnectionError::new(kind, "boom").to_string(), expected);
    }
  }

  fn task() -> (ConnectionTask, mpsc::UnboundedReceiver<ConnectionEvent>) {
    let options = ConnectionOptions {
      host: "127.0.0.1".to_string(),
      port: 1,
      tls: false,
      verify_cert: true,
      timeout: Duration::from_secs(30),
      retry_interval: Duration::from_secs(3),
      max_concurrent: 10,
      debug: false,
    };
    let (_cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    (ConnectionTask::new(options, cmd_rx, events_tx), events_rx)
  }

  fn refused() -> Result<ClientStream> {
    Err(Error::Connection("refused".to_string()))
  }

  #[tokio::test]
  async fn test_connect_failure_keeps_scheduled_retry() {
    let (mut task, mut events) = task();
    task.pipeline.enqueue(Request::new("auth", vec![]));

    let scheduled = Instant::now() + Duration::from_secs(60);
    task.retry_at = Some(scheduled);
    task.on_connect_result(refused()).await;
    assert_eq!(task.retry_at, Some(scheduled));

    match events.try_recv() {
      Ok(ConnectionEvent::Error(error)) => assert_eq!(error.kind, ConnectionErrorKind::Network),
      other => panic!("Expected network error, got: {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_connect_failure_schedules_retry_only_with_work() {
    let (mut task, _events) = task();
    task.on_connect_result(refused()).await;
    assert!(task.retry_at.is_none());

    task.pipeline.enqueue(Request::new("auth", vec![]));
    let before = Instant::now();
    task.on_connect_result(refused()).await;
    let retry_at = task.retry_at.expect("retry scheduled");
    assert!(retry_at >= before + Duration::from_secs(3));
  }
}
