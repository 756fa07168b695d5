//! Client session: connection, authorization and read-through caching.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::auth::cached_payload;
use crate::cache::{open_store, ResponseCache, StoreRegistry, Versions};
use crate::config::{ClientOptions, ClientParams};
use crate::connection::{Connection, ConnectionError, ConnectionEvent};
use crate::deferred::RequestData;
use crate::error::{Error, Result};
use crate::protocol::{self, fields, Method, Request, ACTION_AUTH, ACTION_CACHED, USER_AGENT};

/// A successful response.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
  /// The `$data` payload
  pub data: Value,
  /// The raw response frame
  pub headers: Value,
}

impl Response {
  /// True when the response was served from the local cache.
  pub fn is_cached(&self) -> bool {
    self.headers.get(fields::CACHED) == Some(&Value::Bool(true))
  }
}

/// Per-call options for [`Client::get_with`].
#[derive(Debug, Clone, Copy, Default)]
pub struct GetOptions {
  /// Skip the cache lookup and ask the server not to serve from its cache.
  pub nocache: bool,
}

type Callback = Arc<dyn Fn() + Send + Sync>;
type ErrorCallback = Arc<dyn Fn(&ConnectionError) + Send + Sync>;
type PushCallback = Arc<dyn Fn(&Value) + Send + Sync>;

#[derive(Default)]
struct Listeners {
  connect: Vec<Callback>,
  close: Vec<Callback>,
  error: Vec<ErrorCallback>,
  push: Vec<PushCallback>,
}

enum AuthStrategy {
  Key,
  Nonce(Option<String>),
}

/// A get issued before authorization, replayed once it completes.
struct PendingGet {
  url: String,
  data: Value,
  options: GetOptions,
  reply: oneshot::Sender<Result<Response>>,
}

struct Submitted {
  rx: oneshot::Receiver<Value>,
  /// The request carried credentials and doubles as authorization.
  inline_auth: bool,
  epoch: u64,
}

#[derive(Default)]
struct State {
  connection: Option<Connection>,
  /// Bumped for every new connection; events from older ones are ignored.
  generation: u64,
  /// Bumped whenever the socket closes or is replaced.
  epoch: u64,
  cache: Option<ResponseCache>,
  authed: bool,
  /// Authorization outstanding on the current connection.
  authing: bool,
  /// A dedicated authorization flow is running.
  auth_task: bool,
  sent_versions: bool,
  env: Option<String>,
  session: Option<String>,
  gets_pending_auth: VecDeque<PendingGet>,
  auth_waiters: Vec<oneshot::Sender<Result<()>>>,
}

struct Inner {
  params: ClientParams,
  registry: StoreRegistry,
  state: Mutex<State>,
  listeners: Mutex<Listeners>,
}

/// Client for the Swell API.
///
/// Cheap to clone; clones share one connection, cache and session.
#[derive(Clone)]
pub struct Client {
  inner: Arc<Inner>,
}

impl Client {
  /// Validate credentials and build a client. Nothing connects until the
  /// first request (or [`Client::connect`]).
  pub fn new(client_id: &str, client_key: &str, options: ClientOptions) -> Result<Self> {
    let params = ClientParams::new(client_id, client_key, options)?;
    let registry = params
      .options
      .registry
      .clone()
      .unwrap_or_else(|| StoreRegistry::global().clone());

    Ok(Self {
      inner: Arc::new(Inner {
        params,
        registry,
        state: Mutex::new(State::default()),
        listeners: Mutex::new(Listeners::default()),
      }),
    })
  }

  pub fn options(&self) -> &ClientOptions {
    &self.inner.params.options
  }

  pub fn client_id(&self) -> &str {
    &self.inner.params.client_id
  }

  pub fn is_authed(&self) -> bool {
    self.state().authed
  }

  pub fn is_connected(&self) -> bool {
    self.state().connection.is_some()
  }

  /// Environment declared by the server during authorization.
  pub fn env(&self) -> Option<String> {
    self.state().env.clone()
  }

  /// Collection versions known to the local cache.
  pub fn cached_versions(&self) -> Versions {
    let mut state = self.state();
    self.ensure_cache(&mut state);
    state
      .cache
      .as_mut()
      .map(ResponseCache::get_versions)
      .unwrap_or_default()
  }

  pub fn on_connect(&self, f: impl Fn() + Send + Sync + 'static) {
    self.listeners().connect.push(Arc::new(f));
  }

  pub fn on_close(&self, f: impl Fn() + Send + Sync + 'static) {
    self.listeners().close.push(Arc::new(f));
  }

  /// Connection errors are only reported once a listener is registered.
  pub fn on_error(&self, f: impl Fn(&ConnectionError) + Send + Sync + 'static) {
    self.listeners().error.push(Arc::new(f));
  }

  /// Called with every push frame, after its invalidations were applied.
  pub fn on_push(&self, f: impl Fn(&Value) + Send + Sync + 'static) {
    self.listeners().push.push(Arc::new(f));
  }

  /// Open the connection if there is none.
  ///
  /// # Panics
  ///
  /// Must be called from within a Tokio runtime; the connection runs as a
  /// spawned task. The async request methods open the connection on demand
  /// and never need this.
  pub fn connect(&self) {
    let mut state = self.state();
    self.ensure_connection(&mut state);
  }

  /// Tear down the connection and notify close listeners. Does nothing when
  /// already closed.
  pub fn close(&self) {
    let connection = {
      let mut state = self.state();
      let Some(connection) = state.connection.take() else {
        return;
      };
      state.generation += 1;
      state.epoch += 1;
      state.authed = false;
      state.authing = false;
      state.sent_versions = false;
      if let Some(cache) = state.cache.as_mut() {
        cache.reset();
      }
      connection
    };
    debug!("closing client connection");
    connection.close();

    // The task's own Closed event belongs to a retired generation.
    let listeners = self.listeners().close.clone();
    listeners.iter().for_each(|f| f());
  }

  pub async fn get(&self, url: &str, data: impl Into<RequestData>) -> Result<Response> {
    self.get_with(url, data, GetOptions::default()).await
  }

  /// Retrieve `url`, answering from the local cache when possible.
  pub async fn get_with(
    &self,
    url: &str,
    data: impl Into<RequestData>,
    options: GetOptions,
  ) -> Result<Response> {
    if url.is_empty() {
      return Err(Error::InvalidArgument("url is required".to_string()));
    }
    let data = data.into().resolve().await?;

    let queued = {
      let mut state = self.state();
      if state.authed {
        Err(data)
      } else {
        let (reply, rx) = oneshot::channel();
        state.gets_pending_auth.push_back(PendingGet {
          url: url.to_string(),
          data,
          options,
          reply,
        });
        Ok((rx, Self::claim_authorization(&mut state)))
      }
    };
    let (rx, start_auth) = match queued {
      Ok(queued) => queued,
      Err(data) => return self.fetch_get(url, data, options).await,
    };

    if start_auth {
      self.spawn_authorization(AuthStrategy::Key);
    }
    rx.await.map_err(|_| Error::ChannelClosed)?
  }

  pub async fn put(&self, url: &str, data: impl Into<RequestData>) -> Result<Response> {
    self.request(Method::Put, url, data).await
  }

  pub async fn post(&self, url: &str, data: impl Into<RequestData>) -> Result<Response> {
    self.request(Method::Post, url, data).await
  }

  pub async fn delete(&self, url: &str, data: impl Into<RequestData>) -> Result<Response> {
    self.request(Method::Delete, url, data).await
  }

  /// Send a request over the wire. Pending values in `data` are resolved
  /// first; the cache is never consulted, only updated.
  pub async fn request(
    &self,
    method: Method,
    url: &str,
    data: impl Into<RequestData>,
  ) -> Result<Response> {
    let data = data.into().resolve().await?;
    self.send(method, url, &data, false).await
  }

  /// Key-based authorization.
  pub async fn auth_with_key(&self) -> Result<()> {
    self.authorize(AuthStrategy::Key).await
  }

  /// Nonce-based authorization. Asks the server for a nonce when none is given.
  pub async fn auth(&self, nonce: Option<&str>) -> Result<()> {
    self.authorize(AuthStrategy::Nonce(nonce.map(str::to_string))).await
  }

  /// Push local cache versions to the server, once per connection.
  pub async fn send_cached_versions(&self) -> Result<()> {
    if let Some((rx, epoch)) = self.submit_cached_versions()? {
      self.finish_cached_versions(rx, epoch).await;
    }
    Ok(())
  }

  fn state(&self) -> MutexGuard<'_, State> {
    self.inner.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  fn listeners(&self) -> MutexGuard<'_, Listeners> {
    self.inner.listeners.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  fn ensure_cache(&self, state: &mut State) {
    if state.cache.is_some() {
      return;
    }
    let Some(options) = &self.inner.params.options.cache else {
      return;
    };
    let store = open_store(options.store, &self.inner.registry);
    let mut cache =
      ResponseCache::new(self.inner.params.end_client_id(), store, options.index_limit);
    cache.set_env(state.env.clone());
    state.cache = Some(cache);
  }

  fn ensure_connection(&self, state: &mut State) {
    if state.connection.as_ref().map(Connection::is_running).unwrap_or(false) {
      return;
    }
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    state.generation += 1;
    state.epoch += 1;
    state.authed = false;
    state.authing = state.auth_task;
    state.sent_versions = false;
    let options = self.inner.params.options.connection_options();
    state.connection = Some(Connection::open(options, events_tx));

    tokio::spawn(event_loop(Arc::downgrade(&self.inner), events_rx, state.generation));
  }

  fn claim_authorization(state: &mut State) -> bool {
    if state.authing {
      return false;
    }
    state.authing = true;
    state.auth_task = true;
    true
  }

  fn spawn_authorization(&self, strategy: AuthStrategy) {
    let client = self.clone();
    tokio::spawn(async move {
      if let Err(e) = client.run_authorization(strategy).await {
        warn!(error = %e, "authorization failed");
      }
    });
  }

  async fn authorize(&self, strategy: AuthStrategy) -> Result<()> {
    {
      let mut state = self.state();
      state.authing = true;
      state.auth_task = true;
    }
    self.run_authorization(strategy).await
  }

  async fn run_authorization(&self, strategy: AuthStrategy) -> Result<()> {
    let result = self.authorization_exchange(strategy).await;
    {
      let mut state = self.state();
      state.auth_task = false;
      if result.is_err() {
        state.authing = false;
      }
    }
    if let Err(e) = &result {
      self.fail_waiting_for_auth(e);
    }
    result
  }

  async fn authorization_exchange(&self, strategy: AuthStrategy) -> Result<()> {
    loop {
      let nonce = match &strategy {
        AuthStrategy::Key => None,
        AuthStrategy::Nonce(Some(nonce)) => Some(nonce.clone()),
        AuthStrategy::Nonce(None) => Some(self.request_nonce().await?),
      };

      let payload = {
        let state = self.state();
        let credentials = self.inner.params.credentials(state.session.clone());
        match &nonce {
          Some(nonce) => credentials.nonce_payload(nonce),
          None => credentials.key_payload(),
        }
      };

      let (rx, epoch) = self.submit_service(ACTION_AUTH, payload)?;
      let response = match rx.await {
        Ok(response) => response,
        // Dropped by a disconnect; try again on the next connection.
        Err(_) if self.is_connected() => continue,
        Err(_) => return Err(Error::ChannelClosed),
      };

      if let Some(message) = protocol::error_message(&response) {
        let status = protocol::status(&response).unwrap_or(401);
        if let Some(connection) = self.state().connection.as_ref() {
          let _ = connection.fail_buffered(message.clone());
        }
        return Err(Error::server(message, status));
      }

      // The socket closed before the session could use it
      if !self.on_authenticated(&response, epoch).await {
        continue;
      }
      return Ok(());
    }
  }

  async fn request_nonce(&self) -> Result<String> {
    let (rx, _) = self.submit_service(ACTION_AUTH, Value::Object(Map::new()))?;
    let response = rx.await.map_err(|_| Error::ChannelClosed)?;
    if let Some(message) = protocol::error_message(&response) {
      return Err(Error::server(message, protocol::status(&response).unwrap_or(500)));
    }
    response
      .get(fields::DATA)
      .and_then(Value::as_str)
      .or_else(|| response.get(fields::AUTH).and_then(Value::as_str))
      .map(str::to_string)
      .ok_or_else(|| Error::Protocol("Server did not return an auth nonce".to_string()))
  }

  /// Authorization succeeded: record the session, sync cache versions,
  /// release held requests and replay waiting gets. Returns false when the
  /// connection it was granted on is already gone.
  async fn on_authenticated(&self, response: &Value, epoch: u64) -> bool {
    let already_authed = {
      let mut state = self.state();
      if state.epoch != epoch {
        return false;
      }
      let already_authed = state.authed;
      state.authed = true;
      state.authing = false;

      if let Some(env) = response.get(fields::ENV).and_then(Value::as_str) {
        state.env = Some(env.to_string());
      }
      if let Some(session) = response.get(fields::SESSION).and_then(Value::as_str) {
        state.session = Some(session.to_string());
      }
      let env = state.env.clone();
      if let Some(cache) = state.cache.as_mut() {
        cache.set_env(env);
      }
      already_authed
    };

    if !already_authed {
      debug!(env = ?self.env(), "authorized");
      let sync = match self.submit_cached_versions() {
        Ok(sync) => sync,
        Err(e) => {
          warn!(error = %e, "cache version sync failed");
          None
        }
      };
      if let Some(connection) = self.state().connection.as_ref() {
        let _ = connection.flush_pending();
      }
      if let Some((rx, epoch)) = sync {
        self.finish_cached_versions(rx, epoch).await;
      }
    }

    let (gets, waiters) = {
      let mut state = self.state();
      (
        std::mem::take(&mut state.gets_pending_auth),
        std::mem::take(&mut state.auth_waiters),
      )
    };
    for waiter in waiters {
      let _ = waiter.send(Ok(()));
    }
    for pending in gets {
      self.dispatch_get(pending);
    }
    true
  }

  fn fail_waiting_for_auth(&self, error: &Error) {
    let (gets, waiters) = {
      let mut state = self.state();
      (
        std::mem::take(&mut state.gets_pending_auth),
        std::mem::take(&mut state.auth_waiters),
      )
    };
    for pending in gets {
      let _ = pending.reply.send(Err(replicate(error)));
    }
    for waiter in waiters {
      let _ = waiter.send(Err(replicate(error)));
    }
  }

  fn submit_cached_versions(&self) -> Result<Option<(oneshot::Receiver<Value>, u64)>> {
    let versions = {
      let mut state = self.state();
      self.ensure_cache(&mut state);
      if state.sent_versions {
        return Ok(None);
      }
      let Some(cache) = state.cache.as_mut() else {
        return Ok(None);
      };
      let versions = cache.get_versions();
      if versions.is_empty() {
        state.sent_versions = true;
        return Ok(None);
      }
      versions
    };

    self.submit_service(ACTION_CACHED, cached_payload(&versions)).map(Some)
  }

  async fn finish_cached_versions(&self, rx: oneshot::Receiver<Value>, epoch: u64) {
    let Ok(response) = rx.await else {
      return;
    };
    let mut state = self.state();
    if state.epoch != epoch {
      return;
    }
    state.sent_versions = true;
    if let Some(cache) = state.cache.as_mut() {
      cache.clear(&response);
    }
  }

  fn submit_service(
    &self,
    action: &str,
    payload: Value,
  ) -> Result<(oneshot::Receiver<Value>, u64)> {
    let mut state = self.state();
    self.ensure_connection(&mut state);
    let (request, rx) = Request::new(action, vec![payload])
      .with_id(Uuid::new_v4().to_string())
      .with_reply();
    state
      .connection
      .as_ref()
      .ok_or(Error::ChannelClosed)?
      .request(request)?;
    Ok((rx, state.epoch))
  }

  /// Build the wire request and hand it to the connection.
  fn submit(&self, method: Method, url: &str, data: &Value, nocache: bool) -> Result<Submitted> {
    let options = &self.inner.params.options;
    let mut state = self.state();
    self.ensure_cache(&mut state);
    self.ensure_connection(&mut state);

    let mut headers = Map::new();
    headers.insert(fields::DATA.to_string(), data.clone());
    headers.insert(fields::VERSION.to_string(), Value::from(options.version));
    headers.insert(fields::USER_AGENT.to_string(), Value::String(USER_AGENT.to_string()));
    if let Some(app) = &options.user_application {
      headers.insert(fields::USER_APPLICATION.to_string(), Value::String(app.clone()));
    }
    if nocache {
      headers.insert(fields::NOCACHE.to_string(), Value::Bool(true));
    }

    let inline_auth = !state.authed;
    if inline_auth {
      self
        .inner
        .params
        .credentials(state.session.clone())
        .inline_headers(&mut headers);
      state.authing = true;
    }

    let args = vec![Value::String(url.to_string()), Value::Object(headers)];
    let (request, rx) = Request::new(method.as_str(), args)
      .with_id(Uuid::new_v4().to_string())
      .with_reply();
    state
      .connection
      .as_ref()
      .ok_or(Error::ChannelClosed)?
      .request(request)?;

    Ok(Submitted {
      rx,
      inline_auth,
      epoch: state.epoch,
    })
  }

  async fn send(&self, method: Method, url: &str, data: &Value, nocache: bool) -> Result<Response> {
    let submitted = self.submit(method, url, data, nocache)?;
    self.exchange(method, url, data, nocache, submitted).await
  }

  async fn exchange(
    &self,
    method: Method,
    url: &str,
    data: &Value,
    nocache: bool,
    mut submitted: Submitted,
  ) -> Result<Response> {
    loop {
      let Ok(response) = submitted.rx.await else {
        return self.respond(method, url, data, None);
      };

      if let Some(demand) = protocol::auth_demand(&response) {
        if !protocol::is_end(&response) {
          let nonce = demand.as_str().map(str::to_string);
          self.wait_for_auth(nonce, submitted.inline_auth).await?;
        }
        // Resubmit from scratch, on the new connection if this one ended.
        submitted = self.submit(method, url, data, nocache)?;
        continue;
      }

      if submitted.inline_auth {
        self.after_inline_auth(&response, submitted.epoch).await;
      }
      return self.respond(method, url, data, Some(response));
    }
  }

  /// The server demanded authorization: run (or join) an authorization flow.
  async fn wait_for_auth(&self, nonce: Option<String>, inline_attempt: bool) -> Result<()> {
    let (rx, start) = {
      let mut state = self.state();
      state.authed = false;
      if inline_attempt && !state.auth_task {
        state.authing = false;
      }
      let (tx, rx) = oneshot::channel();
      state.auth_waiters.push(tx);
      (rx, Self::claim_authorization(&mut state))
    };
    if start {
      let strategy = match nonce {
        Some(nonce) => AuthStrategy::Nonce(Some(nonce)),
        None => AuthStrategy::Key,
      };
      self.spawn_authorization(strategy);
    }
    rx.await.map_err(|_| Error::ChannelClosed)?
  }

  /// An ordinary request carried credentials. It counts as authorization
  /// unless the server refused it or the failure never reached the server.
  async fn after_inline_auth(&self, response: &Value, epoch: u64) {
    let status = protocol::status(response);
    let message = protocol::error_message(response);
    let accepted = match &message {
      None => true,
      Some(_) => status.map(|s| s != 401 && s < 500).unwrap_or(false),
    };
    if accepted && self.on_authenticated(response, epoch).await {
      return;
    }

    let refused = message.is_some() && status == Some(401);
    let retry = {
      let mut state = self.state();
      if state.authed || state.auth_task {
        return;
      }
      state.authing = false;
      !refused
        && !(state.gets_pending_auth.is_empty() && state.auth_waiters.is_empty())
        && Self::claim_authorization(&mut state)
    };
    if retry {
      self.spawn_authorization(AuthStrategy::Key);
    } else if let (true, Some(message)) = (refused, message) {
      self.fail_waiting_for_auth(&Error::server(message, 401));
    }
  }

  /// Turn a raw response into the caller's result, updating the cache.
  fn respond(
    &self,
    method: Method,
    url: &str,
    data: &Value,
    response: Option<Value>,
  ) -> Result<Response> {
    let Some(response) = response else {
      return Err(Error::server("Empty response from server", 500));
    };
    if let Some(message) = protocol::error_message(&response) {
      return Err(Error::server(message, protocol::status(&response).unwrap_or(500)));
    }

    {
      let mut state = self.state();
      if let Some(cache) = state.cache.as_mut() {
        cache.clear(&response);
        if method == Method::Get {
          cache.put(url, data, &response);
        }
      }
    }

    Ok(Response {
      data: response.get(fields::DATA).cloned().unwrap_or(Value::Null),
      headers: response,
    })
  }

  fn cached_get(&self, url: &str, data: &Value, options: GetOptions) -> Option<Response> {
    if options.nocache {
      return None;
    }
    let mut state = self.state();
    if !state.sent_versions {
      return None;
    }
    let hit = state.cache.as_mut()?.get(url, data)?;
    let payload = hit.get(fields::DATA)?.clone();
    debug!(url, "cache hit");
    Some(Response {
      data: payload,
      headers: hit,
    })
  }

  async fn fetch_get(&self, url: &str, data: Value, options: GetOptions) -> Result<Response> {
    if let Some(hit) = self.cached_get(url, &data, options) {
      return Ok(hit);
    }
    self.send(Method::Get, url, &data, options.nocache).await
  }

  /// Replay a get that waited for authorization. Submission happens before
  /// returning so replays hit the wire in queue order.
  fn dispatch_get(&self, pending: PendingGet) {
    let PendingGet {
      url,
      data,
      options,
      reply,
    } = pending;

    if let Some(hit) = self.cached_get(&url, &data, options) {
      let _ = reply.send(Ok(hit));
      return;
    }
    match self.submit(Method::Get, &url, &data, options.nocache) {
      Ok(submitted) => {
        let client = self.clone();
        tokio::spawn(async move {
          let result = client
            .exchange(Method::Get, &url, &data, options.nocache, submitted)
            .await;
          let _ = reply.send(result);
        });
      }
      Err(e) => {
        let _ = reply.send(Err(e));
      }
    }
  }

  fn handle_event(&self, event: ConnectionEvent, generation: u64) {
    if self.state().generation != generation {
      return;
    }
    match event {
      ConnectionEvent::Connected => {
        let listeners = self.listeners().connect.clone();
        listeners.iter().for_each(|f| f());
      }
      ConnectionEvent::AuthRequired => self.on_auth_required(),
      ConnectionEvent::Closed => {
        {
          let mut state = self.state();
          state.epoch += 1;
          state.authed = false;
          state.authing = state.auth_task;
          state.sent_versions = false;
          if let Some(cache) = state.cache.as_mut() {
            cache.reset();
          }
        }
        let listeners = self.listeners().close.clone();
        listeners.iter().for_each(|f| f());
      }
      ConnectionEvent::Error(error) => self.emit_error(&error),
      ConnectionEvent::Push(frame) => self.handle_push(&frame),
    }
  }

  fn on_auth_required(&self) {
    let mut state = self.state();
    if state.authed {
      if let Some(connection) = state.connection.as_ref() {
        let _ = connection.flush_pending();
      }
    } else if state.authing {
      if let Some(connection) = state.connection.as_ref() {
        let _ = connection.flush_active();
      }
    } else if Self::claim_authorization(&mut state) {
      drop(state);
      self.spawn_authorization(AuthStrategy::Key);
    }
  }

  fn handle_push(&self, frame: &Value) {
    {
      let mut state = self.state();
      if let Some(cache) = state.cache.as_mut() {
        cache.clear(frame);
      }
    }
    let listeners = self.listeners().push.clone();
    listeners.iter().for_each(|f| f(frame));
  }

  fn emit_error(&self, error: &ConnectionError) {
    let listeners = self.listeners().error.clone();
    if listeners.is_empty() {
      debug!(%error, "unhandled connection error");
      return;
    }
    listeners.iter().for_each(|f| f(error));
  }
}

async fn event_loop(
  inner: Weak<Inner>,
  mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
  generation: u64,
) {
  while let Some(event) = events.recv().await {
    let Some(inner) = inner.upgrade() else {
      break;
    };
    Client { inner }.handle_event(event, generation);
  }
}

/// Errors are not `Clone`; rebuild one for each waiting caller.
fn replicate(error: &Error) -> Error {
  match error {
    Error::Server { message, status } => Error::server(message.clone(), *status),
    Error::ChannelClosed => Error::ChannelClosed,
    Error::Timeout => Error::Timeout,
    other => Error::Connection(other.to_string()),
  }
}
