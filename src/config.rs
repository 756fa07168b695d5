//! Client configuration.

use std::time::Duration;

use crate::auth::Credentials;
use crate::cache::{StoreKind, StoreRegistry, DEFAULT_INDEX_LIMIT};
use crate::connection::ConnectionOptions;
use crate::error::{Error, Result};
use crate::protocol::PROTOCOL_VERSION;

pub const DEFAULT_HOST: &str = "api.swell.store";
pub const DEFAULT_PORT: u16 = 8443;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(30_000);
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(3_000);
pub const DEFAULT_MAX_CONCURRENT: usize = 10;

/// Response cache options
#[derive(Debug, Clone)]
pub struct CacheOptions {
  pub store: StoreKind,
  /// Maximum number of keys indexed per collection
  pub index_limit: usize,
}

impl Default for CacheOptions {
  fn default() -> Self {
    Self {
      store: StoreKind::Memory,
      index_limit: DEFAULT_INDEX_LIMIT,
    }
  }
}

impl CacheOptions {
  pub fn with_store(mut self, store: StoreKind) -> Self {
    self.store = store;
    self
  }

  /// Select the store by name (`"memory"` or `"shared"`).
  pub fn with_store_name(self, name: &str) -> Result<Self> {
    Ok(self.with_store(name.parse()?))
  }

  pub fn with_index_limit(mut self, limit: usize) -> Self {
    self.index_limit = limit;
    self
  }
}

/// Client connection options
#[derive(Debug, Clone)]
pub struct ClientOptions {
  pub host: String,
  pub port: u16,
  /// Plaintext TCP when false
  pub tls: bool,
  pub verify_cert: bool,
  pub version: u32,
  pub session: Option<String>,
  /// Sub-client id the session is routed to
  pub route: Option<String>,
  /// Connect timeout, also used as the socket idle timeout
  pub timeout: Duration,
  pub retry_interval: Duration,
  pub max_concurrent: usize,
  /// `None` disables caching
  pub cache: Option<CacheOptions>,
  pub debug: bool,
  pub user_application: Option<String>,
  /// Backing map for shared cache stores; the process-wide registry when unset
  pub registry: Option<StoreRegistry>,
}

impl Default for ClientOptions {
  fn default() -> Self {
    Self {
      host: DEFAULT_HOST.to_string(),
      port: DEFAULT_PORT,
      tls: true,
      verify_cert: true,
      version: PROTOCOL_VERSION,
      session: None,
      route: None,
      timeout: DEFAULT_TIMEOUT,
      retry_interval: DEFAULT_RETRY_INTERVAL,
      max_concurrent: DEFAULT_MAX_CONCURRENT,
      cache: Some(CacheOptions::default()),
      debug: false,
      user_application: None,
      registry: None,
    }
  }
}

impl ClientOptions {
  pub fn new(host: impl Into<String>, port: u16) -> Self {
    Self {
      host: host.into(),
      port,
      ..Self::default()
    }
  }

  pub fn with_host(mut self, host: impl Into<String>) -> Self {
    self.host = host.into();
    self
  }

  pub fn with_port(mut self, port: u16) -> Self {
    self.port = port;
    self
  }

  pub fn with_tls(mut self, tls: bool) -> Self {
    self.tls = tls;
    self
  }

  pub fn with_verify_cert(mut self, verify: bool) -> Self {
    self.verify_cert = verify;
    self
  }

  pub fn with_version(mut self, version: u32) -> Self {
    self.version = version;
    self
  }

  pub fn with_session(mut self, session: impl Into<String>) -> Self {
    self.session = Some(session.into());
    self
  }

  pub fn with_route(mut self, route: impl Into<String>) -> Self {
    self.route = Some(route.into());
    self
  }

  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = timeout;
    self
  }

  pub fn with_retry_interval(mut self, interval: Duration) -> Self {
    self.retry_interval = interval;
    self
  }

  pub fn with_max_concurrent(mut self, max: usize) -> Self {
    self.max_concurrent = max;
    self
  }

  pub fn with_cache(mut self, cache: CacheOptions) -> Self {
    self.cache = Some(cache);
    self
  }

  pub fn without_cache(mut self) -> Self {
    self.cache = None;
    self
  }

  pub fn with_debug(mut self, debug: bool) -> Self {
    self.debug = debug;
    self
  }

  pub fn with_user_application(mut self, app: impl Into<String>) -> Self {
    self.user_application = Some(app.into());
    self
  }

  pub fn with_registry(mut self, registry: StoreRegistry) -> Self {
    self.registry = Some(registry);
    self
  }

  pub(crate) fn connection_options(&self) -> ConnectionOptions {
    ConnectionOptions {
      host: self.host.clone(),
      port: self.port,
      tls: self.tls,
      verify_cert: self.verify_cert,
      timeout: self.timeout,
      retry_interval: self.retry_interval,
      max_concurrent: self.max_concurrent.max(1),
      debug: self.debug,
    }
  }
}

/// Validated client parameters, immutable after construction.
#[derive(Debug, Clone)]
pub(crate) struct ClientParams {
  pub client_id: String,
  pub client_key: String,
  pub options: ClientOptions,
}

impl ClientParams {
  pub fn new(client_id: &str, client_key: &str, options: ClientOptions) -> Result<Self> {
    if client_id.is_empty() {
      return Err(Error::Config("Missing client id".to_string()));
    }
    if client_key.is_empty() {
      return Err(Error::Config("Missing client key".to_string()));
    }
    Ok(Self {
      client_id: client_id.to_string(),
      client_key: client_key.to_string(),
      options,
    })
  }

  /// Routed sub-client id if configured, else the client id. Namespaces the cache.
  pub fn end_client_id(&self) -> &str {
    self.options.route.as_deref().unwrap_or(&self.client_id)
  }

  pub fn credentials(&self, session: Option<String>) -> Credentials {
    Credentials {
      client_id: self.client_id.clone(),
      client_key: self.client_key.clone(),
      version: self.options.version,
      route: self.options.route.clone(),
      session: session.or_else(|| self.options.session.clone()),
      push: self.options.cache.is_some(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_missing_fields() {
    match ClientParams::new("", "key", ClientOptions::default()) {
      Err(Error::Config(msg)) => assert!(msg.contains("client id")),
      other => panic!("Expected Config error, got: {:?}", other),
    }
    match ClientParams::new("id", "", ClientOptions::default()) {
      Err(Error::Config(msg)) => assert!(msg.contains("client key")),
      other => panic!("Expected Config error, got: {:?}", other),
    }
  }

  #[test]
  fn test_end_client_id() {
    let params = ClientParams::new("id", "key", ClientOptions::default()).unwrap();
    assert_eq!(params.end_client_id(), "id");

    let routed =
      ClientParams::new("id", "key", ClientOptions::default().with_route("child")).unwrap();
    assert_eq!(routed.end_client_id(), "child");
  }

  #[test]
  fn test_credentials_prefer_captured_session() {
    let params =
      ClientParams::new("id", "key", ClientOptions::default().with_session("configured")).unwrap();
    assert_eq!(params.credentials(None).session.as_deref(), Some("configured"));
    assert_eq!(
      params.credentials(Some("captured".to_string())).session.as_deref(),
      Some("captured")
    );
    assert!(params.credentials(None).push);
  }

  #[test]
  fn test_connection_options_clamp_concurrency() {
    let options = ClientOptions::default().with_max_concurrent(0).connection_options();
    assert_eq!(options.max_concurrent, 1);
  }
}
