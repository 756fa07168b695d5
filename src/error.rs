//! Error types for the Swell client.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
  #[error("Configuration error: {0}")]
  Config(String),

  #[error("Unsupported cache store: {0}")]
  UnsupportedStore(String),

  #[error("Invalid argument: {0}")]
  InvalidArgument(String),

  #[error("Connection error: {0}")]
  Connection(String),

  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),

  #[error("TLS error: {0}")]
  Tls(String),

  #[error("Protocol error: {0}")]
  Protocol(String),

  /// Error declared by the server in a response's `$error` field.
  #[error("{message}")]
  Server { message: String, status: u16 },

  #[error("Serialization error: {0}")]
  Serialization(String),

  #[error("Timeout")]
  Timeout,

  #[error("Channel closed")]
  ChannelClosed,
}

impl Error {
  pub fn server(message: impl Into<String>, status: u16) -> Self {
    Self::Server {
      message: message.into(),
      status,
    }
  }

  /// Status code declared by the server, if this is a server error.
  pub fn status(&self) -> Option<u16> {
    match self {
      Self::Server { status, .. } => Some(*status),
      _ => None,
    }
  }
}

impl From<serde_json::Error> for Error {
  fn from(e: serde_json::Error) -> Self {
    Self::Serialization(e.to_string())
  }
}

impl From<rustls::Error> for Error {
  fn from(e: rustls::Error) -> Self {
    Self::Tls(e.to_string())
  }
}

pub type Result<T> = std::result::Result<T, Error>;
