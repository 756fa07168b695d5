//! Swell Rust Client
//!
//! A persistent client for the Swell API. Requests are multiplexed over one
//! long-lived TLS socket as newline-delimited JSON, and `get` responses are
//! cached locally and invalidated by the collection versions the server
//! pushes.
//!
//! # Example
//!
//! ```no_run
//! use serde_json::json;
//! use swell::{Client, ClientOptions};
//!
//! #[tokio::main]
//! async fn main() -> swell::Result<()> {
//!     let client = Client::new("my-store", "secret-key", ClientOptions::default())?;
//!
//!     client.on_push(|frame| println!("invalidated: {}", frame));
//!
//!     // Served from the local cache on repeat calls
//!     let products = client.get("/products", json!({"limit": 10})).await?;
//!     println!("Products: {}", products.data);
//!
//!     // Writes go straight to the server
//!     client.put("/products/abc", json!({"name": "Shoes"})).await?;
//!
//!     client.close();
//!     Ok(())
//! }
//! ```

mod auth;
pub mod cache;
mod client;
mod config;
pub mod connection;
mod deferred;
mod error;
pub mod protocol;

pub use auth::{auth_key, key_hash};
pub use cache::{CacheStore, ResponseCache, StoreKind, StoreRegistry};
pub use client::{Client, GetOptions, Response};
pub use config::{
  CacheOptions, ClientOptions, DEFAULT_HOST, DEFAULT_MAX_CONCURRENT, DEFAULT_PORT,
  DEFAULT_RETRY_INTERVAL,
  DEFAULT_TIMEOUT,
};
pub use connection::{ConnectionError, ConnectionErrorKind};
pub use deferred::{DeferredData, PendingValue, RequestData};
pub use error::{Error, Result};
pub use protocol::{Method, PROTOCOL_VERSION, USER_AGENT};
