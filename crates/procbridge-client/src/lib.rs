//! procbridge client library.
//!
//! A [`Client`] opens one TCP connection per call, sends a single request and
//! waits for the matching response.
//!
//! ```rust,no_run
//! use procbridge_client::Client;
//! use serde_json::json;
//!
//! # async fn run() -> procbridge_client::ClientResult<()> {
//! let client = Client::new("127.0.0.1:8077");
//! let greeting = client.call_result("echo", json!({ "echo": "X" })).await?;
//! assert_eq!(greeting, json!("Hello:X"));
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
mod socket;

pub use config::{ClientConfig, DEFAULT_ADDR};
pub use error::{ClientError, ClientResult};
pub use socket::Client;
