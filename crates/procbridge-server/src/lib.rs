//! procbridge server: accept loop, connection handler, handler registry.
//!
//! An application registers its apis in a [`HandlerRegistry`], hands it to a
//! [`Server`] and starts it. Every accepted connection is served by its own
//! task running the request loop in [`ConnectionHandler`].
//!
//! # Example
//!
//! ```rust,no_run
//! use procbridge_core::{TracingConfig, init_tracing};
//! use procbridge_server::{HandlerRegistry, RequestContext, Server, ServerConfig};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     init_tracing(TracingConfig::daemon())?;
//!
//!     let mut registry = HandlerRegistry::new();
//!     registry.register("echo", |ctx: RequestContext| async move {
//!         let echo: String = ctx.arg("echo")?;
//!         Ok(json!(format!("Hello:{echo}")))
//!     })?;
//!
//!     let server = Server::new(ServerConfig::default(), registry);
//!     server.start().await?;
//!     server.wait_for_stop().await;
//!     Ok(())
//! }
//! ```

mod config;
mod error;
mod handler;
mod registry;
mod socket;

pub use config::{DEFAULT_HOST, DEFAULT_PORT, ServerConfig, ServerSettings};
pub use error::{ServerError, ServerResult};
pub use handler::ConnectionHandler;
pub use registry::{
    BoxFuture, DispatchError, Handler, HandlerError, HandlerRegistry, HandlerResult,
    RegistryError, RequestContext,
};
pub use socket::{Server, ServerControl};
