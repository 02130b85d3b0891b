//! Handler registry for dispatching requests by api name.
//!
//! The registry is built before the server starts and handed to it by value;
//! the server keeps it behind an `Arc` and never mutates it again.
//!
//! # Example
//!
//! ```rust
//! use procbridge_server::{HandlerError, HandlerRegistry, RequestContext};
//! use serde_json::json;
//!
//! let mut registry = HandlerRegistry::new();
//!
//! registry
//!     .register("echo", |ctx: RequestContext| async move {
//!         let echo: String = ctx.arg("echo")?;
//!         Ok(json!(format!("Hello:{echo}")))
//!     })
//!     .unwrap();
//!
//! registry
//!     .register("add", |ctx: RequestContext| async move {
//!         let elements: Vec<i64> = ctx.arg("elements")?;
//!         for element in &elements {
//!             ctx.push(&json!({ "element": element })).await?;
//!         }
//!         Ok(json!(elements.iter().sum::<i64>()))
//!     })
//!     .unwrap();
//!
//! assert!(registry.contains("echo"));
//! assert!(registry.register("echo", |_ctx: RequestContext| async { Ok(json!(null)) }).is_err());
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;

use futures_util::FutureExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use thiserror::Error;

use procbridge_protocol::{API_CLOSE, ConnectionHandle, ProtocolError, ResponsePayload, StatusCode};

use crate::socket::ServerControl;

/// Value returned by a handler; non-object values are wrapped as
/// `{"result": value}` before they go on the wire.
pub type HandlerResult = Result<Value, HandlerError>;

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Failure signalled by a handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    /// Business failure; answered with an ErrorResponse.
    #[error("{0}")]
    Application(String),

    /// Arguments missing or of the wrong type; answered with an ErrorResponse.
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    /// Unexpected failure; answered with a BadResponse.
    #[error("{0}")]
    Internal(String),
}

impl HandlerError {
    /// Creates an application error.
    pub fn application(message: impl Into<String>) -> Self {
        Self::Application(message.into())
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}

impl From<ProtocolError> for HandlerError {
    fn from(err: ProtocolError) -> Self {
        Self::Internal(err.to_string())
    }
}

/// Errors raised while building a registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// An api with this name is already registered.
    #[error("api already registered: {name}")]
    DuplicateApi { name: String },

    /// Api names must not be empty.
    #[error("api name must not be empty")]
    EmptyName,

    /// The name is reserved by the protocol.
    #[error("api name is reserved: {name}")]
    ReservedName { name: String },
}

/// Outcome of a failed dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// No handler is registered for the api.
    #[error("unknown api: {0}")]
    UnknownApi(String),

    /// The handler returned an error.
    #[error(transparent)]
    Handler(#[from] HandlerError),

    /// The handler panicked.
    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl DispatchError {
    /// Status code of the response this failure is answered with.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::UnknownApi(_)
            | Self::Handler(HandlerError::Application(_))
            | Self::Handler(HandlerError::InvalidArguments(_)) => StatusCode::ErrorResponse,
            Self::Handler(HandlerError::Internal(_)) | Self::Panicked(_) => StatusCode::BadResponse,
        }
    }

    /// Builds the response frame payload for this failure.
    pub fn to_response(&self, resp_to: i64) -> ResponsePayload {
        match self.status() {
            StatusCode::BadResponse => ResponsePayload::bad(resp_to, self.to_string()),
            _ => ResponsePayload::error(resp_to, self.to_string()),
        }
    }
}

/// Everything a handler sees about the request it serves.
#[derive(Debug, Clone)]
pub struct RequestContext {
    api: String,
    req_id: i64,
    body: Map<String, Value>,
    conn: ConnectionHandle,
    server: ServerControl,
}

impl RequestContext {
    /// Creates a request context.
    pub fn new(
        api: impl Into<String>,
        req_id: i64,
        body: Map<String, Value>,
        conn: ConnectionHandle,
    ) -> Self {
        Self {
            api: api.into(),
            req_id,
            body,
            conn,
            server: ServerControl::detached(),
        }
    }

    /// Builder: attach the server running this request.
    pub fn with_server(mut self, server: ServerControl) -> Self {
        self.server = server;
        self
    }

    /// Name of the api being served.
    pub fn api(&self) -> &str {
        &self.api
    }

    /// Correlation id of the request.
    pub fn req_id(&self) -> i64 {
        self.req_id
    }

    /// Raw request body.
    pub fn body(&self) -> &Map<String, Value> {
        &self.body
    }

    /// Deserializes a required named argument.
    pub fn arg<T: DeserializeOwned>(&self, name: &str) -> Result<T, HandlerError> {
        self.arg_opt(name)?
            .ok_or_else(|| HandlerError::InvalidArguments(format!("missing argument `{name}`")))
    }

    /// Deserializes an optional named argument.
    pub fn arg_opt<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, HandlerError> {
        match self.body.get(name) {
            None => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| HandlerError::InvalidArguments(format!("argument `{name}`: {e}"))),
        }
    }

    /// Deserializes the whole body into a typed argument struct.
    pub fn args<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        serde_json::from_value(Value::Object(self.body.clone()))
            .map_err(|e| HandlerError::InvalidArguments(e.to_string()))
    }

    /// Handle to the connection the request arrived on.
    pub fn connection(&self) -> &ConnectionHandle {
        &self.conn
    }

    /// Control over the server running this request, e.g. to stop it.
    pub fn server(&self) -> &ServerControl {
        &self.server
    }

    /// Sends a push frame to the requesting client right away.
    pub async fn push<T: Serialize>(&self, data: &T) -> Result<(), HandlerError> {
        self.conn.push(data).await?;
        Ok(())
    }
}

/// Trait for handler functions.
///
/// Implemented for every `Fn(RequestContext) -> impl Future<Output = HandlerResult>`.
pub trait Handler: Send + Sync + 'static {
    /// Handle a request.
    fn call(&self, ctx: RequestContext) -> BoxFuture<'static, HandlerResult>;
}

impl<F, Fut> Handler for F
where
    F: Fn(RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn call(&self, ctx: RequestContext) -> BoxFuture<'static, HandlerResult> {
        Box::pin(self(ctx))
    }
}

/// Registry mapping api names to handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Box<dyn Handler>>,
}

impl HandlerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under `name`.
    ///
    /// Fails if the name is empty, reserved, or already taken.
    pub fn register<F, Fut>(
        &mut self,
        name: impl Into<String>,
        handler: F,
    ) -> Result<&mut Self, RegistryError>
    where
        F: Fn(RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let name = name.into();
        if name.is_empty() {
            return Err(RegistryError::EmptyName);
        }
        if name == API_CLOSE {
            return Err(RegistryError::ReservedName { name });
        }
        if self.handlers.contains_key(&name) {
            return Err(RegistryError::DuplicateApi { name });
        }
        self.handlers.insert(name, Box::new(handler));
        Ok(self)
    }

    /// Returns true if an api is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Number of registered apis.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Registered api names, sorted.
    pub fn apis(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Invokes the handler registered for `api`.
    ///
    /// A panicking handler is reported as [`DispatchError::Panicked`] rather
    /// than unwinding into the connection task.
    pub async fn dispatch(&self, ctx: RequestContext) -> Result<Value, DispatchError> {
        let handler = self
            .handlers
            .get(ctx.api())
            .ok_or_else(|| DispatchError::UnknownApi(ctx.api().to_string()))?;

        match AssertUnwindSafe(handler.call(ctx)).catch_unwind().await {
            Ok(result) => Ok(result?),
            Err(panic) => Err(DispatchError::Panicked(panic_message(panic.as_ref()))),
        }
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("apis", &self.apis())
            .finish()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
