//! TCP client for calling apis on a procbridge server.

use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use procbridge_protocol::{
    API_CLOSE, Connection, PUSH_RESP_TO, ProtocolError, RequestPayload, ResponsePayload,
};

use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};

/// Client for a procbridge server.
///
/// Every call opens its own connection, sends one request, reads exactly one
/// frame and closes the connection again. Push frames are not supported: a
/// server that pushes before responding fails the call with a protocol error.
#[derive(Debug)]
pub struct Client {
    config: ClientConfig,
    next_req_id: AtomicI64,
}

impl Client {
    /// Creates a client for the server at `addr`.
    pub fn new(addr: impl Into<String>) -> Self {
        Self::with_config(ClientConfig::new(addr))
    }

    /// Creates a client from a full configuration.
    pub fn with_config(config: ClientConfig) -> Self {
        Self {
            config,
            next_req_id: AtomicI64::new(1),
        }
    }

    /// Returns the client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Calls `api` with `body` and returns the response body.
    ///
    /// `body` must serialize to a JSON object (or null, sent as `{}`).
    /// ErrorResponse and BadResponse come back as
    /// [`ClientError::Application`] and [`ClientError::BadResponse`].
    pub async fn call(&self, api: &str, body: impl Serialize) -> ClientResult<Value> {
        let body = request_body(body)?;
        let req_id = self.next_req_id.fetch_add(1, Ordering::Relaxed);
        let request = RequestPayload::new(api, req_id).with_body(body);

        debug!(addr = %self.config.addr, api, req_id, "calling server");

        let response = self.bounded("call", self.exchange(&request)).await?;
        classify(req_id, response)
    }

    /// Like [`call`](Self::call), but unwraps handler results that the
    /// server wrapped as `{"result": value}`.
    pub async fn call_result(&self, api: &str, body: impl Serialize) -> ClientResult<Value> {
        let value = self.call(api, body).await?;
        match value {
            Value::Object(mut map) if map.len() == 1 && map.contains_key("result") => {
                Ok(map.remove("result").unwrap_or(Value::Null))
            }
            other => Ok(other),
        }
    }

    /// Calls `api` and deserializes the response body into `T`.
    pub async fn call_as<T: DeserializeOwned>(
        &self,
        api: &str,
        body: impl Serialize,
    ) -> ClientResult<T> {
        let value = self.call(api, body).await?;
        serde_json::from_value(value)
            .map_err(|e| ClientError::Protocol(format!("failed to deserialize response: {}", e)))
    }

    /// Asks the server to close a connection without answering.
    ///
    /// Returns once the server has closed its side.
    pub async fn close_remote(&self) -> ClientResult<()> {
        let req_id = self.next_req_id.fetch_add(1, Ordering::Relaxed);
        let request = RequestPayload::new(API_CLOSE, req_id);

        self.bounded("close", self.close_exchange(&request)).await
    }

    async fn close_exchange(&self, request: &RequestPayload) -> ClientResult<()> {
        let mut conn = self.connect().await?;
        conn.send_frame(&request.to_frame()).await?;
        match conn.receive_frame().await {
            Err(ProtocolError::ConnectionClosed) => Ok(()),
            Err(e) => Err(e.into()),
            Ok(frame) => Err(ClientError::Protocol(format!(
                "unexpected {:?} frame after close",
                frame.status
            ))),
        }
    }

    async fn connect(&self) -> ClientResult<Connection<TcpStream>> {
        Connection::connect(self.config.addr.as_str())
            .await
            .map_err(|e| {
                ClientError::Connection(format!("failed to connect to {}: {}", self.config.addr, e))
            })
    }

    /// Performs the request-response exchange on a fresh connection.
    async fn exchange(&self, request: &RequestPayload) -> ClientResult<ResponsePayload> {
        let mut conn = self.connect().await?;

        let result = async {
            conn.send_frame(&request.to_frame()).await?;
            debug!("request sent, waiting for response");
            let frame = conn.receive_frame().await?;
            ResponsePayload::from_frame(&frame)
        }
        .await;

        if let Err(e) = conn.shutdown().await {
            debug!(error = %e, "shutdown after call failed");
        }

        result.map_err(ClientError::from)
    }

    async fn bounded<T>(
        &self,
        operation: &str,
        fut: impl Future<Output = ClientResult<T>>,
    ) -> ClientResult<T> {
        match self.config.timeout {
            Some(limit) => tokio::time::timeout(limit, fut).await.map_err(|_| {
                ClientError::Timeout(format!("{} timed out after {}ms", operation, limit.as_millis()))
            })?,
            None => fut.await,
        }
    }
}

fn request_body(body: impl Serialize) -> ClientResult<Map<String, Value>> {
    match serde_json::to_value(body) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(Value::Null) => Ok(Map::new()),
        Ok(other) => Err(ClientError::InvalidRequest(format!(
            "body must be a JSON object, got {}",
            other
        ))),
        Err(e) => Err(ClientError::InvalidRequest(e.to_string())),
    }
}

fn classify(req_id: i64, response: ResponsePayload) -> ClientResult<Value> {
    match response {
        ResponsePayload::Good { body, resp_to } if resp_to == req_id => {
            debug!(req_id, "response received");
            Ok(Value::Object(body))
        }
        ResponsePayload::Good { resp_to, .. } if resp_to == PUSH_RESP_TO => {
            warn!(req_id, "server pushed data to a client without push support");
            Err(ClientError::Protocol(
                "unexpected push frame before response".to_string(),
            ))
        }
        ResponsePayload::Good { resp_to, .. } => {
            warn!(expected = req_id, received = resp_to, "response respTo mismatch");
            Err(ClientError::Protocol(format!(
                "response answers request {}, expected {}",
                resp_to, req_id
            )))
        }
        ResponsePayload::Error { msg, .. } => Err(ClientError::Application { message: msg }),
        ResponsePayload::Bad { msg, .. } => Err(ClientError::BadResponse { message: msg }),
    }
}
