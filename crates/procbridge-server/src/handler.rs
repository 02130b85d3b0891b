//! Per-connection request loop.
//!
//! Each accepted connection runs one loop, strictly sequentially:
//!
//! ```text
//! ReadingRequest -> Dispatching -> (push frames)* -> WritingResponse -> ReadingRequest
//!        |                                                  |
//!        +--> Closed  (close api, EOF, framing error)       +--> Closed (write failed)
//! ```
//!
//! The next request is not read until the previous response has been fully
//! written. Handler failures become response frames and keep the connection
//! open; framing and transport failures close it.

use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{Span, debug, warn};

use procbridge_protocol::{
    Connection, ConnectionHandle, PUSH_RESP_TO, ProtocolError, RequestPayload, ResponsePayload,
    into_body,
};

use crate::error::ServerResult;
use crate::registry::{HandlerRegistry, RequestContext};
use crate::socket::ServerControl;

/// Serves requests arriving on connections, dispatching them to a registry.
#[derive(Debug, Clone)]
pub struct ConnectionHandler {
    registry: Arc<HandlerRegistry>,
    control: ServerControl,
}

impl ConnectionHandler {
    /// Creates a handler over the given registry, not attached to a server.
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self {
            registry,
            control: ServerControl::detached(),
        }
    }

    /// Builder: hand `control` to every request context.
    pub fn with_control(mut self, control: ServerControl) -> Self {
        self.control = control;
        self
    }

    /// Returns the registry requests are dispatched to.
    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Handles a single request and returns the response to send.
    #[tracing::instrument(
        skip_all,
        fields(api = %request.api, req_id = request.req_id, duration_ms)
    )]
    pub async fn handle(&self, request: RequestPayload, conn: ConnectionHandle) -> ResponsePayload {
        let start = Instant::now();
        let req_id = request.req_id;

        let ctx = RequestContext::new(request.api, req_id, request.body, conn)
            .with_server(self.control.clone());
        let response = match self.registry.dispatch(ctx).await {
            Ok(value) => ResponsePayload::good(req_id, into_body(value)),
            Err(e) => {
                warn!(error = %e, status = ?e.status(), "request failed");
                e.to_response(req_id)
            }
        };

        let duration = start.elapsed();
        Span::current().record("duration_ms", duration.as_millis() as u64);
        debug!(duration_ms = duration.as_millis() as u64, "request handled");

        response
    }

    /// Handles a connection, processing requests until it closes.
    ///
    /// Returns `Ok(())` when the peer disconnects between frames or asks to
    /// close. The write side is shut down on every exit path.
    pub async fn handle_connection<S>(&self, mut conn: Connection<S>) -> ServerResult<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let result = self.serve(&mut conn).await;
        if let Err(e) = conn.shutdown().await {
            debug!(error = %e, "shutdown after close failed");
        }
        result
    }

    async fn serve<S>(&self, conn: &mut Connection<S>) -> ServerResult<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        loop {
            let frame = match conn.receive_frame().await {
                Ok(frame) => frame,
                Err(ProtocolError::ConnectionClosed) => {
                    debug!(peer = ?conn.peer_addr(), "client disconnected");
                    return Ok(());
                }
                Err(e) => {
                    warn!(peer = ?conn.peer_addr(), error = %e, "error reading request");
                    return Err(e.into());
                }
            };

            let request = match RequestPayload::from_frame(&frame) {
                Ok(request) => request,
                Err(e) => {
                    let resp_to =
                        RequestPayload::peek_req_id(&frame.payload).unwrap_or(PUSH_RESP_TO);
                    warn!(peer = ?conn.peer_addr(), error = %e, "rejecting malformed request");
                    if let Err(write_err) = conn
                        .send_response(&ResponsePayload::bad(resp_to, e.to_string()))
                        .await
                    {
                        debug!(error = %write_err, "could not report malformed request");
                    }
                    return Err(e.into());
                }
            };

            if request.is_close() {
                debug!(peer = ?conn.peer_addr(), "close requested");
                return Ok(());
            }

            let req_id = request.req_id;
            let response = self.handle(request, conn.handle()).await;
            match conn.send_response(&response).await {
                Ok(()) => {}
                // Encoding happens before any byte is written, so the stream
                // is still on a frame boundary.
                Err(e @ (ProtocolError::MessageTooLarge { .. } | ProtocolError::Serialization(_))) => {
                    warn!(req_id, error = %e, "response could not be encoded");
                    conn.send_response(&ResponsePayload::bad(req_id, e.to_string()))
                        .await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::HandlerError;
    use procbridge_protocol::{API_CLOSE, Frame, MAX_PAYLOAD_SIZE, StatusCode, encode_frame};
    use serde_json::{Value, json};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::task::JoinHandle;

    fn registry() -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        registry
            .register("echo", |ctx: RequestContext| async move {
                let echo: String = ctx.arg("echo")?;
                Ok(json!(format!("Hello:{echo}")))
            })
            .unwrap()
            .register("add", |ctx: RequestContext| async move {
                let elements: Vec<i64> = ctx.arg("elements")?;
                for element in &elements {
                    ctx.push(&json!({ "element": element })).await?;
                }
                Ok(json!(elements.iter().sum::<i64>()))
            })
            .unwrap()
            .register("geterror", |_ctx: RequestContext| async move {
                Err(HandlerError::application("shit happened"))
            })
            .unwrap()
            .register("internal", |_ctx: RequestContext| async move {
                Err(HandlerError::internal("database unavailable"))
            })
            .unwrap()
            .register("info", |ctx: RequestContext| async move {
                Ok(json!({ "api": ctx.api(), "req_id": ctx.req_id() }))
            })
            .unwrap()
            .register("nothing", |_ctx: RequestContext| async move { Ok(Value::Null) })
            .unwrap()
            .register("big", |_ctx: RequestContext| async move {
                Ok(json!("x".repeat(MAX_PAYLOAD_SIZE as usize + 1)))
            })
            .unwrap()
            .register("explode", |_ctx: RequestContext| async move {
                if true {
                    panic!("boom");
                }
                Ok(Value::Null)
            })
            .unwrap();
        registry
    }

    fn spawn_server() -> (
        Connection<DuplexStream>,
        JoinHandle<ServerResult<()>>,
    ) {
        let (client, server) = tokio::io::duplex(8192);
        let handler = ConnectionHandler::new(Arc::new(registry()));
        let task = tokio::spawn(async move { handler.handle_connection(Connection::new(server)).await });
        (Connection::new(client), task)
    }

    async fn call(
        client: &mut Connection<DuplexStream>,
        request: RequestPayload,
    ) -> ResponsePayload {
        client.send_frame(&request.to_frame()).await.unwrap();
        ResponsePayload::from_frame(&client.receive_frame().await.unwrap()).unwrap()
    }

    #[tokio::test]
    async fn echo_request() {
        let (mut client, _task) = spawn_server();
        let response = call(&mut client, RequestPayload::new("echo", 1).with_arg("echo", "X")).await;
        assert_eq!(
            response,
            ResponsePayload::good(1, into_body(json!({ "result": "Hello:X" })))
        );
    }

    #[tokio::test]
    async fn add_pushes_then_responds() {
        let (mut client, _task) = spawn_server();
        let request = RequestPayload::new("add", 42).with_arg("elements", json!([1, 2, 3]));
        client.send_frame(&request.to_frame()).await.unwrap();

        for element in 1..=3 {
            let push = ResponsePayload::from_frame(&client.receive_frame().await.unwrap()).unwrap();
            assert_eq!(push, ResponsePayload::push(into_body(json!({ "element": element }))));
        }

        let response = ResponsePayload::from_frame(&client.receive_frame().await.unwrap()).unwrap();
        assert_eq!(response, ResponsePayload::good(42, into_body(json!({ "result": 6 }))));
    }

    #[tokio::test]
    async fn object_results_are_not_wrapped() {
        let (mut client, _task) = spawn_server();
        let response = call(&mut client, RequestPayload::new("info", 9)).await;
        assert_eq!(
            response,
            ResponsePayload::good(9, into_body(json!({ "api": "info", "req_id": 9 })))
        );
    }

    #[tokio::test]
    async fn null_result_is_wrapped() {
        let (mut client, _task) = spawn_server();
        let response = call(&mut client, RequestPayload::new("nothing", 2)).await;
        assert_eq!(
            response,
            ResponsePayload::good(2, into_body(json!({ "result": null })))
        );
    }

    #[tokio::test]
    async fn failures_keep_connection_open() {
        let (mut client, _task) = spawn_server();

        let response = call(&mut client, RequestPayload::new("geterror", 1)).await;
        assert_eq!(response, ResponsePayload::error(1, "shit happened"));

        let response = call(&mut client, RequestPayload::new("missing", 2)).await;
        assert_eq!(response, ResponsePayload::error(2, "unknown api: missing"));

        let response = call(&mut client, RequestPayload::new("internal", 3)).await;
        assert_eq!(response, ResponsePayload::bad(3, "database unavailable"));

        let response = call(&mut client, RequestPayload::new("echo", 4)).await;
        assert_eq!(response.status(), StatusCode::ErrorResponse);

        let response = call(&mut client, RequestPayload::new("echo", 5).with_arg("echo", "Y")).await;
        assert_eq!(
            response,
            ResponsePayload::good(5, into_body(json!({ "result": "Hello:Y" })))
        );
    }

    #[tokio::test]
    async fn oversized_result_becomes_bad_response() {
        let (mut client, _task) = spawn_server();

        let response = call(&mut client, RequestPayload::new("big", 1)).await;
        assert_eq!(response.status(), StatusCode::BadResponse);
        assert_eq!(response.resp_to(), 1);
        match response {
            ResponsePayload::Bad { msg, .. } => assert!(msg.contains("too large"), "{msg}"),
            other => panic!("unexpected response: {other:?}"),
        }

        let response = call(&mut client, RequestPayload::new("echo", 2).with_arg("echo", "X")).await;
        assert_eq!(
            response,
            ResponsePayload::good(2, into_body(json!({ "result": "Hello:X" })))
        );
    }

    #[tokio::test]
    async fn panicking_handler_keeps_connection_open() {
        let (mut client, _task) = spawn_server();

        let response = call(&mut client, RequestPayload::new("explode", 1)).await;
        assert_eq!(response, ResponsePayload::bad(1, "handler panicked: boom"));

        let response = call(&mut client, RequestPayload::new("echo", 2).with_arg("echo", "Y")).await;
        assert_eq!(
            response,
            ResponsePayload::good(2, into_body(json!({ "result": "Hello:Y" })))
        );
    }

    #[tokio::test]
    async fn close_api_ends_loop_without_response() {
        let (mut client, task) = spawn_server();
        client
            .send_frame(&RequestPayload::new(API_CLOSE, 1).to_frame())
            .await
            .unwrap();

        assert!(task.await.unwrap().is_ok());
        let err = client.receive_frame().await.unwrap_err();
        assert!(err.is_disconnect());
    }

    #[tokio::test]
    async fn client_disconnect_is_clean() {
        let (client, task) = spawn_server();
        drop(client);
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn bad_magic_closes_connection() {
        let (mut client, server) = tokio::io::duplex(1024);
        let handler = ConnectionHandler::new(Arc::new(registry()));
        let task = tokio::spawn(async move { handler.handle_connection(Connection::new(server)).await });

        let mut bytes = encode_frame(&RequestPayload::new("echo", 1).to_frame()).unwrap();
        bytes[0] = b'x';
        client.write_all(&bytes).await.unwrap();

        let result = task.await.unwrap();
        assert!(result.is_err());

        let mut buf = Vec::new();
        client.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn bad_version_closes_connection() {
        let (mut client, server) = tokio::io::duplex(1024);
        let handler = ConnectionHandler::new(Arc::new(registry()));
        let task = tokio::spawn(async move { handler.handle_connection(Connection::new(server)).await });

        let mut bytes = encode_frame(&RequestPayload::new("echo", 1).to_frame()).unwrap();
        bytes[2] = 9;
        client.write_all(&bytes).await.unwrap();

        assert!(task.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn missing_req_id_gets_bad_response_then_close() {
        let (mut client, task) = spawn_server();
        client
            .send_frame(&Frame::new(
                StatusCode::Request,
                json!({ "api": "echo", "body": { "echo": "X" } }),
            ))
            .await
            .unwrap();

        let response = ResponsePayload::from_frame(&client.receive_frame().await.unwrap()).unwrap();
        assert_eq!(response.status(), StatusCode::BadResponse);
        assert_eq!(response.resp_to(), PUSH_RESP_TO);

        assert!(task.await.unwrap().is_err());
        assert!(client.receive_frame().await.unwrap_err().is_disconnect());
    }

    #[tokio::test]
    async fn response_frame_from_client_is_rejected() {
        let (mut client, task) = spawn_server();
        client
            .send_frame(&ResponsePayload::good(7, into_body(json!(1))).to_frame())
            .await
            .unwrap();

        let response = ResponsePayload::from_frame(&client.receive_frame().await.unwrap()).unwrap();
        assert_eq!(response.status(), StatusCode::BadResponse);
        assert!(task.await.unwrap().is_err());
    }
}
