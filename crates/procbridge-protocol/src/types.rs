//! Frame and payload types for the procbridge protocol.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::PUSH_RESP_TO;
use crate::error::{ProtocolError, ProtocolResult};

/// Status code carried in byte 4 of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StatusCode {
    /// Client to server request.
    Request = 0,
    /// Successful response, or a push frame when `respTo == -1`.
    GoodResponse = 1,
    /// Protocol-level failure.
    BadResponse = 2,
    /// Application-level failure signalled by a handler.
    ErrorResponse = 3,
}

impl StatusCode {
    /// Returns the wire byte for this status.
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Returns true for any of the three response statuses.
    pub fn is_response(self) -> bool {
        !matches!(self, Self::Request)
    }
}

impl TryFrom<u8> for StatusCode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> ProtocolResult<Self> {
        match value {
            0 => Ok(Self::Request),
            1 => Ok(Self::GoodResponse),
            2 => Ok(Self::BadResponse),
            3 => Ok(Self::ErrorResponse),
            other => Err(ProtocolError::InvalidStatusCode(other)),
        }
    }
}

/// A single protocol frame.
///
/// Magic, version and reserved bytes are fixed by the protocol and therefore
/// not stored; the codec writes and checks them.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Frame status code.
    pub status: StatusCode,
    /// JSON payload.
    pub payload: Value,
}

impl Frame {
    /// Creates a frame from a status code and a payload.
    pub fn new(status: StatusCode, payload: Value) -> Self {
        Self { status, payload }
    }

    /// Creates a request frame.
    pub fn request(request: &RequestPayload) -> Self {
        request.to_frame()
    }

    /// Creates a response frame.
    pub fn response(response: &ResponsePayload) -> Self {
        response.to_frame()
    }
}

/// Payload of a [`StatusCode::Request`] frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestPayload {
    /// Name of the api to invoke.
    pub api: String,
    /// Named arguments for the handler.
    #[serde(default)]
    pub body: Map<String, Value>,
    /// Correlation id; echoed back as `respTo`.
    #[serde(rename = "reqId")]
    pub req_id: i64,
}

impl RequestPayload {
    /// Creates a request with an empty body.
    pub fn new(api: impl Into<String>, req_id: i64) -> Self {
        Self {
            api: api.into(),
            body: Map::new(),
            req_id,
        }
    }

    /// Builder: set the request body.
    pub fn with_body(mut self, body: Map<String, Value>) -> Self {
        self.body = body;
        self
    }

    /// Builder: add a single named argument.
    pub fn with_arg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.body.insert(name.into(), value.into());
        self
    }

    /// Returns true if this request asks the server to close the connection.
    pub fn is_close(&self) -> bool {
        self.api == crate::API_CLOSE
    }

    /// Encodes this request into a frame.
    pub fn to_frame(&self) -> Frame {
        Frame::new(
            StatusCode::Request,
            json!({ "api": self.api, "body": self.body, "reqId": self.req_id }),
        )
    }

    /// Parses a request out of a frame.
    ///
    /// Fails if the frame is not a request, if `api` is missing or empty, if
    /// `body` is not an object, or if `reqId` is missing or not an integer.
    pub fn from_frame(frame: &Frame) -> ProtocolResult<Self> {
        if frame.status != StatusCode::Request {
            return Err(ProtocolError::invalid_payload(format!(
                "expected request frame, got {:?}",
                frame.status
            )));
        }

        let request: Self = serde_json::from_value(frame.payload.clone())
            .map_err(|e| ProtocolError::invalid_payload(e.to_string()))?;

        if request.api.is_empty() {
            return Err(ProtocolError::invalid_payload("empty api name"));
        }

        Ok(request)
    }

    /// Best-effort extraction of `reqId` from a payload that failed to
    /// parse, so a bad response can still be correlated.
    pub fn peek_req_id(payload: &Value) -> Option<i64> {
        payload.get("reqId").and_then(Value::as_i64)
    }
}

/// Payload of a response frame.
///
/// The JSON shape depends on the status: a good response carries
/// `{"body", "respTo"}`, the two failure statuses carry `{"msg", "respTo"}`.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponsePayload {
    /// Successful result or push.
    Good {
        body: Map<String, Value>,
        resp_to: i64,
    },
    /// Protocol-level failure.
    Bad { msg: String, resp_to: i64 },
    /// Application-level failure.
    Error { msg: String, resp_to: i64 },
}

#[derive(Serialize, Deserialize)]
struct GoodWire {
    #[serde(default)]
    body: Map<String, Value>,
    #[serde(rename = "respTo")]
    resp_to: i64,
}

#[derive(Serialize, Deserialize)]
struct MessageWire {
    #[serde(default)]
    msg: String,
    #[serde(rename = "respTo")]
    resp_to: i64,
}

impl ResponsePayload {
    /// Creates a good response to the given request id.
    pub fn good(resp_to: i64, body: Map<String, Value>) -> Self {
        Self::Good { body, resp_to }
    }

    /// Creates a push frame payload.
    pub fn push(body: Map<String, Value>) -> Self {
        Self::Good {
            body,
            resp_to: PUSH_RESP_TO,
        }
    }

    /// Creates a protocol-level failure response.
    pub fn bad(resp_to: i64, msg: impl Into<String>) -> Self {
        Self::Bad {
            msg: msg.into(),
            resp_to,
        }
    }

    /// Creates an application-level failure response.
    pub fn error(resp_to: i64, msg: impl Into<String>) -> Self {
        Self::Error {
            msg: msg.into(),
            resp_to,
        }
    }

    /// Returns the status code this payload travels under.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Good { .. } => StatusCode::GoodResponse,
            Self::Bad { .. } => StatusCode::BadResponse,
            Self::Error { .. } => StatusCode::ErrorResponse,
        }
    }

    /// Returns the correlation id.
    pub fn resp_to(&self) -> i64 {
        match self {
            Self::Good { resp_to, .. } | Self::Bad { resp_to, .. } | Self::Error { resp_to, .. } => {
                *resp_to
            }
        }
    }

    /// Returns true for a push frame.
    pub fn is_push(&self) -> bool {
        matches!(self, Self::Good { resp_to, .. } if *resp_to == PUSH_RESP_TO)
    }

    /// Encodes this response into a frame.
    pub fn to_frame(&self) -> Frame {
        let payload = match self {
            Self::Good { body, resp_to } => json!({ "body": body, "respTo": resp_to }),
            Self::Bad { msg, resp_to } | Self::Error { msg, resp_to } => {
                json!({ "msg": msg, "respTo": resp_to })
            }
        };
        Frame::new(self.status(), payload)
    }

    /// Parses a response out of a frame.
    pub fn from_frame(frame: &Frame) -> ProtocolResult<Self> {
        let invalid = |e: serde_json::Error| ProtocolError::invalid_payload(e.to_string());
        match frame.status {
            StatusCode::Request => Err(ProtocolError::invalid_payload(
                "expected response frame, got Request",
            )),
            StatusCode::GoodResponse => {
                let wire: GoodWire = serde_json::from_value(frame.payload.clone()).map_err(invalid)?;
                Ok(Self::good(wire.resp_to, wire.body))
            }
            StatusCode::BadResponse => {
                let wire: MessageWire =
                    serde_json::from_value(frame.payload.clone()).map_err(invalid)?;
                Ok(Self::bad(wire.resp_to, wire.msg))
            }
            StatusCode::ErrorResponse => {
                let wire: MessageWire =
                    serde_json::from_value(frame.payload.clone()).map_err(invalid)?;
                Ok(Self::error(wire.resp_to, wire.msg))
            }
        }
    }
}

/// Normalizes a handler value into a response body.
///
/// Objects are used as-is; any other value is wrapped as `{"result": value}`.
pub fn into_body(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("result".to_string(), other);
            map
        }
    }
}
