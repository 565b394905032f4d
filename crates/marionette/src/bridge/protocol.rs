//! Wire protocol types for controller-agent communication.
//!
//! Every logical message is a single JSON document:
//! - **Request** (controller → agent): `{"id", "method", "params"}`
//! - **Response** (agent → controller): `{"id", "result"}` or `{"id", "error"}`

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

/// Method needs the agent to have been started in unsafe mode.
pub const UNSAFE_MODE_REQUIRED: i64 = -32001;
/// Host state referenced by a pending operation disappeared mid-wait.
pub const TARGET_INVALIDATED: i64 = -32002;
pub const EVALUATION_FAILED: i64 = -32003;
pub const NOT_FOUND: i64 = -32004;
pub const UNSUPPORTED: i64 = -32005;

/// Request identifier chosen by the controller.
///
/// Opaque to the agent: it is only echoed back on the response.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{}", n),
            Self::String(s) => write!(f, "{:?}", s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    pub method: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl Request {
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            method: method.into(),
            params: Map::new(),
        }
    }

    pub fn with_params(mut self, params: Map<String, Value>) -> Self {
        self.params = params;
        self
    }
}

/// Structured error envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{message} (code {code})")]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn parse_error(detail: impl std::fmt::Display) -> Self {
        Self::new(PARSE_ERROR, format!("parse error: {}", detail))
    }

    pub fn invalid_request(detail: impl std::fmt::Display) -> Self {
        Self::new(INVALID_REQUEST, format!("invalid request: {}", detail))
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("method not found: {}", method))
    }

    pub fn invalid_params(detail: impl std::fmt::Display) -> Self {
        Self::new(INVALID_PARAMS, format!("invalid params: {}", detail))
    }

    pub fn internal(detail: impl std::fmt::Display) -> Self {
        Self::new(INTERNAL_ERROR, format!("internal error: {}", detail))
    }

    pub fn unsafe_mode_required(method: &str) -> Self {
        Self::new(
            UNSAFE_MODE_REQUIRED,
            format!("blocked: '{}' requires the agent to run in unsafe mode", method),
        )
    }

    pub fn target_invalidated(detail: impl std::fmt::Display) -> Self {
        Self::new(TARGET_INVALIDATED, detail.to_string())
    }

    pub fn evaluation_failed(detail: impl std::fmt::Display) -> Self {
        Self::new(EVALUATION_FAILED, format!("evaluation failed: {}", detail))
    }

    pub fn not_found(detail: impl std::fmt::Display) -> Self {
        Self::new(NOT_FOUND, detail.to_string())
    }

    pub fn unsupported(detail: impl std::fmt::Display) -> Self {
        Self::new(UNSUPPORTED, detail.to_string())
    }
}

/// Terminal outcome of a request. Exactly one of `result` or `error` appears on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Outcome {
    #[serde(rename = "result")]
    Success(Value),
    #[serde(rename = "error")]
    Failure(RpcError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// `None` serializes as `null`: used when the request was too broken to recover an id.
    pub id: Option<RequestId>,
    #[serde(flatten)]
    pub outcome: Outcome,
}

impl Response {
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            id: Some(id),
            outcome: Outcome::Success(result),
        }
    }

    pub fn failure(id: Option<RequestId>, error: RpcError) -> Self {
        Self {
            id,
            outcome: Outcome::Failure(error),
        }
    }

    pub fn from_result(id: RequestId, result: Result<Value, RpcError>) -> Self {
        match result {
            Ok(value) => Self::success(id, value),
            Err(error) => Self::failure(Some(id), error),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.outcome, Outcome::Failure(_))
    }

    pub fn into_result(self) -> Result<Value, RpcError> {
        match self.outcome {
            Outcome::Success(value) => Ok(value),
            Outcome::Failure(error) => Err(error),
        }
    }
}

/// An inbound message that failed structural validation.
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedMessage {
    /// Set only when the message was otherwise well-formed (e.g. bad `params`).
    pub id: Option<RequestId>,
    pub error: RpcError,
}

impl RejectedMessage {
    fn anonymous(error: RpcError) -> Self {
        Self { id: None, error }
    }

    pub fn into_response(self) -> Response {
        Response::failure(self.id, self.error)
    }
}

/// Validate one inbound text message into a [`Request`].
///
/// Malformed JSON, non-objects, a missing or empty `method`, and a missing or
/// non-scalar `id` are answered with `id = null`. A non-object `params` keeps
/// the recovered id so the caller can correlate the failure.
pub fn parse_request(text: &str) -> Result<Request, RejectedMessage> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| RejectedMessage::anonymous(RpcError::parse_error(e)))?;

    let Value::Object(mut object) = value else {
        return Err(RejectedMessage::anonymous(RpcError::invalid_request(
            "message must be a JSON object",
        )));
    };

    let method = match object.remove("method") {
        Some(Value::String(method)) if !method.is_empty() => method,
        _ => {
            return Err(RejectedMessage::anonymous(RpcError::invalid_request(
                "'method' must be a non-empty string",
            )));
        }
    };

    let id = match object.remove("id") {
        Some(Value::Number(n)) => n.as_i64().map(RequestId::Number),
        Some(Value::String(s)) => Some(RequestId::String(s)),
        _ => None,
    };
    let Some(id) = id else {
        return Err(RejectedMessage::anonymous(RpcError::invalid_request(
            "'id' must be a string or an integer",
        )));
    };

    let params = match object.remove("params") {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(params)) => params,
        Some(_) => {
            return Err(RejectedMessage {
                id: Some(id),
                error: RpcError::invalid_params("'params' must be an object"),
            });
        }
    };

    Ok(Request { id, method, params })
}
