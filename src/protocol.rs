//! Newline-delimited JSON framing used between client connections and
//! servers. Every request carries an id; responses may arrive out of order
//! and are matched back by that id.

use crate::error::RpcError;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tokio_util::codec::LinesCodec;

/// Service answered by every server for introspection.
pub const REFLECTION_SERVICE: &str = "rpc.reflection";
/// Lists the names of the modules a server exposes.
pub const LIST_SERVICES: &str = "list_services";

const MAX_FRAME: usize = 1 << 20;

pub(crate) fn codec() -> LinesCodec {
    LinesCodec::new_with_max_length(MAX_FRAME)
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct Request {
    pub id: u64,
    pub service: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// Why a single call failed on the server side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    UnknownService,
    UnknownMethod,
    BadParams,
    Handler,
    Unsupported,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnknownService => "unknown_service",
            Self::UnknownMethod => "unknown_method",
            Self::BadParams => "bad_params",
            Self::Handler => "handler",
            Self::Unsupported => "unsupported",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
}

impl Failure {
    pub fn new(kind: FailureKind, message: impl fmt::Display) -> Self {
        Self {
            kind,
            message: message.to_string(),
        }
    }
}

impl From<Failure> for RpcError {
    fn from(f: Failure) -> Self {
        RpcError::Remote {
            kind: f.kind.to_string(),
            message: f.message,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct Response {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Failure>,
}

impl Response {
    pub fn new(id: u64, outcome: Result<Value, Failure>) -> Self {
        match outcome {
            Ok(value) => Self {
                id,
                result: Some(value),
                error: None,
            },
            Err(failure) => Self {
                id,
                result: None,
                error: Some(failure),
            },
        }
    }

    /// A `null` result is indistinguishable from an absent one on the wire,
    /// so both decode to `Value::Null`.
    pub fn into_result(self) -> Result<Value, RpcError> {
        match self.error {
            Some(failure) => Err(failure.into()),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}
