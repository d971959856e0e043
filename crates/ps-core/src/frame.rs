//! JSON wire envelope.
//!
//! Every frame is a single JSON object. Outbound calls carry an `id` and
//! expect a response with the same `id`; outbound sends do not. Frames the
//! device sends on its own initiative never carry an `id`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::ClientQuery;

pub type MessageId = u64;

pub const EXECUTE: &str = "execute";
pub const REFRESH_PLUGINS: &str = "refreshPlugins";
pub const GET_PLUGINS: &str = "getPlugins";
pub const GET_BACKGROUND_PLUGINS: &str = "getBackgroundPlugins";
pub const IS_METHOD_SUPPORTED: &str = "isMethodSupported";
pub const INIT: &str = "init";
pub const DEINIT: &str = "deinit";
pub const SIGN_CERTIFICATE: &str = "signCertificate";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame is not a json object")]
    NotAnObject,

    #[error("invalid frame: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, FrameError>;

fn parse_object(bytes: &[u8]) -> Result<serde_json::Map<String, Value>> {
    match serde_json::from_slice::<Value>(bytes)? {
        Value::Object(map) => Ok(map),
        _ => Err(FrameError::NotAnObject),
    }
}

/// Decode the connect payload both endpoints expect as their first frame.
pub fn decode_client_query(bytes: &[u8]) -> Result<ClientQuery> {
    let map = parse_object(bytes)?;
    Ok(serde_json::from_value(Value::Object(map))?)
}

// ---------------------------------------------------------------------------
// Api scope
// ---------------------------------------------------------------------------

/// Target of an `execute` broadcast. A missing or null `api` addresses the
/// device itself rather than a plugin.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Api {
    Device,
    Plugin(String),
}

impl Api {
    pub fn plugin(name: impl Into<String>) -> Self {
        Api::Plugin(name.into())
    }

    pub fn plugin_id(&self) -> Option<&str> {
        match self {
            Api::Device => None,
            Api::Plugin(name) => Some(name),
        }
    }
}

impl std::fmt::Display for Api {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Api::Device => write!(f, "*"),
            Api::Plugin(name) => write!(f, "{name}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct ExecuteParams {
    pub api: Api,
    pub method: String,
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResponseOutcome {
    Success(Value),
    Error(Value),
    /// Neither `success` nor `error` was present.
    Empty,
}

/// Error reported by the device outside of any call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceError {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub stacktrace: String,
}

impl DeviceError {
    fn from_value(value: Value) -> Self {
        match value {
            Value::Object(_) => serde_json::from_value(value.clone()).unwrap_or_else(|_| Self {
                message: value.to_string(),
                ..Self::default()
            }),
            Value::String(message) => Self {
                message,
                ..Self::default()
            },
            other => Self {
                message: other.to_string(),
                ..Self::default()
            },
        }
    }

    /// True when the payload looks like a crash (has a name or a message)
    /// rather than an opaque plugin error.
    pub fn is_crash_report(&self) -> bool {
        !self.name.is_empty() || !self.message.is_empty()
    }
}

#[derive(Debug, Deserialize)]
struct RawInbound {
    #[serde(default)]
    id: Option<MessageId>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default)]
    success: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RawExecute {
    #[serde(default)]
    api: Option<String>,
    method: String,
    #[serde(default)]
    params: Value,
}

/// A classified frame received on the secure channel.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Response {
        id: MessageId,
        outcome: ResponseOutcome,
    },
    Execute(ExecuteParams),
    RefreshPlugins,
    DeviceError {
        method: Option<String>,
        error: DeviceError,
    },
    Other {
        method: Option<String>,
    },
}

impl InboundFrame {
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let map = parse_object(bytes)?;
        let raw: RawInbound = serde_json::from_value(Value::Object(map))?;

        if let Some(id) = raw.id {
            // `success` takes precedence when a device sends both.
            let outcome = match (raw.success, raw.error) {
                (Some(success), _) => ResponseOutcome::Success(success),
                (None, Some(error)) => ResponseOutcome::Error(error),
                (None, None) => ResponseOutcome::Empty,
            };
            return Ok(InboundFrame::Response { id, outcome });
        }

        if let Some(error) = raw.error {
            return Ok(InboundFrame::DeviceError {
                method: raw.method,
                error: DeviceError::from_value(error),
            });
        }

        match raw.method.as_deref() {
            Some(EXECUTE) => {
                let params = raw
                    .params
                    .ok_or_else(|| FrameError::Invalid("execute without params".into()))?;
                let execute: RawExecute = serde_json::from_value(params)?;
                Ok(InboundFrame::Execute(ExecuteParams {
                    api: execute.api.map(Api::Plugin).unwrap_or(Api::Device),
                    method: execute.method,
                    params: execute.params,
                }))
            }
            Some(REFRESH_PLUGINS) => Ok(InboundFrame::RefreshPlugins),
            _ => Ok(InboundFrame::Other { method: raw.method }),
        }
    }
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct CallFrame<'a> {
    pub id: MessageId,
    pub method: &'a str,
    pub params: &'a Value,
}

#[derive(Debug, Serialize)]
pub struct SendFrame<'a> {
    pub method: &'a str,
    pub params: &'a Value,
}

pub fn encode<T: Serialize>(frame: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(frame)?)
}

// ---------------------------------------------------------------------------
// Bootstrap
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapRequest {
    SignCertificate { csr: String, destination: String },
    Unsupported { method: Option<String> },
}

#[derive(Debug, Deserialize)]
struct RawSignCertificate {
    csr: String,
    #[serde(default)]
    destination: String,
}

impl BootstrapRequest {
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let map = parse_object(bytes)?;
        let method = map.get("method").and_then(Value::as_str).map(str::to_string);
        match method.as_deref() {
            Some(SIGN_CERTIFICATE) => {
                let raw: RawSignCertificate = serde_json::from_value(Value::Object(map))?;
                Ok(BootstrapRequest::SignCertificate {
                    csr: raw.csr,
                    destination: raw.destination,
                })
            }
            _ => Ok(BootstrapRequest::Unsupported { method }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BootstrapResponse {
    Signed {
        #[serde(rename = "deviceId")]
        device_id: String,
    },
    Failed {
        error: ErrorBody,
    },
}

impl BootstrapResponse {
    pub fn failed(message: impl Into<String>) -> Self {
        BootstrapResponse::Failed {
            error: ErrorBody {
                message: message.into(),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
