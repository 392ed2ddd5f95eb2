//! Line-delimited JSON-RPC 2.0 framing.
//!
//! Every message is one JSON object on one line. Outbound we only ever write
//! requests; inbound lines are either responses (carry an `id`) or
//! notifications (no `id`).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

pub const JSONRPC_VERSION: &str = "2.0";

/// Reserved error codes used by the sandbox host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Parse,
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    Internal,
    VmFailed,
    ExecFailed,
    FileFailed,
    Cancelled,
    Other(i64),
}

impl ErrorCode {
    pub fn code(self) -> i64 {
        match self {
            ErrorCode::Parse => -32700,
            ErrorCode::InvalidRequest => -32600,
            ErrorCode::MethodNotFound => -32601,
            ErrorCode::InvalidParams => -32602,
            ErrorCode::Internal => -32603,
            ErrorCode::VmFailed => -32000,
            ErrorCode::ExecFailed => -32001,
            ErrorCode::FileFailed => -32002,
            ErrorCode::Cancelled => -32003,
            ErrorCode::Other(code) => code,
        }
    }
}

impl From<i64> for ErrorCode {
    fn from(code: i64) -> Self {
        match code {
            -32700 => ErrorCode::Parse,
            -32600 => ErrorCode::InvalidRequest,
            -32601 => ErrorCode::MethodNotFound,
            -32602 => ErrorCode::InvalidParams,
            -32603 => ErrorCode::Internal,
            -32000 => ErrorCode::VmFailed,
            -32001 => ErrorCode::ExecFailed,
            -32002 => ErrorCode::FileFailed,
            -32003 => ErrorCode::Cancelled,
            other => ErrorCode::Other(other),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Request<'a> {
    pub jsonrpc: &'static str,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<&'a Value>,
    pub id: u64,
}

/// Error object carried by an error response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl Notification {
    /// The originating request id, for notifications that belong to a
    /// streaming request.
    pub fn request_id(&self) -> Option<u64> {
        self.params.get("id").and_then(Value::as_u64)
    }
}

/// A decoded inbound line.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Response {
        id: u64,
        outcome: std::result::Result<Value, RpcErrorObject>,
    },
    Notification(Notification),
}

/// Generic envelope used to tell responses from notifications.
#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

/// Encode a request as a single newline-terminated frame.
pub fn encode_request(id: u64, method: &str, params: Option<&Value>) -> serde_json::Result<Vec<u8>> {
    let mut frame = serde_json::to_vec(&Request {
        jsonrpc: JSONRPC_VERSION,
        method,
        params,
        id,
    })?;
    frame.push(b'\n');
    Ok(frame)
}

/// Decode one inbound line.
///
/// A missing (or null) `id` makes the frame a notification; it must then name
/// a method.
pub fn decode_line(line: &str) -> serde_json::Result<Inbound> {
    let envelope: Envelope = serde_json::from_str(line)?;

    match envelope.id {
        Some(id) => {
            let outcome = match envelope.error {
                Some(error) => Err(error),
                None => Ok(envelope.result.unwrap_or(Value::Null)),
            };
            Ok(Inbound::Response { id, outcome })
        }
        None => {
            let method = envelope.method.ok_or_else(|| {
                <serde_json::Error as serde::de::Error>::custom(
                    "frame has neither an id nor a method",
                )
            })?;
            Ok(Inbound::Notification(Notification {
                method,
                params: envelope.params.unwrap_or(Value::Null),
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_is_one_line_and_omits_missing_params() {
        let frame = encode_request(7, "close", None).unwrap();
        let text = String::from_utf8(frame).unwrap();
        assert!(text.ends_with('\n'));
        assert_eq!(text.matches('\n').count(), 1);

        let value: Value = serde_json::from_str(text.trim_end()).unwrap();
        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["method"], "close");
        assert_eq!(value["id"], 7);
        assert!(value.get("params").is_none());
    }

    #[test]
    fn request_params_with_newlines_stay_on_one_line() {
        let params = json!({"command": "echo 'a\nb'"});
        let frame = encode_request(1, "exec", Some(&params)).unwrap();
        assert_eq!(frame.iter().filter(|b| **b == b'\n').count(), 1);
    }

    #[test]
    fn decodes_success_response() {
        let inbound = decode_line(r#"{"jsonrpc":"2.0","result":{"id":"vm-1"},"id":3}"#).unwrap();
        assert_eq!(
            inbound,
            Inbound::Response {
                id: 3,
                outcome: Ok(json!({"id": "vm-1"})),
            }
        );
    }

    #[test]
    fn decodes_error_response() {
        let inbound = decode_line(
            r#"{"jsonrpc":"2.0","error":{"code":-32002,"message":"no such file"},"id":9}"#,
        )
        .unwrap();
        match inbound {
            Inbound::Response { id, outcome: Err(err) } => {
                assert_eq!(id, 9);
                assert_eq!(ErrorCode::from(err.code), ErrorCode::FileFailed);
                assert_eq!(err.message, "no such file");
            }
            other => panic!("expected error response, got {:?}", other),
        }
    }

    #[test]
    fn null_result_is_success() {
        let inbound = decode_line(r#"{"jsonrpc":"2.0","result":null,"id":1}"#).unwrap();
        assert_eq!(
            inbound,
            Inbound::Response {
                id: 1,
                outcome: Ok(Value::Null),
            }
        );
    }

    #[test]
    fn frame_without_id_is_notification() {
        let inbound = decode_line(
            r#"{"jsonrpc":"2.0","method":"exec_stream.stdout","params":{"id":4,"data":"aGk="}}"#,
        )
        .unwrap();
        match inbound {
            Inbound::Notification(n) => {
                assert_eq!(n.method, "exec_stream.stdout");
                assert_eq!(n.request_id(), Some(4));
            }
            other => panic!("expected notification, got {:?}", other),
        }
    }

    #[test]
    fn frame_without_id_or_method_is_rejected() {
        assert!(decode_line(r#"{"jsonrpc":"2.0","params":{}}"#).is_err());
        assert!(decode_line("not json").is_err());
    }

    #[test]
    fn unknown_codes_are_preserved() {
        assert_eq!(ErrorCode::from(-1), ErrorCode::Other(-1));
        assert_eq!(ErrorCode::Other(-1).code(), -1);
        assert_eq!(ErrorCode::Cancelled.code(), -32003);
    }
}
