//! Error type shared by the transport, the client operations and the VFS
//! interception engine.

use std::time::Duration;

use thiserror::Error;

use crate::rpc::ErrorCode;
use crate::vfs::VfsOp;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// The sandbox host process could not be started or its pipes were missing.
    #[error("failed to start sandbox host {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    /// The client was closed before (or while) the request was issued.
    #[error("client is closed")]
    Closed,

    /// The host's output stream ended while the request was in flight.
    #[error("connection to sandbox host closed")]
    ConnectionClosed,

    #[error("failed to encode request: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The host answered with a JSON-RPC error object.
    #[error("sandbox host error {code}: {message}")]
    Remote { code: i64, message: String },

    /// The response could not be decoded into the expected result type.
    #[error("invalid response to {method}: {message}")]
    InvalidResponse { method: String, message: String },

    /// The caller's cancellation token fired before a response arrived.
    #[error("request cancelled")]
    Cancelled,

    /// The caller's timeout elapsed before a response arrived.
    #[error("request deadline exceeded after {0:?}")]
    DeadlineExceeded(Duration),

    #[error("sandbox host did not exit within {0:?}; killed")]
    CloseTimeout(Duration),

    #[error("invalid VFS interception config: {0}")]
    VfsConfig(String),

    #[error("{op} on {path} blocked by VFS hook")]
    HookBlocked { op: VfsOp, path: String },

    /// A pre-operation hook failed or timed out; the operation was not sent.
    #[error("VFS hook {name} failed: {source}")]
    Hook {
        name: String,
        #[source]
        source: anyhow::Error,
    },
}

impl Error {
    pub(crate) fn invalid_response(method: &str, message: impl ToString) -> Self {
        Error::InvalidResponse {
            method: method.to_string(),
            message: message.to_string(),
        }
    }

    /// The classified code of a remote error, if this is one.
    pub fn remote_code(&self) -> Option<ErrorCode> {
        match self {
            Error::Remote { code, .. } => Some(ErrorCode::from(*code)),
            _ => None,
        }
    }

    pub fn is_vm_failed(&self) -> bool {
        self.remote_code() == Some(ErrorCode::VmFailed)
    }

    pub fn is_exec_failed(&self) -> bool {
        self.remote_code() == Some(ErrorCode::ExecFailed)
    }

    pub fn is_file_failed(&self) -> bool {
        self.remote_code() == Some(ErrorCode::FileFailed)
    }

    /// True when the host reported the operation as cancelled. Local give-up
    /// is reported as [`Error::Cancelled`] / [`Error::DeadlineExceeded`]
    /// instead.
    pub fn is_remote_cancelled(&self) -> bool {
        self.remote_code() == Some(ErrorCode::Cancelled)
    }
}
