//! JSON-RPC plumbing between the client and the sandbox host process.
//!
//! - [`wire`]: single-line frame encoding/decoding and reserved error codes
//! - `pending`: request-id allocation and the in-flight table
//! - `transport`: the writer and reader tasks, cancellation

mod pending;
mod transport;
pub mod wire;

pub use pending::NotificationHandler;
pub use transport::RequestOptions;
pub(crate) use transport::{BoxReader, BoxWriter, NotificationRouter, Transport};
pub use wire::{ErrorCode, Notification, RpcErrorObject};
