//! vmsandbox - client-side control plane for a VM sandbox host
//!
//! This crate provides:
//! - A concurrent JSON-RPC transport over the host subprocess's stdio, with
//!   request multiplexing, cancellation and notification routing
//! - Typed sandbox operations (create, exec, file I/O, port forwarding)
//! - VFS interception: host-enforced allow/block rules plus local hooks that
//!   can block, rewrite or react to file operations

pub mod client;
pub mod config;
pub mod error;
pub mod paths;
pub mod rpc;
pub mod vfs;

pub use client::{
    Client, ClientOptions, CreateOptions, ExecOptions, ExecResult, ExecStreamResult, FileInfo,
    Mount, OutputStream, PortForward, PortForwardBinding, Secret,
};
pub use config::Config;
pub use error::{Error, Result};
pub use rpc::{ErrorCode, RequestOptions};
pub use vfs::{
    VfsAction, VfsActionRequest, VfsHookEvent, VfsHookRule, VfsInterceptionConfig,
    VfsMutateRequest, VfsOp, VfsPhase,
};
