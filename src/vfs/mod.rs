//! VFS interception.
//!
//! Callers describe rules with [`VfsHookRule`]. At sandbox creation the rules
//! are split by [`compile`]: plain allow/block rules go to the host, rules with
//! a callback stay in the client and are run by the hook executor.

mod compile;
mod executor;
mod rules;

pub(crate) use compile::{CompiledInterception, compile};
pub use compile::{WireVfsInterception, WireVfsRule};
pub(crate) use executor::HookExecutor;
pub use rules::{
    VfsAction, VfsActionHook, VfsActionRequest, VfsAfterHook, VfsHook, VfsHookEvent, VfsHookRule,
    VfsInterceptionConfig, VfsMutateHook, VfsMutateRequest, VfsOp, VfsPhase,
};
