//! Declarative VFS interception rules and the hook callback traits.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::client::Client;

/// File-system operation kinds reported by the sandbox host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VfsOp {
    Create,
    Open,
    Read,
    Write,
    Remove,
    Rename,
    Mkdir,
    Chmod,
    Readdir,
    Stat,
}

impl VfsOp {
    pub const ALL: [VfsOp; 10] = [
        VfsOp::Create,
        VfsOp::Open,
        VfsOp::Read,
        VfsOp::Write,
        VfsOp::Remove,
        VfsOp::Rename,
        VfsOp::Mkdir,
        VfsOp::Chmod,
        VfsOp::Readdir,
        VfsOp::Stat,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            VfsOp::Create => "create",
            VfsOp::Open => "open",
            VfsOp::Read => "read",
            VfsOp::Write => "write",
            VfsOp::Remove => "remove",
            VfsOp::Rename => "rename",
            VfsOp::Mkdir => "mkdir",
            VfsOp::Chmod => "chmod",
            VfsOp::Readdir => "readdir",
            VfsOp::Stat => "stat",
        }
    }
}

impl fmt::Display for VfsOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Case-insensitive: hosts are not consistent about casing.
impl FromStr for VfsOp {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        VfsOp::ALL
            .into_iter()
            .find(|op| op.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown VFS operation: {}", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VfsPhase {
    Before,
    After,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VfsAction {
    Allow,
    Block,
    MutateWrite,
}

impl fmt::Display for VfsAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            VfsAction::Allow => "allow",
            VfsAction::Block => "block",
            VfsAction::MutateWrite => "mutate_write",
        })
    }
}

/// A completed file operation observed inside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VfsHookEvent {
    pub op: VfsOp,
    pub path: String,
    pub size: i64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
}

/// A write about to leave the client. `content` is the current payload,
/// already transformed by earlier mutate hooks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VfsMutateRequest {
    pub path: String,
    pub size: i64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub content: Vec<u8>,
}

/// An operation about to leave the client, before any mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VfsActionRequest {
    pub op: VfsOp,
    pub path: String,
    pub size: i64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
}

/// Runs after the host reports a matching file event.
///
/// The client handle may be used to issue further operations. For safe
/// hooks, events caused by those operations are dropped while the hook
/// batch is running.
#[async_trait]
pub trait VfsAfterHook: Send + Sync {
    async fn on_event(&self, client: Client, event: VfsHookEvent) -> anyhow::Result<()>;
}

/// Rewrites a write payload. `Ok(None)` leaves it unchanged.
#[async_trait]
pub trait VfsMutateHook: Send + Sync {
    async fn mutate(&self, request: VfsMutateRequest) -> anyhow::Result<Option<Vec<u8>>>;
}

/// Decides whether an operation may proceed. Only `Allow` and `Block` are
/// meaningful answers.
#[async_trait]
pub trait VfsActionHook: Send + Sync {
    async fn decide(&self, request: VfsActionRequest) -> VfsAction;
}

#[async_trait]
impl<F, Fut> VfsAfterHook for F
where
    F: Fn(Client, VfsHookEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn on_event(&self, client: Client, event: VfsHookEvent) -> anyhow::Result<()> {
        self(client, event).await
    }
}

#[async_trait]
impl<F, Fut> VfsMutateHook for F
where
    F: Fn(VfsMutateRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Option<Vec<u8>>>> + Send + 'static,
{
    async fn mutate(&self, request: VfsMutateRequest) -> anyhow::Result<Option<Vec<u8>>> {
        self(request).await
    }
}

#[async_trait]
impl<F, Fut> VfsActionHook for F
where
    F: Fn(VfsActionRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = VfsAction> + Send + 'static,
{
    async fn decide(&self, request: VfsActionRequest) -> VfsAction {
        self(request).await
    }
}

/// The callback attached to a rule.
#[derive(Clone)]
pub enum VfsHook {
    /// After-event hook, suppressed while another safe batch is running.
    After(Arc<dyn VfsAfterHook>),
    /// After-event hook that is never suppressed. It may re-trigger itself;
    /// bounding that is up to the hook.
    AfterDangerous(Arc<dyn VfsAfterHook>),
    /// Before-write payload rewrite.
    Mutate(Arc<dyn VfsMutateHook>),
    /// Before-operation allow/block decision.
    Action(Arc<dyn VfsActionHook>),
}

impl VfsHook {
    pub fn kind(&self) -> &'static str {
        match self {
            VfsHook::After(_) => "hook",
            VfsHook::AfterDangerous(_) => "dangerous_hook",
            VfsHook::Mutate(_) => "mutate_hook",
            VfsHook::Action(_) => "action_hook",
        }
    }
}

impl fmt::Debug for VfsHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}

/// One interception rule as written by the caller.
///
/// A rule either carries an `action` for the host to enforce on its own, or
/// exactly one callback evaluated locally. Attaching more than one callback
/// is rejected when the interception config is compiled.
#[derive(Debug, Clone, Default)]
pub struct VfsHookRule {
    pub name: String,
    pub phase: Option<VfsPhase>,
    /// Empty matches every operation.
    pub ops: Vec<VfsOp>,
    /// Glob over the guest path; `*` does not cross `/`. Empty matches all.
    pub path: String,
    pub action: Option<VfsAction>,
    /// Upper bound for a single callback invocation.
    pub timeout: Option<Duration>,
    pub hooks: Vec<VfsHook>,
}

impl VfsHookRule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn phase(mut self, phase: VfsPhase) -> Self {
        self.phase = Some(phase);
        self
    }

    pub fn ops(mut self, ops: impl IntoIterator<Item = VfsOp>) -> Self {
        self.ops = ops.into_iter().collect();
        self
    }

    pub fn path(mut self, pattern: impl Into<String>) -> Self {
        self.path = pattern.into();
        self
    }

    pub fn action(mut self, action: VfsAction) -> Self {
        self.action = Some(action);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn hook(mut self, hook: impl VfsAfterHook + 'static) -> Self {
        self.hooks.push(VfsHook::After(Arc::new(hook)));
        self
    }

    pub fn dangerous_hook(mut self, hook: impl VfsAfterHook + 'static) -> Self {
        self.hooks.push(VfsHook::AfterDangerous(Arc::new(hook)));
        self
    }

    pub fn mutate_hook(mut self, hook: impl VfsMutateHook + 'static) -> Self {
        self.hooks.push(VfsHook::Mutate(Arc::new(hook)));
        self
    }

    pub fn action_hook(mut self, hook: impl VfsActionHook + 'static) -> Self {
        self.hooks.push(VfsHook::Action(Arc::new(hook)));
        self
    }
}

/// The full interception configuration passed at sandbox creation.
#[derive(Debug, Clone, Default)]
pub struct VfsInterceptionConfig {
    /// Ask the host to emit file events even without local after-hooks.
    pub emit_events: bool,
    pub rules: Vec<VfsHookRule>,
}

impl VfsInterceptionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rule(mut self, rule: VfsHookRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn emit_events(mut self, emit: bool) -> Self {
        self.emit_events = emit;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ops_parse_case_insensitively() {
        assert_eq!("WRITE".parse::<VfsOp>().unwrap(), VfsOp::Write);
        assert_eq!("Readdir".parse::<VfsOp>().unwrap(), VfsOp::Readdir);
        assert!("truncate".parse::<VfsOp>().is_err());
    }

    #[test]
    fn action_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&VfsAction::MutateWrite).unwrap(),
            "\"mutate_write\""
        );
        assert_eq!(serde_json::to_string(&VfsPhase::After).unwrap(), "\"after\"");
    }

    #[test]
    fn builder_accumulates_hooks() {
        let rule = VfsHookRule::new("both")
            .phase(VfsPhase::Before)
            .mutate_hook(|_req: VfsMutateRequest| async { anyhow::Ok(None) })
            .action_hook(|_req: VfsActionRequest| async { VfsAction::Allow });
        let kinds: Vec<_> = rule.hooks.iter().map(VfsHook::kind).collect();
        assert_eq!(kinds, vec!["mutate_hook", "action_hook"]);
    }
}
