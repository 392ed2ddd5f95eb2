//! Runs compiled hooks.
//!
//! Pre-operation hooks (action, mutate) are awaited inline by the client
//! before a request is written. Post-operation hooks are started from file
//! event notifications and never block the reader.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, warn};

use super::compile::{CompiledHook, CompiledHooks, CompiledRule};
use super::rules::{VfsAction, VfsActionRequest, VfsHookEvent, VfsMutateRequest, VfsOp};
use crate::client::Client;
use crate::error::{Error, Result};

pub(crate) struct HookExecutor {
    hooks: RwLock<Arc<CompiledHooks>>,
    /// Set while a batch of safe after-hooks is running.
    active: AtomicBool,
}

/// Clears the active flag when a safe batch ends, panics included.
struct ActiveGuard<'a>(&'a AtomicBool);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl HookExecutor {
    pub fn new() -> Self {
        Self {
            hooks: RwLock::new(Arc::new(CompiledHooks::default())),
            active: AtomicBool::new(false),
        }
    }

    /// Replace the whole hook set.
    pub fn install(&self, hooks: CompiledHooks) {
        *self.hooks.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(hooks);
    }

    pub fn clear(&self) {
        self.install(CompiledHooks::default());
    }

    fn snapshot(&self) -> Arc<CompiledHooks> {
        Arc::clone(&self.hooks.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// Evaluate action hooks in registration order. The first non-allow
    /// answer wins.
    pub async fn check_action(&self, request: &VfsActionRequest) -> Result<()> {
        let hooks = self.snapshot();

        for rule in hooks.matching(request.op, &request.path) {
            let CompiledHook::Action(hook) = &rule.hook else {
                continue;
            };
            let decision = with_timeout(rule.timeout, hook.decide(request.clone()))
                .await
                .map_err(|_| Error::Hook {
                    name: rule.name.clone(),
                    source: anyhow::anyhow!("action hook timed out"),
                })?;

            match decision {
                VfsAction::Allow => continue,
                VfsAction::Block => {
                    debug!(hook = %rule.name, op = %request.op, path = %request.path, "VFS action hook blocked operation");
                    return Err(Error::HookBlocked {
                        op: request.op,
                        path: request.path.clone(),
                    });
                }
                other => {
                    return Err(Error::VfsConfig(format!(
                        "action hook {} returned unsupported action {}",
                        rule.name, other
                    )));
                }
            }
        }
        Ok(())
    }

    /// Run matching mutate hooks over a write payload, each one seeing the
    /// output of the previous.
    pub async fn apply_mutations(&self, path: &str, mode: u32, content: Vec<u8>) -> Result<Vec<u8>> {
        let hooks = self.snapshot();
        let mut content = content;

        for rule in hooks.matching(VfsOp::Write, path) {
            let CompiledHook::Mutate(hook) = &rule.hook else {
                continue;
            };
            let request = VfsMutateRequest {
                path: path.to_string(),
                size: content.len() as i64,
                mode,
                uid: 0,
                gid: 0,
                content: content.clone(),
            };
            let replaced = with_timeout(rule.timeout, hook.mutate(request))
                .await
                .unwrap_or_else(|_| Err(anyhow::anyhow!("mutate hook timed out")))
                .map_err(|source| Error::Hook {
                    name: rule.name.clone(),
                    source,
                })?;

            if let Some(replacement) = replaced {
                debug!(hook = %rule.name, path, before = content.len(), after = replacement.len(), "VFS mutate hook rewrote payload");
                content = replacement;
            }
        }
        Ok(content)
    }

    /// Start the after-hooks matching `event`.
    ///
    /// Safe hooks run as one sequential batch on their own task. If a batch
    /// is already running, this event's safe hooks are dropped. Dangerous
    /// hooks each get their own task and are never dropped.
    pub fn dispatch_event(self: &Arc<Self>, client: Client, event: VfsHookEvent) {
        let hooks = self.snapshot();
        if hooks.is_empty() {
            return;
        }

        let mut safe = Vec::new();
        for rule in hooks.matching(event.op, &event.path) {
            match &rule.hook {
                CompiledHook::After(_) => safe.push(Arc::clone(rule)),
                CompiledHook::AfterDangerous(_) => {
                    tokio::spawn(run_after_hook(
                        Arc::clone(rule),
                        client.clone(),
                        event.clone(),
                    ));
                }
                CompiledHook::Mutate(_) | CompiledHook::Action(_) => {}
            }
        }

        if safe.is_empty() {
            return;
        }

        if self
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(op = %event.op, path = %event.path, "safe VFS hooks already running; dropping event");
            return;
        }

        let executor = Arc::clone(self);
        tokio::spawn(async move {
            let _active = ActiveGuard(&executor.active);
            for rule in safe {
                let name = rule.name.clone();
                // Each hook on its own task so a panic in one does not skip
                // the rest of the batch.
                let handle = tokio::spawn(run_after_hook(rule, client.clone(), event.clone()));
                if let Err(e) = handle.await {
                    warn!(hook = %name, error = %e, "VFS hook task panicked");
                }
            }
        });
    }

    #[cfg(test)]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

async fn run_after_hook(rule: Arc<CompiledRule>, client: Client, event: VfsHookEvent) {
    let hook = match &rule.hook {
        CompiledHook::After(h) | CompiledHook::AfterDangerous(h) => Arc::clone(h),
        CompiledHook::Mutate(_) | CompiledHook::Action(_) => return,
    };

    let outcome = with_timeout(rule.timeout, hook.on_event(client, event.clone()))
        .await
        .unwrap_or_else(|t| Err(anyhow::anyhow!("timed out after {:?}", t)));

    // The operation already happened; there is nobody to return this to.
    if let Err(e) = outcome {
        warn!(hook = %rule.name, op = %event.op, path = %event.path, error = %e, "VFS hook failed");
    }
}

/// Await `fut`, bounded by `timeout` when set. `Err` carries the elapsed
/// bound.
async fn with_timeout<F: Future>(
    timeout: Option<Duration>,
    fut: F,
) -> std::result::Result<F::Output, Duration> {
    match timeout {
        Some(t) => tokio::time::timeout(t, fut).await.map_err(|_| t),
        None => Ok(fut.await),
    }
}
