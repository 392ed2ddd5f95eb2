//! The sandbox client.
//!
//! A [`Client`] owns one sandbox host subprocess and talks to it over
//! line-delimited JSON-RPC on the child's stdio. Handles are cheap to clone
//! and may be used from many tasks at once.

mod ops;
mod types;

#[cfg(test)]
pub(crate) mod fake_host;

pub use ops::DEFAULT_FILE_MODE;
pub use types::{
    CreateOptions, ExecOptions, ExecResult, ExecStreamResult, FileInfo, Mount, OutputStream,
    PortForward, PortForwardBinding, Secret,
};

use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::rpc::{BoxReader, BoxWriter, Notification, NotificationRouter, RequestOptions, Transport};
use crate::vfs::{HookExecutor, VfsHookEvent, VfsOp};
use types::EventParams;

/// Grace period for `close` when the caller does not give one.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// How to start and talk to the sandbox host.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Host executable, looked up on `PATH` if not absolute.
    pub binary: String,
    pub args: Vec<String>,
    /// Extra environment for the host process.
    pub env: BTreeMap<String, String>,
    /// Forward the host's stderr to `tracing` (target `vmsandbox::host`).
    pub forward_stderr: bool,
    pub close_timeout: Duration,
    /// Applied to every request that does not carry its own timeout.
    pub request_timeout: Option<Duration>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            binary: "matchlock".to_string(),
            args: vec!["rpc".to_string()],
            env: BTreeMap::new(),
            forward_stderr: true,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            request_timeout: None,
        }
    }
}

/// Handle to a sandbox host.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

pub(crate) struct ClientInner {
    transport: Transport,
    vfs: Arc<HookExecutor>,
    child: tokio::sync::Mutex<Option<Child>>,
    closed: AtomicBool,
    vm_id: RwLock<Option<String>>,
    options: ClientOptions,
}

impl Client {
    /// Start the sandbox host and connect to its stdio.
    pub fn spawn(options: ClientOptions) -> Result<Self> {
        let binary = shellexpand::tilde(&options.binary).into_owned();

        let mut child = Command::new(&binary)
            .args(&options.args)
            .envs(&options.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(if options.forward_stderr {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| Error::Spawn {
                binary: binary.clone(),
                source,
            })?;

        let missing = |stream: &str| Error::Spawn {
            binary: binary.clone(),
            source: std::io::Error::other(format!("{} was not piped", stream)),
        };
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(stderr));
        }

        info!(binary = %binary, pid = ?child.id(), "started sandbox host");
        Ok(Self::build(Box::new(stdin), Box::new(stdout), Some(child), options))
    }

    /// Connect to a host over already-open streams. No subprocess is owned.
    pub fn from_streams<W, R>(writer: W, reader: R) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self::from_streams_with_options(writer, reader, ClientOptions::default())
    }

    pub fn from_streams_with_options<W, R>(writer: W, reader: R, options: ClientOptions) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self::build(Box::new(writer), Box::new(reader), None, options)
    }

    fn build(
        writer: BoxWriter,
        reader: BoxReader,
        child: Option<Child>,
        options: ClientOptions,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<ClientInner>| {
            let router: Weak<dyn NotificationRouter> = weak.clone();
            ClientInner {
                transport: Transport::new(writer, reader, router),
                vfs: Arc::new(HookExecutor::new()),
                child: tokio::sync::Mutex::new(child),
                closed: AtomicBool::new(false),
                vm_id: RwLock::new(None),
                options,
            }
        });
        Self { inner }
    }

    /// Id of the sandbox created on this client, if any.
    pub fn vm_id(&self) -> Option<String> {
        self.inner
            .vm_id
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// Issue a raw RPC.
    pub async fn call(&self, method: &str, params: Option<Value>) -> Result<Value> {
        self.call_with(method, params, RequestOptions::default())
            .await
    }

    /// Issue a raw RPC with cancellation, timeout or a streaming handler.
    pub async fn call_with(
        &self,
        method: &str,
        params: Option<Value>,
        mut options: RequestOptions,
    ) -> Result<Value> {
        self.ensure_open()?;
        if options.timeout.is_none() {
            options.timeout = self.inner.options.request_timeout;
        }
        self.inner.transport.request(method, params, options).await
    }

    /// Shut the sandbox down and wait for the host to exit.
    ///
    /// Idempotent: only the first call does anything. Hooks are cleared
    /// first so none fire during teardown. If the host is still running once
    /// `timeout` (default [`DEFAULT_CLOSE_TIMEOUT`]) has elapsed it is killed
    /// and [`Error::CloseTimeout`] is returned.
    pub async fn close(&self, timeout: Option<Duration>) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let grace = timeout.unwrap_or(self.inner.options.close_timeout);
        let deadline = tokio::time::Instant::now() + grace;

        self.inner.vfs.clear();

        if let Err(e) = self
            .inner
            .transport
            .request("close", Some(close_params(grace)), RequestOptions::with_timeout(grace))
            .await
        {
            debug!(error = %e, "close request did not complete");
        }

        if tokio::time::timeout_at(deadline, self.inner.transport.shutdown_writer())
            .await
            .is_err()
        {
            debug!("host stdin could not be flushed before the deadline");
        }

        let Some(mut child) = self.inner.child.lock().await.take() else {
            return Ok(());
        };

        match tokio::time::timeout_at(deadline, child.wait()).await {
            Ok(Ok(status)) => {
                info!(%status, vm_id = ?self.vm_id(), "sandbox host exited");
                Ok(())
            }
            Ok(Err(e)) => Err(Error::Io(e)),
            Err(_) => {
                warn!(?grace, "sandbox host did not exit in time; killing it");
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "failed to kill sandbox host");
                }
                Err(Error::CloseTimeout(grace))
            }
        }
    }
}

impl NotificationRouter for ClientInner {
    fn route(self: Arc<Self>, notification: Notification) {
        if notification.method != "event" {
            debug!(method = %notification.method, "ignoring unsolicited notification");
            return;
        }
        if self.closed.load(Ordering::Acquire) {
            return;
        }

        let Some(event) = parse_file_event(notification.params) else {
            return;
        };
        let vfs = Arc::clone(&self.vfs);
        vfs.dispatch_event(Client { inner: self }, event);
    }
}

/// The host takes whole seconds; round up so a sub-second grace is not 0.
fn close_params(grace: Duration) -> Value {
    let secs = grace.as_secs_f64().ceil().max(1.0) as u64;
    json!({ "timeout_seconds": secs })
}

fn parse_file_event(params: Value) -> Option<VfsHookEvent> {
    let params: EventParams = match serde_json::from_value(params) {
        Ok(params) => params,
        Err(e) => {
            warn!(error = %e, "malformed event notification");
            return None;
        }
    };
    if params.kind != "file" {
        debug!(kind = %params.kind, "ignoring non-file event");
        return None;
    }
    let file = params.file?;
    let op = match file.op.parse::<VfsOp>() {
        Ok(op) => op,
        Err(e) => {
            debug!(error = %e, path = %file.path, "dropping file event");
            return None;
        }
    };
    Some(VfsHookEvent {
        op,
        path: file.path,
        size: file.size,
        mode: file.mode,
        uid: file.uid,
        gid: file.gid,
    })
}

async fn forward_stderr(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => debug!(target: "vmsandbox::host", "{}", line),
            Ok(None) => break,
            Err(e) => {
                debug!(target: "vmsandbox::host", error = %e, "stderr read failed");
                break;
            }
        }
    }
}
