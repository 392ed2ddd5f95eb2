//! Typed sandbox operations on top of [`Client::call`].

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::Client;
use super::types::{
    CreateParams, CreateResponse, ExecParams, ExecResponse, ExecStreamResponse, ListFilesResponse,
    PortForwardResponse, ReadFileResponse,
};
use super::{
    CreateOptions, ExecOptions, ExecResult, ExecStreamResult, FileInfo, OutputStream, PortForward,
    PortForwardBinding,
};
use crate::error::{Error, Result};
use crate::rpc::{Notification, NotificationHandler};
use crate::vfs::{self, VfsActionRequest, VfsOp};

/// Mode used by [`Client::write_file`].
pub const DEFAULT_FILE_MODE: u32 = 0o644;

fn decode<T: DeserializeOwned>(method: &str, value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| Error::invalid_response(method, e))
}

fn decode_base64(method: &str, field: &str, data: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(data)
        .map_err(|e| Error::invalid_response(method, format!("{}: {}", field, e)))
}

impl Client {
    /// Create the sandbox and install its local VFS hooks.
    ///
    /// The interception config is validated before anything is sent; a bad
    /// rule fails with [`Error::VfsConfig`] and no sandbox is created.
    pub async fn create(&self, options: CreateOptions) -> Result<String> {
        self.ensure_open()?;

        let compiled = vfs::compile(options.vfs.as_ref())?;
        let local_hooks = compiled.hooks.len();
        let params = serde_json::to_value(CreateParams::new(&options, compiled.wire))?;

        // Installed up front: the host may report file events while booting.
        self.inner.vfs.install(compiled.hooks);

        let value = match self.call("create", Some(params)).await {
            Ok(value) => value,
            Err(e) => {
                self.inner.vfs.clear();
                return Err(e);
            }
        };
        let created: CreateResponse = decode("create", value)?;

        *self.inner.vm_id.write().unwrap_or_else(|e| e.into_inner()) = Some(created.id.clone());
        info!(vm_id = %created.id, image = %options.image, local_hooks, "sandbox created");
        Ok(created.id)
    }

    /// Run a command to completion and collect its output.
    pub async fn exec(&self, command: &str, options: ExecOptions) -> Result<ExecResult> {
        let params = serde_json::to_value(ExecParams {
            command,
            working_dir: options.working_dir.as_deref(),
        })?;
        let value = self
            .call_with("exec", Some(params), options.request_options())
            .await?;
        let raw: ExecResponse = decode("exec", value)?;

        Ok(ExecResult {
            exit_code: raw.exit_code,
            stdout: decode_base64("exec", "stdout", &raw.stdout)?,
            stderr: decode_base64("exec", "stderr", &raw.stderr)?,
            duration_ms: raw.duration_ms,
        })
    }

    /// Run a command, handing each output chunk to `on_output` as it
    /// arrives. Chunks are delivered in the order the host sent them.
    ///
    /// `on_output` runs on the connection's reader task and should return
    /// quickly.
    pub async fn exec_stream<F>(
        &self,
        command: &str,
        options: ExecOptions,
        on_output: F,
    ) -> Result<ExecStreamResult>
    where
        F: Fn(OutputStream, &[u8]) + Send + Sync + 'static,
    {
        let handler: NotificationHandler = Arc::new(move |n: &Notification| {
            let stream = match n.method.as_str() {
                "exec_stream.stdout" => OutputStream::Stdout,
                "exec_stream.stderr" => OutputStream::Stderr,
                other => {
                    debug!(method = other, "unexpected notification during exec_stream");
                    return;
                }
            };
            let Some(data) = n.params.get("data").and_then(Value::as_str) else {
                return;
            };
            match STANDARD.decode(data) {
                Ok(chunk) => on_output(stream, &chunk),
                Err(e) => warn!(error = %e, "dropping undecodable output chunk"),
            }
        });

        let params = serde_json::to_value(ExecParams {
            command,
            working_dir: options.working_dir.as_deref(),
        })?;
        let mut request = options.request_options();
        request.on_notification = Some(handler);

        let value = self.call_with("exec_stream", Some(params), request).await?;
        let raw: ExecStreamResponse = decode("exec_stream", value)?;
        Ok(ExecStreamResult {
            exit_code: raw.exit_code,
            duration_ms: raw.duration_ms,
        })
    }

    /// Write `content` to `path` with mode 0644.
    pub async fn write_file(&self, path: &str, content: impl Into<Vec<u8>>) -> Result<()> {
        self.write_file_mode(path, content, DEFAULT_FILE_MODE).await
    }

    /// Write `content` to `path`.
    ///
    /// Action hooks see the original payload and may block the write; mutate
    /// hooks then rewrite it. Only the final payload is sent.
    pub async fn write_file_mode(
        &self,
        path: &str,
        content: impl Into<Vec<u8>>,
        mode: u32,
    ) -> Result<()> {
        self.ensure_open()?;
        let content = content.into();

        self.inner
            .vfs
            .check_action(&VfsActionRequest {
                op: VfsOp::Write,
                path: path.to_string(),
                size: content.len() as i64,
                mode,
                uid: 0,
                gid: 0,
            })
            .await?;
        let content = self.inner.vfs.apply_mutations(path, mode, content).await?;

        let params = json!({
            "path": path,
            "content": STANDARD.encode(&content),
            "mode": mode,
        });
        self.call("write_file", Some(params)).await?;
        Ok(())
    }

    pub async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        self.ensure_open()?;
        self.inner
            .vfs
            .check_action(&VfsActionRequest {
                op: VfsOp::Read,
                path: path.to_string(),
                size: 0,
                mode: 0,
                uid: 0,
                gid: 0,
            })
            .await?;

        let value = self.call("read_file", Some(json!({ "path": path }))).await?;
        let raw: ReadFileResponse = decode("read_file", value)?;
        decode_base64("read_file", "content", &raw.content)
    }

    pub async fn list_files(&self, path: &str) -> Result<Vec<FileInfo>> {
        let value = self.call("list_files", Some(json!({ "path": path }))).await?;
        let raw: ListFilesResponse = decode("list_files", value)?;
        Ok(raw.files)
    }

    /// Forward local ports into the guest. Returns the bound addresses.
    pub async fn port_forward(&self, forwards: &[PortForward]) -> Result<Vec<PortForwardBinding>> {
        let value = self
            .call("port_forward", Some(json!({ "forwards": forwards })))
            .await?;
        let raw: PortForwardResponse = decode("port_forward", value)?;
        Ok(raw.bindings)
    }
}
