//! In-process sandbox host for tests, speaking the same line protocol over a
//! duplex pipe.
//!
//! Files live in a map. `exec` understands a handful of commands: `echo`,
//! `true`, `false`, and `sleep`, which never answers until cancelled.
//! Anything else fails with the exec error code.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, WriteHalf};

use super::Client;

struct StoredFile {
    content: Vec<u8>,
    mode: u32,
}

pub(crate) struct FakeHost {
    methods: Arc<Mutex<Vec<String>>>,
}

impl FakeHost {
    /// A client wired to a freshly started fake host.
    pub fn start() -> (Client, FakeHost) {
        let (client_io, host_io) = tokio::io::duplex(256 * 1024);
        let (client_read, client_write) = tokio::io::split(client_io);
        let (host_read, host_write) = tokio::io::split(host_io);

        let methods = Arc::new(Mutex::new(Vec::new()));
        tokio::spawn(serve(host_read, host_write, Arc::clone(&methods)));

        (Client::from_streams(client_write, client_read), FakeHost { methods })
    }

    /// Every method received so far, in arrival order.
    pub fn methods(&self) -> Vec<String> {
        self.methods.lock().unwrap().clone()
    }

    pub fn count(&self, method: &str) -> usize {
        self.methods.lock().unwrap().iter().filter(|m| *m == method).count()
    }
}

/// Poll `condition` until it holds, failing the test after five seconds.
pub(crate) async fn eventually(condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn send(out: &mut WriteHalf<DuplexStream>, value: Value) {
    let mut line = serde_json::to_vec(&value).unwrap();
    line.push(b'\n');
    out.write_all(&line).await.unwrap();
}

async fn reply(out: &mut WriteHalf<DuplexStream>, id: &Value, result: Value) {
    send(out, json!({"jsonrpc": "2.0", "id": id, "result": result})).await;
}

async fn reply_error(out: &mut WriteHalf<DuplexStream>, id: &Value, code: i64, message: &str) {
    send(
        out,
        json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}}),
    )
    .await;
}

async fn stream_chunk(out: &mut WriteHalf<DuplexStream>, id: &Value, stream: &str, data: &[u8]) {
    send(
        out,
        json!({
            "jsonrpc": "2.0",
            "method": format!("exec_stream.{}", stream),
            "params": {"id": id, "data": STANDARD.encode(data)},
        }),
    )
    .await;
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) => "/",
        Some(i) => &path[..i],
        None => "",
    }
}

async fn serve(
    input: tokio::io::ReadHalf<DuplexStream>,
    mut out: WriteHalf<DuplexStream>,
    methods: Arc<Mutex<Vec<String>>>,
) {
    let mut lines = BufReader::new(input).lines();
    let mut files: BTreeMap<String, StoredFile> = BTreeMap::new();
    let mut sleeping: HashSet<u64> = HashSet::new();
    let mut emit_events = false;

    while let Ok(Some(line)) = lines.next_line().await {
        let request: Value = serde_json::from_str(&line).unwrap();
        let method = request["method"].as_str().unwrap_or_default().to_string();
        let id = request["id"].clone();
        let params = request["params"].clone();
        methods.lock().unwrap().push(method.clone());

        match method.as_str() {
            "create" => {
                emit_events = params["vfs"]["interception"]["emit_events"]
                    .as_bool()
                    .unwrap_or(false);
                reply(&mut out, &id, json!({"id": "vm-test0001"})).await;
            }
            "write_file" => {
                let path = params["path"].as_str().unwrap().to_string();
                let content = STANDARD
                    .decode(params["content"].as_str().unwrap())
                    .unwrap();
                let mode = params["mode"].as_u64().unwrap_or(0o644) as u32;
                let size = content.len();
                files.insert(path.clone(), StoredFile { content, mode });

                if emit_events {
                    send(
                        &mut out,
                        json!({
                            "jsonrpc": "2.0",
                            "method": "event",
                            "params": {
                                "type": "file",
                                "file": {"op": "write", "path": path, "size": size, "mode": mode, "uid": 0, "gid": 0},
                            },
                        }),
                    )
                    .await;
                }
                reply(&mut out, &id, json!({})).await;
            }
            "read_file" => {
                let path = params["path"].as_str().unwrap();
                match files.get(path) {
                    Some(file) => {
                        reply(&mut out, &id, json!({"content": STANDARD.encode(&file.content)}))
                            .await
                    }
                    None => reply_error(&mut out, &id, -32002, "no such file").await,
                }
            }
            "list_files" => {
                let dir = params["path"].as_str().unwrap().trim_end_matches('/');
                let listing: Vec<Value> = files
                    .iter()
                    .filter(|(path, _)| parent_of(path) == dir)
                    .map(|(path, file)| {
                        json!({
                            "name": path.rsplit('/').next().unwrap_or_default(),
                            "size": file.content.len(),
                            "mode": file.mode,
                            "is_dir": false,
                        })
                    })
                    .collect();
                reply(&mut out, &id, json!({"files": listing})).await;
            }
            "exec" => {
                let command = params["command"].as_str().unwrap_or_default();
                let (word, rest) = command.split_once(' ').unwrap_or((command, ""));
                match word {
                    "sleep" => {
                        sleeping.insert(id.as_u64().unwrap());
                    }
                    "echo" => {
                        let stdout = format!("{}\n", rest);
                        reply(
                            &mut out,
                            &id,
                            json!({"exit_code": 0, "stdout": STANDARD.encode(stdout), "stderr": "", "duration_ms": 1}),
                        )
                        .await;
                    }
                    "true" | "false" => {
                        let exit_code = if word == "true" { 0 } else { 1 };
                        reply(
                            &mut out,
                            &id,
                            json!({"exit_code": exit_code, "stdout": "", "stderr": "", "duration_ms": 1}),
                        )
                        .await;
                    }
                    _ => reply_error(&mut out, &id, -32001, "command not found").await,
                }
            }
            "exec_stream" => {
                stream_chunk(&mut out, &id, "stdout", b"step 1\n").await;
                stream_chunk(&mut out, &id, "stderr", b"warning\n").await;
                stream_chunk(&mut out, &id, "stdout", b"step 2\n").await;
                reply(&mut out, &id, json!({"exit_code": 0, "duration_ms": 3})).await;
            }
            "port_forward" => {
                let bindings: Vec<Value> = params["forwards"]
                    .as_array()
                    .cloned()
                    .unwrap_or_default()
                    .into_iter()
                    .map(|f| {
                        json!({
                            "address": "127.0.0.1",
                            "local_port": f["local_port"],
                            "remote_port": f["remote_port"],
                        })
                    })
                    .collect();
                reply(&mut out, &id, json!({"bindings": bindings})).await;
            }
            "cancel" => {
                if let Some(target) = params["id"].as_u64()
                    && sleeping.remove(&target)
                {
                    reply_error(&mut out, &json!(target), -32003, "cancelled").await;
                }
                reply(&mut out, &id, Value::Null).await;
            }
            "close" => {
                reply(&mut out, &id, Value::Null).await;
                break;
            }
            other => {
                reply_error(&mut out, &id, -32601, &format!("unknown method {}", other)).await;
            }
        }
    }
}

