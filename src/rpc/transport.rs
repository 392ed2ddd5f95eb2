//! Byte-stream transport to the sandbox host.
//!
//! Outbound frames go through a channel to a single writer task, which owns
//! the host's input stream and always writes a frame whole. A caller that
//! stops waiting can therefore never leave half a line behind. A single
//! reader task decodes inbound lines and either completes a pending request
//! or hands the notification to the router. Both tasks start on the first
//! request.

use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::pending::{NotificationHandler, PendingTable};
use super::wire::{self, Inbound, Notification};
use crate::error::{Error, Result};

pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;
pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;

/// Frames queued ahead of the writer task.
const OUTBOUND_QUEUE: usize = 64;

enum Outbound {
    /// One encoded line. `id` is the pending request to fail if the write
    /// does not happen; `None` for untracked messages such as `cancel`.
    Frame { id: Option<u64>, bytes: Vec<u8> },
    /// Flush what is queued, close the stream and acknowledge.
    Shutdown(oneshot::Sender<()>),
}

/// Receives notifications that do not belong to a pending streaming request.
pub(crate) trait NotificationRouter: Send + Sync {
    fn route(self: Arc<Self>, notification: Notification);
}

/// Per-call knobs for [`Transport::request`].
#[derive(Clone, Default)]
pub struct RequestOptions {
    /// Give up locally (and tell the host) when this token is cancelled.
    pub cancel: Option<CancellationToken>,
    /// Give up locally (and tell the host) after this long.
    pub timeout: Option<Duration>,
    /// Invoked for each notification carrying this request's id.
    pub on_notification: Option<NotificationHandler>,
}

impl RequestOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Self::default()
        }
    }

    pub fn with_cancel(cancel: CancellationToken) -> Self {
        Self {
            cancel: Some(cancel),
            ..Self::default()
        }
    }
}

/// I/O halves waiting for their tasks to be started.
struct Idle {
    writer: BoxWriter,
    reader: BoxReader,
    outbound: mpsc::Receiver<Outbound>,
}

pub(crate) struct Transport {
    /// `None` once the write side has been shut down.
    outbound: Mutex<Option<mpsc::Sender<Outbound>>>,
    idle: Mutex<Option<Idle>>,
    started: AtomicBool,
    pending: Arc<PendingTable>,
    router: Weak<dyn NotificationRouter>,
}

impl Transport {
    pub fn new(writer: BoxWriter, reader: BoxReader, router: Weak<dyn NotificationRouter>) -> Self {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        Self {
            outbound: Mutex::new(Some(tx)),
            idle: Mutex::new(Some(Idle {
                writer,
                reader,
                outbound: rx,
            })),
            started: AtomicBool::new(false),
            pending: Arc::new(PendingTable::new()),
            router,
        }
    }

    /// Spawn the writer and reader tasks if they are not running yet.
    /// Idempotent.
    fn ensure_started(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let idle = self.idle.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(Idle {
            writer,
            reader,
            outbound,
        }) = idle
        {
            tokio::spawn(write_loop(writer, outbound, Arc::clone(&self.pending)));
            tokio::spawn(read_loop(
                reader,
                Arc::clone(&self.pending),
                self.router.clone(),
            ));
        }
    }

    fn sender(&self) -> Result<mpsc::Sender<Outbound>> {
        self.outbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(Error::Closed)
    }

    /// Send a request and wait for its response.
    ///
    /// If the cancellation token fires or the timeout elapses first, a
    /// `cancel` message is queued without waiting for it to be answered and
    /// the local error is returned. This also holds while the frame is still
    /// waiting for room in the outbound queue. Dropping the returned future
    /// has the same effect.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        options: RequestOptions,
    ) -> Result<Value> {
        self.ensure_started();
        let tx = self.sender()?;

        let RequestOptions {
            cancel,
            timeout,
            on_notification,
        } = options;

        let (id, rx) = self.pending.register(on_notification)?;
        let mut guard = InFlight {
            id,
            pending: &self.pending,
            outbound: &tx,
            sent: false,
        };

        let bytes = wire::encode_request(id, method, params.as_ref())?;

        let cancelled = async {
            match &cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };
        let deadline = async {
            match timeout {
                Some(t) => tokio::time::sleep(t).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(cancelled);
        tokio::pin!(deadline);

        let give_up = |why: Error| {
            debug!(id, method, error = %why, "request abandoned");
            why
        };

        trace!(id, method, "queueing request");
        tokio::select! {
            biased;
            queued = tx.send(Outbound::Frame { id: Some(id), bytes }) => {
                queued.map_err(|_| Error::Closed)?;
            }
            _ = &mut cancelled => return Err(give_up(Error::Cancelled)),
            _ = &mut deadline => {
                return Err(give_up(Error::DeadlineExceeded(timeout.unwrap_or_default())));
            }
        }
        guard.sent = true;

        tokio::select! {
            biased;
            outcome = rx => outcome.unwrap_or(Err(Error::ConnectionClosed)),
            _ = &mut cancelled => Err(give_up(Error::Cancelled)),
            _ = &mut deadline => {
                Err(give_up(Error::DeadlineExceeded(timeout.unwrap_or_default())))
            }
        }
    }

    /// Close the write side once everything already queued has been written.
    /// Later requests fail with [`Error::Closed`].
    pub async fn shutdown_writer(&self) {
        self.ensure_started();
        let tx = self.outbound.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(tx) = tx else {
            return;
        };
        let (done_tx, done_rx) = oneshot::channel();
        if tx.send(Outbound::Shutdown(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }

    #[cfg(test)]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Drop guard for an in-flight request. Removes the table entry when the
/// caller stops waiting and, if the request had been queued and was still
/// unanswered, fires a `cancel` for it.
struct InFlight<'a> {
    id: u64,
    pending: &'a Arc<PendingTable>,
    outbound: &'a mpsc::Sender<Outbound>,
    sent: bool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let was_pending = self.pending.remove(self.id);
        if self.sent && was_pending {
            fire_cancel(self.pending, self.outbound, self.id);
        }
    }
}

fn fire_cancel(pending: &PendingTable, outbound: &mpsc::Sender<Outbound>, target: u64) {
    let params = serde_json::json!({ "id": target });
    let bytes = match wire::encode_request(pending.next_id(), "cancel", Some(&params)) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(request_id = target, error = %e, "failed to encode cancel");
            return;
        }
    };

    match outbound.try_send(Outbound::Frame { id: None, bytes }) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(frame)) => {
            let Ok(handle) = tokio::runtime::Handle::try_current() else {
                return;
            };
            let outbound = outbound.clone();
            handle.spawn(async move {
                if outbound.send(frame).await.is_err() {
                    debug!(request_id = target, "cancel was not delivered");
                }
            });
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!(request_id = target, "cancel was not delivered");
        }
    }
}

async fn write_loop(
    mut writer: BoxWriter,
    mut outbound: mpsc::Receiver<Outbound>,
    pending: Arc<PendingTable>,
) {
    while let Some(message) = outbound.recv().await {
        match message {
            Outbound::Frame { id, bytes } => {
                let written = async {
                    writer.write_all(&bytes).await?;
                    writer.flush().await
                };
                if let Err(e) = written.await {
                    warn!(error = %e, "failed to write to sandbox host");
                    if let Some(id) = id {
                        pending.complete(id, Err(Error::Io(e)));
                    }
                    break;
                }
            }
            Outbound::Shutdown(done) => {
                if let Err(e) = writer.shutdown().await {
                    debug!(error = %e, "failed to shut down host stdin");
                }
                let _ = done.send(());
                break;
            }
        }
    }

    // Nothing queued from here on will be written.
    outbound.close();
    while let Ok(message) = outbound.try_recv() {
        match message {
            Outbound::Frame { id: Some(id), .. } => {
                pending.complete(id, Err(Error::Closed));
            }
            Outbound::Frame { id: None, .. } => {}
            Outbound::Shutdown(done) => {
                let _ = done.send(());
            }
        }
    }
}

async fn read_loop(
    reader: BoxReader,
    pending: Arc<PendingTable>,
    router: Weak<dyn NotificationRouter>,
) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => {
                debug!("sandbox host closed its output stream");
                break;
            }
            Ok(_) => match std::str::from_utf8(&buf) {
                Ok(line) => {
                    let line = line.trim();
                    if !line.is_empty() {
                        handle_line(line, &pending, &router);
                    }
                }
                Err(e) => {
                    warn!(error = %e, len = buf.len(), "dropping non-UTF-8 line from sandbox host");
                }
            },
            Err(e) => {
                warn!(error = %e, "failed to read from sandbox host");
                break;
            }
        }
    }

    let failed = pending.fail_all();
    if failed > 0 {
        warn!(failed, "connection closed with requests in flight");
    }
}

fn handle_line(line: &str, pending: &PendingTable, router: &Weak<dyn NotificationRouter>) {
    let inbound = match wire::decode_line(line) {
        Ok(inbound) => inbound,
        Err(e) => {
            warn!(error = %e, "dropping undecodable frame from sandbox host");
            return;
        }
    };

    match inbound {
        Inbound::Response { id, outcome } => {
            let outcome = outcome.map_err(|e| Error::Remote {
                code: e.code,
                message: e.message,
            });
            if !pending.complete(id, outcome) {
                debug!(id, "discarding response for request nobody is waiting on");
            }
        }
        Inbound::Notification(notification) => {
            // Streaming chunks go to the originating request inline so their
            // order is preserved.
            if let Some(handler) = notification
                .request_id()
                .and_then(|id| pending.notification_handler(id))
            {
                handler(&notification);
                return;
            }
            match router.upgrade() {
                Some(router) => router.route(notification),
                None => trace!(method = %notification.method, "no router; dropping notification"),
            }
        }
    }
}
