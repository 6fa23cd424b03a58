//! Correlated request/response session over one connection.
//!
//! A session owns a reader task and a writer task for the lifetime of a
//! single spawned process. Outgoing requests are matched to responses by a
//! monotonically assigned correlation id; incoming notifications are fanned
//! out to per-method subscribers. Exactly one of {matching response,
//! deadline, session close} resolves any given call.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, mpsc, oneshot, watch};

use crate::codec::{FrameReader, FrameWriter};
use crate::error::{CodecError, RpcError};
use crate::protocol::{self, IncomingFrame, Notification, Request};

const WRITER_CHANNEL_CAPACITY: usize = 64;
const SUBSCRIPTION_CAPACITY: usize = 64;

/// Why the session stopped accepting traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum StopReason {
    /// The server closed its end of the connection.
    Exited,
    /// The server sent something the protocol cannot account for.
    Protocol(String),
    /// The connection failed at the transport layer.
    Io(String),
    /// We closed the session ourselves.
    LocalClose,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exited => f.write_str("server closed the connection"),
            Self::Protocol(msg) => write!(f, "protocol violation: {msg}"),
            Self::Io(msg) => write!(f, "connection error: {msg}"),
            Self::LocalClose => f.write_str("closed locally"),
        }
    }
}

enum WriterCommand {
    Send(serde_json::Value),
    Shutdown,
}

/// An inbound notification or server-initiated request delivered to a
/// subscriber. `id` is present only for server requests, which expect an
/// answer via [`RpcSession::respond`].
#[derive(Debug)]
pub(crate) struct Incoming {
    pub id: Option<serde_json::Value>,
    pub params: Option<serde_json::Value>,
}

type PendingMap = HashMap<u64, oneshot::Sender<Result<serde_json::Value, RpcError>>>;

struct Shared {
    pending: Mutex<PendingMap>,
    subscriptions: Mutex<HashMap<String, mpsc::Sender<Incoming>>>,
    writer_tx: mpsc::Sender<WriterCommand>,
    stop: watch::Sender<Option<StopReason>>,
}

impl Shared {
    fn is_open(&self) -> bool {
        self.stop.borrow().is_none()
    }

    /// Record the stop reason (first writer wins), fail every pending call
    /// with `SessionClosed`, and release the writer. Idempotent.
    async fn shut_down(&self, reason: StopReason) {
        let mut reason = Some(reason);
        let newly_stopped = self.stop.send_if_modified(|current| {
            if current.is_none() {
                *current = reason.take();
                true
            } else {
                false
            }
        });
        if !newly_stopped {
            return;
        }

        let drained: Vec<_> = self.pending.lock().await.drain().collect();
        for (id, slot) in drained {
            tracing::debug!(id, "failing pending request: session closed");
            let _ = slot.send(Err(RpcError::SessionClosed));
        }
        let _ = self.writer_tx.try_send(WriterCommand::Shutdown);
    }
}

/// One request awaiting its response. Dropping it abandons the result
/// without telling anyone; [`PendingCall::cancel`] also signals the server.
pub(crate) struct PendingCall {
    id: u64,
    rx: oneshot::Receiver<Result<serde_json::Value, RpcError>>,
    shared: Arc<Shared>,
}

impl PendingCall {
    #[cfg(test)]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Suspend until the matching response arrives, the deadline passes,
    /// or the session closes.
    pub async fn wait(self, deadline: Duration) -> Result<serde_json::Value, RpcError> {
        let Self { id, rx, shared } = self;
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(result)) => result,
            // Sender dropped without resolving: the session tore down.
            Ok(Err(_)) => Err(RpcError::SessionClosed),
            Err(_) => {
                // Remove the slot so a late response is discarded instead
                // of resolving a call nobody is waiting on.
                shared.pending.lock().await.remove(&id);
                Err(RpcError::RequestTimeout(deadline))
            }
        }
    }

    /// Stop waiting and best-effort tell the server to stop working.
    /// Server-side cancellation is never assumed to succeed.
    pub async fn cancel(self) {
        if self.shared.pending.lock().await.remove(&self.id).is_none() {
            return;
        }
        let note = Notification::new("$/cancelRequest", Some(protocol::cancel_params(self.id)));
        if let Ok(frame) = serde_json::to_value(&note) {
            let _ = self.shared.writer_tx.send(WriterCommand::Send(frame)).await;
        }
    }
}

/// The request/response channel bound to one spawned process.
pub(crate) struct RpcSession {
    shared: Arc<Shared>,
    next_id: AtomicU64,
    reader_task: tokio::task::JoinHandle<()>,
    writer_task: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl RpcSession {
    /// Wire a session onto the two halves of a connection's byte stream.
    pub fn start<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (writer_tx, writer_rx) = mpsc::channel(WRITER_CHANNEL_CAPACITY);
        let (stop, _) = watch::channel(None);

        let shared = Arc::new(Shared {
            pending: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
            writer_tx,
            stop,
        });

        let writer_task = tokio::spawn(write_loop(FrameWriter::new(writer), writer_rx));
        let reader_task = tokio::spawn(read_loop(FrameReader::new(reader), shared.clone()));

        Self {
            shared,
            next_id: AtomicU64::new(1),
            reader_task,
            writer_task: std::sync::Mutex::new(Some(writer_task)),
        }
    }

    /// Send a request and hand back the pending slot. Ids are assigned here
    /// and never reused while a response is outstanding.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<PendingCall, RpcError> {
        if !self.shared.is_open() {
            return Err(RpcError::SessionClosed);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().await.insert(id, tx);

        let frame = serde_json::to_value(Request::new(id, method, params))
            .expect("request envelope serializes");
        if self
            .shared
            .writer_tx
            .send(WriterCommand::Send(frame))
            .await
            .is_err()
        {
            self.shared.pending.lock().await.remove(&id);
            return Err(RpcError::SessionClosed);
        }

        Ok(PendingCall {
            id,
            rx,
            shared: self.shared.clone(),
        })
    }

    /// Request plus wait, the common case.
    pub async fn call(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        deadline: Duration,
    ) -> Result<serde_json::Value, RpcError> {
        self.request(method, params).await?.wait(deadline).await
    }

    /// Fire-and-forget notification.
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), RpcError> {
        if !self.shared.is_open() {
            return Err(RpcError::SessionClosed);
        }
        let frame = serde_json::to_value(Notification::new(method, params))
            .expect("notification envelope serializes");
        self.shared
            .writer_tx
            .send(WriterCommand::Send(frame))
            .await
            .map_err(|_| RpcError::SessionClosed)
    }

    /// Answer a server-initiated request previously delivered to a
    /// subscriber.
    pub async fn respond(
        &self,
        id: serde_json::Value,
        result: serde_json::Value,
    ) -> Result<(), RpcError> {
        if !self.shared.is_open() {
            return Err(RpcError::SessionClosed);
        }
        let frame = serde_json::json!({ "jsonrpc": "2.0", "id": id, "result": result });
        self.shared
            .writer_tx
            .send(WriterCommand::Send(frame))
            .await
            .map_err(|_| RpcError::SessionClosed)
    }

    /// Receive inbound notifications and server requests for one method.
    /// A later subscription for the same method replaces the earlier one.
    pub async fn subscribe(&self, method: &str) -> mpsc::Receiver<Incoming> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        self.shared
            .subscriptions
            .lock()
            .await
            .insert(method.to_string(), tx);
        rx
    }

    /// Observe session termination; the value flips to `Some(reason)` once.
    pub fn closed(&self) -> watch::Receiver<Option<StopReason>> {
        self.shared.stop.subscribe()
    }

    pub fn is_open(&self) -> bool {
        self.shared.is_open()
    }

    /// Close locally: every pending call fails with `SessionClosed`, then
    /// the writer drains its queue so frames it already accepted (the final
    /// `exit` notification in particular) reach the wire before the
    /// connection is discarded.
    pub async fn close(&self) {
        self.shared.shut_down(StopReason::LocalClose).await;
        let _ = self.shared.writer_tx.send(WriterCommand::Shutdown).await;
        let handle = self
            .writer_task
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    #[cfg(test)]
    pub async fn pending_len(&self) -> usize {
        self.shared.pending.lock().await.len()
    }
}

impl Drop for RpcSession {
    fn drop(&mut self) {
        self.reader_task.abort();
        let handle = self
            .writer_task
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

async fn write_loop<W: AsyncWrite + Unpin>(
    mut writer: FrameWriter<W>,
    mut rx: mpsc::Receiver<WriterCommand>,
) {
    while let Some(command) = rx.recv().await {
        match command {
            WriterCommand::Send(frame) => {
                if let Err(e) = writer.write_frame(&frame).await {
                    tracing::warn!("connection write failed: {e}");
                    break;
                }
            }
            WriterCommand::Shutdown => break,
        }
    }
    // Dropping the writer closes the child's stdin, which is the cue for a
    // well-behaved server to exit after `exit`.
}

async fn read_loop<R: AsyncRead + Unpin>(mut reader: FrameReader<R>, shared: Arc<Shared>) {
    loop {
        match reader.read_frame().await {
            Ok(Some(frame)) => {
                if !dispatch(&frame, &shared).await {
                    shared
                        .shut_down(StopReason::Protocol(
                            "frame is neither request, response, nor notification".to_string(),
                        ))
                        .await;
                    break;
                }
                if !shared.is_open() {
                    break;
                }
            }
            Ok(None) => {
                tracing::info!("server closed the connection");
                shared.shut_down(StopReason::Exited).await;
                break;
            }
            Err(CodecError::Io(e)) => {
                shared.shut_down(StopReason::Io(e.to_string())).await;
                break;
            }
            Err(e) => {
                tracing::warn!("poisoned connection: {e}");
                shared.shut_down(StopReason::Protocol(e.to_string())).await;
                break;
            }
        }
    }
}

/// Route one classified frame. Returns `false` on a protocol error.
async fn dispatch(frame: &serde_json::Value, shared: &Shared) -> bool {
    match protocol::classify(frame) {
        Some(IncomingFrame::Response { id, result }) => {
            let slot = match id.as_u64() {
                Some(id) => shared.pending.lock().await.remove(&id),
                // We only ever issue u64 ids, so this cannot be ours.
                None => None,
            };
            match slot {
                Some(tx) => {
                    let _ = tx.send(result);
                }
                // Timed-out or cancelled call, or a server bug. Non-fatal.
                None => tracing::warn!(%id, "discarding response with no pending request"),
            }
        }
        Some(IncomingFrame::ServerRequest { id, method, params }) => {
            let subscriber = shared.subscriptions.lock().await.get(&method).cloned();
            match subscriber {
                Some(tx) => {
                    let _ = tx
                        .send(Incoming {
                            id: Some(id),
                            params,
                        })
                        .await;
                }
                None => {
                    tracing::debug!(%method, "answering unhandled server request with -32601");
                    let reply = protocol::method_not_found(id, &method);
                    let _ = shared.writer_tx.send(WriterCommand::Send(reply)).await;
                }
            }
        }
        Some(IncomingFrame::Notification { method, params }) => {
            let subscriber = shared.subscriptions.lock().await.get(&method).cloned();
            match subscriber {
                Some(tx) => {
                    if tx.send(Incoming { id: None, params }).await.is_err() {
                        shared.subscriptions.lock().await.remove(&method);
                    }
                }
                None => tracing::trace!(%method, "no subscriber for notification"),
            }
        }
        None => return false,
    }
    true
}
