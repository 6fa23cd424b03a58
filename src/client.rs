//! The client facade and its lifecycle task.
//!
//! [`ZincClient`] is the one object an editor holds. All session management
//! runs in a single spawned task that owns the state machine: it launches
//! the server, negotiates capabilities, replays open documents, pumps
//! diagnostics, and decides between restart and terminal failure when the
//! connection dies. The facade only reads shared state and sends commands.

use std::future::Future;
use std::sync::Arc;
use std::sync::{Mutex as StdMutex, PoisonError};
use std::time::Duration;

use tokio::sync::{Mutex, mpsc, oneshot, watch};

use crate::capabilities::{self, Capabilities};
use crate::diagnostics::DiagnosticsStore;
use crate::documents::DocumentStore;
use crate::error::ClientError;
use crate::protocol;
use crate::session::{Incoming, PendingCall, RpcSession, StopReason};
use crate::supervisor::{
    Launcher, ProcessLauncher, RestartDecision, RestartTracker, ServerProcess,
};
use crate::types::{
    ClientConfig, ClientEvent, DiagnosticsSnapshot, DocumentEdit, Position, SessionState,
};

const EVENT_CHANNEL_CAPACITY: usize = 256;
const COMMAND_CHANNEL_CAPACITY: usize = 8;

enum Command {
    Stop { ack: oneshot::Sender<()> },
    Restart,
}

/// The session currently bound to a live connection. Present exactly while
/// the state is `Running`.
struct ActiveSession {
    session: Arc<RpcSession>,
    capabilities: Capabilities,
}

struct ClientShared {
    config: ClientConfig,
    state: watch::Sender<SessionState>,
    active: StdMutex<Option<ActiveSession>>,
    docs: Mutex<DocumentStore>,
    diagnostics: StdMutex<DiagnosticsStore>,
}

impl ClientShared {
    fn current_state(&self) -> SessionState {
        *self.state.borrow()
    }

    fn set_state(&self, next: SessionState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            tracing::info!(from = %prev, to = %next, "session state");
        }
    }

    fn active_pair(&self) -> Option<(Arc<RpcSession>, Capabilities)> {
        let guard = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        guard
            .as_ref()
            .map(|a| (Arc::clone(&a.session), a.capabilities))
    }

    fn set_active(&self, active: Option<ActiveSession>) {
        *self.active.lock().unwrap_or_else(PoisonError::into_inner) = active;
    }

    fn with_diagnostics<T>(&self, f: impl FnOnce(&mut DiagnosticsStore) -> T) -> T {
        let mut guard = self
            .diagnostics
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }
}

/// Handle on one language-server session.
///
/// Cheap to clone conceptually but deliberately not `Clone`: the embedding
/// editor owns exactly one and drives everything through it. Dropping the
/// client stops the lifecycle task, which tears the server down.
pub struct ZincClient {
    shared: Arc<ClientShared>,
    command_tx: mpsc::Sender<Command>,
    state_rx: watch::Receiver<SessionState>,
}

impl ZincClient {
    /// Start a session that spawns the configured executable.
    #[must_use]
    pub fn start(config: ClientConfig) -> (Self, mpsc::Receiver<ClientEvent>) {
        let launcher = ProcessLauncher::from_config(&config);
        Self::start_with(config, launcher)
    }

    /// Start a session over a custom [`Launcher`]. This is the seam tests
    /// use to substitute in-memory connections.
    #[must_use]
    pub fn start_with<L: Launcher>(
        config: ClientConfig,
        launcher: L,
    ) -> (Self, mpsc::Receiver<ClientEvent>) {
        let (state_tx, state_rx) = watch::channel(SessionState::NotStarted);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);

        let shared = Arc::new(ClientShared {
            docs: Mutex::new(DocumentStore::new(&config.language_id)),
            config,
            state: state_tx,
            active: StdMutex::new(None),
            diagnostics: StdMutex::new(DiagnosticsStore::new()),
        });

        tokio::spawn(run(launcher, Arc::clone(&shared), command_rx, event_tx));

        (
            Self {
                shared,
                command_tx,
                state_rx,
            },
            event_rx,
        )
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    /// A watch on state transitions, for editors that display them.
    #[must_use]
    pub fn state_watch(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    /// Wait until the state satisfies `pred`, returning the matching state.
    /// Resolves with the last observed state if the session task is gone.
    pub async fn wait_for_state(
        &self,
        pred: impl FnMut(&SessionState) -> bool,
    ) -> SessionState {
        let mut rx = self.state_rx.clone();
        let matched = rx.wait_for(pred).await.map(|state| *state).ok();
        matched.unwrap_or_else(|| *rx.borrow())
    }

    /// The capability set of the current connection, absent unless `Running`.
    #[must_use]
    pub fn capabilities(&self) -> Option<Capabilities> {
        self.shared.active_pair().map(|(_, caps)| caps)
    }

    /// Current diagnostics across all documents, errors-first.
    #[must_use]
    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        self.shared.with_diagnostics(|store| store.snapshot())
    }

    /// Shut the session down gracefully and wait for terminal `Stopped`.
    /// Safe to call from any state, including after a crash.
    pub async fn stop(&self) {
        let (ack, done) = oneshot::channel();
        if self.command_tx.send(Command::Stop { ack }).await.is_ok() {
            let _ = done.await;
        }
    }

    /// Tear the current connection down gracefully and start a fresh one.
    /// Does not count against the crash-restart bound.
    pub async fn restart(&self) {
        let _ = self.command_tx.send(Command::Restart).await;
    }

    /// Begin tracking a document. The version is caller-owned and must
    /// strictly increase across subsequent [`ZincClient::change_document`]
    /// calls for the same URI.
    pub async fn open_document(
        &self,
        uri: &str,
        version: i32,
        text: String,
    ) -> Result<(), ClientError> {
        let mut docs = self.shared.docs.lock().await;
        docs.open(uri, version, text)?;
        self.flush_outbound(&mut docs).await;
        Ok(())
    }

    /// Record an edit. Rejected edits leave both local state and the
    /// outbound queue untouched.
    pub async fn change_document(
        &self,
        uri: &str,
        version: i32,
        edit: &DocumentEdit,
    ) -> Result<(), ClientError> {
        let mut docs = self.shared.docs.lock().await;
        docs.change(uri, version, edit)?;
        self.flush_outbound(&mut docs).await;
        Ok(())
    }

    /// Stop tracking a document. It will not be replayed after a restart.
    pub async fn close_document(&self, uri: &str) -> Result<(), ClientError> {
        let mut docs = self.shared.docs.lock().await;
        docs.close(uri)?;
        self.flush_outbound(&mut docs).await;
        Ok(())
    }

    /// Request completions at a position. Fails with
    /// [`ClientError::Unsupported`] when the negotiated capabilities do not
    /// include completion.
    pub async fn completion(
        &self,
        uri: &str,
        position: Position,
    ) -> Result<serde_json::Value, ClientError> {
        let (session, caps) = self.running_session()?;
        if !caps.completion() {
            return Err(ClientError::Unsupported("completion"));
        }
        let params = protocol::completion_params(uri, position.line, position.character);
        let result = session
            .call(
                "textDocument/completion",
                Some(params),
                self.shared.config.request_timeout(),
            )
            .await?;
        Ok(result)
    }

    /// Request hover information at a position.
    pub async fn hover(
        &self,
        uri: &str,
        position: Position,
    ) -> Result<serde_json::Value, ClientError> {
        let (session, caps) = self.running_session()?;
        if !caps.hover() {
            return Err(ClientError::Unsupported("hover"));
        }
        let params = protocol::completion_params(uri, position.line, position.character);
        let result = session
            .call(
                "textDocument/hover",
                Some(params),
                self.shared.config.request_timeout(),
            )
            .await?;
        Ok(result)
    }

    /// Escape hatch: send an arbitrary request on the current connection.
    pub async fn call(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        deadline: Duration,
    ) -> Result<serde_json::Value, ClientError> {
        let (session, _) = self.running_session()?;
        let result = session.call(method, params, deadline).await?;
        Ok(result)
    }

    /// Send a request without waiting, for results the editor may stop
    /// caring about (the user kept typing past a completion popup).
    pub async fn begin_call(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<PendingRequest, ClientError> {
        let (session, _) = self.running_session()?;
        let call = session.request(method, params).await?;
        Ok(PendingRequest {
            call,
            deadline: self.shared.config.request_timeout(),
        })
    }

    fn running_session(&self) -> Result<(Arc<RpcSession>, Capabilities), ClientError> {
        let state = self.state();
        if state != SessionState::Running {
            return Err(ClientError::NotRunning(state));
        }
        self.shared
            .active_pair()
            .ok_or(ClientError::NotRunning(state))
    }

    /// Forward queued notifications while `Running`; otherwise leave them
    /// buffered for the session-entry replay. Callers hold the document
    /// lock, so a replay in progress cannot be interleaved.
    async fn flush_outbound(&self, docs: &mut DocumentStore) {
        if self.shared.current_state() != SessionState::Running {
            return;
        }
        let Some((session, _)) = self.shared.active_pair() else {
            return;
        };
        for note in docs.take_outbound() {
            if let Err(err) = session.notify(note.method, Some(note.params)).await {
                tracing::debug!(method = note.method, %err, "dropping outbound notification");
                break;
            }
        }
    }
}

/// An in-flight request started with [`ZincClient::begin_call`].
pub struct PendingRequest {
    call: PendingCall,
    deadline: Duration,
}

impl PendingRequest {
    /// Wait for the result under the configured request timeout.
    pub async fn wait(self) -> Result<serde_json::Value, ClientError> {
        let result = self.call.wait(self.deadline).await?;
        Ok(result)
    }

    /// Abandon the result and best-effort ask the server to stop working
    /// on it. Never waits for the server to acknowledge.
    pub async fn cancel(self) {
        self.call.cancel().await;
    }
}

enum SessionExit {
    Stop(Option<oneshot::Sender<()>>),
    Restart,
    Crashed(StopReason),
}

enum CrashOutcome {
    TryAgain,
    GaveUp,
    Stopped(Option<oneshot::Sender<()>>),
}

enum Raced<T> {
    Done(T),
    Stopped(Option<oneshot::Sender<()>>),
}

/// Drive `fut` while still honoring the command channel, so a stop issued
/// during `Starting` or `Negotiating` does not wait out a request timeout.
async fn race_commands<T>(
    fut: impl Future<Output = T>,
    commands: &mut mpsc::Receiver<Command>,
) -> Raced<T> {
    tokio::pin!(fut);
    loop {
        tokio::select! {
            value = &mut fut => return Raced::Done(value),
            command = commands.recv() => match command {
                Some(Command::Stop { ack }) => return Raced::Stopped(Some(ack)),
                // Already bringing a connection up; nothing extra to do.
                Some(Command::Restart) => {}
                None => return Raced::Stopped(None),
            },
        }
    }
}

async fn run<L: Launcher>(
    launcher: L,
    shared: Arc<ClientShared>,
    mut commands: mpsc::Receiver<Command>,
    events: mpsc::Sender<ClientEvent>,
) {
    let mut tracker = RestartTracker::new(&shared.config.restart);
    let mut spawned_once = false;

    loop {
        shared.set_state(SessionState::Starting);
        let mut connection = match race_commands(launcher.launch(), &mut commands).await {
            Raced::Stopped(ack) => {
                finish_stop(&shared, ack);
                return;
            }
            Raced::Done(Ok(connection)) => connection,
            Raced::Done(Err(err)) => {
                // First spawn failing is fatal; during a restart it counts
                // as one more crash under the policy.
                if !spawned_once {
                    give_up(&shared, &events, format!("failed to launch language server: {err}"))
                        .await;
                    return;
                }
                tracing::warn!(%err, "respawn failed");
                match crash_pause(&shared, &mut tracker, &mut commands).await {
                    CrashOutcome::TryAgain => continue,
                    CrashOutcome::Stopped(ack) => {
                        finish_stop(&shared, ack);
                        return;
                    }
                    CrashOutcome::GaveUp => {
                        give_up(&shared, &events, format!("respawn failed: {err}")).await;
                        return;
                    }
                }
            }
        };
        spawned_once = true;

        let process = connection.process.take();
        let session = Arc::new(RpcSession::start(connection.reader, connection.writer));
        let mut closed = session.closed();
        let mut diag_rx = session.subscribe("textDocument/publishDiagnostics").await;

        shared.set_state(SessionState::Negotiating);
        let root_uri = shared
            .config
            .workdir
            .as_deref()
            .and_then(protocol::path_to_file_uri)
            .map(|u| u.to_string());
        let caps = match race_commands(
            capabilities::negotiate(&session, root_uri.as_deref(), shared.config.request_timeout()),
            &mut commands,
        )
        .await
        {
            Raced::Stopped(ack) => {
                shared.set_state(SessionState::Stopping);
                graceful_shutdown(&shared, &session, process).await;
                finish_stop(&shared, ack);
                return;
            }
            Raced::Done(Ok(caps)) => caps,
            Raced::Done(Err(err)) => {
                tracing::warn!(%err, "capability negotiation failed");
                session.close().await;
                reap(process, &shared.config).await;
                match crash_pause(&shared, &mut tracker, &mut commands).await {
                    CrashOutcome::TryAgain => continue,
                    CrashOutcome::Stopped(ack) => {
                        finish_stop(&shared, ack);
                        return;
                    }
                    CrashOutcome::GaveUp => {
                        give_up(&shared, &events, format!("negotiation failed: {err}")).await;
                        return;
                    }
                }
            }
        };

        // Enter Running under the document lock: the didOpen replay must
        // reach the wire before any editor-triggered flush can run.
        {
            let mut docs = shared.docs.lock().await;
            docs.set_sync_mode(caps.sync_mode());
            docs.replay_for_new_session();
            shared.with_diagnostics(DiagnosticsStore::clear);
            shared.set_active(Some(ActiveSession {
                session: Arc::clone(&session),
                capabilities: caps,
            }));
            shared.set_state(SessionState::Running);
            for note in docs.take_outbound() {
                if session.notify(note.method, Some(note.params)).await.is_err() {
                    break;
                }
            }
        }

        let exit = loop {
            tokio::select! {
                reason = async {
                    match closed.wait_for(Option::is_some).await {
                        Ok(reason) => reason.clone().unwrap_or(StopReason::Exited),
                        Err(_) => StopReason::Exited,
                    }
                } => break SessionExit::Crashed(reason),
                incoming = diag_rx.recv() => match incoming {
                    Some(incoming) => handle_diagnostics(&shared, &events, incoming).await,
                    None => break SessionExit::Crashed(StopReason::Exited),
                },
                command = commands.recv() => match command {
                    Some(Command::Stop { ack }) => break SessionExit::Stop(Some(ack)),
                    Some(Command::Restart) => break SessionExit::Restart,
                    // Client dropped: tear the server down and bow out.
                    None => break SessionExit::Stop(None),
                },
            }
        };

        shared.set_active(None);
        match exit {
            SessionExit::Stop(ack) => {
                shared.set_state(SessionState::Stopping);
                graceful_shutdown(&shared, &session, process).await;
                finish_stop(&shared, ack);
                return;
            }
            SessionExit::Restart => {
                tracing::info!("explicit restart requested");
                graceful_shutdown(&shared, &session, process).await;
                shared.set_state(SessionState::Restarting);
            }
            SessionExit::Crashed(reason) => {
                tracing::warn!(%reason, "session ended unexpectedly");
                session.close().await;
                reap(process, &shared.config).await;
                match crash_pause(&shared, &mut tracker, &mut commands).await {
                    CrashOutcome::TryAgain => {}
                    CrashOutcome::Stopped(ack) => {
                        finish_stop(&shared, ack);
                        return;
                    }
                    CrashOutcome::GaveUp => {
                        give_up(
                            &shared,
                            &events,
                            format!("server crashed repeatedly; last failure: {reason}"),
                        )
                        .await;
                        return;
                    }
                }
            }
        }
    }
}

/// Consult the restart policy and, when it allows another attempt, sit out
/// the backoff. A stop command during the pause wins over the retry.
async fn crash_pause(
    shared: &ClientShared,
    tracker: &mut RestartTracker,
    commands: &mut mpsc::Receiver<Command>,
) -> CrashOutcome {
    match tracker.on_crash(tokio::time::Instant::now()) {
        RestartDecision::GiveUp => CrashOutcome::GaveUp,
        RestartDecision::Restart { delay } => {
            shared.set_state(SessionState::Restarting);
            tracing::info!(?delay, "restarting after backoff");
            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    () = &mut sleep => return CrashOutcome::TryAgain,
                    command = commands.recv() => match command {
                        Some(Command::Stop { ack }) => return CrashOutcome::Stopped(Some(ack)),
                        Some(Command::Restart) => {}
                        None => return CrashOutcome::Stopped(None),
                    },
                }
            }
        }
    }
}

async fn graceful_shutdown(
    shared: &ClientShared,
    session: &RpcSession,
    process: Option<ServerProcess>,
) {
    if session.is_open() {
        let grace = shared.config.shutdown_grace();
        match session.call("shutdown", None, grace).await {
            Ok(_) => {
                let _ = session.notify("exit", None).await;
            }
            Err(err) => tracing::debug!(%err, "shutdown request failed; killing"),
        }
        session.close().await;
    }
    reap(process, &shared.config).await;
}

async fn reap(process: Option<ServerProcess>, config: &ClientConfig) {
    if let Some(process) = process {
        process.wait_or_kill(config.shutdown_grace()).await;
    }
}

fn finish_stop(shared: &ClientShared, ack: Option<oneshot::Sender<()>>) {
    shared.set_state(SessionState::Stopped);
    if let Some(ack) = ack {
        let _ = ack.send(());
    }
}

async fn give_up(shared: &ClientShared, events: &mpsc::Sender<ClientEvent>, reason: String) {
    tracing::error!(%reason, "language server session failed permanently");
    shared.set_active(None);
    // Queue the event before the terminal transition so anything woken by
    // the state change observes it.
    let _ = events.send(ClientEvent::Failed { reason }).await;
    shared.set_state(SessionState::Crashed);
}

async fn handle_diagnostics(
    shared: &ClientShared,
    events: &mpsc::Sender<ClientEvent>,
    incoming: Incoming,
) {
    let Some(params) = incoming.params else {
        return;
    };
    let parsed: protocol::PublishDiagnosticsParams = match serde_json::from_value(params) {
        Ok(parsed) => parsed,
        Err(err) => {
            tracing::debug!(%err, "ignoring malformed publishDiagnostics");
            return;
        }
    };
    if protocol::parse_document_uri(&parsed.uri).is_none() {
        tracing::warn!(uri = %parsed.uri, "ignoring diagnostics with unparseable URI");
        return;
    }
    let items: Vec<_> = parsed
        .diagnostics
        .iter()
        .map(protocol::WireDiagnostic::to_diagnostic)
        .collect();
    shared.with_diagnostics(|store| store.update(parsed.uri.clone(), items.clone()));
    let _ = events
        .send(ClientEvent::Diagnostics {
            uri: parsed.uri,
            items,
        })
        .await;
}
