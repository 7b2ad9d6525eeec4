//! The client's event loop.
//!
//! Every command from the application and every connection event arrives on
//! one unbounded channel and is handled in order on the thread running
//! [`Client::run`](crate::Client::run). Timers are spawned tasks that post a
//! command back to the channel when they fire; a generation counter makes
//! stale timers harmless.

use crate::client::ClientShared;
use crate::config::ReconnectMode;
use crate::endpoint::ServerEndpoint;
use crate::engine::{BindRequest, Disposition, Outbox, Phase, SessionEngine, WaitHandler};
use crate::session::SessionErrorInfo;
use crate::status::{ErrorCode, Status};
use crate::transport::{Connection, ConnectionEvent, ConnectionEvents};
use flexsync_protocol::{ClientMessage, QueryVersion, ServerMessage, SessionIdent};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};

/// Identifies a connection within its client.
pub type ConnectionId = u64;

/// Work for the event loop.
pub(crate) enum Command {
    Bind(Box<BindRequest>),
    Terminate {
        session: SessionIdent,
    },
    NonsyncTransact {
        session: SessionIdent,
    },
    WaitUpload {
        session: SessionIdent,
        handler: WaitHandler,
    },
    WaitDownload {
        session: SessionIdent,
        handler: WaitHandler,
    },
    WaitSync {
        session: SessionIdent,
        handler: WaitHandler,
    },
    Refresh {
        session: SessionIdent,
        token: String,
    },
    CancelReconnectDelay {
        session: Option<SessionIdent>,
    },
    NewSubscription {
        session: SessionIdent,
        version: QueryVersion,
    },
    Connection {
        connection: ConnectionId,
        event: ConnectionEvent,
    },
    ConnectTimeout {
        connection: ConnectionId,
    },
    ReconnectTimer {
        key: ConnectionKey,
        generation: u64,
    },
    ResumeTimer {
        session: SessionIdent,
        generation: u64,
    },
    Shutdown,
}

impl Command {
    /// Disposes of a command the event loop will never handle.
    pub(crate) fn abandon(self, client: &ClientShared) {
        match self {
            Command::WaitUpload { handler, .. }
            | Command::WaitDownload { handler, .. }
            | Command::WaitSync { handler, .. } => handler.call(Status::aborted()),
            Command::Terminate { .. } => client.termination_completed(),
            _ => {}
        }
    }
}

/// Sessions with equal keys share a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct ConnectionKey {
    endpoint: ServerEndpoint,
    dedicated: Option<SessionIdent>,
}

struct ConnectionEntry {
    key: ConnectionKey,
    connection: Box<dyn Connection>,
    established: bool,
    sessions: BTreeSet<SessionIdent>,
}

/// Reconnect bookkeeping per key. Outlives connections and sessions.
#[derive(Debug, Default)]
struct EndpointState {
    attempt: u32,
    generation: u64,
    delayed: bool,
    connection: Option<ConnectionId>,
}

pub(crate) struct EventLoop {
    client: Arc<ClientShared>,
    rx: UnboundedReceiver<Command>,
    sessions: BTreeMap<SessionIdent, SessionEngine>,
    connections: HashMap<ConnectionId, ConnectionEntry>,
    endpoints: HashMap<ConnectionKey, EndpointState>,
    next_connection_id: ConnectionId,
}

impl EventLoop {
    pub(crate) fn new(client: Arc<ClientShared>, rx: UnboundedReceiver<Command>) -> Self {
        Self {
            client,
            rx,
            sessions: BTreeMap::new(),
            connections: HashMap::new(),
            endpoints: HashMap::new(),
            next_connection_id: 1,
        }
    }

    pub(crate) async fn run(mut self) {
        info!("sync client event loop started");
        while let Some(command) = self.rx.recv().await {
            if matches!(command, Command::Shutdown) {
                debug!("shutdown requested");
                break;
            }
            self.handle(command);
        }
        self.stop();
        info!("sync client event loop stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Bind(request) => {
                let engine = SessionEngine::new(*request);
                let ident = engine.ident();
                self.sessions.insert(ident, engine);
                self.attach(ident);
            }
            Command::Terminate { session } => self.terminate(session),
            Command::NonsyncTransact { session } => {
                self.with_session(session, |engine, out| {
                    engine.nonsync_transact(out);
                    Disposition::Continue
                });
            }
            Command::WaitUpload { session, handler } => {
                self.with_waiting_session(session, handler, |engine, handler, out| {
                    engine.request_upload_completion(handler, out)
                });
            }
            Command::WaitDownload { session, handler } => {
                self.with_waiting_session(session, handler, |engine, handler, out| {
                    engine.request_download_completion(handler, out)
                });
            }
            Command::WaitSync { session, handler } => {
                self.with_waiting_session(session, handler, |engine, handler, out| {
                    engine.request_sync_completion(handler, out)
                });
            }
            Command::Refresh { session, token } => {
                let mut resume = false;
                self.with_session(session, |engine, out| {
                    resume = engine.refresh(token, out);
                    Disposition::Continue
                });
                if resume {
                    self.attach(session);
                }
            }
            Command::CancelReconnectDelay { session } => self.cancel_reconnect_delay(session),
            Command::NewSubscription { session, version } => {
                self.with_session(session, |engine, out| {
                    engine.on_new_subscription(version, out);
                    Disposition::Continue
                });
            }
            Command::Connection { connection, event } => {
                self.handle_connection_event(connection, event)
            }
            Command::ConnectTimeout { connection } => {
                let pending = self
                    .connections
                    .get(&connection)
                    .is_some_and(|entry| !entry.established);
                if pending {
                    warn!(connection, "connect timed out");
                    let error = SessionErrorInfo::new(
                        Status::new(ErrorCode::ConnectTimeout, "connect timed out"),
                        true,
                    );
                    self.connection_lost(connection, &error);
                }
            }
            Command::ReconnectTimer { key, generation } => {
                let Some(state) = self.endpoints.get_mut(&key) else {
                    return;
                };
                if state.generation != generation || !state.delayed {
                    return;
                }
                state.delayed = false;
                self.attach_waiting(Some(&key));
            }
            Command::ResumeTimer {
                session,
                generation,
            } => {
                let resumed = self
                    .sessions
                    .get_mut(&session)
                    .is_some_and(|engine| engine.resume_retry(Some(generation)));
                if resumed {
                    self.attach(session);
                }
            }
            Command::Shutdown => {}
        }
    }

    /// Runs `f` on a session and sends what it produced. Returns false if the
    /// session is unknown.
    fn with_session(
        &mut self,
        ident: SessionIdent,
        f: impl FnOnce(&mut SessionEngine, &mut Outbox) -> Disposition,
    ) -> bool {
        let Some(engine) = self.sessions.get_mut(&ident) else {
            debug!(session_ident = ident, "no such session");
            return false;
        };
        let mut out = Vec::new();
        let disposition = f(engine, &mut out);
        if let Some(connection) = engine.connection() {
            self.send(connection, out);
        }
        if let Disposition::Suspend(error) = disposition {
            self.suspend(ident, error);
        }
        true
    }

    fn with_waiting_session(
        &mut self,
        ident: SessionIdent,
        handler: WaitHandler,
        f: impl FnOnce(&mut SessionEngine, WaitHandler, &mut Outbox),
    ) {
        if !self.sessions.contains_key(&ident) {
            handler.call(Status::aborted());
            return;
        }
        self.with_session(ident, |engine, out| {
            f(engine, handler, out);
            Disposition::Continue
        });
    }

    fn send(&mut self, connection: ConnectionId, out: Outbox) {
        if out.is_empty() {
            return;
        }
        let Some(entry) = self.connections.get_mut(&connection) else {
            debug!(connection, dropped = out.len(), "connection gone; messages dropped");
            return;
        };
        for message in out {
            debug!(
                connection,
                session_ident = message.session_ident(),
                message = message.name(),
                "sending"
            );
            entry.connection.send(message);
        }
    }

    fn key_for(&self, engine: &SessionEngine) -> ConnectionKey {
        ConnectionKey {
            endpoint: engine.endpoint().clone(),
            dedicated: self
                .client
                .config
                .one_connection_per_session
                .then(|| engine.ident()),
        }
    }

    // Connections

    /// Puts a waiting session on its connection, opening one unless a
    /// reconnect delay is in effect.
    fn attach(&mut self, ident: SessionIdent) {
        let Some(engine) = self.sessions.get(&ident) else {
            return;
        };
        if engine.phase() != Phase::Waiting {
            return;
        }
        let key = self.key_for(engine);
        let state = self.endpoints.entry(key.clone()).or_default();

        if let Some(connection) = state.connection {
            let Some(entry) = self.connections.get_mut(&connection) else {
                return;
            };
            entry.sessions.insert(ident);
            let established = entry.established;
            let mut out = Vec::new();
            if let Some(engine) = self.sessions.get_mut(&ident) {
                engine.on_connecting(connection);
                if established {
                    engine.activate(&mut out);
                }
            }
            self.send(connection, out);
            return;
        }
        if state.delayed {
            debug!(session_ident = ident, endpoint = %key.endpoint, "waiting for reconnect delay");
            return;
        }
        self.open_connection(key);
    }

    fn attach_waiting(&mut self, key: Option<&ConnectionKey>) {
        let waiting: Vec<SessionIdent> = self
            .sessions
            .values()
            .filter(|engine| engine.phase() == Phase::Waiting)
            .filter(|engine| key.map_or(true, |k| self.key_for(engine) == *k))
            .map(SessionEngine::ident)
            .collect();
        for ident in waiting {
            self.attach(ident);
        }
    }

    fn open_connection(&mut self, key: ConnectionKey) {
        let id = self.next_connection_id;
        self.next_connection_id += 1;
        info!(connection = id, endpoint = %key.endpoint, "connecting");

        let events = ConnectionEvents::new(id, self.client.sender());
        let connection = self.client.transport.connect(&key.endpoint, events);

        let waiting: BTreeSet<SessionIdent> = self
            .sessions
            .values()
            .filter(|engine| engine.phase() == Phase::Waiting && self.key_for(engine) == key)
            .map(SessionEngine::ident)
            .collect();
        for ident in &waiting {
            if let Some(engine) = self.sessions.get_mut(ident) {
                engine.on_connecting(id);
            }
        }
        self.connections.insert(
            id,
            ConnectionEntry {
                key: key.clone(),
                connection,
                established: false,
                sessions: waiting,
            },
        );
        self.endpoints.entry(key).or_default().connection = Some(id);
        self.schedule(
            self.client.config.connect_timeout,
            Command::ConnectTimeout { connection: id },
        );
    }

    fn handle_connection_event(&mut self, connection: ConnectionId, event: ConnectionEvent) {
        if !self.connections.contains_key(&connection) {
            debug!(connection, "event for a closed connection");
            return;
        }
        match event {
            ConnectionEvent::Connected => self.connected(connection),
            ConnectionEvent::Message(message) => self.receive(connection, message),
            ConnectionEvent::Closed(status) => {
                let status = if status.is_ok() {
                    Status::new(ErrorCode::ConnectionClosed, "connection closed by peer")
                } else {
                    status
                };
                self.connection_lost(connection, &SessionErrorInfo::new(status, true));
            }
        }
    }

    fn connected(&mut self, connection: ConnectionId) {
        let Some(entry) = self.connections.get_mut(&connection) else {
            return;
        };
        if entry.established {
            return;
        }
        entry.established = true;
        info!(connection, endpoint = %entry.key.endpoint, "connected");
        if let Some(state) = self.endpoints.get_mut(&entry.key) {
            state.attempt = 0;
        }

        let sessions: Vec<SessionIdent> = entry.sessions.iter().copied().collect();
        for ident in sessions {
            let mut out = Vec::new();
            if let Some(engine) = self.sessions.get_mut(&ident) {
                engine.activate(&mut out);
            }
            self.send(connection, out);
        }
    }

    fn receive(&mut self, connection: ConnectionId, message: ServerMessage) {
        let ident = message.session_ident();
        if ident == 0 {
            match &message {
                ServerMessage::Error(error) => {
                    warn!(connection, code = ?error.error_code, message = %error.message, "connection error");
                    let info = SessionErrorInfo::from_protocol(error);
                    self.connection_lost(connection, &info);
                }
                other => warn!(connection, message = other.name(), "unexpected connection-level message"),
            }
            return;
        }
        let on_connection = self
            .connections
            .get(&connection)
            .is_some_and(|entry| entry.sessions.contains(&ident));
        if !on_connection {
            debug!(connection, session_ident = ident, "message for a session not on this connection");
            return;
        }
        self.with_session(ident, |engine, out| engine.handle_message(message, out));
    }

    fn connection_lost(&mut self, connection: ConnectionId, error: &SessionErrorInfo) {
        let Some(mut entry) = self.connections.remove(&connection) else {
            return;
        };
        entry.connection.close();
        warn!(connection, endpoint = %entry.key.endpoint, error = %error.status, "connection lost");

        for ident in &entry.sessions {
            if let Some(engine) = self.sessions.get_mut(ident) {
                engine.on_connection_lost(error);
            }
        }

        let state = self.endpoints.entry(entry.key.clone()).or_default();
        if state.connection == Some(connection) {
            state.connection = None;
        }
        state.attempt = state.attempt.saturating_add(1);
        state.generation += 1;
        state.delayed = true;
        let (attempt, generation) = (state.attempt, state.generation);

        match self.client.config.reconnect_mode {
            ReconnectMode::Normal => {
                let delay = self.client.config.reconnect_backoff.delay_for_attempt(attempt);
                debug!(endpoint = %entry.key.endpoint, attempt, ?delay, "reconnect scheduled");
                self.schedule(
                    delay,
                    Command::ReconnectTimer {
                        key: entry.key,
                        generation,
                    },
                );
            }
            ReconnectMode::Testing => {
                debug!(endpoint = %entry.key.endpoint, "automatic reconnect disabled");
            }
        }
    }

    /// Removes a session from a connection, closing the connection when it
    /// has no sessions left.
    fn release(&mut self, connection: ConnectionId, ident: SessionIdent) {
        let Some(entry) = self.connections.get_mut(&connection) else {
            return;
        };
        entry.sessions.remove(&ident);
        if !entry.sessions.is_empty() {
            return;
        }
        if let Some(mut entry) = self.connections.remove(&connection) {
            debug!(connection, "closing idle connection");
            entry.connection.close();
            if let Some(state) = self.endpoints.get_mut(&entry.key) {
                if state.connection == Some(connection) {
                    state.connection = None;
                }
            }
        }
    }

    // Sessions

    fn suspend(&mut self, ident: SessionIdent, error: SessionErrorInfo) {
        let Some(engine) = self.sessions.get_mut(&ident) else {
            return;
        };
        let connection = engine.connection();
        let bound = engine.is_bound_on_server();
        let retry = engine.suspend(&error);
        if let Some(connection) = connection {
            if bound {
                self.send(
                    connection,
                    vec![ClientMessage::Unbind {
                        session_ident: ident,
                    }],
                );
            }
            self.release(connection, ident);
        }
        if let Some((generation, attempt)) = retry {
            if self.client.config.reconnect_mode == ReconnectMode::Normal {
                let delay = self.client.config.reconnect_backoff.delay_for_attempt(attempt);
                self.schedule(
                    delay,
                    Command::ResumeTimer {
                        session: ident,
                        generation,
                    },
                );
            }
        }
    }

    fn terminate(&mut self, ident: SessionIdent) {
        if let Some(engine) = self.sessions.remove(&ident) {
            if let Some(connection) = engine.connection() {
                if engine.is_bound_on_server() {
                    self.send(
                        connection,
                        vec![ClientMessage::Unbind {
                            session_ident: ident,
                        }],
                    );
                }
                self.release(connection, ident);
            }
            engine.terminate();
        }
        self.client.termination_completed();
    }

    fn cancel_reconnect_delay(&mut self, session: Option<SessionIdent>) {
        let key = match session {
            Some(ident) => match self.sessions.get(&ident) {
                Some(engine) => Some(self.key_for(engine)),
                None => return,
            },
            None => None,
        };
        debug!(?session, "cancelling reconnect delay");
        for (k, state) in self.endpoints.iter_mut() {
            if key.as_ref().map_or(true, |key| key == k) {
                state.attempt = 0;
                state.generation += 1;
                state.delayed = false;
            }
        }
        for (ident, engine) in self.sessions.iter_mut() {
            if session.map_or(true, |s| s == *ident) {
                engine.resume_retry(None);
            }
        }
        self.attach_waiting(key.as_ref());
    }

    // Timers and shutdown

    fn schedule(&self, delay: Duration, command: Command) {
        let tx = self.client.sender();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Fails only once the loop has stopped.
            let _ = tx.send(command);
        });
    }

    fn stop(&mut self) {
        self.rx.close();
        for (_, mut entry) in self.connections.drain() {
            entry.connection.close();
        }
        for (_, engine) in std::mem::take(&mut self.sessions) {
            engine.terminate();
        }
        while let Ok(command) = self.rx.try_recv() {
            command.abandon(&self.client);
        }
    }
}
