//! Application-facing sync sessions.
//!
//! A [`Session`] synchronizes one local database with one server-side file.
//! It is configured on the application thread (callbacks, URL), then bound,
//! after which all protocol work happens on the client's event loop. The
//! thread-safe operations are available through a cloneable
//! [`SessionHandle`].

use crate::applier::DatabaseApplier;
use crate::client::{Client, ClientShared};
use crate::config::SessionConfig;
use crate::endpoint::{decompose_server_url, validate_virtual_path, ServerEndpoint};
use crate::engine::{BindRequest, WaitHandler};
use crate::error::{LogicError, SyncError, SyncResult};
use crate::event_loop::Command;
use crate::functional::UniqueFunction;
use crate::future::make_promise_future;
use crate::status::{ErrorCode, Status};
use crate::subscriptions::SubscriptionStore;
use flexsync_protocol::{ErrorMessage, ProtocolErrorCode, ServerRequestsAction};
use flexsync_storage::Database;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Connection state as seen by one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected.
    Disconnected,
    /// Waiting for the connection to be established.
    Connecting,
    /// Connected and bound.
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        f.write_str(name)
    }
}

/// Why a session lost its connection or stopped.
#[derive(Debug, Clone)]
pub struct SessionErrorInfo {
    /// The error.
    pub status: Status,
    /// Server error code, for errors reported by the server.
    pub protocol_error: Option<ProtocolErrorCode>,
    /// Whether the session will retry on its own.
    pub try_again: bool,
    /// What the server asks the client to do.
    pub server_requests_action: ServerRequestsAction,
}

impl SessionErrorInfo {
    /// Creates an error raised on the client side.
    pub fn new(status: Status, try_again: bool) -> Self {
        Self {
            status,
            protocol_error: None,
            try_again,
            server_requests_action: ServerRequestsAction::NoAction,
        }
    }

    /// Converts an ERROR message from the server.
    pub fn from_protocol(error: &ErrorMessage) -> Self {
        Self {
            status: Status::new(ErrorCode::from(error.error_code), error.message.clone()),
            protocol_error: Some(error.error_code),
            try_again: error.try_again,
            server_requests_action: error.action,
        }
    }

    /// Returns true if the session stays stopped until the application acts.
    pub fn is_fatal(&self) -> bool {
        !self.try_again
    }

    /// Returns true if the access token expired; [`SessionHandle::refresh`]
    /// resumes the session.
    pub fn is_token_expired(&self) -> bool {
        self.protocol_error == Some(ProtocolErrorCode::TokenExpired)
    }
}

impl fmt::Display for SessionErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.status)?;
        if self.try_again {
            f.write_str(" (will retry)")?;
        }
        Ok(())
    }
}

/// Transfer progress of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressReport {
    /// Bytes of server changesets integrated so far.
    pub downloaded_bytes: u64,
    /// Bytes the server still has to send, as last reported.
    pub downloadable_bytes: u64,
    /// Bytes of local changesets acknowledged by the server.
    pub uploaded_bytes: u64,
    /// Acknowledged plus not yet acknowledged bytes.
    pub uploadable_bytes: u64,
    /// Local version produced by the latest DOWNLOAD (0 before any).
    pub progress_version: u64,
    /// Latest local version when the report was made.
    pub snapshot_version: u64,
}

/// Called with every connection state change.
pub type ConnectionStateListener =
    Box<dyn FnMut(ConnectionState, Option<&SessionErrorInfo>) + Send>;

/// Called when transfer progress changes.
pub type ProgressHandler = Box<dyn FnMut(&ProgressReport) + Send>;

/// Called with the old and new local version after server changesets were
/// integrated.
pub type SyncTransactCallback = Box<dyn FnMut(u64, u64) + Send>;

#[derive(Default)]
pub(crate) struct SessionCallbacks {
    pub(crate) connection_state: Option<ConnectionStateListener>,
    pub(crate) progress: Option<ProgressHandler>,
    pub(crate) sync_transact: Option<SyncTransactCallback>,
}

/// State shared between a session's owner, its handles and the event loop.
pub(crate) struct SessionShared {
    pub(crate) id: u64,
    watermark: AtomicU64,
    bound: AtomicBool,
}

impl SessionShared {
    pub(crate) fn new(id: u64) -> Self {
        Self {
            id,
            watermark: AtomicU64::new(0),
            bound: AtomicBool::new(false),
        }
    }

    pub(crate) fn watermark(&self) -> u64 {
        self.watermark.load(Ordering::Acquire)
    }

    pub(crate) fn raise_watermark(&self, version: u64) {
        self.watermark.fetch_max(version, Ordering::AcqRel);
    }
}

/// A synchronization session for one database.
///
/// Dropping the session detaches it: outstanding completion handlers are
/// called with [`ErrorCode::OperationAborted`] and no callback runs
/// afterwards.
pub struct Session {
    handle: SessionHandle,
    db: Database,
    store: Option<SubscriptionStore>,
    config: SessionConfig,
    endpoint: Option<ServerEndpoint>,
    callbacks: SessionCallbacks,
    detached: bool,
}

impl Session {
    /// Creates a partition-based session for `db`.
    pub fn new(client: &Client, db: Database, config: SessionConfig) -> Self {
        Self::create(client, db, None, config)
    }

    /// Creates a flexible sync session. Data is selected by the subscription
    /// sets in `store`.
    pub fn with_subscriptions(
        client: &Client,
        store: SubscriptionStore,
        config: SessionConfig,
    ) -> Self {
        let db = store.database().clone();
        Self::create(client, db, Some(store), config)
    }

    fn create(
        client: &Client,
        db: Database,
        store: Option<SubscriptionStore>,
        config: SessionConfig,
    ) -> Self {
        let shared = client.shared();
        let handle = SessionHandle {
            session: Arc::new(SessionShared::new(shared.next_session_ident())),
            client: Arc::clone(shared),
        };
        Self {
            handle,
            db,
            store,
            config,
            endpoint: None,
            callbacks: SessionCallbacks::default(),
            detached: false,
        }
    }

    /// Session ident used in protocol messages.
    pub fn ident(&self) -> u64 {
        self.handle.session.id
    }

    /// The configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// A thread-safe handle for the session's operations.
    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    fn check_configurable(&self) -> SyncResult<()> {
        if self.detached {
            return Err(LogicError::Detached.into());
        }
        if self.handle.is_bound() {
            return Err(LogicError::AlreadyBound.into());
        }
        Ok(())
    }

    /// Installs the connection state listener. Only allowed before binding.
    ///
    /// The initial `Disconnected` state is not reported, and every report of
    /// `Disconnected` carries the error that caused it.
    pub fn set_connection_state_change_listener(
        &mut self,
        listener: impl FnMut(ConnectionState, Option<&SessionErrorInfo>) + Send + 'static,
    ) -> SyncResult<()> {
        self.check_configurable()?;
        self.callbacks.connection_state = Some(Box::new(listener));
        Ok(())
    }

    /// Installs the progress handler. Only allowed before binding.
    pub fn set_progress_handler(
        &mut self,
        handler: impl FnMut(&ProgressReport) + Send + 'static,
    ) -> SyncResult<()> {
        self.check_configurable()?;
        self.callbacks.progress = Some(Box::new(handler));
        Ok(())
    }

    /// Installs the callback run after server changesets were integrated.
    /// Only allowed before binding.
    pub fn set_sync_transact_callback(
        &mut self,
        callback: impl FnMut(u64, u64) + Send + 'static,
    ) -> SyncResult<()> {
        self.check_configurable()?;
        self.callbacks.sync_transact = Some(Box::new(callback));
        Ok(())
    }

    /// Starts synchronizing using the server named in the configuration.
    pub fn bind(&mut self) -> SyncResult<()> {
        self.check_configurable()?;
        let endpoint = match &self.endpoint {
            Some(endpoint) => endpoint.clone(),
            None => {
                if self.config.server_address.is_empty() {
                    return Err(SyncError::BadServerUrl("no server address".into()));
                }
                ServerEndpoint {
                    envelope: self.config.protocol_envelope,
                    address: self.config.server_address.clone(),
                    port: self.config.effective_port(),
                }
            }
        };
        validate_virtual_path(&self.config.realm_identifier).map_err(LogicError::InvalidConfig)?;

        self.handle.session.bound.store(true, Ordering::Release);
        self.handle.client.post(Command::Bind(Box::new(BindRequest {
            shared: Arc::clone(&self.handle.session),
            applier: DatabaseApplier::new(self.db.clone()),
            store: self.store.clone(),
            config: self.config.clone(),
            endpoint,
            callbacks: std::mem::take(&mut self.callbacks),
        })));
        Ok(())
    }

    /// Starts synchronizing with the server at `server_url`, whose path names
    /// the server-side file.
    pub fn bind_with_url(
        &mut self,
        server_url: &str,
        signed_user_token: impl Into<String>,
    ) -> SyncResult<()> {
        self.check_configurable()?;
        let decomposed = decompose_server_url(server_url)
            .ok_or_else(|| SyncError::BadServerUrl(server_url.to_string()))?;
        self.config.server_address = decomposed.endpoint.address.clone();
        self.config.server_port = decomposed.endpoint.port;
        self.config.protocol_envelope = decomposed.endpoint.envelope;
        self.config.realm_identifier = decomposed.path;
        self.config.signed_user_token = signed_user_token.into();
        self.endpoint = Some(decomposed.endpoint);
        self.bind()
    }

    /// Stops the session. Idempotent.
    ///
    /// Pending completion handlers are aborted on the event loop; use
    /// [`Client::wait_for_session_terminations_or_client_stopped`] to wait
    /// for that.
    pub fn detach(&mut self) {
        if self.detached {
            return;
        }
        self.detached = true;
        if self.handle.is_bound() {
            let client = &self.handle.client;
            client.termination_initiated();
            client.post(Command::Terminate {
                session: self.handle.session.id,
            });
        }
    }

    /// See [`SessionHandle::nonsync_transact_notify`].
    pub fn nonsync_transact_notify(&self, version: u64) -> SyncResult<()> {
        self.handle.nonsync_transact_notify(version)
    }

    /// See [`SessionHandle::async_wait_for_upload_completion`].
    pub fn async_wait_for_upload_completion(
        &self,
        handler: impl FnOnce(Status) + Send + 'static,
    ) -> SyncResult<()> {
        self.handle.async_wait_for_upload_completion(handler)
    }

    /// See [`SessionHandle::async_wait_for_download_completion`].
    pub fn async_wait_for_download_completion(
        &self,
        handler: impl FnOnce(Status) + Send + 'static,
    ) -> SyncResult<()> {
        self.handle.async_wait_for_download_completion(handler)
    }

    /// See [`SessionHandle::async_wait_for_sync_completion`].
    pub fn async_wait_for_sync_completion(
        &self,
        handler: impl FnOnce(Status) + Send + 'static,
    ) -> SyncResult<()> {
        self.handle.async_wait_for_sync_completion(handler)
    }

    /// See [`SessionHandle::wait_for_upload_complete_or_client_stopped`].
    pub fn wait_for_upload_complete_or_client_stopped(&self) -> SyncResult<bool> {
        self.handle.wait_for_upload_complete_or_client_stopped()
    }

    /// See [`SessionHandle::wait_for_download_complete_or_client_stopped`].
    pub fn wait_for_download_complete_or_client_stopped(&self) -> SyncResult<bool> {
        self.handle.wait_for_download_complete_or_client_stopped()
    }

    /// See [`SessionHandle::refresh`].
    pub fn refresh(&self, signed_user_token: impl Into<String>) -> SyncResult<()> {
        self.handle.refresh(signed_user_token)
    }

    /// See [`SessionHandle::cancel_reconnect_delay`].
    pub fn cancel_reconnect_delay(&self) -> SyncResult<()> {
        self.handle.cancel_reconnect_delay()
    }

    /// See [`SessionHandle::on_new_flx_sync_subscription`].
    pub fn on_new_flx_sync_subscription(&self, version: i64) -> SyncResult<()> {
        self.handle.on_new_flx_sync_subscription(version)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.detach();
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("ident", &self.ident())
            .field("path", &self.config.realm_identifier)
            .field("bound", &self.handle.is_bound())
            .field("detached", &self.detached)
            .finish()
    }
}

/// Thread-safe operations on a bound session.
///
/// Every operation fails with [`LogicError::NotBound`] before the session is
/// bound. Once the session is detached, waits complete with
/// [`ErrorCode::OperationAborted`] and other operations do nothing.
#[derive(Clone)]
pub struct SessionHandle {
    session: Arc<SessionShared>,
    client: Arc<ClientShared>,
}

impl SessionHandle {
    fn is_bound(&self) -> bool {
        self.session.bound.load(Ordering::Acquire)
    }

    fn bound_ident(&self) -> SyncResult<u64> {
        if self.is_bound() {
            Ok(self.session.id)
        } else {
            Err(LogicError::NotBound.into())
        }
    }

    /// Tells the session that a local write produced `version`; changes up
    /// to it become eligible for upload.
    pub fn nonsync_transact_notify(&self, version: u64) -> SyncResult<()> {
        let session = self.bound_ident()?;
        self.session.raise_watermark(version);
        self.client.post(Command::NonsyncTransact { session });
        Ok(())
    }

    /// Calls `handler` once every local change made before this call has
    /// been acknowledged by the server.
    pub fn async_wait_for_upload_completion(
        &self,
        handler: impl FnOnce(Status) + Send + 'static,
    ) -> SyncResult<()> {
        let session = self.bound_ident()?;
        self.client.post(Command::WaitUpload {
            session,
            handler: UniqueFunction::new(handler),
        });
        Ok(())
    }

    /// Calls `handler` once everything the server had when it received this
    /// request has been downloaded and integrated.
    pub fn async_wait_for_download_completion(
        &self,
        handler: impl FnOnce(Status) + Send + 'static,
    ) -> SyncResult<()> {
        let session = self.bound_ident()?;
        self.client.post(Command::WaitDownload {
            session,
            handler: UniqueFunction::new(handler),
        });
        Ok(())
    }

    /// Upload completion followed by download completion.
    pub fn async_wait_for_sync_completion(
        &self,
        handler: impl FnOnce(Status) + Send + 'static,
    ) -> SyncResult<()> {
        let session = self.bound_ident()?;
        self.client.post(Command::WaitSync {
            session,
            handler: UniqueFunction::new(handler),
        });
        Ok(())
    }

    /// Blocks until upload completes. Returns false if the session was
    /// detached or the client stopped first.
    pub fn wait_for_upload_complete_or_client_stopped(&self) -> SyncResult<bool> {
        self.block_on(|handle, handler| {
            handle.async_wait_for_upload_completion(move |status| handler.call(status))
        })
    }

    /// Blocks until download completes. Returns false if the session was
    /// detached or the client stopped first.
    pub fn wait_for_download_complete_or_client_stopped(&self) -> SyncResult<bool> {
        self.block_on(|handle, handler| {
            handle.async_wait_for_download_completion(move |status| handler.call(status))
        })
    }

    fn block_on(
        &self,
        start: impl FnOnce(&Self, WaitHandler) -> SyncResult<()>,
    ) -> SyncResult<bool> {
        let (promise, future) = make_promise_future::<()>();
        start(
            self,
            UniqueFunction::new(move |status: Status| {
                if status.is_ok() {
                    promise.emplace_value(());
                } else {
                    promise.set_error(status);
                }
            }),
        )?;
        Ok(future.get().is_ok())
    }

    /// Installs a new access token, resuming the session if it stopped
    /// because the old one expired.
    pub fn refresh(&self, signed_user_token: impl Into<String>) -> SyncResult<()> {
        let session = self.bound_ident()?;
        self.client.post(Command::Refresh {
            session,
            token: signed_user_token.into(),
        });
        Ok(())
    }

    /// Skips the reconnect delay for this session's server.
    pub fn cancel_reconnect_delay(&self) -> SyncResult<()> {
        let session = self.bound_ident()?;
        self.client.post(Command::CancelReconnectDelay {
            session: Some(session),
        });
        Ok(())
    }

    /// Tells the session that subscription set `version` was committed.
    pub fn on_new_flx_sync_subscription(&self, version: i64) -> SyncResult<()> {
        let session = self.bound_ident()?;
        self.client
            .post(Command::NewSubscription { session, version });
        Ok(())
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("ident", &self.session.id)
            .field("bound", &self.is_bound())
            .finish()
    }
}
